use std::path::{Path, PathBuf};

pub use clap::{Parser, Subcommand};

/// SHIP history indexer
/// Streams blocks from state history nodes through the queue fabric into storage
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Opts {
    /// Path to the config file, `config.toml` or env-only configuration when omitted
    #[clap(long, env = "SHIP_INDEXER_CONFIG")]
    pub config: Option<String>,
    /// Where to start; `indexer.start_on` and the storage decide when omitted
    #[clap(subcommand)]
    pub start_options: Option<StartOptions>,
}

#[allow(clippy::enum_variant_names)]
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum StartOptions {
    FromBlock {
        height: u32,
    },
    FromInterruption {
        /// Fallback start block height if interruption is not found
        height: Option<u32>,
    },
    FromLatest,
}

impl Opts {
    pub async fn read_configuration(&self) -> anyhow::Result<configuration::Config> {
        match &self.config {
            Some(path) => configuration::read_configuration_from_file(path).await,
            None => configuration::read_configuration().await,
        }
    }
}

/// Folds the command line start option into the indexer settings.
pub(crate) fn apply_start_options(
    indexer_config: &mut configuration::IndexerConfig,
    start_options: Option<&StartOptions>,
    saved_last_block: Option<u32>,
) {
    match start_options {
        Some(StartOptions::FromBlock { height }) => {
            indexer_config.start_on = u64::from(*height);
            indexer_config.live_only_mode = false;
        }
        Some(StartOptions::FromInterruption { height }) => {
            indexer_config.rewrite = false;
            indexer_config.start_on = saved_last_block
                .or(*height)
                .map(u64::from)
                .unwrap_or_default();
        }
        Some(StartOptions::FromLatest) => {
            indexer_config.live_only_mode = true;
            indexer_config.live_reader = true;
        }
        None => {}
    }
}

pub(crate) fn last_block_file(data_dir: &str, chain: &str) -> PathBuf {
    Path::new(data_dir).join(format!(".{}_lastblock.txt", chain))
}

pub(crate) fn read_last_block(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    match content.trim().parse::<u32>() {
        Ok(block_num) if block_num > 0 => Some(block_num),
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(
                target: crate::INDEXER,
                "Ignoring unreadable last block file {:?}: {}",
                path,
                err
            );
            None
        }
    }
}

pub(crate) fn write_last_block(path: &Path, block_num: u32) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, block_num.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer_config() -> configuration::IndexerConfig {
        configuration::parse_configuration(
            r#"
            [general]
            chain = "wax"
            chain_api = "http://127.0.0.1:8888"

            [indexer]
            start_on = 100
            rewrite = true
            "#,
        )
        .unwrap()
        .indexer
    }

    #[test]
    fn from_block_overrides_start_on() {
        let mut config = indexer_config();
        apply_start_options(&mut config, Some(&StartOptions::FromBlock { height: 42 }), None);
        assert_eq!(config.start_on, 42);
        assert!(!config.live_only_mode);
    }

    #[test]
    fn from_interruption_prefers_the_saved_block() {
        let mut config = indexer_config();
        let options = StartOptions::FromInterruption { height: Some(7) };
        apply_start_options(&mut config, Some(&options), Some(900));
        assert_eq!(config.start_on, 900);
        assert!(!config.rewrite);

        let mut config = indexer_config();
        apply_start_options(&mut config, Some(&options), None);
        assert_eq!(config.start_on, 7);
    }

    #[test]
    fn from_latest_only_reads_live() {
        let mut config = indexer_config();
        apply_start_options(&mut config, Some(&StartOptions::FromLatest), None);
        assert!(config.live_only_mode);
        assert!(config.live_reader);
    }

    #[test]
    fn last_block_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("ship-indexer-{}", std::process::id()));
        let path = last_block_file(dir.to_str().unwrap(), "wax");
        assert!(path.ends_with(".wax_lastblock.txt"));
        assert_eq!(read_last_block(&path), None);
        write_last_block(&path, 1234).unwrap();
        assert_eq!(read_last_block(&path), Some(1234));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
