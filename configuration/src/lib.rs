use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod configs;
mod default_env_configs;

pub use crate::configs::broker::{BrokerBackend, BrokerConfig};
pub use crate::configs::filters::FiltersConfig;
pub use crate::configs::general::{GeneralConfig, ShipEndpointConfig};
pub use crate::configs::indexer::{FeaturesConfig, IndexerConfig};
pub use crate::configs::scaling::{PrefetchConfig, QueueLimits, ScalingConfig};
pub use crate::configs::storage::{StorageBackend, StorageConfig};
pub use crate::configs::Config;

/// Env var pointing at the config file.
pub const CONFIG_PATH_ENV: &str = "SHIP_INDEXER_CONFIG";

pub fn parse_configuration(content: &str) -> anyhow::Result<Config> {
    let common_config = toml::from_str::<configs::CommonConfig>(content)?;
    Config::try_from(common_config)
}

async fn read_toml_file(path_file: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path_file) {
        Ok(content) => match parse_configuration(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                anyhow::bail!(
                    "Unable to load data from: {:?}.\n Error: {}",
                    path_file.to_str(),
                    err
                );
            }
        },
        Err(err) => {
            anyhow::bail!(
                "Could not read file: {:?}.\n Error: {}",
                path_file.to_str(),
                err
            );
        }
    }
}

pub async fn read_configuration_from_file(path_file: &str) -> anyhow::Result<Config> {
    let path_file = Path::new(path_file);
    read_toml_file(path_file).await
}

/// Loads `config.toml` (or the file named by `SHIP_INDEXER_CONFIG`), falling
/// back to a configuration made of environment variables only.
pub async fn read_configuration() -> anyhow::Result<Config> {
    dotenv::dotenv().ok();
    let path_file = dotenv::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let path_file = Path::new(&path_file);
    if path_file.exists() {
        read_toml_file(path_file).await
    } else {
        parse_configuration(default_env_configs::DEFAULT_CONFIG)
    }
}

pub async fn init_tracing(service_name: &str) -> anyhow::Result<()> {
    let mut env_filter = tracing_subscriber::EnvFilter::new(format!("{}=info", service_name));

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            for directive in rust_log.split(',').filter_map(|s| match s.parse() {
                Ok(directive) => Some(directive),
                Err(err) => {
                    eprintln!("Ignoring directive `{}`: {}", s, err);
                    None
                }
            }) {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    let json_output = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or_default();
    let (compact_layer, json_layer) = if json_output {
        (None, Some(tracing_subscriber::fmt::Layer::default().json()))
    } else {
        (
            Some(tracing_subscriber::fmt::Layer::default().compact()),
            None,
        )
    };

    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer);

    #[cfg(feature = "tracing-instrumentation")]
    {
        opentelemetry::global::shutdown_tracer_provider();
        opentelemetry::global::set_text_map_propagator(
            opentelemetry::sdk::propagation::TraceContextPropagator::new(),
        );
        let tracer = opentelemetry_jaeger::new_pipeline()
            .with_service_name(service_name)
            .install_simple()?;
        subscriber
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    }

    #[cfg(not(feature = "tracing-instrumentation"))]
    subscriber.try_init()?;

    Ok(())
}
