use std::collections::HashSet;

/// Action and delta rules in `chain::code::name` form, `*` standing for any
/// code or any name. Blacklists win over whitelists and an empty whitelist
/// lets everything through.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    chain: String,
    action_blacklist: HashSet<String>,
    action_whitelist: HashSet<String>,
    delta_blacklist: HashSet<String>,
    delta_whitelist: HashSet<String>,
    root_only: bool,
}

impl Filters {
    pub fn new(chain: &str, eosio_alias: &str, config: &configuration::FiltersConfig) -> Self {
        let normalize = |rules: &[String]| -> HashSet<String> {
            rules
                .iter()
                .map(|rule| normalize_rule(chain, rule))
                .collect()
        };
        let mut action_blacklist = normalize(&config.action_blacklist);
        // the null account only carries nonces
        action_blacklist.insert(format!("{}::{}.null::*", chain, eosio_alias));
        Self {
            chain: chain.to_string(),
            action_blacklist,
            action_whitelist: normalize(&config.action_whitelist),
            delta_blacklist: normalize(&config.delta_blacklist),
            delta_whitelist: normalize(&config.delta_whitelist),
            root_only: config.root_only(),
        }
    }

    pub fn root_only(&self) -> bool {
        self.root_only
    }

    pub fn has_action_whitelist(&self) -> bool {
        !self.action_whitelist.is_empty()
    }

    pub fn has_whitelist(&self) -> bool {
        !self.action_whitelist.is_empty() || !self.delta_whitelist.is_empty()
    }

    pub fn action_blacklisted(&self, code: &str, action: &str) -> bool {
        self.matches(&self.action_blacklist, code, action)
    }

    pub fn action_whitelisted(&self, code: &str, action: &str) -> bool {
        self.matches(&self.action_whitelist, code, action)
    }

    pub fn action_allowed(&self, code: &str, action: &str) -> bool {
        if self.action_blacklisted(code, action) {
            return false;
        }
        self.action_whitelist.is_empty() || self.action_whitelisted(code, action)
    }

    pub fn delta_allowed(&self, code: &str, table: &str) -> bool {
        if self.matches(&self.delta_blacklist, code, table) {
            return false;
        }
        self.delta_whitelist.is_empty() || self.matches(&self.delta_whitelist, code, table)
    }

    fn matches(&self, rules: &HashSet<String>, code: &str, name: &str) -> bool {
        if rules.is_empty() {
            return false;
        }
        rules.contains(&format!("{}::{}::*", self.chain, code))
            || rules.contains(&format!("{}::*::{}", self.chain, name))
            || rules.contains(&format!("{}::{}::{}", self.chain, code, name))
    }
}

/// Rules written as `code::name` apply to the configured chain.
fn normalize_rule(chain: &str, rule: &str) -> String {
    let rule = rule.trim();
    if rule.split("::").count() == 2 {
        format!("{}::{}", chain, rule)
    } else {
        rule.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(
        action_blacklist: &[&str],
        action_whitelist: &[&str],
        delta_blacklist: &[&str],
        delta_whitelist: &[&str],
    ) -> Filters {
        let owned = |rules: &[&str]| rules.iter().map(|rule| rule.to_string()).collect();
        Filters::new(
            "wax",
            "eosio",
            &configuration::FiltersConfig {
                action_blacklist: owned(action_blacklist),
                action_whitelist: owned(action_whitelist),
                delta_blacklist: owned(delta_blacklist),
                delta_whitelist: owned(delta_whitelist),
                root_only: None,
            },
        )
    }

    #[test]
    fn blacklist_beats_whitelist() {
        let filters = filters(
            &["wax::eosio.token::transfer"],
            &["wax::eosio.token::*"],
            &[],
            &[],
        );
        assert!(!filters.action_allowed("eosio.token", "transfer"));
        assert!(filters.action_allowed("eosio.token", "issue"));
        assert!(!filters.action_allowed("atomicassets", "transfer"));
    }

    #[test]
    fn all_three_rule_forms_match() {
        let filters = filters(
            &[],
            &["wax::alice::*", "wax::*::vote", "wax::bob::claim"],
            &[],
            &[],
        );
        assert!(filters.action_allowed("alice", "anything"));
        assert!(filters.action_allowed("carol", "vote"));
        assert!(filters.action_allowed("bob", "claim"));
        assert!(!filters.action_allowed("bob", "other"));
    }

    #[test]
    fn null_account_is_always_denied() {
        let filters = filters(&[], &[], &[], &[]);
        assert!(!filters.action_allowed("eosio.null", "nonce"));
        assert!(filters.action_allowed("eosio", "onblock"));
    }

    #[test]
    fn rules_for_other_chains_never_match() {
        let filters = filters(&["eos::eosio::onblock"], &[], &[], &[]);
        assert!(filters.action_allowed("eosio", "onblock"));
    }

    #[test]
    fn short_rules_use_the_configured_chain() {
        let filters = filters(&[], &[], &["eosio::*"], &[]);
        assert!(!filters.delta_allowed("eosio", "voters"));
        assert!(filters.delta_allowed("eosio.token", "accounts"));
    }

    #[test]
    fn delta_whitelist_restricts_tables() {
        let filters = filters(&[], &[], &[], &["wax::*::accounts"]);
        assert!(filters.delta_allowed("eosio.token", "accounts"));
        assert!(!filters.delta_allowed("eosio", "voters"));
        assert!(filters.has_whitelist());
        assert!(!filters.has_action_whitelist());
    }
}
