//! Service configuration.

use tracing::warn;

use creditunion_ledger::{AssetType, DEFAULT_LOAN_TERM_DAYS};

pub const ENV_LOAN_TERM_DAYS: &str = "CREDITUNION_LOAN_TERM_DAYS";
pub const ENV_ASSET_TYPE: &str = "CREDITUNION_ASSET_TYPE";
pub const ENV_MAX_CONFLICT_RETRIES: &str = "CREDITUNION_MAX_CONFLICT_RETRIES";

/// Longest accepted loan term (100 years).
pub const MAX_LOAN_TERM_DAYS: u32 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Days from the latest vouch until a loan falls due.
    pub loan_term_days: u32,
    /// Asset accepted by unions created through this service.
    pub asset: AssetType,
    /// How often a transaction is re-run after losing an optimistic
    /// concurrency race on the event store.
    pub max_conflict_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            loan_term_days: DEFAULT_LOAN_TERM_DAYS,
            asset: AssetType::new("CU"),
            max_conflict_retries: 3,
        }
    }
}

impl ServiceConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_LOAN_TERM_DAYS) {
            match raw.trim().parse::<u32>() {
                Ok(days) if (1..=MAX_LOAN_TERM_DAYS).contains(&days) => config.loan_term_days = days,
                _ => warn!(key = ENV_LOAN_TERM_DAYS, value = %raw, "ignoring invalid loan term"),
            }
        }

        if let Some(raw) = lookup(ENV_ASSET_TYPE) {
            let code = raw.trim();
            if code.is_empty() {
                warn!(key = ENV_ASSET_TYPE, "ignoring empty asset type");
            } else {
                config.asset = AssetType::new(code);
            }
        }

        if let Some(raw) = lookup(ENV_MAX_CONFLICT_RETRIES) {
            match raw.trim().parse::<u32>() {
                Ok(n) => config.max_conflict_retries = n,
                Err(_) => warn!(key = ENV_MAX_CONFLICT_RETRIES, value = %raw, "ignoring invalid retry count"),
            }
        }

        config
    }
}
