//! Configuration loading from the process environment.

const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Stock service settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// How many times a whole allocation is re-run after an optimistic
    /// concurrency conflict before giving up with `PersistenceFailure`.
    pub max_conflict_retries: u32,
    /// Postgres connection string, when a persistent store is used.
    pub database_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            database_url: None,
        }
    }
}

impl ServiceConfig {
    /// Read `LOTKEEPER_MAX_CONFLICT_RETRIES` and `DATABASE_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_conflict_retries = match lookup("LOTKEEPER_MAX_CONFLICT_RETRIES") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    value = %raw,
                    "LOTKEEPER_MAX_CONFLICT_RETRIES is not a number; using {DEFAULT_MAX_CONFLICT_RETRIES}"
                );
                DEFAULT_MAX_CONFLICT_RETRIES
            }),
            None => DEFAULT_MAX_CONFLICT_RETRIES,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Self {
            max_conflict_retries,
            database_url,
        }
    }
}
