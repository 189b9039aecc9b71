use std::time::Duration;

/// Runtime settings for the ledger store and service.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// SQLite database file path
    pub database_path: String,
    pub max_connections: u32,
    /// How long a connection waits on the SQLite write lock before giving up
    pub busy_timeout: Duration,
    /// Attempts per mutation before a transient failure is surfaced
    pub max_attempts: u32,
    /// Backoff after the first failed attempt; grows linearly per attempt
    pub retry_backoff: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: "balance-builder.db".to_string(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

impl LedgerConfig {
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Clamp a requested page size to the configured bounds.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }
}
