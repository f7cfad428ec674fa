pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATABASE: &str = "wagerbook.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Shortest accepted webhook bearer token.
pub const MIN_WEBHOOK_TOKEN_LEN: usize = 16;
