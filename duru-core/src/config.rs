//! Core configuration constants
//!
//! Central location for key sizes, KDF defaults, retry limits and
//! validation boundaries used throughout the core.

// ===== Key Material =====

/// Account master key length in bytes (AES-256)
pub const KEY_SIZE: usize = 32;
/// Nonce length for AES-GCM in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;
/// Per-account KDF salt length in bytes (128 bits)
pub const SALT_SIZE: usize = 16;

/// Version of the wrapped key record layout
pub const WRAPPED_KEY_VERSION: u32 = 1;

// ===== Encryption Schemes =====

/// Content encrypted under the pre-AMK per-device key
pub const SCHEME_LEGACY_DEVICE: u8 = 1;
/// Content encrypted under the account master key
pub const SCHEME_ACCOUNT_KEY: u8 = 2;

// ===== Argon2id Defaults =====

/// Memory cost in KiB (64 MiB)
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 65_536;
/// Iterations
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;
/// Lanes
pub const DEFAULT_KDF_PARALLELISM: u32 = 1;

/// Lowest memory cost accepted from settings (8 MiB)
pub const MIN_KDF_MEMORY_KIB: u32 = 8_192;
/// Highest memory cost accepted from settings (1 GiB)
pub const MAX_KDF_MEMORY_KIB: u32 = 1_048_576;

// ===== Sync Limits =====

/// Outbox entries drained per push batch
pub const DEFAULT_PUSH_BATCH_SIZE: u32 = 100;
pub const MIN_PUSH_BATCH_SIZE: u32 = 1;
pub const MAX_PUSH_BATCH_SIZE: u32 = 1_000;

/// Push attempts after stale-cursor rejections before surfacing a conflict
pub const DEFAULT_MAX_PUSH_ATTEMPTS: u32 = 3;
pub const MAX_PUSH_ATTEMPTS: u32 = 10;

/// Retries of a transient network failure within one cycle
pub const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 4;
pub const MAX_TRANSIENT_RETRIES: u32 = 10;

/// First backoff delay in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
/// Ceiling for a single backoff delay in milliseconds
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Timeout applied to every backend call
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
pub const MIN_NETWORK_TIMEOUT_SECS: u64 = 1;
pub const MAX_NETWORK_TIMEOUT_SECS: u64 = 300;

/// Polling interval used while the realtime channel is down
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
pub const MAX_POLL_INTERVAL_SECS: u64 = 3_600;

/// Upper bound for a single notification-triggered pull
pub const REALTIME_PULL_TIMEOUT_SECS: u64 = 60;

// ===== Storage =====

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "duru.sqlite";
/// Settings file name inside the data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Capacity of the in-process change bus
pub const CHANGE_BUS_CAPACITY: usize = 256;
