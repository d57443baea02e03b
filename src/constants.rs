//! Constants used throughout the crate
//!
//! This module centralizes identifier prefixes, retention windows, table names
//! and log message templates so the engines and the store agree on them.

// Identifiers
/// Prefix carried by every locally generated identifier
pub const TEMP_ID_PREFIX: &str = "temp_";
/// Length of the random suffix of a temporary identifier
pub const TEMP_ID_RANDOM_LEN: usize = 9;

// Retention
/// Days a tombstone is kept before it is garbage-collected
pub const TOMBSTONE_RETENTION_DAYS: i64 = 30;

// Groups
/// Groups every owner gets on first start
pub const DEFAULT_GROUP_NAMES: [&str; 2] = ["Personal", "Work"];

// Local table names
pub const TABLE_TASKS: &str = "tasks";
pub const TABLE_GROUPS: &str = "groups";
pub const TABLE_TASK_QUEUE: &str = "task_queue";
pub const TABLE_GROUP_QUEUE: &str = "group_queue";
pub const TABLE_DELETED_TASKS: &str = "deleted_tasks";
pub const TABLE_DELETED_GROUPS: &str = "deleted_groups";
pub const TABLE_PROMOTED_TASKS: &str = "promoted_tasks";
pub const TABLE_PROMOTED_GROUPS: &str = "promoted_groups";
pub const TABLE_SESSION: &str = "session";

// Remote defaults
pub const DEFAULT_REMOTE_TASKS_TABLE: &str = "tasks";
pub const DEFAULT_REMOTE_GROUPS_TABLE: &str = "groups";
pub const DEFAULT_API_KEY_ENV: &str = "TODOLY_API_KEY";
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 15;

// Sync defaults
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
/// Capacity of the change-notification channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// Log Messages
pub const LOG_QUEUED_OFFLINE: &str = "📥 Queued for later sync";
pub const LOG_PUSH_FAILED: &str = "⚠️  Remote push failed, queued for retry";
pub const LOG_DRAIN_SKIPPED_OFFLINE: &str = "📴 Drain skipped: remote unreachable";
pub const LOG_DRAIN_SKIPPED_BUSY: &str = "⏳ Drain skipped: already in progress";
pub const LOG_MEMORY_BACKEND: &str =
    "⚠️  Using the in-memory remote: synced records are lost when the process exits (set [remote] backend_type = \"rest\")";

// Messages
pub const CONFIG_GENERATED: &str = "✅ Generated default configuration file";
