//! Sync status published to the UI

/// What the orchestrator is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Error,
}

/// Last known connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connection {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Immutable status snapshot handed to subscribers
///
/// A fresh value is published on every field change; subscribers never
/// observe partial updates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    pub state: SyncState,
    pub connection: Connection,
    /// Unix ms of the last push that synced at least one operation
    pub last_push_time: Option<i64>,
    pub last_error: Option<String>,
    /// Operations still owed to the server, including failed ones
    /// scheduled for retry
    pub pending_operations: i64,
    /// Whether the pull engine is currently ingesting
    pub pull_syncing: bool,
}
