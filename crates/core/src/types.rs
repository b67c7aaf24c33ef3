/// Backend-assigned node identifier (the key in the workflow JSON object).
pub type NodeId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
