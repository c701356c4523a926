use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {collection}/{id}: {message}")]
    WriteRejected {
        collection: String,
        id: String,
        message: String,
    },
    #[error("collection {collection} is corrupt: {source}")]
    Corrupt {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup file is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("invalid backup file: missing top-level \"collections\"")]
    MissingCollections,
    #[error("invalid backup file: {0}")]
    InvalidManifest(String),
    #[error("backup references collections outside the backup list: {}", .0.join(", "))]
    UnlistedCollections(Vec<String>),
    #[error("reading collection {collection} failed: {source}")]
    Store {
        collection: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot serialize backup: {0}")]
    Serialize(#[source] serde_json::Error),
}
