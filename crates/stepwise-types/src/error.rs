use thiserror::Error;

/// Row-level failures raised by storage adapters before they are mapped onto
/// `CheckpointError` in stepwise-core.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The database rejected or failed a statement.
    #[error("query error: {0}")]
    Query(String),

    /// A stored column could not be decoded (or a value could not be encoded).
    #[error("serialization error: {0}")]
    Serialization(String),
}
