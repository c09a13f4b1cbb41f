use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error at version {version}: {message}")]
    Migration { version: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatastoreError {
    pub fn query(e: impl std::fmt::Display) -> Self {
        DatastoreError::Query(e.to_string())
    }
}
