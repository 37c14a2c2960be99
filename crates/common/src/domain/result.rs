use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Document not found in {collection}: {id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("Document already exists in {collection}: {id}")]
    DocumentAlreadyExists { collection: String, id: String },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream returned status {status} for user {user_id}")]
    UpstreamStatus { user_id: String, status: u16 },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid user: {0}")]
    InvalidUser(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// True when the store reported that no document exists for the id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DocumentNotFound { .. })
    }

    /// True for failures that may succeed on a later delivery attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidUser(_))
    }
}
