use thiserror::Error;

#[derive(Error, Debug)]
pub enum HxError {
    #[error("Structural parse error in state {state}: expected {expected}, found {actual}")]
    Structural {
        state: String,
        expected: String,
        actual: String,
    },
    #[error("Unexpected {event} event for <{tag}> in state {state}")]
    UnexpectedEvent {
        state: String,
        event: String,
        tag: String,
    },
    #[error("Truncated input: {context}")]
    TruncatedInput { context: String },
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Blob not found: {hash}")]
    NotFound { hash: String },
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Archive error: {0}")]
    Archive(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HxError {
    /// Grammar violations that make the rest of the file unreadable.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural { .. } | Self::UnexpectedEvent { .. })
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, HxError>;
