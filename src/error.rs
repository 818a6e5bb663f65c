use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Node already exists: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid state for node {id}: {reason}")]
    InvalidState { id: String, reason: String },

    #[error("Cycle detected at node: {0}")]
    CyclicGraph(String),

    #[error("Invalid graph: {}", errors.join("; "))]
    InvalidGraph { errors: Vec<String> },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
