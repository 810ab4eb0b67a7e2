use thiserror::Error;

/// Coarse error exchanged across port boundaries.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("entry not found: {0}")]
    RuleNotFound(String),

    #[error("duplicate entry: {0}")]
    DuplicateRule(String),

    #[error("invalid entry: {0}")]
    InvalidRule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine error: {0}")]
    EngineError(String),
}
