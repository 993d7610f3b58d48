use thiserror::Error;

/// Expected, recoverable outcomes of engine operations.
///
/// None of these are fatal; the shell maps each one to a user-facing reply.
/// Membership oracle failures never appear here: they are collapsed into
/// [`EngineError::NotEligible`] at the cast boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("voting is closed")]
    VotingClosed,
    #[error("voter is not eligible")]
    NotEligible,
    #[error("no such candidate")]
    NoSuchCandidate,
    #[error("caller is not an administrator")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("candidate name is empty")]
    EmptyName,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Store(#[from] rusqlite::Error),
}

impl EngineError {
    /// Short stable code used in log records.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::VotingClosed => "voting_closed",
            EngineError::NotEligible => "not_eligible",
            EngineError::NoSuchCandidate => "no_such_candidate",
            EngineError::Unauthorized => "unauthorized",
            EngineError::NotFound => "not_found",
            EngineError::EmptyName => "empty_name",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Store(_) => "store",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
