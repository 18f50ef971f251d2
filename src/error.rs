use thiserror::Error;

use crate::types::TypeId;

/// Errors that abandon a whole unit of work (one source string, one file,
/// one settings load). Data problems inside a well-formed unit never end up
/// here; they are reported through [`crate::diag::Diagnostics`] instead.
#[derive(Error, Debug)]
pub enum DecladError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Load state error: {0}")]
    State(String),
    #[error("Type error: {0}")]
    Type(#[from] TypeError),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, DecladError>;

/// Outcome of resolving a written type name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown type `{0}`")]
    Unknown(String),
    #[error("ambiguous type `{name}`, candidates: {candidates}")]
    Ambiguous { name: String, candidates: String, first: TypeId },
    #[error("malformed type name `{0}`")]
    Malformed(String),
}

// Helper conversions
impl From<::config::ConfigError> for DecladError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<pest::error::Error<crate::xml::Rule>> for DecladError {
    fn from(e: pest::error::Error<crate::xml::Rule>) -> Self {
        let (line, col) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        Self::Parse { message: e.variant.message().to_string(), line: Some(line), col: Some(col) }
    }
}
