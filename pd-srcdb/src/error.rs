use crate::code_cache::CodeArea;

pub type SrcDbResult<T> = Result<T, SrcDbError>;

/// Recoverable failures from the environment. Broken chaining invariants
/// are not represented here; those panic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SrcDbError {
    CodeMapping(String),
    CodeCacheTooLarge { requested: usize, limit: usize },
    CodeCacheFull { area: CodeArea, requested: usize },
}

impl std::fmt::Display for SrcDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SrcDbError::CodeMapping(message) => write!(f, "code cache mapping failed: {message}"),
            SrcDbError::CodeCacheTooLarge { requested, limit } => write!(
                f,
                "code cache of {requested} bytes exceeds rel32 reach of {limit} bytes"
            ),
            SrcDbError::CodeCacheFull { area, requested } => write!(
                f,
                "{} code area cannot fit {requested} more bytes",
                area.name()
            ),
        }
    }
}

impl std::error::Error for SrcDbError {}
