use thiserror::Error;

/// User-facing errors surfaced by query construction and iteration.
///
/// Internal invariant violations are not represented here; those are bugs and
/// fail hard through assertions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EcsError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type EcsResult<T> = Result<T, EcsError>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("type mismatch: expected `{expected}`, got `{actual}`")]
pub struct TypeMismatchError {
    pub expected: &'static str,
    pub actual: &'static str,
}
