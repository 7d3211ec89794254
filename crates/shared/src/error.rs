//! Error types for shared domain values

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid {kind}: {value}")]
    Parse { kind: &'static str, value: String },

    #[error("Invalid {entity} status transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Invalid money value: {0}")]
    Money(String),

    #[error("Invalid date: {0}")]
    Date(String),
}
