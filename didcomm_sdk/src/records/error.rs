use thiserror::Error;

/// State-machine guard failures for protocol records.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("record is in state {current}, expected one of {expected:?}")]
    InvalidState {
        current: String,
        expected: Vec<String>,
    },
    #[error("cannot transition from state {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("record has role {current}, expected {expected}")]
    InvalidRole { current: String, expected: String },
    #[error("message belongs to connection {actual}, record expects {expected}")]
    ConnectionMismatch { expected: String, actual: String },
    #[error("message thread {actual} does not match record thread {expected}")]
    ThreadMismatch { expected: String, actual: String },
}
