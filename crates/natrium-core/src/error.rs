#![forbid(unsafe_code)]

//! Error taxonomy for graph construction and transaction outcomes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A loop placeholder was sampled or listened to before `close()`.
    #[error("loop used before close() supplied its source")]
    UnresolvedLoop,

    #[error("loop was already closed")]
    LoopAlreadyClosed,

    /// The new edge would make `node` depend on its own output within one
    /// transaction, with no hold or snapshot in between to break the cycle.
    #[error("cyclic dependency: `{node}` would depend on itself within one transaction")]
    CyclicDependency { node: &'static str },

    #[error("listener {listener} panicked: {message}")]
    ListenerPanicked { listener: u64, message: String },

    #[error("transaction {transaction} finished with {} failure(s)", .failures.len())]
    Transaction {
        transaction: u64,
        failures: Vec<Error>,
    },
}

impl Error {
    /// Failures carried by this error, flattening a transaction report.
    #[must_use]
    pub fn failures(&self) -> &[Error] {
        match self {
            Self::Transaction { failures, .. } => failures,
            other => std::slice::from_ref(other),
        }
    }

    #[must_use]
    pub fn is_unresolved_loop(&self) -> bool {
        self.failures()
            .iter()
            .any(|failure| matches!(failure, Self::UnresolvedLoop))
    }
}
