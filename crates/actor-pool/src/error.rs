//! Error types for pool submission.

use thiserror::Error;

/// Why a submission was rejected.
///
/// The pool recovers from all transient interference internally by retrying;
/// only terminal conditions surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectedError {
    /// The pool has been shut down and no longer accepts work.
    #[error("pool has been shut down")]
    Shutdown,
    /// The actor's queue has reached its maximum pending-task count.
    #[error("actor queue is at capacity")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(RejectedError::Shutdown.to_string(), "pool has been shut down");
        assert_eq!(
            RejectedError::QueueFull.to_string(),
            "actor queue is at capacity"
        );
    }
}
