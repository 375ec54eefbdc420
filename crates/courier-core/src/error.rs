use thiserror::Error;

/// Errors that can occur in the coordination layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CourierError {
    /// The lock store or the broker could not be reached, or did not answer in time.
    #[error("Coordination unavailable: {0}")]
    Unavailable(String),

    #[error("Lock contention: {0}")]
    Contention(String),

    #[error("Unroutable message: {0}")]
    Unroutable(String),

    #[error("Handler failure: {0}")]
    Handler(String),

    /// Missing or conflicting exchange/queue/binding. Fatal at startup.
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Whether the error means the external service could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CourierError::Unavailable(_))
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Serialization(e.to_string())
    }
}

/// Outcome of a scoped lock section that did not produce a value.
///
/// Keeps "lock not obtained" apart from "body failed".
#[derive(Error, Debug)]
pub enum WithLockError<E> {
    #[error("Lock not acquired: {0}")]
    NotAcquired(String),

    #[error(transparent)]
    Lock(CourierError),

    #[error("Locked section failed: {0}")]
    Body(E),
}

impl<E> WithLockError<E> {
    /// Whether the lock could not be obtained within the wait time.
    pub fn is_not_acquired(&self) -> bool {
        matches!(self, WithLockError::NotAcquired(_))
    }
}

impl<E: std::fmt::Display> WithLockError<E> {
    /// Flatten into a `CourierError`, mapping a body failure to `Handler`.
    pub fn into_courier_error(self) -> CourierError {
        match self {
            WithLockError::NotAcquired(key) => CourierError::Contention(key),
            WithLockError::Lock(e) => e,
            WithLockError::Body(e) => CourierError::Handler(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_lock_error_flattening() {
        let err: WithLockError<String> = WithLockError::NotAcquired("user:42".into());
        assert!(err.is_not_acquired());
        assert_eq!(
            err.into_courier_error(),
            CourierError::Contention("user:42".into())
        );

        let err: WithLockError<String> = WithLockError::Body("boom".into());
        assert_eq!(
            err.into_courier_error(),
            CourierError::Handler("boom".into())
        );

        let err: WithLockError<String> =
            WithLockError::Lock(CourierError::Unavailable("redis down".into()));
        assert!(err.into_courier_error().is_unavailable());
    }
}
