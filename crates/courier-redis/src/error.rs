use courier_core::CourierError;
use redis::{ErrorKind, RedisError};

/// Convert a Redis failure into a `CourierError`.
///
/// Connection-level failures become `Unavailable`; anything the server answered
/// with (wrong type, script error) is `Internal`.
pub fn map_redis_error(op: &str, e: RedisError) -> CourierError {
    let unreachable = e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(
            e.kind(),
            ErrorKind::IoError
                | ErrorKind::BusyLoadingError
                | ErrorKind::TryAgain
                | ErrorKind::MasterDown
        );

    if unreachable {
        CourierError::Unavailable(format!("Redis {} failed: {}", op, e))
    } else {
        CourierError::Internal(format!("Redis {} failed: {}", op, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_unavailable() {
        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(map_redis_error("SET", refused).is_unavailable());

        let loading = RedisError::from((ErrorKind::BusyLoadingError, "loading dataset"));
        assert!(map_redis_error("GET", loading).is_unavailable());
    }

    #[test]
    fn test_server_errors_are_internal() {
        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(
            map_redis_error("HGET", wrong_type),
            CourierError::Internal(_)
        ));
    }
}
