use courier_core::CourierError;

/// Convert a `lapin` failure into a `CourierError`.
///
/// A protocol error means the broker closed the channel over something we asked
/// for (missing exchange, conflicting declaration); that is a `Topology` problem.
/// Everything else is a transport failure and reported as `Unavailable`.
pub fn map_lapin_error(op: &str, e: lapin::Error) -> CourierError {
    match e {
        lapin::Error::ProtocolError(amqp) => {
            CourierError::Topology(format!("AMQP {} refused: {}", op, amqp))
        }
        other => CourierError::Unavailable(format!("AMQP {} failed: {}", op, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transport_errors_are_unavailable() {
        let io = lapin::Error::IOError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));
        assert!(map_lapin_error("publish", io).is_unavailable());
        assert!(map_lapin_error("connect", lapin::Error::ChannelsLimitReached).is_unavailable());
    }
}
