//! The `utils` module provides the pieces shared by every layer of `peeklock`:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{BusError, LockLostReason, Result};

#[cfg(test)]
mod tests {
    use super::error::{BusError, LockLostReason};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("loud"), tracing::Level::INFO);
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(BusError::Transport("reset".into()).is_transient());
        assert!(!BusError::lock_lost(1, LockLostReason::Expired).is_transient());
        assert!(!BusError::unsupported("complete").is_transient());
    }

    #[test]
    fn error_codes_are_stable() {
        let err = BusError::MessageTooLarge {
            index: 2,
            size: 307_200,
            max_size: 262_144,
        };
        assert_eq!(err.code(), "MESSAGE_TOO_LARGE");
        assert_eq!(
            BusError::lock_lost(4, LockLostReason::NotHeld).to_string(),
            "message 4: lock not held"
        );
    }
}
