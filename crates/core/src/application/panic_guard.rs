// Panic isolation at the probe boundary

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// What came out of a guarded call
#[derive(Debug)]
pub enum Guarded<T> {
    Completed(T),
    /// Payload of the caught panic, rendered as text
    Panicked(String),
}

/// Run `f`, turning a panic into `Guarded::Panicked`.
///
/// `scope` names the probe or group for the log. Probe state is behind
/// `&mut` and gets cleaned up afterwards, so unwind safety is asserted here
/// rather than at every call site.
pub fn guarded<T>(scope: &str, f: impl FnOnce() -> T) -> Guarded<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Guarded::Completed(value),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(scope, panic_msg = %msg, "Panic caught at probe boundary");
            Guarded::Panicked(msg)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_passes_through() {
        match guarded("probe", || 7) {
            Guarded::Completed(v) => assert_eq!(v, 7),
            Guarded::Panicked(msg) => panic!("unexpected panic: {}", msg),
        }
    }

    #[test]
    fn test_formatted_panic_message_is_captured() {
        match guarded("probe", || -> i32 { panic!("boom {}", 1) }) {
            Guarded::Panicked(msg) => assert_eq!(msg, "boom 1"),
            Guarded::Completed(_) => panic!("panic was not caught"),
        }
    }

    #[test]
    fn test_non_string_payload() {
        let result = guarded("probe", || std::panic::panic_any(42_u8));
        assert!(matches!(result, Guarded::Panicked(msg) if msg == "non-string panic payload"));
    }
}
