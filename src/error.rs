//! Terminal outcomes shared between every caller of one flight.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// Errors a flight can deliver to its callers.
///
/// A single flight is shared by every caller that overlapped it, so the
/// error is clonable and every caller observes the same underlying value.
#[derive(Debug, Clone, Error)]
pub enum FlightError {
    /// The work function returned an error.
    #[error("{0}")]
    Work(Arc<anyhow::Error>),

    /// The task executing the flight was dropped before it produced an
    /// outcome. Callers already attached observe this instead of hanging;
    /// callers arriving afterwards start a fresh flight.
    #[error("flight abandoned before completion")]
    Abandoned,
}

impl FlightError {
    pub(crate) fn work(err: impl Into<anyhow::Error>) -> Self {
        FlightError::Work(Arc::new(err.into()))
    }

    /// Returns the underlying work error, if that is what this is.
    pub fn as_work(&self) -> Option<&anyhow::Error> {
        match self {
            FlightError::Work(err) => Some(err),
            FlightError::Abandoned => None,
        }
    }

    /// True when the executing task vanished without settling the flight.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, FlightError::Abandoned)
    }
}

/// A panic captured from the work function, carried through the call
/// record so every waiter can re-raise it on its own task.
///
/// Only the rendered message travels; the raw payload is not `Clone` and
/// a flight can have many waiters.
#[derive(Debug, Clone)]
pub(crate) struct PanicPayload {
    message: Arc<String>,
}

impl PanicPayload {
    pub(crate) fn capture(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "work function panicked with a non-string payload".to_string()
        };
        Self {
            message: Arc::new(message),
        }
    }

    pub(crate) fn message(&self) -> &str {
        &self.message
    }

    /// Re-raises the panic on the current task. The payload is the
    /// original message as a `String`, so the default hook and
    /// `catch_unwind` callers both see something meaningful.
    pub(crate) fn resume(&self) -> ! {
        std::panic::panic_any(self.message.as_ref().clone())
    }

    /// Re-raises the panic where no caller can intercept it and takes the
    /// process down.
    ///
    /// The raise happens on a fresh OS thread so the default hook reports
    /// the message on stderr; joining it keeps the report ahead of the
    /// abort.
    pub(crate) fn crash(&self) -> ! {
        let message = self.message.as_ref().clone();
        let _ = std::thread::spawn(move || -> () {
            std::panic::panic_any(message);
        })
        .join();
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_error_is_shared_and_displays_inner() {
        let err = FlightError::work(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing row",
        ));
        let clone = err.clone();
        assert_eq!(err.to_string(), "missing row");
        assert_eq!(clone.to_string(), "missing row");
        assert!(err.as_work().is_some());
        assert!(!err.is_abandoned());
    }

    #[test]
    fn abandoned_is_distinguishable() {
        let err = FlightError::Abandoned;
        assert!(err.is_abandoned());
        assert!(err.as_work().is_none());
    }

    #[test]
    fn panic_payload_renders_str_and_string() {
        let p = PanicPayload::capture(Box::new("boom"));
        assert_eq!(p.message(), "boom");

        let p = PanicPayload::capture(Box::new("boom owned".to_string()));
        assert_eq!(p.message(), "boom owned");

        let p = PanicPayload::capture(Box::new(42_u32));
        assert!(p.message().contains("non-string"));
    }
}
