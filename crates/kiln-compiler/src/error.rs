//! Errors of the driver and scheduler.
//!
//! User-facing problems are diagnostics, not these. What is here ends a
//! compilation early: cancellation, or a unit that failed unexpectedly.

use thiserror::Error;

/// The compilation was abandoned through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("compilation was cancelled")]
pub struct Cancelled;

/// A scheduled unit panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unit '{unit}' failed unexpectedly: {message}")]
pub struct FatalError {
    pub unit: String,
    pub message: String,
}

impl FatalError {
    /// Build from a panic payload, keeping its text when it has any.
    pub fn from_panic(unit: &str, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self {
            unit: unit.to_string(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("compilation was abandoned")]
    Abandoned,
}

impl From<Cancelled> for SchedulerError {
    fn from(_: Cancelled) -> Self {
        SchedulerError::Abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_text_is_kept() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("index out of bounds");
        let fatal = FatalError::from_panic("Widgets", payload.as_ref());
        assert_eq!(fatal.message, "index out of bounds");
        assert_eq!(
            fatal.to_string(),
            "unit 'Widgets' failed unexpectedly: index out of bounds"
        );

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(
            FatalError::from_panic("x", payload.as_ref()).message,
            "unknown panic payload"
        );
    }

    #[test]
    fn cancellation_maps_to_abandoned() {
        assert_eq!(SchedulerError::from(Cancelled), SchedulerError::Abandoned);
    }
}
