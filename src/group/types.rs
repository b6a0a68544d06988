//! Result shape shared by all group operations.

use crate::error::FlightError;

/// Outcome of one keyed call, as observed by a single caller.
#[derive(Debug, Clone)]
pub struct FlightResult<V> {
    /// The produced value. `None` when the flight failed, or when a
    /// batched work function settled normally without supplying a value
    /// for this key.
    pub value: Option<V>,
    /// Terminal error, if the flight failed. Every caller attached to the
    /// same flight observes the same error.
    pub err: Option<FlightError>,
    /// Whether at least one duplicate caller joined this flight.
    pub shared: bool,
}

impl<V> FlightResult<V> {
    /// Splits the outcome into the conventional `Result` shape.
    ///
    /// `Ok(None)` is reachable only through the batched operations, for a
    /// key the work function settled without supplying.
    pub fn into_result(self) -> Result<Option<V>, FlightError> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }

    pub(crate) fn abandoned(shared: bool) -> Self {
        Self {
            value: None,
            err: Some(FlightError::Abandoned),
            shared,
        }
    }
}
