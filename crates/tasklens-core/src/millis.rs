//! Serialize `Duration`s as floating-point milliseconds.
use serde::Serializer;
use std::time::Duration;

pub(crate) fn as_millis(duration: &Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

pub(crate) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(as_millis(duration))
}

pub(crate) fn serialize_option<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_some(&as_millis(d)),
        None => serializer.serialize_none(),
    }
}
