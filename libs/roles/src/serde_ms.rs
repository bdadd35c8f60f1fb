//! Serializes durations as whole milliseconds.
use serde::{Deserialize as _, Deserializer, Serializer};
use zksync_concurrency::time;

pub(crate) fn serialize<S: Serializer>(d: &time::Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.whole_milliseconds() as i64)
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<time::Duration, D::Error> {
    Ok(time::Duration::milliseconds(i64::deserialize(d)?))
}
