//! Permissive deserialization helpers for use with `serde_with`.
//!
//! Values coming from environment variables arrive as strings, and hand-written YAML tends to mix integers and floats
//! for the same field, so these helpers accept a wider range of input shapes than the derived implementations.

use std::{fmt, time::Duration};

use serde::{
    de::{Error, Unexpected},
    Deserializer,
};
use serde_with::DeserializeAs;

/// Permissively deserializes a boolean.
///
/// Accepts:
///
/// - `true` or `false` as a native boolean
/// - `"true"` or `"false"` as a string (case insensitive)
/// - `1` or `0` as an integer
pub struct PermissiveBool;

impl<'de> DeserializeAs<'de, bool> for PermissiveBool {
    fn deserialize_as<D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = bool;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a boolean, string, or integer")
            }

            fn visit_bool<E: Error>(self, value: bool) -> Result<Self::Value, E> {
                Ok(value)
            }

            fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
                match value.trim().to_lowercase().as_str() {
                    "true" | "1" => Ok(true),
                    "false" | "0" => Ok(false),
                    _ => Err(Error::invalid_value(
                        Unexpected::Str(value),
                        &"\"true\" or \"false\" (case insensitive)",
                    )),
                }
            }

            fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
                match value {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => Err(Error::invalid_value(Unexpected::Signed(value), &"0 or 1")),
                }
            }

            fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
                match value {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => Err(Error::invalid_value(Unexpected::Unsigned(value), &"0 or 1")),
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Deserializes a non-negative number of seconds, integer or fractional, into a [`Duration`].
pub struct Seconds;

/// Deserializes a non-negative number of milliseconds into a [`Duration`].
pub struct Milliseconds;

struct DurationVisitor {
    unit_secs: f64,
}

impl serde::de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a non-negative number")
    }

    fn visit_u64<E: Error>(self, value: u64) -> Result<Self::Value, E> {
        self.visit_f64(value as f64)
    }

    fn visit_i64<E: Error>(self, value: i64) -> Result<Self::Value, E> {
        if value < 0 {
            return Err(Error::invalid_value(Unexpected::Signed(value), &self));
        }
        self.visit_f64(value as f64)
    }

    fn visit_f64<E: Error>(self, value: f64) -> Result<Self::Value, E> {
        Duration::try_from_secs_f64(value * self.unit_secs)
            .map_err(|_| Error::invalid_value(Unexpected::Float(value), &self))
    }

    fn visit_str<E: Error>(self, value: &str) -> Result<Self::Value, E> {
        let parsed = value
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::invalid_value(Unexpected::Str(value), &self))?;
        self.visit_f64(parsed)
    }
}

impl<'de> DeserializeAs<'de, Duration> for Seconds {
    fn deserialize_as<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor { unit_secs: 1.0 })
    }
}

impl<'de> DeserializeAs<'de, Duration> for Milliseconds {
    fn deserialize_as<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor { unit_secs: 0.001 })
    }
}
