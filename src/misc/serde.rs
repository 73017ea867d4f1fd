use std::{fmt, marker::PhantomData, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{
    Deserialize, Deserializer,
    de::{self, Visitor},
};

/// Initialises a `null` value (a YAML section that is given without any
/// keys) to `Some(T::default())` instead of `None`.
///
/// # Example
///
/// ```yaml
/// # config.yaml
/// http:
/// ```
/// This evaluates to `{ "http": null }`, which this deserializer turns into
/// `Some(HttpConfig::default())`.
pub fn deserialise_empty_to_default<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de> + Default,
    D: Deserializer<'de>,
{
    struct OptionalStructVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for OptionalStructVisitor<T>
    where
        T: Deserialize<'de> + Default,
    {
        type Value = Option<T>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("null or map")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(T::default()))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(T::default()))
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: de::MapAccess<'de>,
        {
            Deserialize::deserialize(de::value::MapAccessDeserializer::new(map)).map(Some)
        }
    }

    deserializer.deserialize_any(OptionalStructVisitor(PhantomData))
}

/// Reads a duration given as a (possibly fractional) number of seconds.
pub fn deserialise_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = f64::deserialize(deserializer)?;

    Duration::try_from_secs_f64(seconds).map_err(de::Error::custom)
}

pub fn serialise_seconds<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Reads an ISO 8601 timestamp. One without an offset is taken as UTC, and
/// one that cannot be read at all becomes the time of receipt.
pub fn deserialise_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = Option::<String>::deserialize(deserializer)?;

    Ok(text.as_deref().and_then(parse_timestamp).unwrap_or_else(Utc::now))
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(timestamp.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|timestamp| timestamp.and_utc())
}
