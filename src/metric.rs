use std::fmt;

use serde::ser::Serializer;
use serde::Serialize;

/// One row of run history as returned by the source service.
///
/// Keys are metric names plus the bookkeeping fields `_timestamp`,
/// `_step` and `_run_time`; values are arbitrary JSON scalars.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A numeric metric value, preserving the source's numeric kind.
///
/// The distinction matters on snapshot round-trips: `3` must replay as an
/// integer and `3.0` as a float, so persisted values are parsed
/// integer-first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    /// Extracts a metric value from a JSON scalar.
    ///
    /// Returns `None` for anything that is not a plain number: strings,
    /// booleans, nulls, arrays and objects are never converted. serde_json
    /// cannot represent NaN, so a `Some` value is always finite-or-inf.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let number = value.as_number()?;
        if let Some(i) = number.as_i64() {
            return Some(Self::Int(i));
        }
        let f = number.as_f64()?;
        if f.is_nan() {
            return None;
        }
        Some(Self::Float(f))
    }

    /// Parses a persisted value string, integer-first.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            return Some(Self::Int(i));
        }
        match raw.parse::<f64>() {
            Ok(f) if !f.is_nan() => Some(Self::Float(f)),
            _ => None,
        }
    }

    /// Returns the value as an f64 regardless of kind.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
        }
    }
}

/// A single converted metric observation, ready to be written.
///
/// `timestamp` is milliseconds since epoch for experiment metrics, or a
/// surrogate row index for system telemetry (the source records none).
/// `sequence` is the source's native step, pinned to 0 for metrics logged
/// exactly once so they render at a stable x-axis position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub key: String,
    pub value: MetricValue,
    pub timestamp: i64,
    #[serde(rename = "step")]
    pub sequence: i64,
}

impl MetricPoint {
    pub fn new(key: impl Into<String>, value: MetricValue, timestamp: i64, sequence: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
            sequence,
        }
    }
}

/// An ordered group of metric points.
///
/// Owned by the batch accumulator until flushed; ownership transfers to
/// the writer on flush.
pub type MetricBatch = Vec<MetricPoint>;

/// Which destination stream a batch belongs to.
///
/// Network targets log both through the same endpoint; snapshot targets
/// keep them in separate directories so replay can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Experiment,
    System,
}

/// One source run, as listed by the reader.
///
/// `id` is the run's stable identifier and is the only key used for
/// destination naming; display names are not guaranteed unique. The run's
/// config is fetched separately, once, when the run is migrated.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub id: String,
    pub name: String,
    pub group: Option<String>,
    /// Creation time in milliseconds since epoch, when the source knows it.
    pub created_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_integer() {
        assert_eq!(MetricValue::from_json(&json!(3)), Some(MetricValue::Int(3)));
        assert_eq!(
            MetricValue::from_json(&json!(-17)),
            Some(MetricValue::Int(-17))
        );
    }

    #[test]
    fn test_from_json_float() {
        assert_eq!(
            MetricValue::from_json(&json!(0.5)),
            Some(MetricValue::Float(0.5))
        );
    }

    #[test]
    fn test_from_json_rejects_non_numeric() {
        assert_eq!(MetricValue::from_json(&json!("3")), None);
        assert_eq!(MetricValue::from_json(&json!(true)), None);
        assert_eq!(MetricValue::from_json(&json!(null)), None);
        assert_eq!(MetricValue::from_json(&json!({"a": 1})), None);
        assert_eq!(MetricValue::from_json(&json!([1, 2])), None);
    }

    #[test]
    fn test_parse_integer_first() {
        assert_eq!(MetricValue::parse("3"), Some(MetricValue::Int(3)));
        assert_eq!(MetricValue::parse("3.0"), Some(MetricValue::Float(3.0)));
        assert_eq!(MetricValue::parse(" 42 "), Some(MetricValue::Int(42)));
        assert_eq!(MetricValue::parse("abc"), None);
        assert_eq!(MetricValue::parse("NaN"), None);
    }

    #[test]
    fn test_display_round_trips_kind() {
        assert_eq!(MetricValue::Int(3).to_string(), "3");
        assert_eq!(MetricValue::Float(3.0).to_string(), "3");
        // "3" re-parses as Int; a float that prints without a dot collapses
        // to Int on replay, which is fine: the numeric value is identical.
        assert_eq!(MetricValue::Float(0.25).to_string(), "0.25");
        assert_eq!(MetricValue::parse("0.25"), Some(MetricValue::Float(0.25)));
    }

    #[test]
    fn test_metric_point_serializes_step_field() {
        let point = MetricPoint::new("loss", MetricValue::Float(0.5), 1000, 7);
        let value = serde_json::to_value(&point).expect("serialize");
        assert_eq!(
            value,
            json!({"key": "loss", "value": 0.5, "timestamp": 1000, "step": 7})
        );
    }
}
