use bytes::Bytes;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Temperature,
    Heater,
    Light,
}

impl SensorKind {
    /// Last topic segment under the namespace, e.g. `aquarispark/temp`.
    pub fn topic_suffix(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temp",
            SensorKind::Heater => "heater",
            SensorKind::Light => "light",
        }
    }

    /// Field key used when the combined point is written.
    pub fn field_name(self) -> &'static str {
        self.topic_suffix()
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "temp" => Some(SensorKind::Temperature),
            "heater" => Some(SensorKind::Heater),
            "light" => Some(SensorKind::Light),
            _ => None,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic_suffix())
    }
}

/// One raw value as it arrived from the broker.
#[derive(Debug, Clone)]
pub struct Reading {
    pub kind: SensorKind,
    pub raw: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorValue {
    Float(f64),
    Integer(i64),
}

#[derive(Debug, Error, PartialEq)]
pub enum ReadingError {
    #[error("{kind} payload is not valid UTF-8")]
    NotUtf8 { kind: SensorKind },
    #[error("{kind} payload {raw:?} is not a number")]
    InvalidFloat { kind: SensorKind, raw: String },
    #[error("{kind} payload {raw:?} is not a finite number")]
    NonFiniteFloat { kind: SensorKind, raw: String },
    #[error("{kind} payload {raw:?} is not an integer")]
    InvalidInteger { kind: SensorKind, raw: String },
    #[error("{kind} reading cannot hold {value:?}")]
    WrongValueType { kind: SensorKind, value: SensorValue },
}

/// Maps `<namespace>/<suffix>` onto a sensor kind. Deeper or foreign topics map to `None`.
pub fn sensor_kind_for_topic(namespace: &str, topic: &str) -> Option<SensorKind> {
    let suffix = topic.strip_prefix(namespace)?.strip_prefix('/')?;
    SensorKind::from_suffix(suffix)
}

pub fn parse_reading(namespace: &str, topic: &str, payload: Bytes) -> Option<Reading> {
    let kind = sensor_kind_for_topic(namespace, topic)?;
    Some(Reading { kind, raw: payload })
}

impl Reading {
    pub fn value(&self) -> Result<SensorValue, ReadingError> {
        parse_value(self.kind, &self.raw)
    }
}

pub fn parse_value(kind: SensorKind, raw: &[u8]) -> Result<SensorValue, ReadingError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ReadingError::NotUtf8 { kind })?
        .trim();

    match kind {
        SensorKind::Temperature => {
            let value = text.parse::<f64>().map_err(|_| ReadingError::InvalidFloat {
                kind,
                raw: text.to_string(),
            })?;
            // Line protocol has no representation for NaN or infinities.
            if !value.is_finite() {
                return Err(ReadingError::NonFiniteFloat {
                    kind,
                    raw: text.to_string(),
                });
            }
            Ok(SensorValue::Float(value))
        }
        SensorKind::Heater | SensorKind::Light => text
            .parse::<i64>()
            .map(SensorValue::Integer)
            .map_err(|_| ReadingError::InvalidInteger {
                kind,
                raw: text.to_string(),
            }),
    }
}
