use super::types::CombinedRecord;
use crate::telemetry::{ReadingError, SensorKind, SensorValue};

/// Latest unconsumed value per sensor kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PendingSample {
    pub(in crate::ingest) temperature: Option<f64>,
    pub(in crate::ingest) heater: Option<i64>,
    pub(in crate::ingest) light: Option<i64>,
}

impl PendingSample {
    pub(in crate::ingest) fn new() -> Self {
        Self::default()
    }

    /// Overwrites the slot for `kind`. A value of the wrong shape for the kind
    /// leaves every slot untouched and is reported back.
    pub(in crate::ingest) fn set(
        &mut self,
        kind: SensorKind,
        value: SensorValue,
    ) -> Result<(), ReadingError> {
        match (kind, value) {
            (SensorKind::Temperature, SensorValue::Float(v)) => self.temperature = Some(v),
            (SensorKind::Heater, SensorValue::Integer(v)) => self.heater = Some(v),
            (SensorKind::Light, SensorValue::Integer(v)) => self.light = Some(v),
            (kind, value) => return Err(ReadingError::WrongValueType { kind, value }),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.heater.is_none() && self.light.is_none()
    }

    pub fn filled(&self) -> usize {
        [
            self.temperature.is_some(),
            self.heater.is_some(),
            self.light.is_some(),
        ]
        .into_iter()
        .filter(|filled| *filled)
        .count()
    }

    pub(in crate::ingest) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Emits a record and empties every slot once all three kinds are present.
    pub(in crate::ingest) fn take_complete(&mut self, measurement: &str) -> Option<CombinedRecord> {
        let (Some(temperature), Some(heater), Some(light)) = (self.temperature, self.heater, self.light)
        else {
            return None;
        };
        self.reset();
        Some(CombinedRecord {
            measurement: measurement.to_string(),
            temperature,
            heater,
            light,
        })
    }
}
