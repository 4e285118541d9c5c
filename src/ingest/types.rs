use crate::influx::FieldValue;
use crate::telemetry::SensorKind;

/// One flushed point: a value of every sensor kind under a fixed measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct CombinedRecord {
    pub measurement: String,
    pub temperature: f64,
    pub heater: i64,
    pub light: i64,
}

impl CombinedRecord {
    pub fn fields(&self) -> [(&'static str, FieldValue); 3] {
        [
            (
                SensorKind::Temperature.field_name(),
                FieldValue::Float(self.temperature),
            ),
            (
                SensorKind::Heater.field_name(),
                FieldValue::Integer(self.heater),
            ),
            (
                SensorKind::Light.field_name(),
                FieldValue::Integer(self.light),
            ),
        ]
    }
}
