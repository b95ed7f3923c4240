use chrono::{DateTime, Utc};

/// One reading of the environmental sensors.
///
/// Created fresh on every polling tick and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSnapshot {
    /// Degrees Celsius, as reported by the board's primary temperature source.
    pub temperature: f64,
    /// Degrees Celsius, from the humidity sensor's thermometer.
    pub temperature_from_humidity: f64,
    /// Degrees Celsius, from the pressure sensor's thermometer.
    pub temperature_from_pressure: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Pressure in millibars (hPa).
    pub pressure: f64,
    pub captured_at: DateTime<Utc>,
}
