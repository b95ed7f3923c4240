//! Sense HAT environmental sensors.
//!
//! The board's HTS221 (humidity) and LPS25H (pressure) chips are exposed by
//! the kernel through the IIO sysfs interface, and the LED matrix through a
//! framebuffer device. Each IIO channel reads as `(raw + offset) * scale`.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::measurement::MeasurementSnapshot;

const HUMIDITY_DEVICE: &str = "hts221";
const PRESSURE_DEVICE: &str = "lps25h";
const LED_MATRIX_NAME: &str = "RPi-Sense FB";
/// 8x8 pixels in RGB565.
const LED_MATRIX_BYTES: usize = 8 * 8 * 2;

/// Something that can take a reading of the environment.
pub trait SensorReader: Send {
    fn capture(&mut self) -> Result<MeasurementSnapshot, Error>;
}

/// The Sense HAT attached to this Raspberry Pi.
pub struct SenseHat {
    humidity_device: PathBuf,
    pressure_device: PathBuf,
    led_matrix: Option<PathBuf>,
}

impl SenseHat {
    /// Locate the sensors under `sysfs_root` and the LED framebuffer device
    /// under `dev_root`.
    pub fn with_paths<P: AsRef<Path>, D: AsRef<Path>>(
        sysfs_root: P,
        dev_root: D,
    ) -> Result<Self, Error> {
        let iio_devices = sysfs_root.as_ref().join("bus/iio/devices");

        let humidity_device = find_named(&iio_devices, HUMIDITY_DEVICE)?
            .ok_or_else(|| Error::HardwareUnavailable(HUMIDITY_DEVICE.to_string()))?;
        let pressure_device = find_named(&iio_devices, PRESSURE_DEVICE)?
            .ok_or_else(|| Error::HardwareUnavailable(PRESSURE_DEVICE.to_string()))?;

        // the LED matrix is cosmetic, the sensors work without it
        let graphics = sysfs_root.as_ref().join("class/graphics");
        let led_matrix = match find_named(&graphics, LED_MATRIX_NAME) {
            Ok(Some(class_dir)) => class_dir
                .file_name()
                .map(|fb| dev_root.as_ref().join(fb)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "unable to look up the LED matrix");
                None
            }
        };

        tracing::debug!(
            humidity = %humidity_device.display(),
            pressure = %pressure_device.display(),
            led_matrix = ?led_matrix,
            "found Sense HAT devices"
        );

        Ok(SenseHat {
            humidity_device,
            pressure_device,
            led_matrix,
        })
    }

    fn clear_led_matrix(&self) {
        let Some(framebuffer) = &self.led_matrix else {
            return;
        };

        if let Err(e) = fs::write(framebuffer, [0u8; LED_MATRIX_BYTES]) {
            tracing::warn!(error = %e, "unable to clear the LED matrix");
        }
    }
}

impl SensorReader for SenseHat {
    #[tracing::instrument(err)]
    fn capture(&mut self) -> Result<MeasurementSnapshot, Error> {
        self.clear_led_matrix();

        // milli degrees Celsius, milli percent and kilopascal
        let temperature_from_humidity = read_channel(&self.humidity_device, "temp")? / 1000.0;
        let humidity = read_channel(&self.humidity_device, "humidityrelative")? / 1000.0;
        let temperature_from_pressure = read_channel(&self.pressure_device, "temp")? / 1000.0;
        let pressure = read_channel(&self.pressure_device, "pressure")? * 10.0;

        Ok(MeasurementSnapshot {
            temperature: temperature_from_humidity,
            temperature_from_humidity,
            temperature_from_pressure,
            humidity,
            pressure,
            captured_at: Utc::now(),
        })
    }
}

impl Debug for SenseHat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseHat")
            .field("humidity_device", &self.humidity_device)
            .field("pressure_device", &self.pressure_device)
            .finish()
    }
}

/// Stand-in board for running the module without hardware.
///
/// Values drift slowly around typical indoor conditions.
#[derive(Debug, Default)]
pub struct SimulatedSenseHat {
    ticks: u64,
}

impl SensorReader for SimulatedSenseHat {
    fn capture(&mut self) -> Result<MeasurementSnapshot, Error> {
        let phase = self.ticks as f64 / 10.0;
        self.ticks += 1;

        let temperature = 21.0 + 1.5 * phase.sin();
        Ok(MeasurementSnapshot {
            temperature,
            temperature_from_humidity: temperature,
            temperature_from_pressure: temperature - 0.4,
            humidity: 45.0 + 5.0 * phase.cos(),
            pressure: 1013.25 + 2.0 * (phase / 2.0).sin(),
            captured_at: Utc::now(),
        })
    }
}

/// Find the entry of `dir` whose `name` attribute equals `name`.
fn find_named(dir: &Path, name: &str) -> Result<Option<PathBuf>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        match fs::read_to_string(path.join("name")) {
            Ok(found) if found.trim() == name => return Ok(Some(path)),
            _ => continue,
        }
    }

    Ok(None)
}

fn read_channel(device: &Path, channel: &str) -> Result<f64, Error> {
    let raw = read_attribute(device, &format!("in_{channel}_raw"))?.ok_or_else(|| {
        Error::HardwareUnavailable(format!("{}: no {channel} channel", device.display()))
    })?;
    let offset = read_attribute(device, &format!("in_{channel}_offset"))?.unwrap_or(0.0);
    let scale = read_attribute(device, &format!("in_{channel}_scale"))?.unwrap_or(1.0);

    Ok((raw + offset) * scale)
}

fn read_attribute(device: &Path, attribute: &str) -> Result<Option<f64>, Error> {
    let path = device.join(attribute);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    contents
        .trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| Error::MalformedReading(path.display().to_string()))
}

/// Failure to read the board. Every kind is fatal to the relay.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("sensor hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("malformed reading in {0}")]
    MalformedReading(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_device(root: &Path, dir: &str, attributes: &[(&str, &str)]) -> PathBuf {
        let device = root.join(dir);
        fs::create_dir_all(&device).unwrap();
        for (name, value) in attributes {
            fs::write(device.join(name), format!("{value}\n")).unwrap();
        }
        device
    }

    fn fake_board() -> (TempDir, TempDir) {
        let sysfs = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();

        write_device(
            sysfs.path(),
            "bus/iio/devices/iio:device0",
            &[
                ("name", "hts221"),
                ("in_temp_raw", "100"),
                ("in_temp_offset", "200"),
                ("in_temp_scale", "75"),
                ("in_humidityrelative_raw", "1000"),
                ("in_humidityrelative_scale", "45.5"),
            ],
        );
        write_device(
            sysfs.path(),
            "bus/iio/devices/iio:device1",
            &[
                ("name", "lps25h"),
                ("in_temp_raw", "1000"),
                ("in_temp_offset", "20000"),
                ("in_temp_scale", "1"),
                ("in_pressure_raw", "4152000"),
                ("in_pressure_scale", "0.0000244140625"),
            ],
        );
        write_device(sysfs.path(), "class/graphics/fb1", &[("name", "RPi-Sense FB")]);
        fs::write(dev.path().join("fb1"), [0xffu8; LED_MATRIX_BYTES]).unwrap();

        (sysfs, dev)
    }

    #[test]
    fn captures_converted_readings() {
        let (sysfs, dev) = fake_board();
        let mut board = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap();

        let snapshot = board.capture().unwrap();

        assert!((snapshot.temperature_from_humidity - 22.5).abs() < 1e-9);
        assert_eq!(snapshot.temperature, snapshot.temperature_from_humidity);
        assert!((snapshot.humidity - 45.5).abs() < 1e-9);
        assert!((snapshot.temperature_from_pressure - 21.0).abs() < 1e-9);
        assert!((snapshot.pressure - 1013.671875).abs() < 1e-6);
    }

    #[test]
    fn capture_clears_the_led_matrix() {
        let (sysfs, dev) = fake_board();
        let mut board = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap();

        board.capture().unwrap();

        let pixels = fs::read(dev.path().join("fb1")).unwrap();
        assert_eq!(pixels.len(), LED_MATRIX_BYTES);
        assert!(pixels.iter().all(|&b| b == 0));
    }

    #[test]
    fn works_without_led_matrix() {
        let (sysfs, dev) = fake_board();
        fs::remove_dir_all(sysfs.path().join("class")).unwrap();

        let mut board = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap();
        assert!(board.capture().is_ok());
    }

    #[test]
    fn missing_board_is_unavailable() {
        let sysfs = TempDir::new().unwrap();
        let dev = TempDir::new().unwrap();

        let err = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap_err();
        assert!(matches!(err, Error::HardwareUnavailable(device) if device == "hts221"));
    }

    #[test]
    fn vanished_channel_fails_capture() {
        let (sysfs, dev) = fake_board();
        let mut board = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap();
        fs::remove_file(sysfs.path().join("bus/iio/devices/iio:device1/in_pressure_raw")).unwrap();

        assert!(matches!(board.capture(), Err(Error::HardwareUnavailable(_))));
    }

    #[test]
    fn garbage_attribute_is_malformed() {
        let (sysfs, dev) = fake_board();
        let mut board = SenseHat::with_paths(sysfs.path(), dev.path()).unwrap();
        fs::write(
            sysfs.path().join("bus/iio/devices/iio:device0/in_temp_raw"),
            "not a number\n",
        )
        .unwrap();

        assert!(matches!(board.capture(), Err(Error::MalformedReading(_))));
    }

    #[test]
    fn simulated_board_reads_plausible_values() {
        let mut board = SimulatedSenseHat::default();
        for _ in 0..50 {
            let snapshot = board.capture().unwrap();
            assert!((19.0..23.0).contains(&snapshot.temperature));
            assert!((40.0..=50.0).contains(&snapshot.humidity));
            assert!((1011.0..1016.0).contains(&snapshot.pressure));
        }
    }
}
