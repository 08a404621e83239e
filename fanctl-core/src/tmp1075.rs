//! TMP1075 digital temperature sensor.

use crate::i2c::{I2cError, Transaction};

/// Temperature resolution in °C per LSB.
pub const LSB_CELSIUS: f32 = 0.0625;

/// Content of the device id register.
pub const DEVICE_ID: u16 = 0x7500;

/// Pointer register values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Register {
    /// Temperature result.
    Temperature = 0x00,
    /// Configuration.
    Configuration = 0x01,
    /// Low limit.
    LowLimit = 0x02,
    /// High limit.
    HighLimit = 0x03,
    /// Device id.
    DeviceId = 0x0f,
}

/// What a sensor transaction reads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reading {
    /// Temperature of the sensor with the given bank index.
    Temperature(u8),
    /// Device id of the sensor with the given bank index.
    DeviceId(u8),
}

/// Transaction selecting `reg` and reading its 16-bit value.
pub fn read_register<K: Copy>(addr: u8, reg: Register, kind: K) -> Result<Transaction<K>, I2cError> {
    Transaction::write_read(addr, &[reg as u8], 2, kind)
}

/// Converts a temperature register value to °C.
///
/// The register holds a left-justified 12-bit two's complement value.
pub fn decode_temperature(raw: [u8; 2]) -> f32 {
    (i16::from_be_bytes(raw) >> 4) as f32 * LSB_CELSIUS
}

/// Latest readings of a bank of TMP1075 sensors.
pub struct SensorBank<const N: usize> {
    temperatures: [Option<f32>; N],
    id_ok: [Option<bool>; N],
    reported: u32,
    average: Option<f32>,
}

impl<const N: usize> Default for SensorBank<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SensorBank<N> {
    const CAPACITY_OK: () = assert!(N >= 1 && N <= 32, "sensor bank holds 1..=32 sensors");
    const ALL: u32 = if N == 32 { u32::MAX } else { (1 << N) - 1 };

    /// Creates a bank without readings.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Self { temperatures: [None; N], id_ok: [None; N], reported: 0, average: None }
    }

    /// Stores the data of a completed transaction.
    ///
    /// Returns the new average once every sensor has reported a temperature
    /// since the previous average.
    pub fn ingest(&mut self, reading: Reading, data: &[u8]) -> Option<f32> {
        let Ok(raw) = <[u8; 2]>::try_from(data) else {
            warn!("TMP1075 {:?}: expected 2 bytes, got {}", reading, data.len());
            return None;
        };

        match reading {
            Reading::Temperature(sensor) => {
                let slot = self.temperatures.get_mut(sensor as usize)?;
                *slot = Some(decode_temperature(raw));
                self.reported |= 1 << sensor;

                if self.reported != Self::ALL {
                    return None;
                }
                self.reported = 0;

                let sum: f32 = self.temperatures.iter().flatten().sum();
                let average = sum / N as f32;
                self.average = Some(average);
                Some(average)
            }
            Reading::DeviceId(sensor) => {
                let id = u16::from_be_bytes(raw);
                let ok = id == DEVICE_ID;
                if !ok {
                    warn!("TMP1075 #{} reports device id 0x{:04x}", sensor, id);
                }
                if let Some(slot) = self.id_ok.get_mut(sensor as usize) {
                    *slot = Some(ok);
                }
                None
            }
        }
    }

    /// Latest temperature of a sensor in °C.
    pub fn temperature(&self, sensor: usize) -> Option<f32> {
        self.temperatures.get(sensor).copied().flatten()
    }

    /// Latest average temperature in °C.
    pub fn average(&self) -> Option<f32> {
        self.average
    }

    /// Whether the sensor reported the expected device id.
    pub fn device_id_ok(&self, sensor: usize) -> Option<bool> {
        self.id_ok.get(sensor).copied().flatten()
    }
}
