//! Modbus RTU framing for the soil sensor.
//!
//! The sensor answers a single fixed request: read 8 holding registers
//! starting at address 0 on slave 1. The response is
//! `01 03 10 <16 data bytes> <crc lo> <crc hi>`.

use crc::{CRC_16_MODBUS, Crc};
use std::fmt;
use thiserror::Error;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Slave address of the soil sensor.
pub const SLAVE_ADDRESS: u8 = 0x01;

/// Function code for "read holding registers".
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Number of registers the sensor reports.
pub const REGISTER_COUNT: usize = 8;

/// Expected header of a successful response: slave, function, byte count.
pub const RESPONSE_HEADER: [u8; 3] = [SLAVE_ADDRESS, READ_HOLDING_REGISTERS, 0x10];

/// Header plus register data, without the trailing CRC.
pub const RESPONSE_LEN: usize = RESPONSE_HEADER.len() + REGISTER_COUNT * 2;

/// Full response length including the CRC.
pub const RESPONSE_LEN_WITH_CRC: usize = RESPONSE_LEN + 2;

/// Fixed query: read 8 holding registers from address 0 on slave 1.
pub const QUERY_FRAME: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C];

/// Why a sensor response was rejected.
///
/// Every variant is a malformed response; none of them yields a partial reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedResponse {
    #[error("Malformed response: {len} bytes, expected at least {expected}")]
    TooShort { len: usize, expected: usize },

    #[error("Malformed response: header {found:02X?}, expected [01, 03, 10]")]
    UnexpectedHeader { found: [u8; 3] },

    #[error("Malformed response: Modbus exception {code:#04x}")]
    Exception { code: u8 },

    #[error("Malformed response: CRC {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { computed: u16, received: u16 },
}

/// One complete set of soil measurements, in the sensor's raw register scale.
///
/// Temperature and humidity are tenths, pH is hundredths, the rest are
/// whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorReading {
    pub temperature: u16,
    pub humidity: u16,
    pub ec: u16,
    pub ph: u16,
    pub nitrogen: u16,
    pub phosphor: u16,
    pub potassium: u16,
    pub salinity: u16,
}

impl SensorReading {
    /// Build a reading from registers in wire order.
    pub fn from_registers(regs: [u16; REGISTER_COUNT]) -> Self {
        let [
            temperature,
            humidity,
            ec,
            ph,
            nitrogen,
            phosphor,
            potassium,
            salinity,
        ] = regs;
        Self {
            temperature,
            humidity,
            ec,
            ph,
            nitrogen,
            phosphor,
            potassium,
            salinity,
        }
    }

    /// Registers in wire order.
    pub fn registers(&self) -> [u16; REGISTER_COUNT] {
        [
            self.temperature,
            self.humidity,
            self.ec,
            self.ph,
            self.nitrogen,
            self.phosphor,
            self.potassium,
            self.salinity,
        ]
    }

    /// Temperature in °C.
    pub fn temperature_celsius(&self) -> f64 {
        f64::from(self.temperature) / 10.0
    }

    /// Relative humidity in %.
    pub fn humidity_percent(&self) -> f64 {
        f64::from(self.humidity) / 10.0
    }

    /// pH value.
    pub fn ph_value(&self) -> f64 {
        f64::from(self.ph) / 100.0
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "temperature={:.1}°C humidity={:.1}% ec={}µS/cm ph={:.2} \
             nitrogen={}mg/kg phosphor={}mg/kg potassium={}mg/kg salinity={}mg/L",
            self.temperature_celsius(),
            self.humidity_percent(),
            self.ec,
            self.ph_value(),
            self.nitrogen,
            self.phosphor,
            self.potassium,
            self.salinity
        )
    }
}

/// Decode a response buffer into a reading.
///
/// Only the header and the register data are checked; trailing bytes
/// (normally the CRC) are ignored. See [`decode_verified`] for the
/// checksummed variant.
pub fn decode(raw: &[u8]) -> Result<SensorReading, MalformedResponse> {
    if raw.len() >= 3 && raw[0] == SLAVE_ADDRESS && raw[1] == READ_HOLDING_REGISTERS | 0x80 {
        return Err(MalformedResponse::Exception { code: raw[2] });
    }

    if raw.len() < RESPONSE_LEN {
        return Err(MalformedResponse::TooShort {
            len: raw.len(),
            expected: RESPONSE_LEN,
        });
    }

    let found = [raw[0], raw[1], raw[2]];
    if found != RESPONSE_HEADER {
        return Err(MalformedResponse::UnexpectedHeader { found });
    }

    let mut regs = [0u16; REGISTER_COUNT];
    for (i, chunk) in raw[RESPONSE_HEADER.len()..RESPONSE_LEN]
        .chunks_exact(2)
        .enumerate()
    {
        regs[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }

    Ok(SensorReading::from_registers(regs))
}

/// Decode a response buffer and verify its CRC-16/MODBUS.
pub fn decode_verified(raw: &[u8]) -> Result<SensorReading, MalformedResponse> {
    let reading = decode(raw)?;

    if raw.len() < RESPONSE_LEN_WITH_CRC {
        return Err(MalformedResponse::TooShort {
            len: raw.len(),
            expected: RESPONSE_LEN_WITH_CRC,
        });
    }

    let computed = crc16(&raw[..RESPONSE_LEN]);
    // CRC is little-endian in RTU
    let received = u16::from_le_bytes([raw[RESPONSE_LEN], raw[RESPONSE_LEN + 1]]);
    if computed != received {
        return Err(MalformedResponse::CrcMismatch { computed, received });
    }

    Ok(reading)
}

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Build a complete response frame, CRC included, for the given reading.
///
/// This is what the sensor sends back; used by simulators and tests.
pub fn encode_response(reading: &SensorReading) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_LEN_WITH_CRC);
    frame.extend_from_slice(&RESPONSE_HEADER);
    for reg in reading.registers() {
        frame.extend_from_slice(&reg.to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}
