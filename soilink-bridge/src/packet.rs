//! Collector wire protocol.
//!
//! Two fixed-length packets travel to the collector, both framed by a
//! start marker, a protocol tag and an end marker:
//!
//! ```text
//! login:       78 01 <identity, 8 BCD bytes>                          79   (11 bytes)
//! sensor data: 78 02 <YY MM DD hh mm ss, BCD> <8 x u16 big-endian>    79   (25 bytes)
//! ```

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::frame::{REGISTER_COUNT, SensorReading};

/// First byte of every packet.
pub const START_MARKER: u8 = 0x78;

/// Last byte of every packet.
pub const END_MARKER: u8 = 0x79;

/// Protocol tag of the login packet.
pub const TAG_LOGIN: u8 = 0x01;

/// Protocol tag of the sensor-data packet.
pub const TAG_SENSOR_DATA: u8 = 0x02;

/// Total length of a login packet.
pub const LOGIN_PACKET_LEN: usize = 11;

/// Total length of a sensor-data packet.
pub const SENSOR_DATA_PACKET_LEN: usize = 25;

/// Number of decimal digits in a device identity.
pub const IDENTITY_DIGITS: usize = 15;

/// Packet encoding and parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Invalid identity {0:?}: expected exactly 15 decimal digits")]
    InvalidIdentity(String),

    #[error("Invalid packet length {len} for tag {tag:#04x}")]
    InvalidLength { tag: u8, len: usize },

    #[error("Missing start/end marker")]
    BadMarker,

    #[error("Unknown protocol tag {0:#04x}")]
    UnknownTag(u8),
}

/// The device identifier sent in the login handshake (an IMEI).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// The 15 digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity as 8 BCD bytes, left-padded with a single zero digit.
    pub fn to_bcd(&self) -> [u8; 8] {
        let digits: Vec<u8> = std::iter::once(0)
            .chain(self.0.bytes().map(|b| b - b'0'))
            .collect();

        let mut bcd = [0u8; 8];
        for (byte, pair) in bcd.iter_mut().zip(digits.chunks_exact(2)) {
            *byte = (pair[0] << 4) | pair[1];
        }
        bcd
    }
}

impl FromStr for DeviceIdentity {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != IDENTITY_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PacketError::InvalidIdentity(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock time of a reading, as carried in the sensor-data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl ClockSample {
    /// Current local time.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            // leap seconds are reported as 59
            second: dt.second().min(59) as u8,
        }
    }

    /// `YY MM DD hh mm ss`, one BCD byte each.
    pub fn to_bcd(&self) -> [u8; 6] {
        [
            to_bcd(self.year.rem_euclid(100) as u8),
            to_bcd(self.month),
            to_bcd(self.day),
            to_bcd(self.hour),
            to_bcd(self.minute),
            to_bcd(self.second),
        ]
    }
}

/// Pack a value in `0..=99` as two BCD digits.
pub fn to_bcd(n: u8) -> u8 {
    ((n / 10) << 4) | (n % 10)
}

/// A framed packet bound for the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePacket {
    Login {
        identity_bcd: [u8; 8],
    },
    SensorData {
        timestamp_bcd: [u8; 6],
        payload: [u8; REGISTER_COUNT * 2],
    },
}

impl WirePacket {
    /// Login packet for an already-validated identity.
    pub fn login(identity: &DeviceIdentity) -> Self {
        Self::Login {
            identity_bcd: identity.to_bcd(),
        }
    }

    /// Sensor-data packet for a reading taken at `timestamp`.
    pub fn sensor_data(reading: &SensorReading, timestamp: &ClockSample) -> Self {
        let mut payload = [0u8; REGISTER_COUNT * 2];
        for (slot, reg) in payload.chunks_exact_mut(2).zip(reading.registers()) {
            slot.copy_from_slice(&reg.to_be_bytes());
        }
        Self::SensorData {
            timestamp_bcd: timestamp.to_bcd(),
            payload,
        }
    }

    /// Protocol tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Login { .. } => TAG_LOGIN,
            Self::SensorData { .. } => TAG_SENSOR_DATA,
        }
    }

    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Login { .. } => LOGIN_PACKET_LEN,
            Self::SensorData { .. } => SENSOR_DATA_PACKET_LEN,
        }
    }

    /// Packets are never empty; provided alongside [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Exact bytes to put on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.push(START_MARKER);
        out.push(self.tag());
        match self {
            Self::Login { identity_bcd } => out.extend_from_slice(identity_bcd),
            Self::SensorData {
                timestamp_bcd,
                payload,
            } => {
                out.extend_from_slice(timestamp_bcd);
                out.extend_from_slice(payload);
            }
        }
        out.push(END_MARKER);
        out
    }

    /// Parse one complete packet, as the collector does.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 3 || bytes[0] != START_MARKER || bytes[bytes.len() - 1] != END_MARKER {
            return Err(PacketError::BadMarker);
        }

        let tag = bytes[1];
        let body = &bytes[2..bytes.len() - 1];
        let invalid = || PacketError::InvalidLength {
            tag,
            len: bytes.len(),
        };

        match tag {
            TAG_LOGIN => Ok(Self::Login {
                identity_bcd: body.try_into().map_err(|_| invalid())?,
            }),
            TAG_SENSOR_DATA => {
                if body.len() != 6 + REGISTER_COUNT * 2 {
                    return Err(invalid());
                }
                let (timestamp, payload) = body.split_at(6);
                Ok(Self::SensorData {
                    timestamp_bcd: timestamp.try_into().map_err(|_| invalid())?,
                    payload: payload.try_into().map_err(|_| invalid())?,
                })
            }
            other => Err(PacketError::UnknownTag(other)),
        }
    }
}

/// Validate `identity` and build its login packet.
pub fn encode_login(identity: &str) -> Result<WirePacket, PacketError> {
    let identity: DeviceIdentity = identity.parse()?;
    Ok(WirePacket::login(&identity))
}

/// Build the sensor-data packet for `reading` at `timestamp`.
pub fn encode_sensor_data(reading: &SensorReading, timestamp: &ClockSample) -> WirePacket {
    WirePacket::sensor_data(reading, timestamp)
}
