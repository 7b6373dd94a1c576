//! Bridge from an RS-485 Modbus soil sensor to a TCP collector.
//!
//! Each cycle the bridge queries the sensor, decodes its 8-register
//! reply and forwards it to the collector as a compact binary packet
//! over a TCP session that starts with a login handshake.
//!
//! # Wire protocol
//!
//! ```text
//! login:       78 01 <IMEI, 8 BCD bytes> 79
//! sensor data: 78 02 <YY MM DD hh mm ss, BCD> <8 x u16 big-endian> 79
//! ```
//!
//! Payload order: temperature, humidity, EC, pH, nitrogen, phosphor,
//! potassium, salinity.

pub mod config;
pub mod frame;
pub mod orchestrator;
pub mod packet;
pub mod sensor;
pub mod serial;
pub mod transport;
