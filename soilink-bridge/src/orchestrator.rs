//! Fixed-cadence poll, decode and send loop.

use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::packet::{ClockSample, DeviceIdentity, WirePacket, encode_sensor_data};
use crate::sensor::SensorSession;
use crate::serial::SerialPort;
use crate::transport::{ConnectionState, Connector, TransportError, TransportSession};

/// Result of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A sensor-data packet reached the transport.
    Sent,
    /// Nothing to send this cycle.
    Skipped,
}

/// Drives the sensor and transport sessions.
pub struct Orchestrator<P: SerialPort, C: Connector> {
    schedule: ScheduleConfig,
    login: WirePacket,
    sensor: SensorSession<P>,
    transport: TransportSession<C>,
    clock: fn() -> ClockSample,
}

impl<P: SerialPort, C: Connector> Orchestrator<P, C> {
    pub fn new(
        identity: &DeviceIdentity,
        schedule: ScheduleConfig,
        sensor: SensorSession<P>,
        transport: TransportSession<C>,
    ) -> Self {
        Self {
            schedule,
            login: WirePacket::login(identity),
            sensor,
            transport,
            clock: ClockSample::now,
        }
    }

    /// Replace the wall clock used to timestamp readings.
    pub fn with_clock(mut self, clock: fn() -> ClockSample) -> Self {
        self.clock = clock;
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// One cycle: log in if needed, query, wait for a reading, send it.
    ///
    /// A missing or malformed reading skips the cycle; only transport
    /// failures are returned.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, TransportError> {
        self.transport.ensure_ready(&self.login).await?;

        if let Err(e) = self.sensor.send_query().await {
            warn!(error = %e, "Failed to query sensor");
            return Ok(CycleOutcome::Skipped);
        }

        let reading = match self
            .sensor
            .await_reading(
                self.schedule.reply_wait(),
                self.schedule.reply_wait_interval(),
            )
            .await
        {
            Ok(reading) => reading,
            Err(e) => {
                info!(reason = %e, "No valid sensor data this cycle");
                return Ok(CycleOutcome::Skipped);
            }
        };

        let packet = encode_sensor_data(&reading, &(self.clock)());
        self.transport.send(&packet).await?;
        info!("Sensor data packet sent: {:02X?}", packet.to_bytes());

        Ok(CycleOutcome::Sent)
    }

    /// Run forever.
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves, then close the connection and stop
    /// the sensor worker.
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) {
        tokio::pin!(shutdown);

        info!(
            interval_secs = self.schedule.poll_interval_secs,
            backoff_secs = self.schedule.reconnect_backoff_secs,
            "Starting sensor cycle"
        );

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => break,
                result = self.run_cycle() => result,
            };

            let pause = match result {
                Ok(outcome) => {
                    debug!(?outcome, "Cycle complete");
                    self.schedule.poll_interval()
                }
                Err(e) => {
                    error!(phase = e.phase(), error = %e, "Connection error");
                    self.transport.disconnect().await;
                    info!(
                        "Reconnecting in {} seconds...",
                        self.schedule.reconnect_backoff_secs
                    );
                    self.schedule.reconnect_backoff()
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(pause) => {}
            }
        }

        self.stop().await;
    }

    async fn stop(mut self) {
        self.transport.disconnect().await;
        self.sensor.shutdown().await;
        info!("Sensor cycle stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{QUERY_FRAME, SensorReading, encode_response};
    use crate::packet::encode_login;
    use crate::sensor::SensorOptions;
    use crate::serial::MemorySerialPort;
    use crate::transport::TransportOptions;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::io::{Builder, Mock};

    const IDENTITY: &str = "862942071230965";

    struct MockConnector {
        streams: Mutex<VecDeque<Mock>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl Connector for MockConnector {
        type Stream = Mock;

        async fn connect(&self) -> io::Result<Mock> {
            self.attempts.lock().unwrap().push(Instant::now());
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }

        fn peer(&self) -> String {
            "mock:9619".to_string()
        }
    }

    fn reading() -> SensorReading {
        SensorReading {
            temperature: 235,
            humidity: 412,
            ec: 1100,
            ph: 650,
            nitrogen: 30,
            phosphor: 15,
            potassium: 80,
            salinity: 200,
        }
    }

    fn fixed_clock() -> ClockSample {
        ClockSample {
            year: 2024,
            month: 3,
            day: 5,
            hour: 14,
            minute: 22,
            second: 7,
        }
    }

    fn orchestrator(
        port: MemorySerialPort,
        streams: Vec<Mock>,
    ) -> Orchestrator<MemorySerialPort, MockConnector> {
        logged_orchestrator(port, streams, Arc::default())
    }

    fn logged_orchestrator(
        port: MemorySerialPort,
        streams: Vec<Mock>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    ) -> Orchestrator<MemorySerialPort, MockConnector> {
        let identity: DeviceIdentity = IDENTITY.parse().unwrap();
        let sensor = SensorSession::start(Arc::new(port), SensorOptions::default());
        let transport = TransportSession::new(
            MockConnector {
                streams: Mutex::new(streams.into()),
                attempts,
            },
            TransportOptions::default(),
        );
        Orchestrator::new(&identity, ScheduleConfig::default(), sensor, transport)
            .with_clock(fixed_clock)
    }

    fn login_bytes() -> Vec<u8> {
        encode_login(IDENTITY).unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_cycle_sends_reading() {
        let port = MemorySerialPort::with_responder(|query| {
            (query == QUERY_FRAME).then(|| encode_response(&reading()))
        });
        let expected = encode_sensor_data(&reading(), &fixed_clock()).to_bytes();
        let stream = Builder::new()
            .write(&login_bytes())
            .read(b"OK")
            .write(&expected)
            .build();

        let mut orch = orchestrator(port, vec![stream]);
        assert_eq!(orch.run_cycle().await.unwrap(), CycleOutcome::Sent);
        assert_eq!(orch.connection_state(), ConnectionState::Ready);
        orch.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_sensor_skips_cycle() {
        let stream = Builder::new().write(&login_bytes()).read(b"OK").build();

        let mut orch = orchestrator(MemorySerialPort::new(), vec![stream]);
        assert_eq!(orch.run_cycle().await.unwrap(), CycleOutcome::Skipped);
        // Skipping is not a transport failure
        assert_eq!(orch.connection_state(), ConnectionState::Ready);
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_garbled_reply_skips_cycle() {
        let port = MemorySerialPort::with_responder(|_| Some(vec![0x01, 0x03, 0x10, 0x00]));
        let stream = Builder::new().write(&login_bytes()).read(b"OK").build();

        let mut orch = orchestrator(port, vec![stream]);
        orch.schedule.reply_wait_interval_ms = 10;
        assert_eq!(orch.run_cycle().await.unwrap(), CycleOutcome::Skipped);
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let mut orch = orchestrator(MemorySerialPort::new(), vec![]);

        let err = orch.run_cycle().await.unwrap_err();
        assert_eq!(err.phase(), "connect");
        assert_eq!(orch.connection_state(), ConnectionState::Disconnected);
        orch.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_failure() {
        let port = MemorySerialPort::with_responder(|_| Some(encode_response(&reading())));
        let expected = encode_sensor_data(&reading(), &fixed_clock()).to_bytes();
        // First connection dies on the first data packet, second one works.
        let first = Builder::new()
            .write(&login_bytes())
            .read(b"OK")
            .write_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let second = Builder::new()
            .write(&login_bytes())
            .read(b"OK")
            .write(&expected)
            .build();

        let orch = orchestrator(port, vec![first, second]);
        // One failed cycle, 5s backoff, one good cycle, then stop during the 30s pause.
        orch.run_until(sleep(Duration::from_secs(20))).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_before_reconnect() {
        let port = MemorySerialPort::with_responder(|_| Some(encode_response(&reading())));
        let expected = encode_sensor_data(&reading(), &fixed_clock()).to_bytes();
        let first = Builder::new()
            .write(&login_bytes())
            .read(b"OK")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let second = Builder::new()
            .write(&login_bytes())
            .read(b"OK")
            .write(&expected)
            .build();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let orch = logged_orchestrator(port, vec![first, second], attempts.clone());
        orch.run_until(sleep(Duration::from_secs(20))).await;

        let schedule = ScheduleConfig::default();
        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 2);
        let gap = attempts[1] - attempts[0];
        // Reconnect waits out the backoff, not the poll interval
        assert!(gap >= schedule.reconnect_backoff(), "reconnected after {gap:?}");
        assert!(gap < schedule.poll_interval(), "reconnected after {gap:?}");
    }
}
