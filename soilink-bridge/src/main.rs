//! Soil sensor to TCP collector bridge.
//!
//! Polls an RS-485 Modbus soil sensor and forwards each reading to a
//! TCP collector after a login handshake.

use anyhow::{Context, Result};
use clap::Parser;
use soilink_bridge::config::SoilBridgeConfig;
use soilink_bridge::frame::{QUERY_FRAME, SensorReading, encode_response};
use soilink_bridge::orchestrator::Orchestrator;
use soilink_bridge::packet::DeviceIdentity;
use soilink_bridge::sensor::{SensorOptions, SensorSession};
use soilink_bridge::serial::{MemorySerialPort, SerialPort, TokioSerialPort};
use soilink_bridge::transport::{TcpConnector, TransportOptions, TransportSession};
use soilink_common::LoggingConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Bridge from an RS-485 Modbus soil sensor to a TCP collector.
#[derive(Parser, Debug)]
#[command(name = "soilink-bridge")]
#[command(about = "Polls a Modbus soil sensor and forwards readings to a TCP collector")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "soilink.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the 15-digit device identity.
    #[arg(long)]
    identity: Option<String>,

    /// Answer queries from a built-in simulated sensor instead of the serial port.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = SoilBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(identity) = &args.identity {
        config.device.identity = identity.clone();
    }

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    soilink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting soilink-bridge");
    info!("Loaded configuration from {:?}", args.config);

    // Invalid identity is fatal before the loop starts
    let identity = config.identity().context("Invalid device identity")?;

    if args.simulate {
        info!("Using simulated sensor");
        run(Arc::new(simulated_sensor()), &config, &identity).await
    } else {
        let port = TokioSerialPort::open(&config.sensor)
            .with_context(|| format!("Failed to open serial port {}", config.sensor.port))?;
        run(Arc::new(port), &config, &identity).await
    }
}

async fn run<P: SerialPort>(
    port: Arc<P>,
    config: &SoilBridgeConfig,
    identity: &DeviceIdentity,
) -> Result<()> {
    let sensor = SensorSession::start(port, SensorOptions::from(&config.sensor));

    // Let the UART settle before the first query
    tokio::time::sleep(Duration::from_millis(config.sensor.settle_ms)).await;

    let transport = TransportSession::new(
        TcpConnector::new(&config.collector.host, config.collector.port),
        TransportOptions::from(&config.collector),
    );

    info!(
        identity = %identity,
        collector = %format!("{}:{}", config.collector.host, config.collector.port),
        "Bridge running. Press Ctrl+C to stop."
    );

    Orchestrator::new(identity, config.schedule.clone(), sensor, transport)
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await;

    info!("Soil bridge stopped");
    Ok(())
}

/// In-memory sensor that answers every query with a fixed reading.
fn simulated_sensor() -> MemorySerialPort {
    let reading = SensorReading {
        temperature: 235,
        humidity: 412,
        ec: 1100,
        ph: 650,
        nitrogen: 30,
        phosphor: 15,
        potassium: 80,
        salinity: 200,
    };
    MemorySerialPort::with_responder(move |query| {
        (query == QUERY_FRAME).then(|| encode_response(&reading))
    })
}
