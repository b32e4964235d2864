//! RustyGatt CLI - heart rate relay over the in-memory backend
//!
//! A peripheral advertises a Heart Rate service, a central connects to it,
//! subscribes to the measurement characteristic and prints every value the
//! server pushes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rustygatt::{
    watch_client, watch_server, Advertiser, AdvertisingConfig, Central, CharacteristicConfig,
    CharacteristicProperty, Device, DeviceAddress, GattConfig, MockAdvertiser, MockNetwork,
    MockPeripheral, Permission, ServiceConfig, Uuid,
};

const HEART_RATE_SERVICE: Uuid = Uuid::from_u16(0x180D);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u16(0x2A37);
const BODY_SENSOR_LOCATION: Uuid = Uuid::from_u16(0x2A38);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Operation timeout in milliseconds, overrides the configuration file
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay heart rate measurements from a mock sensor to a central
    Relay {
        /// Number of measurements to send
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
        /// Delay between measurements in milliseconds
        #[arg(short, long, default_value_t = 500)]
        interval_ms: u64,
        /// Advertised name of the sensor
        #[arg(long, default_value = "RustyGatt HR")]
        name: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = load_configuration(&cli)?;
    if let Some(timeout) = cli.timeout_ms {
        config = config.with_operation_timeout(Duration::from_millis(timeout));
    }

    match cli.command {
        Commands::Relay {
            count,
            interval_ms,
            name,
        } => relay(config, count, Duration::from_millis(interval_ms), name).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Setup logging based on verbosity level. `RUST_LOG` wins when set.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<GattConfig> {
    match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(GattConfig::default()),
    }
}

fn heart_rate_service() -> ServiceConfig {
    ServiceConfig::primary(
        HEART_RATE_SERVICE,
        vec![
            CharacteristicConfig::new(
                HEART_RATE_MEASUREMENT,
                CharacteristicProperty::NOTIFY,
                Permission::empty(),
            ),
            // Chest
            CharacteristicConfig::new(
                BODY_SENSOR_LOCATION,
                CharacteristicProperty::READ,
                Permission::READ,
            )
            .with_initial_value(vec![0x01]),
        ],
    )
}

async fn relay(config: GattConfig, count: u32, interval: Duration, name: String) -> Result<()> {
    let sensor = Device::new("C0:FF:EE:00:00:10".parse::<DeviceAddress>()?).with_name(&name);
    let phone = Device::new("C0:FF:EE:00:00:01".parse::<DeviceAddress>()?).with_name("central");

    let network = MockNetwork::new(phone);
    let peripheral = Arc::new(MockPeripheral::new(
        sensor.clone(),
        &[heart_rate_service()],
        config.clone(),
    )?);
    network.add_peripheral(peripheral.clone());
    let server = peripheral.server().clone();
    let measurement = server
        .tree()
        .service(HEART_RATE_SERVICE)?
        .characteristic(HEART_RATE_MEASUREMENT)?
        .handle;

    let advertiser = MockAdvertiser::new();
    let advertising = advertiser
        .advertise(AdvertisingConfig::new(name, HEART_RATE_SERVICE))
        .await?;
    let server_status = watch_server(&server, measurement, advertising);

    let central = Central::new(Arc::new(network), config.clone());
    let session = central.connect(&sensor).await?;
    let mtu = session.request_mtu(config.effective_mtu()).await?;
    info!("Connected to {} (MTU {})", sensor.display_name(), mtu);

    let mut client_status = watch_client(&session, &[HEART_RATE_SERVICE]).await?;
    if client_status.borrow().missing_services {
        anyhow::bail!("{} has no heart rate service", sensor.display_name());
    }

    let mut rng = rand::thread_rng();
    for _ in 0..count {
        // Flags 0x00: uint8 format, no contact or energy fields
        let bpm: u8 = rng.gen_range(60..=100);
        let report = server
            .set_value_and_notify(measurement, &[0x00, bpm])
            .await?;
        for (address, e) in &report.failed {
            warn!("Notification to {} failed: {}", address, e);
        }

        match tokio::time::timeout(interval, client_status.changed()).await {
            Ok(Ok(())) => {
                let status = client_status.borrow_and_update().clone();
                if let Some(value) = status.values.get(&measurement) {
                    println!(
                        "{} bpm ({}), {} central(s)",
                        value.get(1).copied().unwrap_or_default(),
                        hex::encode(value),
                        server_status.borrow().connected.len()
                    );
                }
            }
            Ok(Err(_)) => break,
            Err(_) => warn!("No measurement within {:?}", interval),
        }
        tokio::time::sleep(interval).await;
    }

    central.disconnect_all().await;
    advertiser.stop().await?;
    server.close();
    info!("Relay finished");
    Ok(())
}
