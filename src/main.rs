//! CLI entry point for the PM100x panel
//!
//! A terminal front end over [`PowerMeterController`]: it discovers consoles,
//! connects, and prints the controller's events.
//!
//! # Usage
//!
//! ```bash
//! pm100x list
//! pm100x monitor --samples 20
//! pm100x wavelength 1064
//! pm100x range up
//! pm100x zero
//! pm100x --simulate monitor      # no hardware needed
//! ```
//!
//! The real VISA bus needs the `instrument_visa` feature.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pm100x_panel::adapters::{simulated_bench, VisaResourceManager};
use pm100x_panel::config::{default_settings_path, PanelConfig, SettingsStore, DEFAULT_CONFIG_PATH};
use pm100x_panel::tracing_setup::{self, verbosity_level, TracingConfig};
use pm100x_panel::PowerMeterController;
use pm_core::{PanelEvent, ResourceManager};
use pm_driver_thorlabs::Pm100xDriver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "pm100x")]
#[command(about = "Control panel for Thorlabs PM100D / PM100A power meters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use a simulated bench instead of the VISA bus
    #[arg(long, global = true)]
    simulate: bool,

    /// Only consider this model (PM100D or PM100A)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Device address (default: from the configuration, else the first found)
    #[arg(long, global = true)]
    address: Option<String>,

    /// Only log errors
    #[arg(short = 's', long = "decrease-verbose", global = true)]
    decrease_verbose: bool,

    /// Settings file written back on change (default: per-user config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the consoles on the bus
    List,

    /// Print power readings until Ctrl+C
    Monitor {
        /// Stop after this many readings
        #[arg(long)]
        samples: Option<usize>,

        /// Seconds between readings
        #[arg(long)]
        refresh_time: Option<String>,
    },

    /// Set the calibration wavelength, in nm
    Wavelength {
        nm: String,
    },

    /// Step the power range by one rung (turns auto-ranging off)
    Range {
        #[arg(value_enum)]
        direction: Direction,
    },

    /// Zero the console against the current dark input
    Zero,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_step(self) -> i32 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PanelConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;

    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if cli.decrease_verbose {
        tracing_config.level = verbosity_level(false);
    }
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    let controller = build_controller(&cli, &config)?;

    let result = match &cli.command {
        Commands::List => list(&controller).await,
        Commands::Monitor {
            samples,
            refresh_time,
        } => {
            connect(&controller, &cli, &config).await?;
            monitor(&controller, *samples, refresh_time.as_deref()).await
        }
        Commands::Wavelength { nm } => {
            connect_paused(&controller, &cli, &config).await?;
            if controller.set_wavelength(nm).await {
                println!("Wavelength: {} nm", nm.trim());
                Ok(())
            } else {
                Err(anyhow::anyhow!("Could not set the wavelength to '{nm}'"))
            }
        }
        Commands::Range { direction } => {
            connect_paused(&controller, &cli, &config).await?;
            step_range(&controller, *direction).await
        }
        Commands::Zero => {
            connect_paused(&controller, &cli, &config).await?;
            if controller.zero().await {
                println!("Zeroed.");
                Ok(())
            } else {
                Err(anyhow::anyhow!("Zeroing failed"))
            }
        }
    };

    controller.close().await;
    result
}

fn build_controller(cli: &Cli, config: &PanelConfig) -> Result<PowerMeterController> {
    let resource_manager: Arc<dyn ResourceManager> = if cli.simulate {
        tracing::info!("Using the simulated bench");
        Arc::new(simulated_bench())
    } else {
        Arc::new(
            VisaResourceManager::new()
                .context("Could not open the VISA bus (use --simulate to run without hardware)")?,
        )
    };

    let driver = match cli.model.as_ref().or(config.device.model.as_ref()) {
        Some(model) => Pm100xDriver::with_model(resource_manager, model)?,
        None => Pm100xDriver::new(resource_manager),
    };

    let settings = match cli.settings.clone().or_else(default_settings_path) {
        Some(path) => SettingsStore::load(path, config.settings)?,
        None => SettingsStore::in_memory(config.settings),
    };

    Ok(PowerMeterController::new(Arc::new(driver), settings))
}

async fn list(controller: &PowerMeterController) -> Result<()> {
    let devices = controller.refresh_list_devices().await;
    if devices.is_empty() {
        println!("No devices found.");
    }
    for device in devices {
        println!("{}", device.label());
    }
    Ok(())
}

/// Scan, pick an address and connect. Reading starts on connect.
async fn connect(controller: &PowerMeterController, cli: &Cli, config: &PanelConfig) -> Result<()> {
    let devices = controller.refresh_list_devices().await;
    let target = match cli.address.as_ref().or(config.device.address.as_ref()) {
        Some(address) => address.clone(),
        None => match devices.first() {
            Some(device) => device.label(),
            None => bail!("No PM100x console found"),
        },
    };
    if !controller.connect_device(&target).await {
        bail!("Could not connect to '{target}'");
    }
    Ok(())
}

/// Connect for a one-off command; no continuous reading.
async fn connect_paused(controller: &PowerMeterController, cli: &Cli, config: &PanelConfig) -> Result<()> {
    connect(controller, cli, config).await?;
    controller.pause_reading();
    Ok(())
}

async fn monitor(
    controller: &PowerMeterController,
    samples: Option<usize>,
    refresh_time: Option<&str>,
) -> Result<()> {
    let mut events = controller.subscribe();
    if let Some(refresh_time) = refresh_time {
        if !controller.set_refresh_time(refresh_time) {
            bail!("Invalid refresh time '{refresh_time}'");
        }
    }
    println!("Reading from {} (Ctrl+C to stop)", controller.connected_device().unwrap_or_default());

    let mut received = 0;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PanelEvent::NewData(reading)) => {
                    received += 1;
                    println!("{:>6}  {}", received, reading);
                    if samples.is_some_and(|n| received >= n) {
                        break;
                    }
                }
                Ok(PanelEvent::ReadFailed(message)) => eprintln!("read failed: {message}"),
                Ok(PanelEvent::ReadingChanged(state)) => {
                    tracing::debug!(?state, "Reading state changed");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Display fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
        if !controller.is_reading() {
            break;
        }
    }

    let kept = controller.stored_data().len();
    controller.stop_reading().await;
    println!("{kept} readings acquired.");
    Ok(())
}

async fn step_range(controller: &PowerMeterController, direction: Direction) -> Result<()> {
    if controller.driver().state().auto_power_range == Some(true)
        && !controller.set_auto_power_range(false).await
    {
        bail!("Could not turn auto-ranging off");
    }
    if !controller.change_power_range(direction.as_step()).await {
        bail!("Could not change the power range");
    }
    match controller.driver().state().power_range {
        Some(range) => println!("Power range: {range:.2e} W"),
        None => println!("Power range: unknown"),
    }
    Ok(())
}
