mod cli;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, shells::Bash};
use json::JsonValue;
use log::{error, info};

use buspirate_utils::port;
use buspirate_utils::protocol::{BusPirate, DriverConfig, HandshakeConfig};
use buspirate_utils::sampler::{EmptyWindow, PipelineConfig, Reading, SamplingPipeline};
use buspirate_utils::shutdown::Shutdown;

use cli::{Cli, Commands};

/// How often `measure` checks that the device is still there.
const LINK_CHECK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
enum OutputFormat {
    Plain,
    Json,
}

fn format_reading(reading: &Reading, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Plain => reading.to_string(),
        OutputFormat::Json => {
            let mut obj = JsonValue::new_object();
            obj["amps"] = reading.amps.into();
            obj["volts"] = reading.volts.into();
            obj["samples"] = reading.samples.into();
            obj.dump()
        }
    }
}

fn driver_config(cli: &Cli) -> DriverConfig {
    DriverConfig {
        handshake: HandshakeConfig {
            attempts: cli.attempts,
            interval: Duration::from_millis(cli.attempt_interval_ms),
            timeout: cli.handshake_timeout_secs.map(Duration::from_secs),
        },
        close_on_console: cli.close_on_console,
    }
}

fn connect(cli: &Cli, shutdown: Shutdown) -> Result<BusPirate> {
    let port = port::open_port(&cli.port, cli.baudrate, cli.force)
        .with_context(|| format!("Failed to open port {}", cli.port))?;

    BusPirate::new(Box::new(port), driver_config(cli), shutdown)
        .context("Failed to start device reader")
}

fn cmd_probe(driver: &BusPirate, reset: bool, fmt: OutputFormat) -> Result<String> {
    if reset {
        driver.sync().context("Failed to reach device console")?;
        driver.reset().context("Failed to reset device")?;
    }

    driver
        .enter_binary()
        .context("Failed to enter binary mode")?;
    let mode = driver.mode();

    driver
        .reset_to_console()
        .context("Failed to return to console")?;

    Ok(match fmt {
        OutputFormat::Plain => mode.to_string(),
        OutputFormat::Json => json::stringify(mode.to_string()),
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_measure(
    driver: BusPirate,
    shutdown: Shutdown,
    baudrate: u32,
    shunt: f64,
    average: Option<usize>,
    triggered: Option<Duration>,
    history: Duration,
    skip_empty: bool,
    fmt: OutputFormat,
) -> Result<String> {
    driver
        .enter_binary()
        .context("Failed to enter binary mode")?;

    let mut config = match triggered {
        Some(period) => PipelineConfig::triggered(period, shunt),
        None => PipelineConfig::continuous(baudrate, shunt),
    };
    if let Some(average) = average {
        config.average_count = average.max(1);
    }
    config.history = config.samples_over(history);
    if skip_empty {
        config.empty_window = EmptyWindow::Skip;
    }

    let driver = Arc::new(driver);
    let pipeline = SamplingPipeline::start(
        Arc::clone(&driver),
        config,
        shutdown.clone(),
        move |reading| println!("{}", format_reading(&reading, fmt)),
    )
    .context("Failed to start sampling")?;

    while !shutdown.wait_timeout(LINK_CHECK_PERIOD) {
        if driver.is_closed() {
            shutdown.trigger();
            pipeline.join();
            return Err(anyhow!("device link closed"));
        }
    }

    info!("measurement stopped");
    pipeline.join();
    Ok(String::new())
}

fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut Cli::command(),
            "buspirate-shunt",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let shutdown = Shutdown::new();
    let driver = connect(&cli, shutdown.clone())?;

    match cli.command {
        Commands::Probe { reset } => cmd_probe(&driver, reset, fmt),
        Commands::Measure {
            shunt,
            average,
            triggered,
            trigger_period_ms,
            history_secs,
            skip_empty,
        } => cmd_measure(
            driver,
            shutdown,
            cli.baudrate,
            *shunt,
            average,
            triggered.then(|| Duration::from_millis(trigger_period_ms)),
            Duration::from_secs(history_secs),
            skip_empty,
            fmt,
        ),
    }
}

fn main() {
    match do_main() {
        Ok(s) if s.is_empty() => (),
        Ok(s) => println!("{}", s),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
