use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use envbus_core::StateFrame;
use envbus_redis::RedisConnector;
use envbus_session::{
    FrameRecorder, Received, Session, SessionConfig, SessionError, StateMonitor,
};
use envbus_settings::EnvbusSettings;
use envbus_telemetry::{init_telemetry, parse_level, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "envbus", about = "Serve and observe environments over a pub/sub bus")]
struct Cli {
    /// Settings file (defaults to ~/.envbus/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bus address, e.g. redis://127.0.0.1:6379
    #[arg(long, global = true)]
    address: Option<String>,

    /// Channel prefix shared by workers and master
    #[arg(long, global = true)]
    channel: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Establish a worker session, report its id and close it
    Probe,
    /// Serve blank frames and log the actions a master sends back
    Echo {
        /// Stop after this many actions
        #[arg(long)]
        steps: Option<u64>,
    },
    /// Report state traffic of every environment under the prefix
    Watch {
        /// Seconds per report
        #[arg(long, default_value_t = 2.0)]
        interval: f64,
    },
    /// Write every frame published on CHANNEL to numbered files
    Record {
        channel: String,
        #[arg(long, default_value = "output")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        load_settings(cli.config.as_deref(), std::io::stderr).context("failed to load settings")?;
    if let Some(address) = &cli.address {
        settings.bus.address = address.clone();
    }
    if let Some(channel) = &cli.channel {
        settings.bus.channel_prefix = channel.clone();
    }
    settings.validate().context("invalid settings")?;

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        parse_level(&settings.logging.level).unwrap_or(Level::INFO)
    };
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level,
        json: settings.logging.json,
        ..TelemetryConfig::default()
    })?;

    let connector = RedisConnector::new();
    match cli.command {
        Command::Probe => probe(&connector, &settings).await,
        Command::Echo { steps } => echo(&connector, &settings, steps).await,
        Command::Watch { interval } => {
            anyhow::ensure!(interval > 0.0, "--interval must be positive");
            watch(&connector, &settings, Duration::from_secs_f64(interval)).await
        }
        Command::Record { channel, out_dir } => {
            record(&connector, &settings, &channel, out_dir).await
        }
    }
}

/// Load settings under a plain warn-level subscriber writing to `writer`, so
/// ignored `ENVBUS_*` values are reported before telemetry is configured.
fn load_settings<W>(path: Option<&Path>, writer: W) -> envbus_settings::Result<EnvbusSettings>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let startup = tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_writer(writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(startup, || match path {
        Some(path) => envbus_settings::load_settings_from_path(path),
        None => envbus_settings::load_settings(),
    })
}

fn session_config(settings: &EnvbusSettings) -> SessionConfig {
    SessionConfig {
        subscribe_timeout: settings.session.subscribe_timeout(),
        action_timeout: settings.session.action_timeout(),
    }
}

async fn probe(connector: &RedisConnector, settings: &EnvbusSettings) -> anyhow::Result<()> {
    let session = Session::connect(
        connector,
        &settings.bus.address,
        &settings.bus.channel_prefix,
        &session_config(settings),
    )
    .await?;
    tracing::info!(env_id = %session.env_id(), address = %settings.bus.address, "bus reachable");
    session.close().await?;
    Ok(())
}

async fn echo(
    connector: &RedisConnector,
    settings: &EnvbusSettings,
    steps: Option<u64>,
) -> anyhow::Result<()> {
    let mut session = Session::connect(
        connector,
        &settings.bus.address,
        &settings.bus.channel_prefix,
        &session_config(settings),
    )
    .await?;
    let frame = match StateFrame::blank(settings.master.obs_size) {
        Ok(frame) => frame.encode(),
        Err(e) => {
            session.close().await?;
            return Err(e.into());
        }
    };

    let result = tokio::select! {
        r = echo_loop(&mut session, &frame, steps) => r.map(Some),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(None)
        }
    };
    session.close().await?;
    if let Some(served) = result? {
        tracing::info!(served, "echo finished");
    }
    Ok(())
}

/// Publish `frame` and wait for an action, until `steps` actions were served
/// or a new master takes over. Returns the number of actions served.
async fn echo_loop(
    session: &mut Session,
    frame: &[u8],
    steps: Option<u64>,
) -> Result<u64, SessionError> {
    let mut served = 0u64;
    while steps.map_or(true, |max| served < max) {
        session.send_state(frame).await?;
        match session.receive_act().await? {
            Received::Action(action) => {
                served += 1;
                tracing::info!(env_id = %session.env_id(), %action, step = served, "action");
            }
            Received::NewMaster => {
                tracing::info!(env_id = %session.env_id(), "new master took over, stopping");
                break;
            }
        }
    }
    Ok(served)
}

async fn watch(
    connector: &RedisConnector,
    settings: &EnvbusSettings,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut monitor = StateMonitor::establish(
        connector,
        &settings.bus.address,
        &settings.bus.channel_prefix,
        settings.session.subscribe_timeout(),
        interval,
    )
    .await?;

    let result: Result<(), SessionError> = async {
        loop {
            tokio::select! {
                report = monitor.next_report() => {
                    let report = report?;
                    println!(
                        "{} envs={} transitions/s={:.1} bytes/s={:.0}",
                        report.at.format("%H:%M:%S"),
                        report.env_ids.len(),
                        report.transitions_per_sec(),
                        report.bytes_per_sec(),
                    );
                }
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
    .await;
    monitor.close().await?;
    Ok(result?)
}

async fn record(
    connector: &RedisConnector,
    settings: &EnvbusSettings,
    channel: &str,
    out_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut recorder = FrameRecorder::establish(
        connector,
        &settings.bus.address,
        channel,
        out_dir.clone(),
        settings.session.subscribe_timeout(),
    )
    .await?;

    let result: Result<(), SessionError> = async {
        loop {
            tokio::select! {
                written = recorder.record_next(Duration::from_secs(1)) => {
                    if let Some(path) = written? {
                        tracing::debug!(path = %path.display(), "frame saved");
                    }
                }
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
    .await;
    let frames = recorder.frames_written();
    recorder.close().await?;
    tracing::info!(frames, out_dir = %out_dir.display(), "recording finished");
    Ok(result?)
}
