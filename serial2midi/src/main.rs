use std::{process::ExitCode, sync::Arc};

use clap::{ArgAction, Parser};
use tokio::signal::unix::{self, SignalKind};
use tracing_subscriber::filter::LevelFilter;

use serial2midi::{
    config::{self, BridgeConfig},
    discovery::{self, SystemPorts},
    endpoint::MidiEndpoint,
    matcher::Matcher,
    supervisor::{StopHandle, StopReason, Supervisor},
    tracing::{self, prelude::*},
    transport::SerialConnector,
};

/// Bridge a USB serial MIDI device to a virtual MIDI port.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Virtual MIDI device name
    #[arg(long, default_value = config::DEFAULT_NAME)]
    name: String,

    /// Serial bit rate
    #[arg(long, default_value_t = config::DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Delay between retries and reconnects
    #[arg(long, default_value_t = 0.3, value_name = "SECONDS")]
    sleep_interval: f64,

    /// Only use devices matching this expression, e.g. "usb_vid == 0x2e8a"
    #[arg(long = "match", value_name = "EXPR")]
    matcher: Option<Matcher>,

    /// Print matching devices and exit
    #[arg(long)]
    list: bool,

    /// With --list, print one JSON object per device
    #[arg(long, requires = "list")]
    json: bool,

    /// Serial device to use instead of discovery (e.g. /dev/ttyUSB0)
    #[arg(short = 's', long = "serial", value_name = "DEVICE")]
    serial_device: Option<String>,

    /// Appended to the MIDI device name as NAME-SUFFIX
    #[arg(long)]
    midi_suffix: Option<String>,

    /// Use exactly this MIDI device name
    #[arg(long = "force-midi-name", value_name = "NAME")]
    forced_midi_name: Option<String>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::WARN,
            (false, 0) => LevelFilter::INFO,
            (false, 1) => LevelFilter::DEBUG,
            (false, _) => LevelFilter::TRACE,
        }
    }

    fn into_config(self) -> serial2midi::error::Result<BridgeConfig> {
        let config = BridgeConfig {
            name: self.name,
            baud_rate: self.baud_rate,
            sleep_interval: BridgeConfig::sleep_interval_from_secs(self.sleep_interval)?,
            matcher: self.matcher.unwrap_or_default(),
            manual_device: self.serial_device,
            endpoint_suffix: self.midi_suffix,
            forced_endpoint_name: self.forced_midi_name,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing::init_journald_or_stdout(cli.log_level());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.list {
        let matcher = cli.matcher.unwrap_or_default();
        discovery::list_devices(Arc::new(SystemPorts), matcher, cli.json, &mut std::io::stdout())
            .await?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = cli.into_config()?;
    if let Some(expr) = config.matcher.source() {
        debug!(expr, "Device match expression.");
    }

    let supervisor = Supervisor::new(config, SerialConnector, SystemPorts);
    forward_signals(supervisor.stop_handle())?;
    info!("Started.");
    info!("For debugging, set RUST_LOG=serial2midi=debug or trace.");

    let reason = supervisor.run(MidiEndpoint::open).await?;
    info!(%reason, "Exiting.");

    Ok(match reason {
        StopReason::Requested => ExitCode::SUCCESS,
        StopReason::OutboundFailure => ExitCode::FAILURE,
    })
}

// SIGINT, SIGTERM, and SIGHUP all request the same stop. Repeated signals
// are harmless.
fn forward_signals(stop: StopHandle) -> std::io::Result<()> {
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sighup = unix::signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(_) = sigint.recv() => "SIGINT",
                Some(_) = sigterm.recv() => "SIGTERM",
                Some(_) = sighup.recv() => "SIGHUP",
                else => break,
            };
            info!("Received {}.", name);
            stop.stop(StopReason::Requested);
        }
    });
    Ok(())
}
