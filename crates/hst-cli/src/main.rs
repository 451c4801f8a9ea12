//! HST - command-line access to the motion-control board

use anyhow::Context;
use clap::Parser;
use hst_protocol::datalink::BAUD_RATE;
use hst_protocol::sim::{SimulatedDevice, SimulatedLink};
use hst_protocol::{Command, Datalink, DatalinkConfig, PfmMask};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hst", version, about = "Send commands to an HST motion-control board")]
struct Cli {
    /// Serial port of the board
    #[arg(long, env = "HST_PORT", default_value = "/dev/ttyUSB0")]
    port: String,

    #[arg(long, env = "HST_BAUDRATE", default_value_t = BAUD_RATE)]
    baudrate: u32,

    /// Time to wait for each reply
    #[arg(long, env = "HST_TIMEOUT_MS", default_value_t = 2000)]
    timeout_ms: u64,

    /// Delay between checks for a reply
    #[arg(long, env = "HST_POLL_MS", default_value_t = 1)]
    poll_ms: u64,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Talk to an in-memory simulated board instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Number of times to run the command
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Pause between repeated commands
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Command name, e.g. GET_IMU_MEASUREMENT or set-target-freq
    #[arg(required_unless_present = "list_ports")]
    command: Option<String>,

    /// Command arguments; PFM selectors may be given as letters (x, yz, xyza)
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,
}

impl Cli {
    fn config(&self) -> DatalinkConfig {
        DatalinkConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: Duration::from_millis(self.poll_ms),
        }
    }
}

/// Parse one argument as an integer, falling back to a PFM selector
fn parse_arg(arg: &str) -> anyhow::Result<i64> {
    if let Ok(value) = arg.parse::<i64>() {
        return Ok(value);
    }
    if let Some(hex) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).with_context(|| format!("Invalid hex value {arg:?}"));
    }
    let mask: PfmMask = arg
        .parse()
        .with_context(|| format!("Argument {arg:?} is neither a number nor a PFM selector"))?;
    Ok(i64::from(mask.bits()))
}

fn open_datalink(cli: &Cli) -> anyhow::Result<Datalink> {
    let datalink = if cli.simulate {
        tracing::info!("Using simulated board");
        let link = SimulatedLink::new(SimulatedDevice::new());
        Datalink::from_io(link.reader, link.writer)?
    } else {
        Datalink::connect(&cli.port, cli.baudrate)
            .with_context(|| format!("Failed to open {}", cli.port))?
    };
    Ok(datalink.with_config(cli.config()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hst_cli=info,hst_protocol=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        for port in Datalink::available_ports()? {
            println!("{}", port.display());
        }
        return Ok(());
    }

    let name = cli.command.as_deref().context("No command given")?;
    let args = cli
        .args
        .iter()
        .map(|arg| parse_arg(arg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let command = Command::from_args(name, &args)?;
    tracing::debug!("Parsed command: {:?}", command);

    let datalink = open_datalink(&cli)?;
    let config = *datalink.config();

    let mut missed = 0;
    for i in 0..cli.repeat {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
        }
        let result = datalink
            .transact_with(&command, config.timeout, config.poll_interval)
            .await?;
        if !result.received {
            missed += 1;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    datalink.disconnect();

    if missed > 0 {
        anyhow::bail!("No reply to {} of {} requests", missed, cli.repeat);
    }
    Ok(())
}
