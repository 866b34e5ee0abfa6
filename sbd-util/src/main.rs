#![forbid(unsafe_code)]

use crate::console::StdioConsole;
use crate::gpio::SysfsGpio;
use clap::Parser;
use color_eyre::eyre::{Context, Result, eyre};
use orb_sbd::{Config, OutputLine, Session, SystemClock};
use serialport::SerialPort;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};

mod console;
mod gpio;
mod logging;

/// Utility args
#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Iridium SBD modem utility",
    long_about = "Send and receive short burst data messages through an Iridium modem"
)]
struct Args {
    /// Serial device the modem is attached to
    #[clap(long, env = "SBD_PORT", default_value = "/dev/ttyUSB0")]
    port: String,
    /// Serial baud rate
    #[clap(long, env = "SBD_BAUD", default_value = "19200")]
    baud: u32,
    /// Sysfs number of the GPIO powering the modem
    #[clap(long, env = "SBD_POWER_GPIO", default_value = None)]
    power_gpio: Option<u32>,
    /// Sysfs number of the GPIO driving the modem's sleep pin
    #[clap(long, env = "SBD_SLEEP_GPIO", default_value = None)]
    sleep_gpio: Option<u32>,
    /// Overall mailbox check deadline, in seconds
    #[clap(long, env = "SBD_TRANSMISSION_TIMEOUT", default_value = "300")]
    transmission_timeout: u64,
    /// Network service wait deadline, in seconds
    #[clap(long, env = "SBD_NETWORK_TIMEOUT", default_value = "120")]
    network_timeout: u64,
    /// Wait before the second power-up attempt, in seconds
    #[clap(long, env = "SBD_RETRY_WAIT", default_value = "30")]
    retry_wait: u64,
    /// Mirror the modem exchange on stdout
    #[clap(long, default_value = "false")]
    console: bool,
    /// Print results as JSON
    #[clap(long, default_value = "false")]
    json: bool,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Print the modem's IMEI, manufacturer and model
    #[clap(action)]
    Info,
    /// Wait for network service
    #[clap(action)]
    Network,
    /// Send a text message (at most 120 bytes)
    #[clap(action)]
    SendText { message: String },
    /// Send a text message and print the latest inbound message
    #[clap(action)]
    SendReceive { message: String },
    /// Send a hex encoded binary message (at most 340 bytes)
    #[clap(action)]
    SendBinary { payload: String },
    /// Send a hex encoded binary message and print the latest inbound message
    #[clap(action)]
    SendReceiveBinary { payload: String },
    /// Drive the power line directly, without talking to the modem
    #[clap(subcommand)]
    Power(Power),
}

#[derive(Parser, Debug, Clone, Copy, PartialEq)]
enum Power {
    #[clap(action)]
    On,
    #[clap(action)]
    Off,
}

type CliSession = Session<Box<dyn SerialPort>, StdioConsole, SystemClock>;

fn open_session(args: &Args) -> Result<CliSession> {
    let modem = serialport::new(&args.port, args.baud)
        .timeout(Duration::from_millis(100))
        .open()
        .wrap_err_with(|| format!("failed to open serial port '{}'", args.port))?;
    let console = StdioConsole::spawn().wrap_err("failed to start console")?;
    let power_line = args
        .power_gpio
        .map(|n| SysfsGpio::output(n).map(|gpio| Box::new(gpio) as Box<dyn OutputLine>))
        .transpose()?;
    let sleep_line = args
        .sleep_gpio
        .map(|n| SysfsGpio::output(n).map(|gpio| Box::new(gpio) as Box<dyn OutputLine>))
        .transpose()?;
    let config = Config::builder()
        .power_up_retry_wait(Duration::from_secs(args.retry_wait))
        .transmission_timeout(Duration::from_secs(args.transmission_timeout))
        .network_check_timeout(Duration::from_secs(args.network_timeout))
        .console_print(args.console)
        .build();
    debug!(?config, port = %args.port, baud = args.baud, "opening session");

    Ok(Session::builder()
        .modem(modem)
        .console(console)
        .clock(SystemClock::new())
        .maybe_power_line(power_line)
        .maybe_sleep_line(sleep_line)
        .config(config)
        .build())
}

fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    hex::decode(payload.trim()).wrap_err("payload is not valid hex")
}

fn print_inbound(json: bool, inbound: Option<String>) {
    if json {
        println!("{}", serde_json::json!({ "inbound": inbound }));
        return;
    }
    match inbound {
        Some(inbound) => println!("{inbound}"),
        None => println!("no inbound message"),
    }
}

fn execute(args: &Args) -> Result<()> {
    let mut session = open_session(args)?;

    match &args.subcmd {
        SubCommand::Info => {
            let info = session.info()?;
            debug!("{:?}", info);
            if args.json {
                println!("{}", serde_json::to_string(&info)?);
            } else {
                println!("IMEI:         {}", info.imei);
                println!("Manufacturer: {}", info.manufacturer);
                println!("Model:        {}", info.model);
            }
        }
        SubCommand::Network => {
            let available = session.network_status()?;
            if args.json {
                println!("{}", serde_json::json!({ "network": available }));
            } else if available {
                println!("network service available");
            } else {
                return Err(eyre!("no network service"));
            }
        }
        SubCommand::SendText { message } => session.send_text(message)?,
        SubCommand::SendReceive { message } => {
            let inbound = session.send_receive_text(message)?;
            print_inbound(args.json, inbound);
        }
        SubCommand::SendBinary { payload } => {
            session.send_binary(&decode_payload(payload)?)?;
        }
        SubCommand::SendReceiveBinary { payload } => {
            let inbound = session.send_receive_binary(&decode_payload(payload)?)?;
            print_inbound(args.json, inbound.map(hex::encode));
        }
        SubCommand::Power(Power::On) => session.enable_power()?,
        SubCommand::Power(Power::Off) => session.disable_power()?,
    }
    debug!(mailbox = ?session.mailbox(), "done");

    Ok(())
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let args = Args::parse();
    logging::init(args.json)?;

    match execute(&args) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(report) => match report.downcast_ref::<orb_sbd::Error>() {
            Some(err) => {
                error!("{err}");
                Ok(ExitCode::from(err.code()))
            }
            None => Err(report),
        },
    }
}
