use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use fabex_session::{CommMode, DemoConfig, DEFAULT_PORT};
use fabex_transport::EpAttr;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod client;
pub mod demo;
pub mod server;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen for one connection and run the server side of the exchange.
    Server(ServerArgs),
    /// Connect to a server and run the client side of the exchange.
    Client(ClientArgs),
    /// Run server and client against each other in one process.
    Demo(DemoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Server(args) => server::run(args, format),
        Command::Client(args) => client::run(args, format),
        Command::Demo(args) => demo::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ModeArg {
    OneWay,
    TwoWay,
}

impl From<ModeArg> for CommMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::OneWay => CommMode::OneWay,
            ModeArg::TwoWay => CommMode::TwoWay,
        }
    }
}

/// Options both roles share.
#[derive(Args, Debug)]
pub struct ExchangeArgs {
    /// Communication mode.
    #[arg(long, value_enum, default_value = "two-way")]
    pub mode: ModeArg,
    /// Elements in the array each side sends.
    #[arg(long, default_value_t = 70)]
    pub count: usize,
    /// Largest element count accepted from the peer.
    #[arg(long, default_value_t = fabex_session::DEFAULT_MAX_ELEMENTS)]
    pub max_elements: usize,
    /// Largest message one post may carry; larger buffers are chunked.
    #[arg(long, value_name = "BYTES")]
    pub max_msg_size: Option<usize>,
}

impl ExchangeArgs {
    pub fn demo_config(&self) -> DemoConfig {
        DemoConfig {
            max_elements: self.max_elements,
            ..DemoConfig::default().with_element_count(self.count)
        }
    }

    pub fn ep_attr(&self) -> CliResult<Option<EpAttr>> {
        match self.max_msg_size {
            None => Ok(None),
            Some(0) => Err(CliError::new(USAGE, "--max-msg-size must be greater than zero")),
            Some(size) => Ok(Some(EpAttr {
                max_msg_size: size,
                ..EpAttr::default()
            })),
        }
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on.
    #[arg(long, short = 'p', env = "FABEX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Local address to bind (default: all interfaces).
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
    /// How long one wait for the connection confirmation lasts (e.g. 500ms, 2s).
    #[arg(long, default_value = "500ms")]
    pub confirm_timeout: String,
    /// Give up when no client connects within this time.
    #[arg(long)]
    pub request_timeout: Option<String>,
    #[command(flatten)]
    pub exchange: ExchangeArgs,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server IPv4 address.
    #[arg(long, short = 'a', env = "FABEX_ADDR", default_value = "127.0.0.1")]
    pub addr: String,
    /// Server port.
    #[arg(long, short = 'p', env = "FABEX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[command(flatten)]
    pub exchange: ExchangeArgs,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Port the in-process server listens on (0 picks one).
    #[arg(long, short = 'p', default_value_t = 0)]
    pub port: u16,
    #[command(flatten)]
    pub exchange: ExchangeArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
