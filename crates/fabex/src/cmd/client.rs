use std::net::{Ipv4Addr, SocketAddrV4};

use fabex_session::{run_client, SessionConfig};

use crate::cmd::ClientArgs;
use crate::exit::{session_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_report, OutputFormat};

pub fn run(args: ClientArgs, format: OutputFormat) -> CliResult<i32> {
    let addr: Ipv4Addr = args
        .addr
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid IPv4 address: {}", args.addr)))?;
    let dest = SocketAddrV4::new(addr, args.port);

    let mut config = SessionConfig::default().with_mode(args.exchange.mode.into());
    config.ep_attr = args.exchange.ep_attr()?;

    let report =
        run_client(dest, &config, &args.exchange.demo_config()).map_err(session_error)?;
    print_report(&report, format);
    Ok(SUCCESS)
}
