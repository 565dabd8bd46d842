use fabex_session::{run_server, Listener, SessionConfig};
use tracing::info;

use crate::cmd::{parse_duration, ServerArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat};

pub fn run(args: ServerArgs, format: OutputFormat) -> CliResult<i32> {
    let config = server_config(&args)?;
    let listener = Listener::bind(&config).map_err(session_error)?;
    info!(addr = %listener.local_addr(), "waiting for one client");

    let report = run_server(listener, &args.exchange.demo_config()).map_err(session_error)?;
    print_report(&report, format);
    Ok(SUCCESS)
}

pub(crate) fn server_config(args: &ServerArgs) -> CliResult<SessionConfig> {
    let defaults = SessionConfig::default();
    let mut config = defaults
        .clone()
        .with_mode(args.exchange.mode.into())
        .with_port(args.port)
        .with_confirm(
            parse_duration(&args.confirm_timeout)?,
            defaults.confirm_retries,
        );
    if let Some(bind) = &args.bind {
        config = config.with_bind_addr(bind.clone());
    }
    if let Some(timeout) = &args.request_timeout {
        config = config.with_request_timeout(parse_duration(timeout)?);
    }
    config.ep_attr = args.exchange.ep_attr()?;
    Ok(config)
}
