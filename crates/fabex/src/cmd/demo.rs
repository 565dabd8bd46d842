use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::thread;

use fabex_session::{run_client, run_server, Listener, SessionConfig};
use tracing::debug;

use crate::cmd::DemoArgs;
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_report, OutputFormat};

/// Server on a spawned thread, client on this one. The server hands its
/// listen address over a channel once it is listening.
pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let mode = args.exchange.mode.into();
    let ep_attr = args.exchange.ep_attr()?;
    let demo = args.exchange.demo_config();

    let mut server_config = SessionConfig::default()
        .with_mode(mode)
        .with_port(args.port)
        .with_bind_addr(Ipv4Addr::LOCALHOST.to_string());
    server_config.ep_attr = ep_attr;
    let mut client_config = SessionConfig::default().with_mode(mode);
    client_config.ep_attr = ep_attr;

    let (addr_tx, addr_rx) = mpsc::channel();
    let server_demo = demo.clone();
    let server = thread::Builder::new()
        .name("fabex-demo-server".to_string())
        .spawn(move || {
            let listener = match Listener::bind(&server_config) {
                Ok(listener) => listener,
                Err(err) => {
                    let _ = addr_tx.send(None);
                    return Err(err);
                }
            };
            let _ = addr_tx.send(Some(listener.local_addr()));
            run_server(listener, &server_demo)
        })
        .map_err(|err| CliError::new(INTERNAL, format!("server thread: {err}")))?;

    let addr: Option<SocketAddrV4> = addr_rx.recv().unwrap_or(None);
    let Some(addr) = addr else {
        return match server.join() {
            Ok(Err(err)) => Err(session_error(err)),
            _ => Err(CliError::new(INTERNAL, "server exited before listening")),
        };
    };
    debug!(%addr, "server listening");

    let client = run_client(addr, &client_config, &demo);
    let server = server
        .join()
        .map_err(|_| CliError::new(INTERNAL, "server thread panicked"))?;

    let client = client.map_err(session_error)?;
    let server = server.map_err(session_error)?;
    print_report(&server, format);
    print_report(&client, format);
    Ok(SUCCESS)
}
