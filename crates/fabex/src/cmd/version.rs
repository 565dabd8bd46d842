use fabex_transport::providers;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("fabex {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: fabex");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("FABEX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("wire_protocol: {} {}", fabex_wire::PROTOCOL_NAME, fabex_wire::PROTOCOL_VERSION);
    for provider in providers() {
        println!(
            "provider: {} (caps {:?}, max_msg_size {})",
            provider.name, provider.caps, provider.max_msg_size
        );
    }

    Ok(SUCCESS)
}
