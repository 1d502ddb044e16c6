use ctxbridge_channel::handshake::DEFAULT_RETRY_INTERVAL;
use ctxbridge_channel::timeout::DEFAULT_REQUEST_TIMEOUT;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("ctxbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: ctxbridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("CTXBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("channels: window-tab, window-iframe, port-extension, port-userscript, stdio");
    println!(
        "defaults: request_timeout={}ms, handshake_retry={}ms",
        DEFAULT_REQUEST_TIMEOUT.as_millis(),
        DEFAULT_RETRY_INTERVAL.as_millis()
    );

    Ok(SUCCESS)
}
