use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("zmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: zmux");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("ZMUX_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("header_size: {}", zmux_frame::HEADER_SIZE);
    println!(
        "defaults: send_buffer={} recv_buffer={} max_payload={}",
        zmux_session::DEFAULT_SEND_BUFFER_SIZE,
        zmux_session::DEFAULT_RECV_BUFFER_SIZE,
        zmux_frame::DEFAULT_MAX_PAYLOAD
    );

    Ok(SUCCESS)
}
