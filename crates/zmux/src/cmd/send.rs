use std::fs;
use std::thread;

use zmux_session::{Channel, Mux, MuxConfig, MuxError};

use crate::cmd::{parse_endpoint, SendArgs};
use crate::exit::{io_error, mux_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_reports, ChannelReport, OutputFormat};

pub fn run(args: SendArgs, config: MuxConfig, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;
    let endpoint = parse_endpoint(&args.endpoint)?;
    let stream = endpoint
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    let mux = Mux::with_config(stream, config).map_err(|err| mux_error("mux start failed", err))?;

    let results: Vec<Result<ChannelReport, MuxError>> = thread::scope(|s| {
        let workers: Vec<_> = (0..args.channels)
            .map(|_| s.spawn(|| exchange(&mux, &payload, args.wait)))
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(MuxError::Terminated(zmux_session::Termination::Transport(
                        "channel worker panicked".to_string(),
                    )))
                })
            })
            .collect()
    });

    let cause = mux.shutdown();
    tracing::debug!(?cause, "connection closed");

    let mut reports = Vec::with_capacity(results.len());
    for result in results {
        reports.push(result.map_err(|err| mux_error("channel failed", err))?);
    }
    reports.sort_by_key(|report| report.channel);
    print_reports(&reports, format);
    Ok(SUCCESS)
}

/// Open one channel, send `payload` and, if asked, read the echo back.
fn exchange(mux: &Mux, payload: &[u8], wait: bool) -> Result<ChannelReport, MuxError> {
    let channel = mux.open()?;
    tracing::debug!(channel = channel.id(), size = payload.len(), "sending payload");

    channel.write(payload)?;
    let mut report = ChannelReport {
        bytes_sent: payload.len() as u64,
        ..ChannelReport::new(channel.id())
    };

    if wait {
        let echoed = read_exactly(&channel, payload.len())?;
        report = report.with_received(echoed);
    }
    channel.close()?;
    Ok(report)
}

/// Read until `len` bytes arrived or the peer closed the channel.
fn read_exactly(channel: &Channel, len: usize) -> Result<Vec<u8>, MuxError> {
    let mut out = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match channel.read(&mut out[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    out.truncate(filled);
    Ok(out)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Err(CliError::new(USAGE, "either --data or --file is required"))
}
