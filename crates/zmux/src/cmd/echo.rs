use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use zmux_session::{Channel, Mux, MuxConfig, MuxError};

use crate::cmd::{parse_endpoint, EchoArgs};
use crate::exit::{mux_error, transport_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_reports, ChannelReport, OutputFormat};

/// How often a blocked accept re-checks the Ctrl-C flag.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

const ECHO_CHUNK: usize = 16 * 1024;

pub fn run(args: EchoArgs, config: MuxConfig, format: OutputFormat) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let listener = endpoint
        .bind()
        .map_err(|err| transport_error("bind failed", err))?;
    tracing::info!(endpoint = %listener.local_endpoint(), "echo server listening");

    let stream = listener
        .accept()
        .map_err(|err| transport_error("accept failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(Arc::clone(&running))?;

    let config = MuxConfig {
        handshake_timeout_ms: config
            .handshake_timeout_ms
            .or(Some(ACCEPT_POLL.as_millis() as u64)),
        ..config
    };
    let mux = Mux::with_config(stream, config).map_err(|err| mux_error("mux start failed", err))?;

    let mut workers: Vec<JoinHandle<ChannelReport>> = Vec::new();
    while running.load(Ordering::SeqCst) && args.max_channels.is_none_or(|max| workers.len() < max)
    {
        let channel = match mux.accept() {
            Ok(channel) => channel,
            Err(MuxError::Timeout(_)) => continue,
            Err(MuxError::Terminated(cause)) if !cause.is_failure() => {
                tracing::info!(%cause, "connection finished");
                break;
            }
            Err(err) => return Err(mux_error("accept failed", err)),
        };

        tracing::info!(channel = channel.id(), "echoing channel");
        let worker = thread::Builder::new()
            .name(format!("echo-{}", channel.id()))
            .spawn(move || echo_channel(channel))
            .map_err(|err| CliError::new(INTERNAL, format!("spawn failed: {err}")))?;
        workers.push(worker);
    }

    if !running.load(Ordering::SeqCst) {
        tracing::info!("interrupted; closing connection");
        mux.close();
    }

    let reports: Vec<ChannelReport> = workers
        .into_iter()
        .filter_map(|worker| worker.join().ok())
        .collect();
    mux.shutdown();

    print_reports(&reports, format);
    if reports.iter().any(|report| report.error.is_some()) {
        return Ok(FAILURE);
    }
    Ok(SUCCESS)
}

/// Copy everything read from `channel` back into it until the peer closes.
fn echo_channel(channel: Channel) -> ChannelReport {
    let mut report = ChannelReport::new(channel.id());
    let mut received = 0u64;
    let mut buf = vec![0u8; ECHO_CHUNK];

    let outcome = loop {
        let n = match channel.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err),
        };
        received += n as u64;
        if let Err(err) = channel.write(&buf[..n]) {
            break Err(err);
        }
        report.bytes_sent += n as u64;
    };

    report.bytes_received = Some(received);
    match outcome {
        Err(err) if !peer_went_away(&err) => {
            tracing::warn!(channel = channel.id(), error = %err, "echo stopped");
            report.error = Some(err.to_string());
        }
        Err(err) => tracing::debug!(channel = channel.id(), reason = %err, "echo finished early"),
        Ok(()) => {}
    }
    if let Err(err) = channel.close() {
        tracing::debug!(channel = channel.id(), error = %err, "close failed");
    }
    report
}

/// The peer closed the channel or the connection without anything failing.
fn peer_went_away(err: &MuxError) -> bool {
    match err {
        MuxError::ChannelClosed(_) => true,
        MuxError::Terminated(cause) => !cause.is_failure(),
        _ => false,
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
