//! Multi-channel example: two channels share one TCP connection and are
//! echoed independently.
//!
//! Run with:
//!   cargo run --example multi-channel

use std::io::{Read, Write};
use std::thread;

use zmux::transport::Endpoint;
use zmux::Mux;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = "127.0.0.1:0".parse::<Endpoint>()?.bind()?;
    let endpoint = listener.local_endpoint();

    let server = thread::spawn(
        move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let mux = Mux::new(listener.accept()?)?;
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let mut channel = mux.accept()?;
                    eprintln!("[server] accepted channel {}", channel.id());
                    Ok(thread::spawn(move || {
                        let mut received = Vec::new();
                        let _ = channel.read_to_end(&mut received);
                        eprintln!(
                            "[server] channel {} sent {:?}",
                            channel.id(),
                            String::from_utf8_lossy(&received)
                        );
                    }))
                })
                .collect::<Result<_, zmux::MuxError>>()?;
            for worker in workers {
                let _ = worker.join();
            }
            mux.shutdown();
            Ok(())
        },
    );

    let mux = Mux::new(endpoint.connect()?)?;
    let mut commands = mux.open()?;
    let mut data = mux.open()?;

    // Interleaved writes still arrive separated per channel.
    commands.write_all(b"{\"action\":\"ping\"}")?;
    data.write_all(b"first chunk, ")?;
    commands.close()?;
    data.write_all(b"second chunk")?;
    data.close()?;
    mux.shutdown();

    server
        .join()
        .map_err(|_| "server thread panicked")?
        .map_err(|err| err.to_string())?;
    Ok(())
}
