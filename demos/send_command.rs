//! Send one raw hex command to a switch and print the reply.
//!
//! ```text
//! cargo run --example send_command -- 192.168.0.22 52000 "FF 55 04 03 1E 03 13" [--timeout 5]
//! ```

use clap::Parser;
use std::time::Duration;
use triad_ams::{protocol, Connection, TransportConfig, VolumeCurve, DEFAULT_INPUT_COUNT};

#[derive(Parser, Debug)]
#[command(name = "send_command")]
#[command(about = "Send a raw hex command to a Triad AMS and print the response")]
struct Cli {
    /// Switch IP address or hostname
    ip: String,

    /// TCP control port
    port: u16,

    /// Command bytes, e.g. "FF 55 04 03 1E 03 13"
    hex: String,

    /// Seconds to wait for the response
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Log every frame at trace level
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .init();
    }

    let payload = protocol::parse_hex(&cli.hex)?;
    let timeout = Duration::try_from_secs_f64(cli.timeout)?;

    let transport = TransportConfig {
        read_timeout_ms: timeout.as_millis() as u64,
        ..TransportConfig::default()
    };
    let connection = Connection::with_config(
        cli.ip.as_str(),
        cli.port,
        DEFAULT_INPUT_COUNT,
        transport,
        VolumeCurve::default(),
    );

    println!("Connecting to {}:{} ...", cli.ip, cli.port);
    connection.connect().await?;

    println!("Sending ({} bytes): {}", payload.len(), protocol::to_hex(&payload));
    match connection.send_raw(&payload).await {
        Ok(text) => println!("Decoded: {}", text),
        Err(e) => {
            eprintln!("No usable response: {}", e);
            std::process::exit(1);
        }
    }

    connection.disconnect().await?;
    Ok(())
}
