//! Sweep one output through every volume step and print what the switch
//! reports back as CSV (`step,db,raw`).
//!
//! Run against a unit that reports volume in dB to capture a calibration
//! table for [`triad_ams::VolumeCurve::from_table`].
//!
//! ```text
//! cargo run --example sweep_volume -- 192.168.0.22 52000 1 [--start 1] [--end 100] [--sleep-ms 150]
//! ```

use clap::Parser;
use std::time::Duration;
use triad_ams::protocol::Request;
use triad_ams::{Connection, DEFAULT_INPUT_COUNT};

#[derive(Parser, Debug)]
#[command(name = "sweep_volume")]
#[command(about = "Step an output through its volume range and log the reported levels")]
struct Cli {
    /// Switch IP address or hostname
    ip: String,

    /// TCP control port
    port: u16,

    /// Output to sweep
    #[arg(value_parser = clap::value_parser!(u8).range(1..=i64::from(DEFAULT_INPUT_COUNT)))]
    output: u8,

    /// First step
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=100))]
    start: u8,

    /// Last step
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u8).range(1..=100))]
    end: u8,

    /// Pause after each command
    #[arg(long, default_value_t = 150)]
    sleep_ms: u64,
}

/// Number after the last `:` in `Volume : -21.2`, if it is one
fn reported_db(text: &str) -> Option<f64> {
    text.rsplit(':').next()?.trim().parse().ok()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if cli.start > cli.end {
        return Err(format!("--start {} is past --end {}", cli.start, cli.end).into());
    }

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let pause = Duration::from_millis(cli.sleep_ms);
    let output = cli.output;
    let connection = Connection::new(cli.ip.as_str(), cli.port, DEFAULT_INPUT_COUNT);
    connection.connect().await?;

    println!("step,db,raw");
    for step in cli.start..=cli.end {
        let set = Request::SetVolume { output, value: step };
        connection.send_command(&set.encode()?, set.expect()).await?;
        tokio::time::sleep(pause).await;

        let get = Request::GetVolume { output };
        let raw = connection.send_command(&get.encode()?, get.expect()).await?;
        let db = reported_db(&raw).map(|db| db.to_string()).unwrap_or_default();
        println!("{},{},{}", step, db, raw);
        tokio::time::sleep(pause).await;
    }

    connection.disconnect().await?;
    Ok(())
}
