//! Rust library for controlling Triad AMS audio matrix switches
//!
//! This library provides an async API for the AMS binary TCP protocol. It
//! supports:
//!
//! - Routing outputs to inputs and disconnecting them
//! - Absolute and stepped volume, mute
//! - Trigger zone relays, driven automatically as outputs are routed
//! - Paced, serialized command execution with automatic reconnect
//! - Per-output state caching with restore-on-power-on
//! - Background polling and availability change notifications
//!
//! # Quick Start
//!
//! ```no_run
//! use triad_ams::{Dispatcher, Output};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new("192.168.1.50", 52000, 8)?;
//!     dispatcher.start();
//!
//!     let _availability = dispatcher.add_availability_listener(|available| {
//!         println!("Switch available: {}", available);
//!     });
//!
//!     let kitchen = Output::new(1, "Kitchen", dispatcher.clone());
//!     let _polling = dispatcher.register_output(&kitchen);
//!
//!     kitchen.set_source(3).await;
//!     kitchen.set_volume(0.35).await;
//!     kitchen.refresh().await;
//!     println!("Kitchen is playing {:?}", kitchen.source_name());
//!
//!     kitchen.turn_off().await;
//!     dispatcher.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Direct Connection
//!
//! For scripts, [`Connection`] talks to the switch without a queue:
//!
//! ```no_run
//! use triad_ams::Connection;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::new("192.168.1.50", 52000, 8);
//!     let volume = connection.get_output_volume(1).await?;
//!     println!("Output 1 volume: {:.2}", volume);
//!     connection.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Output**: Cached per-output state and fail-soft control
//! - **Dispatcher**: Serialized, paced command queue, trigger zones, polling
//! - **Connection**: Low-level framed TCP transport
//! - **Protocol**: Command encoding and response parsing
//! - **Volume**: Device steps and the measured dB curve
//! - **Testing**: In-process device simulator

mod config;
mod connection;
mod dispatcher;
mod error;
mod output;
pub mod protocol;
mod subscription;
pub mod testing;
mod types;
mod volume;

// Public exports
pub use config::{AmsConfig, DispatcherConfig, TransportConfig, DEFAULT_INPUT_COUNT, DEFAULT_PORT};
pub use connection::Connection;
pub use dispatcher::Dispatcher;
pub use error::{AmsError, Result};
pub use output::{Output, OutputState};
pub use subscription::Subscription;
pub use types::{
    Diagnostics, InputId, Level, OutputDiagnostics, OutputId, StepDirection, StepSize, ZoneId,
};
pub use volume::{percentage_for_step, step_for_percentage, VolumeCurve, VOLUME_STEPS};
