//! # Luxio Control Library
//!
//! `luxio-control-lib` finds Luxio LED controllers on the local network and
//! keeps a live, observable copy of their state. Devices are discovered over
//! mDNS, on their own setup access point, or as an in-memory demo device, and
//! are deduplicated by hardware id no matter how often or where they are seen.
//!
//! ## Features
//!
//! - Multi-strategy discovery merged into one registry
//! - Per-device connections fed by the device's event stream, or by polling
//! - Typed topic listeners for LED state, LED configuration, system and Wi-Fi
//! - Optimistic, throttled commands suitable for sliders and color pickers
//!
//! ## Example
//!
//! ```no_run
//! use luxio_control_lib::{ClientConfig, DiscoveryOptions, LuxioContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = LuxioContext::new(ClientConfig::default());
//!     let _scan = context.start_discovery(DiscoveryOptions::default());
//!
//!     for device in context.discovery().discover_once(Duration::from_secs(5)).await {
//!         device.connect().await?;
//!         device.commands().set_brightness(128).await?;
//!         println!("{} is at {}", device.name(), device.address());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

pub mod config;
pub mod context;

// HTTP transport for Luxio firmware: snapshot fetches, the execute endpoint
// and the server-sent event stream.
pub mod control_interface;

pub mod device;
pub mod discovery;
pub mod error;

// Colors, gradients and strip configuration.
pub mod led;

pub mod registry;
pub mod util;

pub use config::{ClientConfig, PushMode};
pub use context::LuxioContext;
pub use device::{ConnectionState, Device, DeviceDescriptor, DeviceSnapshot, TransportKind};
pub use discovery::{DiscoveryOptions, ScanGuard, StrategyKind};
pub use error::{CommandError, ConnectionError, DiscoveryError, ValidationError};
