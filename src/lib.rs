//! # tuyalan
//!
//! A local-network protocol engine for Tuya-compatible Wi-Fi smart devices.
//!
//! `tuyalan` controls and monitors Tuya-compatible smart devices (plugs,
//! switches, lights, gateways, etc.) directly over the local network,
//! eliminating the need for a round-trip through Tuya's cloud.
//!
//! ## Key Features
//! - **Local LAN Control**: Direct device communication over the local network.
//! - **Asynchronous Architecture**: Built on `tokio` for modern, non-blocking applications.
//! - **Extensive Protocol Support**: Compatibility with versions 3.1, 3.2, 3.3, 3.4, and 3.5.
//! - **Automated Discovery**: Integrated UDP scanning (Active & Passive) for device identification.
//! - **Gateway Integration**: Management of sub-devices (Zigbee, Bluetooth) via Tuya Gateways.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalan::Device;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> tuyalan::Result<()> {
//!     // "Auto" can be used for IP and Version if the device is discoverable.
//!     let device = Device::new("DEVICE_ID", "DEVICE_IP", "LOCAL_KEY", "3.3");
//!
//!     // Set DP 1 (power) to true and wait for the device's acknowledgement.
//!     device.set_value(1, json!(true)).await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
pub mod macros;
pub mod crypto;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod payload;
pub mod protocol;
pub mod scanner;

pub use device::{Device, DeviceListener};
pub use error::{ErrorKind, Result, TuyaError};
pub use manager::{Manager, ManagerEvent};
pub use protocol::{CommandType, TuyaMessage, Version};
pub use scanner::Scanner;
