//! # localtuya
//!
//! Asynchronous client for the Tuya local LAN protocol (versions 3.1 and 3.3).
//! Controls and monitors Tuya-compatible devices without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use localtuya::{Version, connect};
//!
//! # async fn run() -> localtuya::error::Result<()> {
//! let device = connect("192.168.1.20", "DEVICE_ID", "0123456789abcdef", Version::V3_3, |status| {
//!     println!("status: {}", status);
//! })
//! .await?;
//! device.set_dps(true, 1).await?;
//! device.close().await;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod config;
pub mod crypto;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod protocol;

pub use config::DeviceConfig;
pub use device::{ConnectionState, Device, DeviceBuilder, connect};
pub use error::TuyaError;
pub use protocol::{Command, CommandType, DeviceType, Version};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
