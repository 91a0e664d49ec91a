//!
//! This library provides communication with an Owon B35 family digital
//! multimeter over Bluetooth LE.
//!
//! <br>
//!
//! # Details
//!
//! - The meter does not advertise its service, so every peripheral in range
//!   is connected once and checked for the multimeter service `FFF0`.
//!
//! - Each notification on characteristic `FFF4` carries one 6 byte frame,
//!   decoded into a [`Reading`].
//!
//! - Basic setup, with the `ble` feature enabled
//!
//!   ```no_run
//!   # #[cfg(feature = "ble")]
//!   # async fn run() -> owonctl::Result<()> {
//!   use owonctl::{ble::BtleTransport, Config, Monitor};
//!
//!   let (transport, events) = BtleTransport::first_adapter().await?;
//!   let monitor = Monitor::new(transport, Config::default()).spawn(events);
//!   monitor.set_scanning(true)?;
//!   if let Some(device) = monitor.next_device().await {
//!       while let Some(reading) = device.next_reading().await {
//!           println!("{}", reading);
//!       }
//!   }
//!   # Ok(())
//!   # }
//!   ```
//!
//! - Decoding a captured frame
//!
//!   ```
//!   let reading = owonctl::proto::decode(&[0x23, 0x00, 0x00, 0x00, 0x0a, 0x00], chrono::Utc::now())?;
//!   assert_eq!(reading.to_string(), "0.010 V DC");
//!   # Ok::<(), owonctl::proto::DecodeError>(())
//!   ```
//!
//! # Supported devices
//!
//!  * Owon B35
//!  * Owon B35T
//!

#[cfg(feature = "ble")]
pub mod ble;
pub mod device;
pub mod measurement;
pub mod monitor;
pub mod proto;
pub mod rawframe;
pub mod scanner;
pub mod transport;

pub use device::{DeviceSession, SessionHandle};
pub use measurement::Reading;
pub use monitor::{Monitor, MonitorHandle};
pub use proto::Result;
pub use scanner::Scanner;
pub use transport::{Transport, TransportEvent};

/// Default capacity of the reading broadcast per session.
pub const DEFAULT_READING_CAPACITY: usize = 64;

/// Default capacity of the device discovery broadcast.
pub const DEFAULT_DEVICE_CAPACITY: usize = 4;

/// Tunables shared by scanner and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Readings buffered per subscriber before it starts lagging.
    pub reading_capacity: usize,
    /// Discovered devices buffered per subscriber.
    pub device_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reading_capacity: DEFAULT_READING_CAPACITY,
            device_capacity: DEFAULT_DEVICE_CAPACITY,
        }
    }
}
