// gatt-session - BLE central session manager

pub mod ble;
pub mod config;
pub mod event;
pub mod session;
pub mod types;

pub use ble::transport::Platform;
pub use ble::PlatformError;
pub use config::{ConfigError, SessionConfig};
pub use event::{event_channel, Event, EventSink};
pub use session::{SessionError, SessionManager};
pub use types::{address_to_id, BleUuid, RadioState};
