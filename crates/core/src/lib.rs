pub mod error;
pub mod events;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{Result, SessionError, StreamError};
pub use events::ServerEvent;
pub use media::{
    AudioBuffer, ConfigKey, EncodedUnit, PixelFormat, RawFrame, StreamKind, VideoBuffer,
    timestamp_us,
};
pub use server::{BatteryStatus, Credentials, Location, Server, ServerConfig};
