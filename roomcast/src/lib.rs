pub use self::config::{Config, ConfigError, InboundConfig};
pub use self::relay::{Relay, ServeError};
pub use self::rooms::{Dial, RoomConn, RoomEvent};

mod arbiter;
pub mod config;
mod handlers;
pub mod logging;
mod relay;
mod rooms;
pub mod upstream;
