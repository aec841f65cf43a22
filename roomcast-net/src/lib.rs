pub use self::context::{Context, FrameError};
pub use self::dialer::{DialError, Dialer, DialerTls};
pub use self::filter::{Filter, UnknownFilterError};
pub use self::io::{BoxedIo, Io};
pub use self::listener::Inbound;
pub use self::server::Server;
pub use self::tls::{load_acceptor, TlsLoadError};

mod brotli;
mod context;
mod dialer;
mod filter;
mod io;
mod listener;
mod mux;
mod reverse;
mod server;
mod tls;
