pub mod config;
pub mod connector;
pub mod error;
pub mod http;
pub mod logging;
pub mod peek;
pub mod probe;
pub mod pump;
pub mod server;
pub mod session;
pub mod telemetry;

pub use config::{Config, ConfigOverrides};
pub use connector::RelayOptions;
pub use error::RelayError;
pub use server::RelayServer;
