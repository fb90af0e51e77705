mod client;
mod command;
mod config;
mod diff;
mod error;
mod flight;
mod logger;
mod protocol;
mod registry;
mod sync;
mod token;
mod transport;
mod types;

pub use client::{MyQClient, MyQClientBuilder};
pub use config::{CommandPolicy, RetryPolicy, SyncPolicy};
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use registry::Snapshot;
pub use types::*;
