pub mod bootstrap;
pub mod client;
pub mod communication;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod metrics;
pub mod runtime;
pub mod telemetry;
pub mod transport;
pub mod tree;

pub use client::{Client, ClientError};
pub use config::ClientConfig;
pub use event::ClientEvent;
pub use runtime::{ClientHandle, RuntimeError};
