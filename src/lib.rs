pub mod candidates;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod negotiator;
pub mod peer;
pub mod probe;
pub mod relay;
pub mod server;
pub mod sink;
pub mod transport;
pub mod util;

pub use client::{ClientHandle, SessionOutcome, SignalingClient};
pub use config::Config;
pub use error::{Error, Result};
