pub mod config;
pub mod error;
pub mod k8s;
pub mod logging;
pub mod watch;

pub use error::{Error, Result};
