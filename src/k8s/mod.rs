pub mod client;
pub mod config;
pub mod source;

/// User agent sent with every API request, built from the package version
///
/// Override with `NETPOL_USER_AGENT` when running several builds side by side.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
