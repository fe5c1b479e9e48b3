//! DNSTT Fleet - supervisor for a two-tier DNSTT/SSH tunnel fleet
//!
//! The lower tier is a set of dnstt-client processes, each exposing a
//! loopback TCP endpoint carried over covert DNS. The upper tier is a set of
//! SSH dynamic-forward sessions layered on those endpoints, one SOCKS5
//! listener each. The supervisor spawns, probes, repairs, and publishes the
//! fleet to an external outbound registry.

pub mod config;
pub mod logging;
pub mod probe;
pub mod process;
pub mod registry;
pub mod supervisor;
