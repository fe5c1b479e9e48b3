//! Outbound Registry Integration
//!
//! The external proxy-orchestration service that publishes our SOCKS5
//! listeners as outbounds. The supervisor only ever talks to the narrow
//! [`OutboundRegistry`] seam; [`XuiClient`] is the 3x-ui implementation.

mod xui;

pub use xui::{XuiClient, XuiEndpoints};

use async_trait::async_trait;

/// Narrow interface to the outbound registry.
///
/// Operations return success flags or opaque ids rather than errors: a failed
/// registry call never aborts fleet orchestration, it only leaves a tunnel
/// unpublished until the next restart cycle re-adds it.
#[async_trait]
pub trait OutboundRegistry: Send + Sync {
    /// Publish a SOCKS5 endpoint. Returns the registry's id for it.
    async fn add_socks5(&self, host: &str, port: u16, remark: &str) -> Option<String>;

    /// Withdraw a previously added outbound. "Already gone" is success.
    async fn remove(&self, outbound_id: &str) -> bool;

    /// Ask the registry to re-read its configuration.
    async fn reload(&self) -> bool;

    /// List the registry's current outbounds.
    async fn list(&self) -> Option<Vec<serde_json::Value>>;
}
