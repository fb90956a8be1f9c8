//! Boundary to the upstream subscription transport and the machine model.
//!
//! The aggregator core never speaks a wire protocol itself. It subscribes
//! scalar channels through [`ChannelTransport`], handing each subscription an
//! [`Arc<SampleSource>`] as the callback surface (`on_connect`,
//! `on_disconnect`, `push`), and reads the device model once at startup
//! through [`ModelFetch`]. Transports promote whatever native type a channel
//! carries to `f64` scalars; a channel whose type cannot be promoted (e.g.
//! strings) must drop the sample and log once per channel.

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::aggregator::SampleSource;

pub use sim::SimTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("channel {channel}: {reason}")]
    Subscribe { channel: String, reason: String },
    #[error("model {pv}: {reason}")]
    Fetch { pv: String, reason: String },
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Live monitor on one channel. Dropping the handle without calling
/// [`unsubscribe`](Subscription::unsubscribe) leaks the upstream monitor.
pub trait Subscription: Send {
    /// Releases the monitor. No callbacks are delivered after this returns.
    fn unsubscribe(&mut self);
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Requests a monitor on `channel`, delivering connection transitions
    /// and samples to `sink` until the subscription is released.
    async fn subscribe(
        &self,
        channel: &str,
        sink: Arc<SampleSource>,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

/// Two-column device table as served by the machine-model PV.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    pub device_name: Vec<String>,
    pub s: Vec<f64>,
}

#[async_trait]
pub trait ModelFetch: Send + Sync {
    /// One-shot fetch of the device table behind `model_pv`.
    async fn fetch(&self, model_pv: &str) -> Result<DeviceTable, TransportError>;
}
