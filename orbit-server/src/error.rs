use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum OrbitError {
    #[error("subscription for {channel} failed: {source}")]
    Subscription {
        channel: String,
        #[source]
        source: TransportError,
    },
    #[error("model fetch for {pv} failed: {source}")]
    Model {
        pv: String,
        #[source]
        source: TransportError,
    },
    #[error("model table columns disagree: {names} device names, {zs} z positions")]
    MismatchedModel { names: usize, zs: usize },
    #[error("model table contains no BPM devices")]
    EmptyModel,
}
