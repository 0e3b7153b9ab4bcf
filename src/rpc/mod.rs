pub mod client;
pub mod rotation;

pub use client::{ChainRpc, HttpChainRpc};
pub use rotation::{Endpoint, EndpointRotator, RotationStatsSnapshot};
