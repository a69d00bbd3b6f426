//! Stock components and codec layers for the harbor runtime.

pub mod echo;
pub mod heartbeat;
pub mod masking;

pub use echo::{EchoComponent, EchoConfig};
pub use heartbeat::HeartbeatComponent;
pub use masking::MaskingLayer;
