//! Per-frame latency telemetry and the frame metadata wire format

pub mod codec;
pub mod frame_id;
pub mod observer;
pub mod plan;
pub mod recorder;
pub mod stats;
pub mod view;

pub use frame_id::FrameIdAssigner;
pub use observer::Telemetry;
