//! Capture pipeline building blocks
//!
//! The pipeline moves frames from the render-side producer through a bounded
//! queue to the encode worker:
//!
//! Renderer → FrameQueue → worker → (PNG | encoder) → Muxer

pub mod frame_queue;
pub mod state;
pub mod types;

pub use frame_queue::FrameQueue;
pub use state::CaptureState;
pub use types::{AudioPacket, CaptureStatus, Eye, Frame, Resolution, TextureHandle};
