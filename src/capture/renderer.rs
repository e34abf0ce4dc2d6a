//! Renderer collaborator contract
//!
//! The 3D host renders six cube faces per eye and resolves them into one
//! equirectangular image through its own compute dispatch; this crate only
//! sees the result. The contract is deliberately narrow so the pipeline
//! never touches engine objects: GPU resources cross the boundary as opaque
//! [`TextureHandle`]s and CPU readbacks as plain pixel buffers.

use crate::pipeline::types::Frame;
use crate::settings::VideoSettings;

/// Producer of equirect frames, driven once per manager tick.
pub trait SceneRenderer: Send {
    /// Request the next frame(s) for the running session.
    ///
    /// `elapsed_seconds` is the session clock at the time of the request;
    /// emitted frames carry session-relative timestamps derived from it.
    /// `zero_copy` tells the renderer whether a GPU-resident BGRA8 texture
    /// (instead of a CPU pixel readback) is acceptable for this session.
    ///
    /// An invocation may emit zero, one (mono) or two (stereo left then
    /// right) frames through `on_frame`. Because GPU readback completes
    /// asynchronously, a renderer is free to emit nothing now and deliver
    /// the pending frame on a later invocation; each frame still carries
    /// the timestamp of the instant it was rendered.
    fn capture_frame(
        &mut self,
        settings: &VideoSettings,
        elapsed_seconds: f64,
        zero_copy: bool,
        on_frame: &mut dyn FnMut(Frame),
    );
}
