//! Pixel format conversion and stereo compositing

pub mod color;
pub mod stereo;

pub use color::{Nv12Planes, P010Planes, linear_to_bgra, linear_to_nv12, linear_to_p010};
pub use stereo::{combined_resolution, composite_linear, composite_payloads};
