//! Shared helpers

pub mod disk;
pub mod signal;

pub use signal::WorkerSignal;
