//! Concrete recognition engine adapters.

pub mod deepgram;

pub use deepgram::DeepgramEngine;
