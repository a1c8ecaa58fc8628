//! Configuration for wharf
//!
//! This crate handles parsing of the engine configuration
//! (`~/.config/wharf/config.toml`): where container state and logs live,
//! how the stream multiplexer buffers output, the initial pty size, and the
//! table of known images.

mod engine;
mod error;

pub use engine::*;
pub use error::*;
