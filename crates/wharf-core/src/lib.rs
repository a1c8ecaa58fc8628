//! Core of the wharf container engine
//!
//! This crate provides:
//! - The container lifecycle state machine (`Created` -> `Running` -> `Exited`)
//! - Stream multiplexing between a process and its attached clients
//! - The stdin disconnect policy for pipe and tty containers
//! - The persistent JSON-lines output log
//! - The run, attach and wait entry points

mod container;
mod engine;
mod error;
mod lifecycle;
mod logs;
mod policy;
mod registry;
mod state;
pub mod stream;

pub use container::*;
pub use engine::*;
pub use error::*;
pub use lifecycle::*;
pub use logs::*;
pub use policy::*;
pub use registry::*;
pub use state::{containers_dir, load_records, ContainerRecord};
pub use stream::{AttachOptions, AttachSession, SessionEnd, StdinPipe, Transport};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
