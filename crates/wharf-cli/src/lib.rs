//! wharf command-line front end
//!
//! The binary in `main.rs` parses arguments and dispatches into [`commands`].

pub mod commands;
