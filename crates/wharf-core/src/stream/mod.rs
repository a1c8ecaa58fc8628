//! Stream multiplexing between container processes and attached clients
//!
//! Each process output is read by a single pump task and fanned out to every
//! subscriber: the log writer (lossless) and any number of attach sessions
//! (detached when they fall behind). The process stdin is a shared sink that at
//! most one session may feed at a time.

mod fanout;
mod session;
mod stdin;

pub use fanout::{Chunk, Delivery, Fanout, SubscriberId};
pub(crate) use fanout::spawn_pump;
pub use session::{AttachOptions, AttachSession, SessionEnd, Transport};
pub(crate) use session::Wiring;
pub use stdin::{StdinLease, StdinPipe, StdinSink};
