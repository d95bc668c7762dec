//! SSH transport wiring.
//!
//! Accepts SSH connections from Git clients, authenticates them by public
//! key, and turns each `exec` request into one command invocation against
//! the dispatcher.  Everything protocol-shaped (channels, extended data,
//! exit status) stays inside this module; the command layer only ever sees
//! byte streams and an exit sink.

pub mod server;
pub mod session;
