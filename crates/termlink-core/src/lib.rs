//! Wire protocol types for termlink.
//!
//! termlink bridges a local terminal to a PTY session on a remote daemon
//! over a small framed binary TCP protocol. This crate holds everything
//! both halves agree on:
//!
//! - [`frame`]: the frame codec (`[type][u32 BE length][payload]`) and
//!   async read/write helpers
//! - [`handshake`]: the JSON handshake payload and command spec
//! - [`error`]: the error taxonomy, including the exact error strings sent
//!   on the wire

pub mod error;
pub mod frame;
pub mod handshake;
