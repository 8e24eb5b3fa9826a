#![forbid(unsafe_code)]
//! Asynchronous TNFS filesystem server library for Rust.
//!
//! This crate provides a tokio-based implementation of the TNFS protocol,
//! the lightweight datagram file system used by 8-bit and retro computing
//! systems to reach a directory tree on a modern host.
//!
//! # Overview
//!
//! A [`srv::Server`] owns a UDP socket, an exported root directory, and the
//! table of live sessions. Clients mount the export, walk directories, and
//! perform block-sized file I/O; the server confines every path to the
//! export root, tracks per-session file and directory handles, and answers
//! retransmitted requests from a per-session replay cache so that
//! non-idempotent commands execute at most once.
//!
//! # Example
//!
//! ```no_run
//! use tnfs::srv::Server;
//!
//! #[tokio::main]
//! async fn main() -> tnfs::Result<()> {
//!     let mut server = Server::bind("/srv/retro", tnfs::proto::TNFSD_PORT).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Protocol
//!
//! One datagram carries one request or one reply. Requests open with a
//! 4-byte header (session id, sequence number, opcode); replies repeat the
//! header and add a status byte. All integers are little-endian and
//! strings are NUL-terminated — see [`proto`] for the full command set and
//! [`error::Status`] for the status taxonomy.
//!
//! Sessions are created by MOUNT, destroyed by UMOUNT or after 10 minutes
//! of inactivity, and own up to 16 open files and 16 open directory
//! enumerations each. Directory listings are materialized when the handle
//! opens and frozen for its lifetime, so batched reads stay stable under
//! concurrent modification.

pub mod error;
pub mod fs;
pub mod proto;
pub mod serialize;
pub mod session;
pub mod srv;

pub use crate::error::{Error, Result, Status};
pub use crate::proto::*;
