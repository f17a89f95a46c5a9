//! # chunkvault — client core of a content-addressed backup system
//!
//! Guarantees frozen in wire version 2 / manifest version 2:
//! - Chunk identity is SHA-1 of the plaintext, uncompressed chunk; with
//!   crypto on, a keyed stored digest names the chunk on the server
//! - All wire header fields are big-endian; the header is exactly 16
//!   bytes and decoders reject unknown opcodes, reserved flag bits, and
//!   oversize frames outright
//! - Manifests are append-only and always EOF-terminated, even after an
//!   abnormal exit, so `list` works on a partial archive
//! - Transactions complete in allocation order: the reorder buffer
//!   delivers strictly by trans_id and a duplicate completion is fatal
//! - Backpressure is allocation refusal, never unbounded buffering: the
//!   pool depth bounds in-flight chunks, the tag space bounds in-flight
//!   messages
//! - IVs derive deterministically from chunk indexes, so re-archiving
//!   the same data under the same secret names the same chunks

pub mod wire;
pub mod crypto;
pub mod compress;
pub mod manifest;
pub mod trans;
pub mod session;
pub mod pipeline;
pub mod archive;
pub mod extract;
pub mod control;
pub mod pattern;
pub mod config;

// Flat re-exports for the most common types.
pub use compress::CompFamily;
pub use config::Config;
pub use crypto::{Digest, Iv, Keys};
pub use manifest::{GlobalHeader, ManifestError, ManifestReader, ManifestWriter};
pub use pipeline::{Driver, Engine, EngineError, EngineOpts};
pub use session::{Session, SessionError};
pub use trans::{TransPool, Transaction};
pub use wire::{Header, Opcode, Status};
