//! Transaction records and the fixed-capacity pool behind backpressure.
//!
//! A transaction is the unit of work moving through the pipeline: one
//! chunk, its digests, its IV, and the wire header it will travel under.
//! Records are preallocated with their scratch buffers and recycled; the
//! pool never grows, which makes its depth the pipeline's flow-control
//! knob.  `alloc()` returning `None` is not an error: the calling stage
//! parks until a `free()` hands a record back.
//!
//! Each record carries two scratch slots so a stage can write its output
//! into the inactive slot while the active one still holds its input.
//! No stage allocates per chunk.

use crate::crypto::{Digest, Iv, DIGEST_LEN, IV_LEN};
use crate::wire::{Header, Opcode};

/// Default pool depth.
pub const QUEUE_DEPTH: usize = 10;
/// Hard cap on pool depth and on outstanding wire messages.
pub const QUEUE_DEPTH_MAX: usize = 100;

// ── States ───────────────────────────────────────────────────────────────────

/// Pipeline stage a transaction currently carries.
///
/// The `Ex*` states belong to the extract direction; the rest to archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    /// EXISTS sent, awaiting the server's verdict.
    NExists,
    /// Chunk bytes read from the source file.
    Read,
    /// Content digest computed over the plaintext.
    UncompSha,
    /// Stored digest computed over the compressed bytes.
    CompSha,
    Compressed,
    Encrypted,
    /// WRITE reply received.
    Written,
    /// Ready for manifest writeback (dedup hit or non-chunk record).
    WmdReady,
    /// Extract: digest known, server READ wanted.
    ExSha,
    /// Extract: chunk bytes received.
    ExRead,
    ExDecrypted,
    ExUncompressed,
    ExFileStart,
    ExFileEnd,
    ExSpecial,
    ExDone,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    WriteChunk,
    ReadChunk,
}

/// Index of a file-node in the engine's slab.  A handle, never ownership;
/// valid for the file's pipeline residency.
pub type FileHandle = usize;

// ── Transaction ──────────────────────────────────────────────────────────────

pub struct Transaction {
    /// Dense, strictly increasing; defines completion delivery order.
    pub id:       u64,
    pub fnode:    Option<FileHandle>,
    pub ttype:    TransType,
    pub state:    TransState,
    /// Last transaction for the source file.
    pub eof:      bool,
    /// File-local (or metadata-global) chunk index; drives IV derivation.
    pub chunkno:  u64,
    /// Plaintext bytes this chunk covers.
    pub orig_len: usize,
    /// Bytes after compression, for the trailer's size accounting.
    pub comp_len: usize,
    data:         [Vec<u8>; 2],
    dataslot:     usize,
    pub sha:      Digest,
    pub csha:     Digest,
    pub iv:       Iv,
    pub hdr:      Header,
}

impl Transaction {
    fn new(chunk_max: usize) -> Box<Self> {
        Box::new(Transaction {
            id:       0,
            fnode:    None,
            ttype:    TransType::WriteChunk,
            state:    TransState::Done,
            eof:      false,
            chunkno:  0,
            orig_len: 0,
            comp_len: 0,
            data:     [Vec::with_capacity(chunk_max), Vec::with_capacity(chunk_max)],
            dataslot: 0,
            sha:      [0u8; DIGEST_LEN],
            csha:     [0u8; DIGEST_LEN],
            iv:       [0u8; IV_LEN],
            hdr:      Header::request(Opcode::Nop, 0),
        })
    }

    fn reset(&mut self) {
        self.id = 0;
        self.fnode = None;
        self.ttype = TransType::WriteChunk;
        self.state = TransState::Done;
        self.eof = false;
        self.chunkno = 0;
        self.orig_len = 0;
        self.comp_len = 0;
        self.data[0].clear();
        self.data[1].clear();
        self.dataslot = 0;
        self.sha = [0u8; DIGEST_LEN];
        self.csha = [0u8; DIGEST_LEN];
        self.iv = [0u8; IV_LEN];
        self.hdr = Header::request(Opcode::Nop, 0);
    }

    /// The live slot: the current stage's input.
    #[inline]
    pub fn active(&self) -> &[u8] {
        &self.data[self.dataslot]
    }

    #[inline]
    pub fn active_len(&self) -> usize {
        self.data[self.dataslot].len()
    }

    /// Mutable access to the live slot (the read stage fills it straight
    /// from the source file).
    pub fn active_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data[self.dataslot]
    }

    /// Replace the live slot's contents in place (read stage).
    pub fn load_active(&mut self, bytes: &[u8]) {
        let slot = &mut self.data[self.dataslot];
        slot.clear();
        slot.extend_from_slice(bytes);
    }

    /// Write a stage's output into the inactive slot and make it live.
    /// The previous input stays intact in the other slot.
    pub fn put_output(&mut self, bytes: &[u8]) {
        let other = 1 - self.dataslot;
        self.data[other].clear();
        self.data[other].extend_from_slice(bytes);
        self.dataslot = other;
    }

    /// Mutable access to the inactive slot for in-place fills (session
    /// reply bodies land here under CB_OWN).
    pub fn inactive_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data[1 - self.dataslot]
    }

    /// Make the inactive slot live after an external fill.
    pub fn flip(&mut self) {
        self.dataslot = 1 - self.dataslot;
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

pub struct TransPool {
    free:          Vec<Box<Transaction>>,
    depth:         usize,
    shutting_down: bool,
}

impl TransPool {
    /// Preallocate `depth` records (clamped to 1..=QUEUE_DEPTH_MAX), each
    /// with two `chunk_max` scratch buffers.
    pub fn new(depth: usize, chunk_max: usize) -> Self {
        let depth = depth.clamp(1, QUEUE_DEPTH_MAX);
        TransPool {
            free: (0..depth).map(|_| Transaction::new(chunk_max)).collect(),
            depth,
            shutting_down: false,
        }
    }

    /// A zeroed record, or `None` when the pool is exhausted or draining.
    /// On `None` the caller parks in WaitingTrans until a free event.
    pub fn alloc(&mut self) -> Option<Box<Transaction>> {
        if self.shutting_down {
            return None;
        }
        self.free.pop()
    }

    /// Return a record.  Reports whether a parked stage should be woken
    /// (the pool was empty before this release).
    pub fn free(&mut self, mut t: Box<Transaction>) -> bool {
        let was_empty = self.free.is_empty();
        t.reset();
        self.free.push(t);
        was_empty
    }

    /// Refuse further allocation; in-flight records drain normally.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.depth - self.free.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
