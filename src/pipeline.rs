//! Pipeline engine — the multi-stage state machine behind archive and
//! extract.
//!
//! # Scheduling
//! Single-threaded and cooperative.  Every stage is a handler keyed to a
//! wake-up channel; `wake(stage)` enqueues one execution.  A handler runs
//! to exhaustion (its queue drains, the pool empties, or the session
//! refuses more in-flight messages) and yields.  When nothing is
//! runnable the engine blocks on the session for the next reply.  A
//! transaction is owned by exactly one stage at any moment; the engine
//! context is the only shared state and only the handler on the CPU may
//! touch it.
//!
//! # Stage graph (archive direction)
//!
//! ```text
//!      READ ──► SHA ──► (lookup) ──► COMPRESS ──► CSHA ──► ENCRYPT ──► SUBMIT
//!                          │                                              │
//!                          └──(dedup hit / server already has it)─────────┤
//!                                                                         ▼
//!                                                                     COMPLETE
//! ```
//!
//! Without crypto the lookup fires straight after SHA, on the content
//! digest.  With crypto on, the dedup and storage key is the stored
//! digest, SHA-1 of the compressed-then-encrypted bytes, so the chain
//! runs compress, encrypt, csha, lookup: the server must be able to
//! recompute the key from the payload alone.  Metadata (manifest)
//! transfers skip the lookup entirely; those chunks are addressed by
//! name and block number, not content.
//!
//! # Ordering
//! Transactions complete in any order but are delivered to the driver
//! strictly by `trans_id` through a reorder buffer.  A completed id below
//! the delivery cursor is a duplicate completion and fatal.
//!
//! # Backpressure
//! Pool exhaustion parks the file stage in `WaitingTrans`; it is woken by
//! the first `free()`.  A full session parks the submit queue; it drains
//! again after every reply.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::FileNode;
use crate::compress::{self, CompFamily, CompressError};
use crate::crypto::{digest_hex, sha1, CryptoError, Keys};
use crate::manifest::ManifestError;
use crate::session::{Reply, Session, SessionError};
use crate::trans::{TransPool, TransState, Transaction};
use crate::wire::{Header, Opcode, Status, CHUNK_MAX, FLAG_ENCRYPTED, FLAG_METADATA};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session failed: {0}")]
    Session(#[from] SessionError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("compression error: {0}")]
    Compress(#[from] CompressError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("duplicate completion: transaction {id} below cursor {cursor}")]
    CompletionOrder { id: u64, cursor: u64 },
    #[error("digest mismatch extracting {file}")]
    Integrity { file: String },
    #[error("chunk {digest} missing from the store")]
    Presence { digest: String },
    #[error("server reports invalid digest for chunk {digest}")]
    InvalidDigest { digest: String },
    #[error("pipeline stalled: nothing runnable, nothing in flight")]
    Stalled,
    #[error("unexpected XML reply mid-pipeline")]
    UnexpectedXml,
    #[error("server replied with unexpected status {0:?}")]
    ServerStatus(Status),
}

impl EngineError {
    /// Process exit code for this failure, per the error taxonomy:
    /// 1 config/local IO, 2 protocol/session, 3 integrity/presence.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Integrity { .. }
            | EngineError::Presence { .. }
            | EngineError::InvalidDigest { .. } => 3,
            EngineError::Session(_)
            | EngineError::CompletionOrder { .. }
            | EngineError::Stalled
            | EngineError::UnexpectedXml
            | EngineError::ServerStatus(_) => 2,
            _ => 1,
        }
    }
}

// ── Stages and file-stage state ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    File     = 0,
    Sha      = 1,
    Compress = 2,
    Csha     = 3,
    Encrypt  = 4,
    Complete = 5,
}

const NSTAGES: usize = 6;

/// State of the producing (file) stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Starting,
    Running,
    /// Parked on pool exhaustion; woken by the next free().
    WaitingTrans,
    /// No more work will be produced.
    Finished,
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub files:              u64,
    pub chunks:             u64,
    pub bytes_read:         u64,
    pub bytes_compressed:   u64,
    pub bytes_sent:         u64,
    pub dedup_hits:         u64,
    pub integrity_failures: u64,
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// An operation plugged into the engine: archive, extract, or a manifest
/// transfer.  The file handler produces transactions; the completion
/// handler consumes them in `trans_id` order and returns each record for
/// the pool to reclaim.
pub trait Driver<T: Read + Write> {
    fn file_wakeup(&mut self, eng: &mut Engine<T>) -> Result<(), EngineError>;
    fn complete(
        &mut self,
        eng:   &mut Engine<T>,
        trans: Box<Transaction>,
    ) -> Result<Box<Transaction>, EngineError>;
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct EngineOpts {
    pub chunk_size:  usize,
    pub queue_depth: usize,
    pub comp:        CompFamily,
    pub keys:        Option<Keys>,
    pub keep_going:  bool,
}

pub struct Engine<T: Read + Write> {
    pub session:    Session<T>,
    pub stats:      Stats,
    pub file_state: FileState,

    pool:          TransPool,
    next_trans_id: u64,

    runq:  VecDeque<Stage>,
    waked: [bool; NSTAGES],

    q_sha:      VecDeque<Box<Transaction>>,
    q_compress: VecDeque<Box<Transaction>>,
    q_csha:     VecDeque<Box<Transaction>>,
    q_encrypt:  VecDeque<Box<Transaction>>,
    q_submit:   VecDeque<Box<Transaction>>,

    complete:      BTreeMap<u64, Box<Transaction>>,
    complete_next: u64,

    fnodes:     Vec<Option<FileNode>>,
    fnode_free: Vec<usize>,

    chunk_size: usize,
    comp:       CompFamily,
    keys:       Option<Keys>,
    keep_going: bool,
    shutdown:   bool,
}

impl<T: Read + Write> Engine<T> {
    pub fn new(session: Session<T>, opts: EngineOpts) -> Self {
        Engine {
            session,
            stats:      Stats::default(),
            file_state: FileState::Starting,
            pool:       TransPool::new(opts.queue_depth, opts.chunk_size.min(CHUNK_MAX)),
            next_trans_id: 0,
            runq:  VecDeque::new(),
            waked: [false; NSTAGES],
            q_sha:      VecDeque::new(),
            q_compress: VecDeque::new(),
            q_csha:     VecDeque::new(),
            q_encrypt:  VecDeque::new(),
            q_submit:   VecDeque::new(),
            complete:      BTreeMap::new(),
            complete_next: 0,
            fnodes:     Vec::new(),
            fnode_free: Vec::new(),
            chunk_size: opts.chunk_size.min(CHUNK_MAX),
            comp:       opts.comp,
            keys:       opts.keys,
            keep_going: opts.keep_going,
            shutdown:   false,
        }
    }

    /// Hand the session back once the pipeline has drained (the control
    /// close follows a manifest transfer).
    pub fn into_session(self) -> Session<T> {
        self.session
    }

    #[inline] pub fn chunk_size(&self) -> usize { self.chunk_size }
    #[inline] pub fn crypto(&self) -> bool { self.keys.is_some() }
    #[inline] pub fn keys(&self) -> Option<&Keys> { self.keys.as_ref() }
    #[inline] pub fn comp(&self) -> CompFamily { self.comp }
    #[inline] pub fn keep_going(&self) -> bool { self.keep_going }

    // ── File-node slab ───────────────────────────────────────────────────────

    pub fn fnode_insert(&mut self, node: FileNode) -> usize {
        match self.fnode_free.pop() {
            Some(i) => {
                self.fnodes[i] = Some(node);
                i
            }
            None => {
                self.fnodes.push(Some(node));
                self.fnodes.len() - 1
            }
        }
    }

    pub fn fnode(&self, h: usize) -> &FileNode {
        self.fnodes[h].as_ref().expect("stale file-node handle")
    }

    pub fn fnode_mut(&mut self, h: usize) -> &mut FileNode {
        self.fnodes[h].as_mut().expect("stale file-node handle")
    }

    pub fn fnode_remove(&mut self, h: usize) -> FileNode {
        let node = self.fnodes[h].take().expect("stale file-node handle");
        self.fnode_free.push(h);
        node
    }

    // ── Scheduling primitives ────────────────────────────────────────────────

    pub fn wake(&mut self, stage: Stage) {
        if !self.waked[stage as usize] {
            self.waked[stage as usize] = true;
            self.runq.push_back(stage);
        }
    }

    fn next_runnable(&mut self) -> Option<Stage> {
        let stage = self.runq.pop_front()?;
        self.waked[stage as usize] = false;
        Some(stage)
    }

    /// Allocate a transaction record, or park the file stage and return
    /// `None`.  The id is assigned at queue time, not here, so a record
    /// handed back unqueued leaves no hole in the completion sequence.
    pub fn alloc_trans(&mut self) -> Option<Box<Transaction>> {
        match self.pool.alloc() {
            Some(t) => Some(t),
            None => {
                debug!("transaction pool empty, file stage parks");
                self.file_state = FileState::WaitingTrans;
                None
            }
        }
    }

    /// Return an allocated-but-never-queued record (skip paths).
    pub fn free_trans(&mut self, trans: Box<Transaction>) {
        let woke = self.pool.free(trans);
        if woke && self.file_state == FileState::WaitingTrans {
            self.file_state = FileState::Running;
            self.wake(Stage::File);
        }
    }

    /// Enter a fresh transaction into the pipeline: assign the next
    /// dense id and route by state.  Called exactly once per record per
    /// trip; stage handlers re-route with `route()`.
    pub fn queue(&mut self, mut trans: Box<Transaction>) {
        trans.id = self.next_trans_id;
        self.next_trans_id += 1;
        self.route(trans);
    }

    /// Route a transaction to its next stage by current state.
    fn route(&mut self, trans: Box<Transaction>) {
        let metadata = trans.hdr.flags & FLAG_METADATA != 0;
        match trans.state {
            TransState::Read => {
                self.q_sha.push_back(trans);
                self.wake(Stage::Sha);
            }
            TransState::UncompSha => {
                if metadata || self.crypto() {
                    // Lookup waits for the stored digest (or is skipped
                    // outright for named metadata chunks).
                    self.q_compress.push_back(trans);
                    self.wake(Stage::Compress);
                } else {
                    self.submit_exists(trans);
                }
            }
            TransState::Compressed => {
                if self.crypto() {
                    self.q_encrypt.push_back(trans);
                    self.wake(Stage::Encrypt);
                } else {
                    self.submit_write(trans);
                }
            }
            TransState::Encrypted => {
                if metadata {
                    // Named metadata chunks never dedup; ship directly.
                    self.submit_write(trans);
                } else {
                    self.q_csha.push_back(trans);
                    self.wake(Stage::Csha);
                }
            }
            TransState::CompSha => self.submit_exists(trans),
            TransState::ExSha => {
                self.q_submit.push_back(trans);
                self.flush_submit();
            }
            TransState::ExRead => {
                if trans.hdr.is_encrypted() {
                    self.q_encrypt.push_back(trans);
                    self.wake(Stage::Encrypt);
                } else {
                    self.q_compress.push_back(trans);
                    self.wake(Stage::Compress);
                }
            }
            TransState::ExDecrypted => {
                self.q_compress.push_back(trans);
                self.wake(Stage::Compress);
            }
            TransState::Written
            | TransState::WmdReady
            | TransState::ExUncompressed
            | TransState::ExFileStart
            | TransState::ExFileEnd
            | TransState::ExSpecial
            | TransState::ExDone
            | TransState::Done => self.push_complete(trans),
            other => {
                warn!(?other, id = trans.id, "transaction queued in unroutable state");
                self.push_complete(trans);
            }
        }
    }

    fn push_complete(&mut self, trans: Box<Transaction>) {
        let id = trans.id;
        if self.complete.insert(id, trans).is_some() {
            warn!(id, "transaction id already in the reorder buffer");
        }
        // Stale ids surface as CompletionOrder when the buffer drains.
        self.wake(Stage::Complete);
    }

    fn submit_exists(&mut self, mut trans: Box<Transaction>) {
        let mut hdr = Header::request(Opcode::Exists, 0);
        hdr.flags = (trans.hdr.flags & FLAG_METADATA)
            | trans.hdr.comp_bits()
            | if self.crypto() { FLAG_ENCRYPTED } else { 0 };
        trans.hdr = hdr;
        trans.state = TransState::NExists;
        self.q_submit.push_back(trans);
        self.flush_submit();
    }

    fn submit_write(&mut self, mut trans: Box<Transaction>) {
        let mut hdr = Header::request(Opcode::Write, trans.active_len() as u32);
        hdr.flags = trans.hdr.flags;
        trans.hdr = hdr;
        self.q_submit.push_back(trans);
        self.flush_submit();
    }

    /// Drain the submit queue into the session until it refuses more.
    fn flush_submit(&mut self) {
        while !self.session.full() {
            let Some(mut trans) = self.q_submit.pop_front() else { return };
            if trans.state == TransState::ExSha {
                let mut hdr = Header::request(Opcode::Read, 0);
                hdr.flags = trans.hdr.flags;
                trans.hdr = hdr;
            }
            self.stats.bytes_sent += trans.hdr.size as u64;
            if let Err(e) = self.session.submit(trans) {
                // Submission failures surface on the next poll.
                warn!(error = %e, "submit failed");
                return;
            }
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
        self.pool.begin_shutdown();
    }

    fn drained(&self) -> bool {
        self.shutdown
            && self.complete.is_empty()
            && self.q_sha.is_empty()
            && self.q_compress.is_empty()
            && self.q_csha.is_empty()
            && self.q_encrypt.is_empty()
            && self.q_submit.is_empty()
            && self.session.outstanding() == 0
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    pub fn run<D: Driver<T>>(&mut self, driver: &mut D) -> Result<(), EngineError> {
        self.wake(Stage::File);
        loop {
            while let Some(stage) = self.next_runnable() {
                match stage {
                    Stage::File => {
                        if self.file_state != FileState::Finished {
                            self.file_state = FileState::Running;
                            driver.file_wakeup(self)?;
                        }
                    }
                    Stage::Sha      => self.do_sha(),
                    Stage::Compress => self.do_compress()?,
                    Stage::Csha     => self.do_csha(),
                    Stage::Encrypt  => self.do_encrypt()?,
                    Stage::Complete => self.do_complete(driver)?,
                }
                self.flush_submit();
            }

            if self.drained() {
                break;
            }

            if self.session.expecting_reply() {
                match self.session.poll() {
                    Ok(reply) => self.dispatch_reply(reply)?,
                    Err(SessionError::Io(e))
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        self.session.keepalive()?;
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                // Nothing runnable, nothing owed by the server, not
                // drained: every live record would have to be in a stage
                // queue, which the inner loop just emptied.
                return Err(EngineError::Stalled);
            }
        }
        Ok(())
    }

    // ── Stage handlers ───────────────────────────────────────────────────────

    fn do_sha(&mut self) {
        while let Some(mut trans) = self.q_sha.pop_front() {
            trans.sha = sha1(trans.active());
            trans.orig_len = trans.active_len();
            // Stored size defaults to the plaintext size; the compress
            // stage overwrites it when it actually shrinks the chunk.
            trans.comp_len = trans.orig_len;
            // Incremental whole-file digest.
            if let Some(h) = trans.fnode {
                if let Some(ctx) = self.fnode_mut(h).sha_ctx.as_mut() {
                    ctx.update(trans.active());
                }
            }
            self.stats.chunks += 1;
            trans.state = TransState::UncompSha;
            debug!(id = trans.id, sha = %digest_hex(&trans.sha), "hashed");
            self.route(trans);
        }
    }

    fn do_compress(&mut self) -> Result<(), EngineError> {
        while let Some(mut trans) = self.q_compress.pop_front() {
            match trans.state {
                TransState::UncompSha => {
                    let packed = compress::compress(self.comp, trans.active())?;
                    if self.comp != CompFamily::None && packed.len() < trans.active_len() {
                        trans.put_output(&packed);
                        trans.hdr.flags =
                            (trans.hdr.flags & FLAG_METADATA) | self.comp.flag_bits();
                    }
                    trans.comp_len = trans.active_len();
                    self.stats.bytes_compressed += trans.comp_len as u64;
                    trans.state = TransState::Compressed;
                    self.route(trans);
                }
                // Extract side: inflate using the family named by the
                // reply header, then verify the content digest.
                TransState::ExRead | TransState::ExDecrypted => {
                    let family = CompFamily::from_flags(trans.hdr.flags)?;
                    if family != CompFamily::None {
                        let plain =
                            compress::decompress(family, trans.active(), CHUNK_MAX)?;
                        trans.put_output(&plain);
                    }
                    trans.state = TransState::ExUncompressed;
                    self.verify_extracted(&mut trans)?;
                    self.route(trans);
                }
                other => {
                    warn!(?other, "unexpected state at compress stage");
                    self.route(trans);
                }
            }
        }
        Ok(())
    }

    fn do_csha(&mut self) {
        while let Some(mut trans) = self.q_csha.pop_front() {
            // Stored digest over the bytes exactly as they will travel;
            // the server recomputes this from the payload.
            trans.csha = sha1(trans.active());
            trans.state = TransState::CompSha;
            self.route(trans);
        }
    }

    fn do_encrypt(&mut self) -> Result<(), EngineError> {
        while let Some(mut trans) = self.q_encrypt.pop_front() {
            let Some(keys) = self.keys.as_ref() else {
                return Err(EngineError::Crypto(CryptoError::KeyDerivation));
            };
            match trans.state {
                TransState::Compressed => {
                    let ct = keys.encrypt(&trans.iv, trans.active());
                    trans.put_output(&ct);
                    trans.hdr.flags |= FLAG_ENCRYPTED;
                    trans.state = TransState::Encrypted;
                    self.route(trans);
                }
                TransState::ExRead => {
                    let plain = keys.decrypt(&trans.iv, trans.active())?;
                    trans.put_output(&plain);
                    trans.state = TransState::ExDecrypted;
                    self.route(trans);
                }
                other => {
                    warn!(?other, "unexpected state at encrypt stage");
                    self.route(trans);
                }
            }
        }
        Ok(())
    }

    /// Content-digest check on extracted chunks.  Metadata fetches carry
    /// a block number in the digest field and are exempt.
    fn verify_extracted(&mut self, trans: &mut Transaction) -> Result<(), EngineError> {
        if trans.hdr.flags & FLAG_METADATA != 0 {
            return Ok(());
        }
        if sha1(trans.active()) == trans.sha {
            return Ok(());
        }
        self.stats.integrity_failures += 1;
        let file = trans
            .fnode
            .map(|h| self.fnode(h).name.clone())
            .unwrap_or_default();
        if self.keep_going {
            warn!(%file, "chunk digest mismatch, file abandoned");
            if let Some(h) = trans.fnode {
                self.fnode_mut(h).failed = true;
            }
            Ok(())
        } else {
            Err(EngineError::Integrity { file })
        }
    }

    fn do_complete<D: Driver<T>>(&mut self, driver: &mut D) -> Result<(), EngineError> {
        loop {
            let Some((&id, _)) = self.complete.first_key_value() else { return Ok(()) };
            if id > self.complete_next {
                return Ok(());
            }
            if id < self.complete_next {
                return Err(EngineError::CompletionOrder {
                    id,
                    cursor: self.complete_next,
                });
            }
            let trans = self.complete.remove(&id).unwrap_or_else(|| unreachable!());
            self.complete_next += 1;
            debug!(id, state = ?trans.state, eof = trans.eof, "delivering completion");
            let trans = driver.complete(self, trans)?;
            let woke = self.pool.free(trans);
            if woke && self.file_state == FileState::WaitingTrans {
                self.file_state = FileState::Running;
                self.wake(Stage::File);
            }
        }
    }

    // ── Reply dispatch ───────────────────────────────────────────────────────

    fn dispatch_reply(&mut self, reply: Reply) -> Result<(), EngineError> {
        match reply {
            Reply::Nop => Ok(()),
            Reply::Xml(..) => Err(EngineError::UnexpectedXml),
            Reply::Trans(mut trans) => {
                match trans.hdr.opcode {
                    Opcode::ExistsReply => match trans.hdr.status {
                        Status::Ok | Status::Exists => {
                            self.stats.dedup_hits += 1;
                            trans.state = TransState::WmdReady;
                            self.route(trans);
                            Ok(())
                        }
                        Status::DoesntExist => {
                            if self.crypto() {
                                // Payload is already compressed and
                                // encrypted; ship it.
                                self.submit_write(trans);
                            } else {
                                self.q_compress.push_back(trans);
                                self.wake(Stage::Compress);
                            }
                            Ok(())
                        }
                        Status::InvalidDigest => Err(EngineError::InvalidDigest {
                            digest: digest_hex(&trans.wire_digest()),
                        }),
                        other => Err(EngineError::ServerStatus(other)),
                    },
                    Opcode::WriteReply => match trans.hdr.status {
                        Status::Ok | Status::Exists => {
                            if trans.hdr.status == Status::Exists {
                                self.stats.dedup_hits += 1;
                            }
                            trans.state = TransState::Written;
                            self.route(trans);
                            Ok(())
                        }
                        other => Err(EngineError::ServerStatus(other)),
                    },
                    Opcode::ReadReply => match trans.hdr.status {
                        Status::Ok => {
                            trans.state = TransState::ExRead;
                            self.route(trans);
                            Ok(())
                        }
                        _ if trans.hdr.flags & FLAG_METADATA != 0 => {
                            // End of a named metadata object.
                            trans.eof = true;
                            trans.state = TransState::Done;
                            self.route(trans);
                            Ok(())
                        }
                        Status::DoesntExist => Err(EngineError::Presence {
                            digest: digest_hex(&trans.wire_digest()),
                        }),
                        Status::InvalidDigest => Err(EngineError::InvalidDigest {
                            digest: digest_hex(&trans.wire_digest()),
                        }),
                        other => Err(EngineError::ServerStatus(other)),
                    },
                    other => {
                        warn!(?other, "unhandled reply opcode");
                        Ok(())
                    }
                }
            }
        }
    }
}
