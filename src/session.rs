//! Session client — framed request/reply over the secure transport.
//!
//! The transport is an external collaborator: any reliable, ordered,
//! byte-oriented `Read + Write` (TLS in production, in-memory pipes in
//! tests).  This layer owns framing (16-byte header then body), tag
//! allocation and demultiplexing, and the outstanding-message limit that
//! feeds backpressure up to the submit stage.
//!
//! Rules:
//! - A message write is atomic: header and body leave in one
//!   `write_all`, so a fragmenting transport never interleaves frames.
//! - A tag is unique while outstanding; tags wrap at 32 bits.  Submission
//!   is refused once [`QUEUE_DEPTH_MAX`] messages are in flight.
//! - A reply's opcode must be the pair of the request that owns its tag;
//!   anything else is fatal to the session.
//! - Reply bodies for chunk READs land in the owning transaction's
//!   inactive scratch slot; XML replies get their own buffer.
//!
//! Keepalive: after `idle` without traffic a NOP is armed; a NOP_REPLY
//! must arrive within the same window or the session is declared dead.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::login_hash;
use crate::trans::{Transaction, QUEUE_DEPTH_MAX};
use crate::wire::{
    decode_digest, decode_nop_id, encode_nop_id, Header, Opcode, Status, WireError,
    FLAG_XML_REPLY, HEADER_SIZE,
};

pub const DEFAULT_IDLE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("reply for unknown tag {0}")]
    UnknownTag(u32),
    #[error("tag {tag}: got {got:?}, expected the reply to {sent:?}")]
    UnpairedReply { tag: u32, sent: Opcode, got: Opcode },
    #[error("outstanding message limit reached")]
    Full,
    #[error("login rejected by server ({0:?})")]
    LoginFailed(Status),
    #[error("no NOP_REPLY within the idle threshold")]
    KeepaliveTimeout,
}

/// What one `poll()` produced.
pub enum Reply {
    /// A chunk-protocol reply; the reply header is in `trans.hdr`.
    Trans(Box<Transaction>),
    /// An XML control reply and its document.
    Xml(Box<Transaction>, Vec<u8>),
    /// Keepalive answered.
    Nop,
}

enum Pending {
    Trans(Box<Transaction>),
    Nop,
}

pub struct Session<T: Read + Write> {
    stream:        T,
    outstanding:   HashMap<u32, (Opcode, Pending)>,
    next_tag:      u32,
    idle:          Duration,
    last_activity: Instant,
    /// Deadline for an in-flight keepalive NOP.
    nop_deadline:  Option<Instant>,
    nop_id:        u32,
    msg_buf:       Vec<u8>,
}

impl<T: Read + Write> Session<T> {
    pub fn new(stream: T) -> Self {
        Session {
            stream,
            outstanding:   HashMap::new(),
            next_tag:      0,
            idle:          DEFAULT_IDLE,
            last_activity: Instant::now(),
            nop_deadline:  None,
            nop_id:        0,
            msg_buf:       Vec::new(),
        }
    }

    pub fn set_idle_threshold(&mut self, idle: Duration) {
        self.idle = idle;
    }

    /// In-flight messages.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// True when the submit stage must park.
    #[inline]
    pub fn full(&self) -> bool {
        self.outstanding.len() >= QUEUE_DEPTH_MAX
    }

    /// True when a reply is owed and `poll()` will make progress.
    #[inline]
    pub fn expecting_reply(&self) -> bool {
        !self.outstanding.is_empty() || self.nop_deadline.is_some()
    }

    fn take_tag(&mut self) -> Result<u32, SessionError> {
        if self.full() {
            return Err(SessionError::Full);
        }
        // Tags wrap; skip any still outstanding.
        loop {
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            if !self.outstanding.contains_key(&tag) {
                return Ok(tag);
            }
        }
    }

    fn write_message(&mut self, hdr: &Header, body: &[u8]) -> Result<(), SessionError> {
        debug_assert_eq!(hdr.size as usize, body.len());
        self.msg_buf.clear();
        self.msg_buf.extend_from_slice(&hdr.encode());
        self.msg_buf.extend_from_slice(body);
        self.stream.write_all(&self.msg_buf)?;
        self.stream.flush()?;
        self.last_activity = Instant::now();
        Ok(())
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Blocking LOGIN exchange; must complete before any other traffic.
    pub fn login(&mut self, password: &str) -> Result<(), SessionError> {
        let body = login_hash(password).into_bytes();
        let mut hdr = Header::request(Opcode::Login, body.len() as u32);
        hdr.tag = self.take_tag()?;
        let tag = hdr.tag;
        self.write_message(&hdr, &body)?;

        let (rhdr, _body) = self.read_message()?;
        if rhdr.tag != tag || rhdr.opcode != Opcode::LoginReply {
            return Err(SessionError::UnpairedReply {
                tag:  rhdr.tag,
                sent: Opcode::Login,
                got:  rhdr.opcode,
            });
        }
        match rhdr.status {
            Status::Ok => Ok(()),
            other => Err(SessionError::LoginFailed(other)),
        }
    }

    /// Send a chunk-protocol request owned by `trans`.  The body is taken
    /// from the transaction according to its header's opcode: the wire
    /// digest for EXISTS/READ, the live scratch slot for WRITE.
    ///
    /// Callers check [`full`] first; submission while full is an error
    /// that returns the transaction's place in the queue to the caller.
    pub fn submit(&mut self, mut trans: Box<Transaction>) -> Result<(), SessionError> {
        let tag = self.take_tag()?;
        trans.hdr.tag = tag;
        let opcode = trans.hdr.opcode;

        match opcode {
            Opcode::Exists | Opcode::Read => {
                let digest = trans.wire_digest();
                trans.hdr.size = digest.len() as u32;
                let hdr = trans.hdr;
                self.write_message(&hdr, &digest)?;
            }
            Opcode::Write => {
                trans.hdr.size = trans.active_len() as u32;
                let hdr = trans.hdr;
                // The active slot survives the borrow: the message buffer
                // is assembled from a copy.
                self.msg_buf.clear();
                self.msg_buf.extend_from_slice(&hdr.encode());
                self.msg_buf.extend_from_slice(trans.active());
                self.stream.write_all(&self.msg_buf)?;
                self.stream.flush()?;
                self.last_activity = Instant::now();
            }
            other => {
                warn!(?other, "submit with a non-chunk opcode");
                return Err(SessionError::Wire(WireError::BadOpcode(other as u8)));
            }
        }

        debug!(tag, ?opcode, "submitted");
        self.outstanding.insert(tag, (opcode, Pending::Trans(trans)));
        Ok(())
    }

    /// Send an XML control request owned by `trans`; the reply document
    /// comes back through `poll()` as [`Reply::Xml`].
    pub fn submit_xml(&mut self, mut trans: Box<Transaction>, doc: &[u8]) -> Result<(), SessionError> {
        let tag = self.take_tag()?;
        trans.hdr = Header::request(Opcode::Xml, doc.len() as u32);
        trans.hdr.tag = tag;
        trans.hdr.flags |= FLAG_XML_REPLY;
        let hdr = trans.hdr;
        self.write_message(&hdr, doc)?;
        self.outstanding.insert(tag, (Opcode::Xml, Pending::Trans(trans)));
        Ok(())
    }

    /// Arm or verify the keepalive.  Call between pipeline events.
    pub fn keepalive(&mut self) -> Result<(), SessionError> {
        let now = Instant::now();
        if let Some(deadline) = self.nop_deadline {
            if now > deadline {
                return Err(SessionError::KeepaliveTimeout);
            }
            return Ok(());
        }
        if now.duration_since(self.last_activity) >= self.idle {
            let tag = self.take_tag()?;
            let mut hdr = Header::request(Opcode::Nop, 4);
            hdr.tag = tag;
            self.nop_id = self.nop_id.wrapping_add(1);
            let nop_id = self.nop_id;
            self.write_message(&hdr, &encode_nop_id(nop_id))?;
            self.outstanding.insert(tag, (Opcode::Nop, Pending::Nop));
            self.nop_deadline = Some(now + self.idle);
        }
        Ok(())
    }

    // ── Replies ──────────────────────────────────────────────────────────────

    fn read_message(&mut self) -> Result<(Header, Vec<u8>), SessionError> {
        let mut hbuf = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut hbuf)?;
        let hdr = Header::decode(&hbuf)?;
        let mut body = vec![0u8; hdr.size as usize];
        self.stream.read_exact(&mut body)?;
        self.last_activity = Instant::now();
        Ok((hdr, body))
    }

    /// Read one complete message and dispatch it to the transaction
    /// awaiting its tag.  Blocks until a full message is available.
    pub fn poll(&mut self) -> Result<Reply, SessionError> {
        let (rhdr, body) = self.read_message()?;

        let (sent_op, pending) = self
            .outstanding
            .remove(&rhdr.tag)
            .ok_or(SessionError::UnknownTag(rhdr.tag))?;

        if sent_op.reply() != Some(rhdr.opcode) {
            return Err(SessionError::UnpairedReply {
                tag:  rhdr.tag,
                sent: sent_op,
                got:  rhdr.opcode,
            });
        }

        match pending {
            Pending::Nop => {
                self.nop_deadline = None;
                let _ = decode_nop_id(&body)?;
                Ok(Reply::Nop)
            }
            Pending::Trans(mut trans) => {
                let req_flags = trans.hdr.flags;
                trans.hdr = rhdr;
                match rhdr.opcode {
                    // EXISTS/WRITE replies keep the request's flags: the
                    // comp family and crypto bit chosen for this chunk
                    // must survive the round trip for the later stages
                    // and the manifest record.
                    Opcode::ExistsReply | Opcode::WriteReply => {
                        trans.hdr.flags = req_flags;
                    }
                    // READ reply flags are authoritative: they describe
                    // how the stored chunk was encoded.  Only the
                    // metadata bit carries over.
                    Opcode::ReadReply => {
                        trans.hdr.flags |= req_flags & crate::wire::FLAG_METADATA;
                    }
                    _ => {}
                }
                match rhdr.opcode {
                    Opcode::ReadReply => {
                        if rhdr.status == Status::Ok {
                            let slot = trans.inactive_mut();
                            slot.clear();
                            slot.extend_from_slice(&body);
                            trans.flip();
                        }
                        Ok(Reply::Trans(trans))
                    }
                    Opcode::WriteReply => {
                        if rhdr.status == Status::Ok || rhdr.status == Status::Exists {
                            let server = decode_digest(&body)?;
                            if server != trans.wire_digest() {
                                warn!(
                                    tag = rhdr.tag,
                                    "server digest disagrees with submitted chunk"
                                );
                            }
                        }
                        Ok(Reply::Trans(trans))
                    }
                    Opcode::XmlReply => Ok(Reply::Xml(trans, body)),
                    _ => Ok(Reply::Trans(trans)),
                }
            }
        }
    }

}

impl Transaction {
    /// The digest this transaction travels under: the stored digest
    /// (csha) when the chunk is encrypted, the content digest otherwise.
    pub fn wire_digest(&self) -> crate::crypto::Digest {
        if self.hdr.is_encrypted() {
            self.csha
        } else {
            self.sha
        }
    }
}
