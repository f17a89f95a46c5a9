//! Control subprotocol and named-manifest transfer operations.
//!
//! Manifest objects live on the server under their name, in the
//! metadata keyspace.  Their lifecycle is driven by a tiny request/reply
//! XML layer carried in `XML` opcodes: each request is one
//! `cr_md_<action>` element with `version` and `test` attributes and
//! zero or more `<file name=""/>` children.  Replies are validated
//! against a closed element/attribute table; unknown elements or
//! attributes are errors, never ignored.  The scanner below handles
//! exactly this subset and is not exposed outside the module.
//!
//! The manifest body itself moves through the regular chunk pipeline as
//! METADATA-flagged transactions: block-number addressing instead of
//! content digests, IVs derived from the manifest-global block index,
//! and no dedup lookup.  A fetch past the last block answers with a
//! non-OK status, which ends the stream.

use std::fs::File;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::iv_for_chunk;
use crate::pipeline::{Driver, Engine, EngineError, FileState};
use crate::session::{Reply, Session, SessionError};
use crate::trans::{TransPool, TransState, TransType, Transaction};
use crate::wire::{Status, FLAG_METADATA};

pub const CONTROL_VERSION: &str = "1.0";

/// Longest accepted manifest object name.
pub const MAX_MD_NAME: usize = 256;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("malformed control reply: {0}")]
    Parse(String),
    #[error("unknown element <{0}> in control reply")]
    UnknownElement(String),
    #[error("unknown attribute {attr} on <{elem}>")]
    UnknownAttribute { elem: String, attr: String },
    #[error("manifest name too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("server refused the command ({0:?})")]
    Server(Status),
    #[error("session failed: {0}")]
    Session(#[from] SessionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Request builders ─────────────────────────────────────────────────────────

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&'  => out.push_str("&amp;"),
            '<'  => out.push_str("&lt;"),
            '>'  => out.push_str("&gt;"),
            '"'  => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c    => out.push(c),
        }
    }
    out
}

fn check_name(name: &str) -> Result<(), ControlError> {
    if name.len() > MAX_MD_NAME {
        return Err(ControlError::NameTooLong(name.len()));
    }
    Ok(())
}

fn request(action: &str, files: &[&str]) -> String {
    let mut doc = format!(
        "<?xml version=\"1.0\"?>\r\n<cr_md_{action} version=\"{CONTROL_VERSION}\" test=\"false\">\r\n"
    );
    for f in files {
        doc.push_str(&format!("<file name=\"{}\"/>\r\n", xml_escape(f)));
    }
    doc.push_str(&format!("</cr_md_{action}>\r\n"));
    doc
}

pub fn open_read_request(name: &str) -> Result<String, ControlError> {
    check_name(name)?;
    Ok(request("open_read", &[name]))
}

pub fn open_create_request(name: &str) -> Result<String, ControlError> {
    check_name(name)?;
    Ok(request("open_create", &[name]))
}

pub fn close_request() -> String {
    request("close", &[])
}

pub fn list_request() -> String {
    request("list", &[])
}

pub fn delete_request(name: &str) -> Result<String, ControlError> {
    check_name(name)?;
    Ok(request("delete", &[name]))
}

// ── Reply scanner (closed schema, module private) ────────────────────────────

const KNOWN_ELEMENTS: &[&str] = &[
    "cr_md_list",
    "cr_md_open_read",
    "cr_md_open_create",
    "cr_md_delete",
    "cr_md_close",
    "file",
];
const KNOWN_ATTRS: &[&str] = &["version", "test", "name"];

struct Element {
    name:  String,
    attrs: Vec<(String, String)>,
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Scan the reply document into a flat element list, validating every
/// element and attribute name against the closed table.
fn scan(doc: &str) -> Result<Vec<Element>, ControlError> {
    let mut out = Vec::new();
    let mut rest = doc;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        // Declaration or end tag: skip to '>'.
        if rest.starts_with('?') || rest.starts_with('/') {
            let end = rest
                .find('>')
                .ok_or_else(|| ControlError::Parse("unterminated tag".into()))?;
            rest = &rest[end + 1..];
            continue;
        }
        let end = rest
            .find('>')
            .ok_or_else(|| ControlError::Parse("unterminated tag".into()))?;
        let tag = rest[..end].trim_end_matches('/').trim();
        rest = &rest[end + 1..];

        let mut parts = tag.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| ControlError::Parse("empty tag".into()))?
            .to_owned();
        if !KNOWN_ELEMENTS.contains(&name.as_str()) {
            return Err(ControlError::UnknownElement(name));
        }

        let mut attrs = Vec::new();
        let attr_str: String = parts.collect::<Vec<_>>().join(" ");
        let mut a = attr_str.as_str();
        while let Some(eq) = a.find('=') {
            let key = a[..eq].trim().to_owned();
            let after = &a[eq + 1..];
            let after = after.trim_start();
            if !after.starts_with('"') {
                return Err(ControlError::Parse(format!("unquoted attribute {key}")));
            }
            let close = after[1..]
                .find('"')
                .ok_or_else(|| ControlError::Parse(format!("unterminated attribute {key}")))?;
            let val = xml_unescape(&after[1..1 + close]);
            if !KNOWN_ATTRS.contains(&key.as_str()) {
                return Err(ControlError::UnknownAttribute { elem: name.clone(), attr: key });
            }
            attrs.push((key, val));
            a = &after[close + 2..];
        }
        out.push(Element { name, attrs });
    }

    if out.is_empty() {
        return Err(ControlError::Parse("no elements in reply".into()));
    }
    Ok(out)
}

/// Validate a reply to `cr_md_<action>` and return the names of its
/// `<file>` children.
fn reply_files(doc: &[u8], action: &str) -> Result<Vec<String>, ControlError> {
    let text = std::str::from_utf8(doc)
        .map_err(|_| ControlError::Parse("reply is not UTF-8".into()))?;
    let elements = scan(text)?;
    let root = &elements[0];
    let expected = format!("cr_md_{action}");
    if root.name != expected {
        return Err(ControlError::Parse(format!(
            "expected <{expected}>, got <{}>",
            root.name
        )));
    }
    Ok(elements[1..]
        .iter()
        .filter(|e| e.name == "file")
        .filter_map(|e| {
            e.attrs
                .iter()
                .find(|(k, _)| k == "name")
                .map(|(_, v)| v.clone())
        })
        .collect())
}

// ── Blocking exchange ────────────────────────────────────────────────────────

/// One XML round trip outside the pipeline.  Control failures surface to
/// the caller; the session survives them.
pub fn exchange<T: Read + Write>(
    session: &mut Session<T>,
    doc:     &str,
) -> Result<Vec<u8>, ControlError> {
    let mut scratch = TransPool::new(1, 64);
    let trans = scratch
        .alloc()
        .unwrap_or_else(|| unreachable!("fresh pool is never empty"));
    session.submit_xml(trans, doc.as_bytes())?;
    loop {
        match session.poll()? {
            Reply::Xml(trans, body) => {
                return match trans.hdr.status {
                    Status::Ok => Ok(body),
                    other => Err(ControlError::Server(other)),
                };
            }
            Reply::Nop => continue,
            Reply::Trans(t) => {
                warn!(tag = t.hdr.tag, "non-XML reply during control exchange");
                return Err(ControlError::Parse("interleaved chunk reply".into()));
            }
        }
    }
}

/// Open a named manifest object on the server for reading or creation.
pub fn md_open<T: Read + Write>(
    session: &mut Session<T>,
    name:    &str,
    create:  bool,
) -> Result<(), ControlError> {
    let doc = if create {
        open_create_request(name)?
    } else {
        open_read_request(name)?
    };
    let action = if create { "open_create" } else { "open_read" };
    let body = exchange(session, &doc)?;
    reply_files(&body, action)?;
    debug!(name, create, "manifest object opened");
    Ok(())
}

pub fn md_close<T: Read + Write>(session: &mut Session<T>) -> Result<(), ControlError> {
    let body = exchange(session, &close_request())?;
    reply_files(&body, "close")?;
    Ok(())
}

/// Names of every manifest object on the server.  Patterns are applied
/// by the caller after the full list returns.
pub fn md_list<T: Read + Write>(session: &mut Session<T>) -> Result<Vec<String>, ControlError> {
    let body = exchange(session, &list_request())?;
    reply_files(&body, "list")
}

pub fn md_delete<T: Read + Write>(
    session: &mut Session<T>,
    name:    &str,
) -> Result<Vec<String>, ControlError> {
    let body = exchange(session, &delete_request(name)?)?;
    reply_files(&body, "delete")
}

// ── Manifest push driver ─────────────────────────────────────────────────────

/// Streams a local manifest file to the server as METADATA chunks.
/// `md_open(create)` must have succeeded first and `md_close` follows
/// once the engine drains.
pub struct MdPushDriver {
    name:    String,
    file:    File,
    size:    u64,
    offset:  u64,
    blockno: u64,
}

impl MdPushDriver {
    pub fn new(name: &str, file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(MdPushDriver {
            name: name.to_owned(),
            file,
            size,
            offset: 0,
            blockno: 0,
        })
    }
}

impl<T: Read + Write> Driver<T> for MdPushDriver {
    fn file_wakeup(&mut self, eng: &mut Engine<T>) -> Result<(), EngineError> {
        loop {
            if eng.file_state == FileState::Finished {
                return Ok(());
            }
            let Some(mut t) = eng.alloc_trans() else { return Ok(()) };

            let remaining = self.size - self.offset;
            if remaining == 0 {
                t.state = TransState::Done;
                t.eof = true;
                t.hdr.flags |= FLAG_METADATA;
                eng.file_state = FileState::Finished;
                eng.queue(t);
                return Ok(());
            }

            let want = remaining.min(eng.chunk_size() as u64) as usize;
            let slot = t.active_mut();
            slot.clear();
            slot.resize(want, 0);
            let mut got = 0;
            while got < want {
                let n = self.file.read(&mut slot[got..])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            slot.truncate(got);

            t.ttype = TransType::WriteChunk;
            t.state = TransState::Read;
            t.chunkno = self.blockno;
            t.hdr.flags |= FLAG_METADATA;
            // IV from the manifest-global block number.
            t.iv = iv_for_chunk(self.blockno);
            self.blockno += 1;
            eng.stats.bytes_read += got as u64;

            if got < want || self.offset + got as u64 == self.size {
                // Short read or last block; re-stat for the truncation
                // warning, then finish.
                match self.file.metadata() {
                    Ok(md) if md.len() != self.size => {
                        warn!(name = %self.name, "manifest changed size during push")
                    }
                    _ => {}
                }
                t.eof = true;
                self.offset = self.size;
                eng.file_state = FileState::Finished;
                eng.queue(t);
                return Ok(());
            }
            self.offset += got as u64;
            eng.queue(t);
        }
    }

    fn complete(
        &mut self,
        eng:   &mut Engine<T>,
        trans: Box<Transaction>,
    ) -> Result<Box<Transaction>, EngineError> {
        if trans.eof {
            info!(name = %self.name, blocks = self.blockno, "manifest pushed");
            eng.request_shutdown();
        }
        Ok(trans)
    }
}

// ── Manifest fetch driver ────────────────────────────────────────────────────

/// Fetches a named manifest object into a local file.  Blocks are
/// addressed by number: the request digest carries the little-endian
/// block index.  The server answers a read past the end with a non-OK
/// status, which ends the stream.
pub struct MdFetchDriver {
    name:       String,
    out:        File,
    next_block: u64,
    done:       bool,
}

impl MdFetchDriver {
    pub fn new(name: &str, out: File) -> Self {
        MdFetchDriver {
            name: name.to_owned(),
            out,
            next_block: 0,
            done: false,
        }
    }
}

impl<T: Read + Write> Driver<T> for MdFetchDriver {
    fn file_wakeup(&mut self, eng: &mut Engine<T>) -> Result<(), EngineError> {
        while !self.done {
            let Some(mut t) = eng.alloc_trans() else { return Ok(()) };
            t.ttype = TransType::ReadChunk;
            t.state = TransState::ExSha;
            t.chunkno = self.next_block;
            t.hdr.flags |= FLAG_METADATA;
            t.sha[0..8].copy_from_slice(&self.next_block.to_le_bytes());
            t.iv = iv_for_chunk(self.next_block);
            self.next_block += 1;
            eng.queue(t);
        }
        Ok(())
    }

    fn complete(
        &mut self,
        eng:   &mut Engine<T>,
        trans: Box<Transaction>,
    ) -> Result<Box<Transaction>, EngineError> {
        match trans.state {
            TransState::ExUncompressed if !self.done => {
                self.out.write_all(trans.active())?;
            }
            // Non-OK read reply: the object has no more blocks.
            TransState::Done if !self.done => {
                self.done = true;
                eng.file_state = FileState::Finished;
                self.out.flush()?;
                info!(name = %self.name, blocks = trans.chunkno, "manifest fetched");
                eng.request_shutdown();
            }
            _ => {}
        }
        Ok(trans)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
