//! In-memory chunk server for pipeline tests.
//!
//! Implements the request/reply semantics of the chunk protocol over a
//! plain `Read + Write` pair: every message the client writes is parsed
//! and answered immediately into a reply buffer the client then reads.
//! Storage keys are computed the way the real server must: SHA-1 of the
//! received payload for encrypted chunks, SHA-1 of the decompressed
//! payload otherwise.

// Not every test binary touches every knob.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::rc::Rc;

use sha1::{Digest as _, Sha1};

use chunkvault::compress::{decompress, CompFamily};
use chunkvault::wire::{
    Header, Opcode, Status, CHUNK_MAX, FLAG_ENCRYPTED, FLAG_METADATA, FLAG_XML_REPLY,
    HEADER_SIZE,
};

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(data);
    h.finalize().into()
}

#[derive(Default)]
pub struct MockServer {
    /// Content store: digest -> (payload, flags it was stored with).
    pub store:    HashMap<[u8; 20], (Vec<u8>, u16)>,
    /// Named manifest objects: name -> blocks.
    pub md_store: HashMap<String, Vec<(Vec<u8>, u16)>>,
    open_md:      Option<String>,

    inbuf:  Vec<u8>,
    outbuf: Vec<u8>,
    /// Replies held back to be released in reverse order.
    held:   Vec<Vec<u8>>,
    /// Hold this many replies before flushing them reversed.
    pub reorder_window: usize,

    /// Digest of every WRITE request, in arrival order.
    pub writes:        Vec<[u8; 20]>,
    /// Status answered to each WRITE.
    pub write_status:  Vec<Status>,
    pub exists_count:  usize,
    pub fail_login:    bool,
}

impl MockServer {
    pub fn new() -> Self {
        MockServer::default()
    }

    fn reply(&mut self, hdr: Header, body: &[u8]) {
        let mut msg = Vec::with_capacity(HEADER_SIZE + body.len());
        let mut hdr = hdr;
        hdr.size = body.len() as u32;
        msg.extend_from_slice(&hdr.encode());
        msg.extend_from_slice(body);
        if self.reorder_window > 1 {
            self.held.push(msg);
            if self.held.len() >= self.reorder_window {
                for m in self.held.drain(..).rev() {
                    self.outbuf.extend_from_slice(&m);
                }
            }
        } else {
            self.outbuf.extend_from_slice(&msg);
        }
    }

    fn reply_hdr(req: &Header, opcode: Opcode, status: Status, flags: u16) -> Header {
        let mut h = Header::request(opcode, 0);
        h.tag = req.tag;
        h.status = status;
        h.flags = flags;
        h
    }

    /// The key a payload is stored under: the server can always
    /// recompute it from the bytes it received.
    fn storage_key(hdr: &Header, body: &[u8]) -> [u8; 20] {
        if hdr.flags & FLAG_ENCRYPTED != 0 {
            sha1_of(body)
        } else {
            match CompFamily::from_flags(hdr.flags) {
                Ok(CompFamily::None) => sha1_of(body),
                Ok(fam) => match decompress(fam, body, CHUNK_MAX) {
                    Ok(plain) => sha1_of(&plain),
                    Err(_) => sha1_of(body),
                },
                Err(_) => sha1_of(body),
            }
        }
    }

    fn handle(&mut self, hdr: Header, body: Vec<u8>) {
        match hdr.opcode {
            Opcode::Nop => {
                let id = u32::from_be_bytes(body[..4].try_into().unwrap());
                let r = Self::reply_hdr(&hdr, Opcode::NopReply, Status::Ok, 0);
                self.reply(r, &(id + 1).to_be_bytes());
            }
            Opcode::Login => {
                let status = if self.fail_login {
                    Status::LoginFailed
                } else {
                    Status::Ok
                };
                let r = Self::reply_hdr(&hdr, Opcode::LoginReply, status, 0);
                self.reply(r, &[]);
            }
            Opcode::Exists => {
                self.exists_count += 1;
                let digest: [u8; 20] = body[..20].try_into().unwrap();
                let (status, flags) = match self.store.get(&digest) {
                    Some((_, f)) => (Status::Ok, *f),
                    None => (Status::DoesntExist, 0),
                };
                let r = Self::reply_hdr(&hdr, Opcode::ExistsReply, status, flags);
                self.reply(r, &[]);
            }
            Opcode::Write => {
                if hdr.flags & FLAG_METADATA != 0 {
                    let name = self.open_md.clone().expect("WRITE with no open md object");
                    self.md_store
                        .entry(name)
                        .or_default()
                        .push((body.clone(), hdr.flags & !FLAG_METADATA));
                    let digest = sha1_of(&body);
                    let r = Self::reply_hdr(
                        &hdr,
                        Opcode::WriteReply,
                        Status::Ok,
                        hdr.flags,
                    );
                    self.reply(r, &digest);
                    return;
                }
                let key = Self::storage_key(&hdr, &body);
                self.writes.push(key);
                let status = if self.store.contains_key(&key) {
                    Status::Exists
                } else {
                    self.store
                        .insert(key, (body, hdr.flags & !FLAG_METADATA));
                    Status::Ok
                };
                self.write_status.push(status);
                let r = Self::reply_hdr(&hdr, Opcode::WriteReply, status, hdr.flags);
                self.reply(r, &key);
            }
            Opcode::Read => {
                if hdr.flags & FLAG_METADATA != 0 {
                    let blockno =
                        u64::from_le_bytes(body[..8].try_into().unwrap()) as usize;
                    let name = self.open_md.clone().expect("READ with no open md object");
                    match self.md_store.get(&name).and_then(|v| v.get(blockno)) {
                        Some((data, flags)) => {
                            let r = Self::reply_hdr(
                                &hdr,
                                Opcode::ReadReply,
                                Status::Ok,
                                flags | FLAG_METADATA,
                            );
                            let data = data.clone();
                            self.reply(r, &data);
                        }
                        None => {
                            let r = Self::reply_hdr(
                                &hdr,
                                Opcode::ReadReply,
                                Status::DoesntExist,
                                FLAG_METADATA,
                            );
                            self.reply(r, &[]);
                        }
                    }
                    return;
                }
                let digest: [u8; 20] = body[..20].try_into().unwrap();
                match self.store.get(&digest) {
                    Some((data, flags)) => {
                        let r =
                            Self::reply_hdr(&hdr, Opcode::ReadReply, Status::Ok, *flags);
                        let data = data.clone();
                        self.reply(r, &data);
                    }
                    None => {
                        let r = Self::reply_hdr(
                            &hdr,
                            Opcode::ReadReply,
                            Status::DoesntExist,
                            0,
                        );
                        self.reply(r, &[]);
                    }
                }
            }
            Opcode::Xml => {
                let doc = String::from_utf8_lossy(&body).into_owned();
                let reply_doc = self.handle_xml(&doc);
                let r = Self::reply_hdr(&hdr, Opcode::XmlReply, Status::Ok, FLAG_XML_REPLY);
                self.reply(r, reply_doc.as_bytes());
            }
            other => panic!("mock server got unexpected opcode {other:?}"),
        }
    }

    fn handle_xml(&mut self, doc: &str) -> String {
        let action_of = |tag: &str| doc.contains(&format!("<cr_md_{tag}"));
        let file_name = || {
            doc.split("<file name=\"")
                .nth(1)
                .and_then(|rest| rest.split('"').next())
                .map(str::to_owned)
        };

        if action_of("open_create") {
            let name = file_name().expect("open_create without file");
            self.md_store.insert(name.clone(), Vec::new());
            self.open_md = Some(name.clone());
            format!(
                "<cr_md_open_create version=\"1.0\" test=\"false\">\r\n\
                 <file name=\"{name}\"/>\r\n</cr_md_open_create>\r\n"
            )
        } else if action_of("open_read") {
            let name = file_name().expect("open_read without file");
            self.open_md = Some(name.clone());
            format!(
                "<cr_md_open_read version=\"1.0\" test=\"false\">\r\n\
                 <file name=\"{name}\"/>\r\n</cr_md_open_read>\r\n"
            )
        } else if action_of("close") {
            self.open_md = None;
            "<cr_md_close version=\"1.0\" test=\"false\"/>\r\n".into()
        } else if action_of("list") {
            let mut out =
                String::from("<cr_md_list version=\"1.0\" test=\"false\">\r\n");
            let mut names: Vec<_> = self.md_store.keys().cloned().collect();
            names.sort();
            for n in names {
                out.push_str(&format!("<file name=\"{n}\"/>\r\n"));
            }
            out.push_str("</cr_md_list>\r\n");
            out
        } else if action_of("delete") {
            let name = file_name().expect("delete without file");
            self.md_store.remove(&name);
            format!(
                "<cr_md_delete version=\"1.0\" test=\"false\">\r\n\
                 <file name=\"{name}\"/>\r\n</cr_md_delete>\r\n"
            )
        } else {
            panic!("mock server got unknown XML request: {doc}");
        }
    }

    fn pump(&mut self) {
        loop {
            if self.inbuf.len() < HEADER_SIZE {
                return;
            }
            let hdr = Header::decode(&self.inbuf[..HEADER_SIZE]).expect("client sent bad header");
            let total = HEADER_SIZE + hdr.size as usize;
            if self.inbuf.len() < total {
                return;
            }
            let body = self.inbuf[HEADER_SIZE..total].to_vec();
            self.inbuf.drain(..total);
            self.handle(hdr, body);
        }
    }

    /// Release any replies held for reordering (end-of-test flush).
    pub fn flush_held(&mut self) {
        for m in self.held.drain(..).rev() {
            self.outbuf.extend_from_slice(&m);
        }
    }
}

impl Write for MockServer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbuf.extend_from_slice(buf);
        self.pump();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Shared handle: the session consumes the transport, the test keeps a
/// clone to inspect the server afterwards.
#[derive(Clone, Default)]
pub struct SharedServer(pub Rc<RefCell<MockServer>>);

impl SharedServer {
    pub fn new() -> Self {
        SharedServer::default()
    }
}

impl Read for SharedServer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl Write for SharedServer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

impl Read for MockServer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbuf.is_empty() && !self.held.is_empty() {
            self.flush_held();
        }
        if self.outbuf.is_empty() {
            // The engine only reads while replies are owed; an empty
            // buffer here means the client lost track.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client read with no reply pending",
            ));
        }
        let n = buf.len().min(self.outbuf.len());
        buf[..n].copy_from_slice(&self.outbuf[..n]);
        self.outbuf.drain(..n);
        Ok(n)
    }
}
