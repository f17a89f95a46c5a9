//! Archive driver — turns an ordered stream of file-nodes into pipeline
//! transactions and records the results in a manifest.
//!
//! The enumerator hands over file-nodes in the order they must appear in
//! the manifest.  The read stage consumes one file at a time, slicing it
//! into chunk_size transactions; the completion side writes one header,
//! `nr_shas` digests in file-offset order, and one trailer per regular
//! file, strictly in enumeration order (completion order equals
//! allocation order, and reads are serial per file).
//!
//! File end is detected by a short read OR offset reaching the stat
//! size.  On end the source is re-stated; a size change is warned about
//! and the trailer records the bytes actually hashed.
//!
//! For a differential archive, regular files not modified since the
//! basis are recorded with `nr_shas = -1` and no content is read; with
//! MLB_ALLFILES every level carries full contents and nothing is
//! skipped.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::crypto::{iv_for_chunk, Sha1Ctx, DIGEST_LEN};
use crate::manifest::{
    is_reg, DigestEntry, FileHeader, ManifestWriter, Trailer, FT_BLK, FT_CHR, FT_DIR, FT_FIFO,
    FT_LINK, FT_REG, FT_SOCK, SHAS_UNCHANGED,
};
use crate::pipeline::{Driver, Engine, EngineError, FileState};
use crate::trans::{FileHandle, TransState, TransType, Transaction};

// ── File-node ────────────────────────────────────────────────────────────────

/// One entry of the archive, as produced by the enumerator (archive
/// direction) or the manifest reader (extract direction).  Owned by the
/// engine's slab while in the pipeline; transactions only carry its
/// handle.
pub struct FileNode {
    /// Name recorded in the manifest.
    pub name:        String,
    /// On-disk path: source when archiving, destination when extracting.
    pub fs_path:     PathBuf,
    pub ftype:       u8,
    pub link_target: Option<String>,
    pub hardlink:    bool,
    pub uid:         u32,
    pub gid:         u32,
    pub mode:        u32,
    pub rdev:        i32,
    pub atime:       i64,
    pub mtime:       i64,
    /// Stat size (archive) or trailer size (extract).
    pub size:        u64,
    /// Bytes actually hashed or written so far.
    pub bytes_done:  u64,
    pub comp_size:   u64,
    pub sha_ctx:     Option<Sha1Ctx>,
    /// Unchanged since the basis; record with `nr_shas = -1`.
    pub skip:        bool,
    /// Abandoned after an integrity failure (keep-going mode).
    pub failed:      bool,
}

impl FileNode {
    pub fn new(name: String, fs_path: PathBuf, ftype: u8) -> Self {
        FileNode {
            name,
            fs_path,
            ftype,
            link_target: None,
            hardlink:    false,
            uid:         0,
            gid:         0,
            mode:        0,
            rdev:        0,
            atime:       0,
            mtime:       0,
            size:        0,
            bytes_done:  0,
            comp_size:   0,
            sha_ctx:     None,
            skip:        false,
            failed:      false,
        }
    }

    /// The manifest header for this node, with `nr_shas` computed from
    /// the stat size the way the digest count will actually come out.
    pub fn to_header(&self, chunk_size: usize) -> FileHeader {
        let nr_shas = if self.skip {
            SHAS_UNCHANGED
        } else if is_reg(self.ftype) {
            (self.size as i64 + chunk_size as i64 - 1) / chunk_size as i64
        } else {
            0
        };
        FileHeader {
            nr_shas,
            uid:      self.uid,
            gid:      self.gid,
            mode:     self.mode,
            rdev:     self.rdev,
            atime:    self.atime,
            mtime:    self.mtime,
            ftype:    self.ftype,
            filename: self.name.clone(),
        }
    }
}

// ── Enumerator ───────────────────────────────────────────────────────────────

fn ftype_of(md: &std::fs::Metadata) -> u8 {
    use std::os::unix::fs::FileTypeExt;
    let ft = md.file_type();
    if ft.is_dir() {
        FT_DIR
    } else if ft.is_symlink() {
        FT_LINK
    } else if ft.is_file() {
        FT_REG
    } else if ft.is_char_device() {
        FT_CHR
    } else if ft.is_block_device() {
        FT_BLK
    } else if ft.is_fifo() {
        FT_FIFO
    } else if ft.is_socket() {
        FT_SOCK
    } else {
        crate::manifest::FT_INVALID
    }
}

fn node_from_path(name: String, path: &Path) -> io::Result<FileNode> {
    let md = std::fs::symlink_metadata(path)?;
    let mut node = FileNode::new(name, path.to_path_buf(), ftype_of(&md));
    node.uid = md.uid();
    node.gid = md.gid();
    node.mode = md.mode() & 0o7777;
    node.rdev = md.rdev() as i32;
    node.atime = md.atime();
    node.mtime = md.mtime();
    node.size = md.len();
    if node.ftype == FT_LINK {
        node.link_target = std::fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned());
    }
    Ok(node)
}

/// Walk the input roots in order, producing file-nodes in the order they
/// will appear in the manifest.  `prev_time` marks regular files older
/// than the basis as unchanged, unless `allfiles` forces full contents
/// at every level.
pub fn enumerate(
    paths:     &[String],
    prev_time: Option<i64>,
    allfiles:  bool,
) -> io::Result<Vec<FileNode>> {
    let mut out = Vec::new();
    for root in paths {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let name = entry.path().to_string_lossy().into_owned();
            match node_from_path(name, entry.path()) {
                Ok(mut node) => {
                    if let (Some(prev), true) = (prev_time, is_reg(node.ftype)) {
                        if !allfiles && node.mtime < prev {
                            node.skip = true;
                        }
                    }
                    out.push(node);
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e,
                    "stat failed, entry skipped"),
            }
        }
    }
    Ok(out)
}

// ── Driver ───────────────────────────────────────────────────────────────────

struct OpenFile {
    handle:  FileHandle,
    file:    File,
    offset:  u64,
    chunkno: u64,
}

pub struct ArchiveDriver {
    files:        VecDeque<FileNode>,
    manifest:     Option<ManifestWriter<std::io::BufWriter<File>>>,
    current:      Option<OpenFile>,
    /// Handle the last header was written for; one header per file.
    last_hdr:     Option<FileHandle>,
    done_emitted: bool,
}

impl ArchiveDriver {
    pub fn new(
        manifest: ManifestWriter<std::io::BufWriter<File>>,
        files:    Vec<FileNode>,
    ) -> Self {
        ArchiveDriver {
            files:        files.into(),
            manifest:     Some(manifest),
            current:      None,
            last_hdr:     None,
            done_emitted: false,
        }
    }

    /// EOF-terminate a partial manifest after an abnormal exit so that
    /// `list` still works on it.
    pub fn abort(&mut self) {
        if let Some(m) = self.manifest.as_mut() {
            if let Err(e) = m.write_eof() {
                warn!(error = %e, "could not EOF-terminate partial manifest");
            }
        }
    }

    fn manifest(&mut self) -> &mut ManifestWriter<std::io::BufWriter<File>> {
        // Present until the Done completion consumes it.
        self.manifest.as_mut().expect("manifest already finalized")
    }
}

/// Read until `buf` is full or the source hits EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = r.read(&mut buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

impl<T: Read + Write> Driver<T> for ArchiveDriver {
    fn file_wakeup(&mut self, eng: &mut Engine<T>) -> Result<(), EngineError> {
        loop {
            if self.current.is_none() {
                let Some(node) = self.files.pop_front() else {
                    if !self.done_emitted {
                        let Some(mut t) = eng.alloc_trans() else { return Ok(()) };
                        t.state = TransState::Done;
                        t.eof = true;
                        self.done_emitted = true;
                        eng.file_state = FileState::Finished;
                        eng.queue(t);
                    }
                    return Ok(());
                };

                eng.stats.files += 1;
                if is_reg(node.ftype) && !node.skip {
                    let file = match File::open(&node.fs_path) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(path = %node.fs_path.display(), error = %e,
                                "cannot open source, skipped");
                            eng.stats.files -= 1;
                            continue;
                        }
                    };
                    let mut node = node;
                    node.sha_ctx = Some(Sha1Ctx::new());
                    let handle = eng.fnode_insert(node);
                    self.current = Some(OpenFile { handle, file, offset: 0, chunkno: 0 });
                } else {
                    // Directory, link, special, or basis-unchanged file:
                    // a single header-only record.
                    let Some(mut t) = eng.alloc_trans() else {
                        eng.stats.files -= 1;
                        self.files.push_front(node);
                        return Ok(());
                    };
                    t.fnode = Some(eng.fnode_insert(node));
                    t.ttype = TransType::WriteChunk;
                    t.state = TransState::WmdReady;
                    t.eof = true;
                    eng.queue(t);
                    continue;
                }
            }

            // One chunk of the open file.
            let Some(mut t) = eng.alloc_trans() else { return Ok(()) };
            let cur = self.current.as_mut().unwrap_or_else(|| unreachable!());
            let size = eng.fnode(cur.handle).size;
            let want = (size - cur.offset).min(eng.chunk_size() as u64) as usize;

            let slot = t.active_mut();
            slot.clear();
            slot.resize(want, 0);
            let n = read_full(&mut cur.file, &mut slot[..])?;
            slot.truncate(n);

            t.fnode = Some(cur.handle);
            t.ttype = TransType::WriteChunk;
            t.chunkno = cur.chunkno;
            if eng.crypto() {
                t.iv = iv_for_chunk(cur.chunkno);
            }
            cur.chunkno += 1;
            cur.offset += n as u64;
            eng.stats.bytes_read += n as u64;
            eng.fnode_mut(cur.handle).bytes_done += n as u64;

            let at_end = n < want || cur.offset >= size;
            if at_end {
                t.eof = true;
                match cur.file.metadata() {
                    Ok(md) if md.len() != size => warn!(
                        file = %eng.fnode(cur.handle).name,
                        stat = size,
                        now = md.len(),
                        "source changed size during archive"
                    ),
                    Err(e) => warn!(error = %e, "re-stat after read failed"),
                    _ => {}
                }
                self.current = None;
            }

            if n > 0 {
                t.state = TransState::Read;
            } else {
                // Nothing read (empty file or truncated tail): no chunk
                // to store, straight to writeback.
                t.state = TransState::WmdReady;
            }
            debug!(chunk = t.chunkno, bytes = n, eof = t.eof, "chunk read");
            eng.queue(t);
        }
    }

    fn complete(
        &mut self,
        eng:   &mut Engine<T>,
        trans: Box<Transaction>,
    ) -> Result<Box<Transaction>, EngineError> {
        match trans.state {
            TransState::Written | TransState::WmdReady => {
                let h = match trans.fnode {
                    Some(h) => h,
                    None => return Ok(trans),
                };
                let chunk_size = eng.chunk_size();

                if self.last_hdr != Some(h) {
                    let (hdr, link) = {
                        let node = eng.fnode(h);
                        (node.to_header(chunk_size),
                         node.link_target.clone().map(|t| (t, node.hardlink)))
                    };
                    let m = self.manifest();
                    m.write_header(&hdr)?;
                    if let Some((target, hard)) = link {
                        m.write_link_target(&target, hard)?;
                    }
                    self.last_hdr = Some(h);
                }

                if trans.orig_len > 0 {
                    let entry = if self.manifest().crypto() {
                        DigestEntry::Crypto {
                            sha:  trans.sha,
                            csha: trans.csha,
                            iv:   trans.iv,
                        }
                    } else {
                        DigestEntry::Plain(trans.sha)
                    };
                    self.manifest().write_digest(&entry)?;
                    eng.fnode_mut(h).comp_size += trans.comp_len as u64;
                }

                if trans.eof {
                    let node = eng.fnode_remove(h);
                    if is_reg(node.ftype) {
                        let sha = match (node.skip, node.sha_ctx) {
                            (false, Some(ctx)) => ctx.finalize(),
                            // Unchanged entry: content not read at this
                            // level, the digest lives in the basis.
                            _ => [0u8; DIGEST_LEN],
                        };
                        self.manifest().write_trailer(&Trailer {
                            sha,
                            orig_size: if node.skip { node.size } else { node.bytes_done },
                            comp_size: node.comp_size,
                        })?;
                    }
                    self.last_hdr = None;
                }
            }
            TransState::Done => {
                if let Some(m) = self.manifest.take() {
                    m.close()?;
                }
                info!(
                    files = eng.stats.files,
                    chunks = eng.stats.chunks,
                    read = eng.stats.bytes_read,
                    sent = eng.stats.bytes_sent,
                    dedup = eng.stats.dedup_hits,
                    "archive finished"
                );
                eng.request_shutdown();
            }
            other => {
                warn!(?other, "unexpected completion state in archive");
            }
        }
        Ok(trans)
    }
}
