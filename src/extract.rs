//! Extract driver — walks a manifest chain, fetches chunks, reassembles
//! files in declared order.
//!
//! # Chain walk
//! The named manifest's global header may carry a `prevlvl` name; the
//! chain is followed down to its base before extraction starts.  With
//! MLB_ALLFILES every level is self-sufficient: extraction runs from the
//! base upward and later levels simply supersede changed files.  Without
//! it, extraction starts at the requested level and walks backward:
//! entries recorded as unchanged (`nr_shas = -1`) put their name on a
//! want-list that deeper levels satisfy, and files already produced by a
//! shallower level are ignored on the way down.
//!
//! # Per file
//! The match predicate decides whether an entry is wanted; unwanted
//! regular files are skipped with one seek over their digest run plus a
//! trailer read.  Wanted files emit an `ExFileStart` transaction, one
//! `ExSha` per digest (each fetches one chunk), a trailer consumption,
//! and an `ExFileEnd`.  Completion delivers all of that in `trans_id`
//! order, so the destination file is written front to back and closed
//! with its attributes once the trailer digest has been checked.

use std::collections::{HashSet, VecDeque};
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::archive::FileNode;
use crate::crypto::{digest_hex, Sha1Ctx};
use crate::manifest::{
    is_link, is_reg, DigestEntry, Entry, FileHeader, ManifestError, ManifestReader, Trailer,
    FT_BLK, FT_CHR, FT_DIR, FT_FIFO, FT_HARDLINK_BIT, SHAS_UNCHANGED,
};
use crate::pattern::Matcher;
use crate::pipeline::{Driver, Engine, EngineError, FileState};
use crate::trans::{FileHandle, TransState, TransType, Transaction};
use crate::wire::FLAG_ENCRYPTED;

type Reader = ManifestReader<BufReader<File>>;

// ── Chain discovery ──────────────────────────────────────────────────────────

/// Follow `prevlvl` links from `top`, returning the manifest names in
/// processing order: base-first under MLB_ALLFILES, top-first otherwise.
/// The flag is taken from the manifest actually named on the command
/// line.
pub fn chain_order(top: &str) -> Result<(Vec<String>, bool), ManifestError> {
    let mut names = vec![top.to_owned()];
    let mut allfiles = None;
    let mut cur = top.to_owned();
    loop {
        let rdr = ManifestReader::open(&cur)?;
        let gh = rdr.global();
        if allfiles.is_none() {
            allfiles = Some(gh.allfiles());
        }
        match gh.prevlvl() {
            Some(prev) => {
                names.push(prev.to_owned());
                cur = prev.to_owned();
            }
            None => break,
        }
    }
    let allfiles = allfiles.unwrap_or(false);
    if allfiles {
        names.reverse();
    }
    Ok((names, allfiles))
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct ExtractDriver {
    /// Levels still to open, in processing order.
    levels:    VecDeque<String>,
    reader:    Option<Reader>,
    allfiles:  bool,
    /// First level processed in backward (non-allfiles) mode.
    first_lvl: bool,
    matcher:   Matcher,
    dest:      PathBuf,
    /// Backward mode: names whose content must come from a deeper level.
    want:      HashSet<String>,
    /// Names already produced by a shallower level.
    have:      HashSet<String>,
    /// -1 = next item is a header; 0 = trailer; >0 = digests left.
    num_shas:  i64,
    cur:       Option<FileHandle>,
    doextract: bool,
    out:       Option<(File, PathBuf)>,
    done_emitted: bool,
}

impl ExtractDriver {
    pub fn new(manifest: &str, dest: &Path, matcher: Matcher) -> Result<Self, ManifestError> {
        let (levels, allfiles) = chain_order(manifest)?;
        Ok(ExtractDriver {
            levels:    levels.into(),
            reader:    None,
            allfiles,
            first_lvl: true,
            matcher,
            dest:      dest.to_path_buf(),
            want:      HashSet::new(),
            have:      HashSet::new(),
            num_shas:  SHAS_UNCHANGED,
            cur:       None,
            doextract: false,
            out:       None,
            done_emitted: false,
        })
    }

    fn dest_path(&self, name: &str) -> PathBuf {
        self.dest.join(name.trim_start_matches('/'))
    }

    /// Remove the file being reassembled when extraction dies mid-way;
    /// a fatal chunk error must not leave a partial entry behind.
    pub fn discard_partial(&mut self) {
        if let Some((file, path)) = self.out.take() {
            drop(file);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "partial file left behind");
            }
        }
    }

    /// Does this entry get extracted at the current level?
    fn wanted(&self, name: &str) -> bool {
        if !self.matcher.matches(name) {
            return false;
        }
        if self.allfiles {
            // Forward walk: every level is complete; later levels
            // overwrite.
            true
        } else if self.first_lvl {
            true
        } else {
            self.want.contains(name) && !self.have.contains(name)
        }
    }

    fn node_from_header(&self, hdr: &FileHeader, link: Option<(String, bool)>) -> FileNode {
        let mut node = FileNode::new(
            hdr.filename.clone(),
            self.dest_path(&hdr.filename),
            hdr.ftype,
        );
        node.uid = hdr.uid;
        node.gid = hdr.gid;
        node.mode = hdr.mode;
        node.rdev = hdr.rdev;
        node.atime = hdr.atime;
        node.mtime = hdr.mtime;
        if let Some((target, hard)) = link {
            node.link_target = Some(target);
            node.hardlink = hard;
        }
        if is_reg(hdr.ftype) {
            node.sha_ctx = Some(Sha1Ctx::new());
        }
        node
    }
}

impl<T: Read + Write> Driver<T> for ExtractDriver {
    fn file_wakeup(&mut self, eng: &mut Engine<T>) -> Result<(), EngineError> {
        loop {
            if eng.file_state == FileState::Finished {
                return Ok(());
            }

            if self.reader.is_none() {
                match self.levels.pop_front() {
                    Some(name) => {
                        debug!(level = %name, "opening manifest level");
                        self.reader = Some(ManifestReader::open(&name)?);
                        self.num_shas = SHAS_UNCHANGED;
                    }
                    None => {
                        if !self.done_emitted {
                            let Some(mut t) = eng.alloc_trans() else { return Ok(()) };
                            t.state = TransState::ExDone;
                            t.eof = true;
                            self.done_emitted = true;
                            eng.file_state = FileState::Finished;
                            eng.queue(t);
                        }
                        return Ok(());
                    }
                }
            }

            let Some(mut t) = eng.alloc_trans() else { return Ok(()) };
            // The reader is taken out for the duration of one item so
            // the driver's own bookkeeping stays reachable.
            let mut rdr = self.reader.take().unwrap_or_else(|| unreachable!());

            if self.num_shas == SHAS_UNCHANGED {
                // Next item is a file header (or the EOF sentinel).
                match rdr.read_header()? {
                    Entry::Eof => {
                        self.first_lvl = false;
                        eng.free_trans(t);
                        continue;
                    }
                    Entry::File(hdr) => {
                        let link = if is_link(hdr.ftype) {
                            match rdr.read_header()? {
                                Entry::File(h2) => Some((
                                    h2.filename,
                                    h2.ftype & FT_HARDLINK_BIT != 0,
                                )),
                                Entry::Eof => return Err(ManifestError::Truncated.into()),
                            }
                        } else {
                            None
                        };

                        self.doextract = self.wanted(&hdr.filename);

                        if is_reg(hdr.ftype) {
                            self.num_shas = hdr.nr_shas;
                            if self.num_shas == SHAS_UNCHANGED {
                                if self.doextract && !self.allfiles {
                                    debug!(file = %hdr.filename,
                                        "content recorded at an earlier level");
                                    self.want.insert(hdr.filename.clone());
                                }
                                // Trailer still follows; content does not.
                                self.num_shas = 0;
                                self.doextract = false;
                            }
                        }

                        if !self.doextract {
                            if is_reg(hdr.ftype) {
                                rdr.skip_digests(self.num_shas)?;
                                rdr.read_trailer()?;
                                self.num_shas = SHAS_UNCHANGED;
                            }
                            self.reader = Some(rdr);
                            eng.free_trans(t);
                            continue;
                        }

                        if !self.allfiles && !self.first_lvl {
                            self.want.remove(&hdr.filename);
                        }
                        self.have.insert(hdr.filename.clone());
                        eng.stats.files += 1;

                        let regular = is_reg(hdr.ftype);
                        let node = self.node_from_header(&hdr, link);
                        let handle = eng.fnode_insert(node);
                        t.fnode = Some(handle);
                        t.state = if regular {
                            self.cur = Some(handle);
                            TransState::ExFileStart
                        } else {
                            self.num_shas = SHAS_UNCHANGED;
                            TransState::ExSpecial
                        };
                        self.reader = Some(rdr);
                        eng.queue(t);
                    }
                }
            } else if self.num_shas == 0 {
                let trl = rdr.read_trailer()?;
                self.reader = Some(rdr);
                self.num_shas = SHAS_UNCHANGED;
                let handle = self.cur.take();
                if let Some(h) = handle {
                    let node = eng.fnode_mut(h);
                    node.size = trl.orig_size;
                }
                t.fnode = handle;
                t.sha = trl.sha;
                t.state = TransState::ExFileEnd;
                t.eof = true;
                eng.queue(t);
            } else {
                let entry = rdr.read_digest()?;
                self.reader = Some(rdr);
                self.num_shas -= 1;
                t.fnode = self.cur;
                t.ttype = TransType::ReadChunk;
                t.state = TransState::ExSha;
                match entry {
                    DigestEntry::Plain(sha) => t.sha = sha,
                    DigestEntry::Crypto { sha, csha, iv } => {
                        t.sha = sha;
                        t.csha = csha;
                        t.iv = iv;
                        t.hdr.flags |= FLAG_ENCRYPTED;
                    }
                }
                debug!(sha = %digest_hex(&t.sha), "chunk wanted");
                eng.queue(t);
            }
        }
    }

    fn complete(
        &mut self,
        eng:   &mut Engine<T>,
        trans: Box<Transaction>,
    ) -> Result<Box<Transaction>, EngineError> {
        match trans.state {
            TransState::ExFileStart => {
                let h = trans.fnode.unwrap_or_else(|| unreachable!());
                let path = eng.fnode(h).fs_path.clone();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                debug!(path = %path.display(), "extracting");
                self.out = Some((File::create(&path)?, path));
            }
            TransState::ExUncompressed => {
                let failed = trans
                    .fnode
                    .map(|h| eng.fnode(h).failed)
                    .unwrap_or(false);
                if !failed {
                    if let Some((out, _)) = self.out.as_mut() {
                        out.write_all(trans.active())?;
                        eng.stats.bytes_read += trans.active_len() as u64;
                    }
                    if let Some(h) = trans.fnode {
                        let node = eng.fnode_mut(h);
                        node.bytes_done += trans.active_len() as u64;
                        if let Some(ctx) = node.sha_ctx.as_mut() {
                            ctx.update(trans.active());
                        }
                    }
                }
            }
            TransState::ExFileEnd => {
                let out = self.out.take();
                drop(out);
                let Some(h) = trans.fnode else { return Ok(trans) };
                let mut node = eng.fnode_remove(h);

                if node.failed {
                    // Chunk-level mismatch already counted; remove the
                    // partial output.
                    let _ = fs::remove_file(&node.fs_path);
                } else if let Some(ctx) = node.sha_ctx.take() {
                    let got = ctx.finalize();
                    if got != trans.sha {
                        eng.stats.integrity_failures += 1;
                        let _ = fs::remove_file(&node.fs_path);
                        if !eng.keep_going() {
                            return Err(EngineError::Integrity { file: node.name });
                        }
                        warn!(file = %node.name, "whole-file digest mismatch");
                    } else {
                        apply_attrs(&node);
                        debug!(file = %node.name, bytes = node.bytes_done, "extracted");
                    }
                }
            }
            TransState::ExSpecial => {
                let Some(h) = trans.fnode else { return Ok(trans) };
                let node = eng.fnode_remove(h);
                if let Err(e) = make_special(&node, &self.dest) {
                    warn!(file = %node.name, error = %e, "special file not recreated");
                }
            }
            TransState::ExDone => {
                info!(
                    files = eng.stats.files,
                    bytes = eng.stats.bytes_read,
                    failures = eng.stats.integrity_failures,
                    "extract finished"
                );
                eng.request_shutdown();
            }
            other => {
                warn!(?other, "unexpected completion state in extract");
            }
        }
        Ok(trans)
    }
}

// ── File recreation helpers ──────────────────────────────────────────────────

fn apply_attrs(node: &FileNode) {
    let path = &node.fs_path;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(node.mode)) {
        warn!(path = %path.display(), error = %e, "chmod failed");
    }
    set_times(path, node.atime, node.mtime);
    set_owner(path, node.uid, node.gid);
}

fn set_times(path: &Path, atime: i64, mtime: i64) {
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else { return };
    let times = [
        libc::timeval { tv_sec: atime, tv_usec: 0 },
        libc::timeval { tv_sec: mtime, tv_usec: 0 },
    ];
    // Times are advisory; extraction proceeds even when they cannot be
    // applied.
    unsafe {
        libc::utimes(cpath.as_ptr(), times.as_ptr());
    }
}

fn set_owner(path: &Path, uid: u32, gid: u32) {
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else { return };
    // Needs privilege; quietly best-effort like every extractor.
    unsafe {
        libc::lchown(cpath.as_ptr(), uid, gid);
    }
}

fn make_special(node: &FileNode, dest: &Path) -> io::Result<()> {
    let path = &node.fs_path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match node.ftype & !FT_HARDLINK_BIT {
        FT_DIR => {
            fs::create_dir_all(path)?;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(node.mode));
        }
        t if is_link(t) => {
            let target = node.link_target.as_deref().unwrap_or("");
            if node.hardlink {
                let src = dest.join(target.trim_start_matches('/'));
                let _ = fs::remove_file(path);
                fs::hard_link(&src, path)?;
            } else {
                let _ = fs::remove_file(path);
                std::os::unix::fs::symlink(target, path)?;
            }
        }
        FT_FIFO => {
            let cpath = CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
            let rc = unsafe { libc::mkfifo(cpath.as_ptr(), node.mode as libc::mode_t) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        FT_CHR | FT_BLK => {
            let cpath = CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
            let kind = if node.ftype & !FT_HARDLINK_BIT == FT_CHR {
                libc::S_IFCHR
            } else {
                libc::S_IFBLK
            };
            let rc = unsafe {
                libc::mknod(
                    cpath.as_ptr(),
                    kind | node.mode as libc::mode_t,
                    node.rdev as libc::dev_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        _ => {}
    }
    set_owner(path, node.uid, node.gid);
    Ok(())
}

// ── Listing ──────────────────────────────────────────────────────────────────

/// Print the contents of a manifest chain.  Verbosity: 1 adds per-file
/// size and reduction, 3 prints every chunk digest.
pub fn list(manifest: &str, matcher: &Matcher, verbose: u8) -> Result<(), ManifestError> {
    let (levels, _) = chain_order(manifest)?;
    for name in &levels {
        let mut rdr = ManifestReader::open(name)?;
        let gh = rdr.global().clone();
        if verbose > 0 {
            println!(
                "{name}: version {} level {} chunk {} created {}",
                gh.version,
                gh.cur_lvl,
                gh.chunk_size,
                chrono::DateTime::from_timestamp(gh.created, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            );
        }
        loop {
            let hdr = match rdr.read_header()? {
                Entry::Eof => break,
                Entry::File(h) => h,
            };
            let link = if is_link(hdr.ftype) {
                match rdr.read_header()? {
                    Entry::File(h2) => Some(h2),
                    Entry::Eof => return Err(ManifestError::Truncated),
                }
            } else {
                None
            };
            let doprint = matcher.matches(&hdr.filename);

            if doprint {
                match &link {
                    Some(l) => println!("{} -> {}", hdr.filename, l.filename),
                    None => println!("{}", hdr.filename),
                }
            }

            if is_reg(hdr.ftype) {
                if hdr.nr_shas >= 0 {
                    if doprint && verbose > 2 {
                        for _ in 0..hdr.nr_shas {
                            let d = rdr.read_digest()?;
                            println!("  sha {}", digest_hex(d.content_digest()));
                        }
                    } else {
                        rdr.skip_digests(hdr.nr_shas)?;
                    }
                }
                let trl: Trailer = rdr.read_trailer()?;
                if doprint && verbose > 0 {
                    let reduction = if trl.orig_size == 0 {
                        0
                    } else {
                        100 * trl.orig_size.saturating_sub(trl.comp_size) / trl.orig_size
                    };
                    println!(
                        "  {} bytes, {} chunks, {}% reduction",
                        trl.orig_size,
                        hdr.nr_shas.max(0),
                        reduction
                    );
                }
            }
        }
    }
    Ok(())
}
