//! Manifest codec — versioned, self-describing archive metadata file.
//!
//! # Logical structure
//!
//! ```text
//! global_header
//! (file_header  [digest]*  file_trailer)*
//! eof_header
//! ```
//!
//! # External data representation
//! Every field is encoded XDR-style: fixed-width big-endian integers,
//! length-prefixed UTF-8 strings bounded at `PATH_MAX`, fixed-length
//! opaque byte runs.  Variable-length data pads to 4-byte alignment.
//! This is frozen for manifest version 2; version bumps only append
//! fields behind a version gate.
//!
//! # Beacons
//! Three fixed magics mark structural boundaries: the global header
//! beacon, the per-file header beacon, and the EOF sentinel (a file
//! header whose beacon field holds [`EOF_BEACON`]).  A reader that sees
//! anything else MUST stop; the manifest cannot be framed past that
//! point.
//!
//! # Digest entries
//! With crypto off a digest entry is 20 bytes of content sha.  With
//! crypto on it is sha (20) + csha (20) + iv (16).  The encoded width is
//! probed once per archive from the first entry read, after which
//! non-interesting files are skipped with a single seek.  The width must
//! be re-probed for every archive in a chain because the crypto flag may
//! differ between levels.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::crypto::{Digest, Iv, DIGEST_LEN, IV_LEN};

/// Global header magic.
pub const MANIFEST_BEACON: i32 = 0x4356_4C54;
/// Per-file header magic.
pub const FILE_BEACON:     i32 = 0x4356_4648;
/// EOF sentinel, written in the beacon field of a terminating file header.
pub const EOF_BEACON:      i32 = 0x4356_454F;

/// Current manifest version.  Version 2 added cur_lvl/cwd/paths to the
/// global header; readers accept anything <= this.
pub const MANIFEST_VERSION: i32 = 2;

/// Upper bound on any encoded string.
pub const PATH_MAX: usize = 4096;

/// `nr_shas` sentinel: contents unchanged since the prior level.
pub const SHAS_UNCHANGED: i64 = -1;

// ── Global header flags ──────────────────────────────────────────────────────

/// Digest entries carry csha + iv.
pub const MD_CRYPTO: i32 = 0x1;
/// Every level of the chain carries all file contents.
pub const MD_MLB_ALLFILES: i32 = 0x2;

// ── Archive type ─────────────────────────────────────────────────────────────

pub const ARCHIVE_TYPE_REGULAR: i32 = 0;
pub const ARCHIVE_TYPE_STREAM:  i32 = 1;

// ── File types ───────────────────────────────────────────────────────────────

pub const FT_INVALID: u8 = 0;
pub const FT_DIR:     u8 = 1;
pub const FT_CHR:     u8 = 2;
pub const FT_BLK:     u8 = 3;
pub const FT_REG:     u8 = 4;
pub const FT_FIFO:    u8 = 5;
pub const FT_LINK:    u8 = 6;
pub const FT_SOCK:    u8 = 7;

/// Set on a link-target header's type to mark the entry as a hardlink
/// rather than a symlink.
pub const FT_HARDLINK_BIT: u8 = 0x80;

#[inline]
pub fn is_reg(ftype: u8) -> bool {
    ftype & !FT_HARDLINK_BIT == FT_REG
}

#[inline]
pub fn is_link(ftype: u8) -> bool {
    ftype & !FT_HARDLINK_BIT == FT_LINK
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("not a manifest file (bad beacon {0:#010x})")]
    BadBeacon(i32),
    #[error("unsupported manifest version {found} (this build reads up to {MANIFEST_VERSION})")]
    BadVersion { found: i32 },
    #[error("string of {0} bytes exceeds PATH_MAX")]
    StringTooLong(usize),
    #[error("encoded string is not valid UTF-8")]
    BadString,
    #[error("manifest ended mid-structure")]
    Truncated,
    #[error("multilevel archive requires a basis")]
    MissingBasis,
    #[error("input paths do not match the basis archive")]
    PathMismatch,
    #[error("working directory {cwd} differs from basis {basis}")]
    CwdMismatch { cwd: String, basis: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn eof_as_truncated(e: io::Error) -> ManifestError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ManifestError::Truncated
    } else {
        ManifestError::Io(e)
    }
}

// ── XDR primitives ───────────────────────────────────────────────────────────

fn xdr_pad(n: usize) -> usize {
    (4 - n % 4) % 4
}

fn put_string<W: Write>(w: &mut W, s: &str) -> Result<(), ManifestError> {
    let b = s.as_bytes();
    if b.len() > PATH_MAX {
        return Err(ManifestError::StringTooLong(b.len()));
    }
    w.write_u32::<BigEndian>(b.len() as u32)?;
    w.write_all(b)?;
    w.write_all(&[0u8; 4][..xdr_pad(b.len())])?;
    Ok(())
}

fn get_string<R: Read>(r: &mut R) -> Result<String, ManifestError> {
    let len = r.read_u32::<BigEndian>().map_err(eof_as_truncated)? as usize;
    if len > PATH_MAX {
        return Err(ManifestError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len + xdr_pad(len)];
    r.read_exact(&mut buf).map_err(eof_as_truncated)?;
    buf.truncate(len);
    String::from_utf8(buf).map_err(|_| ManifestError::BadString)
}

fn put_opaque<W: Write>(w: &mut W, b: &[u8]) -> Result<(), ManifestError> {
    w.write_all(b)?;
    w.write_all(&[0u8; 4][..xdr_pad(b.len())])?;
    Ok(())
}

fn get_opaque<R: Read>(r: &mut R, b: &mut [u8]) -> Result<(), ManifestError> {
    r.read_exact(b).map_err(eof_as_truncated)?;
    let pad = xdr_pad(b.len());
    if pad > 0 {
        let mut junk = [0u8; 4];
        r.read_exact(&mut junk[..pad]).map_err(eof_as_truncated)?;
    }
    Ok(())
}

// ── Structures ───────────────────────────────────────────────────────────────

/// Fields of the manifest global header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeader {
    pub version:      i32,
    pub chunk_size:   i32,
    pub created:      i64,
    pub archive_type: i32,
    pub flags:        i32,
    /// Name of the prior-level manifest; empty = level 0 / standalone.
    pub prevlvl:      String,
    pub cur_lvl:      i32,
    pub cwd:          String,
    pub paths:        Vec<String>,
}

impl GlobalHeader {
    #[inline] pub fn crypto(&self)   -> bool { self.flags & MD_CRYPTO != 0 }
    #[inline] pub fn allfiles(&self) -> bool { self.flags & MD_MLB_ALLFILES != 0 }

    pub fn prevlvl(&self) -> Option<&str> {
        if self.prevlvl.is_empty() {
            None
        } else {
            Some(&self.prevlvl)
        }
    }
}

/// One per-file metadata header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub nr_shas:  i64,
    pub uid:      u32,
    pub gid:      u32,
    pub mode:     u32,
    pub rdev:     i32,
    pub atime:    i64,
    pub mtime:    i64,
    pub ftype:    u8,
    pub filename: String,
}

/// Result of a header read: a file entry or the EOF sentinel.
#[derive(Debug)]
pub enum Entry {
    File(FileHeader),
    Eof,
}

/// One digest-list entry; shape depends on the archive's crypto flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestEntry {
    Plain(Digest),
    Crypto { sha: Digest, csha: Digest, iv: Iv },
}

impl DigestEntry {
    /// The digest the chunk is fetched by: csha when crypto is on.
    pub fn stored_digest(&self) -> &Digest {
        match self {
            DigestEntry::Plain(sha) => sha,
            DigestEntry::Crypto { csha, .. } => csha,
        }
    }

    pub fn content_digest(&self) -> &Digest {
        match self {
            DigestEntry::Plain(sha) => sha,
            DigestEntry::Crypto { sha, .. } => sha,
        }
    }
}

/// Per-file trailer: whole-file digest and size accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub sha:       Digest,
    pub orig_size: u64,
    pub comp_size: u64,
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ManifestWriter<W: Write> {
    w:      W,
    crypto: bool,
    closed: bool,
}

impl ManifestWriter<BufWriter<File>> {
    /// Create a manifest file and write its global header.
    ///
    /// `basis` must be given for any level > 0.
    #[allow(clippy::too_many_arguments)]
    pub fn create<P: AsRef<Path>>(
        path:         P,
        archive_type: i32,
        basis:        Option<&str>,
        level:        i32,
        chunk_size:   i32,
        flags:        i32,
        cwd:          &str,
        paths:        &[String],
    ) -> Result<Self, ManifestError> {
        if level != 0 && basis.is_none() {
            return Err(ManifestError::MissingBasis);
        }
        let gh = GlobalHeader {
            version:      MANIFEST_VERSION,
            chunk_size,
            created:      chrono::Utc::now().timestamp(),
            archive_type,
            flags,
            prevlvl:      basis.unwrap_or("").to_owned(),
            cur_lvl:      level,
            cwd:          cwd.to_owned(),
            paths:        paths.to_vec(),
        };
        Self::from_writer(BufWriter::new(File::create(path)?), &gh)
    }
}

impl<W: Write> ManifestWriter<W> {
    /// Write a global header into `w` and return the writer.
    /// Always emits [`MANIFEST_VERSION`] regardless of `gh.version`.
    pub fn from_writer(mut w: W, gh: &GlobalHeader) -> Result<Self, ManifestError> {
        w.write_i32::<BigEndian>(MANIFEST_BEACON)?;
        w.write_i32::<BigEndian>(MANIFEST_VERSION)?;
        w.write_i32::<BigEndian>(gh.chunk_size)?;
        w.write_i64::<BigEndian>(gh.created)?;
        w.write_i32::<BigEndian>(gh.archive_type)?;
        w.write_i32::<BigEndian>(gh.flags)?;
        put_string(&mut w, &gh.prevlvl)?;
        w.write_i32::<BigEndian>(gh.cur_lvl)?;
        put_string(&mut w, &gh.cwd)?;
        w.write_i32::<BigEndian>(gh.paths.len() as i32)?;
        for p in &gh.paths {
            put_string(&mut w, p)?;
        }
        Ok(ManifestWriter {
            w,
            crypto: gh.flags & MD_CRYPTO != 0,
            closed: false,
        })
    }

    #[inline]
    pub fn crypto(&self) -> bool {
        self.crypto
    }

    pub fn write_header(&mut self, hdr: &FileHeader) -> Result<(), ManifestError> {
        self.write_header_raw(FILE_BEACON, hdr)
    }

    /// Second header following a symlink/hardlink entry: carries the link
    /// target in the filename field.  `hardlink` sets [`FT_HARDLINK_BIT`].
    pub fn write_link_target(&mut self, target: &str, hardlink: bool) -> Result<(), ManifestError> {
        let ftype = if hardlink { FT_LINK | FT_HARDLINK_BIT } else { FT_LINK };
        self.write_header_raw(FILE_BEACON, &FileHeader {
            ftype,
            filename: target.to_owned(),
            ..FileHeader::default()
        })
    }

    fn write_header_raw(&mut self, beacon: i32, hdr: &FileHeader) -> Result<(), ManifestError> {
        self.w.write_i32::<BigEndian>(beacon)?;
        self.w.write_i64::<BigEndian>(hdr.nr_shas)?;
        self.w.write_u32::<BigEndian>(hdr.uid)?;
        self.w.write_u32::<BigEndian>(hdr.gid)?;
        self.w.write_u32::<BigEndian>(hdr.mode)?;
        self.w.write_i32::<BigEndian>(hdr.rdev)?;
        self.w.write_i64::<BigEndian>(hdr.atime)?;
        self.w.write_i64::<BigEndian>(hdr.mtime)?;
        self.w.write_u8(hdr.ftype)?;
        self.w.write_all(&[0u8; 3])?; // pad the type byte
        put_string(&mut self.w, &hdr.filename)?;
        Ok(())
    }

    pub fn write_digest(&mut self, entry: &DigestEntry) -> Result<(), ManifestError> {
        match (self.crypto, entry) {
            (false, DigestEntry::Plain(sha)) => put_opaque(&mut self.w, sha),
            (true, DigestEntry::Crypto { sha, csha, iv }) => {
                put_opaque(&mut self.w, sha)?;
                put_opaque(&mut self.w, csha)?;
                put_opaque(&mut self.w, iv)
            }
            // Entry shape must match the archive's crypto flag.
            _ => Err(ManifestError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "digest entry shape does not match archive crypto flag",
            ))),
        }
    }

    pub fn write_trailer(&mut self, trl: &Trailer) -> Result<(), ManifestError> {
        put_opaque(&mut self.w, &trl.sha)?;
        self.w.write_u64::<BigEndian>(trl.orig_size)?;
        self.w.write_u64::<BigEndian>(trl.comp_size)?;
        Ok(())
    }

    /// Emit the EOF header and flush.  Must be called exactly once; a
    /// writer dropped without `close()` leaves a manifest that readers
    /// will report as truncated.
    pub fn close(mut self) -> Result<(), ManifestError> {
        self.write_eof()?;
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }

    /// EOF header without consuming the writer; used on abnormal
    /// shutdown so a partial manifest still lists.
    pub fn write_eof(&mut self) -> Result<(), ManifestError> {
        if self.closed {
            return Ok(());
        }
        self.write_header_raw(EOF_BEACON, &FileHeader::default())?;
        self.w.flush()?;
        self.closed = true;
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct ManifestReader<R: Read + Seek> {
    r:            R,
    gh:           GlobalHeader,
    /// Encoded width of one digest entry, probed from the first entry read.
    digest_width: Option<u64>,
}

impl ManifestReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ManifestReader<R> {
    /// Read and validate the global header.
    ///
    /// Accepts any version <= [`MANIFEST_VERSION`]; below version 2 the
    /// cur_lvl/cwd/paths block is absent and left empty.
    pub fn from_reader(mut r: R) -> Result<Self, ManifestError> {
        let beacon = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        if beacon != MANIFEST_BEACON {
            return Err(ManifestError::BadBeacon(beacon));
        }
        let version = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        if version > MANIFEST_VERSION {
            return Err(ManifestError::BadVersion { found: version });
        }
        let chunk_size   = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        let created      = r.read_i64::<BigEndian>().map_err(eof_as_truncated)?;
        let archive_type = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        let flags        = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        let prevlvl      = get_string(&mut r)?;

        let (cur_lvl, cwd, paths) = if version >= 2 {
            let cur_lvl = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
            let cwd = get_string(&mut r)?;
            let n = r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
            let mut paths = Vec::with_capacity(n.max(0) as usize);
            for _ in 0..n.max(0) {
                paths.push(get_string(&mut r)?);
            }
            (cur_lvl, cwd, paths)
        } else {
            (0, String::new(), Vec::new())
        };

        Ok(ManifestReader {
            r,
            gh: GlobalHeader {
                version,
                chunk_size,
                created,
                archive_type,
                flags,
                prevlvl,
                cur_lvl,
                cwd,
                paths,
            },
            digest_width: None,
        })
    }

    #[inline]
    pub fn global(&self) -> &GlobalHeader {
        &self.gh
    }

    pub fn read_header(&mut self) -> Result<Entry, ManifestError> {
        let beacon = self.r.read_i32::<BigEndian>().map_err(eof_as_truncated)?;
        let mut hdr = FileHeader {
            nr_shas: self.r.read_i64::<BigEndian>().map_err(eof_as_truncated)?,
            uid:     self.r.read_u32::<BigEndian>().map_err(eof_as_truncated)?,
            gid:     self.r.read_u32::<BigEndian>().map_err(eof_as_truncated)?,
            mode:    self.r.read_u32::<BigEndian>().map_err(eof_as_truncated)?,
            rdev:    self.r.read_i32::<BigEndian>().map_err(eof_as_truncated)?,
            atime:   self.r.read_i64::<BigEndian>().map_err(eof_as_truncated)?,
            mtime:   self.r.read_i64::<BigEndian>().map_err(eof_as_truncated)?,
            ftype:   0,
            filename: String::new(),
        };
        hdr.ftype = self.r.read_u8().map_err(eof_as_truncated)?;
        let mut pad = [0u8; 3];
        self.r.read_exact(&mut pad).map_err(eof_as_truncated)?;
        hdr.filename = get_string(&mut self.r)?;

        match beacon {
            FILE_BEACON => Ok(Entry::File(hdr)),
            EOF_BEACON  => Ok(Entry::Eof),
            other       => Err(ManifestError::BadBeacon(other)),
        }
    }

    pub fn read_digest(&mut self) -> Result<DigestEntry, ManifestError> {
        let pos0 = if self.digest_width.is_none() {
            Some(self.r.stream_position()?)
        } else {
            None
        };
        let entry = if self.gh.crypto() {
            let mut sha = [0u8; DIGEST_LEN];
            let mut csha = [0u8; DIGEST_LEN];
            let mut iv = [0u8; IV_LEN];
            get_opaque(&mut self.r, &mut sha)?;
            get_opaque(&mut self.r, &mut csha)?;
            get_opaque(&mut self.r, &mut iv)?;
            DigestEntry::Crypto { sha, csha, iv }
        } else {
            let mut sha = [0u8; DIGEST_LEN];
            get_opaque(&mut self.r, &mut sha)?;
            DigestEntry::Plain(sha)
        };
        if let Some(p0) = pos0 {
            self.digest_width = Some(self.r.stream_position()? - p0);
        }
        Ok(entry)
    }

    /// Skip `count` digest entries with one seek.
    ///
    /// The entry width is probed from the first digest actually decoded;
    /// when no digest has been read from this archive yet, one entry is
    /// consumed to learn it.
    pub fn skip_digests(&mut self, count: i64) -> Result<(), ManifestError> {
        let mut remaining = count;
        if remaining <= 0 {
            return Ok(());
        }
        if self.digest_width.is_none() {
            self.read_digest()?;
            remaining -= 1;
        }
        let width = self.digest_width.unwrap_or(0);
        if remaining > 0 {
            self.r.seek(SeekFrom::Current(width as i64 * remaining))?;
        }
        Ok(())
    }

    pub fn read_trailer(&mut self) -> Result<Trailer, ManifestError> {
        let mut sha = [0u8; DIGEST_LEN];
        get_opaque(&mut self.r, &mut sha)?;
        Ok(Trailer {
            sha,
            orig_size: self.r.read_u64::<BigEndian>().map_err(eof_as_truncated)?,
            comp_size: self.r.read_u64::<BigEndian>().map_err(eof_as_truncated)?,
        })
    }
}

// ── Basis / chain helpers ────────────────────────────────────────────────────

/// Open a basis manifest and compute the level of the archive about to be
/// taken on top of it.
///
/// Returns 0 (forced full re-base) once `max_differentials` levels exist;
/// `max_differentials` of 0 means unlimited.  The input path list must
/// equal the basis's recorded list, and for relative paths the working
/// directory must match too.
pub fn basis_setup(
    basis:             &str,
    paths:             &[String],
    cwd:               &str,
    max_differentials: i32,
) -> Result<(i32, i64), ManifestError> {
    let rdr = ManifestReader::open(basis)?;
    let gh = rdr.global();

    let nextlvl = if max_differentials == 0 || gh.cur_lvl < max_differentials {
        gh.cur_lvl + 1
    } else {
        0
    };

    if gh.version >= 2 {
        if gh.paths.len() != paths.len()
            || gh.paths.iter().zip(paths).any(|(a, b)| a != b)
        {
            return Err(ManifestError::PathMismatch);
        }
        let rooted = paths.iter().all(|p| p.starts_with('/'));
        if !rooted && !gh.cwd.is_empty() && gh.cwd != cwd {
            return Err(ManifestError::CwdMismatch {
                cwd:   cwd.to_owned(),
                basis: gh.cwd.clone(),
            });
        }
    }

    Ok((nextlvl, gh.created))
}

/// Report the prior-level name recorded in a manifest, if any.
pub fn check_prev<P: AsRef<Path>>(path: P) -> Result<Option<String>, ManifestError> {
    let rdr = ManifestReader::open(path)?;
    Ok(rdr.global().prevlvl().map(str::to_owned))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn gh(flags: i32) -> GlobalHeader {
        GlobalHeader {
            version:      MANIFEST_VERSION,
            chunk_size:   256 * 1024,
            created:      1_700_000_000,
            archive_type: ARCHIVE_TYPE_REGULAR,
            flags,
            prevlvl:      String::new(),
            cur_lvl:      0,
            cwd:          "/tmp".into(),
            paths:        vec!["a".into(), "b/c".into()],
        }
    }

    fn reg_header(name: &str, nr_shas: i64) -> FileHeader {
        FileHeader {
            nr_shas,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            rdev: 0,
            atime: 1_700_000_001,
            mtime: 1_700_000_002,
            ftype: FT_REG,
            filename: name.into(),
        }
    }

    #[test]
    fn global_header_round_trip() {
        let mut buf = Vec::new();
        let w = ManifestWriter::from_writer(&mut buf, &gh(MD_CRYPTO)).unwrap();
        w.close().unwrap();

        let rdr = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let got = rdr.global();
        assert_eq!(got.chunk_size, 256 * 1024);
        assert!(got.crypto());
        assert!(!got.allfiles());
        assert_eq!(got.paths, vec!["a".to_string(), "b/c".to_string()]);
        assert_eq!(got.cwd, "/tmp");
    }

    #[test]
    fn file_entries_round_trip() {
        let mut buf = Vec::new();
        let mut w = ManifestWriter::from_writer(&mut buf, &gh(0)).unwrap();
        w.write_header(&reg_header("f1", 2)).unwrap();
        w.write_digest(&DigestEntry::Plain([0xaa; DIGEST_LEN])).unwrap();
        w.write_digest(&DigestEntry::Plain([0xbb; DIGEST_LEN])).unwrap();
        w.write_trailer(&Trailer {
            sha: [0xcc; DIGEST_LEN],
            orig_size: 100,
            comp_size: 60,
        }).unwrap();
        w.close().unwrap();

        let mut r = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let hdr = match r.read_header().unwrap() {
            Entry::File(h) => h,
            Entry::Eof => panic!("unexpected EOF"),
        };
        assert_eq!(hdr.filename, "f1");
        assert_eq!(hdr.nr_shas, 2);
        assert_eq!(r.read_digest().unwrap(), DigestEntry::Plain([0xaa; DIGEST_LEN]));
        assert_eq!(r.read_digest().unwrap(), DigestEntry::Plain([0xbb; DIGEST_LEN]));
        let trl = r.read_trailer().unwrap();
        assert_eq!(trl.orig_size, 100);
        assert_eq!(trl.comp_size, 60);
        assert!(matches!(r.read_header().unwrap(), Entry::Eof));
    }

    #[test]
    fn link_target_header() {
        let mut buf = Vec::new();
        let mut w = ManifestWriter::from_writer(&mut buf, &gh(0)).unwrap();
        let mut sym = reg_header("link", 0);
        sym.ftype = FT_LINK;
        w.write_header(&sym).unwrap();
        w.write_link_target("target", true).unwrap();
        w.close().unwrap();

        let mut r = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let Entry::File(h1) = r.read_header().unwrap() else { panic!() };
        assert!(is_link(h1.ftype));
        let Entry::File(h2) = r.read_header().unwrap() else { panic!() };
        assert_eq!(h2.filename, "target");
        assert_ne!(h2.ftype & FT_HARDLINK_BIT, 0);
    }

    #[test]
    fn skip_digests_lands_on_trailer() {
        let mut buf = Vec::new();
        let mut w = ManifestWriter::from_writer(&mut buf, &gh(MD_CRYPTO)).unwrap();
        w.write_header(&reg_header("big", 5)).unwrap();
        for i in 0..5u8 {
            w.write_digest(&DigestEntry::Crypto {
                sha:  [i; DIGEST_LEN],
                csha: [i + 10; DIGEST_LEN],
                iv:   [i + 20; IV_LEN],
            }).unwrap();
        }
        w.write_trailer(&Trailer {
            sha: [0xee; DIGEST_LEN],
            orig_size: 5,
            comp_size: 5,
        }).unwrap();
        w.close().unwrap();

        let mut r = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let Entry::File(h) = r.read_header().unwrap() else { panic!() };
        r.skip_digests(h.nr_shas).unwrap();
        assert_eq!(r.read_trailer().unwrap().sha, [0xee; DIGEST_LEN]);
    }

    #[test]
    fn unchanged_sentinel_survives() {
        let mut buf = Vec::new();
        let mut w = ManifestWriter::from_writer(&mut buf, &gh(0)).unwrap();
        w.write_header(&reg_header("same", SHAS_UNCHANGED)).unwrap();
        w.close().unwrap();

        let mut r = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let Entry::File(h) = r.read_header().unwrap() else { panic!() };
        assert_eq!(h.nr_shas, SHAS_UNCHANGED);
    }

    #[test]
    fn rejects_future_version() {
        let mut buf = Vec::new();
        let w = ManifestWriter::from_writer(&mut buf, &gh(0)).unwrap();
        w.close().unwrap();
        // Patch the version field (bytes 4..8) to something newer.
        buf[4..8].copy_from_slice(&(MANIFEST_VERSION + 1).to_be_bytes());
        assert!(matches!(
            ManifestReader::from_reader(Cursor::new(buf)),
            Err(ManifestError::BadVersion { .. })
        ));
    }

    #[test]
    fn truncated_manifest_reports_truncation() {
        let mut buf = Vec::new();
        let mut w = ManifestWriter::from_writer(&mut buf, &gh(0)).unwrap();
        w.write_header(&reg_header("f", 1)).unwrap();
        // No digest, no trailer, no EOF: drop the writer mid-file.
        drop(w);
        let mut r = ManifestReader::from_reader(Cursor::new(buf)).unwrap();
        let Entry::File(_) = r.read_header().unwrap() else { panic!() };
        assert!(matches!(r.read_digest(), Err(ManifestError::Truncated)));
    }
}
