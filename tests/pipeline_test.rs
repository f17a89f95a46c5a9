//! End-to-end pipeline tests against the in-memory chunk server.

mod common;

use std::fs::{self, File};
use std::io::Read as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use chunkvault::archive::{enumerate, ArchiveDriver, FileNode};
use chunkvault::compress::CompFamily;
use chunkvault::crypto::{digest_hex, Keys};
use chunkvault::extract::ExtractDriver;
use chunkvault::manifest::{
    DigestEntry, Entry, ManifestReader, ManifestWriter, Trailer, ARCHIVE_TYPE_REGULAR,
    MD_CRYPTO, MD_MLB_ALLFILES,
};
use chunkvault::pattern::{MatchMode, Matcher};
use chunkvault::pipeline::{Engine, EngineError, EngineOpts, Stats};
use chunkvault::session::Session;
use chunkvault::trans::QUEUE_DEPTH;
use common::SharedServer;

// ── Harness ──────────────────────────────────────────────────────────────────

struct Setup {
    chunk:    usize,
    depth:    usize,
    comp:     CompFamily,
    secret:   Option<Vec<u8>>,
    allfiles: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Setup {
            chunk:    1024,
            depth:    QUEUE_DEPTH,
            comp:     CompFamily::Zstd,
            secret:   None,
            allfiles: false,
        }
    }
}

impl Setup {
    fn opts(&self, keep_going: bool) -> EngineOpts {
        EngineOpts {
            chunk_size:  self.chunk,
            queue_depth: self.depth,
            comp:        self.comp,
            keys:        self.secret.as_ref().map(|s| Keys::derive(s).unwrap()),
            keep_going,
        }
    }

    fn flags(&self) -> i32 {
        (if self.secret.is_some() { MD_CRYPTO } else { 0 })
            | (if self.allfiles { MD_MLB_ALLFILES } else { 0 })
    }

    fn archive_nodes(
        &self,
        server: &SharedServer,
        md:     &Path,
        files:  Vec<FileNode>,
        basis:  Option<(&str, i32)>,
    ) -> Stats {
        let writer = ManifestWriter::create(
            md,
            ARCHIVE_TYPE_REGULAR,
            basis.map(|(b, _)| b),
            basis.map(|(_, l)| l).unwrap_or(0),
            self.chunk as i32,
            self.flags(),
            "/",
            &[],
        )
        .unwrap();
        let mut eng = Engine::new(Session::new(server.clone()), self.opts(false));
        let mut driver = ArchiveDriver::new(writer, files);
        eng.run(&mut driver).unwrap();
        eng.stats.clone()
    }

    fn archive(&self, server: &SharedServer, md: &Path, root: &Path) -> Stats {
        let files = enumerate(&[root.to_string_lossy().into_owned()], None, false).unwrap();
        self.archive_nodes(server, md, files, None)
    }

    fn extract(&self, server: &SharedServer, md: &Path, dest: &Path) -> Stats {
        let matcher = Matcher::compile(MatchMode::Glob, &[]).unwrap();
        let mut driver =
            ExtractDriver::new(&md.to_string_lossy(), dest, matcher).unwrap();
        let mut eng = Engine::new(Session::new(server.clone()), self.opts(false));
        eng.run(&mut driver).unwrap();
        eng.stats.clone()
    }
}

/// Where an absolute source path lands below the extraction root.
fn dest_of(dest: &Path, src: &Path) -> PathBuf {
    dest.join(
        src.to_string_lossy()
            .trim_start_matches('/')
            .to_owned(),
    )
}

fn read_manifest_entries(md: &Path) -> Vec<(String, i64, Vec<DigestEntry>, Option<Trailer>)> {
    let mut rdr = ManifestReader::open(md).unwrap();
    let mut out = Vec::new();
    loop {
        match rdr.read_header().unwrap() {
            Entry::Eof => break,
            Entry::File(hdr) => {
                if chunkvault::manifest::is_link(hdr.ftype) {
                    let Entry::File(_) = rdr.read_header().unwrap() else { panic!() };
                }
                let mut digests = Vec::new();
                let mut trailer = None;
                if chunkvault::manifest::is_reg(hdr.ftype) {
                    if hdr.nr_shas > 0 {
                        for _ in 0..hdr.nr_shas {
                            digests.push(rdr.read_digest().unwrap());
                        }
                    }
                    trailer = Some(rdr.read_trailer().unwrap());
                }
                out.push((hdr.filename.clone(), hdr.nr_shas, digests, trailer));
            }
        }
    }
    out
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn archive_single_small_file() {
    let src = TempDir::new().unwrap();
    let f = src.path().join("abc.txt");
    fs::write(&f, b"abc").unwrap();
    fs::set_permissions(&f, fs::Permissions::from_mode(0o644)).unwrap();

    let server = SharedServer::new();
    let md = src.path().join("out.cvm");
    let setup = Setup {
        comp: CompFamily::None,
        chunk: 256 * 1024,
        ..Setup::default()
    };
    // Archive only the one file, not the temp dir around it.
    let files = enumerate(&[f.to_string_lossy().into_owned()], None, false).unwrap();
    setup.archive_nodes(&server, &md, files, None);

    let entries = read_manifest_entries(&md);
    assert_eq!(entries.len(), 1);
    let (name, nr_shas, digests, trailer) = &entries[0];
    assert!(name.ends_with("abc.txt"));
    assert_eq!(*nr_shas, 1);
    assert_eq!(
        digest_hex(digests[0].content_digest()),
        "a9993e364706816aba3e25717850c26c9cd0d89d"
    );
    let trl = trailer.unwrap();
    assert_eq!(trl.orig_size, 3);
    assert_eq!(trl.comp_size, 3);
    assert_eq!(digest_hex(&trl.sha), "a9993e364706816aba3e25717850c26c9cd0d89d");
}

#[test]
fn identical_files_write_one_chunk() {
    let src = TempDir::new().unwrap();
    let payload = vec![b'a'; 4000];
    fs::write(src.path().join("f1"), &payload).unwrap();
    fs::write(src.path().join("f2"), &payload).unwrap();

    let server = SharedServer::new();
    let md = TempDir::new().unwrap();
    let setup = Setup {
        chunk: 4096,
        comp: CompFamily::None,
        ..Setup::default()
    };
    let stats = setup.archive(&server, &md.path().join("m.cvm"), src.path());

    let srv = server.0.borrow();
    // Both chunks race past their EXISTS lookups before the first WRITE
    // lands; the server answers the loser with S_EXISTS.  Exactly one
    // unique digest ever reaches the store.
    assert_eq!(srv.store.len(), 1);
    let unique: std::collections::HashSet<_> = srv.writes.iter().collect();
    assert_eq!(unique.len(), 1);
    assert!(
        srv.write_status
            .iter()
            .filter(|s| **s == chunkvault::Status::Exists)
            .count()
            + stats.dedup_hits as usize
            >= 1,
        "duplicate chunk resolved without storing twice"
    );
}

#[test]
fn round_trip_tree() {
    let src = TempDir::new().unwrap();
    let sub = src.path().join("sub/deeper");
    fs::create_dir_all(&sub).unwrap();
    let big: Vec<u8> = (0u32..3000).map(|i| (i * 7 % 251) as u8).collect();
    fs::write(src.path().join("big.bin"), &big).unwrap();
    fs::write(src.path().join("empty"), b"").unwrap();
    fs::write(sub.join("note.txt"), b"hello from below").unwrap();
    std::os::unix::fs::symlink("big.bin", src.path().join("link")).unwrap();
    fs::set_permissions(
        src.path().join("big.bin"),
        fs::Permissions::from_mode(0o640),
    )
    .unwrap();

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("tree.cvm");
    let setup = Setup {
        chunk: 1024,
        depth: 3,
        ..Setup::default()
    };
    setup.archive(&server, &md, src.path());

    let dest = TempDir::new().unwrap();
    let stats = setup.extract(&server, &md, dest.path());
    assert_eq!(stats.integrity_failures, 0);

    let out_big = dest_of(dest.path(), &src.path().join("big.bin"));
    assert_eq!(fs::read(&out_big).unwrap(), big);
    assert_eq!(
        fs::metadata(&out_big).unwrap().permissions().mode() & 0o7777,
        0o640
    );
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("empty"))).unwrap(),
        b""
    );
    assert_eq!(
        fs::read(dest_of(dest.path(), &sub.join("note.txt"))).unwrap(),
        b"hello from below"
    );
    let link = dest_of(dest.path(), &src.path().join("link"));
    assert_eq!(
        fs::read_link(&link).unwrap().to_string_lossy(),
        "big.bin"
    );
}

#[test]
fn crypto_round_trip_and_iv_determinism() {
    let src = TempDir::new().unwrap();
    let data: Vec<u8> = (0u32..5000).map(|i| (i % 13) as u8).collect();
    fs::write(src.path().join("secret.dat"), &data).unwrap();

    let mddir = TempDir::new().unwrap();
    let setup = Setup {
        chunk: 1024,
        secret: Some(b"hunter2".to_vec()),
        ..Setup::default()
    };

    let server = SharedServer::new();
    let md_a = mddir.path().join("a.cvm");
    let md_b = mddir.path().join("b.cvm");
    setup.archive(&server, &md_a, src.path());
    let stats_b = setup.archive(&server, &md_b, src.path());

    // Second run re-archives identical plaintext: every chunk dedups.
    assert!(stats_b.dedup_hits >= 5);

    let ents_a = read_manifest_entries(&md_a);
    let ents_b = read_manifest_entries(&md_b);
    let dig_a: Vec<_> = ents_a.iter().flat_map(|e| e.2.clone()).collect();
    let dig_b: Vec<_> = ents_b.iter().flat_map(|e| e.2.clone()).collect();
    assert!(!dig_a.is_empty());
    assert_eq!(dig_a, dig_b, "same data + same secret = same (sha, csha, iv) lists");
    assert!(matches!(dig_a[0], DigestEntry::Crypto { .. }));

    let dest = TempDir::new().unwrap();
    setup.extract(&server, &md_a, dest.path());
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("secret.dat"))).unwrap(),
        data
    );
}

#[test]
fn exact_chunk_multiple_has_no_empty_tail() {
    let src = TempDir::new().unwrap();
    let data = vec![0xabu8; 2048];
    fs::write(src.path().join("even.bin"), &data).unwrap();

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("even.cvm");
    let setup = Setup {
        chunk: 1024,
        comp: CompFamily::None,
        ..Setup::default()
    };
    setup.archive(&server, &md, src.path());

    let entries = read_manifest_entries(&md);
    let file = entries.iter().find(|e| e.0.ends_with("even.bin")).unwrap();
    assert_eq!(file.1, 2, "exactly size/chunk digests");
    assert_eq!(file.2.len(), 2);
}

#[test]
fn reordered_replies_still_complete_in_order() {
    let src = TempDir::new().unwrap();
    let data: Vec<u8> = (0u32..9000).map(|i| (i % 256) as u8).collect();
    fs::write(src.path().join("seq.bin"), &data).unwrap();

    let server = SharedServer::new();
    // Hold every reply until the client blocks, then release the batch
    // in reverse: completions arrive out of order, the manifest must
    // not.
    server.0.borrow_mut().reorder_window = usize::MAX;

    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("seq.cvm");
    let setup = Setup {
        chunk: 1024,
        ..Setup::default()
    };
    setup.archive(&server, &md, src.path());
    server.0.borrow_mut().reorder_window = usize::MAX;

    let dest = TempDir::new().unwrap();
    setup.extract(&server, &md, dest.path());
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("seq.bin"))).unwrap(),
        data
    );
}

#[test]
fn source_truncated_mid_archive() {
    let src = TempDir::new().unwrap();
    let f = src.path().join("shrink.bin");
    fs::write(&f, vec![7u8; 8192]).unwrap();

    // Stat happens at enumeration; the file shrinks before the read
    // stage gets to it.
    let files = enumerate(&[f.to_string_lossy().into_owned()], None, false).unwrap();
    let handle = File::options().write(true).open(&f).unwrap();
    handle.set_len(3000).unwrap();
    drop(handle);

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("shrink.cvm");
    let setup = Setup {
        chunk: 1024,
        comp: CompFamily::None,
        ..Setup::default()
    };
    setup.archive_nodes(&server, &md, files, None);

    // The archive completed and is EOF-terminated; the header still
    // carries the stat-time count but the trailer records what was
    // actually hashed.
    let mut rdr = ManifestReader::open(&md).unwrap();
    let Entry::File(hdr) = rdr.read_header().unwrap() else { panic!() };
    assert_eq!(hdr.nr_shas, 8);
    for _ in 0..3 {
        rdr.read_digest().unwrap();
    }
    let trl = rdr.read_trailer().unwrap();
    assert_eq!(trl.orig_size, 3000);
    assert!(matches!(rdr.read_header().unwrap(), Entry::Eof));
}

#[test]
fn missing_chunk_fails_extract_without_partial_file() {
    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("ghost.cvm");
    let mut w = ManifestWriter::create(
        &md,
        ARCHIVE_TYPE_REGULAR,
        None,
        0,
        1024,
        0,
        "/",
        &[],
    )
    .unwrap();
    w.write_header(&chunkvault::manifest::FileHeader {
        nr_shas: 1,
        mode: 0o644,
        ftype: chunkvault::manifest::FT_REG,
        filename: "ghost.bin".into(),
        ..Default::default()
    })
    .unwrap();
    w.write_digest(&DigestEntry::Plain([0xde; 20])).unwrap();
    w.write_trailer(&Trailer {
        sha: [0xde; 20],
        orig_size: 10,
        comp_size: 10,
    })
    .unwrap();
    w.close().unwrap();

    let server = SharedServer::new();
    let dest = TempDir::new().unwrap();
    let matcher = Matcher::compile(MatchMode::Glob, &[]).unwrap();
    let mut driver =
        ExtractDriver::new(&md.to_string_lossy(), dest.path(), matcher).unwrap();
    let mut eng = Engine::new(
        Session::new(server.clone()),
        Setup::default().opts(false),
    );
    let err = eng.run(&mut driver).unwrap_err();
    assert!(matches!(err, EngineError::Presence { .. }));
    assert_eq!(err.exit_code(), 3);

    driver.discard_partial();
    assert!(!dest.path().join("ghost.bin").exists());
}

#[test]
fn differential_chain_backward_walk() {
    let src = TempDir::new().unwrap();
    fs::write(src.path().join("stable.txt"), b"stays the same").unwrap();
    fs::write(src.path().join("moving.txt"), b"version one").unwrap();

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md0 = mddir.path().join("level0.cvm");
    let md1 = mddir.path().join("level1.cvm");
    let setup = Setup {
        chunk: 1024,
        ..Setup::default()
    };

    setup.archive(&server, &md0, src.path());

    // Level 1: one file changed, the other recorded as unchanged.
    fs::write(src.path().join("moving.txt"), b"version two, longer").unwrap();
    let mut files =
        enumerate(&[src.path().to_string_lossy().into_owned()], None, false).unwrap();
    for node in &mut files {
        if node.name.ends_with("stable.txt") {
            node.skip = true;
        }
    }
    setup.archive_nodes(
        &server,
        &md1,
        files,
        Some((&md0.to_string_lossy(), 1)),
    );

    let dest = TempDir::new().unwrap();
    setup.extract(&server, &md1, dest.path());
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("stable.txt"))).unwrap(),
        b"stays the same"
    );
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("moving.txt"))).unwrap(),
        b"version two, longer"
    );
}

#[test]
fn allfiles_chain_forward_walk() {
    let src = TempDir::new().unwrap();
    fs::write(src.path().join("a.txt"), b"alpha").unwrap();
    fs::write(src.path().join("b.txt"), b"beta").unwrap();

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md0 = mddir.path().join("full0.cvm");
    let md1 = mddir.path().join("full1.cvm");
    let setup = Setup {
        chunk: 1024,
        allfiles: true,
        ..Setup::default()
    };

    setup.archive(&server, &md0, src.path());
    fs::write(src.path().join("b.txt"), b"beta prime").unwrap();
    let files =
        enumerate(&[src.path().to_string_lossy().into_owned()], None, true).unwrap();
    setup.archive_nodes(&server, &md1, files, Some((&md0.to_string_lossy(), 1)));

    let dest = TempDir::new().unwrap();
    setup.extract(&server, &md1, dest.path());
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("a.txt"))).unwrap(),
        b"alpha"
    );
    // The later level wins.
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("b.txt"))).unwrap(),
        b"beta prime"
    );
}

#[test]
fn backpressure_with_depth_one() {
    let src = TempDir::new().unwrap();
    let data: Vec<u8> = (0u32..5000).map(|i| (i % 199) as u8).collect();
    fs::write(src.path().join("slow.bin"), &data).unwrap();

    let server = SharedServer::new();
    let mddir = TempDir::new().unwrap();
    let md = mddir.path().join("one.cvm");
    let setup = Setup {
        chunk: 512,
        depth: 1,
        ..Setup::default()
    };
    setup.archive(&server, &md, src.path());

    let dest = TempDir::new().unwrap();
    setup.extract(&server, &md, dest.path());
    assert_eq!(
        fs::read(dest_of(dest.path(), &src.path().join("slow.bin"))).unwrap(),
        data
    );
}

#[test]
fn manifest_push_fetch_round_trip() {
    use chunkvault::control::{md_close, md_delete, md_list, md_open, MdFetchDriver, MdPushDriver};

    let dir = TempDir::new().unwrap();
    let src_path = dir.path().join("local.cvm");
    let payload: Vec<u8> = (0u32..10_000).map(|i| (i % 241) as u8).collect();
    fs::write(&src_path, &payload).unwrap();

    let server = SharedServer::new();
    let setup = Setup {
        chunk: 1024,
        ..Setup::default()
    };

    // Push.
    let mut session = Session::new(server.clone());
    md_open(&mut session, "local.cvm", true).unwrap();
    let mut eng = Engine::new(session, setup.opts(false));
    let mut driver =
        MdPushDriver::new("local.cvm", File::open(&src_path).unwrap()).unwrap();
    eng.run(&mut driver).unwrap();
    let mut session = eng.into_session();
    md_close(&mut session).unwrap();

    assert!(md_list(&mut session).unwrap().contains(&"local.cvm".to_string()));

    // Fetch into a fresh file.
    let fetched = dir.path().join("fetched.cvm");
    md_open(&mut session, "local.cvm", false).unwrap();
    let mut eng = Engine::new(session, setup.opts(false));
    let mut driver = MdFetchDriver::new("local.cvm", File::create(&fetched).unwrap());
    eng.run(&mut driver).unwrap();
    let mut session = eng.into_session();
    md_close(&mut session).unwrap();

    let mut got = Vec::new();
    File::open(&fetched).unwrap().read_to_end(&mut got).unwrap();
    assert_eq!(got, payload);

    // Delete removes it from the listing.
    md_delete(&mut session, "local.cvm").unwrap();
    assert!(md_list(&mut session).unwrap().is_empty());
}
