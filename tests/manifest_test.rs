//! Manifest canonical encoding and chain bookkeeping.

use std::io::Cursor;

use tempfile::TempDir;

use chunkvault::manifest::{
    basis_setup, check_prev, DigestEntry, Entry, FileHeader, GlobalHeader, ManifestError,
    ManifestReader, ManifestWriter, Trailer, ARCHIVE_TYPE_REGULAR, FT_REG,
    MANIFEST_VERSION, MD_CRYPTO,
};

fn build(gh: &GlobalHeader, files: &[(FileHeader, Vec<DigestEntry>, Trailer)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut w = ManifestWriter::from_writer(&mut buf, gh).unwrap();
    for (hdr, digests, trl) in files {
        w.write_header(hdr).unwrap();
        for d in digests {
            w.write_digest(d).unwrap();
        }
        w.write_trailer(trl).unwrap();
    }
    w.close().unwrap();
    buf
}

/// write(read(M)) == M, byte for byte: the encoding is canonical.
#[test]
fn canonical_round_trip() {
    let gh = GlobalHeader {
        version:      MANIFEST_VERSION,
        chunk_size:   262_144,
        created:      1_699_999_999,
        archive_type: ARCHIVE_TYPE_REGULAR,
        flags:        MD_CRYPTO,
        prevlvl:      "base.cvm".into(),
        cur_lvl:      1,
        cwd:          "/var/backups".into(),
        paths:        vec!["etc".into(), "srv/data".into()],
    };
    let files = vec![(
        FileHeader {
            nr_shas: 2,
            uid: 0,
            gid: 0,
            mode: 0o600,
            rdev: 0,
            atime: 1_600_000_000,
            mtime: 1_600_000_001,
            ftype: FT_REG,
            filename: "etc/passwd".into(),
        },
        vec![
            DigestEntry::Crypto { sha: [1; 20], csha: [2; 20], iv: [3; 16] },
            DigestEntry::Crypto { sha: [4; 20], csha: [5; 20], iv: [6; 16] },
        ],
        Trailer { sha: [7; 20], orig_size: 300_000, comp_size: 120_000 },
    )];
    let original = build(&gh, &files);

    // Read every structure back out.
    let mut rdr = ManifestReader::from_reader(Cursor::new(original.clone())).unwrap();
    let gh2 = rdr.global().clone();
    let mut files2 = Vec::new();
    loop {
        match rdr.read_header().unwrap() {
            Entry::Eof => break,
            Entry::File(hdr) => {
                let mut digests = Vec::new();
                for _ in 0..hdr.nr_shas {
                    digests.push(rdr.read_digest().unwrap());
                }
                let trl = rdr.read_trailer().unwrap();
                files2.push((hdr, digests, trl));
            }
        }
    }

    let rewritten = build(&gh2, &files2);
    assert_eq!(rewritten, original);
}

#[test]
fn basis_setup_levels_and_rebase() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("l2.cvm");
    let paths = vec!["data".to_string()];
    let w = ManifestWriter::create(
        &base,
        ARCHIVE_TYPE_REGULAR,
        Some("l1.cvm"),
        2,
        262_144,
        0,
        "/work",
        &paths,
    )
    .unwrap();
    w.close().unwrap();
    let bpath = base.to_string_lossy().into_owned();

    // Unlimited differentials: next level is 3.
    let (lvl, _) = basis_setup(&bpath, &paths, "/work", 0).unwrap();
    assert_eq!(lvl, 3);

    // Cap reached: forced back to a full archive.
    let (lvl, _) = basis_setup(&bpath, &paths, "/work", 2).unwrap();
    assert_eq!(lvl, 0);

    // Path list must match the basis.
    let err = basis_setup(&bpath, &["other".to_string()], "/work", 0);
    assert!(matches!(err, Err(ManifestError::PathMismatch)));

    // Relative paths need the same working directory.
    let err = basis_setup(&bpath, &paths, "/elsewhere", 0);
    assert!(matches!(err, Err(ManifestError::CwdMismatch { .. })));
}

#[test]
fn check_prev_reports_the_chain_link() {
    let dir = TempDir::new().unwrap();
    let full = dir.path().join("full.cvm");
    ManifestWriter::create(&full, ARCHIVE_TYPE_REGULAR, None, 0, 262_144, 0, "/", &[])
        .unwrap()
        .close()
        .unwrap();
    assert_eq!(check_prev(&full).unwrap(), None);

    let diff = dir.path().join("diff.cvm");
    ManifestWriter::create(
        &diff,
        ARCHIVE_TYPE_REGULAR,
        Some("full.cvm"),
        1,
        262_144,
        0,
        "/",
        &[],
    )
    .unwrap()
    .close()
    .unwrap();
    assert_eq!(check_prev(&diff).unwrap(), Some("full.cvm".into()));
}
