use super::*;
use crate::feed::memory::MemoryFeed;
use crate::manifest::ContentId;
use crate::testutil::{digest_of, file_for, record_with_issue, revision_id};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    packager: Packager,
    feed: MemoryFeed,
    head: RevisionHead,
}

fn content_id(data: &[u8]) -> ContentId {
    ContentId::parse(&format!("{}.sha256", digest_of(data)), data.len() as u64).unwrap()
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let boot_dir = dir.path().join("boot");
    let staging_dir = dir.path().join("staging");
    let out_dir = dir.path().join("out");
    for d in [&boot_dir, &staging_dir, &out_dir] {
        fs::create_dir_all(d).unwrap();
    }
    fs::write(boot_dir.join("initrd"), b"initrd-v1").unwrap();

    let (feed, _tx) = MemoryFeed::new();
    feed.add_local_blob(b"kernel-v2");
    let head = record_with_issue(
        &revision_id(2),
        json!({
            "kernels": {"bzImage": file_for(b"kernel-v2")},
            "initcpios": {
                "initrd": file_for(b"initrd-v1"),
                "initrd.fallback": file_for(b"initrd-v1"),
            },
        }),
        Some(&revision_id(1)),
        Some(&revision_id(1)),
        2,
    );
    let packager = Packager {
        staging_dir,
        output: out_dir.join("update.tar"),
        boot_dir,
    };
    Fixture {
        _dir: dir,
        packager,
        feed,
        head,
    }
}

fn items() -> Vec<DiffItem> {
    vec![
        DiffItem::Fetch {
            filename: "bzImage".to_owned(),
            checksum: content_id(b"kernel-v2"),
        },
        DiffItem::Reuse {
            filename: "initrd.fallback".to_owned(),
            checksum: content_id(b"initrd-v1"),
            source: "initrd".to_owned(),
        },
        DiffItem::Generated {
            filename: "loader/loader.conf".to_owned(),
            content: "timeout\t5\n".to_owned(),
        },
    ]
}

fn staging_is_empty(packager: &Packager) -> bool {
    fs::read_dir(&packager.staging_dir).unwrap().next().is_none()
}

#[test]
fn test_package_layout() {
    let f = fixture();
    f.packager
        .write(&f.head, &items(), &f.feed, Ulid::new())
        .unwrap();

    let mut archive = tar::Archive::new(File::open(&f.packager.output).unwrap());
    let mut seen = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let header = entry.header();
        assert_eq!(header.mode().unwrap(), 0o644);
        assert_eq!(header.mtime().unwrap(), 0);
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
        let name = entry.path().unwrap().display().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        seen.push((name, content));
    }

    let names: Vec<_> = seen.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        [ISSUE_FILE_NAME, "bzImage", "initrd.fallback", "loader/loader.conf"]
    );
    assert_eq!(seen[0].1, f.head.to_pretty_json().unwrap().as_bytes());
    assert_eq!(seen[1].1, b"kernel-v2");
    assert_eq!(seen[2].1, b"initrd-v1");
    assert_eq!(seen[3].1, b"timeout\t5\n");

    assert!(staging_is_empty(&f.packager));
}

#[test]
fn test_package_is_reproducible() {
    let f = fixture();
    f.packager
        .write(&f.head, &items(), &f.feed, Ulid::new())
        .unwrap();
    let first = fs::read(&f.packager.output).unwrap();
    f.packager
        .write(&f.head, &items(), &f.feed, Ulid::new())
        .unwrap();
    assert_eq!(fs::read(&f.packager.output).unwrap(), first);
}

#[test]
fn test_read_back_issue_and_entries() {
    let f = fixture();
    f.packager
        .write(&f.head, &items(), &f.feed, Ulid::new())
        .unwrap();

    let issue = read_issue(&f.packager.output).unwrap();
    let current = crate::manifest::CurrentSystem::from_json(&issue).unwrap();
    assert_eq!(current.key.as_deref(), Some(f.head.key()));
    assert_eq!(&current.issue, f.head.issue());

    let entries = list_entries(&f.packager.output).unwrap();
    assert_eq!(entries.len(), 4);
    assert_eq!(
        entries[1],
        PackageEntry {
            name: "bzImage".to_owned(),
            size: 9,
        }
    );
}

#[test]
fn test_read_issue_requires_issue_entry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("other.tar");
    let mut builder = tar::Builder::new(File::create(&path).unwrap());
    append_entry(&mut builder, "bzImage", 3, &b"abc"[..]).unwrap();
    builder.finish().unwrap();
    drop(builder);

    let err = read_issue(&path).unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid manifest: No entry for treos-issue.json found in tar"
    );
}

#[test]
fn test_corrupt_last_entry_leaves_no_output() {
    let f = fixture();
    let mut items = items();
    items[2] = DiffItem::Fetch {
        filename: "rootfs".to_owned(),
        checksum: content_id(b"rootfs-v2"),
    };
    // Same length, different bytes.
    f.feed.add_blob_as(&digest_of(b"rootfs-v2"), b"rootfs-XX");

    let err = f
        .packager
        .write(&f.head, &items, &f.feed, Ulid::new())
        .unwrap_err();
    assert!(matches!(err, UpdateError::Integrity { ref filename, .. } if filename == "rootfs"));
    assert!(!f.packager.output.exists());
    assert!(staging_is_empty(&f.packager));
}

#[test]
fn test_failure_keeps_previous_output() {
    let f = fixture();
    fs::write(&f.packager.output, b"previous package").unwrap();
    fs::write(f.packager.boot_dir.join("initrd"), b"initrd-XX").unwrap();

    let err = f
        .packager
        .write(&f.head, &items(), &f.feed, Ulid::new())
        .unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Integrity { ref filename, .. } if filename == "initrd.fallback"
    ));
    assert_eq!(fs::read(&f.packager.output).unwrap(), b"previous package");
    assert!(staging_is_empty(&f.packager));
}

#[test]
fn test_missing_blob_is_retrieval_error() {
    let f = fixture();
    let items = [DiffItem::Fetch {
        filename: "rootfs".to_owned(),
        checksum: content_id(b"never published"),
    }];
    let err = f
        .packager
        .write(&f.head, &items, &f.feed, Ulid::new())
        .unwrap_err();
    assert!(matches!(err, UpdateError::Retrieval(_)));
    assert!(!f.packager.output.exists());
}

#[test]
fn test_copy_across_writes_sibling_then_renames() {
    let f = fixture();
    let mut staged = tempfile::NamedTempFile::new_in(&f.packager.staging_dir).unwrap();
    staged.write_all(b"package bytes").unwrap();

    copy_across(staged, &f.packager.output).unwrap();
    assert_eq!(fs::read(&f.packager.output).unwrap(), b"package bytes");
    let mode = fs::metadata(&f.packager.output).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o644);
    assert!(staging_is_empty(&f.packager));
}
