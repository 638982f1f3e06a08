//! Tests for append-only (WORM) subtree enforcement.

use std::fs;

use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use similar_asserts::assert_eq;

use sentryfs::{test::TestOverlay, OverlayError};

fn write_file(t: &TestOverlay, path: &str, data: &[u8]) {
    let fh = t
        .overlay
        .create_file(
            path,
            OFlags::WRONLY | OFlags::TRUNC,
            Mode::from_raw_mode(0o644),
        )
        .unwrap();
    t.overlay.write(path, fh, 0, data).unwrap();
    t.overlay.release(fh).unwrap();
}

fn assert_denied(err: OverlayError) {
    assert!(matches!(err, OverlayError::AppendOnly { .. }), "{err:?}");
    assert_eq!(err.errno(), Errno::PERM);
}

fn logs_fixture() -> TestOverlay {
    let t = TestOverlay::with_worm("logs");
    fs::create_dir(t.backing.path().join("logs")).unwrap();
    write_file(&t, "/logs/a.txt", b"log line one\n");
    t
}

#[test]
fn test_create_and_append_allowed() {
    let t = logs_fixture();

    // appending to an existing file stays legal
    let fh = t.overlay.open_file("/logs/a.txt", OFlags::WRONLY).unwrap();
    t.overlay.write("/logs/a.txt", fh, 13, b"log line two\n").unwrap();
    t.overlay.release(fh).unwrap();

    let fh = t.overlay.open_file("/logs/a.txt", OFlags::RDONLY).unwrap();
    assert_eq!(
        t.overlay.read("/logs/a.txt", fh, 0, 64).unwrap(),
        b"log line one\nlog line two\n"
    );
    t.overlay.release(fh).unwrap();
}

#[test]
fn test_unlink_denied() {
    let t = logs_fixture();
    assert_denied(t.overlay.unlink("/logs/a.txt").unwrap_err());
    assert!(t.backing.path().join("logs/a.txt").exists());
}

#[test]
fn test_truncate_denied() {
    let t = logs_fixture();
    assert_denied(t.overlay.truncate("/logs/a.txt", 0).unwrap_err());
    // a shrinking truncate is no different from a full one
    assert_denied(t.overlay.truncate("/logs/a.txt", 5).unwrap_err());
}

#[test]
fn test_truncating_open_denied() {
    let t = logs_fixture();
    assert_denied(
        t.overlay
            .open_file("/logs/a.txt", OFlags::WRONLY | OFlags::TRUNC)
            .unwrap_err(),
    );
}

#[test]
fn test_truncating_create_of_existing_file_denied() {
    let t = logs_fixture();
    assert_denied(
        t.overlay
            .create_file(
                "/logs/a.txt",
                OFlags::WRONLY | OFlags::TRUNC,
                Mode::from_raw_mode(0o644),
            )
            .unwrap_err(),
    );
    // but a brand-new file is still creatable
    write_file(&t, "/logs/b.txt", b"fresh\n");
    assert_eq!(
        fs::read(t.backing.path().join("logs/b.txt")).unwrap(),
        b"fresh\n"
    );
}

#[test]
fn test_rename_out_denied() {
    let t = logs_fixture();
    assert_denied(t.overlay.rename("/logs/a.txt", "/outside.txt").unwrap_err());
}

#[test]
fn test_rename_in_denied() {
    let t = logs_fixture();
    write_file(&t, "/outside.txt", b"smuggled\n");
    assert_denied(t.overlay.rename("/outside.txt", "/logs/inside.txt").unwrap_err());
}

#[test]
fn test_rename_within_denied() {
    let t = logs_fixture();
    assert_denied(t.overlay.rename("/logs/a.txt", "/logs/b.txt").unwrap_err());
}

#[test]
fn test_policy_is_lexical() {
    let t = logs_fixture();
    // sibling directory whose name merely shares the prefix
    write_file(&t, "/logs2.txt", b"unprotected\n");
    t.overlay.unlink("/logs2.txt").unwrap();
}

#[test]
fn test_xattrs_still_allowed_under_worm() {
    let t = logs_fixture();
    t.overlay
        .set_xattr("/logs/a.txt", "user.source", b"daemon")
        .unwrap();
    assert_eq!(
        t.overlay.xattr("/logs/a.txt", "user.source").unwrap(),
        b"daemon"
    );
}

#[test]
fn test_operations_outside_worm_unaffected() {
    let t = logs_fixture();
    write_file(&t, "/free.txt", b"hello\n");
    t.overlay.truncate("/free.txt", 2).unwrap();
    t.overlay.rename("/free.txt", "/renamed.txt").unwrap();
    t.overlay.unlink("/renamed.txt").unwrap();
}
