//! The process-wide table of open handles.
//!
//! Every open or create issues a handle id to the dispatch layer; the table
//! tracks, per handle, the backing file descriptor, whether the handle is a
//! reader or a writer, the writer's running checksum accumulator, and the
//! reader's verification verdict. A secondary multimap from virtual path to
//! handle ids lets cross-handle operations (truncate, rename) find every
//! open handle on a path.
//!
//! Verification verdicts are per-handle, never per-path: two concurrent
//! readers of the same file verify independently, so one cannot vouch for
//! the other. A handle that has gone bad stays bad until it is closed.
//!
//! All mutation goes through one internal lock, which is never held across
//! host I/O; callers snapshot what they need (an `Arc` of the descriptor)
//! and drop the lock before touching the backing filesystem.

use std::{
    collections::{HashMap, HashSet},
    os::fd::OwnedFd,
    sync::{Arc, Mutex},
};

use crate::digest::Fnv64;

#[derive(Debug)]
enum Role {
    Reader {
        /// None until the first read verifies; then the cached verdict.
        verdict: Option<bool>,
    },
    Writer {
        /// The running accumulator, for modes that keep one.
        digest: Option<Fnv64>,
    },
}

#[derive(Debug)]
struct Record {
    path: String,
    fd: Arc<OwnedFd>,
    role: Role,
}

#[derive(Debug, Default)]
struct Inner {
    next_fh: u64,
    records: HashMap<u64, Record>,
    by_path: HashMap<String, HashSet<u64>>,
}

/// How a read on a handle should be gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadGate {
    /// Writer handles serve reads unverified; their accumulator is the
    /// authoritative view.
    Writer,
    /// Verified against the stored digest earlier in this handle's life.
    VerifiedOk,
    /// Failed verification earlier; fail the read without rescanning.
    VerifiedBad,
    /// Not verified yet; the caller must verify before serving bytes.
    Unverified,
}

/// What `close` hands back for the release path.
#[derive(Debug)]
pub enum ClosedHandle {
    Reader {
        path: String,
        fd: Arc<OwnedFd>,
    },
    Writer {
        path: String,
        fd: Arc<OwnedFd>,
        digest: Option<Fnv64>,
    },
}

/// The table itself. One per mount.
#[derive(Debug, Default)]
pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl HandleTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(inner: &mut Inner, path: &str, fd: OwnedFd, role: Role) -> u64 {
        inner.next_fh += 1;
        let fh = inner.next_fh;
        inner.records.insert(
            fh,
            Record {
                path: path.to_string(),
                fd: Arc::new(fd),
                role,
            },
        );
        inner.by_path.entry(path.to_string()).or_default().insert(fh);
        fh
    }

    /// Register a reader handle.
    pub fn open_reader(&self, path: &str, fd: OwnedFd) -> u64 {
        let mut inner = self.lock();
        Self::insert(&mut inner, path, fd, Role::Reader { verdict: None })
    }

    /// Register a writer handle, unless one is already open on `path`.
    pub fn open_writer(&self, path: &str, fd: OwnedFd, digest: Option<Fnv64>) -> Option<u64> {
        let mut inner = self.lock();
        let writer_open = inner
            .by_path
            .get(path)
            .into_iter()
            .flatten()
            .any(|fh| matches!(inner.records[fh].role, Role::Writer { .. }));
        if writer_open {
            return None;
        }
        Some(Self::insert(&mut inner, path, fd, Role::Writer { digest }))
    }

    /// The backing descriptor of a handle.
    pub fn fd(&self, fh: u64) -> Option<Arc<OwnedFd>> {
        self.lock().records.get(&fh).map(|r| Arc::clone(&r.fd))
    }

    /// Snapshot the descriptor and read gate of a handle.
    pub fn gate(&self, fh: u64) -> Option<(Arc<OwnedFd>, ReadGate)> {
        let inner = self.lock();
        let record = inner.records.get(&fh)?;
        let gate = match record.role {
            Role::Writer { .. } => ReadGate::Writer,
            Role::Reader { verdict: None } => ReadGate::Unverified,
            Role::Reader {
                verdict: Some(true),
            } => ReadGate::VerifiedOk,
            Role::Reader {
                verdict: Some(false),
            } => ReadGate::VerifiedBad,
        };
        Some((Arc::clone(&record.fd), gate))
    }

    /// Record a reader's verification verdict.
    ///
    /// A handle that has gone bad never transitions back to ok; only
    /// closing it clears the verdict.
    pub fn set_verdict(&self, fh: u64, ok: bool) {
        let mut inner = self.lock();
        if let Some(Record {
            role: Role::Reader { verdict },
            ..
        }) = inner.records.get_mut(&fh)
        {
            if *verdict == Some(false) {
                return;
            }
            *verdict = Some(ok);
        }
    }

    /// Fold a write payload into the handle's accumulator, where one exists.
    pub fn writer_update(&self, fh: u64, buf: &[u8]) {
        let mut inner = self.lock();
        if let Some(Record {
            role: Role::Writer {
                digest: Some(digest),
            },
            ..
        }) = inner.records.get_mut(&fh)
        {
            digest.update(buf);
        }
    }

    /// Whether the handle is a writer.
    pub fn is_writer(&self, fh: u64) -> bool {
        matches!(
            self.lock().records.get(&fh),
            Some(Record {
                role: Role::Writer { .. },
                ..
            })
        )
    }

    /// Reset the accumulator of every open writer on `path` to `digest`,
    /// so folds after a truncate stay consistent with the backing content.
    pub fn reset_writers(&self, path: &str, digest: Fnv64) {
        let mut inner = self.lock();
        let handles: Vec<u64> = inner
            .by_path
            .get(path)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for fh in handles {
            if let Some(Record {
                role: Role::Writer { digest: acc },
                ..
            }) = inner.records.get_mut(&fh)
            {
                if acc.is_some() {
                    *acc = Some(digest);
                }
            }
        }
    }

    /// Every open handle on `path`.
    pub fn open_handles(&self, path: &str) -> Vec<u64> {
        self.lock()
            .by_path
            .get(path)
            .into_iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Relabel open handles after a successful rename, including handles on
    /// entries below a renamed directory.
    pub fn rename(&self, old: &str, new: &str) {
        let mut inner = self.lock();
        let prefix = format!("{old}/");
        let affected: Vec<(String, HashSet<u64>)> = inner
            .by_path
            .iter()
            .filter(|(path, _)| path.as_str() == old || path.starts_with(&prefix))
            .map(|(path, handles)| (path.clone(), handles.clone()))
            .collect();
        for (path, handles) in affected {
            let renamed = format!("{new}{}", &path[old.len()..]);
            for &fh in &handles {
                if let Some(record) = inner.records.get_mut(&fh) {
                    record.path = renamed.clone();
                }
            }
            inner.by_path.remove(&path);
            inner.by_path.entry(renamed).or_default().extend(handles);
        }
    }

    /// Remove a handle from the table and hand back what the release path
    /// needs. The descriptor closes when the last `Arc` drops.
    pub fn close(&self, fh: u64) -> Option<ClosedHandle> {
        let mut inner = self.lock();
        let record = inner.records.remove(&fh)?;
        if let Some(handles) = inner.by_path.get_mut(&record.path) {
            handles.remove(&fh);
            if handles.is_empty() {
                inner.by_path.remove(&record.path);
            }
        }
        Some(match record.role {
            Role::Reader { .. } => ClosedHandle::Reader {
                path: record.path,
                fd: record.fd,
            },
            Role::Writer { digest } => ClosedHandle::Writer {
                path: record.path,
                fd: record.fd,
                digest,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use rustix::fs::{open, Mode, OFlags};

    use super::*;

    fn devnull() -> OwnedFd {
        open("/dev/null", OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()).unwrap()
    }

    #[test]
    fn test_reader_verdict_lifecycle() {
        let table = HandleTable::default();
        let fh = table.open_reader("/f", devnull());

        let (_, gate) = table.gate(fh).unwrap();
        assert_eq!(gate, ReadGate::Unverified);

        table.set_verdict(fh, true);
        assert_eq!(table.gate(fh).unwrap().1, ReadGate::VerifiedOk);

        table.set_verdict(fh, false);
        assert_eq!(table.gate(fh).unwrap().1, ReadGate::VerifiedBad);

        // bad never transitions back to ok while the handle lives
        table.set_verdict(fh, true);
        assert_eq!(table.gate(fh).unwrap().1, ReadGate::VerifiedBad);

        assert!(matches!(
            table.close(fh),
            Some(ClosedHandle::Reader { .. })
        ));
        assert!(table.gate(fh).is_none());
    }

    #[test]
    fn test_independent_reader_verdicts() {
        let table = HandleTable::default();
        let a = table.open_reader("/f", devnull());
        let b = table.open_reader("/f", devnull());

        table.set_verdict(a, false);
        assert_eq!(table.gate(a).unwrap().1, ReadGate::VerifiedBad);
        assert_eq!(table.gate(b).unwrap().1, ReadGate::Unverified);
    }

    #[test]
    fn test_single_writer() {
        let table = HandleTable::default();
        let fh = table.open_writer("/f", devnull(), Some(Fnv64::new())).unwrap();

        // a second writer on the same path is refused
        assert!(table.open_writer("/f", devnull(), Some(Fnv64::new())).is_none());
        // readers are unaffected, as are writers elsewhere
        let _ = table.open_reader("/f", devnull());
        assert!(table.open_writer("/g", devnull(), None).is_some());

        table.close(fh);
        assert!(table.open_writer("/f", devnull(), None).is_some());
    }

    #[test]
    fn test_writer_accumulator() {
        let table = HandleTable::default();
        let fh = table.open_writer("/f", devnull(), Some(Fnv64::new())).unwrap();

        table.writer_update(fh, b"hello");
        table.writer_update(fh, b" world\n");

        let Some(ClosedHandle::Writer {
            digest: Some(digest),
            ..
        }) = table.close(fh)
        else {
            panic!("expected a writer with an accumulator");
        };
        assert_eq!(digest, Fnv64::of_bytes(b"hello world\n"));
    }

    #[test]
    fn test_seedless_writer_stays_seedless() {
        let table = HandleTable::default();
        let fh = table.open_writer("/f", devnull(), None).unwrap();
        table.writer_update(fh, b"ignored");
        // reset only touches handles that carry an accumulator
        table.reset_writers("/f", Fnv64::of_bytes(b"x"));

        let Some(ClosedHandle::Writer { digest, .. }) = table.close(fh) else {
            panic!("expected a writer");
        };
        assert!(digest.is_none());
    }

    #[test]
    fn test_reset_writers() {
        let table = HandleTable::default();
        let fh = table.open_writer("/f", devnull(), Some(Fnv64::new())).unwrap();
        table.writer_update(fh, b"scribble");

        let base = Fnv64::of_bytes(b"truncated content");
        table.reset_writers("/f", base);
        table.writer_update(fh, b"!");

        let Some(ClosedHandle::Writer {
            digest: Some(digest),
            ..
        }) = table.close(fh)
        else {
            panic!("expected a writer with an accumulator");
        };
        let mut expected = base;
        expected.update(b"!");
        assert_eq!(digest, expected);
    }

    #[test]
    fn test_rename_moves_handles() {
        let table = HandleTable::default();
        let fh = table.open_writer("/dir/f", devnull(), Some(Fnv64::new())).unwrap();
        table.rename("/dir", "/moved");

        assert!(table.open_handles("/dir/f").is_empty());
        assert_eq!(table.open_handles("/moved/f"), vec![fh]);

        let Some(ClosedHandle::Writer { path, .. }) = table.close(fh) else {
            panic!("expected a writer");
        };
        assert_eq!(path, "/moved/f");
    }

    #[test]
    fn test_unknown_handle() {
        let table = HandleTable::default();
        assert!(table.fd(42).is_none());
        assert!(table.gate(42).is_none());
        assert!(table.close(42).is_none());
    }
}
