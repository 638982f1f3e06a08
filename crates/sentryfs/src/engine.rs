//! The integrity engine.
//!
//! One [`Overlay`] value per mount owns every collaborator: the path
//! mapper, the sidecar store, the WORM policy and the handle table. The
//! dispatch adapter calls into it for every operation that touches
//! checksum or xattr state; pure pass-throughs (getattr, readdir, mkdir…)
//! only need [`Overlay::backing_path`].
//!
//! Locking is strictly layered: handle-table lock, then sidecar lock, then
//! host I/O with no lock held. No operation ever holds both locks at once.

use std::{
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};

use rustix::{
    buffer::spare_capacity,
    fs::{open, Mode, OFlags},
    io::{pread, pwrite},
};

use crate::{
    blocks,
    digest::Fnv64,
    error::{OverlayError, Result},
    handle::{ClosedHandle, HandleTable, ReadGate},
    paths::PathMapper,
    sidecar::Sidecar,
    worm::WormPolicy,
};

/// When writer opens are verified against the stored digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Verify and pre-load the accumulator on every non-truncating writer
    /// open; publish the accumulator on release.
    #[default]
    Strict,
    /// Skip the open-time check; recompute the digest from the backing
    /// file on writer release. Safe for random-write workloads.
    Relaxed,
}

impl FromStr for VerifyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(VerifyMode::Strict),
            "relaxed" => Ok(VerifyMode::Relaxed),
            other => Err(format!("unknown verify mode {other:?}")),
        }
    }
}

/// Checksum granularity for the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    /// One running digest per file, maintained across a writer's life.
    #[default]
    WholeFile,
    /// One digest per 4096-byte block; random writes become cheap
    /// read-modify-write cycles.
    Block,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(Granularity::WholeFile),
            "block" => Ok(Granularity::Block),
            other => Err(format!("unknown checksum granularity {other:?}")),
        }
    }
}

/// Mount-time configuration for an [`Overlay`].
#[derive(Debug)]
pub struct OverlayConfig {
    /// The backing directory the overlay mirrors.
    pub backing: PathBuf,
    /// Append-only subtree prefixes.
    pub worm: WormPolicy,
    /// Writer-open verification behaviour.
    pub verify: VerifyMode,
    /// Whole-file or per-block checksums.
    pub granularity: Granularity,
}

impl OverlayConfig {
    pub fn new(backing: impl Into<PathBuf>) -> Self {
        Self {
            backing: backing.into(),
            worm: WormPolicy::default(),
            verify: VerifyMode::default(),
            granularity: Granularity::default(),
        }
    }
}

/// The per-mount integrity engine.
#[derive(Debug)]
pub struct Overlay {
    paths: PathMapper,
    sidecar: Sidecar,
    worm: WormPolicy,
    handles: HandleTable,
    verify: VerifyMode,
    granularity: Granularity,
}

impl Overlay {
    /// Open the overlay over `config.backing`, creating the sidecar
    /// database (and its schema) if it does not exist yet.
    pub fn open(config: OverlayConfig) -> Result<Self> {
        let paths = PathMapper::new(&config.backing);
        let root = paths.root();
        if !root.is_dir() {
            return Err(OverlayError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backing directory {} does not exist", root.display()),
            )));
        }
        let sidecar = Sidecar::open_in(&root)?;
        Ok(Self {
            paths,
            sidecar,
            worm: config.worm,
            handles: HandleTable::default(),
            verify: config.verify,
            granularity: config.granularity,
        })
    }

    /// The backing path for a virtual path.
    pub fn backing_path(&self, vpath: &str) -> PathBuf {
        self.paths.backing(vpath)
    }

    /// The backing root directory.
    pub fn backing_root(&self) -> PathBuf {
        self.paths.root()
    }

    /// Direct access to the sidecar store.
    pub fn sidecar(&self) -> &Sidecar {
        &self.sidecar
    }

    /// Whether `vpath` lies in an append-only subtree.
    pub fn is_append_only(&self, vpath: &str) -> bool {
        self.worm.is_append_only(vpath)
    }

    /// The stored whole-file digest, parsed. Read-path sidecar failures are
    /// logged and treated as "no stored digest" (unprotected).
    fn stored_digest(&self, vpath: &str) -> Option<u64> {
        let raw = match self.sidecar.get_digest(vpath) {
            Ok(raw) => raw?,
            Err(err) => {
                log::warn!("sidecar lookup failed for {vpath}: {err}");
                return None;
            }
        };
        match Fnv64::parse_hex(&raw) {
            Some(value) => Some(value),
            None => {
                log::warn!("unparseable stored digest for {vpath}: {raw:?}");
                None
            }
        }
    }

    /// The accumulator seed for a truncating or freshly-created writer.
    fn fresh_seed(&self) -> Option<Fnv64> {
        match (self.granularity, self.verify) {
            (Granularity::Block, _) => None,
            (Granularity::WholeFile, VerifyMode::Strict) => Some(Fnv64::new()),
            (Granularity::WholeFile, VerifyMode::Relaxed) => None,
        }
    }

    /// The accumulator seed for a non-truncating writer open. In strict
    /// whole-file mode this re-verifies the stored digest against the
    /// current backing content and pre-loads the accumulator from it.
    fn append_seed(&self, vpath: &str, real: &Path) -> Result<Option<Fnv64>> {
        match (self.granularity, self.verify) {
            (Granularity::Block, _) => Ok(None),
            (Granularity::WholeFile, VerifyMode::Relaxed) => Ok(None),
            (Granularity::WholeFile, VerifyMode::Strict) => {
                let found = Fnv64::of_file(real)?;
                if let Some(stored) = self.stored_digest(vpath) {
                    if stored != found.value() {
                        log::error!("{vpath} failed verification on writer open");
                        return Err(OverlayError::DigestMismatch {
                            path: vpath.to_string(),
                            stored: format!("{stored:016x}"),
                            found: found.to_hex(),
                        });
                    }
                }
                Ok(Some(found))
            }
        }
    }

    /// Open an existing file. Returns the handle id to hand to the
    /// dispatch layer.
    pub fn open_file(&self, vpath: &str, flags: OFlags) -> Result<u64> {
        log::trace!("open({vpath}, {flags:?})");
        if flags.contains(OFlags::TRUNC) && self.worm.is_append_only(vpath) {
            return Err(OverlayError::append_only("truncating open", vpath));
        }

        let mut flags = flags | OFlags::CLOEXEC;
        let accmode = flags & OFlags::ACCMODE;
        let write_capable = accmode == OFlags::WRONLY || accmode == OFlags::RDWR;
        if write_capable && accmode == OFlags::WRONLY && self.granularity == Granularity::Block {
            // pre-image verification reads back through this descriptor
            flags.remove(OFlags::ACCMODE);
            flags.insert(OFlags::RDWR);
        }

        let real = self.paths.backing(vpath);
        let fd = open(&real, flags, Mode::empty())?;

        if flags.contains(OFlags::TRUNC) && self.granularity == Granularity::Block {
            // the open just truncated the backing file to zero; rows left
            // behind would fail the next pre-image check
            self.sidecar.del_blocks(vpath)?;
        }

        if !write_capable {
            return Ok(self.handles.open_reader(vpath, fd));
        }
        let seed = if flags.contains(OFlags::TRUNC) {
            self.fresh_seed()
        } else {
            // fd drops (and closes) if this open is rejected
            self.append_seed(vpath, &real)?
        };
        self.handles
            .open_writer(vpath, fd, seed)
            .ok_or_else(|| OverlayError::WriterBusy {
                path: vpath.to_string(),
            })
    }

    /// Create a file and open it as a fresh writer.
    ///
    /// Creation is legal even under an append-only prefix; truncating an
    /// existing file through a create is not, so under WORM the create is
    /// forced exclusive and an existing file is a policy violation.
    pub fn create_file(&self, vpath: &str, flags: OFlags, mode: Mode) -> Result<u64> {
        log::trace!("create({vpath}, {flags:?})");
        let mut flags = flags | OFlags::CREATE | OFlags::CLOEXEC;
        let worm_trunc = flags.contains(OFlags::TRUNC) && self.worm.is_append_only(vpath);
        if worm_trunc {
            flags.insert(OFlags::EXCL);
        }
        if self.granularity == Granularity::Block && (flags & OFlags::ACCMODE) == OFlags::WRONLY {
            flags.remove(OFlags::ACCMODE);
            flags.insert(OFlags::RDWR);
        }

        let real = self.paths.backing(vpath);
        let fd = match open(&real, flags, mode) {
            Ok(fd) => fd,
            Err(err) if err == rustix::io::Errno::EXIST && worm_trunc => {
                return Err(OverlayError::append_only("truncating create", vpath));
            }
            Err(err) => return Err(err.into()),
        };

        if flags.contains(OFlags::TRUNC) && self.granularity == Granularity::Block {
            // an existing file was just truncated to zero; drop its rows
            // before the first pre-image check sees them
            self.sidecar.del_blocks(vpath)?;
        }

        self.handles
            .open_writer(vpath, fd, self.fresh_seed())
            .ok_or_else(|| OverlayError::WriterBusy {
                path: vpath.to_string(),
            })
    }

    /// Verify an unverified reader handle against the stored digest and
    /// cache the verdict on the handle.
    fn verify_reader(&self, vpath: &str, fh: u64) -> Result<()> {
        let Some(stored) = self.stored_digest(vpath) else {
            // no stored digest: the file is unprotected
            self.handles.set_verdict(fh, true);
            return Ok(());
        };
        let found = Fnv64::of_file(self.paths.backing(vpath))?;
        if found.value() == stored {
            self.handles.set_verdict(fh, true);
            Ok(())
        } else {
            log::error!("{vpath} failed verification on read");
            self.handles.set_verdict(fh, false);
            Err(OverlayError::DigestMismatch {
                path: vpath.to_string(),
                stored: format!("{stored:016x}"),
                found: found.to_hex(),
            })
        }
    }

    /// Read up to `size` bytes at `offset`.
    pub fn read(&self, vpath: &str, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let (fd, gate) = self.handles.gate(fh).ok_or(OverlayError::BadHandle(fh))?;

        if self.granularity == Granularity::Block {
            let mut buf = Vec::with_capacity(size);
            pread(&*fd, spare_capacity(&mut buf), offset)?;
            blocks::verify_range(&self.sidecar, vpath, &fd, offset, buf.len())?;
            return Ok(buf);
        }

        match gate {
            // a writer's accumulator is the authoritative view for its own
            // handle; serve without re-verifying
            ReadGate::Writer | ReadGate::VerifiedOk => {}
            ReadGate::VerifiedBad => {
                return Err(OverlayError::VerificationFailed {
                    path: vpath.to_string(),
                })
            }
            ReadGate::Unverified => self.verify_reader(vpath, fh)?,
        }

        let mut buf = Vec::with_capacity(size);
        pread(&*fd, spare_capacity(&mut buf), offset)?;
        Ok(buf)
    }

    /// Write `data` at `offset` through the handle.
    pub fn write(&self, vpath: &str, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let fd = self.handles.fd(fh).ok_or(OverlayError::BadHandle(fh))?;

        if self.granularity == Granularity::Block {
            return blocks::write_range(&self.sidecar, vpath, &fd, offset, data);
        }

        // fold first, then write through; the accumulator assumes writes
        // arrive in file order
        self.handles.writer_update(fh, data);
        let mut done = 0;
        while done < data.len() {
            let n = pwrite(&*fd, &data[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Flush the handle's backing descriptor to stable storage.
    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let fd = self.handles.fd(fh).ok_or(OverlayError::BadHandle(fh))?;
        if datasync {
            rustix::fs::fdatasync(&*fd)?;
        } else {
            rustix::fs::fsync(&*fd)?;
        }
        Ok(())
    }

    /// Close a handle. Writers publish their final digest to the sidecar.
    pub fn release(&self, fh: u64) -> Result<()> {
        let closed = self.handles.close(fh).ok_or(OverlayError::BadHandle(fh))?;
        let (path, fd, digest) = match closed {
            ClosedHandle::Reader { .. } => return Ok(()),
            ClosedHandle::Writer { path, fd, digest } => (path, fd, digest),
        };
        // close before publishing so a recompute sees settled content
        drop(fd);

        if self.granularity == Granularity::Block {
            // block digests were committed write by write
            return Ok(());
        }

        let real = self.paths.backing(&path);
        if !real.exists() {
            // unlinked while open; nothing to protect any more
            log::debug!("skipping digest publish for unlinked {path}");
            return Ok(());
        }
        let digest = match digest {
            Some(digest) => digest,
            None => Fnv64::of_file(&real)?,
        };
        self.sidecar.put_digest(&path, &digest.to_hex())?;
        Ok(())
    }

    /// Truncate `vpath` to `size` bytes and re-point the stored checksum
    /// state at the result.
    pub fn truncate(&self, vpath: &str, size: u64) -> Result<()> {
        log::trace!("truncate({vpath}, {size})");
        if self.worm.is_append_only(vpath) {
            return Err(OverlayError::append_only("truncate", vpath));
        }
        let real = self.paths.backing(vpath);
        let file = File::options().write(true).open(&real)?;
        file.set_len(size)?;
        drop(file);

        match self.granularity {
            Granularity::Block => blocks::truncate_range(&self.sidecar, vpath, &real, size),
            Granularity::WholeFile => {
                let digest = Fnv64::of_file(&real)?;
                self.sidecar.put_digest(vpath, &digest.to_hex())?;
                // keep concurrently-open writers consistent with the new content
                self.handles.reset_writers(vpath, digest);
                Ok(())
            }
        }
    }

    /// Remove `vpath` and every sidecar row that refers to it.
    pub fn unlink(&self, vpath: &str) -> Result<()> {
        log::trace!("unlink({vpath})");
        if self.worm.is_append_only(vpath) {
            return Err(OverlayError::append_only("unlink", vpath));
        }
        std::fs::remove_file(self.paths.backing(vpath))?;
        self.sidecar.forget_path(vpath)?;
        Ok(())
    }

    /// Rename `from` to `to`, relabelling sidecar rows in one step.
    ///
    /// Renames touching an append-only subtree on either end are rejected:
    /// they could smuggle data out of (or over) protected trees. If the
    /// backing rename fails the sidecar is untouched.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        log::trace!("rename({from}, {to})");
        if self.worm.is_append_only(from) {
            return Err(OverlayError::append_only("rename", from));
        }
        if self.worm.is_append_only(to) {
            return Err(OverlayError::append_only("rename", to));
        }
        std::fs::rename(self.paths.backing(from), self.paths.backing(to))?;
        self.sidecar.rename_path(from, to)?;
        self.handles.rename(from, to);
        Ok(())
    }

    /// Upsert a user extended attribute.
    pub fn set_xattr(&self, vpath: &str, key: &str, value: &[u8]) -> Result<()> {
        self.sidecar.put_xattr(vpath, key, value)?;
        Ok(())
    }

    /// Look up one extended attribute. Sidecar failures read as absent.
    pub fn xattr(&self, vpath: &str, key: &str) -> Option<Vec<u8>> {
        match self.sidecar.get_xattr(vpath, key) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("sidecar xattr lookup failed for {vpath}: {err}");
                None
            }
        }
    }

    /// All extended attribute names of `vpath`. Sidecar failures read as
    /// an empty set.
    pub fn xattr_names(&self, vpath: &str) -> Vec<String> {
        match self.sidecar.list_xattrs(vpath) {
            Ok(names) => names,
            Err(err) => {
                log::warn!("sidecar xattr list failed for {vpath}: {err}");
                Vec::new()
            }
        }
    }

    /// Delete one extended attribute; reports whether it existed.
    pub fn remove_xattr(&self, vpath: &str, key: &str) -> Result<bool> {
        Ok(self.sidecar.del_xattr(vpath, key)?)
    }

    /// Number of open handles on `vpath`. Exposed for tests.
    #[cfg(any(test, feature = "test"))]
    pub fn handle_count_for(&self, vpath: &str) -> usize {
        self.handles.open_handles(vpath).len()
    }
}
