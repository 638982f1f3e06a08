//! FUSE dispatch adapter for the sentryfs overlay.
//!
//! This crate translates kernel upcalls into calls on a
//! [`sentryfs::Overlay`]. The adapter itself is thin: it keeps the
//! inode-number ↔ virtual-path bookkeeping the FUSE protocol needs, builds
//! attribute replies from backing metadata, and maps overlay errors onto
//! errnos. Everything that touches checksum, xattr or policy state lives in
//! the engine; pure pass-throughs (getattr, readdir, mkdir, setattr times)
//! go straight to the backing tree.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs::{DirBuilder, Metadata},
    os::unix::ffi::OsStrExt,
    os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt},
    path::Path,
    time::{Duration, SystemTime},
};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use rustix::{
    fs::{utimensat, AtFlags, Mode, OFlags, Timespec, Timestamps, CWD},
    io::Errno,
};

use sentryfs::{Overlay, OverlayError};

const TTL: Duration = Duration::from_secs(1);

/// The FUSE-facing filesystem: one overlay plus inode bookkeeping.
///
/// fuser drives this from a single thread, so the maps need no locking;
/// the overlay itself is internally synchronized.
pub struct SentryFs {
    overlay: Overlay,
    paths: HashMap<u64, String>,  // ino -> virtual path
    inodes: HashMap<String, u64>, // virtual path -> ino
    next_ino: u64,
}

fn overlay_errno(err: &OverlayError) -> i32 {
    err.errno().raw_os_error()
}

fn io_errno(err: &std::io::Error) -> i32 {
    err.raw_os_error()
        .unwrap_or_else(|| Errno::IO.raw_os_error())
}

fn kind_of(meta: &Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn timespec_of(time: SystemTime) -> Timespec {
    let elapsed = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    Timespec {
        tv_sec: elapsed.as_secs() as _,
        tv_nsec: elapsed.subsec_nanos() as _,
    }
}

fn resolve(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl SentryFs {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            paths: HashMap::from([(1, "/".to_string())]),
            inodes: HashMap::from([("/".to_string(), 1)]),
            next_ino: 1,
        }
    }

    fn vpath(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    /// The virtual path of `name` under the directory `parent`. None if the
    /// parent is unknown or the name is not valid UTF-8 (the sidecar keys
    /// rows by textual path).
    fn child_vpath(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.paths.get(&parent)?;
        let name = name.to_str()?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }

    fn ino_for(&mut self, vpath: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(vpath) {
            return ino;
        }
        self.next_ino += 1;
        let ino = self.next_ino;
        self.paths.insert(ino, vpath.to_string());
        self.inodes.insert(vpath.to_string(), ino);
        ino
    }

    fn forget_vpath(&mut self, vpath: &str) {
        if let Some(ino) = self.inodes.remove(vpath) {
            self.paths.remove(&ino);
        }
    }

    /// Re-label inode bookkeeping after a rename, including everything
    /// below a renamed directory.
    fn move_tree(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| path.as_str() == from || path.starts_with(&prefix))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();
        for (path, ino) in moved {
            let renamed = format!("{to}{}", &path[from.len()..]);
            self.inodes.remove(&path);
            self.inodes.insert(renamed.clone(), ino);
            self.paths.insert(ino, renamed);
        }
    }

    fn attr_for(&mut self, vpath: &str) -> std::io::Result<FileAttr> {
        let meta = std::fs::symlink_metadata(self.overlay.backing_path(vpath))?;
        let epoch = SystemTime::UNIX_EPOCH;
        Ok(FileAttr {
            ino: self.ino_for(vpath),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(epoch),
            mtime: meta.modified().unwrap_or(epoch),
            ctime: meta.modified().unwrap_or(epoch),
            crtime: meta.created().unwrap_or(epoch),
            kind: kind_of(&meta),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        })
    }
}

impl Filesystem for SentryFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        log::trace!("lookup({parent}, {name:?})");
        let Some(vpath) = self.child_vpath(parent, name) else {
            return reply.error(Errno::NOENT.raw_os_error());
        };
        match self.attr_for(&vpath) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(vpath) = self.vpath(ino) else {
            log::error!("getattr({ino}) inode does not exist");
            return reply.error(Errno::BADF.raw_os_error());
        };
        match self.attr_for(&vpath) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            return reply.error(Errno::BADF.raw_os_error());
        };
        let real = self.overlay.backing_path(&vpath);

        if let Some(mode) = mode {
            let perms = std::fs::Permissions::from_mode(mode);
            if let Err(err) = std::fs::set_permissions(&real, perms) {
                return reply.error(io_errno(&err));
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(err) = std::os::unix::fs::chown(&real, uid, gid) {
                return reply.error(io_errno(&err));
            }
        }
        if let Some(size) = size {
            // truncation goes through the engine: WORM enforcement plus
            // checksum state maintenance
            if let Err(err) = self.overlay.truncate(&vpath, size) {
                return reply.error(overlay_errno(&err));
            }
        }
        if atime.is_some() || mtime.is_some() {
            let meta = match std::fs::symlink_metadata(&real) {
                Ok(meta) => meta,
                Err(err) => return reply.error(io_errno(&err)),
            };
            let last_access = atime
                .map(resolve)
                .unwrap_or_else(|| meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH));
            let last_modification = mtime
                .map(resolve)
                .unwrap_or_else(|| meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
            let times = Timestamps {
                last_access: timespec_of(last_access),
                last_modification: timespec_of(last_modification),
            };
            if let Err(errno) = utimensat(CWD, &real, &times, AtFlags::empty()) {
                return reply.error(errno.raw_os_error());
            }
        }

        match self.attr_for(&vpath) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(vpath) = self.vpath(ino) else {
            return reply.error(Errno::BADF.raw_os_error());
        };
        match std::fs::read_link(self.overlay.backing_path(&vpath)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(vpath) = self.child_vpath(parent, name) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        let result = DirBuilder::new()
            .mode(mode & !umask)
            .create(self.overlay.backing_path(&vpath));
        if let Err(err) = result {
            return reply.error(io_errno(&err));
        }
        match self.attr_for(&vpath) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(vpath) = self.child_vpath(parent, name) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        match std::fs::remove_dir(self.overlay.backing_path(&vpath)) {
            Ok(()) => {
                self.forget_vpath(&vpath);
                reply.ok()
            }
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(vpath) = self.child_vpath(parent, name) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        match self.overlay.unlink(&vpath) {
            Ok(()) => {
                self.forget_vpath(&vpath);
                reply.ok()
            }
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_vpath(parent, name),
            self.child_vpath(newparent, newname),
        ) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        match self.overlay.rename(&from, &to) {
            Ok(()) => {
                self.forget_vpath(&to);
                self.move_tree(&from, &to);
                reply.ok()
            }
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        log::trace!("open({ino}, {flags:#o})");
        let Some(vpath) = self.vpath(ino) else {
            log::error!("open({ino}) inode does not exist");
            return reply.error(Errno::BADF.raw_os_error());
        };
        match self
            .overlay
            .open_file(&vpath, OFlags::from_bits_retain(flags as u32))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(vpath) = self.child_vpath(parent, name) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        log::trace!("create({vpath}, {flags:#o})");
        let fh = match self.overlay.create_file(
            &vpath,
            OFlags::from_bits_retain(flags as u32),
            Mode::from_raw_mode(mode & !umask),
        ) {
            Ok(fh) => fh,
            Err(err) => return reply.error(overlay_errno(&err)),
        };
        match self.attr_for(&vpath) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(err) => reply.error(io_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            return reply.error(Errno::BADF.raw_os_error());
        };
        match self
            .overlay
            .read(&vpath, fh, offset.max(0) as u64, size as usize)
        {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            return reply.error(Errno::BADF.raw_os_error());
        };
        match self.overlay.write(&vpath, fh, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // digests publish on release; nothing to do per flush
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::error!("release({fh}): {err}");
                reply.error(overlay_errno(&err))
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(vpath) = self.vpath(ino) else {
            log::error!("readdir({ino}) inode does not exist");
            return reply.error(Errno::BADF.raw_os_error());
        };

        let parent_ino = if vpath == "/" {
            ino
        } else {
            let parent = match vpath.rfind('/') {
                Some(0) => "/".to_string(),
                Some(cut) => vpath[..cut].to_string(),
                None => "/".to_string(),
            };
            self.ino_for(&parent)
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];

        let dir = match std::fs::read_dir(self.overlay.backing_path(&vpath)) {
            Ok(dir) => dir,
            Err(err) => return reply.error(io_errno(&err)),
        };
        for entry in dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => return reply.error(io_errno(&err)),
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let child = if vpath == "/" {
                format!("/{name}")
            } else {
                format!("{vpath}/{name}")
            };
            let kind = entry
                .metadata()
                .map(|meta| kind_of(&meta))
                .unwrap_or(FileType::RegularFile);
            entries.push((self.ino_for(&child), kind, name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        match rustix::fs::statvfs(self.overlay.backing_root()) {
            Ok(vfs) => reply.statfs(
                vfs.f_blocks,
                vfs.f_bfree,
                vfs.f_bavail,
                vfs.f_files,
                vfs.f_ffree,
                vfs.f_bsize as u32,
                vfs.f_namemax as u32,
                vfs.f_frsize as u32,
            ),
            Err(errno) => reply.error(errno.raw_os_error()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(vpath), Some(name)) = (self.vpath(ino), name.to_str()) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        match self.overlay.set_xattr(&vpath, name, value) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        let (Some(vpath), Some(name)) = (self.vpath(ino), name.to_str()) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        let Some(value) = self.overlay.xattr(&vpath, name) else {
            return reply.error(Errno::NODATA.raw_os_error());
        };

        if size == 0 {
            reply.size(value.len() as u32)
        } else if value.len() > size as usize {
            reply.error(Errno::RANGE.raw_os_error())
        } else {
            reply.data(&value)
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: fuser::ReplyXattr) {
        let Some(vpath) = self.vpath(ino) else {
            return reply.error(Errno::BADF.raw_os_error());
        };

        let mut list = vec![];
        for name in self.overlay.xattr_names(&vpath) {
            list.extend_from_slice(name.as_bytes());
            list.push(b'\0');
        }

        if size == 0 {
            reply.size(list.len() as u32)
        } else if list.len() > size as usize {
            reply.error(Errno::RANGE.raw_os_error())
        } else {
            reply.data(&list)
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (Some(vpath), Some(name)) = (self.vpath(ino), name.to_str()) else {
            return reply.error(Errno::INVAL.raw_os_error());
        };
        match self.overlay.remove_xattr(&vpath, name) {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(Errno::NODATA.raw_os_error()),
            Err(err) => reply.error(overlay_errno(&err)),
        }
    }
}

/// Mount the overlay at `mountpoint` and serve requests until unmount.
pub fn mount(
    overlay: Overlay,
    mountpoint: impl AsRef<Path>,
    options: &[MountOption],
) -> std::io::Result<()> {
    fuser::mount2(SentryFs::new(overlay), mountpoint, options)
}

#[cfg(test)]
mod tests {
    use sentryfs::test::TestOverlay;

    use super::*;

    fn adapter() -> (SentryFs, tempfile::TempDir) {
        let TestOverlay { overlay, backing } = TestOverlay::new();
        (SentryFs::new(overlay), backing)
    }

    #[test]
    fn test_child_vpath() {
        let (fs, _backing) = adapter();
        assert_eq!(
            fs.child_vpath(1, OsStr::new("a.txt")).unwrap(),
            "/a.txt"
        );
        assert_eq!(fs.child_vpath(99, OsStr::new("a.txt")), None);
    }

    #[test]
    fn test_ino_assignment_is_stable() {
        let (mut fs, _backing) = adapter();
        let a = fs.ino_for("/a");
        let b = fs.ino_for("/b");
        assert_ne!(a, b);
        assert_ne!(a, 1);
        assert_eq!(fs.ino_for("/a"), a);

        assert_eq!(fs.child_vpath(a, OsStr::new("x")).unwrap(), "/a/x");
    }

    #[test]
    fn test_move_tree() {
        let (mut fs, _backing) = adapter();
        let dir = fs.ino_for("/dir");
        let file = fs.ino_for("/dir/f");
        let sibling = fs.ino_for("/dirx");

        fs.move_tree("/dir", "/moved");

        assert_eq!(fs.vpath(dir).unwrap(), "/moved");
        assert_eq!(fs.vpath(file).unwrap(), "/moved/f");
        assert_eq!(fs.vpath(sibling).unwrap(), "/dirx");
        assert_eq!(fs.ino_for("/moved/f"), file);
    }

    #[test]
    fn test_forget_vpath() {
        let (mut fs, _backing) = adapter();
        let ino = fs.ino_for("/gone");
        fs.forget_vpath("/gone");
        assert_eq!(fs.vpath(ino), None);
        assert_ne!(fs.ino_for("/gone"), ino);
    }
}
