//! The operation layer: translates host filesystem callbacks into
//! mirror operations, intercepting attribute reporting, permission
//! changes and open/read/write for recognised scripts.

use std::ffi::OsStr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice,
    ResultStatfs, ResultWrite, Statfs,
};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::statvfs;
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{self, AccessFlags, UnlinkatFlags};

use crate::errors::Error;
use crate::filesystem::attr::{self, TTL};
use crate::filesystem::handle::FileHandle;
use crate::filesystem::mirror::relative_name;
use crate::filesystem::spool;
use crate::filesystem::ScriptFs;

fn raw(error: Error) -> libc::c_int {
    error.raw_errno()
}

fn to_timespec(time: Option<SystemTime>) -> TimeSpec {
    match time {
        Some(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => TimeSpec::from(libc::timespec {
                tv_sec: elapsed.as_secs() as libc::time_t,
                tv_nsec: elapsed.subsec_nanos() as libc::c_long,
            }),
            Err(_) => TimeSpec::from(libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            }),
        },
        None => TimeSpec::from(libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        }),
    }
}

fn entry_kind(entry: &nix::dir::Entry) -> FileType {
    use nix::dir::Type;
    match entry.file_type() {
        Some(Type::Directory) => FileType::Directory,
        Some(Type::Symlink) => FileType::Symlink,
        Some(Type::Fifo) => FileType::NamedPipe,
        Some(Type::CharacterDevice) => FileType::CharDevice,
        Some(Type::BlockDevice) => FileType::BlockDevice,
        Some(Type::Socket) => FileType::Socket,
        Some(Type::File) | None => FileType::RegularFile,
    }
}

impl ScriptFs {
    fn is_script(&self, rel: &Path) -> bool {
        self.persistent.find_procedure(rel).is_some()
    }

    /// Stat a mirror path and build the reported attributes, with the
    /// write bits cleared when the path is a regular script. A caller
    /// holding a handle passes what it already knows about the kind.
    fn entry(
        &self,
        rel: &Path,
        follow: bool,
        known_script: Option<bool>,
    ) -> Result<(Duration, FileAttr), libc::c_int> {
        let st = self.persistent.mirror.stat_at(rel, follow).map_err(raw)?;
        let mut file_attr = attr::to_file_attr(&st);
        if attr::is_regular(&st) && attr::has_write_bits(st.st_mode as u32) {
            let script = known_script.unwrap_or_else(|| self.is_script(rel));
            if script {
                attr::mask_script_attr(&mut file_attr);
            }
        }
        Ok((TTL, file_attr))
    }

    /// Resolve the mirror-relative name and, when a handle is
    /// supplied, what its kind already tells us about script-ness.
    fn rel_and_hint(
        &self,
        path: &Path,
        fh: Option<u64>,
    ) -> Result<(PathBuf, Option<bool>), libc::c_int> {
        match fh {
            Some(fh) => self
                .handles
                .with(fh, |handle| {
                    let hint = match handle {
                        FileHandle::Script { .. } => Some(true),
                        FileHandle::File { .. } => Some(false),
                        FileHandle::Folder { .. } => None,
                    };
                    (handle.rel().clone(), hint)
                })
                .ok_or(libc::EBADF),
            None => Ok((relative_name(path).map_err(raw)?, None)),
        }
    }

    /// Run the matched program and expose its output as an unlinked
    /// spool. The spool is served even when the program reports a
    /// failure; partial output is visible by design of the protocol.
    fn synthesize(&self, rel: &Path, proc: &crate::procedure::Procedure) -> Result<RawFd, Error> {
        let spool_fd = spool::create_spool()?;
        match proc.program.run(&self.persistent, rel, spool_fd) {
            Ok(0) => {}
            Ok(code) => debug!("program for {:?} exited with status {}", rel, code),
            Err(err) => warn!("program for {:?} failed: {}; serving what it wrote", rel, err),
        }
        Ok(spool_fd)
    }
}

impl FilesystemMT for ScriptFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        debug!("mounted over mirror {:?}", self.persistent.mirror.root());
        Ok(())
    }

    fn destroy(&self) {
        debug!("unmounted");
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        trace!("getattr({:?}, fh={:?})", path, fh);
        match fh {
            Some(_) => {
                let (rel, hint) = self.rel_and_hint(path, fh)?;
                self.entry(&rel, true, hint)
            }
            None => {
                let rel = relative_name(path).map_err(raw)?;
                self.entry(&rel, false, None)
            }
        }
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, mode: u32) -> ResultEmpty {
        trace!("chmod({:?}, {:#o})", path, mode);
        let (rel, hint) = self.rel_and_hint(path, fh)?;
        let st = self.persistent.mirror.stat_at(&rel, true).map_err(raw)?;

        // adding write bits to a script silently drops them
        let mut mode = mode;
        if attr::is_regular(&st) && attr::has_write_bits(mode) {
            let script = hint.unwrap_or_else(|| self.is_script(&rel));
            if script {
                mode = attr::clear_write_bits(mode);
            }
        }
        self.persistent
            .mirror
            .chmod_at(&rel, Mode::from_bits_truncate(mode as libc::mode_t))
            .map_err(raw)
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        trace!("truncate({:?}, {})", path, size);
        if let Some(fh) = fh {
            return self
                .handles
                .with(fh, |handle| match handle {
                    FileHandle::Folder { .. } => Err(libc::EISDIR),
                    FileHandle::Script { .. } => Err(libc::EACCES),
                    FileHandle::File { fd, .. } => unistd::ftruncate(*fd, size as libc::off_t)
                        .map_err(|err| err as libc::c_int),
                })
                .unwrap_or(Err(libc::EBADF));
        }

        let rel = relative_name(path).map_err(raw)?;
        let st = self.persistent.mirror.stat_at(&rel, true).map_err(raw)?;
        if attr::is_regular(&st) && self.is_script(&rel) {
            return Err(libc::EACCES);
        }
        let fd = self
            .persistent
            .mirror
            .open_at(&rel, OFlag::O_WRONLY, Mode::empty())
            .map_err(raw)?;
        let result = unistd::ftruncate(fd, size as libc::off_t);
        let _ = unistd::close(fd);
        result.map_err(|err| err as libc::c_int)
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        trace!("utimens({:?})", path);
        let (rel, hint) = self.rel_and_hint(path, fh)?;
        let st = self.persistent.mirror.stat_at(&rel, true).map_err(raw)?;
        if attr::is_regular(&st) && hint.unwrap_or_else(|| self.is_script(&rel)) {
            return Err(libc::EACCES);
        }
        self.persistent
            .mirror
            .utimens_at(&rel, &to_timespec(atime), &to_timespec(mtime))
            .map_err(raw)
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        trace!("readlink({:?})", path);
        let rel = relative_name(path).map_err(raw)?;
        let target = self.persistent.mirror.readlink_at(&rel).map_err(raw)?;
        Ok(target.into_vec())
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        trace!("mkdir({:?}, {:?})", parent, name);
        let rel = relative_name(&parent.join(name)).map_err(raw)?;
        self.persistent
            .mirror
            .mkdir_at(&rel, Mode::from_bits_truncate(mode as libc::mode_t))
            .map_err(raw)?;
        self.entry(&rel, false, None)
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        trace!("unlink({:?}, {:?})", parent, name);
        let rel = relative_name(&parent.join(name)).map_err(raw)?;
        self.persistent
            .mirror
            .unlink_at(&rel, UnlinkatFlags::NoRemoveDir)
            .map_err(raw)
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        trace!("rmdir({:?}, {:?})", parent, name);
        let rel = relative_name(&parent.join(name)).map_err(raw)?;
        self.persistent
            .mirror
            .unlink_at(&rel, UnlinkatFlags::RemoveDir)
            .map_err(raw)
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        trace!("symlink({:?}, {:?} -> {:?})", parent, name, target);
        let rel = relative_name(&parent.join(name)).map_err(raw)?;
        self.persistent
            .mirror
            .symlink_at(target, &rel)
            .map_err(raw)?;
        self.entry(&rel, false, None)
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        trace!("rename({:?}/{:?} -> {:?}/{:?})", parent, name, newparent, newname);
        let from = relative_name(&parent.join(name)).map_err(raw)?;
        let to = relative_name(&newparent.join(newname)).map_err(raw)?;
        self.persistent.mirror.rename_at(&from, &to).map_err(raw)
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEntry {
        trace!("link({:?} -> {:?}/{:?})", path, newparent, newname);
        let from = relative_name(path).map_err(raw)?;
        let to = relative_name(&newparent.join(newname)).map_err(raw)?;
        self.persistent.mirror.link_at(&from, &to).map_err(raw)?;
        self.entry(&to, false, None)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        trace!("open({:?}, {:#x})", path, flags);
        let rel = relative_name(path).map_err(raw)?;

        if let Some(proc) = self.persistent.find_procedure(&rel) {
            // scripts are read-only in this view
            let oflags = flags as i32;
            if oflags & libc::O_WRONLY != 0 || oflags & libc::O_RDWR != 0 {
                return Err(libc::EACCES);
            }
            let spool_fd = self.synthesize(&rel, proc).map_err(raw)?;
            let fh = self.handles.insert(FileHandle::Script { fd: spool_fd, rel });
            // the host must not trust the mirror's stat size
            Ok((fh, fuser::consts::FOPEN_DIRECT_IO))
        } else {
            let fd = self
                .persistent
                .mirror
                .open_at(&rel, OFlag::from_bits_truncate(flags as i32), Mode::empty())
                .map_err(raw)?;
            let fh = self.handles.insert(FileHandle::File { fd, rel });
            Ok((fh, 0))
        }
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        trace!("read({:?}, fh={}, offset={}, size={})", path, fh, offset, size);
        let fd = match self.handles.with(fh, |handle| match handle {
            FileHandle::Folder { .. } => Err(libc::EISDIR),
            FileHandle::File { fd, .. } | FileHandle::Script { fd, .. } => Ok(*fd),
        }) {
            Some(Ok(fd)) => fd,
            Some(Err(code)) => return callback(Err(code)),
            None => return callback(Err(libc::EBADF)),
        };

        let mut buffer = vec![0u8; size as usize];
        match pread(fd, &mut buffer, offset as libc::off_t) {
            Ok(count) => callback(Ok(&buffer[..count])),
            Err(err) => callback(Err(err as libc::c_int)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        trace!("write({:?}, fh={}, offset={}, {} bytes)", path, fh, offset, data.len());
        self.handles
            .with(fh, |handle| match handle {
                FileHandle::Folder { .. } => Err(libc::EISDIR),
                // open already refused write modes; refuse again
                FileHandle::Script { .. } => Err(libc::EACCES),
                FileHandle::File { fd, .. } => pwrite(*fd, &data, offset as libc::off_t)
                    .map(|count| count as u32)
                    .map_err(|err| err as libc::c_int),
            })
            .unwrap_or(Err(libc::EBADF))
    }

    fn flush(&self, _req: RequestInfo, path: &Path, fh: u64, _lock_owner: u64) -> ResultEmpty {
        trace!("flush({:?}, fh={})", path, fh);
        self.handles
            .with(fh, |handle| match handle {
                FileHandle::Folder { .. } => Err(libc::EISDIR),
                FileHandle::Script { .. } => Ok(()),
                FileHandle::File { fd, .. } => {
                    unistd::fsync(*fd).map_err(|err| err as libc::c_int)
                }
            })
            .unwrap_or(Err(libc::EBADF))
    }

    fn release(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        trace!("release({:?}, fh={})", path, fh);
        match self.handles.remove(fh) {
            Some(FileHandle::File { fd, .. }) | Some(FileHandle::Script { fd, .. }) => {
                unistd::close(fd).map_err(|err| err as libc::c_int)
            }
            Some(FileHandle::Folder { .. }) => Err(libc::EISDIR),
            None => Err(libc::EBADF),
        }
    }

    fn fsync(&self, _req: RequestInfo, path: &Path, fh: u64, _datasync: bool) -> ResultEmpty {
        trace!("fsync({:?}, fh={})", path, fh);
        self.handles
            .with(fh, |handle| match handle {
                FileHandle::Folder { .. } => Err(libc::EISDIR),
                FileHandle::File { fd, .. } | FileHandle::Script { fd, .. } => {
                    unistd::fsync(*fd).map_err(|err| err as libc::c_int)
                }
            })
            .unwrap_or(Err(libc::EBADF))
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        trace!("opendir({:?})", path);
        let rel = relative_name(path).map_err(raw)?;
        let dir = self.persistent.mirror.open_dir_at(&rel).map_err(raw)?;
        let fh = self.handles.insert(FileHandle::Folder {
            dir,
            entries: None,
            rel,
        });
        Ok((fh, 0))
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, fh: u64) -> ResultReaddir {
        trace!("readdir({:?}, fh={})", path, fh);
        self.handles
            .with(fh, |handle| match handle {
                FileHandle::Folder { dir, entries, .. } => {
                    if entries.is_none() {
                        let mut listed = Vec::new();
                        for entry in dir.iter() {
                            let entry = entry.map_err(|err| err as libc::c_int)?;
                            let name =
                                OsStr::from_bytes(entry.file_name().to_bytes()).to_os_string();
                            listed.push((name, entry_kind(&entry)));
                        }
                        *entries = Some(listed);
                    }
                    Ok(entries
                        .as_ref()
                        .unwrap()
                        .iter()
                        .map(|(name, kind)| DirectoryEntry {
                            name: name.clone(),
                            kind: *kind,
                        })
                        .collect())
                }
                _ => Err(libc::ENOTDIR),
            })
            .unwrap_or(Err(libc::EBADF))
    }

    fn releasedir(&self, _req: RequestInfo, path: &Path, fh: u64, _flags: u32) -> ResultEmpty {
        trace!("releasedir({:?}, fh={})", path, fh);
        match self.handles.remove(fh) {
            Some(FileHandle::Folder { .. }) => Ok(()),
            Some(_) => Err(libc::ENOTDIR),
            None => Err(libc::EBADF),
        }
    }

    fn statfs(&self, _req: RequestInfo, path: &Path) -> ResultStatfs {
        trace!("statfs({:?})", path);
        let st = statvfs::statvfs("/").map_err(|err| err as libc::c_int)?;
        Ok(Statfs {
            blocks: st.blocks(),
            bfree: st.blocks_free(),
            bavail: st.blocks_available(),
            files: st.files(),
            ffree: st.files_free(),
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    fn access(&self, _req: RequestInfo, path: &Path, mask: u32) -> ResultEmpty {
        trace!("access({:?}, {:#o})", path, mask);
        let rel = relative_name(path).map_err(raw)?;
        self.persistent
            .mirror
            .access_at(&rel, AccessFlags::from_bits_truncate(mask as libc::c_int))
            .map_err(raw)?;

        // write access additionally requires the file not to be a script
        if mask as libc::c_int & libc::W_OK != 0 {
            let st = self.persistent.mirror.stat_at(&rel, true).map_err(raw)?;
            if attr::is_regular(&st) && self.is_script(&rel) {
                return Err(libc::EACCES);
            }
        }
        Ok(())
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> ResultCreate {
        trace!("create({:?}, {:?}, {:#o})", parent, name, mode);
        let rel = relative_name(&parent.join(name)).map_err(raw)?;
        let fd = self
            .persistent
            .mirror
            .open_at(
                &rel,
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
                Mode::from_bits_truncate(mode as libc::mode_t),
            )
            .map_err(raw)?;

        let (ttl, file_attr) = match self.entry(&rel, true, Some(false)) {
            Ok(entry) => entry,
            Err(code) => {
                let _ = unistd::close(fd);
                return Err(code);
            }
        };
        let fh = self.handles.insert(FileHandle::File { fd, rel });
        Ok(CreatedEntry {
            ttl,
            attr: file_attr,
            fh,
            flags: 0,
        })
    }
}
