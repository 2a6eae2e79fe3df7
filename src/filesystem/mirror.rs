//! The mirror directory: an open descriptor on the projected host
//! directory, used as the base of every relative lookup (atfile
//! semantics), plus the virtual-path → mirror-relative mapping.

use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{self, AtFlags, OFlag};
use nix::sys::stat::{self, FileStat, Mode};
use nix::sys::time::TimeSpec;
use nix::unistd::{self, AccessFlags};

use crate::errors::{Errno, Error, Result, WithContext};

/// Relative names handed to the mirror are bounded at this many bytes.
pub const MAX_NAME_LENGTH: usize = 0x400;

/// Open handle on the mirror directory. The descriptor lives as long
/// as the process; every mirror operation resolves against it.
#[derive(Debug)]
pub struct Mirror {
    root: PathBuf,
    fd: RawFd,
}

impl Mirror {
    /// Canonicalise `path` and open it as the mirror base directory.
    pub fn open(path: &Path) -> Result<Mirror> {
        let root = std::fs::canonicalize(path).context("resolving mirror directory")?;
        let fd = fcntl::open(
            &root,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .context("opening mirror directory")?;
        Ok(Mirror { root, fd })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn open_at(&self, rel: &Path, flags: OFlag, mode: Mode) -> Result<RawFd> {
        Ok(fcntl::openat(self.fd, rel, flags, mode)?)
    }

    pub fn stat_at(&self, rel: &Path, follow: bool) -> Result<FileStat> {
        let flags = if follow {
            AtFlags::empty()
        } else {
            AtFlags::AT_SYMLINK_NOFOLLOW
        };
        Ok(stat::fstatat(self.fd, rel, flags)?)
    }

    pub fn access_at(&self, rel: &Path, mode: AccessFlags) -> Result<()> {
        Ok(unistd::faccessat(Some(self.fd), rel, mode, AtFlags::empty())?)
    }

    pub fn is_executable(&self, rel: &Path) -> bool {
        self.access_at(rel, AccessFlags::X_OK).is_ok()
    }

    pub fn chmod_at(&self, rel: &Path, mode: Mode) -> Result<()> {
        Ok(stat::fchmodat(
            Some(self.fd),
            rel,
            mode,
            stat::FchmodatFlags::FollowSymlink,
        )?)
    }

    pub fn utimens_at(&self, rel: &Path, atime: &TimeSpec, mtime: &TimeSpec) -> Result<()> {
        Ok(stat::utimensat(
            Some(self.fd),
            rel,
            atime,
            mtime,
            stat::UtimensatFlags::FollowSymlink,
        )?)
    }

    pub fn readlink_at(&self, rel: &Path) -> Result<std::ffi::OsString> {
        Ok(fcntl::readlinkat(self.fd, rel)?)
    }

    pub fn mkdir_at(&self, rel: &Path, mode: Mode) -> Result<()> {
        Ok(stat::mkdirat(self.fd, rel, mode)?)
    }

    pub fn unlink_at(&self, rel: &Path, flags: unistd::UnlinkatFlags) -> Result<()> {
        Ok(unistd::unlinkat(Some(self.fd), rel, flags)?)
    }

    pub fn symlink_at(&self, target: &Path, rel: &Path) -> Result<()> {
        Ok(unistd::symlinkat(target, Some(self.fd), rel)?)
    }

    pub fn rename_at(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fcntl::renameat(Some(self.fd), from, Some(self.fd), to)?)
    }

    pub fn link_at(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(unistd::linkat(
            Some(self.fd),
            from,
            Some(self.fd),
            to,
            unistd::LinkatFlags::NoSymlinkFollow,
        )?)
    }

    pub fn open_dir_at(&self, rel: &Path) -> Result<nix::dir::Dir> {
        Ok(nix::dir::Dir::openat(
            self.fd,
            rel,
            OFlag::O_RDONLY,
            Mode::empty(),
        )?)
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Map a virtual (mount-side) path to the mirror-relative name used in
/// every atfile call: `/` becomes `.`, any other path loses its
/// leading slash. Names past the bound are refused instead of being
/// silently truncated.
pub fn relative_name(virtual_path: &Path) -> Result<PathBuf> {
    let bytes = virtual_path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(Error::errno(Errno::ENOENT));
    }
    if bytes == b"/" {
        return Ok(PathBuf::from("."));
    }
    let stripped = match bytes.first() {
        Some(b'/') => &bytes[1..],
        _ => bytes,
    };
    if stripped.len() > MAX_NAME_LENGTH {
        return Err(Error::errno(Errno::ENAMETOOLONG));
    }
    Ok(PathBuf::from(std::ffi::OsString::from_vec(
        stripped.to_vec(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_relative_name_mapping() {
        assert_eq!(relative_name(Path::new("/")).unwrap(), PathBuf::from("."));
        assert_eq!(
            relative_name(Path::new("/a/b.md")).unwrap(),
            PathBuf::from("a/b.md")
        );
        assert_eq!(
            relative_name(Path::new("plain")).unwrap(),
            PathBuf::from("plain")
        );
    }

    #[test]
    fn test_relative_name_refuses_oversized_paths() {
        // the bound applies to the relative name, not the virtual path:
        // exactly 1024 bytes after stripping the slash still fits
        let fits = format!("/{}", "x".repeat(MAX_NAME_LENGTH));
        assert_eq!(
            relative_name(Path::new(&fits)).unwrap(),
            PathBuf::from("x".repeat(MAX_NAME_LENGTH))
        );

        let over = format!("/{}", "x".repeat(MAX_NAME_LENGTH + 1));
        let error = relative_name(Path::new(&over)).unwrap_err();
        assert_eq!(error.get_errno(), Errno::ENAMETOOLONG);
    }

    #[test]
    fn test_mirror_open_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), "twelve bytes").unwrap();

        let mirror = Mirror::open(dir.path()).unwrap();
        let st = mirror.stat_at(Path::new("file"), true).unwrap();
        assert_eq!(st.st_size, 12);

        assert!(mirror.stat_at(Path::new("missing"), true).is_err());
    }

    #[test]
    fn test_mirror_open_rejects_non_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(Mirror::open(&file).is_err());
    }

    #[test]
    fn test_mirror_root_is_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let dotted = dir.path().join(".");
        let mirror = Mirror::open(&dotted).unwrap();
        assert_eq!(mirror.root(), fs::canonicalize(dir.path()).unwrap());
    }
}
