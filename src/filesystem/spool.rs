//! Ephemeral files backing script synthesis: the unlinked spool that
//! receives a program's output, and the private temp copies of target
//! files handed to external programs.

use std::env;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::sys::stat::{fchmod, Mode};
use nix::unistd;

use crate::errors::{Errno, Result, WithContext};
use crate::filesystem::Mirror;

const COPY_CHUNK: usize = 0x1000;

/// Create the spool that will hold one script's output: a temp file
/// unlinked between creation and first use, so it disappears on its
/// own even if the process crashes. The caller owns the descriptor.
pub fn create_spool() -> Result<RawFd> {
    let template = env::temp_dir().join("scriptfs.XXXXXX");
    let (fd, path) = unistd::mkstemp(&template).context("creating spool")?;
    if let Err(err) = unistd::unlink(&path) {
        let _ = unistd::close(fd);
        return Err(err).context("unlinking spool");
    }
    Ok(fd)
}

/// A private copy of a mirror file in the system temp area, removed
/// when dropped. The copy is readable and executable by the owner so
/// that a shebang-less script can still be exec'd directly.
#[derive(Debug)]
pub struct TempCopy {
    path: PathBuf,
}

impl TempCopy {
    pub fn create(mirror: &Mirror, rel: &Path) -> Result<TempCopy> {
        let src_fd = mirror.open_at(rel, nix::fcntl::OFlag::O_RDONLY, Mode::empty())?;

        let template = env::temp_dir().join("scriptfs.XXXXXX");
        let (dst_fd, path) = match unistd::mkstemp(&template) {
            Ok(created) => created,
            Err(err) => {
                let _ = unistd::close(src_fd);
                return Err(err).context("creating temp copy");
            }
        };
        let copy = TempCopy { path };

        let result = copy_bytes(src_fd, dst_fd)
            .and_then(|_| fchmod(dst_fd, Mode::S_IRUSR | Mode::S_IXUSR).map_err(Into::into));
        let _ = unistd::close(src_fd);
        let _ = unistd::close(dst_fd);
        result?;

        Ok(copy)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempCopy {
    fn drop(&mut self) {
        let _ = unistd::unlink(&self.path);
    }
}

/// Copy everything from one descriptor to the other in 4 KiB chunks,
/// tolerating short writes.
pub fn copy_bytes(from: RawFd, to: RawFd) -> Result<()> {
    let mut buffer = [0u8; COPY_CHUNK];
    loop {
        let count = match unistd::read(from, &mut buffer) {
            Ok(0) => return Ok(()),
            Ok(count) => count,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        };
        let mut written = 0;
        while written < count {
            match unistd::write(to, &buffer[written..count]) {
                Ok(more) => written += more,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}
