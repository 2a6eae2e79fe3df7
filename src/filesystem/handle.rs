//! Open-file cookies handed to the host, and the table that maps the
//! host's `fh` values back to them.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fuse_mt::FileType;
use nix::dir::Dir;

/// State attached to one open file, script or directory. Each handle
/// owns its descriptor; handles never share them.
pub enum FileHandle {
    /// Regular mirror file, opened with the caller's flags.
    File { fd: RawFd, rel: PathBuf },
    /// Synthesised script output, backed by an unlinked spool.
    Script { fd: RawFd, rel: PathBuf },
    /// Mirror directory stream. The entry list is cached on first
    /// drain so repeated listings of one handle stay stable.
    Folder {
        dir: Dir,
        entries: Option<Vec<(OsString, FileType)>>,
        rel: PathBuf,
    },
}

impl FileHandle {
    pub fn rel(&self) -> &PathBuf {
        match self {
            FileHandle::File { rel, .. } => rel,
            FileHandle::Script { rel, .. } => rel,
            FileHandle::Folder { rel, .. } => rel,
        }
    }
}

/// Concurrent `fh` → handle map. Handle 0 is never allocated, so a
/// zero cookie from the host is always invalid.
pub struct HandleTable {
    next: AtomicU64,
    map: Mutex<HashMap<u64, FileHandle>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: FileHandle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.map.lock().unwrap().insert(fh, handle);
        fh
    }

    pub fn remove(&self, fh: u64) -> Option<FileHandle> {
        self.map.lock().unwrap().remove(&fh)
    }

    /// Run `body` against the handle behind `fh`, if any.
    pub fn with<R>(&self, fh: u64, body: impl FnOnce(&mut FileHandle) -> R) -> Option<R> {
        self.map.lock().unwrap().get_mut(&fh).map(body)
    }
}
