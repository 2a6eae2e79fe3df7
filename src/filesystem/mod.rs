pub mod attr;
pub mod handle;
pub mod mirror;
mod ops;
pub mod spool;

pub use self::mirror::Mirror;

use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use crate::procedure::{Procedure, ProcedureList};

use self::handle::HandleTable;

/// Process-wide state: the mirror handle, the environment captured at
/// startup for spawned children, and the operator's procedures.
/// Effectively immutable once the filesystem is mounted, so operations
/// read it without locks.
pub struct Persistent {
    pub mirror: Mirror,
    pub envp: Vec<CString>,
    pub procs: ProcedureList,
}

impl Persistent {
    pub fn new(mirror: Mirror, envp: Vec<CString>, procs: ProcedureList) -> Persistent {
        Persistent {
            mirror,
            envp,
            procs,
        }
    }

    /// Snapshot the process environment as `KEY=VALUE` C strings for
    /// the children we spawn.
    pub fn capture_envp() -> Vec<CString> {
        std::env::vars_os()
            .filter_map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend(value.into_vec());
                CString::new(entry).ok()
            })
            .collect()
    }

    /// First procedure whose test matches the mirror-relative path, in
    /// declaration order. Always advances past a failed test.
    pub fn find_procedure(&self, rel: &Path) -> Option<&Procedure> {
        self.procs.iter().find(|proc| proc.test.matches(self, rel))
    }

    #[cfg(test)]
    pub fn open_for_tests(root: &Path) -> Persistent {
        Persistent::new(
            Mirror::open(root).expect("open test mirror"),
            Persistent::capture_envp(),
            ProcedureList::default(),
        )
    }
}

/// The mounted filesystem: persistent state plus the open-handle
/// table. This is the value handed to the host dispatcher.
pub struct ScriptFs {
    persistent: Persistent,
    handles: HandleTable,
}

impl ScriptFs {
    pub fn new(persistent: Persistent) -> ScriptFs {
        ScriptFs {
            persistent,
            handles: HandleTable::new(),
        }
    }
}
