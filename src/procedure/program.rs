//! Synthesis actions: "produce the bytes for this script".

use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::errors::Result;
use crate::filesystem::spool::TempCopy;
use crate::filesystem::Persistent;
use crate::procedure::Launcher;
use crate::process::runner;

/// One synthesis action. The program runs to completion with its
/// standard output redirected to the spool descriptor; the caller then
/// serves the spool.
pub enum Program {
    /// Execute the file itself (shebang interpretation is handled by
    /// the child runner).
    Shell,
    /// Execute a configured binary against the target file.
    External(Launcher),
}

impl Program {
    /// Run the action for the file at mirror-relative `rel`, writing
    /// its standard output to `spool_fd`. Returns the child's exit
    /// status; whatever landed in the spool is served either way.
    ///
    /// The target always reaches the child as a private temp copy, not
    /// as the mirror path: the mount point may overlay the mirror, in
    /// which case the original path would re-enter the filesystem.
    pub fn run(&self, persistent: &Persistent, rel: &Path, spool_fd: RawFd) -> Result<i32> {
        match self {
            Program::Shell => {
                let copy = TempCopy::create(&persistent.mirror, rel)?;
                let argv = vec![copy.path().as_os_str().to_os_string()];
                runner::run(persistent, copy.path(), &argv, Some(spool_fd), None)
            }
            Program::External(launcher) => {
                let copy = if launcher.line.file_slot.is_some() {
                    Some(TempCopy::create(&persistent.mirror, rel)?)
                } else {
                    None
                };
                let target = copy
                    .as_ref()
                    .map(|copy| copy.path().as_os_str())
                    .unwrap_or_else(|| OsStr::new(""));
                let argv = launcher.line.realize(target);
                let stdin_src = if launcher.filter && launcher.line.file_slot.is_none() {
                    Some(rel)
                } else {
                    None
                };
                runner::run(persistent, &launcher.path, &argv, Some(spool_fd), stdin_src)
            }
        }
    }
}
