//! Recognition predicates: "is this path a script?".
//!
//! Evaluation cost grows roughly in this order: `Always`/`Never`,
//! `Executable`, `PatternMatch`, `Shebang`, `ShebangOrExecutable`,
//! `Program` (spawns a child per evaluation). Operators are expected to
//! put the cheap ones first on the command line; nothing here enforces
//! it.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd;
use regex::bytes::Regex;

use crate::filesystem::spool::TempCopy;
use crate::filesystem::Persistent;
use crate::procedure::Launcher;
use crate::process::runner;

/// One recognition predicate. Exactly one kind is active per procedure.
pub enum Test {
    /// Matches every path.
    Always,
    /// Matches no path (also what a broken pattern degrades to).
    Never,
    /// Matches iff the first two bytes of the file are `#!`.
    Shebang,
    /// Matches iff the mirror grants execute permission.
    Executable,
    /// Logical OR of the two above.
    ShebangOrExecutable,
    /// Matches iff the expression matches the full relative path.
    PatternMatch(Regex),
    /// Matches iff the configured binary exits with status 0.
    Program(Launcher),
}

impl Test {
    pub fn matches(&self, persistent: &Persistent, rel: &Path) -> bool {
        match self {
            Test::Always => true,
            Test::Never => false,
            Test::Shebang => has_shebang(persistent, rel),
            Test::Executable => is_executable(persistent, rel),
            Test::ShebangOrExecutable => {
                has_shebang(persistent, rel) || is_executable(persistent, rel)
            }
            Test::PatternMatch(re) => re.is_match(rel.as_os_str().as_bytes()),
            Test::Program(launcher) => run_test_program(persistent, launcher, rel),
        }
    }
}

/// Check the two magic bytes through the mirror descriptor. The probe
/// owns its descriptor and closes it on every path.
fn has_shebang(persistent: &Persistent, rel: &Path) -> bool {
    let fd = match persistent
        .mirror
        .open_at(rel, OFlag::O_RDONLY, Mode::empty())
    {
        Ok(fd) => fd,
        Err(_) => return false,
    };
    let mut magic = [0u8; 2];
    let count = unistd::read(fd, &mut magic);
    let _ = unistd::close(fd);
    count == Ok(2) && &magic == b"#!"
}

fn is_executable(persistent: &Persistent, rel: &Path) -> bool {
    persistent.mirror.is_executable(rel)
}

/// Spawn the test binary against the candidate file; exit status 0
/// means "is a script". The `!` slot receives a private temp copy so
/// the child never depends on our working directory or on the mirror
/// being reachable from under the mount.
fn run_test_program(persistent: &Persistent, launcher: &Launcher, rel: &Path) -> bool {
    let copy = if launcher.line.file_slot.is_some() {
        match TempCopy::create(&persistent.mirror, rel) {
            Ok(copy) => Some(copy),
            Err(err) => {
                warn!("cannot stage {:?} for test program: {}", rel, err);
                return false;
            }
        }
    } else {
        None
    };

    let target = copy
        .as_ref()
        .map(|copy| copy.path().as_os_str())
        .unwrap_or_default();
    let argv = launcher.line.realize(target);
    let stdin_src = if launcher.filter && launcher.line.file_slot.is_none() {
        Some(rel)
    } else {
        None
    };

    match runner::run(persistent, &launcher.path, &argv, None, stdin_src) {
        Ok(code) => code == 0,
        Err(err) => {
            warn!("test program {:?} did not run: {}", launcher.path, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::launch;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn mirror_with(files: &[(&str, &str, u32)]) -> (TempDir, Persistent) {
        let dir = tempfile::tempdir().expect("create test mirror");
        for (name, body, mode) in files {
            let path = dir.path().join(name);
            fs::write(&path, body).expect("populate test mirror");
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
        }
        let persistent = Persistent::open_for_tests(dir.path());
        (dir, persistent)
    }

    #[test]
    fn test_always_and_never() {
        let (_dir, persistent) = mirror_with(&[]);
        assert!(Test::Always.matches(&persistent, Path::new("whatever")));
        assert!(!Test::Never.matches(&persistent, Path::new("whatever")));
    }

    #[test]
    fn test_shebang_detection() {
        let (_dir, persistent) = mirror_with(&[
            ("script", "#!/bin/sh\nexit 0\n", 0o644),
            ("plain", "just text\n", 0o644),
            ("short", "#", 0o644),
        ]);
        assert!(Test::Shebang.matches(&persistent, Path::new("script")));
        assert!(!Test::Shebang.matches(&persistent, Path::new("plain")));
        assert!(!Test::Shebang.matches(&persistent, Path::new("short")));
        assert!(!Test::Shebang.matches(&persistent, Path::new("missing")));
    }

    #[test]
    fn test_executable_bit() {
        let (_dir, persistent) = mirror_with(&[
            ("runnable", "echo hi\n", 0o755),
            ("inert", "echo hi\n", 0o644),
        ]);
        assert!(Test::Executable.matches(&persistent, Path::new("runnable")));
        assert!(!Test::Executable.matches(&persistent, Path::new("inert")));
    }

    #[test]
    fn test_shebang_or_executable() {
        let (_dir, persistent) = mirror_with(&[
            ("script", "#!/bin/sh\n", 0o644),
            ("runnable", "binary", 0o755),
            ("inert", "text", 0o644),
        ]);
        let test = Test::ShebangOrExecutable;
        assert!(test.matches(&persistent, Path::new("script")));
        assert!(test.matches(&persistent, Path::new("runnable")));
        assert!(!test.matches(&persistent, Path::new("inert")));
    }

    #[test]
    fn test_pattern_match_on_relative_path() {
        let (_dir, persistent) = mirror_with(&[]);
        let test = Test::PatternMatch(Regex::new(r"\.md$").unwrap());
        assert!(test.matches(&persistent, Path::new("notes.md")));
        assert!(test.matches(&persistent, Path::new("sub/dir/notes.md")));
        assert!(!test.matches(&persistent, Path::new("notes.txt")));
    }

    #[test]
    fn test_program_exit_status_decides() {
        let (_dir, persistent) = mirror_with(&[("candidate", "content\n", 0o644)]);

        let accept = Test::Program(Launcher {
            path: PathBuf::from("/bin/sh"),
            line: launch::tokenize("/bin/sh -c true").unwrap(),
            filter: true,
        });
        assert!(accept.matches(&persistent, Path::new("candidate")));

        let reject = Test::Program(Launcher {
            path: PathBuf::from("/bin/sh"),
            line: launch::tokenize("/bin/sh -c false").unwrap(),
            filter: true,
        });
        assert!(!reject.matches(&persistent, Path::new("candidate")));
    }

    #[test]
    fn test_program_receives_copy_in_slot() {
        let (_dir, persistent) = mirror_with(&[
            ("full", "something\n", 0o644),
            ("empty", "", 0o644),
        ]);
        // `test -s` exits 0 only for non-empty files
        let test = Test::Program(Launcher {
            path: PathBuf::from("/usr/bin/test"),
            line: launch::tokenize("/usr/bin/test -s !").unwrap(),
            filter: true,
        });
        assert!(test.matches(&persistent, Path::new("full")));
        assert!(!test.matches(&persistent, Path::new("empty")));
    }
}
