//! Child-process runner.
//!
//! Runs one program to completion with its standard output redirected
//! to a caller-supplied descriptor and, optionally, its standard input
//! fed from a mirror file. The exec step resolves the target through
//! the mirror descriptor so a relative path never depends on the
//! daemon's working directory.

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult};

use crate::errors::{Errno, Error, Result};
use crate::filesystem::spool::copy_bytes;
use crate::filesystem::{Mirror, Persistent};

/// Fork and exec `path` with the given argv. `out_fd` receives the
/// child's standard output (stdout folds into stderr when absent);
/// `stdin_src` names a mirror file whose bytes are piped to the child's
/// standard input. Blocks until the child exits and returns its exit
/// status; a child that did not exit normally reports 1.
pub fn run(
    persistent: &Persistent,
    path: &Path,
    argv: &[OsString],
    out_fd: Option<RawFd>,
    stdin_src: Option<&Path>,
) -> Result<i32> {
    // materialise the exec arguments before forking: the child of a
    // threaded process must not allocate
    let c_argv = argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let pipe_fds = match stdin_src {
        Some(_) => Some(unistd::pipe()?),
        None => None,
    };

    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => {
            if let (Some((read_end, write_end)), Some(src)) = (pipe_fds, stdin_src) {
                let _ = unistd::close(read_end);
                feed_stdin(persistent, src, write_end);
                let _ = unistd::fsync(write_end);
                let _ = unistd::close(write_end);
            }
            match waitpid(child, None)? {
                WaitStatus::Exited(_, code) => Ok(code),
                _ => Ok(1),
            }
        }
        ForkResult::Child => child_exec(persistent, path, &c_argv, out_fd, pipe_fds),
    }
}

/// Copy the source file (read through the mirror descriptor) into the
/// pipe. An open failure silently skips the copy, so the child reads an
/// empty standard input.
fn feed_stdin(persistent: &Persistent, src: &Path, write_end: RawFd) {
    let src_fd = match persistent
        .mirror
        .open_at(src, OFlag::O_RDONLY, Mode::empty())
    {
        Ok(fd) => fd,
        Err(_) => return,
    };
    let _ = copy_bytes(src_fd, write_end);
    let _ = unistd::close(src_fd);
}

fn child_exec(
    persistent: &Persistent,
    path: &Path,
    argv: &[CString],
    out_fd: Option<RawFd>,
    pipe_fds: Option<(RawFd, RawFd)>,
) -> ! {
    match out_fd {
        Some(fd) => {
            let _ = unistd::dup2(fd, libc::STDOUT_FILENO);
        }
        None => {
            // no output requested: fold stdout into stderr so the
            // child's chatter stays out of the protocol pipe
            let _ = unistd::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO);
        }
    }
    match pipe_fds {
        Some((read_end, write_end)) => {
            let _ = unistd::close(write_end);
            let _ = unistd::dup2(read_end, libc::STDIN_FILENO);
        }
        None => {
            let _ = unistd::close(libc::STDIN_FILENO);
        }
    }

    let error = match exec_target(persistent, path, argv) {
        Ok(never) => match never {},
        Err(error) => error,
    };
    eprintln!("Error calling external program {}: {}", path.display(), error);
    std::process::abort();
}

/// Exec the target through the mirror descriptor. A file starting with
/// `#!` is replaced by its interpreter, with the original argv kept as
/// the interpreter's arguments.
fn exec_target(persistent: &Persistent, path: &Path, argv: &[CString]) -> Result<Infallible> {
    let (exec_path, full_argv) = match read_interpreter(&persistent.mirror, path)? {
        Some(interpreter) => {
            let mut full = Vec::with_capacity(argv.len() + 1);
            full.push(CString::new(interpreter.as_os_str().as_bytes())?);
            full.extend_from_slice(argv);
            (interpreter, full)
        }
        None => (path.to_path_buf(), argv.to_vec()),
    };
    let fd = persistent
        .mirror
        .open_at(&exec_path, OFlag::O_RDONLY, Mode::empty())?;
    Ok(unistd::fexecve(fd, &full_argv, &persistent.envp)?)
}

/// Extract the interpreter path from the first line of a `#!` file;
/// `None` for files without the magic. Blanks after the magic are
/// skipped, then the word runs to the next whitespace.
/// Backslash-escaped whitespace stays in-word.
fn read_interpreter(mirror: &Mirror, path: &Path) -> Result<Option<PathBuf>> {
    let fd = mirror.open_at(path, OFlag::O_RDONLY, Mode::empty())?;
    let mut buffer = [0u8; 0x1000];
    let mut filled = 0usize;
    let outcome = loop {
        match unistd::read(fd, &mut buffer[filled..]) {
            Ok(0) => break Ok(filled),
            Ok(count) => {
                filled += count;
                if filled == buffer.len() || buffer[..filled].contains(&b'\n') {
                    break Ok(filled);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(err) => break Err(err),
        }
    };
    let _ = unistd::close(fd);

    let head = &buffer[..outcome?];
    if head.len() < 2 || &head[..2] != b"#!" {
        return Ok(None);
    }
    let line = match head.lines().next() {
        Some(line) => line,
        None => return Ok(None),
    };

    let mut start = 2;
    while start < line.len() && (line[start] == b' ' || line[start] == b'\t') {
        start += 1;
    }
    if start >= line.len() {
        return Err(Error::errno_with_msg(
            Errno::ENOEXEC,
            format!("empty shebang in {:?}", path),
        ));
    }
    let mut end = start;
    while end < line.len() && (line[end - 1] == b'\\' || (line[end] != b' ' && line[end] != b'\t'))
    {
        end += 1;
    }

    Ok(Some(PathBuf::from(OsString::from_vec(
        line[start..end].to_vec(),
    ))))
}
