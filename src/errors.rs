pub use nix::errno::Errno;
use std::io::Error as IoError;
use std::{
    fmt::{self, Display},
    result,
};

pub type Result<T> = result::Result<T, Error>;

/// Error type carried through the whole crate. Every exception that can
/// reach a filesystem operation is reduced to an `errno` value (which is
/// what the host ultimately wants back), plus an optional message for
/// logs and diagnostics.
pub struct Error {
    errno: Errno,
    msg: Option<Box<dyn Display + Send + Sync + 'static>>,
}

#[allow(dead_code)]
impl Error {
    /// Create an Error with the specific errno
    pub fn errno(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Create an Error with the specific message
    pub fn msg<M>(msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        Error::errno_with_msg(Errno::UnknownErrno, msg)
    }

    /// Create an Error with the specific errno and message
    pub fn errno_with_msg<M>(errno: Errno, msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        Error {
            errno,
            msg: Some(Box::new(msg)),
        }
    }

    /// Set errno of self to a specific errno, and return this Error.
    pub fn with_errno(mut self, errno: Errno) -> Self {
        self.errno = errno;
        self
    }

    /// Set message of self to a specific message, and return this Error.
    pub fn with_msg<M>(mut self, msg: M) -> Self
    where
        M: Display + Send + Sync + 'static,
    {
        self.msg = Some(Box::new(msg));
        self
    }

    /// Get errno of this Error. If errno is not set, the default value is
    /// `UnknownErrno`.
    pub fn get_errno(&self) -> Errno {
        self.errno
    }

    /// The raw error code handed back to the filesystem host. An unknown
    /// errno degrades to `EIO` so the caller never sees a zero error.
    pub fn raw_errno(&self) -> libc::c_int {
        match self.errno {
            Errno::UnknownErrno => libc::EIO,
            errno => errno as libc::c_int,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.errno.desc(), self.errno as i32)?;
        if let Some(msg) = &self.msg {
            write!(f, ", {}", msg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("errno", &self.errno);
        match self.msg.as_ref() {
            Some(msg) => d.field("msg", &Some(format_args!("{}", msg))),
            None => d.field("msg", &Option::<()>::None),
        };
        d.finish()
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.errno == other.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::errno(errno)
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error {
            errno: match error.raw_os_error() {
                // we try to convert it to an errno
                Some(errno) => Errno::from_i32(errno),
                None => Errno::UnknownErrno,
            },
            msg: Some(Box::new(error)),
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(error: std::ffi::NulError) -> Error {
        Error::errno_with_msg(Errno::EINVAL, error)
    }
}

/// Extension trait to attach a message or a more precise errno to a
/// `Result<T, E>` while converting it to our `Result<T>`.
#[allow(dead_code)]
pub trait WithContext<T> {
    fn errno(self, errno: Errno) -> Result<T>;

    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> WithContext<T> for result::Result<T, E>
where
    Error: From<E>,
{
    fn errno(self, errno: Errno) -> Result<T> {
        self.map_err(|error| Into::<Error>::into(error).with_errno(errno))
    }

    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| Into::<Error>::into(error).with_msg(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| Into::<Error>::into(error).with_msg(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_errno() {
        let error = Error::errno(Errno::EACCES);
        assert_eq!(error.get_errno(), Errno::EACCES);
        assert_eq!(error.raw_errno(), libc::EACCES);
    }

    #[test]
    fn test_unknown_errno_degrades_to_eio() {
        let error = Error::msg("something vague");
        assert_eq!(error.raw_errno(), libc::EIO);
    }

    #[test]
    fn test_context_keeps_errno() {
        let result: Result<()> = Err(Errno::ENOENT).context("while probing");
        assert_eq!(result.unwrap_err().get_errno(), Errno::ENOENT);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = IoError::from_raw_os_error(libc::ENOTDIR);
        let error: Error = io_error.into();
        assert_eq!(error.get_errno(), Errno::ENOTDIR);
    }
}
