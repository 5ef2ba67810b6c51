//! POSIX error numbers as carried in subvolume replies.
//!
//! Every operation on a subvolume resolves to either a typed reply or an
//! `Errno`. The cluster core routes on a handful of these (ENOENT, ESTALE,
//! ENOTCONN, ENOSPC, EEXIST) and uses `EREMOTE` internally to signal "this
//! subvolume no longer holds the file, retry on the migration destination".

use std::fmt;
use std::num::NonZeroI32;

/// A non-zero POSIX errno.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

impl Errno {
    pub const EPERM: Errno = Errno::new_const(libc::EPERM);
    pub const ENOENT: Errno = Errno::new_const(libc::ENOENT);
    pub const EIO: Errno = Errno::new_const(libc::EIO);
    pub const EINTR: Errno = Errno::new_const(libc::EINTR);
    pub const EAGAIN: Errno = Errno::new_const(libc::EAGAIN);
    pub const EACCES: Errno = Errno::new_const(libc::EACCES);
    pub const EBUSY: Errno = Errno::new_const(libc::EBUSY);
    pub const EEXIST: Errno = Errno::new_const(libc::EEXIST);
    pub const EXDEV: Errno = Errno::new_const(libc::EXDEV);
    pub const ENOTDIR: Errno = Errno::new_const(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno::new_const(libc::EISDIR);
    pub const EINVAL: Errno = Errno::new_const(libc::EINVAL);
    pub const ENOSPC: Errno = Errno::new_const(libc::ENOSPC);
    pub const EROFS: Errno = Errno::new_const(libc::EROFS);
    pub const ENAMETOOLONG: Errno = Errno::new_const(libc::ENAMETOOLONG);
    pub const ENOSYS: Errno = Errno::new_const(libc::ENOSYS);
    pub const ENOTEMPTY: Errno = Errno::new_const(libc::ENOTEMPTY);
    pub const ENODATA: Errno = Errno::new_const(libc::ENODATA);
    pub const EREMOTE: Errno = Errno::new_const(libc::EREMOTE);
    pub const ENOTCONN: Errno = Errno::new_const(libc::ENOTCONN);
    pub const ESTALE: Errno = Errno::new_const(libc::ESTALE);
    pub const ENOTSUP: Errno = Errno::new_const(libc::ENOTSUP);
    pub const ERANGE: Errno = Errno::new_const(libc::ERANGE);

    const fn new_const(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(code) => Errno(code),
            None => panic!("errno must be non-zero"),
        }
    }

    /// Wrap a raw errno; zero (which cannot be represented) maps to `EIO`.
    pub fn from_i32(code: i32) -> Errno {
        match NonZeroI32::new(code) {
            Some(code) => Errno(code),
            None => Errno::EIO,
        }
    }

    /// The raw errno value.
    pub fn code(self) -> i32 {
        self.0.get()
    }

    /// True for the errnos that mean "the entry is simply not there", as
    /// opposed to the subvolume being unreachable or misbehaving.
    pub fn entry_missing(self) -> bool {
        self == Errno::ENOENT || self == Errno::ESTALE
    }
}

impl From<Errno> for i32 {
    fn from(err: Errno) -> i32 {
        err.code()
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EINTR => "EINTR",
            Errno::EAGAIN => "EAGAIN",
            Errno::EACCES => "EACCES",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::EXDEV => "EXDEV",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
            Errno::EROFS => "EROFS",
            Errno::ENAMETOOLONG => "ENAMETOOLONG",
            Errno::ENOSYS => "ENOSYS",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::ENODATA => "ENODATA",
            Errno::EREMOTE => "EREMOTE",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::ESTALE => "ESTALE",
            Errno::ENOTSUP => "ENOTSUP",
            Errno::ERANGE => "ERANGE",
            _ => return write!(f, "Errno({})", self.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Errno {}

/// The result type of every filesystem operation in this crate.
pub type FopResult<T> = Result<T, Errno>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_i32_never_zero() {
        assert_eq!(Errno::from_i32(0), Errno::EIO);
        assert_eq!(Errno::from_i32(libc::ENOENT), Errno::ENOENT);
    }

    #[test]
    fn entry_missing_classification() {
        assert!(Errno::ENOENT.entry_missing());
        assert!(Errno::ESTALE.entry_missing());
        assert!(!Errno::ENOTCONN.entry_missing());
        assert!(!Errno::EIO.entry_missing());
    }
}
