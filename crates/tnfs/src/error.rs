//! Error handling: protocol status codes and their translation from host
//! errors.
//!
//! Handlers never surface a host-native error code; every failure crosses
//! this boundary and leaves as one of the established status bytes.

use enum_primitive::*;
use nix::errno::Errno;
use std::io;
use thiserror::Error;

enum_from_primitive! {
    /// Protocol status codes carried in the fifth byte of every reply.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Status {
        Success      = 0x00,
        Eperm        = 0x01,
        Enoent       = 0x02,
        Eio          = 0x03,
        Enxio        = 0x04,
        E2big        = 0x05,
        Ebadf        = 0x06,
        Eagain       = 0x07,
        Enomem       = 0x08,
        Eacces       = 0x09,
        Ebusy        = 0x0a,
        Eexist       = 0x0b,
        Enotdir      = 0x0c,
        Eisdir       = 0x0d,
        Einval       = 0x0e,
        Enfile       = 0x0f,
        Emfile       = 0x10,
        Efbig        = 0x11,
        Enospc       = 0x12,
        Espipe       = 0x13,
        Erofs        = 0x14,
        Enametoolong = 0x15,
        Enosys       = 0x16,
        Enotempty    = 0x17,
        Eloop        = 0x18,
        Enodata      = 0x19,
        Enostr       = 0x1a,
        Eproto       = 0x1b,
        Ebadfd       = 0x1c,
        Eusers       = 0x1d,
        Enobufs      = 0x1e,
        Ealready     = 0x1f,
        Estale       = 0x20,
        Eof          = 0x21,
    }
}

impl Status {
    /// Map a raw host errno onto the protocol taxonomy.
    pub fn from_errno(errno: Errno) -> Status {
        match errno {
            Errno::EPERM => Status::Eperm,
            Errno::ENOENT => Status::Enoent,
            Errno::EIO => Status::Eio,
            Errno::ENXIO => Status::Enxio,
            Errno::E2BIG => Status::E2big,
            Errno::EBADF => Status::Ebadf,
            Errno::EAGAIN => Status::Eagain,
            Errno::ENOMEM => Status::Enomem,
            Errno::EACCES => Status::Eacces,
            Errno::EBUSY => Status::Ebusy,
            Errno::EEXIST => Status::Eexist,
            Errno::ENOTDIR => Status::Enotdir,
            Errno::EISDIR => Status::Eisdir,
            Errno::EINVAL => Status::Einval,
            Errno::ENFILE => Status::Enfile,
            Errno::EMFILE => Status::Emfile,
            Errno::EFBIG => Status::Efbig,
            Errno::ENOSPC => Status::Enospc,
            Errno::ESPIPE => Status::Espipe,
            Errno::EROFS => Status::Erofs,
            Errno::ENAMETOOLONG => Status::Enametoolong,
            Errno::ENOSYS => Status::Enosys,
            Errno::ENOTEMPTY => Status::Enotempty,
            Errno::ELOOP => Status::Eloop,
            Errno::ENODATA => Status::Enodata,
            Errno::EPROTO => Status::Eproto,
            Errno::EUSERS => Status::Eusers,
            Errno::ENOBUFS => Status::Enobufs,
            Errno::EALREADY => Status::Ealready,
            Errno::ESTALE => Status::Estale,
            _ => Status::Eio,
        }
    }

    /// Map a host I/O error, preferring the raw errno when present.
    pub fn from_host(err: &io::Error) -> Status {
        if let Some(raw) = err.raw_os_error() {
            return Status::from_errno(Errno::from_raw(raw));
        }
        match err.kind() {
            io::ErrorKind::NotFound => Status::Enoent,
            io::ErrorKind::PermissionDenied => Status::Eacces,
            io::ErrorKind::AlreadyExists => Status::Eexist,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Status::Einval,
            io::ErrorKind::UnexpectedEof => Status::Einval,
            io::ErrorKind::Unsupported => Status::Enosys,
            _ => Status::Eio,
        }
    }
}

/// Library error: either a protocol status decided by the server itself,
/// or a host error still awaiting translation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("status {0:?}")]
    Status(Status),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The status byte this error puts on the wire.
    pub fn status(&self) -> Status {
        match self {
            Error::Status(s) => *s,
            Error::Io(e) => Status::from_host(e),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Error {
        Error::Status(status)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Status(Status::from_errno(errno))
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
