use nix::errno::Errno;

/// Errors fall into the kinds the protocol can express: transient conditions
/// the caller may retry, validation failures that leave no state behind, and
/// I/O failures that poison the whole commit batch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {blkno} failed verification after {tries} reads")]
    Corrupt { blkno: u64, tries: u32 },

    #[error("stale block reference")]
    Stale,

    #[error("invalid request")]
    Invalid,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("out of metadata space")]
    NoSpace,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Canonical negative errno carried in response frames.
    pub fn to_errno(&self) -> i32 {
        let errno = match self {
            Error::Io(_) | Error::Corrupt { .. } => Errno::EIO,
            Error::Stale => Errno::EAGAIN,
            Error::Invalid | Error::Protocol(_) => Errno::EINVAL,
            Error::NotFound => Errno::ENOENT,
            Error::Exists => Errno::EEXIST,
            Error::NoSpace => Errno::ENOSPC,
            Error::ShuttingDown => Errno::ESHUTDOWN,
        };
        -(errno as i32)
    }

    pub fn from_errno(err: i32) -> Error {
        match Errno::from_raw(-err) {
            Errno::EAGAIN => Error::Stale,
            Errno::EINVAL => Error::Invalid,
            Errno::ENOENT => Error::NotFound,
            Errno::EEXIST => Error::Exists,
            Errno::ENOSPC => Error::NoSpace,
            Errno::ESHUTDOWN => Error::ShuttingDown,
            other => Error::Io(std::io::Error::from_raw_os_error(other as i32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for err in [
            Error::Stale,
            Error::Invalid,
            Error::NotFound,
            Error::Exists,
            Error::NoSpace,
            Error::ShuttingDown,
        ] {
            let wire = err.to_errno();
            assert!(wire < 0);
            assert_eq!(Error::from_errno(wire).to_errno(), wire);
        }
    }
}
