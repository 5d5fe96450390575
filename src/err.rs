//! Error taxonomy
//!
//! The variants and their numeric codes follow lwIP's `err_t`. `Ok` has no
//! variant here; success is `Result::Ok`.

/// TCP engine error
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    Mem,
    #[error("buffer error")]
    Buf,
    #[error("timeout")]
    Timeout,
    #[error("routing problem")]
    Rte,
    #[error("operation in progress")]
    Inprogress,
    #[error("illegal value")]
    Val,
    #[error("operation would block")]
    Wouldblock,
    #[error("address in use")]
    Use,
    #[error("already connecting")]
    Already,
    #[error("connection already established")]
    Isconn,
    #[error("not connected")]
    Conn,
    #[error("low-level netif error")]
    If,
    #[error("connection aborted")]
    Abrt,
    #[error("connection reset")]
    Rst,
    #[error("connection closed")]
    Clsd,
    #[error("illegal argument")]
    Arg,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Numeric lwIP error code (always negative)
    pub fn code(self) -> i8 {
        match self {
            Error::Mem => -1,
            Error::Buf => -2,
            Error::Timeout => -3,
            Error::Rte => -4,
            Error::Inprogress => -5,
            Error::Val => -6,
            Error::Wouldblock => -7,
            Error::Use => -8,
            Error::Already => -9,
            Error::Isconn => -10,
            Error::Conn => -11,
            Error::If => -12,
            Error::Abrt => -13,
            Error::Rst => -14,
            Error::Clsd => -15,
            Error::Arg => -16,
        }
    }

    /// Map an lwIP code back. `0` is success; unknown codes become `Arg`.
    pub fn from_code(val: i8) -> Result<()> {
        let err = match val {
            0 => return Ok(()),
            -1 => Error::Mem,
            -2 => Error::Buf,
            -3 => Error::Timeout,
            -4 => Error::Rte,
            -5 => Error::Inprogress,
            -6 => Error::Val,
            -7 => Error::Wouldblock,
            -8 => Error::Use,
            -9 => Error::Already,
            -10 => Error::Isconn,
            -11 => Error::Conn,
            -12 => Error::If,
            -13 => Error::Abrt,
            -14 => Error::Rst,
            -15 => Error::Clsd,
            _ => Error::Arg,
        };
        Err(err)
    }

    /// Errors after which the connection no longer exists.
    pub fn is_fatal(self) -> bool {
        matches!(self, Error::Abrt | Error::Rst | Error::Clsd)
    }
}

/// Collapse a result into its lwIP code.
pub fn to_code(res: Result<()>) -> i8 {
    match res {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}
