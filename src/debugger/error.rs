use crate::debugger::breakpoint::Oid;
use std::io;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("process pid {0} not found in process table")]
    ProcessNotFound(i32),

    // --------------------------------- shared region errors --------------------------------------
    #[error("invalid shared breakpoint region capacity: {0}")]
    RegionCapacity(usize),
    #[error("allocate shared breakpoint region: {0}")]
    RegionAlloc(io::Error),
    #[error("shared breakpoint region layout mismatch: {0}")]
    RegionLayout(&'static str),
    #[error("shared breakpoint region is full ({0} slots)")]
    RegionFull(usize),

    // --------------------------------- transport errors ------------------------------------------
    #[error("debugger connection lost: {0}")]
    SessionLost(io::Error),
    #[error("debugger connection closed by peer")]
    ConnectionClosed,
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),
    #[error("no debugger session attached")]
    NoSession,

    // --------------------------------- handshake errors ------------------------------------------
    #[error("debugger proxy refused authentication")]
    AuthRejected,
    #[error("debugger target refused authentication")]
    TargetRejected,

    // --------------------------------- command and entry point errors ----------------------------
    #[error("malformed breakpoint specification `{0}`")]
    BreakpointFormat(String),
    #[error("no target specified")]
    NoTarget,
    #[error("cache lookup failed for routine {0}")]
    RoutineNotFound(Oid),
    #[error("must be owner or superuser to create a breakpoint")]
    InsufficientPrivilege,

    // --------------------------------- config errors ---------------------------------------------
    #[error("config file {0}: {1}")]
    ConfigRead(String, io::Error),
    #[error("config file {0}: {1}")]
    ConfigParse(String, toml::de::Error),
}

impl Error {
    /// Return a hint to a session loop - keep serving after error or drop the whole debug session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::FromUtf8(_) => false,
            Error::Syscall(_, _) => false,
            Error::ProcessNotFound(_) => false,
            Error::RegionCapacity(_) => false,
            Error::RegionAlloc(_) => false,
            Error::RegionLayout(_) => false,
            Error::RegionFull(_) => false,
            Error::NoSession => false,
            Error::AuthRejected => false,
            Error::TargetRejected => false,
            Error::BreakpointFormat(_) => false,
            Error::NoTarget => false,
            Error::RoutineNotFound(_) => false,
            Error::InsufficientPrivilege => false,
            Error::ConfigRead(_, _) => false,
            Error::ConfigParse(_, _) => false,

            // peer or network is gone
            Error::SessionLost(_) => true,
            Error::ConnectionClosed => true,
            // stream position inside a frame is lost
            Error::FrameTooLarge(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pldbg", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pldbg", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(::log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(::log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(::log::debug, $res, $msg)
    };
}
