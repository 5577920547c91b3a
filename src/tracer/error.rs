use crate::tracer::address::TargetAddress;
use crate::tracer::registry::EntryId;
use crate::tracer::tracepoint::TracepointKind;

/// Non-fatal failure raised on the hot path by a collaborator: condition
/// evaluation, action execution or single-stepping. A fault is reported
/// through the trace hook and never terminates the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Fault(String);

impl Fault {
    pub fn new(msg: impl Into<String>) -> Self {
        Fault(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- definition errors -----------------------------------------
    #[error("invalid tracepoint specification: {0}")]
    InvalidSpec(&'static str),
    #[error("tracepoint kind `{0}` is not resolvable on this target")]
    UnsupportedKind(TracepointKind),

    // --------------------------------- registry errors -------------------------------------------
    #[error("tracepoint entry {0} not found")]
    EntryNotFound(EntryId),
    #[error("tracepoint {0} at {1} not found")]
    TracepointNotFound(u32, TargetAddress),
    #[error("tracepoint {0} is still installed")]
    StillInstalled(u32),

    // --------------------------------- installer errors ------------------------------------------
    #[error("jump pad storage exhausted (requested {0} bytes)")]
    PadExhausted(u64),
    #[error("target patch operation `{0}`: {1}")]
    Patch(&'static str, anyhow::Error),
    #[error("live code at {0} diverges from the installed patch")]
    PatchCorruption(TargetAddress),

    // --------------------------------- run controller errors -------------------------------------
    #[error("tracing run already active")]
    AlreadyActive,
    #[error("no active tracing run")]
    NotActive,

    // --------------------------------- wire decoding errors --------------------------------------
    #[error("malformed hex input")]
    MalformedHex,

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to an embedder - keep the engine alive after error or treat it as fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidSpec(_) => false,
            Error::UnsupportedKind(_) => false,
            Error::EntryNotFound(_) => false,
            Error::TracepointNotFound(_, _) => false,
            Error::StillInstalled(_) => false,
            Error::PadExhausted(_) => false,
            Error::AlreadyActive => false,
            Error::NotActive => false,
            Error::MalformedHex => false,
            Error::Hook(_) => false,

            // currently fatal errors
            Error::Patch(_, _) => true,
            Error::PatchCorruption(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "tracer", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
