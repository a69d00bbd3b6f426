use std::cell::RefCell;

pub type AnyError = anyhow::Error;

pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}

/// Error classification shared by the whole runtime.
///
/// Every [`Error`] maps to exactly one kind; the C-ABI façade reports kinds
/// as numeric codes via the thread-local last-error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Bad input.
    Arg,
    /// Lookup miss.
    NotFound,
    /// Duplicate registration.
    Repeat,
    /// Operation in the wrong lifecycle phase.
    State,
    /// Malformed frame or oversized packet.
    Protocol,
    /// Back-pressure; retry after a drain event.
    WouldBlock,
    /// Session or service is gone.
    Closed,
    Timeout,
    Internal,
}

impl Kind {
    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Kind::Arg => "arg",
            Kind::NotFound => "not_found",
            Kind::Repeat => "repeat",
            Kind::State => "state",
            Kind::Protocol => "protocol",
            Kind::WouldBlock => "would_block",
            Kind::Closed => "closed",
            Kind::Timeout => "timeout",
            Kind::Internal => "internal",
        }
    }

    /// Stable numeric code for the C-ABI façade. 0 is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Kind::Arg => 1,
            Kind::NotFound => 2,
            Kind::Repeat => 3,
            Kind::State => 4,
            Kind::Protocol => 5,
            Kind::WouldBlock => 6,
            Kind::Closed => 7,
            Kind::Timeout => 8,
            Kind::Internal => 9,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad argument: {0}")]
    Arg(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate registration: {0}")]
    Repeat(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("would block")]
    WouldBlock,
    #[error("closed: {0}")]
    Closed(String),
    #[error("timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::Arg(_) => Kind::Arg,
            Error::NotFound(_) => Kind::NotFound,
            Error::Repeat(_) => Kind::Repeat,
            Error::State(_) => Kind::State,
            Error::Protocol(_) => Kind::Protocol,
            Error::WouldBlock => Kind::WouldBlock,
            Error::Closed(_) => Kind::Closed,
            Error::Timeout => Kind::Timeout,
            Error::Internal(_) => Kind::Internal,
        }
    }

    /// Records this error in the calling thread's last-error slot and
    /// returns it, so call sites can `return Err(e.record())`.
    pub fn record(self) -> Self {
        set_last_error(self.kind(), self.to_string());
        self
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<(Kind, String)>> = const { RefCell::new(None) };
}

pub fn set_last_error(kind: Kind, message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some((kind, message)));
}

/// Takes the calling thread's last error, clearing the slot.
pub fn take_last_error() -> Option<(Kind, String)> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}
