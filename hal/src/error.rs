use core::fmt;

/// The kernel's unified error table.
///
/// Every syscall returns either `Ok(_)` or one of these codes. Numeric
/// values are preserved from the original header so that a caller porting
/// application code can match on the raw byte if it wants to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Timeout = 0x01,
    ObjDeleted = 0x05,
    ObjId = 0x06,
    ObjNotFound = 0x09,
    NoTcb = 0x0E,
    NoStack = 0x0F,
    TinyStack = 0x10,
    Priority = 0x11,
    Active = 0x12,
    NotActive = 0x13,
    Suspended = 0x14,
    NotSuspended = 0x15,
    SetPri = 0x16,
    RegNum = 0x17,
    NoQcb = 0x33,
    NoMsgBuf = 0x34,
    QFull = 0x35,
    NoMsg = 0x37,
    NoEvents = 0x3C,
    NoScb = 0x41,
    NoSem = 0x42,
    SemDeleted = 0x43,
    IllTicks = 0x4A,
    BadTimerId = 0x4C,
}

impl KernelError {
    /// The numeric code as documented in the original API header.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "operation timed out",
            Self::ObjDeleted => "object was deleted while the caller was waiting on it",
            Self::ObjId => "invalid object id",
            Self::ObjNotFound => "no object with the given name",
            Self::NoTcb => "task control block pool exhausted",
            Self::NoStack => "insufficient stack memory",
            Self::TinyStack => "requested stack is smaller than the minimum",
            Self::Priority => "priority out of range",
            Self::Active => "task is already active",
            Self::NotActive => "task was never started",
            Self::Suspended => "task is already suspended",
            Self::NotSuspended => "task is not suspended",
            Self::SetPri => "invalid new priority",
            Self::RegNum => "invalid register number",
            Self::NoQcb => "queue control block pool exhausted",
            Self::NoMsgBuf => "message slot arena exhausted",
            Self::QFull => "queue is full",
            Self::NoMsg => "queue is empty",
            Self::NoEvents => "event condition not satisfied",
            Self::NoScb => "semaphore control block pool exhausted",
            Self::NoSem => "semaphore count is zero",
            Self::SemDeleted => "semaphore was deleted while the caller was waiting on it",
            Self::IllTicks => "illegal tick count",
            Self::BadTimerId => "invalid timer id",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
