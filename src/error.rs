//! Types for working with ring, capture, and memory-space operation errors.

use std::os::raw::c_int;
use std::{fmt, io};

/// A specialized `Result` type for ring and capture operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A specialized `Result` type for conversion operations.
///
/// The origin `self` type is consumed when converting between two owning
/// types. `ConvertResult` returns the original input value on failure so
/// that it isn't necessarily dropped.
pub type ConvertResult<T, F> = std::result::Result<T, (Error, F)>;

impl<F> From<(Error, F)> for Error {
    fn from(value: (Error, F)) -> Error {
        value.0
    }
}

/// A type for storing platform-specific kernel error codes.
///
/// This is *not* `errno` or `GetLastError` — `std::io::Error` already holds
/// those. On macOS/iOS some calls (the mach vm_remap ring mapping) report a
/// `kern_return_t` instead, so this is kept cross-platform for uniformity.
pub type KernelResult = c_int;

/// The spec-level error taxonomy.
///
/// This is kept separate from the low-level cause so that callers can match
/// on *what kind of thing went wrong* without caring whether the underlying
/// cause was an OS error, a kernel return code, or a bad argument.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Kind {
    /// Bad size, null handle, bad enum value.
    InvalidArgument,
    /// Writing on a non-writable ring, double `open_writing`, using an
    /// expired sequence/reader handle.
    InvalidState,
    /// A cross-space operation is not supported (e.g. device without the
    /// `cuda` feature).
    InvalidSpace,
    /// A non-blocking operation could not proceed immediately.
    WouldBlock,
    /// A sequence or input stream has been exhausted.
    EndOfData,
    /// A blocking operation's deadline elapsed.
    Timeout,
    /// The operation was interrupted by `interrupt_ring` or a cancel flag.
    Interrupted,
    /// An opportunistic reader was lapped by the writer.
    Overrun,
    /// Allocation failed for lack of storage.
    InsufficientStorage,
    /// The feature was not compiled in (e.g. the `cuda` feature, raw sockets
    /// off Linux, kernel-bypass verbs).
    Unsupported,
    /// An unexpected internal invariant was violated.
    Internal,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::InvalidArgument => "invalid argument",
            Kind::InvalidState => "invalid state",
            Kind::InvalidSpace => "invalid space",
            Kind::WouldBlock => "would block",
            Kind::EndOfData => "end of data",
            Kind::Timeout => "timed out",
            Kind::Interrupted => "interrupted",
            Kind::Overrun => "overrun",
            Kind::InsufficientStorage => "insufficient storage",
            Kind::Unsupported => "unsupported",
            Kind::Internal => "internal error",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A list specifying general categories of erroneous operations.
///
/// This list is intended to grow over time; it is not recommended to
/// exhaustively match against it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Operation {
    MapFile,
    MapAnonymous,
    Unmap,
    Protect,
    Lock,
    Unlock,
    Flush,
    RingAllocate,
    RingDeallocate,
    RingResize,
    RingOpenWriting,
    RingOpenReading,
    RingReserve,
    RingCommit,
    RingAcquire,
    RingRelease,
    SequenceBegin,
    SequenceEnd,
    SpaceAllocate,
    SpaceFree,
    SpaceCopy,
    MemoryFd,
    CaptureCreate,
    CaptureRecv,
    CaptureSeek,
    CaptureCallback,
    None,
}

impl Operation {
    pub fn as_str(&self) -> Option<&'static str> {
        match *self {
            Operation::MapFile => Some("map file"),
            Operation::MapAnonymous => Some("map anonymous region"),
            Operation::Unmap => Some("unmap"),
            Operation::Protect => Some("protect mapped memory"),
            Operation::Lock => Some("lock mapped memory"),
            Operation::Unlock => Some("unlock mapped memory"),
            Operation::Flush => Some("flush mapped memory"),
            Operation::RingAllocate => Some("allocate ring storage"),
            Operation::RingDeallocate => Some("deallocate ring storage"),
            Operation::RingResize => Some("resize ring"),
            Operation::RingOpenWriting => Some("open ring for writing"),
            Operation::RingOpenReading => Some("open ring for reading"),
            Operation::RingReserve => Some("reserve write span"),
            Operation::RingCommit => Some("commit write span"),
            Operation::RingAcquire => Some("acquire read span"),
            Operation::RingRelease => Some("release read span"),
            Operation::SequenceBegin => Some("begin sequence"),
            Operation::SequenceEnd => Some("end sequence"),
            Operation::SpaceAllocate => Some("allocate memory space"),
            Operation::SpaceFree => Some("free memory space"),
            Operation::SpaceCopy => Some("copy across memory spaces"),
            Operation::MemoryFd => Some("open memory fd"),
            Operation::CaptureCreate => Some("create capture engine"),
            Operation::CaptureRecv => Some("receive packets"),
            Operation::CaptureSeek => Some("seek capture source"),
            Operation::CaptureCallback => Some("invoke sequence-change callback"),
            Operation::None => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str().unwrap_or(""))
    }
}

enum Repr {
    Io(io::Error),
    Kind(Kind),
    Kernel(kernel::Error),
    /// A spec-level `Kind` caused by some other crate's error type (e.g. a
    /// CUDA driver error), kept as formatted text since the cause type
    /// isn't uniform across the `cuda` feature's platforms.
    External(Kind, String),
}

/// A ring, capture, or memory-space operation error.
#[non_exhaustive]
pub struct Error {
    repr: Repr,
    op: Operation,
}

impl Error {
    /// Returns an error that wraps a `std::io::Error` along with an [`Operation`].
    pub fn io(op: Operation, err: io::Error) -> Self {
        Self { repr: Repr::Io(err), op }
    }

    /// Returns an error for one of the spec-level [`Kind`]s.
    pub fn kind(op: Operation, kind: Kind) -> Self {
        Self { repr: Repr::Kind(kind), op }
    }

    /// Returns an error that wraps a [`KernelResult`] along with an [`Operation`].
    pub fn kernel(op: Operation, code: KernelResult) -> Self {
        Self { repr: Repr::Kernel(kernel::Error(code)), op }
    }

    /// Returns an error representing the last OS error which occurred.
    pub fn last_os_error(op: Operation) -> Self {
        Self::io(op, io::Error::last_os_error())
    }

    /// Shorthand for `Error::kind(op, Kind::InvalidArgument)`.
    pub fn invalid_argument(op: Operation) -> Self {
        Self::kind(op, Kind::InvalidArgument)
    }

    /// Shorthand for `Error::kind(op, Kind::InvalidState)`.
    pub fn invalid_state(op: Operation) -> Self {
        Self::kind(op, Kind::InvalidState)
    }

    /// Shorthand for `Error::kind(op, Kind::Unsupported)`.
    pub fn unsupported(op: Operation) -> Self {
        Self::kind(op, Kind::Unsupported)
    }

    /// Shorthand for `Error::kind(op, Kind::InvalidSpace)`.
    pub fn invalid_space(op: Operation) -> Self {
        Self::kind(op, Kind::InvalidSpace)
    }

    /// Shorthand for `Error::kind(op, Kind::Overrun)`.
    pub fn overrun(op: Operation) -> Self {
        Self::kind(op, Kind::Overrun)
    }

    /// Returns an error for one of the spec-level [`Kind`]s caused by some
    /// other crate's error type (used by the `cuda` feature to wrap
    /// `cudarc` driver errors without forcing that type into `Repr`).
    pub fn external(op: Operation, kind: Kind, cause: impl fmt::Display) -> Self {
        Self { repr: Repr::External(kind, cause.to_string()), op }
    }

    /// Returns the OS error that this error represents, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        if let Repr::Io(e) = &self.repr {
            e.raw_os_error()
        } else {
            None
        }
    }

    /// Returns the corresponding `std::io::ErrorKind` for this error.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self.repr {
            Repr::Io(ref err) => err.kind(),
            Repr::Kernel(ref err) => err.kind(),
            Repr::Kind(Kind::WouldBlock) | Repr::External(Kind::WouldBlock, _) => {
                io::ErrorKind::WouldBlock
            }
            Repr::Kind(Kind::Timeout) | Repr::External(Kind::Timeout, _) => io::ErrorKind::TimedOut,
            Repr::Kind(Kind::InvalidArgument) | Repr::External(Kind::InvalidArgument, _) => {
                io::ErrorKind::InvalidInput
            }
            Repr::Kind(_) | Repr::External(_, _) => io::ErrorKind::Other,
        }
    }

    /// Returns the spec-level [`Kind`] for this error, if this error didn't
    /// originate from a bare `std::io::Error`/kernel code.
    pub fn spec_kind(&self) -> Option<Kind> {
        match self.repr {
            Repr::Kind(k) => Some(k),
            Repr::External(k, _) => Some(k),
            _ => None,
        }
    }

    /// Returns the [`Operation`] that caused the error.
    pub fn operation(&self) -> Operation {
        self.op
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.repr {
            Repr::Io(ref err) => Some(err),
            Repr::Kind(_) | Repr::Kernel(_) | Repr::External(_, _) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { repr: Repr::Io(err), op: Operation::None }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr {
            Repr::Io(ref err) => {
                fmt.debug_struct("Error").field("op", &self.op).field("io", err).finish()
            }
            Repr::Kind(ref kind) => {
                fmt.debug_struct("Error").field("op", &self.op).field("kind", kind).finish()
            }
            Repr::Kernel(ref err) => {
                fmt.debug_struct("Error").field("op", &self.op).field("kernel", err).finish()
            }
            Repr::External(ref kind, ref cause) => fmt
                .debug_struct("Error")
                .field("op", &self.op)
                .field("kind", kind)
                .field("cause", cause)
                .finish(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Repr::External(ref kind, ref cause) = self.repr {
            return match self.op.as_str() {
                Some(op) => write!(fmt, "failed to {}, {}: {}", op, kind, cause),
                None => write!(fmt, "{}: {}", kind, cause),
            };
        }
        let value: &dyn fmt::Display = match self.repr {
            Repr::Io(ref err) => err,
            Repr::Kind(ref kind) => kind,
            Repr::Kernel(ref err) => err,
            Repr::External(..) => unreachable!(),
        };
        if let Some(op) = self.op.as_str() {
            write!(fmt, "failed to {}, {}", op, value)
        } else {
            value.fmt(fmt)
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
mod kernel {
    use super::{fmt, io, KernelResult};

    pub struct Error(pub KernelResult);

    impl fmt::Debug for Error {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(fmt, "\"{}\"", self)
        }
    }

    impl fmt::Display for Error {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(fmt, "unexpected kernel error {}", self.0)
        }
    }

    impl Error {
        pub fn kind(&self) -> io::ErrorKind {
            io::ErrorKind::Other
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod kernel {
    use super::{fmt, io, KernelResult};
    use std::ffi::CStr;
    use std::os::raw::c_char;

    extern "C" {
        fn mach_error_string(code: KernelResult) -> *const c_char;
    }

    pub struct Error(pub KernelResult);

    impl fmt::Debug for Error {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(fmt, "\"{}\"", self)
        }
    }

    impl fmt::Display for Error {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            let msg = unsafe { CStr::from_ptr(mach_error_string(self.0)) };
            match msg.to_str() {
                Err(err) => write!(fmt, "invalid kernel error {} ({})", self.0, err),
                Ok(val) => write!(fmt, "{} (kernel error {})", val, self.0),
            }
        }
    }

    impl Error {
        pub fn kind(&self) -> io::ErrorKind {
            io::ErrorKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_operation() {
        let err = Error::invalid_state(Operation::RingOpenWriting);
        let msg = format!("{}", err);
        assert!(msg.contains("open ring for writing"));
        assert!(msg.contains("invalid state"));
    }

    #[test]
    fn spec_kind_roundtrip() {
        let err = Error::kind(Operation::RingReserve, Kind::WouldBlock);
        assert_eq!(err.spec_kind(), Some(Kind::WouldBlock));
        assert_eq!(err.io_kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn io_error_has_no_spec_kind() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "x").into();
        assert_eq!(err.spec_kind(), None);
    }
}
