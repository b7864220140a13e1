//! # Memory Subsystem Errors
//!
//! One error type shared by the frame allocator, the heap and the pager.
//! Core operations return [`Result<T, MemoryError>`](MemoryError) and never
//! abort; callers that want the historical fail-fast behaviour go through
//! [`OrAbort`], which logs the fault together with the [`CallSite`] and
//! panics. The kernel's panic handler halts the machine.
//!
//! ```rust
//! use kernel_memory_error::{MemoryError, call_site};
//!
//! let site = call_site!();
//! assert!(site.line > 0);
//! assert_eq!(MemoryError::DoubleFree.code(), 0x0404);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::panic::Location;

/// Errors reported by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// No free frame, no fitting heap block, or no frame left for a page.
    #[error("out of memory")]
    OutOfMemory,

    /// Zero size, misaligned address, or a pointer that does not designate a block.
    #[error("invalid argument")]
    InvalidArgument,

    /// The address lies outside the range the component manages.
    #[error("address outside the managed range")]
    OutOfRange,

    /// The frame or block is already free.
    #[error("double free")]
    DoubleFree,

    /// A translation walk hit an absent or huge intermediate entry.
    #[error("page-table level missing")]
    TableLevelMissing,

    /// The component was used before `init`.
    #[error("not initialized")]
    NotInitialized,

    /// Paging cannot be enabled on this CPU configuration (PAE is off).
    #[error("paging unavailable: PAE disabled")]
    PagingUnavailable,

    /// Heap metadata at the given arena offset failed validation.
    #[error("heap metadata corrupted at offset {0:#x}")]
    Corrupted(usize),
}

impl MemoryError {
    /// Subsystem identifier used in the high byte of [`code`](Self::code).
    pub const SUBSYSTEM: u16 = 0x04;

    /// Stable numeric code for logs and panic messages.
    #[must_use]
    pub const fn code(self) -> u16 {
        let low = match self {
            Self::OutOfMemory => 0x01,
            Self::InvalidArgument => 0x02,
            Self::OutOfRange => 0x03,
            Self::DoubleFree => 0x04,
            Self::TableLevelMissing => 0x05,
            Self::NotInitialized => 0x06,
            Self::PagingUnavailable => 0x07,
            Self::Corrupted(_) => 0x08,
        };
        (Self::SUBSYSTEM << 8) | low
    }
}

/// Where a memory operation was requested from.
///
/// Built by [`call_site!`] (file, line and module path) or by
/// [`CallSite::caller`] through `#[track_caller]` (file and line only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub caller: Option<&'static str>,
}

impl CallSite {
    #[must_use]
    pub const fn new(file: &'static str, line: u32, caller: &'static str) -> Self {
        Self {
            file,
            line,
            caller: Some(caller),
        }
    }

    /// The location of the (transitively `#[track_caller]`) caller.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        let location: &'static Location<'static> = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            caller: None,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(caller) = self.caller {
            write!(f, " ({caller})")?;
        }
        Ok(())
    }
}

/// Captures the current file, line and module path as a [`CallSite`].
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::CallSite::new(::core::file!(), ::core::line!(), ::core::module_path!())
    };
}

/// Logs `error` and raises an unrecoverable fault carrying the call site.
#[cold]
#[inline(never)]
pub fn fatal(error: MemoryError, site: CallSite) -> ! {
    log::error!("memory fault E{:04X}: {error} at {site}", error.code());
    panic!("memory fault E{:04X}: {error} at {site}", error.code());
}

/// Turns a recoverable [`MemoryError`] into a fatal fault.
pub trait OrAbort<T> {
    /// Returns the value, or calls [`fatal`] with `site`.
    fn or_abort(self, site: CallSite) -> T;

    /// Like [`or_abort`](Self::or_abort), reporting the caller's location.
    #[track_caller]
    fn unwrap_or_abort(self) -> T
    where
        Self: Sized,
    {
        self.or_abort(CallSite::caller())
    }
}

impl<T> OrAbort<T> for Result<T, MemoryError> {
    #[inline]
    fn or_abort(self, site: CallSite) -> T {
        match self {
            Ok(value) => value,
            Err(error) => fatal(error, site),
        }
    }
}
