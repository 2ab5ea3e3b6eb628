//! `yapp` is a cross-platform library for parsing, validating, navigating and
//! mutating [Portable Executable](https://learn.microsoft.com/en-us/windows/win32/debug/pe-format)
//! images.
//!
//! The library is built around three ideas:
//!
//! * a [`Buffer`](crate::buffer::Buffer) object which holds (or views) the raw image
//!   bytes and hands out bounds- and alignment-checked typed sub-views of itself,
//! * typed [addresses](crate::types::Address) — file [`Offset`](crate::types::Offset)s,
//!   [`RVA`](crate::types::RVA)s and [`VA`](crate::types::VA)s — which convert between
//!   one another through the section table of a parsed image, and
//! * a [`Pe`](crate::pe::Pe) facade which owns the image bytes and exposes the DOS, NT,
//!   file, optional and section headers as typed views.
//!
//! Sub-views are tracked at runtime: freeing or reallocating a buffer invalidates every
//! view carved from it, and later access through a stale view fails with
//! [`Error::DanglingView`] instead of touching freed memory.
//!
//! ```rust,no_run
//! use yapp::pe::Pe;
//! use yapp::types::Address;
//!
//! # fn parse(path: &str) -> Result<(), yapp::Error> {
//! let pe = Pe::from_disk_file(path)?;
//! let entrypoint = pe.entrypoint()?;
//! let _offset = entrypoint.as_offset(&pe)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod directories;
pub mod headers;
pub mod pe;
pub mod types;

#[cfg(test)]
mod tests;

use std::io;
use std::path::PathBuf;

use thiserror::Error as ThisError;

use crate::types::{Offset, RVA, VA};

pub use crate::buffer::{Buffer, Castable};
pub use crate::pe::Pe;

/// Everything that can go wrong while handling buffers or PE images.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An access went past the end of a buffer.
    #[error("offset {offset} is out of bounds, size is {size}")]
    OutOfBounds { offset: usize, size: usize },
    /// Two element sizes do not divide one another.
    #[error("element sizes {left} and {right} do not align with one another")]
    Alignment { left: usize, right: usize },
    /// A conversion between element types would split an element.
    #[error("insufficient data: got {offered} units of size {unit_size}, needed a multiple of {needed}")]
    InsufficientData {
        offered: usize,
        unit_size: usize,
        needed: usize,
    },
    /// An operation was attempted on an empty buffer.
    #[error("encountered an unexpected null buffer")]
    NullPointer,
    /// A sub-view was invalidated before it could be used.
    #[error("the view at {address:#x} with size {size} was invalidated before use")]
    DanglingView { address: usize, size: usize },
    /// A dynamic search term consisted solely of wildcards.
    #[error("search terms cannot be all wildcards")]
    SearchTooBroad,
    /// An allocation was requested below the minimum element size.
    #[error("allocation size {attempted} is insufficient, needed at least {needed}")]
    InsufficientAllocation { attempted: usize, needed: usize },
    /// The allocator handed back a null pointer.
    #[error("the allocator returned an invalid allocation")]
    BadAllocation,
    /// A resizing operation was attempted on an unowned buffer.
    #[error("the buffer does not own its allocation")]
    NotAllocated,
    /// The `e_magic` field was not `MZ`.
    #[error("invalid DOS signature {0:#06x}")]
    InvalidDOSSignature(u16),
    /// The NT `Signature` field was not `PE\0\0`.
    #[error("invalid NT signature {0:#010x}")]
    InvalidNTSignature(u32),
    /// The optional header magic was not the expected value.
    #[error("unexpected optional header magic {got:#06x}, expected {expected:#06x}")]
    UnexpectedOptionalMagic { got: u16, expected: u16 },
    /// The given offset does not land inside the image.
    #[error("invalid offset {0:?}")]
    InvalidOffset(Offset),
    /// The given RVA does not land inside the image.
    #[error("invalid RVA {0:?}")]
    InvalidRVA(RVA),
    /// The given VA does not land inside the image.
    #[error("invalid VA {0:?}")]
    InvalidVA(VA),
    /// No section contains the given lookup key.
    #[error("the section could not be found with the given parameter")]
    SectionNotFound,
    /// The section table cannot hold more than 65535 entries.
    #[error("operation would overflow the section table")]
    SectionTableOverflow,
    /// The requested data directory slot is empty or invalid.
    #[error("data directory {0} is either null or invalid")]
    DirectoryUnavailable(usize),
    /// The machine type of the image is not one this library understands.
    #[error("the architecture of this PE file is unsupported")]
    UnsupportedArchitecture,
    /// A file could not be opened or written.
    #[error("failed to open file {path:?}: {source}")]
    OpenFileFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Round `base` up to the next multiple of `alignment`.
pub fn align(base: u32, alignment: u32) -> u32 {
    if alignment == 0 || base % alignment == 0 {
        base
    } else {
        base + (alignment - (base % alignment))
    }
}

#[cfg(test)]
mod align_tests {
    use super::align;

    #[test]
    fn test_align() {
        assert_eq!(align(0, 0x200), 0);
        assert_eq!(align(1, 0x200), 0x200);
        assert_eq!(align(0x200, 0x200), 0x200);
        assert_eq!(align(0x201, 0x200), 0x400);
        assert_eq!(align(0x1234, 0), 0x1234);
    }
}
