//! The address kinds and character types used throughout a PE image.
//!
//! A PE names the same byte three different ways depending on where the image lives:
//! an [`Offset`] indexes the file on disk, an [`RVA`] indexes the loaded image relative
//! to its base, and a [`VA`] is an absolute virtual address. The [`Address`] trait
//! converts between the three by consulting a parsed [`Pe`](crate::pe::Pe)'s section
//! table and optional header.

use std::borrow::Cow;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use widestring::U16Str;

use crate::buffer::Castable;
use crate::pe::Pe;
use crate::Error;

/// The architectures this library can translate addresses for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Arch {
    I386,
    Amd64,
    Arm,
    Arm64,
}

impl Arch {
    /// Whether addresses on this architecture are 32 bits wide.
    pub fn is_32bit(self) -> bool {
        matches!(self, Arch::I386 | Arch::Arm)
    }
}

/// How the bytes backing a PE image are laid out.
///
/// A `Disk` image follows file offsets. A `Memory` image has already been laid out the
/// way the loader would place it, but lives at an arbitrary buffer address. A `Virtual`
/// image additionally sits at its real image base in this process. The image type
/// decides whether an [`Offset`] or an [`RVA`] natively indexes the backing bytes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageType {
    Disk,
    Memory,
    Virtual,
}

/// A single byte of a NUL-terminated C string in image data.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct CChar(pub u8);

unsafe impl Castable for CChar {}

/// String views over `[CChar]` slices.
pub trait CCharString {
    /// The slice up to (excluding) the first NUL, or the whole slice if none.
    fn zero_terminated(&self) -> &Self;
    /// Interpret the zero-terminated portion as UTF-8, lossily.
    fn as_str(&self) -> Cow<'_, str>;
}

impl CCharString for [CChar] {
    fn zero_terminated(&self) -> &Self {
        self.iter()
            .position(|&CChar(byte)| byte == 0)
            .map(|position| &self[..position])
            .unwrap_or(self)
    }
    fn as_str(&self) -> Cow<'_, str> {
        let terminated = self.zero_terminated();
        // CChar is a transparent u8 wrapper
        let bytes = unsafe { &*(terminated as *const [CChar] as *const [u8]) };

        String::from_utf8_lossy(bytes)
    }
}

/// A single UTF-16 unit of a NUL-terminated wide string in image data.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct WChar(pub u16);

unsafe impl Castable for WChar {}

/// String views over `[WChar]` slices.
pub trait WCharString {
    /// The slice up to (excluding) the first NUL, or the whole slice if none.
    fn zero_terminated(&self) -> &Self;
    /// Interpret the zero-terminated portion as a UTF-16 string view.
    fn as_u16_str(&self) -> &U16Str;
}

impl WCharString for [WChar] {
    fn zero_terminated(&self) -> &Self {
        self.iter()
            .position(|&WChar(unit)| unit == 0)
            .map(|position| &self[..position])
            .unwrap_or(self)
    }
    fn as_u16_str(&self) -> &U16Str {
        let terminated = self.zero_terminated();
        // WChar is a transparent u16 wrapper
        let units = unsafe { &*(terminated as *const [WChar] as *const [u16]) };

        U16Str::from_slice(units)
    }
}

/// Conversions between the three PE address spaces, mediated by a parsed image.
pub trait Address {
    /// Convert this address to a file offset.
    fn as_offset(&self, pe: &Pe) -> Result<Offset, Error>;
    /// Convert this address to an RVA.
    fn as_rva(&self, pe: &Pe) -> Result<RVA, Error>;
    /// Convert this address to a VA of the image's architecture.
    fn as_va(&self, pe: &Pe) -> Result<VA, Error>;
    /// Convert this address to an index into the image's backing bytes, which is an
    /// offset for disk images and an RVA for memory and virtual images.
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error>;
}

macro_rules! saturating_arithmetic {
    ($address:ident, $base:ty) => {
        impl Add<$base> for $address {
            type Output = $address;

            fn add(self, other: $base) -> $address {
                $address(self.0.saturating_add(other))
            }
        }
        impl AddAssign<$base> for $address {
            fn add_assign(&mut self, other: $base) {
                self.0 = self.0.saturating_add(other);
            }
        }
        impl Sub<$base> for $address {
            type Output = $address;

            fn sub(self, other: $base) -> $address {
                $address(self.0.saturating_sub(other))
            }
        }
        impl SubAssign<$base> for $address {
            fn sub_assign(&mut self, other: $base) {
                self.0 = self.0.saturating_sub(other);
            }
        }
    };
}

/// A 32-bit byte offset into the on-disk image.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub u32);

unsafe impl Castable for Offset {}
saturating_arithmetic!(Offset, u32);

impl Address for Offset {
    fn as_offset(&self, _: &Pe) -> Result<Offset, Error> {
        Ok(*self)
    }
    fn as_rva(&self, pe: &Pe) -> Result<RVA, Error> {
        pe.offset_to_rva(*self)
    }
    fn as_va(&self, pe: &Pe) -> Result<VA, Error> {
        pe.offset_to_va(*self)
    }
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error> {
        match pe.image_type() {
            ImageType::Disk => Ok(self.0 as usize),
            ImageType::Memory | ImageType::Virtual => Ok(self.as_rva(pe)?.0 as usize),
        }
    }
}

impl From<Offset> for usize {
    fn from(offset: Offset) -> usize {
        offset.0 as usize
    }
}

/// A 32-bit address relative to the in-memory image base.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RVA(pub u32);

unsafe impl Castable for RVA {}
saturating_arithmetic!(RVA, u32);

impl Address for RVA {
    fn as_offset(&self, pe: &Pe) -> Result<Offset, Error> {
        pe.rva_to_offset(*self)
    }
    fn as_rva(&self, _: &Pe) -> Result<RVA, Error> {
        Ok(*self)
    }
    fn as_va(&self, pe: &Pe) -> Result<VA, Error> {
        pe.rva_to_va(*self)
    }
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error> {
        match pe.image_type() {
            ImageType::Disk => Ok(self.as_offset(pe)?.0 as usize),
            ImageType::Memory | ImageType::Virtual => {
                if pe.validate_rva(*self) {
                    Ok(self.0 as usize)
                } else {
                    Err(Error::InvalidRVA(*self))
                }
            }
        }
    }
}

impl From<RVA> for usize {
    fn from(rva: RVA) -> usize {
        rva.0 as usize
    }
}

/// An absolute virtual address in a 32-bit image.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VA32(pub u32);

unsafe impl Castable for VA32 {}
saturating_arithmetic!(VA32, u32);

impl Address for VA32 {
    fn as_offset(&self, pe: &Pe) -> Result<Offset, Error> {
        pe.va_to_offset(VA::VA32(*self))
    }
    fn as_rva(&self, pe: &Pe) -> Result<RVA, Error> {
        pe.va_to_rva(VA::VA32(*self))
    }
    fn as_va(&self, _: &Pe) -> Result<VA, Error> {
        Ok(VA::VA32(*self))
    }
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error> {
        self.as_rva(pe)?.as_memory(pe)
    }
}

/// An absolute virtual address in a 64-bit image.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VA64(pub u64);

unsafe impl Castable for VA64 {}
saturating_arithmetic!(VA64, u64);

impl Address for VA64 {
    fn as_offset(&self, pe: &Pe) -> Result<Offset, Error> {
        pe.va_to_offset(VA::VA64(*self))
    }
    fn as_rva(&self, pe: &Pe) -> Result<RVA, Error> {
        pe.va_to_rva(VA::VA64(*self))
    }
    fn as_va(&self, _: &Pe) -> Result<VA, Error> {
        Ok(VA::VA64(*self))
    }
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error> {
        self.as_rva(pe)?.as_memory(pe)
    }
}

/// An absolute virtual address of either width.
///
/// The width is a runtime property of the image (`image_base` really is 32 bits on an
/// i386 image and 64 on an amd64 one), so the two cases stay distinct here and callers
/// discriminate explicitly.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum VA {
    VA32(VA32),
    VA64(VA64),
}

impl VA {
    pub fn is_32(&self) -> bool {
        matches!(self, VA::VA32(_))
    }
    pub fn is_64(&self) -> bool {
        matches!(self, VA::VA64(_))
    }

    /// The address value widened to 64 bits.
    pub fn value(&self) -> u64 {
        match self {
            VA::VA32(va) => va.0 as u64,
            VA::VA64(va) => va.0,
        }
    }
}

impl Address for VA {
    fn as_offset(&self, pe: &Pe) -> Result<Offset, Error> {
        pe.va_to_offset(*self)
    }
    fn as_rva(&self, pe: &Pe) -> Result<RVA, Error> {
        pe.va_to_rva(*self)
    }
    fn as_va(&self, _: &Pe) -> Result<VA, Error> {
        Ok(*self)
    }
    fn as_memory(&self, pe: &Pe) -> Result<usize, Error> {
        self.as_rva(pe)?.as_memory(pe)
    }
}

impl From<VA32> for VA {
    fn from(va: VA32) -> Self {
        VA::VA32(va)
    }
}

impl From<VA64> for VA {
    fn from(va: VA64) -> Self {
        VA::VA64(va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_arithmetic() {
        assert_eq!(RVA(0xFFFF_FFF0) + 0x20, RVA(0xFFFF_FFFF));
        assert_eq!(Offset(0x10) - 0x20, Offset(0));
        assert_eq!(VA64(u64::MAX) + 1, VA64(u64::MAX));

        let mut rva = RVA(0x1000);
        rva += 0x24;
        assert_eq!(rva, RVA(0x1024));
    }

    #[test]
    fn test_cchar_strings() {
        let chars: Vec<CChar> = b"dll.dll\0junk".iter().map(|&byte| CChar(byte)).collect();

        assert_eq!(chars.zero_terminated().len(), 7);
        assert_eq!(chars.as_str(), "dll.dll");

        let unterminated: Vec<CChar> = b"abc".iter().map(|&byte| CChar(byte)).collect();
        assert_eq!(unterminated.as_str(), "abc");
    }

    #[test]
    fn test_wchar_strings() {
        let units: Vec<WChar> = "wide\0tail".encode_utf16().map(WChar).collect();

        assert_eq!(units.as_u16_str().to_string_lossy(), "wide");
    }
}
