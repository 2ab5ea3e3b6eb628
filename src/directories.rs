//! Data directory parsers.
//!
//! Each parser type carries the index of the slot it lives in, and the generic
//! accessor [`DataDirectory::directory`](crate::headers::DataDirectory::directory)
//! resolves the slot's RVA and hands the parser a view of that location. Only the
//! export directory gets a parser here; the raw layouts of the other documented
//! directories live in [`headers`](crate::headers) for callers walking them by hand.

use std::cmp;
use std::collections::HashMap;
use std::mem;

use crate::buffer::{Buffer, Castable};
use crate::headers::{ImageDataDirectory, ImageDirectoryEntry, ImageExportDirectory};
use crate::pe::Pe;
use crate::types::{Address, CChar, CCharString, RVA};
use crate::Error;

/// A type which parses the contents of one data directory slot.
pub trait DirectoryTable: Sized {
    /// The slot this directory lives in.
    const INDEX: usize;

    /// Parse the directory from its resolved slot.
    fn from_entry(pe: &Pe, entry: ImageDataDirectory) -> Result<Self, Error>;
}

/// What one export thunk turned out to be.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ExportThunkData {
    /// An export by ordinal.
    Ordinal(u32),
    /// An RVA to the exported function.
    Function(RVA),
    /// An RVA to a `Dll.Name` forwarder string inside the export directory.
    ForwarderString(RVA),
}

/// One entry of the export functions array.
///
/// The high bit marks ordinal thunks; otherwise the low bits are an RVA, which is a
/// forwarder string when it points back into the export directory's own range.
pub trait ExportThunk: Castable {
    /// The width of the matching name ordinal entries.
    type Ordinal: Castable + Into<u32>;

    fn value(&self) -> u64;

    fn is_ordinal(&self) -> bool;

    /// The ordinal value of an ordinal thunk.
    fn ordinal(&self) -> u32;

    /// Classify this thunk against the export directory's own `[start, end)` range.
    fn parse(&self, start: RVA, end: RVA) -> ExportThunkData {
        if self.is_ordinal() {
            return ExportThunkData::Ordinal(self.ordinal());
        }

        let rva = RVA(self.value() as u32);

        if start.0 <= rva.0 && rva.0 < end.0 {
            ExportThunkData::ForwarderString(rva)
        } else {
            ExportThunkData::Function(rva)
        }
    }
}

/// An export thunk in a 32-bit image: 32-bit value, 16-bit ordinals.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ExportThunk32(pub u32);

unsafe impl Castable for ExportThunk32 {}

impl ExportThunk for ExportThunk32 {
    type Ordinal = u16;

    fn value(&self) -> u64 {
        self.0 as u64
    }

    fn is_ordinal(&self) -> bool {
        (self.0 & 0x8000_0000) != 0
    }

    fn ordinal(&self) -> u32 {
        self.0 & 0xFFFF
    }
}

/// An export thunk in a 64-bit image: 64-bit value, 32-bit ordinals.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ExportThunk64(pub u64);

unsafe impl Castable for ExportThunk64 {}

impl ExportThunk for ExportThunk64 {
    type Ordinal = u32;

    fn value(&self) -> u64 {
        self.0
    }

    fn is_ordinal(&self) -> bool {
        (self.0 & 0x8000_0000_0000_0000) != 0
    }

    fn ordinal(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

/// The export directory, generic over the image's thunk width.
pub struct ExportDirectoryBase<T: ExportThunk> {
    region: Buffer<ImageExportDirectory>,
    start: RVA,
    end: RVA,
    _thunk: std::marker::PhantomData<T>,
}

/// The export directory of a 32-bit image.
pub type ExportDirectory32 = ExportDirectoryBase<ExportThunk32>;
/// The export directory of a 64-bit image.
pub type ExportDirectory64 = ExportDirectoryBase<ExportThunk64>;

impl<T: ExportThunk> ExportDirectoryBase<T> {
    /// Parse the export directory out of its resolved slot.
    pub fn from_entry(pe: &Pe, entry: ImageDataDirectory) -> Result<Self, Error> {
        let virtual_address = entry.virtual_address;
        let offset = virtual_address.as_memory(pe)?;

        // the directory is variable-length: the slot's size covers the trailing
        // arrays and strings, clamped to what the image actually holds
        let available = pe.len().saturating_sub(offset);
        let size = cmp::max(
            cmp::min(entry.size as usize, available),
            mem::size_of::<ImageExportDirectory>(),
        );

        let region = pe.subregion_variadic::<ImageExportDirectory>(offset, size)?;

        Ok(Self {
            region,
            start: virtual_address,
            end: virtual_address + entry.size,
            _thunk: std::marker::PhantomData,
        })
    }

    /// Copy the raw directory header out of the image.
    pub fn read(&self) -> Result<ImageExportDirectory, Error> {
        self.region.get(0)
    }

    /// The `[start, end)` RVA range of the directory, used to classify forwarders.
    pub fn bounds(&self) -> (RVA, RVA) {
        (self.start, self.end)
    }

    /// A view of the DLL's own name string.
    pub fn name(&self, pe: &Pe) -> Result<Buffer<CChar>, Error> {
        let name = self.read()?.name;

        if name.0 == 0 {
            return Err(Error::InvalidRVA(RVA(0)));
        }

        pe.cstring_at(name.as_memory(pe)?)
    }

    /// The DLL's own name, lossily decoded.
    pub fn name_string(&self, pe: &Pe) -> Result<String, Error> {
        Ok(self.name(pe)?.to_vec()?.as_str().into_owned())
    }

    /// A view of the function thunk array.
    pub fn functions(&self, pe: &Pe) -> Result<Buffer<T>, Error> {
        let header = self.read()?;
        let address = header.address_of_functions;

        if address.0 == 0 {
            return Err(Error::InvalidRVA(RVA(0)));
        }

        pe.buffer()
            .subregion::<T>(address.as_memory(pe)?, header.number_of_functions as usize)
    }

    /// A view of the name RVA array.
    pub fn names(&self, pe: &Pe) -> Result<Buffer<RVA>, Error> {
        let header = self.read()?;
        let address = header.address_of_names;

        if address.0 == 0 {
            return Err(Error::InvalidRVA(RVA(0)));
        }

        pe.buffer()
            .subregion::<RVA>(address.as_memory(pe)?, header.number_of_names as usize)
    }

    /// A view of the name ordinal array, parallel to the names.
    pub fn name_ordinals(&self, pe: &Pe) -> Result<Buffer<T::Ordinal>, Error> {
        let header = self.read()?;
        let address = header.address_of_name_ordinals;

        if address.0 == 0 {
            return Err(Error::InvalidRVA(RVA(0)));
        }

        pe.buffer()
            .subregion::<T::Ordinal>(address.as_memory(pe)?, header.number_of_names as usize)
    }

    /// Build the map from export name to thunk data.
    ///
    /// For each named export, the name ordinal indexes the function array. Exports
    /// whose names cannot be resolved are skipped rather than failing the whole map;
    /// unnamed exports stay reachable by ordinal (`Base` plus function index).
    pub fn export_map(&self, pe: &Pe) -> Result<HashMap<String, ExportThunkData>, Error> {
        let header = self.read()?;
        let functions = self.functions(pe)?;
        let names = self.names(pe)?;
        let ordinals = self.name_ordinals(pe)?;

        let mut result = HashMap::new();

        for index in 0..header.number_of_names as usize {
            let name_rva = names.get(index)?;

            if name_rva.0 == 0 {
                continue;
            }

            let name_offset = match name_rva.as_memory(pe) {
                Ok(offset) => offset,
                Err(_) => continue,
            };

            let name = match pe.cstring_at(name_offset) {
                Ok(string) => string.to_vec()?.as_str().into_owned(),
                Err(_) => continue,
            };

            let ordinal: u32 = ordinals.get(index)?.into();
            let thunk = functions.get(ordinal as usize)?;

            result.insert(name, thunk.parse(self.start, self.end));
        }

        Ok(result)
    }
}

/// The export directory of either width, picked by the image's architecture.
pub enum ExportDirectory {
    Export32(ExportDirectory32),
    Export64(ExportDirectory64),
}

impl ExportDirectory {
    pub fn is_32(&self) -> bool {
        matches!(self, ExportDirectory::Export32(_))
    }

    pub fn is_64(&self) -> bool {
        matches!(self, ExportDirectory::Export64(_))
    }

    /// Copy the raw directory header out of the image.
    pub fn read(&self) -> Result<ImageExportDirectory, Error> {
        match self {
            ExportDirectory::Export32(directory) => directory.read(),
            ExportDirectory::Export64(directory) => directory.read(),
        }
    }

    /// The DLL's own name, lossily decoded.
    pub fn name_string(&self, pe: &Pe) -> Result<String, Error> {
        match self {
            ExportDirectory::Export32(directory) => directory.name_string(pe),
            ExportDirectory::Export64(directory) => directory.name_string(pe),
        }
    }

    /// Build the map from export name to thunk data.
    pub fn export_map(&self, pe: &Pe) -> Result<HashMap<String, ExportThunkData>, Error> {
        match self {
            ExportDirectory::Export32(directory) => directory.export_map(pe),
            ExportDirectory::Export64(directory) => directory.export_map(pe),
        }
    }
}

impl DirectoryTable for ExportDirectory {
    const INDEX: usize = ImageDirectoryEntry::Export as usize;

    fn from_entry(pe: &Pe, entry: ImageDataDirectory) -> Result<Self, Error> {
        if pe.arch()?.is_32bit() {
            Ok(ExportDirectory::Export32(ExportDirectory32::from_entry(
                pe, entry,
            )?))
        } else {
            Ok(ExportDirectory::Export64(ExportDirectory64::from_entry(
                pe, entry,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thunk_classification() {
        let start = RVA(0x3000);
        let end = RVA(0x3100);

        assert_eq!(
            ExportThunk32(0x8000_0005).parse(start, end),
            ExportThunkData::Ordinal(5)
        );
        assert_eq!(
            ExportThunk32(0x1024).parse(start, end),
            ExportThunkData::Function(RVA(0x1024))
        );
        assert_eq!(
            ExportThunk32(0x3060).parse(start, end),
            ExportThunkData::ForwarderString(RVA(0x3060))
        );

        assert_eq!(
            ExportThunk64(0x8000_0000_0001_0004).parse(start, end),
            ExportThunkData::Ordinal(0x10004)
        );
        assert_eq!(
            ExportThunk64(0x2000).parse(start, end),
            ExportThunkData::Function(RVA(0x2000))
        );
    }
}
