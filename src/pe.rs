//! The top-level PE image object.
//!
//! A [`Pe`] owns (or borrows) the raw image bytes as a [`Buffer<u8>`] and knows which
//! [`ImageType`] the bytes follow. Everything else — header views, the section table,
//! address conversions, the checksum — is derived from those bytes on demand.

use std::cmp;
use std::mem;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;

use crate::align;
use crate::buffer::{Buffer, Castable};
use crate::headers::{
    DOSHeader, DataDirectory, ImageDOSHeader, ImageFileHeader, ImageNTHeaders32,
    ImageNTHeaders64, ImageSectionHeader, Machine, NTHeaders, NTHeaders32, NTHeaders64,
    OptionalHeader, SectionTable, HDR32_MAGIC, HDR64_MAGIC,
};
use crate::types::{Address, Arch, CChar, ImageType, Offset, RVA, VA, WChar};
use crate::Error;

/// A Portable Executable image.
pub struct Pe {
    buffer: Buffer<u8>,
    image_type: ImageType,
}

impl Pe {
    /// Create a zero-filled image of the given size.
    pub fn new(image_type: ImageType, size: usize) -> Result<Self, Error> {
        Ok(Self {
            buffer: Buffer::allocate_bytes(size)?,
            image_type,
        })
    }

    /// Adopt a copy of the given bytes as an image.
    pub fn from_data<B: AsRef<[u8]>>(image_type: ImageType, data: B) -> Result<Self, Error> {
        Ok(Self {
            buffer: Buffer::from_data(data.as_ref())?,
            image_type,
        })
    }

    /// Read an image from disk.
    pub fn from_file<P: AsRef<Path>>(image_type: ImageType, filename: P) -> Result<Self, Error> {
        let buffer = Buffer::from_file(filename.as_ref())?;

        debug!(
            path = %filename.as_ref().display(),
            size = buffer.byte_len(),
            ?image_type,
            "loaded PE image"
        );

        Ok(Self { buffer, image_type })
    }

    /// Read a file laid out in disk format.
    pub fn from_disk_file<P: AsRef<Path>>(filename: P) -> Result<Self, Error> {
        Self::from_file(ImageType::Disk, filename)
    }

    /// Read a file whose bytes were dumped from memory.
    pub fn from_memory_file<P: AsRef<Path>>(filename: P) -> Result<Self, Error> {
        Self::from_file(ImageType::Memory, filename)
    }

    /// Borrow an image already mapped at its base address in this process.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and unmoved for the lifetime of the `Pe` and every
    /// view carved from it.
    pub unsafe fn from_ptr(pointer: *const u8, size: usize) -> Result<Self, Error> {
        Ok(Self {
            buffer: Buffer::from_ptr_bytes(pointer, size)?,
            image_type: ImageType::Virtual,
        })
    }

    /// Write the image bytes back to disk verbatim.
    pub fn save<P: AsRef<Path>>(&self, filename: P) -> Result<(), Error> {
        debug!(
            path = %filename.as_ref().display(),
            size = self.buffer.byte_len(),
            "saving PE image"
        );

        self.buffer.save(filename)
    }

    /// Which layout the backing bytes follow.
    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &Buffer<u8> {
        &self.buffer
    }

    /// The backing buffer, mutably.
    pub fn buffer_mut(&mut self) -> &mut Buffer<u8> {
        &mut self.buffer
    }

    /// The image size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.byte_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Copy `count` bytes out of the image.
    pub fn read(&self, offset: usize, count: usize) -> Result<Vec<u8>, Error> {
        self.buffer.read(offset, count)
    }

    /// Write bytes into the image. Writes never grow the image.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.buffer.write(offset, data)
    }

    /// Copy a value of type `U` out of the image at the given byte offset.
    pub fn get_typed<U: Castable>(&self, offset: usize) -> Result<U, Error> {
        self.buffer.get_typed(offset)
    }

    /// Write a value of type `U` into the image at the given byte offset.
    pub fn write_typed<U: Castable>(&mut self, offset: usize, value: U) -> Result<(), Error> {
        self.buffer.write_typed(offset, value)
    }

    /// Append bytes to the image, growing it. Owned images only.
    pub fn append(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buffer.append(data)
    }

    /// Carve a typed view of `elements` elements out of the image bytes.
    pub fn subregion<U: Castable>(&self, offset: usize, elements: usize) -> Result<Buffer<U>, Error> {
        self.buffer.subregion(offset, elements)
    }

    /// Carve a typed view of `size` bytes out of the image bytes.
    pub fn subregion_bytes<U: Castable>(&self, offset: usize, size: usize) -> Result<Buffer<U>, Error> {
        self.buffer.subregion_bytes(offset, size)
    }

    /// Carve a variadic view of `size` bytes out of the image bytes.
    pub fn subregion_variadic<U: Castable>(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Buffer<U>, Error> {
        self.buffer.subregion_variadic(offset, size)
    }

    /// Copy the whole image out as bytes.
    pub fn as_bytes(&self) -> Result<Vec<u8>, Error> {
        self.buffer.as_bytes()
    }

    /// The DOS header view, unvalidated.
    pub fn dos_header(&self) -> Result<DOSHeader, Error> {
        let region = self
            .buffer
            .subregion_variadic::<ImageDOSHeader>(0, mem::size_of::<ImageDOSHeader>())?;

        Ok(DOSHeader::new(region))
    }

    /// The DOS header view, with the `MZ` magic checked.
    pub fn valid_dos_header(&self) -> Result<DOSHeader, Error> {
        let header = self.dos_header()?;
        header.validate()?;
        Ok(header)
    }

    /// The offset to the NT headers.
    pub fn e_lfanew(&self) -> Result<Offset, Error> {
        self.valid_dos_header()?.e_lfanew()
    }

    /// The DOS stub: the bytes between the DOS header and the NT headers.
    ///
    /// Empty when `e_lfanew` overlaps the DOS header.
    pub fn dos_stub(&self) -> Result<Buffer<u8>, Error> {
        let e_lfanew = self.e_lfanew()?.0 as usize;
        let dos_end = mem::size_of::<ImageDOSHeader>();

        if e_lfanew < dos_end {
            return self.buffer.subregion::<u8>(dos_end, 0);
        }

        self.buffer.subregion::<u8>(dos_end, e_lfanew - dos_end)
    }

    /// The 32-bit NT headers view, unvalidated.
    pub fn nt_headers_32(&self) -> Result<NTHeaders32, Error> {
        let e_lfanew = self.e_lfanew()?.0 as usize;
        let region = self
            .buffer
            .subregion_variadic::<ImageNTHeaders32>(e_lfanew, mem::size_of::<ImageNTHeaders32>())?;

        Ok(NTHeaders32::new(region))
    }

    /// The 64-bit NT headers view, unvalidated.
    pub fn nt_headers_64(&self) -> Result<NTHeaders64, Error> {
        let e_lfanew = self.e_lfanew()?.0 as usize;
        let region = self
            .buffer
            .subregion_variadic::<ImageNTHeaders64>(e_lfanew, mem::size_of::<ImageNTHeaders64>())?;

        Ok(NTHeaders64::new(region))
    }

    /// The optional header magic, read without validating anything else.
    ///
    /// The magic sits at the same place in both widths, so the 32-bit view serves.
    pub fn nt_magic(&self) -> Result<u16, Error> {
        let headers = self.nt_headers_32()?.read()?;
        Ok(headers.optional_header.magic)
    }

    /// The machine code from the file header, read without validation.
    pub fn machine(&self) -> Result<u16, Error> {
        let headers = self.nt_headers_32()?.read()?;
        Ok(headers.file_header.machine)
    }

    /// The architecture of the image, from the machine code.
    pub fn arch(&self) -> Result<Arch, Error> {
        let machine = self.machine()?;

        if machine == Machine::I386 as u16 {
            Ok(Arch::I386)
        } else if machine == Machine::AMD64 as u16 {
            Ok(Arch::Amd64)
        } else if machine == Machine::ARM as u16 {
            Ok(Arch::Arm)
        } else if machine == Machine::ARM64 as u16 {
            Ok(Arch::Arm64)
        } else {
            Err(Error::UnsupportedArchitecture)
        }
    }

    /// The NT headers of whichever width the optional header magic declares, fully
    /// validated. Callers discriminate on the returned enum.
    pub fn valid_nt_headers(&self) -> Result<NTHeaders, Error> {
        let magic = self.nt_magic()?;

        if magic == HDR32_MAGIC {
            let headers = self.nt_headers_32()?;
            headers.validate()?;
            Ok(NTHeaders::NTHeaders32(headers))
        } else if magic == HDR64_MAGIC {
            let headers = self.nt_headers_64()?;
            headers.validate()?;
            Ok(NTHeaders::NTHeaders64(headers))
        } else {
            Err(Error::UnexpectedOptionalMagic {
                got: magic,
                expected: 0,
            })
        }
    }

    /// The validated optional header of whichever width the image carries.
    pub fn optional_header(&self) -> Result<OptionalHeader, Error> {
        self.valid_nt_headers()?.optional_header()
    }

    /// The entry point RVA.
    pub fn entrypoint(&self) -> Result<RVA, Error> {
        self.optional_header()?.address_of_entry_point()
    }

    /// The image base: the optional header's preference, or the actual buffer address
    /// for virtual images.
    pub fn image_base(&self) -> Result<u64, Error> {
        if self.image_type == ImageType::Virtual {
            return Ok(self.buffer.as_ptr()? as usize as u64);
        }

        self.optional_header()?.image_base()
    }

    /// The offset to the section table.
    pub fn section_table_offset(&self) -> Result<Offset, Error> {
        let e_lfanew = self.e_lfanew()?;
        let headers = self.valid_nt_headers()?;
        let size_of_optional = headers.file_header()?.size_of_optional_header()?;

        let offset = e_lfanew
            + (mem::size_of::<u32>() + mem::size_of::<ImageFileHeader>()) as u32
            + size_of_optional as u32;

        if !self.validate_offset(offset) {
            return Err(Error::InvalidOffset(offset));
        }

        Ok(offset)
    }

    /// The section table, sized by the file header's section count.
    pub fn section_table(&self) -> Result<SectionTable, Error> {
        let offset = self.section_table_offset()?.0 as usize;
        let sections = self.valid_nt_headers()?.file_header()?.number_of_sections()?;
        let region = self
            .buffer
            .subregion::<ImageSectionHeader>(offset, sections as usize)?;

        Ok(SectionTable::new(region))
    }

    /// The data directory of the validated optional header.
    pub fn data_directory(&self) -> Result<DataDirectory, Error> {
        self.optional_header()?.data_directory()
    }

    /// Add a section header to the end of the section table.
    ///
    /// The caller is responsible for the header's addresses and sizes; the table must
    /// have room inside the image for the new entry. Fails with
    /// [`Error::SectionTableOverflow`] when the count would pass 65535.
    pub fn add_section(&mut self, section: &ImageSectionHeader) -> Result<ImageSectionHeader, Error> {
        let mut file_header = self.valid_nt_headers()?.file_header()?;
        let mut raw = file_header.read()?;

        if raw.number_of_sections == 0xFFFF {
            return Err(Error::SectionTableOverflow);
        }

        raw.number_of_sections += 1;
        file_header.write(&raw)?;

        let mut table = self.section_table()?;
        let index = table.len() - 1;
        table.set(index, section)?;

        debug!(
            name = %section.name_string(),
            sections = table.len(),
            "added section"
        );

        table.get(index)
    }

    /// Append a section after the last one, placing its raw pointer and virtual
    /// address on the image's alignment boundaries.
    pub fn append_section(&mut self, section: &ImageSectionHeader) -> Result<ImageSectionHeader, Error> {
        let table = self.section_table()?;
        let last_file_size;
        let last_virtual_size;
        let last_offset;
        let last_rva;

        if table.is_empty() {
            last_file_size = self.calculate_header_size()? as u32;
            last_virtual_size = last_file_size;
            last_offset = Offset(0);
            last_rva = RVA(0);
        } else {
            let last = table.get(table.len() - 1)?;
            last_file_size = last.size_of_raw_data;
            last_virtual_size = last.virtual_size;
            last_offset = last.pointer_to_raw_data;
            last_rva = last.virtual_address;
        }

        let next_offset = self.align_to_file(last_offset + last_file_size)?;
        let next_rva = self.align_to_section(last_rva + last_virtual_size)?;

        let mut placed = *section;
        placed.pointer_to_raw_data = next_offset;
        placed.virtual_address = next_rva;

        self.add_section(&placed)
    }

    /// Whether the given offset lands inside the image bytes.
    pub fn validate_offset(&self, offset: Offset) -> bool {
        (offset.0 as usize) < self.len()
    }

    /// Whether the given RVA lands inside `SizeOfImage`.
    pub fn validate_rva(&self, rva: RVA) -> bool {
        let image_size = match self.optional_header().and_then(|header| header.size_of_image()) {
            Ok(size) => size,
            Err(_) => return false,
        };

        rva.0 < image_size
    }

    /// Whether the given VA lands between the image base and the end of the image.
    pub fn validate_va(&self, va: VA) -> bool {
        let image_size = match self.optional_header().and_then(|header| header.size_of_image()) {
            Ok(size) => size as u64,
            Err(_) => return false,
        };
        let image_base = match self.image_base() {
            Ok(base) => base,
            Err(_) => return false,
        };

        let start = image_base;
        let end = start.saturating_add(image_size);

        start <= va.value() && va.value() < end
    }

    /// Whether the offset honors the optional header's file alignment.
    pub fn is_aligned_to_file(&self, offset: Offset) -> bool {
        match self.optional_header().and_then(|header| header.file_alignment()) {
            Ok(alignment) => alignment != 0 && offset.0 % alignment == 0,
            Err(_) => false,
        }
    }

    /// Whether the RVA honors the optional header's section alignment.
    pub fn is_aligned_to_section(&self, rva: RVA) -> bool {
        match self
            .optional_header()
            .and_then(|header| header.section_alignment())
        {
            Ok(alignment) => alignment != 0 && rva.0 % alignment == 0,
            Err(_) => false,
        }
    }

    /// Round the offset up to the optional header's file alignment.
    pub fn align_to_file(&self, offset: Offset) -> Result<Offset, Error> {
        let alignment = self.optional_header()?.file_alignment()?;
        Ok(Offset(align(offset.0, alignment)))
    }

    /// Round the RVA up to the optional header's section alignment.
    pub fn align_to_section(&self, rva: RVA) -> Result<RVA, Error> {
        let alignment = self.optional_header()?.section_alignment()?;
        Ok(RVA(align(rva.0, alignment)))
    }

    /// Convert a file offset to an RVA.
    ///
    /// Offsets inside a section transpose through it; offsets outside every section
    /// (header data) pass through unchanged when the value is also a valid RVA.
    pub fn offset_to_rva(&self, offset: Offset) -> Result<RVA, Error> {
        if !self.validate_offset(offset) {
            return Err(Error::InvalidOffset(offset));
        }

        let table = self.section_table()?;

        let section = match table.section_by_offset(offset) {
            Ok(section) => section,
            Err(Error::SectionNotFound) => {
                let rva = RVA(offset.0);

                if !self.validate_rva(rva) {
                    return Err(Error::InvalidRVA(rva));
                }

                return Ok(rva);
            }
            Err(error) => return Err(error),
        };

        let rva = RVA(offset.0 - section.pointer_to_raw_data.0) + section.virtual_address.0;

        if !self.validate_rva(rva) || !section.has_rva(rva) {
            return Err(Error::InvalidRVA(rva));
        }

        Ok(rva)
    }

    /// Convert a file offset to a VA.
    pub fn offset_to_va(&self, offset: Offset) -> Result<VA, Error> {
        if !self.validate_offset(offset) {
            return Err(Error::InvalidOffset(offset));
        }

        self.rva_to_va(self.offset_to_rva(offset)?)
    }

    /// Convert an RVA to a file offset.
    ///
    /// RVAs inside a section transpose through it; RVAs outside every section pass
    /// through unchanged when the value is also a valid offset.
    pub fn rva_to_offset(&self, rva: RVA) -> Result<Offset, Error> {
        if !self.validate_rva(rva) {
            return Err(Error::InvalidRVA(rva));
        }

        let table = self.section_table()?;

        let section = match table.section_by_rva(rva) {
            Ok(section) => section,
            Err(Error::SectionNotFound) => {
                let offset = Offset(rva.0);

                if !self.validate_offset(offset) {
                    return Err(Error::InvalidOffset(offset));
                }

                return Ok(offset);
            }
            Err(error) => return Err(error),
        };

        let offset = Offset(rva.0 - section.virtual_address.0) + section.pointer_to_raw_data.0;

        if !self.validate_offset(offset) || !section.has_offset(offset) {
            return Err(Error::InvalidOffset(offset));
        }

        Ok(offset)
    }

    /// Convert an RVA to a VA of the image's architecture.
    pub fn rva_to_va(&self, rva: RVA) -> Result<VA, Error> {
        if !self.validate_rva(rva) {
            return Err(Error::InvalidRVA(rva));
        }

        let image_base = self.image_base()?;

        let va = match self.arch()? {
            Arch::I386 | Arch::Arm => {
                VA::VA32(crate::types::VA32(rva.0.wrapping_add(image_base as u32)))
            }
            Arch::Amd64 | Arch::Arm64 => {
                VA::VA64(crate::types::VA64((rva.0 as u64).wrapping_add(image_base)))
            }
        };

        if !self.validate_va(va) {
            return Err(Error::InvalidVA(va));
        }

        Ok(va)
    }

    /// Convert a VA back to an RVA.
    pub fn va_to_rva(&self, va: VA) -> Result<RVA, Error> {
        if !self.validate_va(va) {
            return Err(Error::InvalidVA(va));
        }

        let image_base = self.image_base()?;
        let rva = RVA(va.value().wrapping_sub(image_base) as u32);

        if !self.validate_rva(rva) {
            return Err(Error::InvalidRVA(rva));
        }

        Ok(rva)
    }

    /// Convert a VA to a file offset.
    pub fn va_to_offset(&self, va: VA) -> Result<Offset, Error> {
        self.rva_to_offset(self.va_to_rva(va)?)
    }

    /// Translate any address into an index into the backing bytes: an offset for disk
    /// images, an RVA for memory and virtual images.
    pub fn memory_address<A: Address>(&self, address: A) -> Result<usize, Error> {
        address.as_memory(self)
    }

    /// The byte size of everything before the first section's data: headers, data
    /// directory and section table.
    pub fn calculate_header_size(&self) -> Result<usize, Error> {
        let table_offset = self.section_table_offset()?.0 as usize;
        let sections = self.valid_nt_headers()?.file_header()?.number_of_sections()?;

        Ok(table_offset + sections as usize * mem::size_of::<ImageSectionHeader>())
    }

    /// The size of the image in disk layout. Appended overlay data is not counted.
    pub fn calculate_disk_size(&self) -> Result<usize, Error> {
        let mut disk_size = self.calculate_header_size()?;
        let table = self.section_table()?;

        for index in 0..table.len() {
            let section = table.get(index)?;
            let end = section.pointer_to_raw_data.0 as usize + section.size_of_raw_data as usize;

            disk_size = cmp::max(disk_size, end);
        }

        Ok(disk_size)
    }

    /// The size of the image in memory layout, rounded to the section alignment.
    pub fn calculate_memory_size(&self) -> Result<usize, Error> {
        let mut memory_size = self.calculate_header_size()?;
        let table = self.section_table()?;

        for index in 0..table.len() {
            let section = table.get(index)?;
            let end = section.virtual_address.0 as usize + section.virtual_size as usize;

            memory_size = cmp::max(memory_size, end);
        }

        let alignment = self.optional_header()?.section_alignment()? as usize;

        if alignment != 0 && memory_size % alignment != 0 {
            memory_size += alignment - (memory_size % alignment);
        }

        Ok(memory_size)
    }

    /// Recompute the memory size and store it as the header's `SizeOfImage`.
    pub fn fix_image_size(&mut self) -> Result<(), Error> {
        let memory_size = self.calculate_memory_size()?;
        self.optional_header()?.set_size_of_image(memory_size as u32)
    }

    /// Pad the image with zeroes up to the file alignment boundary.
    pub fn pad_to_file_alignment(&mut self) -> Result<(), Error> {
        let current = Offset(self.len() as u32);
        let aligned = self.align_to_file(current)?;
        let padding = (aligned.0 - current.0) as usize;

        if padding != 0 {
            self.append(&vec![0u8; padding])?;
        }

        Ok(())
    }

    /// Pad the image with zeroes up to the section alignment boundary.
    pub fn pad_to_section_alignment(&mut self) -> Result<(), Error> {
        let current = RVA(self.len() as u32);
        let aligned = self.align_to_section(current)?;
        let padding = (aligned.0 - current.0) as usize;

        if padding != 0 {
            self.append(&vec![0u8; padding])?;
        }

        Ok(())
    }

    /// Pad to whichever alignment matches the image type.
    pub fn pad_to_alignment(&mut self) -> Result<(), Error> {
        match self.image_type {
            ImageType::Disk => self.pad_to_file_alignment(),
            ImageType::Memory | ImageType::Virtual => self.pad_to_section_alignment(),
        }
    }

    /// Calculate the PE checksum of the image.
    ///
    /// The 32-bit folded sum over the whole file, with the `CheckSum` field itself
    /// treated as zero and the file length added at the end.
    pub fn calculate_checksum(&self) -> Result<u32, Error> {
        // make sure the headers parse before trusting the field offset below
        self.valid_nt_headers()?;

        let e_lfanew = self.e_lfanew()?.0 as usize;
        // CheckSum sits 0x40 bytes into the optional header on both widths
        let checksum_offset =
            e_lfanew + mem::size_of::<u32>() + mem::size_of::<ImageFileHeader>() + 0x40;

        let eof = self.len();
        let mut checksum = 0u64;

        for offset in (0..eof).step_by(4) {
            if offset == checksum_offset {
                continue;
            }

            let data = if eof - offset >= 4 {
                self.buffer.read(offset, 4)?
            } else {
                let mut padded = self.buffer.read(offset, eof - offset)?;
                padded.resize(4, 0);
                padded
            };

            let value = data.as_slice().read_u32::<LittleEndian>().unwrap() as u64;

            checksum = (checksum & 0xFFFFFFFF) + value + (checksum >> 32);

            if checksum > u32::MAX as u64 {
                checksum = (checksum & 0xFFFFFFFF) + (checksum >> 32);
            }
        }

        checksum = (checksum & 0xFFFF) + (checksum >> 16);
        checksum += checksum >> 16;
        checksum &= 0xFFFF;
        checksum += eof as u64;

        Ok((checksum & 0xFFFFFFFF) as u32)
    }

    /// Compare the calculated checksum with the optional header's `CheckSum` field.
    pub fn validate_checksum(&self) -> Result<bool, Error> {
        let stored = self.optional_header()?.checksum()?;
        Ok(self.calculate_checksum()? == stored)
    }

    /// Carve a view of the NUL-terminated C string at the given backing-byte index.
    ///
    /// The view includes the terminator. A string running off the end of the image is
    /// truncated there.
    pub fn cstring_at(&self, offset: usize) -> Result<Buffer<CChar>, Error> {
        let mut end = offset;

        while end < self.len() && self.buffer.get(end)? != 0 {
            end += 1;
        }

        let size = if end < self.len() {
            end - offset + 1
        } else {
            end - offset
        };

        self.buffer.subregion::<CChar>(offset, size)
    }

    /// Carve a view of the NUL-terminated UTF-16 string at the given backing-byte
    /// index. The view includes the terminator.
    pub fn wstring_at(&self, offset: usize) -> Result<Buffer<WChar>, Error> {
        let mut end = offset;

        while end + 2 <= self.len() && self.buffer.get_typed::<u16>(end)? != 0 {
            end += 2;
        }

        let size = if end + 2 <= self.len() {
            end + 2 - offset
        } else {
            end - offset
        };

        self.buffer.subregion_bytes::<WChar>(offset, size)
    }
}
