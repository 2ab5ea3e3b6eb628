//! Integration tests over synthesized images.
//!
//! Rather than shipping binary fixtures, these tests build minimal PE images in
//! memory with the library's own synthesis support (default headers plus hand-placed
//! sections) and then parse them back.

use crate::directories::{ExportDirectory, ExportThunkData};
use crate::headers::{
    ImageDataDirectory, ImageExportDirectory, ImageSectionHeader, SectionCharacteristics,
    HDR32_MAGIC,
};
use crate::pe::Pe;
use crate::types::{Address, Arch, ImageType, Offset, RVA, VA, VA32, VA64};
use crate::Error;

const TEXT_OFFSET: u32 = 0x400;
const TEXT_RVA: u32 = 0x1000;
const DATA_OFFSET: u32 = 0x800;
const DATA_RVA: u32 = 0x3000;
const SECTION_SIZE: u32 = 0x400;

const MARKER: &[u8] = b" * a 'compiled' PE\n";

fn section(name: &str, offset: u32, rva: u32) -> ImageSectionHeader {
    let mut header = ImageSectionHeader::default();

    header.set_name(Some(name));
    header.pointer_to_raw_data = Offset(offset);
    header.size_of_raw_data = SECTION_SIZE;
    header.virtual_address = RVA(rva);
    header.virtual_size = SECTION_SIZE;
    header.characteristics = SectionCharacteristics::MEM_READ | SectionCharacteristics::MEM_WRITE;

    header
}

/// A minimal two-section 32-bit disk image.
fn compiled_pe() -> Pe {
    let mut pe = Pe::new(ImageType::Disk, 0xC00).unwrap();

    pe.dos_header().unwrap().set_defaults().unwrap();
    pe.nt_headers_32().unwrap().set_defaults().unwrap();

    pe.add_section(&section(".text", TEXT_OFFSET, TEXT_RVA)).unwrap();
    pe.add_section(&section(".data", DATA_OFFSET, DATA_RVA)).unwrap();

    pe.fix_image_size().unwrap();
    pe.write(DATA_OFFSET as usize, MARKER).unwrap();

    pe
}

/// A minimal one-section 64-bit disk image.
fn compiled_pe_64() -> Pe {
    let mut pe = Pe::new(ImageType::Disk, 0x1000).unwrap();

    pe.dos_header().unwrap().set_defaults().unwrap();
    pe.nt_headers_64().unwrap().set_defaults().unwrap();

    pe.add_section(&section(".text", TEXT_OFFSET, TEXT_RVA)).unwrap();
    pe.fix_image_size().unwrap();

    pe
}

/// Extend the 32-bit image with an export directory in `.data` naming one function.
fn dll_pe() -> Pe {
    let mut pe = compiled_pe();

    let directory = ImageExportDirectory {
        characteristics: 0,
        time_date_stamp: 0,
        major_version: 0,
        minor_version: 0,
        name: RVA(DATA_RVA + 0x50),
        base: 1,
        number_of_functions: 1,
        number_of_names: 1,
        address_of_functions: RVA(DATA_RVA + 0x28),
        address_of_names: RVA(DATA_RVA + 0x2C),
        address_of_name_ordinals: RVA(DATA_RVA + 0x30),
    };

    let base = DATA_OFFSET as usize;
    pe.write(base, &[0u8; 0x60]).unwrap();
    pe.write_typed(base, directory).unwrap();
    pe.write_typed::<u32>(base + 0x28, 0x1024).unwrap();
    pe.write_typed::<u32>(base + 0x2C, DATA_RVA + 0x40).unwrap();
    pe.write_typed::<u16>(base + 0x30, 0).unwrap();
    pe.write(base + 0x40, b"export\0").unwrap();
    pe.write(base + 0x50, b"dll.dll\0").unwrap();

    let mut data_directory = pe.data_directory().unwrap();
    data_directory
        .set_entry(
            0,
            &ImageDataDirectory {
                virtual_address: RVA(DATA_RVA),
                size: 0x58,
            },
        )
        .unwrap();

    pe
}

#[test]
fn test_validation() {
    let pe = compiled_pe();

    assert!(pe.dos_header().unwrap().is_valid());
    assert!(pe.dos_header().unwrap().validate().is_ok());

    assert!(pe.nt_headers_32().unwrap().is_valid());
    assert!(!pe.nt_headers_64().unwrap().is_valid());
    assert!(matches!(
        pe.nt_headers_64().unwrap().validate(),
        Err(Error::UnexpectedOptionalMagic {
            got: HDR32_MAGIC,
            ..
        })
    ));

    let headers = pe.valid_nt_headers().unwrap();
    assert!(headers.is_32());
    assert!(headers.is_valid());

    assert_eq!(pe.nt_magic().unwrap(), HDR32_MAGIC);
    assert_eq!(pe.arch().unwrap(), Arch::I386);
}

#[test]
fn test_invalid_signatures() {
    let mut pe = compiled_pe();

    pe.write_typed::<u16>(0, 0x4142).unwrap();
    assert!(!pe.dos_header().unwrap().is_valid());
    assert!(matches!(
        pe.dos_header().unwrap().validate(),
        Err(Error::InvalidDOSSignature(0x4142))
    ));
    assert!(matches!(pe.e_lfanew(), Err(Error::InvalidDOSSignature(_))));

    let mut pe = compiled_pe();
    let e_lfanew = pe.e_lfanew().unwrap().0 as usize;

    pe.write_typed::<u32>(e_lfanew, 0xDEAD).unwrap();
    assert!(matches!(
        pe.valid_nt_headers(),
        Err(Error::InvalidNTSignature(0xDEAD))
    ));
}

#[test]
fn test_dos_stub() {
    let pe = compiled_pe();
    let stub = pe.dos_stub().unwrap();

    // default e_lfanew is 0xE0, the DOS header is 0x40 bytes
    assert_eq!(stub.byte_len(), 0xA0);
}

#[test]
fn test_section_table() {
    let pe = compiled_pe();
    let table = pe.section_table().unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table.get(0).unwrap().name_string(), ".text");
    assert_eq!(table.get(1).unwrap().name_string(), ".data");

    let data = table.section_by_name(".data").unwrap();
    let rva = data.virtual_address;
    assert_eq!(rva, RVA(DATA_RVA));

    assert!(matches!(
        table.section_by_name(".missing"),
        Err(Error::SectionNotFound)
    ));
    // name lookups compare the trimmed 8-byte field exactly
    assert!(matches!(
        table.section_by_name(".tex"),
        Err(Error::SectionNotFound)
    ));
}

#[test]
fn test_section_lookup_is_exclusive() {
    let pe = compiled_pe();
    let table = pe.section_table().unwrap();

    let probe = Offset(DATA_OFFSET + 0x10);
    let found = table.section_by_offset(probe).unwrap();
    assert!(found.has_offset(probe));
    assert_eq!(found.name_string(), ".data");

    let mut holders = 0;
    for index in 0..table.len() {
        if table.get(index).unwrap().has_offset(probe) {
            holders += 1;
        }
    }
    assert_eq!(holders, 1);

    assert!(matches!(
        table.section_by_offset(Offset(0x100)),
        Err(Error::SectionNotFound)
    ));
}

#[test]
fn test_section_data() {
    let pe = compiled_pe();
    let table = pe.section_table().unwrap();

    let data = table.section_by_name(".data").unwrap();
    assert_eq!(data.section_size(&pe), SECTION_SIZE as usize);

    let view = data.section_data(&pe).unwrap();
    assert_eq!(view.byte_len(), SECTION_SIZE as usize);
    assert_eq!(view.read(0, MARKER.len()).unwrap(), MARKER.to_vec());
}

#[test]
fn test_offset_rva_roundtrip() {
    let pe = compiled_pe();

    // inside a section, conversion transposes through it
    let offset = Offset(TEXT_OFFSET + 0x50);
    let rva = offset.as_rva(&pe).unwrap();
    assert_eq!(rva, RVA(TEXT_RVA + 0x50));
    assert_eq!(rva.as_offset(&pe).unwrap(), offset);

    // header addresses pass through unchanged
    assert_eq!(Offset(0x100).as_rva(&pe).unwrap(), RVA(0x100));
    assert_eq!(RVA(0x100).as_offset(&pe).unwrap(), Offset(0x100));
}

#[test]
fn test_marker_resolves_through_data_section() {
    let pe = compiled_pe();

    let offset = RVA(DATA_RVA).as_offset(&pe).unwrap();
    assert_eq!(offset, Offset(DATA_OFFSET));
    assert_eq!(
        pe.read(offset.0 as usize, MARKER.len()).unwrap(),
        MARKER.to_vec()
    );

    // image size is 0x4000 here, anything past it is no RVA at all
    assert!(matches!(
        RVA(0x4000).as_offset(&pe),
        Err(Error::InvalidRVA(RVA(0x4000)))
    ));
    assert!(matches!(
        pe.offset_to_rva(Offset(0x4000)),
        Err(Error::InvalidOffset(Offset(0x4000)))
    ));
}

#[test]
fn test_va_conversions() {
    let pe = compiled_pe();

    assert_eq!(pe.image_base().unwrap(), 0x400000);

    let va = RVA(TEXT_RVA).as_va(&pe).unwrap();
    assert_eq!(va, VA::VA32(VA32(0x401000)));
    assert_eq!(va.as_rva(&pe).unwrap(), RVA(TEXT_RVA));
    assert_eq!(
        VA32(0x401010).as_offset(&pe).unwrap(),
        Offset(TEXT_OFFSET + 0x10)
    );

    assert!(!pe.validate_va(VA::VA32(VA32(0x3FFFFF))));
    assert!(matches!(
        pe.va_to_rva(VA::VA32(VA32(0x500000))),
        Err(Error::InvalidVA(_))
    ));
}

#[test]
fn test_va_conversions_64() {
    let pe = compiled_pe_64();

    assert_eq!(pe.arch().unwrap(), Arch::Amd64);
    assert_eq!(pe.image_base().unwrap(), 0x140000000);

    let headers = pe.valid_nt_headers().unwrap();
    assert!(headers.is_64());
    assert!(!pe.nt_headers_32().unwrap().is_valid());

    let va = RVA(TEXT_RVA).as_va(&pe).unwrap();
    assert_eq!(va, VA::VA64(VA64(0x140001000)));
    assert_eq!(va.as_rva(&pe).unwrap(), RVA(TEXT_RVA));
    assert_eq!(pe.entrypoint().unwrap(), RVA(0x1000));
}

#[test]
fn test_unsupported_architecture() {
    let pe = compiled_pe();
    let mut file_header = pe.valid_nt_headers().unwrap().file_header().unwrap();
    let mut raw = file_header.read().unwrap();

    raw.machine = 0x1234;
    file_header.write(&raw).unwrap();

    assert!(matches!(pe.arch(), Err(Error::UnsupportedArchitecture)));
    assert!(matches!(
        pe.rva_to_va(RVA(TEXT_RVA)),
        Err(Error::UnsupportedArchitecture)
    ));
}

#[test]
fn test_alignment_helpers() {
    let pe = compiled_pe();

    assert!(pe.is_aligned_to_file(Offset(0x400)));
    assert!(!pe.is_aligned_to_file(Offset(0x450)));
    assert!(pe.is_aligned_to_section(RVA(0x2000)));
    assert!(!pe.is_aligned_to_section(RVA(0x2100)));

    assert_eq!(pe.align_to_file(Offset(0x401)).unwrap(), Offset(0x800));
    assert_eq!(pe.align_to_section(RVA(0x1001)).unwrap(), RVA(0x2000));
}

#[test]
fn test_checksum_roundtrip() {
    let pe = compiled_pe();

    let checksum = pe.calculate_checksum().unwrap();
    assert_ne!(checksum, 0);
    assert!(!pe.validate_checksum().unwrap());

    pe.optional_header()
        .unwrap()
        .set_checksum(checksum)
        .unwrap();

    // the field itself is skipped by the sum, so the stored value now matches
    assert_eq!(pe.calculate_checksum().unwrap(), checksum);
    assert!(pe.validate_checksum().unwrap());
}

#[test]
fn test_section_table_overflow() {
    let mut pe = compiled_pe();
    let mut file_header = pe.valid_nt_headers().unwrap().file_header().unwrap();
    let mut raw = file_header.read().unwrap();

    raw.number_of_sections = 0xFFFF;
    file_header.write(&raw).unwrap();

    assert!(matches!(
        pe.add_section(&section(".late", 0, 0)),
        Err(Error::SectionTableOverflow)
    ));
}

#[test]
fn test_data_directory_clamps_to_sixteen() {
    let pe = compiled_pe();

    let mut optional = match pe.valid_nt_headers().unwrap() {
        crate::headers::NTHeaders::NTHeaders32(headers) => headers.optional_header().unwrap(),
        crate::headers::NTHeaders::NTHeaders64(_) => unreachable!(),
    };

    let mut raw = optional.read().unwrap();
    raw.number_of_rva_and_sizes = 32;
    optional.write(&raw).unwrap();

    assert_eq!(pe.data_directory().unwrap().len(), 16);
}

#[test]
fn test_export_directory() {
    let pe = dll_pe();
    let data_directory = pe.data_directory().unwrap();

    assert!(data_directory.has_directory(&pe, 0));
    assert!(!data_directory.has_directory(&pe, 1));

    let exports = data_directory.directory::<ExportDirectory>(&pe).unwrap();
    assert!(exports.is_32());
    assert_eq!(exports.name_string(&pe).unwrap(), "dll.dll");

    let map = exports.export_map(&pe).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map["export"], ExportThunkData::Function(RVA(0x1024)));
}

#[test]
fn test_export_forwarder() {
    let mut pe = dll_pe();

    // repoint the one thunk back into the directory's own range
    pe.write_typed::<u32>(DATA_OFFSET as usize + 0x28, DATA_RVA + 0x40)
        .unwrap();

    let exports = pe
        .data_directory()
        .unwrap()
        .directory::<ExportDirectory>(&pe)
        .unwrap();
    let map = exports.export_map(&pe).unwrap();

    assert_eq!(
        map["export"],
        ExportThunkData::ForwarderString(RVA(DATA_RVA + 0x40))
    );
}

#[test]
fn test_missing_directory() {
    let pe = compiled_pe();

    assert!(matches!(
        pe.data_directory()
            .unwrap()
            .directory::<ExportDirectory>(&pe),
        Err(Error::DirectoryUnavailable(0))
    ));
}

#[test]
fn test_save_and_reload() {
    let pe = dll_pe();
    let file = tempfile::NamedTempFile::new().unwrap();

    pe.save(file.path()).unwrap();

    let reloaded = Pe::from_disk_file(file.path()).unwrap();
    assert_eq!(reloaded.as_bytes().unwrap(), pe.as_bytes().unwrap());

    let exports = reloaded
        .data_directory()
        .unwrap()
        .directory::<ExportDirectory>(&reloaded)
        .unwrap();
    assert_eq!(exports.name_string(&reloaded).unwrap(), "dll.dll");
}

#[test]
fn test_memory_image() {
    let disk = compiled_pe();

    // lay the image out the way the loader would
    let mut memory_image = vec![0u8; 0x4000];
    let bytes = disk.as_bytes().unwrap();
    memory_image[..TEXT_OFFSET as usize].copy_from_slice(&bytes[..TEXT_OFFSET as usize]);
    memory_image[TEXT_RVA as usize..TEXT_RVA as usize + SECTION_SIZE as usize]
        .copy_from_slice(&bytes[TEXT_OFFSET as usize..DATA_OFFSET as usize]);
    memory_image[DATA_RVA as usize..DATA_RVA as usize + SECTION_SIZE as usize]
        .copy_from_slice(&bytes[DATA_OFFSET as usize..0xC00]);

    let pe = Pe::from_data(ImageType::Memory, &memory_image).unwrap();

    // RVAs are the native coordinate of a memory image
    assert_eq!(pe.memory_address(RVA(DATA_RVA)).unwrap(), DATA_RVA as usize);
    assert_eq!(
        pe.memory_address(Offset(DATA_OFFSET)).unwrap(),
        DATA_RVA as usize
    );

    assert_eq!(
        pe.read(DATA_RVA as usize, MARKER.len()).unwrap(),
        MARKER.to_vec()
    );

    let table = pe.section_table().unwrap();
    let data = table.section_by_name(".data").unwrap();
    let view = data.section_data(&pe).unwrap();
    assert_eq!(view.read(0, MARKER.len()).unwrap(), MARKER.to_vec());
}

#[test]
fn test_append_section() {
    let mut pe = compiled_pe();

    let appended = pe.append_section(&section(".extra", 0, 0)).unwrap();
    let raw_pointer = appended.pointer_to_raw_data;
    let virtual_address = appended.virtual_address;

    // placed after .data, on the image's alignment boundaries
    assert_eq!(raw_pointer, Offset(0xC00));
    assert_eq!(virtual_address, RVA(0x4000));

    let table = pe.section_table().unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(2).unwrap().name_string(), ".extra");
}

#[test]
fn test_calculated_sizes() {
    let pe = compiled_pe();

    // section table ends at 0x1D8 + 2 * 0x28
    assert_eq!(pe.calculate_header_size().unwrap(), 0x228);
    assert_eq!(pe.calculate_disk_size().unwrap(), 0xC00);
    assert_eq!(pe.calculate_memory_size().unwrap(), 0x4000);

    let size = pe.optional_header().unwrap().size_of_image().unwrap();
    assert_eq!(size, 0x4000);
}

#[test]
fn test_strings() {
    let mut pe = compiled_pe();

    pe.write(TEXT_OFFSET as usize, b"shout\0").unwrap();
    let narrow = pe.cstring_at(TEXT_OFFSET as usize).unwrap();
    assert_eq!(narrow.byte_len(), 6);
    assert_eq!(
        {
            use crate::types::CCharString;
            narrow.to_vec().unwrap().as_str().into_owned()
        },
        "shout"
    );

    let wide: Vec<u8> = "wide\0"
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    pe.write(TEXT_OFFSET as usize + 0x20, &wide).unwrap();

    let wstring = pe.wstring_at(TEXT_OFFSET as usize + 0x20).unwrap();
    assert_eq!(wstring.byte_len(), 10);
    assert_eq!(
        {
            use crate::types::WCharString;
            wstring.to_vec().unwrap().as_u16_str().to_string_lossy()
        },
        "wide"
    );
}

#[test]
fn test_entrypoint_and_machine() {
    let pe = compiled_pe();

    assert_eq!(pe.entrypoint().unwrap(), RVA(0x1000));
    assert_eq!(pe.machine().unwrap(), 0x014C);
    assert_eq!(pe.section_table_offset().unwrap(), Offset(0x1D8));
}
