//! Firmware File System (FFS) file parsing and composition.
//!
//! Files carry a name GUID, a type, attributes and a 24-bit size, or a 64-bit size when the large-file
//! attribute is set. The header checksum is always verified; the data checksum only when the file
//! declares one. Only firmware volume image files are decomposed into sections, every other file type
//! keeps its body as opaque bytes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, vec::Vec};
use r_efi::efi;

use crate::{
    config::{ExportFlags, Limits, ParseContext},
    error::{FirmwareError, Result, ResultExt},
    export::NodeExport,
    guid,
    node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode},
    section::{Section, parse_sections},
    structs::{U24, binary_struct, raw_enum},
};

/// Files start on 8-byte boundaries within their filesystem.
pub const FILE_ALIGNMENT: u8 = 3;

/// Data checksum stored when the file does not carry one.
pub const DATA_CHECKSUM_NONE: u8 = 0xAA;

/// EFI_FILE_DATA_VALID with an erase polarity of 1.
pub const STATE_DATA_VALID: u8 = 0xF8;

/// EFI_FFS_FILE_ATTRIBUTES bits.
pub mod attributes {
    pub const LARGE_FILE: u8 = 0x01;
    pub const DATA_ALIGNMENT_2: u8 = 0x02;
    pub const FIXED: u8 = 0x04;
    pub const DATA_ALIGNMENT: u8 = 0x38;
    pub const CHECKSUM: u8 = 0x40;
}

const HEADER_CHECKSUM_OFFSET: usize = 0x10;
const DATA_CHECKSUM_OFFSET: usize = 0x11;
const STATE_OFFSET: usize = 0x17;

// Alignment exponents indexed by the DATA_ALIGNMENT attribute field.
const DATA_ALIGNMENT_EXPONENTS: [u8; 8] = [0, 4, 7, 9, 10, 12, 15, 16];
const DATA_ALIGNMENT_2_BASE: u8 = 17;

binary_struct! {
    /// EFI_FFS_FILE_HEADER
    pub struct FileHeader: LE {
        name: efi::Guid,
        header_checksum: u8,
        data_checksum: u8,
        file_type: u8,
        attributes: u8,
        size: U24,
        state: u8 = default(STATE_DATA_VALID),
    }
}

binary_struct! {
    /// EFI_FFS_FILE_HEADER2
    pub struct FileHeader2: LE {
        name: efi::Guid,
        header_checksum: u8,
        data_checksum: u8,
        file_type: u8,
        attributes: u8,
        size: U24,
        state: u8 = default(STATE_DATA_VALID),
        extended_size: u64,
    }
}

raw_enum! {
    /// EFI_FV_FILETYPE
    pub enum FileType {
        Raw = 0x01,
        Freeform = 0x02,
        SecurityCore = 0x03,
        PeiCore = 0x04,
        DxeCore = 0x05,
        Peim = 0x06,
        Driver = 0x07,
        CombinedPeimDriver = 0x08,
        Application = 0x09,
        Mm = 0x0A,
        FirmwareVolumeImage = 0x0B,
        CombinedMmDxe = 0x0C,
        MmCore = 0x0D,
        MmStandalone = 0x0E,
        MmCoreStandalone = 0x0F,
        Pad = 0xF0,
    }
}

/// 8-bit checksum over a file header, skipping the two checksum bytes and the state byte.
fn header_checksum(header: &[u8]) -> u8 {
    let sum = header
        .iter()
        .enumerate()
        .filter(|(idx, _)| ![HEADER_CHECKSUM_OFFSET, DATA_CHECKSUM_OFFSET, STATE_OFFSET].contains(idx))
        .fold(0u8, |sum, (_, val)| sum.wrapping_add(*val));
    0u8.wrapping_sub(sum)
}

/// 8-bit checksum making the body plus the checksum byte sum to zero.
fn data_checksum(body: &[u8]) -> u8 {
    0u8.wrapping_sub(body.iter().fold(0u8, |sum, val| sum.wrapping_add(*val)))
}

/// A single FFS file.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    node: FirmwareNode,
    file_type: FileType,
    attributes: u8,
}

impl File {
    /// Creates an empty file.
    pub fn new(name: efi::Guid, file_type: FileType) -> Self {
        let node =
            FirmwareNode { id: Some(guid::to_string(&name)), alignment: FILE_ALIGNMENT, ..FirmwareNode::default() };
        Self { node, file_type, attributes: 0 }
    }

    /// The name GUID, parsed from the node id.
    pub fn name(&self) -> Result<efi::Guid> {
        let id = self.node.id.as_deref().ok_or_else(|| FirmwareError::invalid_data("FFS file has no name"))?;
        guid::from_str(id).context("FFS file name")
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    pub fn set_attributes(&mut self, attributes: u8) {
        self.attributes = attributes;
    }

    /// Appends a section, switching the file to holding sections.
    pub fn add_section(&mut self, section: Section) -> Result<()> {
        self.node.add_child(section.into_firmware())
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.node.children().iter().filter_map(Firmware::as_section)
    }

    /// Required alignment of the file data as a power-of-two exponent.
    pub fn data_alignment(&self) -> u8 {
        let idx = ((self.attributes & attributes::DATA_ALIGNMENT) >> 3) as usize;
        if self.attributes & attributes::DATA_ALIGNMENT_2 != 0 {
            DATA_ALIGNMENT_2_BASE + idx as u8
        } else {
            DATA_ALIGNMENT_EXPONENTS[idx]
        }
    }
}

impl FirmwareCodec for File {
    const KIND: FirmwareKind = FirmwareKind::File;

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        match FileHeader::parse(buf, offset) {
            Ok(header) => {
                let header_len = FileHeader::SIZE;
                header.header_checksum == header_checksum(&buf[offset..offset + header_len])
            }
            Err(_) => false,
        }
    }

    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let header = FileHeader::parse(buf, offset)?;
        let (size, header_len) = if header.attributes & attributes::LARGE_FILE != 0 {
            let header = FileHeader2::parse(buf, offset)?;
            let size = usize::try_from(header.extended_size).map_err(|_| {
                FirmwareError::invalid_data(format!("FFS length 0x{:x} is too large", header.extended_size))
            })?;
            (size, FileHeader2::SIZE)
        } else {
            (header.size.0 as usize, FileHeader::SIZE)
        };
        if size < header_len {
            Err(FirmwareError::internal(format!("invalid FFS length, got 0x{size:x}")))?;
        }
        if size > ctx.limits.file_size_max {
            Err(FirmwareError::invalid_file(format!(
                "FFS length 0x{size:x} is larger than max size 0x{:x}",
                ctx.limits.file_size_max
            )))?;
        }
        let remaining = buf.len() - offset;
        if size > remaining {
            Err(FirmwareError::invalid_data(format!("FFS length 0x{size:x} exceeds remaining 0x{remaining:x}")))?;
        }
        let data = &buf[offset..offset + size];

        if !ctx.ignore_checksum() {
            let expected = header_checksum(&data[..header_len]);
            if header.header_checksum != expected {
                Err(FirmwareError::invalid_file(format!(
                    "header checksum invalid, got 0x{:02x}, expected 0x{expected:02x}",
                    header.header_checksum
                )))?;
            }
        }
        if header.state != STATE_DATA_VALID {
            log::debug!("FFS file at 0x{offset:x} has state 0x{:02x}", header.state);
        }

        let mut file = File::new(header.name, FileType::from(header.file_type));
        file.attributes = header.attributes;
        file.node.offset = offset;
        file.node.size = size;
        file.node.set_size_max(ctx.limits.file_size_max);

        let body = &data[header_len..];
        if file.file_type == FileType::FirmwareVolumeImage {
            parse_sections(body, &ctx.nested()?, &mut file.node).context("failed to parse sections")?;
        } else {
            file.node.set_bytes(body.to_vec());
        }

        if !ctx.ignore_checksum() && header.attributes & attributes::CHECKSUM != 0 {
            let expected = data_checksum(body);
            if header.data_checksum != expected {
                Err(FirmwareError::invalid_file(format!(
                    "data checksum invalid, got 0x{:02x}, expected 0x{expected:02x}",
                    header.data_checksum
                )))?;
            }
        }
        log::debug!(
            "FFS file {} type {:?} at 0x{offset:x}, size 0x{size:x}",
            guid::to_string(&header.name),
            file.file_type
        );
        Ok(file)
    }

    fn write(&self) -> Result<Vec<u8>> {
        let name = self.name()?;
        let body = self.node.write_payload(0x00)?;

        let mut attributes = self.attributes;
        if FileHeader::SIZE + body.len() > U24::MAX as usize {
            attributes |= attributes::LARGE_FILE;
        }
        let large = attributes & attributes::LARGE_FILE != 0;
        let header_len = if large { FileHeader2::SIZE } else { FileHeader::SIZE };
        let total = header_len + body.len();
        let file_size_max = self.node.size_max().unwrap_or(Limits::default().file_size_max);
        if total > file_size_max {
            Err(FirmwareError::invalid_file(format!(
                "FFS length 0x{total:x} is larger than max size 0x{file_size_max:x}"
            )))?;
        }

        let data_checksum =
            if attributes & attributes::CHECKSUM != 0 { data_checksum(&body) } else { DATA_CHECKSUM_NONE };
        let file_type = u8::from(self.file_type);
        let mut buf = if large {
            FileHeader2 {
                name,
                header_checksum: 0,
                data_checksum,
                file_type,
                attributes,
                size: U24(0),
                state: STATE_DATA_VALID,
                extended_size: total as u64,
            }
            .to_bytes()?
        } else {
            FileHeader {
                name,
                header_checksum: 0,
                data_checksum,
                file_type,
                attributes,
                size: U24(total as u32),
                state: STATE_DATA_VALID,
            }
            .to_bytes()?
        };
        buf[HEADER_CHECKSUM_OFFSET] = header_checksum(&buf);
        buf.extend(body);
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        let mut tree = self.node.export(Self::KIND, flags);
        tree.set_field("type", u8::from(self.file_type) as u64);
        if self.attributes != 0 {
            tree.set_field("attributes", self.attributes as u64);
        }
        let data_alignment = self.data_alignment();
        if data_alignment != 0 {
            tree.set_field("data_alignment", data_alignment as u64);
        }
        if flags.contains(ExportFlags::INCLUDE_DEBUG)
            && let Some(name) = self.file_type.name()
        {
            tree.set_label("type_name", name);
        }
        tree
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        let mut node = FirmwareNode::build(tree)?;
        if tree.alignment.is_none() {
            node.alignment = FILE_ALIGNMENT;
        }
        let file_type =
            tree.field("type").map(|hex| hex.to_u8("type")).transpose()?.map_or(FileType::Raw, FileType::from);
        let attributes = tree.field("attributes").map_or(Ok(0), |hex| hex.to_u8("attributes"))?;
        let file = Self { node, file_type, attributes };
        file.name()?;
        Ok(file)
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> Firmware {
        Firmware::File(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ParseFlags, error::ErrorKind, section::SectionType};
    use alloc::vec;
    use std::error::Error;

    const NAME: efi::Guid =
        efi::Guid::from_fields(0x1BA0062E, 0xC779, 0x4582, 0x85, 0x66, &[0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09]);

    fn raw_file(data: &[u8]) -> File {
        let mut file = File::new(NAME, FileType::Raw);
        file.node_mut().set_bytes(data.to_vec());
        file
    }

    #[test]
    fn raw_file_round_trip() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = raw_file(b"hello").write()?;
        assert_eq!(bytes.len(), 0x18 + 5);
        assert_eq!(bytes[DATA_CHECKSUM_OFFSET], DATA_CHECKSUM_NONE);
        assert_eq!(bytes[STATE_OFFSET], STATE_DATA_VALID);
        assert!(File::check_magic(&bytes, 0));

        let file = File::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(file.name()?, NAME);
        assert_eq!(file.file_type(), FileType::Raw);
        assert_eq!(file.node().size, bytes.len());
        assert_eq!(file.node().bytes(), Some(&b"hello"[..]));
        assert_eq!(file.write()?, bytes);
        Ok(())
    }

    #[test]
    fn length_smaller_than_header_is_internal() -> core::result::Result<(), Box<dyn Error>> {
        let mut bytes = raw_file(&[0; 8]).write()?;
        bytes[0x14] = 0x10;
        bytes[HEADER_CHECKSUM_OFFSET] = header_checksum(&bytes[..0x18]);
        let err = File::parse_at(&bytes, 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().starts_with("invalid FFS length"));
        Ok(())
    }

    #[test]
    fn length_beyond_buffer_is_invalid_data() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = raw_file(&[0; 8]).write()?;
        let err = File::parse_at(&bytes[..bytes.len() - 1], 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        Ok(())
    }

    #[test]
    fn header_checksum_is_verified() -> core::result::Result<(), Box<dyn Error>> {
        let mut bytes = raw_file(&[1, 2, 3]).write()?;
        bytes[HEADER_CHECKSUM_OFFSET] ^= 0x01;
        let err = File::parse_at(&bytes, 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(!File::check_magic(&bytes, 0));

        let ctx = ParseContext::default().with_flags(ParseFlags::IGNORE_CHECKSUM);
        assert!(File::parse_at(&bytes, 0, &ctx).is_ok());

        // state is outside the checksum
        let mut bytes = raw_file(&[1, 2, 3]).write()?;
        bytes[STATE_OFFSET] = 0xF0;
        assert!(File::parse_at(&bytes, 0, &ParseContext::default()).is_ok());
        Ok(())
    }

    #[test]
    fn data_checksum_is_verified_when_declared() -> core::result::Result<(), Box<dyn Error>> {
        let mut file = raw_file(&[0x10, 0x20, 0x30]);
        file.set_attributes(attributes::CHECKSUM);
        let mut bytes = file.write()?;
        assert_eq!(bytes[DATA_CHECKSUM_OFFSET], 0xA0);
        assert!(File::parse_at(&bytes, 0, &ParseContext::default()).is_ok());

        let last = bytes.len() - 1;
        bytes[last] = 0x31;
        let err = File::parse_at(&bytes, 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.message().starts_with("data checksum invalid"));
        Ok(())
    }

    #[test]
    fn large_file_header_uses_extended_size() -> core::result::Result<(), Box<dyn Error>> {
        let mut file = raw_file(&[0xEE; 16]);
        file.set_attributes(attributes::LARGE_FILE);
        let bytes = file.write()?;
        assert_eq!(bytes.len(), 0x20 + 16);
        assert_eq!(&bytes[0x14..0x17], &[0, 0, 0]);
        assert_eq!(u64::from_le_bytes(bytes[0x18..0x20].try_into()?), 0x30);

        let parsed = File::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(parsed.node().size, 0x30);
        assert_eq!(parsed.node().bytes(), Some(&[0xEE; 16][..]));
        assert_eq!(parsed.write()?, bytes);
        Ok(())
    }

    #[test]
    fn volume_image_files_hold_sections() -> core::result::Result<(), Box<dyn Error>> {
        let mut file = File::new(NAME, FileType::FirmwareVolumeImage);
        file.add_section(Section::new_with_data(SectionType::Raw, vec![1, 2, 3]))?;
        file.add_section(Section::new_user_interface("Image"))?;
        let bytes = file.write()?;

        let parsed = File::parse_at(&bytes, 0, &ParseContext::default())?;
        let sections: Vec<&Section> = parsed.sections().collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].node().offset, 8);
        assert_eq!(sections[1].user_interface(), Some("Image"));
        assert_eq!(parsed.write()?, bytes);

        // other file types keep their sections opaque
        let mut driver = File::new(NAME, FileType::Driver);
        driver.add_section(Section::new_with_data(SectionType::Raw, vec![1, 2, 3]))?;
        let parsed = File::parse_at(&driver.write()?, 0, &ParseContext::default())?;
        assert_eq!(parsed.sections().count(), 0);
        assert_eq!(parsed.node().bytes().map(<[u8]>::len), Some(7));
        Ok(())
    }

    #[test]
    fn file_size_limit_is_invalid_file() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = raw_file(&[0; 0x100]).write()?;
        let limits = Limits { file_size_max: 0x80, ..Limits::default() };
        let err = File::parse_at(&bytes, 0, &ParseContext::default().with_limits(limits)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        Ok(())
    }

    #[test]
    fn parsed_file_size_limit_applies_on_write() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = raw_file(&[0; 0x40]).write()?;
        let limits = Limits { file_size_max: 0x60, ..Limits::default() };
        let mut file = File::parse_at(&bytes, 0, &ParseContext::default().with_limits(limits))?;
        assert_eq!(file.node().size_max(), Some(0x60));
        assert_eq!(file.write()?, bytes);

        file.node_mut().set_bytes(vec![0; 0x50]);
        let err = file.write().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert_eq!(err.message(), "FFS length 0x68 is larger than max size 0x60");
        Ok(())
    }

    #[test]
    fn data_alignment_from_attributes() {
        let mut file = raw_file(&[]);
        assert_eq!(file.data_alignment(), 0);
        file.set_attributes(0x28);
        assert_eq!(file.data_alignment(), 12);
        file.set_attributes(0x38);
        assert_eq!(file.data_alignment(), 16);
        file.set_attributes(attributes::DATA_ALIGNMENT_2 | 0x08);
        assert_eq!(file.data_alignment(), 18);
    }

    #[test]
    fn build_requires_a_guid_name() -> core::result::Result<(), Box<dyn Error>> {
        let tree: NodeExport = serde_yaml::from_str(
            r#"
kind: file
id: 1ba0062e-c779-4582-8566-336ae8f78f09
fields:
  type: 0x07
  attributes: 0x40
data: '00112233'
"#,
        )?;
        let file = File::build(&tree)?;
        assert_eq!(file.file_type(), FileType::Driver);
        let parsed = File::parse_at(&file.write()?, 0, &ParseContext::default())?;
        assert_eq!(parsed.name()?, NAME);
        assert_eq!(parsed.export(ExportFlags::INCLUDE_DATA).data.as_deref(), Some("00112233"));

        let tree: NodeExport = serde_yaml::from_str("kind: file\nid: not-a-guid\n")?;
        assert_eq!(File::build(&tree).unwrap_err().kind(), ErrorKind::InvalidData);
        Ok(())
    }
}
