//! FFS section parsing and composition.
//!
//! A section is a size/type header followed by a type-specific sub-header and a body. Encapsulation
//! sections (compression and GUID-defined) hold further sections: when the encapsulation is not
//! compressed the body is parsed directly, otherwise the body is handed to the [`SectionExtractor`] in
//! the [`ParseContext`] and the decoded bytes are parsed as a section sequence. Firmware volume image
//! sections hold a nested [`Volume`].
//!
//! Extracted sections keep their encoded body so that they can be written back unchanged; there is no
//! compressor in this crate. Editing the children of such a section requires calling
//! [`Section::clear_encoded`] and is only writable for encapsulations that need no encoding.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::iter;
use r_efi::efi;

use crate::{
    config::{ExportFlags, Limits, ParseContext},
    error::{ErrorKind, FirmwareError, Result, ResultExt},
    export::NodeExport,
    guid,
    node::{FirmwareCodec, FirmwareKind, FirmwareNode, align_up},
    structs::{U24, binary_struct, raw_enum},
    volume::Volume,
};

/// Sections start on 4-byte boundaries within their parent.
pub const SECTION_ALIGNMENT: u8 = 2;

/// GUID-defined section attribute bits.
pub mod attributes {
    pub const PROCESSING_REQUIRED: u16 = 0x01;
    pub const AUTH_STATUS_VALID: u16 = 0x02;
}

/// Compression section algorithms.
pub mod compression_type {
    pub const NOT_COMPRESSED: u8 = 0x00;
    pub const STANDARD: u8 = 0x01;
}

binary_struct! {
    /// EFI_COMMON_SECTION_HEADER
    pub struct CommonHeader: LE {
        size: U24,
        section_type: u8,
    }
}

binary_struct! {
    /// EFI_COMMON_SECTION_HEADER2, used once the section no longer fits a 24-bit size.
    pub struct CommonHeader2: LE {
        size: U24 = constant(U24(U24::MAX)),
        section_type: u8,
        extended_size: u32,
    }
}

binary_struct! {
    /// EFI_GUID_DEFINED_SECTION, after the common header.
    pub struct GuidDefinedHeader: LE {
        section_definition_guid: efi::Guid,
        data_offset: u16,
        attributes: u16,
    }
}

binary_struct! {
    /// EFI_COMPRESSION_SECTION, after the common header.
    pub struct CompressionHeader: LE {
        uncompressed_length: u32,
        compression_type: u8,
    }
}

binary_struct! {
    pub struct FreeformSubtypeGuidHeader: LE {
        sub_type_guid: efi::Guid,
    }
}

binary_struct! {
    pub struct VersionHeader: LE {
        build_number: u16,
    }
}

raw_enum! {
    /// EFI_SECTION_TYPE
    pub enum SectionType {
        Compression = 0x01,
        GuidDefined = 0x02,
        Disposable = 0x03,
        Pe32 = 0x10,
        Pic = 0x11,
        Te = 0x12,
        DxeDepex = 0x13,
        Version = 0x14,
        UserInterface = 0x15,
        Compatibility16 = 0x16,
        FirmwareVolumeImage = 0x17,
        FreeformSubtypeGuid = 0x18,
        Raw = 0x19,
        PeiDepex = 0x1B,
        MmDepex = 0x1C,
    }
}

/// Sub-header of a GUID-defined section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidDefined {
    pub guid: efi::Guid,
    pub attributes: u16,
    /// GUID-specific bytes between the sub-header and the data, e.g. a CRC32.
    pub header_data: Vec<u8>,
}

/// Sub-header of a compression section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Compression {
    pub uncompressed_length: u32,
    pub compression_type: u8,
}

/// Decodes the body of an encapsulation section.
///
/// Implementations return an error of kind [`ErrorKind::NotSupported`] for encapsulations they do not
/// handle, which leaves the section opaque. Any other error aborts the parse.
///
/// A size declared inside the encoded stream must be checked against `limits.file_size_max` before
/// any buffer of that size is allocated.
pub trait SectionExtractor {
    fn extract(&self, section: &Section, limits: &Limits) -> Result<Vec<u8>>;
}

/// An extractor that handles nothing, so every encapsulation stays opaque.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSectionExtractor;

impl SectionExtractor for NullSectionExtractor {
    fn extract(&self, section: &Section, _limits: &Limits) -> Result<Vec<u8>> {
        Err(FirmwareError::not_supported(format!("no extractor for {} section", section.encapsulation_name())))
    }
}

/// A single FFS section.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    node: FirmwareNode,
    section_type: SectionType,
    extended_header: bool,
    guid_defined: Option<GuidDefined>,
    compression: Option<Compression>,
    sub_type_guid: Option<efi::Guid>,
    user_interface: Option<String>,
    encoded: Option<Vec<u8>>,
}

impl Section {
    /// Creates an empty section of the given type.
    pub fn new(section_type: SectionType) -> Self {
        let node = FirmwareNode { alignment: SECTION_ALIGNMENT, ..FirmwareNode::default() };
        let mut section = Self {
            node,
            section_type,
            extended_header: false,
            guid_defined: None,
            compression: None,
            sub_type_guid: None,
            user_interface: None,
            encoded: None,
        };
        match section_type {
            SectionType::Compression => section.compression = Some(Compression::default()),
            SectionType::GuidDefined => section.set_guid_defined(efi::Guid::from_bytes(&[0; 16]), 0),
            _ => (),
        }
        section
    }

    /// Creates a section holding opaque data.
    pub fn new_with_data(section_type: SectionType, data: Vec<u8>) -> Self {
        let mut section = Self::new(section_type);
        section.node.set_bytes(data);
        section
    }

    /// Creates a user-interface section naming its file.
    pub fn new_user_interface(name: &str) -> Self {
        let mut section = Self::new_with_data(SectionType::UserInterface, encode_utf16(name));
        section.user_interface = Some(name.to_string());
        section
    }

    /// Creates a section wrapping a volume.
    pub fn new_volume_image(volume: Volume) -> Result<Self> {
        let mut section = Self::new(SectionType::FirmwareVolumeImage);
        section.node.add_child(volume.into_firmware())?;
        Ok(section)
    }

    pub fn section_type(&self) -> SectionType {
        self.section_type
    }

    pub fn guid_defined(&self) -> Option<&GuidDefined> {
        self.guid_defined.as_ref()
    }

    pub fn compression(&self) -> Option<&Compression> {
        self.compression.as_ref()
    }

    pub fn sub_type_guid(&self) -> Option<&efi::Guid> {
        self.sub_type_guid.as_ref()
    }

    pub fn user_interface(&self) -> Option<&str> {
        self.user_interface.as_deref()
    }

    /// The body as stored on disk for an extracted encapsulation.
    pub fn encoded_payload(&self) -> Option<&[u8]> {
        self.encoded.as_deref()
    }

    /// The undecoded body: the encoded payload of an encapsulation, otherwise the opaque bytes.
    pub fn content(&self) -> &[u8] {
        self.encoded.as_deref().or_else(|| self.node.bytes()).unwrap_or(&[])
    }

    /// Drops the retained encoded payload so the children become the source for [`write`](FirmwareCodec::write).
    pub fn clear_encoded(&mut self) {
        self.encoded = None;
    }

    /// Sets the GUID-defined sub-header and records the GUID as the section id.
    pub fn set_guid_defined(&mut self, guid: efi::Guid, attributes: u16) {
        self.node.id = Some(guid::to_string(&guid));
        self.guid_defined = Some(GuidDefined { guid, attributes, header_data: Vec::new() });
    }

    pub fn set_compression_type(&mut self, compression_type: u8) {
        self.compression.get_or_insert_with(Compression::default).compression_type = compression_type;
    }

    pub fn set_sub_type_guid(&mut self, guid: efi::Guid) {
        self.sub_type_guid = Some(guid);
    }

    /// A short name for the encapsulation, for messages.
    pub fn encapsulation_name(&self) -> String {
        match (&self.guid_defined, self.section_type) {
            (Some(guid_defined), _) => match guid::to_name(&guid_defined.guid) {
                Some(name) => name.to_string(),
                None => guid::to_string(&guid_defined.guid),
            },
            (None, section_type) => section_type.name().map_or_else(|| format!("{section_type:?}"), str::to_string),
        }
    }

    fn parse_body(&mut self, body: &[u8], ctx: &ParseContext) -> Result<()> {
        match self.section_type {
            SectionType::FirmwareVolumeImage => {
                let volume = Volume::parse_at(body, 0, &ctx.nested()?).context("failed to parse nested volume")?;
                self.node.add_child(volume.into_firmware())?;
            }
            SectionType::GuidDefined if self.guid_defined.as_ref().map(|g| g.guid) == Some(guid::SELF_TEST) => {
                log::debug!("ignoring self-test section at 0x{:x}", self.node.offset);
                self.node.set_bytes(body.to_vec());
            }
            SectionType::GuidDefined => self.extract(body, ctx)?,
            SectionType::Compression => {
                let compressed =
                    self.compression.is_some_and(|c| c.compression_type != compression_type::NOT_COMPRESSED);
                if compressed {
                    self.extract(body, ctx)?;
                } else {
                    parse_sections(body, &ctx.nested()?, &mut self.node)
                        .context("failed to parse uncompressed sections")?;
                }
            }
            SectionType::UserInterface => {
                self.user_interface = Some(decode_utf16(body));
                self.node.set_bytes(body.to_vec());
            }
            SectionType::Version => {
                self.node.version = Some(decode_utf16(body));
                self.node.set_bytes(body.to_vec());
            }
            SectionType::FreeformSubtypeGuid => {
                if let Some(name) = self.sub_type_guid.as_ref().and_then(guid::freeform_subtype_name) {
                    log::debug!("freeform subtype {name} at 0x{:x}", self.node.offset);
                }
                self.node.set_bytes(body.to_vec());
            }
            _ => self.node.set_bytes(body.to_vec()),
        }
        Ok(())
    }

    fn extract(&mut self, body: &[u8], ctx: &ParseContext) -> Result<()> {
        let name = self.encapsulation_name();
        self.encoded = Some(body.to_vec());
        match ctx.extractor.extract(self, &ctx.limits) {
            Ok(decoded) => {
                if let Some(compression) = self.compression
                    && compression.compression_type != compression_type::NOT_COMPRESSED
                    && decoded.len() != compression.uncompressed_length as usize
                {
                    Err(FirmwareError::invalid_data(format!(
                        "decompressed size 0x{:x} does not match 0x{:x}",
                        decoded.len(),
                        compression.uncompressed_length
                    )))?;
                }
                log::debug!("decoded {name} section: 0x{:x} -> 0x{:x} bytes", body.len(), decoded.len());
                parse_sections(&decoded, &ctx.nested()?, &mut self.node)
                    .with_context(|| format!("failed to parse {name} sections"))
            }
            Err(err) if err.kind() == ErrorKind::NotSupported => {
                log::warn!("leaving {name} section at 0x{:x} opaque: {err}", self.node.offset);
                let encoded = self.encoded.take().unwrap_or_default();
                self.node.set_bytes(encoded);
                Ok(())
            }
            Err(err) => Err(err.with_prefix(format!("failed to decompress {name} section"))),
        }
    }

    fn needs_encoding(&self) -> bool {
        match self.section_type {
            SectionType::Compression => {
                self.compression.is_some_and(|c| c.compression_type != compression_type::NOT_COMPRESSED)
            }
            SectionType::GuidDefined => self.guid_defined.as_ref().is_some_and(|g| {
                [guid::LZMA_COMPRESS, guid::TIANO_COMPRESS, guid::BROTLI_COMPRESS, guid::CRC32].contains(&g.guid)
            }),
            _ => false,
        }
    }

    fn write_body(&self) -> Result<Vec<u8>> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }
        if self.node.has_children() && self.needs_encoding() {
            Err(FirmwareError::not_supported(format!(
                "cannot encode {} section, no compressor is available",
                self.encapsulation_name()
            )))?;
        }
        self.node.write_payload(0x00)
    }
}

impl FirmwareCodec for Section {
    const KIND: FirmwareKind = FirmwareKind::Section;

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        let Ok(common) = CommonHeader::parse(buf, offset) else {
            return false;
        };
        let (size, header_len) = if common.size.0 == U24::MAX {
            match CommonHeader2::parse(buf, offset) {
                Ok(header) => (header.extended_size as usize, CommonHeader2::SIZE),
                Err(_) => return false,
            }
        } else {
            (common.size.0 as usize, CommonHeader::SIZE)
        };
        size >= header_len && size <= buf.len() - offset
    }

    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let common = CommonHeader::parse(buf, offset)?;
        let (size, header_len, extended_header) = if common.size.0 == U24::MAX {
            let header = CommonHeader2::parse(buf, offset)?;
            (header.extended_size as usize, CommonHeader2::SIZE, true)
        } else {
            (common.size.0 as usize, CommonHeader::SIZE, false)
        };
        let remaining = buf.len() - offset;
        if size < header_len || size > remaining {
            Err(FirmwareError::internal(format!("invalid section size, got 0x{size:x}")))?;
        }
        let data = &buf[offset..offset + size];

        let mut section = Section::new(SectionType::from(common.section_type));
        section.extended_header = extended_header;
        section.node.offset = offset;
        section.node.size = size;

        let mut body_start = header_len;
        match section.section_type {
            SectionType::GuidDefined => {
                let header = GuidDefinedHeader::parse(data, header_len)?;
                let data_offset = header.data_offset as usize;
                let header_end = header_len + GuidDefinedHeader::SIZE;
                if data_offset < header_end {
                    Err(FirmwareError::internal(format!(
                        "data offset 0x{data_offset:x} is smaller than the header length 0x{header_end:x}"
                    )))?;
                }
                if data_offset > size {
                    Err(FirmwareError::invalid_data(format!(
                        "data offset 0x{data_offset:x} exceeds section size 0x{size:x}"
                    )))?;
                }
                section.set_guid_defined(header.section_definition_guid, header.attributes);
                if let Some(guid_defined) = section.guid_defined.as_mut() {
                    guid_defined.header_data = data[header_end..data_offset].to_vec();
                }
                body_start = data_offset;
            }
            SectionType::Compression => {
                let header = CompressionHeader::parse(data, header_len)?;
                section.compression = Some(Compression {
                    uncompressed_length: header.uncompressed_length,
                    compression_type: header.compression_type,
                });
                body_start += CompressionHeader::SIZE;
            }
            SectionType::FreeformSubtypeGuid => {
                let header = FreeformSubtypeGuidHeader::parse(data, header_len)?;
                section.sub_type_guid = Some(header.sub_type_guid);
                body_start += FreeformSubtypeGuidHeader::SIZE;
            }
            SectionType::Version => {
                let header = VersionHeader::parse(data, header_len)?;
                section.node.version_raw = Some(header.build_number as u64);
                body_start += VersionHeader::SIZE;
            }
            _ => (),
        }

        log::debug!(
            "section {:?} at 0x{offset:x}, size 0x{size:x}, body 0x{:x}",
            section.section_type,
            size - body_start
        );
        section.parse_body(&data[body_start..], ctx)?;
        Ok(section)
    }

    fn write(&self) -> Result<Vec<u8>> {
        let body = self.write_body()?;

        let mut sub_header = Vec::new();
        match self.section_type {
            SectionType::GuidDefined => {
                if self.guid_defined.is_none() {
                    Err(FirmwareError::invalid_data("GUID-defined section has no GUID"))?;
                }
            }
            SectionType::Compression => {
                let compression = self.compression.unwrap_or_default();
                let uncompressed_length = if compression.compression_type == compression_type::NOT_COMPRESSED {
                    u32::try_from(body.len())
                        .map_err(|_| FirmwareError::invalid_data("uncompressed section is too large"))?
                } else {
                    compression.uncompressed_length
                };
                let header =
                    CompressionHeader { uncompressed_length, compression_type: compression.compression_type };
                sub_header.extend(header.to_bytes()?);
            }
            SectionType::FreeformSubtypeGuid => {
                let sub_type_guid = self
                    .sub_type_guid
                    .ok_or_else(|| FirmwareError::invalid_data("freeform section has no subtype GUID"))?;
                sub_header.extend(FreeformSubtypeGuidHeader { sub_type_guid }.to_bytes()?);
            }
            SectionType::Version => {
                let build_number = u16::try_from(self.node.version_raw.unwrap_or_default())
                    .map_err(|_| FirmwareError::invalid_data("version build number does not fit in 16 bits"))?;
                sub_header.extend(VersionHeader { build_number }.to_bytes()?);
            }
            _ => (),
        }
        let guid_len = self.guid_defined.as_ref().map_or(0, |g| GuidDefinedHeader::SIZE + g.header_data.len());

        let payload_len = sub_header.len() + guid_len + body.len();
        let extended_header = self.extended_header || CommonHeader::SIZE + payload_len >= U24::MAX as usize;
        let header_len = if extended_header { CommonHeader2::SIZE } else { CommonHeader::SIZE };
        let total = header_len + payload_len;
        let section_type = u8::from(self.section_type);

        let mut buf = Vec::with_capacity(total);
        if extended_header {
            let extended_size =
                u32::try_from(total).map_err(|_| FirmwareError::invalid_data("section is too large"))?;
            buf.extend(CommonHeader2 { size: U24(U24::MAX), section_type, extended_size }.to_bytes()?);
        } else {
            buf.extend(CommonHeader { size: U24(total as u32), section_type }.to_bytes()?);
        }
        if let Some(guid_defined) = &self.guid_defined {
            let data_offset = u16::try_from(header_len + guid_len)
                .map_err(|_| FirmwareError::invalid_data("GUID-defined header is too large"))?;
            let header = GuidDefinedHeader {
                section_definition_guid: guid_defined.guid,
                data_offset,
                attributes: guid_defined.attributes,
            };
            buf.extend(header.to_bytes()?);
            buf.extend_from_slice(&guid_defined.header_data);
        }
        buf.extend(sub_header);
        buf.extend(body);
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        let mut tree = self.node.export(Self::KIND, flags);
        tree.set_field("type", u8::from(self.section_type) as u64);
        if flags.contains(ExportFlags::INCLUDE_DEBUG)
            && let Some(name) = self.section_type.name()
        {
            tree.set_label("type_name", name);
        }
        if self.extended_header {
            tree.set_field("extended_header", 1);
        }
        if let Some(guid_defined) = &self.guid_defined {
            tree.set_field("attributes", guid_defined.attributes as u64);
            if let Some(name) = guid::to_name(&guid_defined.guid) {
                tree.set_label("guid_name", name);
            }
            if !guid_defined.header_data.is_empty() {
                tree.set_label("header_data", hex::encode(&guid_defined.header_data));
            }
        }
        if let Some(compression) = &self.compression {
            tree.set_field("compression_type", compression.compression_type as u64);
            tree.set_field("uncompressed_length", compression.uncompressed_length as u64);
        }
        if let Some(sub_type_guid) = &self.sub_type_guid {
            tree.set_label("sub_type_guid", guid::to_string(sub_type_guid));
            if let Some(name) = guid::freeform_subtype_name(sub_type_guid) {
                tree.set_label("sub_type_name", name);
            }
        }
        if let Some(user_interface) = &self.user_interface {
            tree.set_label("user_interface", user_interface.as_str());
        }
        if flags.contains(ExportFlags::INCLUDE_DATA)
            && let Some(encoded) = &self.encoded
        {
            tree.set_label("encoded", hex::encode(encoded));
        }
        tree
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        let section_type =
            tree.field("type").map(|hex| hex.to_u8("type")).transpose()?.map_or(SectionType::Raw, SectionType::from);
        let mut section = Section::new(section_type);
        section.node = FirmwareNode::build(tree)?;
        if tree.alignment.is_none() {
            section.node.alignment = SECTION_ALIGNMENT;
        }
        section.extended_header = tree.field("extended_header").is_some_and(|hex| hex.0 != 0);

        if section_type == SectionType::GuidDefined {
            let id = tree.id.as_deref().ok_or_else(|| FirmwareError::invalid_data("GUID-defined section needs an id"))?;
            let attributes = tree.field("attributes").map_or(Ok(0), |hex| hex.to_u16("attributes"))?;
            section.set_guid_defined(guid::from_str(id)?, attributes);
            if let Some(header_data) = tree.label("header_data")
                && let Some(guid_defined) = section.guid_defined.as_mut()
            {
                guid_defined.header_data = hex::decode(header_data)
                    .map_err(|err| FirmwareError::invalid_data(format!("invalid header_data: {err}")))?;
            }
        }
        if section_type == SectionType::Compression {
            let uncompressed_length =
                tree.field("uncompressed_length").map_or(Ok(0), |hex| hex.to_u32("uncompressed_length"))?;
            let compression_type = tree.field("compression_type").map_or(Ok(0), |hex| hex.to_u8("compression_type"))?;
            section.compression = Some(Compression { uncompressed_length, compression_type });
        }
        if let Some(sub_type_guid) = tree.label("sub_type_guid") {
            section.sub_type_guid = Some(guid::from_str(sub_type_guid)?);
        }
        if let Some(encoded) = tree.label("encoded") {
            let encoded =
                hex::decode(encoded).map_err(|err| FirmwareError::invalid_data(format!("invalid encoded: {err}")))?;
            section.encoded = Some(encoded);
        }

        let empty = !section.node.has_children() && section.node.bytes().is_none_or(<[u8]>::is_empty);
        if let Some(user_interface) = tree.label("user_interface") {
            section.user_interface = Some(user_interface.to_string());
            if empty {
                section.node.set_bytes(encode_utf16(user_interface));
            }
        }
        if section_type == SectionType::Version
            && empty
            && let Some(version) = section.node.version.clone()
        {
            section.node.set_bytes(encode_utf16(&version));
        }
        Ok(section)
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> crate::node::Firmware {
        crate::node::Firmware::Section(self)
    }
}

/// Parses `buf` as a sequence of 4-byte aligned sections, appending each one to `parent`.
pub fn parse_sections(buf: &[u8], ctx: &ParseContext, parent: &mut FirmwareNode) -> Result<()> {
    parent.set_images_max(ctx.limits.section_images_max);
    let mut offset = 0;
    while offset < buf.len() {
        if buf.len() - offset < CommonHeader::SIZE {
            log::debug!("ignoring 0x{:x} trailing bytes after sections", buf.len() - offset);
            break;
        }
        let section =
            Section::parse_at(buf, offset, ctx).with_context(|| format!("failed to parse section at 0x{offset:x}"))?;
        let end = offset + section.node.size;
        parent.add_child(section.into_firmware())?;
        offset = align_up(end, SECTION_ALIGNMENT)?;
    }
    Ok(())
}

fn decode_utf16(bytes: &[u8]) -> String {
    let units = bytes.chunks_exact(2).map(|unit| u16::from_le_bytes([unit[0], unit[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .take_while(|c| *c != '\0')
        .collect()
}

fn encode_utf16(value: &str) -> Vec<u8> {
    value.encode_utf16().chain(iter::once(0)).flat_map(u16::to_le_bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Limits, node::Firmware};
    use alloc::vec;
    use log::{Level, LevelFilter, Metadata, Record};
    use std::{error::Error, io::Cursor};

    struct SimpleLogger;
    impl log::Log for SimpleLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Info
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                println!("{}", record.args());
            }
        }

        fn flush(&self) {}
    }
    static LOGGER: SimpleLogger = SimpleLogger;

    fn set_logger() {
        let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));
    }

    struct LzmaExtractor;
    impl SectionExtractor for LzmaExtractor {
        fn extract(&self, section: &Section, _limits: &Limits) -> Result<Vec<u8>> {
            match section.guid_defined() {
                Some(guid_defined) if guid_defined.guid == guid::LZMA_COMPRESS => {
                    let mut decoded = Vec::new();
                    lzma_rs::lzma_decompress(&mut Cursor::new(section.content()), &mut decoded)
                        .map_err(|err| FirmwareError::invalid_data(format!("{err:?}")))?;
                    Ok(decoded)
                }
                _ => Err(FirmwareError::not_supported("not lzma")),
            }
        }
    }

    struct FailingExtractor;
    impl SectionExtractor for FailingExtractor {
        fn extract(&self, _section: &Section, _limits: &Limits) -> Result<Vec<u8>> {
            Err(FirmwareError::invalid_data("corrupt stream"))
        }
    }

    fn raw_section(section_type: u8, data: &[u8]) -> Vec<u8> {
        let size = (4 + data.len()) as u32;
        let mut buf = size.to_le_bytes()[..3].to_vec();
        buf.push(section_type);
        buf.extend_from_slice(data);
        buf
    }

    fn guid_section(guid: &efi::Guid, data: &[u8]) -> Vec<u8> {
        let size = (4 + 20 + data.len()) as u32;
        let mut buf = size.to_le_bytes()[..3].to_vec();
        buf.push(0x02);
        buf.extend_from_slice(guid.as_bytes());
        buf.extend_from_slice(&24u16.to_le_bytes());
        buf.extend_from_slice(&attributes::PROCESSING_REQUIRED.to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    fn sections_in(node: &FirmwareNode) -> Vec<&Section> {
        node.children().iter().filter_map(Firmware::as_section).collect()
    }

    #[test]
    fn raw_section_round_trip() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = raw_section(0x19, &[1, 2, 3, 4, 5]);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(section.section_type(), SectionType::Raw);
        assert_eq!(section.node().size, 9);
        assert_eq!(section.node().bytes(), Some(&[1u8, 2, 3, 4, 5][..]));
        assert_eq!(section.write()?, bytes);
        Ok(())
    }

    #[test]
    fn extended_size_is_used_for_section2_headers() -> core::result::Result<(), Box<dyn Error>> {
        let mut bytes = vec![0xFF, 0xFF, 0xFF, 0x19];
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        bytes.extend_from_slice(&[0x55; 8]);

        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(section.node().size, 12);
        assert_eq!(section.node().bytes(), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));
        assert_eq!(section.write()?, &bytes[..12]);
        Ok(())
    }

    #[test]
    fn malformed_sizes_are_rejected() {
        let ctx = ParseContext::default();

        let mut bytes = raw_section(0x19, &[0; 4]);
        bytes[0] = 3;
        let err = Section::parse_at(&bytes, 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "invalid section size, got 0x3");

        let mut bytes = raw_section(0x19, &[0; 4]);
        bytes[0] = 9;
        assert_eq!(Section::parse_at(&bytes, 0, &ctx).unwrap_err().kind(), ErrorKind::Internal);
        assert!(!Section::check_magic(&bytes, 0));

        assert_eq!(Section::parse_at(&[0x08, 0x00], 0, &ctx).unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn guid_data_offset_must_cover_the_header() {
        let mut bytes = guid_section(&guid::LZMA_COMPRESS, &[0; 8]);
        bytes[20] = 0x10;
        let err = Section::parse_at(&bytes, 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn unknown_guid_sections_stay_opaque() -> core::result::Result<(), Box<dyn Error>> {
        set_logger();
        let vendor = efi::Guid::from_bytes(&[0x11; 16]);
        let bytes = guid_section(&vendor, &[9, 8, 7, 6]);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default().with_extractor(&LzmaExtractor))?;
        assert_eq!(section.node().id.as_deref(), Some(guid::to_string(&vendor).as_str()));
        assert_eq!(section.node().bytes(), Some(&[9u8, 8, 7, 6][..]));
        assert!(section.encoded_payload().is_none());
        assert_eq!(section.write()?, bytes);

        let bytes = guid_section(&guid::SELF_TEST, &[1, 2, 3, 4]);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default().with_extractor(&FailingExtractor))?;
        assert_eq!(section.node().bytes(), Some(&[1u8, 2, 3, 4][..]));
        Ok(())
    }

    #[test]
    fn lzma_sections_are_decompressed_and_reparsed() -> core::result::Result<(), Box<dyn Error>> {
        set_logger();
        let mut inner = raw_section(0x19, b"payload");
        inner.resize(12, 0);
        inner.extend(Section::new_user_interface("Shell").write()?);

        let mut compressed = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(&inner), &mut compressed)?;
        let bytes = guid_section(&guid::LZMA_COMPRESS, &compressed);

        let section = Section::parse_at(&bytes, 0, &ParseContext::default().with_extractor(&LzmaExtractor))?;
        let children = sections_in(section.node());
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].node().bytes(), Some(&b"payload"[..]));
        assert_eq!(children[1].node().offset, 12);
        assert_eq!(children[1].user_interface(), Some("Shell"));
        assert_eq!(section.encoded_payload(), Some(&compressed[..]));
        assert_eq!(section.write()?, bytes);

        let mut edited = section.clone();
        edited.clear_encoded();
        assert_eq!(edited.write().unwrap_err().kind(), ErrorKind::NotSupported);

        let opaque = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(opaque.node().bytes(), Some(&compressed[..]));
        Ok(())
    }

    #[test]
    fn extractor_failures_are_prefixed() {
        let bytes = guid_section(&guid::LZMA_COMPRESS, &[0; 16]);
        let err =
            Section::parse_at(&bytes, 0, &ParseContext::default().with_extractor(&FailingExtractor)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "failed to decompress Section:LzmaCompress section: corrupt stream");
    }

    #[test]
    fn uncompressed_compression_sections_are_reparsed() -> core::result::Result<(), Box<dyn Error>> {
        let inner = raw_section(0x10, &[0x4D, 0x5A, 0x90, 0x00]);
        let mut body = (inner.len() as u32).to_le_bytes().to_vec();
        body.push(compression_type::NOT_COMPRESSED);
        body.extend_from_slice(&inner);
        let bytes = raw_section(0x01, &body);

        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        let children = sections_in(section.node());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].section_type(), SectionType::Pe32);
        assert!(section.encoded_payload().is_none());
        assert_eq!(section.write()?, bytes);
        Ok(())
    }

    #[test]
    fn compressed_sections_without_extractor_stay_opaque() -> core::result::Result<(), Box<dyn Error>> {
        let mut body = 0x100u32.to_le_bytes().to_vec();
        body.push(compression_type::STANDARD);
        body.extend_from_slice(&[0xAB; 12]);
        let bytes = raw_section(0x01, &body);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(section.compression().map(|c| c.uncompressed_length), Some(0x100));
        assert_eq!(section.node().bytes(), Some(&[0xAB; 12][..]));
        assert_eq!(section.write()?, bytes);
        Ok(())
    }

    #[test]
    fn version_and_user_interface_strings() -> core::result::Result<(), Box<dyn Error>> {
        let mut body = 0x0102u16.to_le_bytes().to_vec();
        body.extend(encode_utf16("1.2.3"));
        let bytes = raw_section(0x14, &body);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(section.node().version.as_deref(), Some("1.2.3"));
        assert_eq!(section.node().version_raw, Some(0x0102));
        assert_eq!(section.write()?, bytes);

        let section = Section::new_user_interface("DxeCore");
        let parsed = Section::parse_at(&section.write()?, 0, &ParseContext::default())?;
        assert_eq!(parsed.user_interface(), Some("DxeCore"));
        Ok(())
    }

    #[test]
    fn freeform_subtype_guid_is_decoded() -> core::result::Result<(), Box<dyn Error>> {
        let intel_gop = guid::from_str("380b6b4f-1454-41f2-a6d3-61d1333e8cb4")?;
        let mut body = intel_gop.as_bytes().to_vec();
        body.extend_from_slice(&[1, 2]);
        let bytes = raw_section(0x18, &body);
        let section = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(section.sub_type_guid(), Some(&intel_gop));
        assert_eq!(section.node().bytes(), Some(&[1u8, 2][..]));
        assert_eq!(section.write()?, bytes);

        let tree = section.export(ExportFlags::empty());
        assert_eq!(tree.label("sub_type_name"), Some("IntelGop"));
        Ok(())
    }

    #[test]
    fn section_sequences_are_aligned_and_bounded() -> core::result::Result<(), Box<dyn Error>> {
        let mut bytes = raw_section(0x19, &[1]);
        bytes.resize(8, 0);
        bytes.extend(raw_section(0x19, &[2, 2]));
        bytes.resize(16, 0);
        bytes.extend(raw_section(0x19, &[3, 3, 3, 3]));

        let mut node = FirmwareNode::new();
        parse_sections(&bytes, &ParseContext::default(), &mut node)?;
        let offsets: Vec<usize> = node.children().iter().map(|child| child.node().offset).collect();
        assert_eq!(offsets, [0, 8, 16]);
        assert_eq!(node.write_payload(0)?, bytes);

        let limits = Limits { section_images_max: 2, ..Limits::default() };
        let mut node = FirmwareNode::new();
        let err = parse_sections(&bytes, &ParseContext::default().with_limits(limits), &mut node).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        Ok(())
    }

    #[test]
    fn large_sections_switch_to_the_extended_header() -> core::result::Result<(), Box<dyn Error>> {
        let section = Section::new_with_data(SectionType::Raw, vec![0x5A; U24::MAX as usize]);
        let bytes = section.write()?;
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0xFF, 0x19]);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into()?) as usize, bytes.len());
        let parsed = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(parsed.node().size, U24::MAX as usize + 8);
        Ok(())
    }

    #[test]
    fn build_from_yaml() -> core::result::Result<(), Box<dyn Error>> {
        let tree: NodeExport = serde_yaml::from_str(
            r#"
kind: section
id: ee4e5898-3914-4259-9d6e-dc7bd79403cf
fields:
  type: 0x02
  attributes: 0x1
children:
  - kind: section
    fields:
      type: 0x15
    labels:
      user_interface: Shell
"#,
        )?;
        let section = Section::build(&tree)?;
        assert_eq!(section.guid_defined().map(|g| g.guid), Some(guid::LZMA_COMPRESS));
        assert_eq!(section.write().unwrap_err().kind(), ErrorKind::NotSupported);

        let tree: NodeExport = serde_yaml::from_str(
            "kind: section\nversion: '2.0'\nversion_raw: 7\nfields:\n  type: 0x14\n",
        )?;
        let bytes = Section::build(&tree)?.write()?;
        let parsed = Section::parse_at(&bytes, 0, &ParseContext::default())?;
        assert_eq!(parsed.node().version.as_deref(), Some("2.0"));
        assert_eq!(parsed.node().version_raw, Some(7));

        let exported = parsed.export(ExportFlags::INCLUDE_DATA);
        let rebuilt = Section::build(&exported)?;
        assert_eq!(rebuilt.write()?, bytes);
        Ok(())
    }
}
