//! Firmware Volume (FV) parsing and composition.
//!
//! A volume is a header with a 16-bit checksum and a block map, followed by a body. Volumes whose
//! filesystem GUID names FFS2 or FFS3 hold a [`Filesystem`]; any other body is kept opaque.
//!
//! Writing always emits a 0x48-byte header with a single block-map entry and the terminator, and pads
//! the body with erase bytes up to the volume alignment or the node size, whichever is larger.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::String, vec::Vec};
use r_efi::efi;

use crate::{
    config::{ExportFlags, ParseContext},
    error::{FirmwareError, Result, ResultExt},
    export::NodeExport,
    filesystem::{ERASE_BYTE, Filesystem},
    guid,
    node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode, align_up},
    structs::binary_struct,
};

/// `_FVH`
pub const SIGNATURE: u32 = 0x4856_465F;
pub const REVISION: u8 = 0x02;
/// Low 16 attribute bits used when a volume is created from scratch.
pub const DEFAULT_ATTRIBUTES: u16 = 0xFEFF;
/// Largest alignment exponent accepted when parsing (2 GiB).
pub const ALIGNMENT_MAX: u8 = 31;
/// Largest alignment exponent accepted when writing (1 MiB).
pub const WRITE_ALIGNMENT_MAX: u8 = 20;
/// Block size used for the emitted block map.
pub const BLOCK_SIZE: u32 = 0x1000;

const CHECKSUM_OFFSET: usize = 0x32;

binary_struct! {
    /// EFI_FIRMWARE_VOLUME_HEADER without its block map.
    pub struct VolumeHeader: LE {
        zero_vector: [u8; 16],
        file_system_guid: efi::Guid,
        fv_length: u64,
        signature: u32 = constant(SIGNATURE),
        attributes: u32 = default(DEFAULT_ATTRIBUTES as u32),
        header_length: u16,
        checksum: u16,
        ext_header_offset: u16,
        reserved: u8,
        revision: u8 = default(REVISION),
    }
}

binary_struct! {
    /// EFI_FIRMWARE_VOLUME_EXT_HEADER
    pub struct VolumeExtHeader: LE {
        fv_name: efi::Guid,
        ext_header_size: u32,
    }
}

binary_struct! {
    /// EFI_FIRMWARE_VOLUME_EXT_ENTRY
    pub struct VolumeExtEntry: LE {
        ext_entry_size: u16,
        ext_entry_type: u16,
    }
}

/// Entry size that ends the extended header entry list.
const EXT_ENTRY_END: u16 = 0xFFFF;

binary_struct! {
    /// EFI_FV_BLOCK_MAP_ENTRY
    pub struct BlockMapEntry: LE {
        num_blocks: u32,
        length: u32,
    }
}

/// Two's complement of the 16-bit little-endian word sum; the header sums to zero when it is stored.
fn checksum16(buf: &[u8]) -> u16 {
    let sum = buf.chunks_exact(2).fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])));
    0u16.wrapping_sub(sum)
}

/// A firmware volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    node: FirmwareNode,
    attributes: u16,
    /// Extended header position relative to the end of the header.
    ext_header_offset: Option<u16>,
    block_map: Vec<BlockMapEntry>,
}

impl Volume {
    /// Creates an empty volume; `file_system_guid` becomes the node id.
    pub fn new(file_system_guid: efi::Guid) -> Self {
        let node = FirmwareNode { id: Some(guid::to_string(&file_system_guid)), ..FirmwareNode::default() };
        Self { node, attributes: DEFAULT_ATTRIBUTES, ext_header_offset: None, block_map: Vec::new() }
    }

    /// The filesystem GUID, parsed from the node id.
    pub fn file_system_guid(&self) -> Result<efi::Guid> {
        let id = self.node.id.as_deref().ok_or_else(|| FirmwareError::invalid_data("volume id must be a GUID"))?;
        guid::from_str(id).context("volume id")
    }

    /// Low 16 bits of the volume attributes.
    pub fn attributes(&self) -> u16 {
        self.attributes
    }

    pub fn set_attributes(&mut self, attributes: u16) {
        self.attributes = attributes;
    }

    /// Block map as parsed, without the terminator.
    pub fn block_map(&self) -> &[BlockMapEntry] {
        &self.block_map
    }

    pub fn filesystem(&self) -> Option<&Filesystem> {
        self.node.children().iter().find_map(Firmware::as_filesystem)
    }

    pub fn set_filesystem(&mut self, filesystem: Filesystem) -> Result<()> {
        self.node.set_bytes(Vec::new());
        self.node.add_child(filesystem.into_firmware())
    }

    fn holds_filesystem(file_system_guid: &efi::Guid) -> bool {
        *file_system_guid == guid::FFS2 || *file_system_guid == guid::FFS3
    }

    /// Checks the extended header at `ext_offset` and walks its entries, all within `data`.
    fn check_ext_header(data: &[u8], ext_offset: usize) -> Result<()> {
        let ext_header = VolumeExtHeader::parse(data, ext_offset)
            .with_context(|| format!("invalid extended header at 0x{ext_offset:x}"))?;
        let ext_size = ext_header.ext_header_size as usize;
        let end = ext_offset
            .checked_add(ext_size)
            .filter(|end| ext_size >= VolumeExtHeader::SIZE && *end <= data.len())
            .ok_or_else(|| {
                FirmwareError::invalid_data(format!("extended header size 0x{ext_size:x} is out of range"))
            })?;

        let mut pos = ext_offset + VolumeExtHeader::SIZE;
        while pos + VolumeExtEntry::SIZE <= end {
            let entry = VolumeExtEntry::parse(data, pos)?;
            match entry.ext_entry_size {
                0 => Err(FirmwareError::invalid_data("EFI_VOLUME_EXT_ENTRY invalid size"))?,
                EXT_ENTRY_END => break,
                size => {
                    log::trace!("extended header entry type 0x{:x} at 0x{pos:x}", entry.ext_entry_type);
                    pos += size as usize;
                }
            }
        }
        log::debug!("volume name {}", guid::to_string(&ext_header.fv_name));
        Ok(())
    }
}

impl FirmwareCodec for Volume {
    const KIND: FirmwareKind = FirmwareKind::Volume;
    const SEARCH_STEP: Option<usize> = Some(8);

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        VolumeHeader::validate(buf, offset).is_ok()
    }

    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let header = VolumeHeader::parse(buf, offset)?;
        if header.revision != REVISION {
            Err(FirmwareError::internal(format!(
                "revision invalid, got 0x{:x}, expected 0x{REVISION:x}",
                header.revision
            )))?;
        }

        let length = usize::try_from(header.fv_length)
            .map_err(|_| FirmwareError::invalid_data(format!("volume length 0x{:x} is too large", header.fv_length)))?;
        if length == 0 {
            Err(FirmwareError::invalid_data("invalid volume length"))?;
        }
        if length > ctx.limits.volume_size_max {
            Err(FirmwareError::internal(format!(
                "volume length larger than max size: 0x{length:x} > 0x{:x}",
                ctx.limits.volume_size_max
            )))?;
        }
        let remaining = buf.len() - offset;
        if length > remaining {
            Err(FirmwareError::invalid_data(format!("volume length 0x{length:x} exceeds remaining 0x{remaining:x}")))?;
        }

        let alignment = ((header.attributes >> 16) & 0xFF) as u8;
        if alignment > ALIGNMENT_MAX {
            Err(FirmwareError::invalid_data(format!("alignment invalid, got 0x{alignment:x}")))?;
        }

        let header_length = header.header_length as usize;
        if header_length < VolumeHeader::SIZE || header_length > length || header_length % 2 != 0 {
            Err(FirmwareError::internal(format!(
                "header length invalid, got 0x{header_length:x} for volume of 0x{length:x}"
            )))?;
        }
        if !ctx.ignore_checksum() {
            let sum = checksum16(&buf[offset..offset + header_length]);
            if sum != 0 {
                Err(FirmwareError::invalid_file(format!(
                    "checksum invalid, got 0x{:04x}, expected 0x{:04x}",
                    header.checksum,
                    header.checksum.wrapping_add(sum)
                )))?;
            }
        }

        let mut volume = Volume::new(header.file_system_guid);
        volume.attributes = header.attributes as u16;
        volume.node.offset = offset;
        volume.node.size = length;
        volume.node.alignment = alignment;
        volume.node.set_images_max(ctx.limits.volume_images_max);
        if header.ext_header_offset != 0 {
            Self::check_ext_header(&buf[offset..offset + length], header.ext_header_offset as usize)?;
            volume.ext_header_offset = Some(header.ext_header_offset.saturating_sub(header.header_length));
        }
        if let Some(name) = guid::to_name(&header.file_system_guid) {
            log::debug!("volume {name} at 0x{offset:x}, length 0x{length:x}");
        }

        let body = &buf[offset + header_length..offset + length];
        if Self::holds_filesystem(&header.file_system_guid) {
            let filesystem = Filesystem::parse_at(body, 0, &ctx.nested()?).context("failed to parse filesystem")?;
            volume.node.add_child(filesystem.into_firmware())?;
        } else {
            volume.node.set_bytes(body.to_vec());
        }

        let mut capacity = 0u64;
        let mut entry_offset = offset + VolumeHeader::SIZE;
        while entry_offset + BlockMapEntry::SIZE <= offset + header_length {
            let entry = BlockMapEntry::parse(buf, entry_offset)?;
            if entry.num_blocks == 0 && entry.length == 0 {
                break;
            }
            capacity = capacity.saturating_add(entry.num_blocks as u64 * entry.length as u64);
            volume.block_map.push(entry);
            entry_offset += BlockMapEntry::SIZE;
        }
        if capacity < header.fv_length {
            Err(FirmwareError::internal(format!(
                "blocks allocated is less than volume length: 0x{capacity:x} < 0x{:x}",
                header.fv_length
            )))?;
        }

        Ok(volume)
    }

    fn write(&self) -> Result<Vec<u8>> {
        let file_system_guid = self.file_system_guid()?;
        let alignment = self.node.alignment;
        if alignment > WRITE_ALIGNMENT_MAX {
            Err(FirmwareError::invalid_data(format!(
                "alignment invalid, got 0x{alignment:x} > 0x{WRITE_ALIGNMENT_MAX:x}"
            )))?;
        }

        let body = self.node.write_payload(ERASE_BYTE)?;
        let header_length = VolumeHeader::SIZE + 2 * BlockMapEntry::SIZE;
        let fv_length = align_up(header_length + body.len(), alignment)?.max(self.node.size);
        let block_map = if fv_length % BLOCK_SIZE as usize == 0 {
            BlockMapEntry { num_blocks: (fv_length / BLOCK_SIZE as usize) as u32, length: BLOCK_SIZE }
        } else {
            let length = u32::try_from(fv_length)
                .map_err(|_| FirmwareError::invalid_data(format!("volume length 0x{fv_length:x} is too large")))?;
            BlockMapEntry { num_blocks: 1, length }
        };
        let ext_header_offset = match self.ext_header_offset {
            None => 0,
            Some(ext) => u16::try_from(header_length + ext as usize)
                .map_err(|_| FirmwareError::invalid_data("extended header offset is too large"))?,
        };

        let header = VolumeHeader {
            zero_vector: [0; 16],
            file_system_guid,
            fv_length: fv_length as u64,
            signature: SIGNATURE,
            attributes: ((alignment as u32) << 16) | self.attributes as u32,
            header_length: header_length as u16,
            checksum: 0,
            ext_header_offset,
            reserved: 0,
            revision: REVISION,
        };
        let mut buf = header.to_bytes()?;
        buf.extend(block_map.to_bytes()?);
        buf.extend(BlockMapEntry::default().to_bytes()?);
        let checksum = checksum16(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());

        buf.extend(body);
        buf.resize(fv_length, ERASE_BYTE);
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        let mut tree = self.node.export(Self::KIND, flags);
        tree.set_field("attrs", self.attributes as u64);
        if let Some(ext_header_offset) = self.ext_header_offset {
            tree.set_field("ext_header_offset", ext_header_offset as u64);
        }
        if flags.contains(ExportFlags::INCLUDE_DEBUG) {
            if let Some(name) = self.file_system_guid().ok().as_ref().and_then(guid::to_name) {
                tree.set_label("name", name);
            }
            let block_map: Vec<String> =
                self.block_map.iter().map(|entry| format!("{:#x}x{:#x}", entry.num_blocks, entry.length)).collect();
            if !block_map.is_empty() {
                tree.set_label("block_map", block_map.join(","));
            }
        }
        tree
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        let node = FirmwareNode::build(tree)?;
        let attributes = tree.field("attrs").map_or(Ok(DEFAULT_ATTRIBUTES), |hex| hex.to_u16("attrs"))?;
        let ext_header_offset =
            tree.field("ext_header_offset").map(|hex| hex.to_u16("ext_header_offset")).transpose()?;
        let volume = Self { node, attributes, ext_header_offset, block_map: Vec::new() };
        volume.file_system_guid()?;
        Ok(volume)
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> Firmware {
        Firmware::Volume(self)
    }
}
