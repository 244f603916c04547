//! The FFS file sequence held by a firmware volume.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, vec::Vec};

use crate::{
    config::{ExportFlags, Limits, ParseContext},
    error::{FirmwareError, Result},
    export::NodeExport,
    file::{FILE_ALIGNMENT, File, FileHeader},
    node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode, align_up},
};

/// Byte value of erased flash, which also marks the start of free space.
pub const ERASE_BYTE: u8 = 0xFF;

/// An ordered sequence of 8-byte aligned FFS files, ending at free space or at the end of the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filesystem {
    node: FirmwareNode,
}

impl Filesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: File) -> Result<()> {
        self.node.add_child(file.into_firmware())
    }

    pub fn files(&self) -> impl Iterator<Item = &File> {
        self.node.children().iter().filter_map(Firmware::as_file)
    }

    fn is_free_space(buf: &[u8]) -> bool {
        buf.iter().all(|b| *b == ERASE_BYTE)
    }
}

impl FirmwareCodec for Filesystem {
    const KIND: FirmwareKind = FirmwareKind::Filesystem;

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        let Some(remaining) = buf.get(offset..) else {
            return false;
        };
        remaining.len() < FileHeader::SIZE
            || Self::is_free_space(&remaining[..FileHeader::SIZE])
            || File::check_magic(buf, offset)
    }

    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let body = buf
            .get(offset..)
            .ok_or_else(|| FirmwareError::invalid_data(format!("filesystem offset 0x{offset:x} is out of range")))?;
        if body.len() > ctx.limits.filesystem_size_max {
            Err(FirmwareError::invalid_file(format!(
                "filesystem size 0x{:x} is larger than max size 0x{:x}",
                body.len(),
                ctx.limits.filesystem_size_max
            )))?;
        }

        let mut filesystem = Filesystem::new();
        filesystem.node.offset = offset;
        filesystem.node.size = body.len();
        filesystem.node.set_images_max(ctx.limits.filesystem_images_max);
        filesystem.node.set_size_max(ctx.limits.filesystem_size_max);

        let file_ctx = ctx.nested()?;
        let mut pos = 0;
        while body.len().saturating_sub(pos) >= FileHeader::SIZE {
            if Self::is_free_space(&body[pos..pos + FileHeader::SIZE]) {
                log::debug!("free space at 0x{pos:x}");
                break;
            }
            let file = File::parse_at(body, pos, &file_ctx)
                .map_err(|err| err.with_prefix(format!("failed to parse file at 0x{pos:x}")))?;
            let end = pos + file.node().size;
            filesystem.node.add_child(file.into_firmware())?;
            pos = align_up(end, FILE_ALIGNMENT)?;
        }
        Ok(filesystem)
    }

    fn write(&self) -> Result<Vec<u8>> {
        let buf = self.node.write_payload(ERASE_BYTE)?;
        let filesystem_size_max = self.node.size_max().unwrap_or(Limits::default().filesystem_size_max);
        if buf.len() > filesystem_size_max {
            Err(FirmwareError::invalid_file(format!(
                "filesystem size 0x{:x} is larger than max size 0x{filesystem_size_max:x}",
                buf.len()
            )))?;
        }
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        self.node.export(Self::KIND, flags)
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        Ok(Self { node: FirmwareNode::build(tree)? })
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> Firmware {
        Firmware::Filesystem(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, file::FileType};
    use alloc::vec;
    use r_efi::efi;
    use std::error::Error;

    fn file(seed: u8, len: usize) -> File {
        let mut file = File::new(efi::Guid::from_bytes(&[seed; 16]), FileType::Raw);
        file.node_mut().set_bytes(vec![seed; len]);
        file
    }

    fn filesystem_bytes(files: &[File]) -> Vec<u8> {
        let mut filesystem = Filesystem::new();
        for file in files {
            filesystem.add_file(file.clone()).unwrap();
        }
        filesystem.write().unwrap()
    }

    #[test]
    fn files_are_aligned_and_free_space_ends_the_scan() -> core::result::Result<(), Box<dyn Error>> {
        let mut bytes = filesystem_bytes(&[file(1, 3), file(2, 9)]);
        assert_eq!(bytes.len(), 0x20 + 0x18 + 9);
        assert_eq!(&bytes[0x1B..0x20], &[ERASE_BYTE; 5]);
        bytes.resize(0x100, ERASE_BYTE);

        let filesystem = Filesystem::parse_at(&bytes, 0, &ParseContext::default())?;
        let offsets: Vec<usize> = filesystem.files().map(|file| file.node().offset).collect();
        assert_eq!(offsets, [0, 0x20]);
        assert_eq!(filesystem.node().size, 0x100);
        Ok(())
    }

    #[test]
    fn empty_and_short_bodies_have_no_files() -> core::result::Result<(), Box<dyn Error>> {
        let filesystem = Filesystem::parse_at(&[], 0, &ParseContext::default())?;
        assert_eq!(filesystem.files().count(), 0);
        let filesystem = Filesystem::parse_at(&[0u8; 0x10], 0, &ParseContext::default())?;
        assert_eq!(filesystem.files().count(), 0);
        assert!(Filesystem::check_magic(&[ERASE_BYTE; 0x40], 0));
        Ok(())
    }

    #[test]
    fn file_errors_carry_their_offset() {
        let mut bytes = filesystem_bytes(&[file(1, 4), file(2, 4)]);
        bytes[0x20 + 0x10] ^= 0xFF;
        let err = Filesystem::parse_at(&bytes, 0, &ParseContext::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.to_string().starts_with("failed to parse file at 0x20: "));
    }

    #[test]
    fn ceilings_are_invalid_file() {
        let bytes = filesystem_bytes(&[file(1, 1), file(2, 1), file(3, 1)]);

        let limits = Limits { filesystem_images_max: 2, ..Limits::default() };
        let err = Filesystem::parse_at(&bytes, 0, &ParseContext::default().with_limits(limits)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);

        let limits = Limits { filesystem_size_max: 0x20, ..Limits::default() };
        let err = Filesystem::parse_at(&bytes, 0, &ParseContext::default().with_limits(limits)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
    }

    #[test]
    fn parsed_ceilings_apply_on_write() -> core::result::Result<(), Box<dyn Error>> {
        let bytes = filesystem_bytes(&[file(1, 8)]);
        assert_eq!(bytes.len(), 0x20);
        let limits = Limits { filesystem_size_max: 0x20, ..Limits::fuzzing() };
        let mut filesystem = Filesystem::parse_at(&bytes, 0, &ParseContext::default().with_limits(limits))?;
        assert_eq!(filesystem.write()?, bytes);

        filesystem.add_file(file(2, 8))?;
        let err = filesystem.write().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.message().starts_with("filesystem size 0x40 is larger"));
        Ok(())
    }
}
