//! Module for LZMA decompression.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, vec::Vec};
use patina_firmware::{
    config::Limits,
    error::{FirmwareError, Result},
    guid,
    section::{Section, SectionExtractor},
};
use std::io::{self, Cursor, Write};

pub const LZMA_UNKNOWN_UNPACKED_SIZE_MAGIC_VALUE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const LZMA_HEADER_SIZE: usize = 13;

/// Output sink that refuses to grow past `limit` bytes.
struct BoundedOutput {
    data: Vec<u8>,
    limit: usize,
    exceeded: bool,
}

impl Write for BoundedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.data.len() + buf.len() > self.limit {
            self.exceeded = true;
            return Err(io::Error::other("LZMA output exceeds the limit"));
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Provides decompression for LZMA GUIDed sections.
///
/// Streams that declare their unpacked size are rejected up front when it exceeds `file_size_max`;
/// streams of unknown size are cut off once the output reaches it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LzmaSectionExtractor;

impl SectionExtractor for LzmaSectionExtractor {
    fn extract(&self, section: &Section, limits: &Limits) -> Result<Vec<u8>> {
        if section.guid_defined().is_some_and(|guid_defined| guid_defined.guid == guid::LZMA_COMPRESS) {
            let data = section.content();
            let Some(header) = data.first_chunk::<LZMA_HEADER_SIZE>() else {
                return Err(FirmwareError::invalid_data(format!(
                    "LZMA stream of 0x{:x} bytes has no header",
                    data.len()
                )));
            };

            let mut unpacked_size = [0u8; 8];
            unpacked_size.copy_from_slice(&header[5..]);
            let capacity = match u64::from_le_bytes(unpacked_size) {
                LZMA_UNKNOWN_UNPACKED_SIZE_MAGIC_VALUE => 0,
                size if size > limits.file_size_max as u64 => Err(FirmwareError::invalid_data(format!(
                    "LZMA unpacked size 0x{size:x} exceeds the limit 0x{:x}",
                    limits.file_size_max
                )))?,
                size => (size as usize).min(data.len() * 64),
            };

            let mut output =
                BoundedOutput { data: Vec::with_capacity(capacity), limit: limits.file_size_max, exceeded: false };
            if let Err(err) = lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut output) {
                if output.exceeded {
                    Err(FirmwareError::invalid_data(format!(
                        "LZMA output exceeds the limit 0x{:x}",
                        limits.file_size_max
                    )))?;
                }
                Err(FirmwareError::invalid_data(format!("LZMA stream is corrupt: {err}")))?;
            }
            return Ok(output.data);
        }
        Err(FirmwareError::not_supported("not an LZMA section"))
    }
}
