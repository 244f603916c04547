//! Module for UEFI decompression.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, vec, vec::Vec};
use mu_rust_helpers::uefi_decompress::{DecompressionAlgorithm, decompress_into_with_algo};
use patina_firmware::{
    config::Limits,
    error::{FirmwareError, Result},
    guid,
    section::{Section, SectionExtractor, SectionType, compression_type},
};

/// Provides decompression for sections compressed with the UEFI compression algorithm and TianoCompress
/// GUIDed sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct UefiDecompressSectionExtractor;

impl SectionExtractor for UefiDecompressSectionExtractor {
    fn extract(&self, section: &Section, limits: &Limits) -> Result<Vec<u8>> {
        let algo = match (section.section_type(), section.guid_defined(), section.compression()) {
            (SectionType::GuidDefined, Some(guid_defined), _) if guid_defined.guid == guid::TIANO_COMPRESS => {
                DecompressionAlgorithm::TianoDecompress
            }
            (SectionType::Compression, _, Some(compression)) => match compression.compression_type {
                compression_type::NOT_COMPRESSED => return Ok(section.content().to_vec()),
                compression_type::STANDARD => DecompressionAlgorithm::UefiDecompress,
                other => Err(FirmwareError::not_supported(format!("compression type 0x{other:x}")))?,
            },
            _ => Err(FirmwareError::not_supported("not a UEFI compressed section"))?,
        };

        let src = section.content();
        let (Some(compressed_size), Some(decompressed_size)) =
            (src.first_chunk::<4>(), src.get(4..8).and_then(|size| size.first_chunk::<4>()))
        else {
            return Err(FirmwareError::invalid_data(format!(
                "compressed stream of 0x{:x} bytes is truncated",
                src.len()
            )));
        };
        let compressed_size = u32::from_le_bytes(*compressed_size) as usize;
        if compressed_size > src.len() {
            Err(FirmwareError::invalid_data(format!(
                "compressed size 0x{compressed_size:x} exceeds the stream of 0x{:x} bytes",
                src.len()
            )))?;
        }

        let decompressed_size = u32::from_le_bytes(*decompressed_size) as usize;
        if decompressed_size > limits.file_size_max {
            Err(FirmwareError::invalid_data(format!(
                "decompressed size 0x{decompressed_size:x} exceeds the limit 0x{:x}",
                limits.file_size_max
            )))?;
        }
        if let Some(compression) = section.compression()
            && compression.uncompressed_length as usize != decompressed_size
        {
            Err(FirmwareError::invalid_data(format!(
                "decompressed size 0x{decompressed_size:x} does not match the section length 0x{:x}",
                compression.uncompressed_length
            )))?;
        }

        let mut decompressed = vec![0u8; decompressed_size];
        decompress_into_with_algo(src, &mut decompressed, algo)
            .map_err(|err| FirmwareError::invalid_data(format!("decompression failed: {err:?}")))?;
        log::debug!("decompressed 0x{:x} -> 0x{:x} bytes", src.len(), decompressed.len());
        Ok(decompressed)
    }
}
