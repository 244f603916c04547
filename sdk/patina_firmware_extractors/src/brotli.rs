//! Module for Brotli decompression.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{boxed::Box, format, vec, vec::Vec};
use alloc_no_stdlib::{Allocator, SliceWrapper, SliceWrapperMut, define_index_ops_mut};
use brotli_decompressor::{BrotliDecompressStream, BrotliResult, BrotliState, HuffmanCode};
use core::marker::PhantomData;
use patina_firmware::{
    config::Limits,
    error::{FirmwareError, Result},
    guid,
    section::{Section, SectionExtractor},
};

// out size and scratch size, both u64
const BROTLI_HEADER_SIZE: usize = 16;

/// Decoder buffer backed by a boxed slice.
struct BoxedCells<T>(Box<[T]>);

impl<T> Default for BoxedCells<T> {
    fn default() -> Self {
        BoxedCells(Box::default())
    }
}
define_index_ops_mut!(T, BoxedCells<T>);

impl<T> SliceWrapper<T> for BoxedCells<T> {
    fn slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> SliceWrapperMut<T> for BoxedCells<T> {
    fn slice_mut(&mut self) -> &mut [T] {
        &mut self.0
    }
}

/// Hands the decoder default-initialized cells from the global allocator.
struct CellAllocator<T>(PhantomData<T>);

impl<T> CellAllocator<T> {
    fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Clone + Default> Allocator<T> for CellAllocator<T> {
    type AllocatedMemory = BoxedCells<T>;

    fn alloc_cell(&mut self, len: usize) -> BoxedCells<T> {
        BoxedCells(vec![T::default(); len].into_boxed_slice())
    }

    fn free_cell(&mut self, _cells: BoxedCells<T>) {}
}

/// Provides decompression for Brotli GUIDed sections.
///
/// The output size comes from the stream header and is checked against `file_size_max` before the
/// output buffer is allocated.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrotliSectionExtractor;

impl SectionExtractor for BrotliSectionExtractor {
    fn extract(&self, section: &Section, limits: &Limits) -> Result<Vec<u8>> {
        if section.guid_defined().is_some_and(|guid_defined| guid_defined.guid == guid::BROTLI_COMPRESS) {
            let data = section.content();
            let Some(out_size) = data.first_chunk::<8>().filter(|_| data.len() >= BROTLI_HEADER_SIZE) else {
                return Err(FirmwareError::invalid_data(format!(
                    "Brotli stream of 0x{:x} bytes has no header",
                    data.len()
                )));
            };
            let out_size = u64::from_le_bytes(*out_size);
            if out_size > limits.file_size_max as u64 {
                Err(FirmwareError::invalid_data(format!(
                    "Brotli output size 0x{out_size:x} exceeds the limit 0x{:x}",
                    limits.file_size_max
                )))?;
            }

            let mut brotli_state = BrotliState::new(
                CellAllocator::<u8>::new(),
                CellAllocator::<u32>::new(),
                CellAllocator::<HuffmanCode>::new(),
            );
            let in_data = &data[BROTLI_HEADER_SIZE..];
            let mut out_data = vec![0u8; out_size as usize];
            let mut out_data_size = 0;
            let result = BrotliDecompressStream(
                &mut in_data.len(),
                &mut 0,
                in_data,
                &mut out_data.len(),
                &mut 0,
                out_data.as_mut_slice(),
                &mut out_data_size,
                &mut brotli_state,
            );

            if !matches!(result, BrotliResult::ResultSuccess) {
                Err(FirmwareError::invalid_data("Brotli stream is corrupt"))?;
            }
            return Ok(out_data);
        }
        Err(FirmwareError::not_supported("not a Brotli section"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patina_firmware::{
        config::ParseContext,
        error::ErrorKind,
        node::{Firmware, FirmwareCodec},
        section::{SectionType, attributes},
    };
    use std::error::Error;

    /// A stream holding `payload` in one uncompressed meta-block followed by an empty last block.
    fn stored_stream(payload: &[u8]) -> Vec<u8> {
        let mlen = payload.len() as u32 - 1;
        let mut stream = vec![((mlen & 0xF) << 4) as u8, (mlen >> 4) as u8, 0x10 | (mlen >> 12) as u8];
        stream.extend_from_slice(payload);
        stream.push(0x03);
        stream
    }

    fn brotli_section(out_size: u64, stream: &[u8]) -> Vec<u8> {
        let mut buf = ((24 + BROTLI_HEADER_SIZE + stream.len()) as u32).to_le_bytes()[..3].to_vec();
        buf.push(0x02);
        buf.extend_from_slice(guid::BROTLI_COMPRESS.as_bytes());
        buf.extend_from_slice(&24u16.to_le_bytes());
        buf.extend_from_slice(&attributes::PROCESSING_REQUIRED.to_le_bytes());
        buf.extend_from_slice(&out_size.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(stream);
        buf
    }

    #[test]
    fn stored_blocks_are_decoded() -> core::result::Result<(), Box<dyn Error>> {
        let inner = Section::new_with_data(SectionType::Raw, vec![0xB7; 4]).write()?;
        let bytes = brotli_section(inner.len() as u64, &stored_stream(&inner));

        let ctx = ParseContext::default().with_extractor(&BrotliSectionExtractor);
        let section = Section::parse_at(&bytes, 0, &ctx)?;
        let raw = section.node().children().iter().find_map(Firmware::as_section).ok_or("no inner section")?;
        assert_eq!(raw.node().bytes(), Some(&[0xB7; 4][..]));
        Ok(())
    }

    #[test]
    fn short_headers_and_bad_streams_fail() {
        let ctx = ParseContext::default().with_extractor(&BrotliSectionExtractor);
        let mut short = brotli_section(4, &[])[..24 + 8].to_vec();
        short[..3].copy_from_slice(&32u32.to_le_bytes()[..3]);
        let err = Section::parse_at(&short, 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = Section::parse_at(&brotli_section(4, &[0x01, 0x00, 0x00, 0x00]), 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn declared_output_size_is_bounded() -> core::result::Result<(), Box<dyn Error>> {
        let ctx = ParseContext::default().with_extractor(&BrotliSectionExtractor);
        let err = Section::parse_at(&brotli_section(u64::MAX, &[0x01]), 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(
            err.to_string(),
            "failed to decompress Section:BrotliCompress section: \
             Brotli output size 0xffffffffffffffff exceeds the limit 0x10000000"
        );

        let inner = Section::new_with_data(SectionType::Raw, vec![0xB7; 4]).write()?;
        let bytes = brotli_section(0x20_0000, &stored_stream(&inner));
        let err = Section::parse_at(&bytes, 0, &ctx.with_limits(Limits::fuzzing())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.message().starts_with("Brotli output size 0x200000 exceeds"));
        Ok(())
    }
}
