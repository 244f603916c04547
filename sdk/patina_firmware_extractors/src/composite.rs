//! Module for a composite of every enabled section extractor.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use patina_firmware::{
    config::Limits,
    error::{ErrorKind, FirmwareError, Result},
    section::{Section, SectionExtractor},
};

#[cfg(feature = "brotli")]
use crate::BrotliSectionExtractor;
#[cfg(feature = "crc32")]
use crate::Crc32SectionExtractor;
#[cfg(feature = "lzma")]
use crate::LzmaSectionExtractor;
#[cfg(feature = "uefi_decompress")]
use crate::UefiDecompressSectionExtractor;

/// Provides a composite section extractor that tries every extractor enabled by feature flags, in turn,
/// until one recognizes the section.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositeSectionExtractor {
    #[cfg(feature = "uefi_decompress")]
    uefi_decompress: UefiDecompressSectionExtractor,
    #[cfg(feature = "brotli")]
    brotli: BrotliSectionExtractor,
    #[cfg(feature = "crc32")]
    crc32: Crc32SectionExtractor,
    #[cfg(feature = "lzma")]
    lzma: LzmaSectionExtractor,
}

impl CompositeSectionExtractor {
    fn extractors(&self) -> Vec<&dyn SectionExtractor> {
        #[allow(unused_mut)]
        let mut extractors: Vec<&dyn SectionExtractor> = Vec::new();
        #[cfg(feature = "uefi_decompress")]
        extractors.push(&self.uefi_decompress);
        #[cfg(feature = "brotli")]
        extractors.push(&self.brotli);
        #[cfg(feature = "crc32")]
        extractors.push(&self.crc32);
        #[cfg(feature = "lzma")]
        extractors.push(&self.lzma);
        extractors
    }
}

impl SectionExtractor for CompositeSectionExtractor {
    fn extract(&self, section: &Section, limits: &Limits) -> Result<Vec<u8>> {
        for extractor in self.extractors() {
            match extractor.extract(section, limits) {
                Err(err) if err.kind() == ErrorKind::NotSupported => (),
                result => return result,
            }
        }
        Err(FirmwareError::not_supported(alloc::format!(
            "no extractor for {} section",
            section.encapsulation_name()
        )))
    }
}
