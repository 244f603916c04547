//! # Section Extractor Implementations
//!
//! This crate provides implementations of the [`patina_firmware::section::SectionExtractor`] trait so
//! that encapsulation sections can be decoded and their inner sections parsed.
//!
//! ## Features
//!
//! Each feature corresponds to a different extractor, so that only the decoders a consumer needs are
//! compiled:
//! - `brotli`: Enables [`BrotliSectionExtractor`] for Brotli GUID-defined sections.
//! - `uefi_decompress`: Enables [`UefiDecompressSectionExtractor`] for standard compression sections and
//!   TianoCompress GUID-defined sections.
//! - `crc32`: Enables [`Crc32SectionExtractor`] to validate CRC32 GUID-defined sections and return the
//!   verified payload.
//! - `lzma`: Enables [`LzmaSectionExtractor`] for LZMA GUID-defined sections. Implies `std`.
//!
//! [`CompositeSectionExtractor`] chains every enabled extractor.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(not(any(test, feature = "std")), no_std)]
extern crate alloc;

#[cfg(feature = "brotli")]
mod brotli;
#[cfg(feature = "brotli")]
pub use brotli::BrotliSectionExtractor;

#[cfg(feature = "crc32")]
mod crc32;
#[cfg(feature = "crc32")]
pub use crc32::Crc32SectionExtractor;

#[cfg(feature = "lzma")]
mod lzma;
#[cfg(feature = "lzma")]
pub use lzma::LzmaSectionExtractor;

#[cfg(feature = "uefi_decompress")]
mod uefi_decompress;
#[cfg(feature = "uefi_decompress")]
pub use uefi_decompress::UefiDecompressSectionExtractor;

mod composite;
pub use composite::CompositeSectionExtractor;
