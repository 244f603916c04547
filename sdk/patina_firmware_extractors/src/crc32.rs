//! Module for crc32 section verification.
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

/// Provides extraction for CRC32 sections.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32SectionExtractor;

impl SectionExtractor for Crc32SectionExtractor {
    fn extract(&self, section: &Section, _limits: &Limits) -> Result<Vec<u8>> {
        if let Some(guid_defined) = section.guid_defined()
            && guid_defined.guid == guid::CRC32
        {
            let Some(crc_bytes) = guid_defined.header_data.first_chunk::<4>() else {
                return Err(FirmwareError::invalid_data("CRC32 section header is truncated"));
            };
            let expected = u32::from_le_bytes(*crc_bytes);
            let content = section.content();
            let actual = crc32fast::hash(content);
            if expected != actual {
                Err(FirmwareError::invalid_file(format!(
                    "CRC32 mismatch, got 0x{actual:08x}, expected 0x{expected:08x}"
                )))?;
            }
            return Ok(content.to_vec());
        }
        Err(FirmwareError::not_supported("not a CRC32 section"))
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

    fn crc32_section(payload: &[u8], crc: u32) -> Vec<u8> {
        let mut buf = ((28 + payload.len()) as u32).to_le_bytes()[..3].to_vec();
        buf.push(0x02);
        buf.extend_from_slice(guid::CRC32.as_bytes());
        buf.extend_from_slice(&28u16.to_le_bytes());
        buf.extend_from_slice(&attributes::AUTH_STATUS_VALID.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn valid_crc_yields_the_payload() -> core::result::Result<(), Box<dyn Error>> {
        let inner = Section::new_user_interface("Crc32Protected").write()?;
        let bytes = crc32_section(&inner, crc32fast::hash(&inner));

        let ctx = ParseContext::default().with_extractor(&Crc32SectionExtractor);
        let section = Section::parse_at(&bytes, 0, &ctx)?;
        assert_eq!(section.guid_defined().map(|g| g.header_data.len()), Some(4));
        let ui = section.node().children().iter().find_map(Firmware::as_section).ok_or("no inner section")?;
        assert_eq!(ui.section_type(), SectionType::UserInterface);
        assert_eq!(ui.user_interface(), Some("Crc32Protected"));
        assert_eq!(section.write()?, bytes);
        Ok(())
    }

    #[test]
    fn crc_mismatch_is_invalid_file() -> core::result::Result<(), Box<dyn Error>> {
        let inner = Section::new_with_data(SectionType::Raw, alloc::vec![7; 8]).write()?;
        let bytes = crc32_section(&inner, crc32fast::hash(&inner) ^ 1);
        let ctx = ParseContext::default().with_extractor(&Crc32SectionExtractor);
        let err = Section::parse_at(&bytes, 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
        assert!(err.message().starts_with("CRC32 mismatch"));
        Ok(())
    }

    #[test]
    fn other_sections_are_not_supported() {
        let section = Section::new_with_data(SectionType::Raw, alloc::vec![1]);
        let err = Crc32SectionExtractor.extract(&section, &Limits::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn truncated_crc_header_is_invalid_data() {
        let mut bytes = crc32_section(&[0; 8], 0);
        // data offset covers only two of the four CRC bytes
        bytes[20..22].copy_from_slice(&26u16.to_le_bytes());
        let ctx = ParseContext::default().with_extractor(&Crc32SectionExtractor);
        let err = Section::parse_at(&bytes, 0, &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.message(), "CRC32 section header is truncated");
    }
}
