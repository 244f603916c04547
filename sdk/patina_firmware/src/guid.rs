//! Well-known GUIDs and GUID string conversion.
//!
//! GUID strings use the EFI mixed-endian registry format (`8c8ce578-8a3d-4f1c-9935-896185c32dd3`) and
//! are always emitted in lowercase.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::String};
use r_efi::efi;
use uuid::Uuid;

use crate::error::{FirmwareError, Result};

/// EFI_FIRMWARE_FILE_SYSTEM2_GUID
pub const FFS2: efi::Guid =
    efi::Guid::from_fields(0x8C8CE578, 0x8A3D, 0x4F1C, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3]);
/// EFI_FIRMWARE_FILE_SYSTEM3_GUID
pub const FFS3: efi::Guid =
    efi::Guid::from_fields(0x5473C07A, 0x3DCB, 0x4DCA, 0xBD, 0x6F, &[0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A]);
/// EFI_SYSTEM_NV_DATA_FV_GUID
pub const NVRAM_EVSA: efi::Guid =
    efi::Guid::from_fields(0xFFF12B8D, 0x7696, 0x4C8B, 0xA9, 0x85, &[0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50]);

/// LZMA_CUSTOM_DECOMPRESS_GUID
pub const LZMA_COMPRESS: efi::Guid =
    efi::Guid::from_fields(0xEE4E5898, 0x3914, 0x4259, 0x9D, 0x6E, &[0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF]);
/// TIANO_CUSTOM_DECOMPRESS_GUID
pub const TIANO_COMPRESS: efi::Guid =
    efi::Guid::from_fields(0xA31280AD, 0x481E, 0x41B6, 0x95, 0xE8, &[0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79]);
/// EFI_CRC32_GUIDED_SECTION_EXTRACTION_GUID
pub const CRC32: efi::Guid =
    efi::Guid::from_fields(0xFC1BCDB0, 0x7D31, 0x49AA, 0x93, 0x6A, &[0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83]);
/// BROTLI_CUSTOM_DECOMPRESS_GUID
pub const BROTLI_COMPRESS: efi::Guid =
    efi::Guid::from_fields(0x3D532050, 0x5CDA, 0x4FD0, 0x87, 0x9E, &[0x0F, 0x7F, 0x63, 0x0D, 0x5A, 0xFB]);
/// Payload generated by the self-test fixtures; carries nothing to decode.
pub const SELF_TEST: efi::Guid =
    efi::Guid::from_fields(0xCED4EAC6, 0x49F3, 0x4C12, 0xA5, 0x97, &[0xFC, 0x8C, 0x33, 0x44, 0x76, 0x91]);

const NAMES: &[(efi::Guid, &str)] = &[
    (FFS2, "Volume:Ffs2"),
    (FFS3, "Volume:Ffs3"),
    (NVRAM_EVSA, "Volume:NvramEvsa"),
    (LZMA_COMPRESS, "Section:LzmaCompress"),
    (TIANO_COMPRESS, "Section:TianoCompress"),
    (CRC32, "Section:Crc32"),
    (BROTLI_COMPRESS, "Section:BrotliCompress"),
    (SELF_TEST, "Section:SelfTest"),
];

/// Vendor sub-type GUIDs seen in freeform sections.
const FREEFORM_SUBTYPES: &[(efi::Guid, &str)] = &[
    (
        efi::Guid::from_fields(0x00781CA1, 0x5DE3, 0x405F, 0xAB, 0xB8, &[0x37, 0x9C, 0x3C, 0x07, 0x69, 0x84]),
        "AmiRomLayoutGuid",
    ),
    (
        efi::Guid::from_fields(0x20FEEBDE, 0xE739, 0x420E, 0xAE, 0x31, &[0x77, 0xE2, 0x87, 0x65, 0x08, 0xC0]),
        "IntelRstOprom",
    ),
    (
        efi::Guid::from_fields(0x224D6EB4, 0x307F, 0x45BA, 0x9D, 0xC3, &[0xFE, 0x9F, 0xC6, 0xB3, 0x81, 0x48]),
        "IntelEntRaidController",
    ),
    (efi::Guid::from_fields(0x2EBE0275, 0x6458, 0x4AF9, 0x91, 0xED, &[0xD3, 0xF4, 0xED, 0xB1, 0x00, 0xAA]), "SignOn"),
    (efi::Guid::from_fields(0x380B6B4F, 0x1454, 0x41F2, 0xA6, 0xD3, &[0x61, 0xD1, 0x33, 0x3E, 0x8C, 0xB4]), "IntelGop"),
    (
        efi::Guid::from_fields(0x50339D20, 0xC90A, 0x4BB2, 0x9A, 0xFF, &[0xD8, 0xA1, 0x1B, 0x23, 0xBC, 0x15]),
        "I219?Oprom",
    ),
    (
        efi::Guid::from_fields(0x88A15A4F, 0x977D, 0x4682, 0xB1, 0x7C, &[0xDA, 0x1F, 0x31, 0x6C, 0x1F, 0x32]),
        "RomLayout",
    ),
    (
        efi::Guid::from_fields(0x9BEC7109, 0x6D7A, 0x413A, 0x8E, 0x4B, &[0x01, 0x9C, 0xED, 0x05, 0x03, 0xE1]),
        "AmiBoardInfoSectionGuid",
    ),
    (
        efi::Guid::from_fields(0xAB56DC60, 0x0057, 0x11DA, 0xA8, 0xDB, &[0x00, 0x01, 0x02, 0xEE, 0xE6, 0x26]),
        "?BuildData",
    ),
    (efi::Guid::from_fields(0xC5A4306E, 0xE247, 0x4ECD, 0xA9, 0xD8, &[0x5B, 0x19, 0x85, 0xD3, 0xDC, 0xDA]), "?Oprom"),
    (
        efi::Guid::from_fields(0xC9352CC3, 0xA354, 0x44E5, 0x87, 0x76, &[0xB2, 0xED, 0x8D, 0xD7, 0x81, 0xEC]),
        "IntelEntRaidController",
    ),
    (efi::Guid::from_fields(0xD46346CA, 0x82A1, 0x4CDE, 0x95, 0x46, &[0x77, 0xC8, 0x6F, 0x89, 0x38, 0x88]), "?Oprom"),
    (
        efi::Guid::from_fields(0xE095AFFE, 0xD4CD, 0x4289, 0x9B, 0x48, &[0x28, 0xF6, 0x4E, 0x3D, 0x78, 0x1D]),
        "IntelRstOprom",
    ),
    (
        efi::Guid::from_fields(0xFE612B72, 0x203C, 0x47B1, 0x85, 0x60, &[0xA6, 0x6D, 0x94, 0x6E, 0xB3, 0x71]),
        "setupdata",
    ),
];

/// Formats a GUID as a lowercase registry-format string.
pub fn to_string(guid: &efi::Guid) -> String {
    format!("{}", Uuid::from_bytes_le(*guid.as_bytes()).hyphenated())
}

/// Parses a registry-format GUID string.
pub fn from_str(value: &str) -> Result<efi::Guid> {
    let uuid = Uuid::parse_str(value).map_err(|_| FirmwareError::invalid_data(format!("{value} is not a valid GUID")))?;
    Ok(efi::Guid::from_bytes(&uuid.to_bytes_le()))
}

/// Returns a human-readable label for a well-known GUID, for diagnostics only.
pub fn to_name(guid: &efi::Guid) -> Option<&'static str> {
    NAMES.iter().find(|(known, _)| known == guid).map(|(_, name)| *name)
}

/// Returns the vendor label of a freeform section sub-type GUID, for diagnostics only.
pub fn freeform_subtype_name(guid: &efi::Guid) -> Option<&'static str> {
    FREEFORM_SUBTYPES.iter().find(|(known, _)| known == guid).map(|(_, name)| *name)
}
