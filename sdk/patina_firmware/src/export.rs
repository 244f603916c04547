//! Diagnostic tree used to export a parsed image and to build one from a declarative fixture.
//!
//! Integers are emitted as `0x..` strings and accepted back either as strings (hex or decimal) or as
//! plain integers, so fixtures written by hand in YAML can use whichever is convenient.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{
    collections::BTreeMap,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    error::{FirmwareError, Result},
    node::FirmwareKind,
};

/// An integer exported in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hex(pub u64);

impl Hex {
    pub fn to_usize(self, name: &str) -> Result<usize> {
        usize::try_from(self.0).map_err(|_| FirmwareError::invalid_data(format!("{name} 0x{:x} is too large", self.0)))
    }

    pub fn to_u32(self, name: &str) -> Result<u32> {
        u32::try_from(self.0).map_err(|_| FirmwareError::invalid_data(format!("{name} 0x{:x} is too large", self.0)))
    }

    pub fn to_u16(self, name: &str) -> Result<u16> {
        u16::try_from(self.0).map_err(|_| FirmwareError::invalid_data(format!("{name} 0x{:x} is too large", self.0)))
    }

    pub fn to_u8(self, name: &str) -> Result<u8> {
        u8::try_from(self.0).map_err(|_| FirmwareError::invalid_data(format!("{name} 0x{:x} is too large", self.0)))
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for Hex {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct HexVisitor;

impl de::Visitor<'_> for HexVisitor {
    type Value = Hex;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or a hex string")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> core::result::Result<Hex, E> {
        Ok(Hex(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> core::result::Result<Hex, E> {
        u64::try_from(value).map(Hex).map_err(|_| E::custom(format!("{value} is negative")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> core::result::Result<Hex, E> {
        parse_u64(value).map(Hex).ok_or_else(|| E::custom(format!("{value} is not an integer")))
    }
}

impl<'de> Deserialize<'de> for Hex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        deserializer.deserialize_any(HexVisitor)
    }
}

/// Parses `0x`-prefixed hex or plain decimal.
pub fn parse_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// One node of the diagnostic tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeExport {
    pub kind: FirmwareKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_raw: Option<Hex>,
    /// Codec-specific integer fields.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Hex>,
    /// Codec-specific text fields and human-readable names.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Leaf payload, hex encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeExport>,
}

impl NodeExport {
    pub fn set_field(&mut self, name: &str, value: u64) {
        self.fields.insert(name.to_string(), Hex(value));
    }

    pub fn set_label(&mut self, name: &str, value: impl Into<String>) {
        self.labels.insert(name.to_string(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<Hex> {
        self.fields.get(name).copied()
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}
