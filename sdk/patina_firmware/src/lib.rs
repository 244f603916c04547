//! Parsing and composition of UEFI firmware images.
//!
//! This crate decodes a flash image into a tree of typed nodes and writes the tree back out
//! byte-for-byte:
//!
//! - [`ifd::IfdImage`]: an Intel Flash Descriptor image split into [`ifd::IfdRegion`]s, with the BIOS
//!   region scanned for firmware volumes.
//! - [`volume::Volume`]: a PI firmware volume, holding a [`filesystem::Filesystem`] when its file system
//!   GUID is FFS2 or FFS3.
//! - [`file::File`]: an FFS file, whose firmware-volume-image contents are split into sections.
//! - [`section::Section`]: a leaf or encapsulation section. Encapsulations are decoded through the
//!   [`section::SectionExtractor`] set on the [`config::ParseContext`].
//!
//! Every node can also be exported to a [`export::NodeExport`] tree, which serializes with serde and can
//! be rebuilt into nodes.
//!
//! ```ignore
//! use patina_firmware::{config::ParseContext, node::Firmware};
//!
//! let firmware = Firmware::parse(&image, 0, &ParseContext::default())?;
//! assert_eq!(firmware.write()?, image);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod export;
pub mod file;
pub mod filesystem;
pub mod guid;
pub mod ifd;
pub mod node;
pub mod section;
pub mod structs;
pub mod volume;

pub use error::{ErrorKind, FirmwareError};
pub use node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode};
