//! Parse configuration: flags, resource ceilings and the section extractor.
//!
//! Nothing in this crate reads the process environment. Callers that fuzz the codec select the lowered
//! ceilings explicitly with [`Limits::fuzzing`].
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::format;
use core::fmt;

use crate::{
    error::{FirmwareError, Result},
    section::{NullSectionExtractor, SectionExtractor},
};

bitflags::bitflags! {
    /// Flags controlling how an image is parsed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParseFlags: u32 {
        /// Do not verify header or data checksums.
        const IGNORE_CHECKSUM = 1 << 0;
        /// Do not search forward for a magic value; the node must start exactly at the given offset.
        const NO_SEARCH = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Flags controlling what [`export`](crate::node::Firmware::export) emits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExportFlags: u32 {
        /// Include leaf payloads as hex so the tree can be rebuilt.
        const INCLUDE_DATA = 1 << 0;
        /// Include parse geometry (offsets) and human-readable labels.
        const INCLUDE_DEBUG = 1 << 1;
    }
}

/// Cardinality and size ceilings applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted volume length.
    pub volume_size_max: usize,
    /// Most child images a volume may hold.
    pub volume_images_max: usize,
    /// Largest accepted filesystem body.
    pub filesystem_size_max: usize,
    /// Most files a filesystem may hold.
    pub filesystem_images_max: usize,
    /// Largest accepted FFS file, header included.
    pub file_size_max: usize,
    /// Most sections in a single section sequence.
    pub section_images_max: usize,
    /// Most volumes found in a BIOS region.
    pub bios_images_max: usize,
    /// Deepest nesting of containers.
    pub depth_max: usize,
}

impl Limits {
    /// Ceilings low enough that adversarial inputs fail fast.
    pub const fn fuzzing() -> Self {
        Self {
            volume_size_max: 0x10_0000,
            volume_images_max: 10,
            filesystem_size_max: 0x10_0000,
            filesystem_images_max: 50,
            file_size_max: 0x10_0000,
            section_images_max: 10,
            bios_images_max: 10,
            depth_max: 10,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            volume_size_max: 0x1000_0000,
            volume_images_max: 1000,
            filesystem_size_max: 0x1000_0000,
            filesystem_images_max: 10_000,
            file_size_max: 0x1000_0000,
            section_images_max: 2000,
            bios_images_max: 1000,
            depth_max: 50,
        }
    }
}

/// Everything a parse call needs besides the bytes.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    pub flags: ParseFlags,
    pub limits: Limits,
    pub extractor: &'a dyn SectionExtractor,
    depth: usize,
}

static NULL_EXTRACTOR: NullSectionExtractor = NullSectionExtractor;

impl<'a> ParseContext<'a> {
    pub fn new(flags: ParseFlags, limits: Limits, extractor: &'a dyn SectionExtractor) -> Self {
        Self { flags, limits, extractor, depth: 0 }
    }

    /// Replaces the section extractor.
    pub fn with_extractor(self, extractor: &'a dyn SectionExtractor) -> Self {
        Self { extractor, ..self }
    }

    /// Replaces the flags.
    pub fn with_flags(self, flags: ParseFlags) -> Self {
        Self { flags, ..self }
    }

    /// Replaces the ceilings.
    pub fn with_limits(self, limits: Limits) -> Self {
        Self { limits, ..self }
    }

    pub fn ignore_checksum(&self) -> bool {
        self.flags.contains(ParseFlags::IGNORE_CHECKSUM)
    }

    pub fn no_search(&self) -> bool {
        self.flags.contains(ParseFlags::NO_SEARCH)
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The context for a child whose exact type is already known.
    pub fn nested(&self) -> Result<Self> {
        let depth = self.depth + 1;
        if depth > self.limits.depth_max {
            Err(FirmwareError::invalid_data(format!("nesting too deep, limit is {}", self.limits.depth_max)))?;
        }
        Ok(Self { flags: self.flags | ParseFlags::NO_SEARCH, depth, ..*self })
    }
}

impl Default for ParseContext<'_> {
    fn default() -> Self {
        Self::new(ParseFlags::empty(), Limits::default(), &NULL_EXTRACTOR)
    }
}

impl fmt::Debug for ParseContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseContext")
            .field("flags", &self.flags)
            .field("limits", &self.limits)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
