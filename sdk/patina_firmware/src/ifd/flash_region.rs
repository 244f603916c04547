//! Flash regions carved out of an IFD image.
//!
//! Every region keeps its bytes opaque except the BIOS region, which is scanned for firmware volumes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::ToString, vec::Vec};

use crate::{
    config::{ExportFlags, ParseContext},
    error::{FirmwareError, Result},
    export::NodeExport,
    filesystem::ERASE_BYTE,
    node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode, Payload},
    volume::Volume,
};

/// Region indexes within the FRBA.
pub mod region {
    pub const DESC: u64 = 0x00;
    pub const BIOS: u64 = 0x01;
    pub const ME: u64 = 0x02;
    pub const GBE: u64 = 0x03;
    pub const PLATFORM: u64 = 0x04;
    pub const DEVEXP: u64 = 0x05;
    pub const BIOS2: u64 = 0x06;
    pub const EC: u64 = 0x08;
    pub const IE: u64 = 0x0A;
    pub const TEN_GBE: u64 = 0x0B;
}

const REGION_NAMES: &[(u64, &str)] = &[
    (region::DESC, "desc"),
    (region::BIOS, "bios"),
    (region::ME, "me"),
    (region::GBE, "gbe"),
    (region::PLATFORM, "platform"),
    (region::DEVEXP, "devexp"),
    (region::BIOS2, "bios2"),
    (region::EC, "ec"),
    (region::IE, "ie"),
    (region::TEN_GBE, "10gbe"),
];

/// Masters with an access word in the FMBA, in FMBA order.
pub const MASTERS: [u64; 3] = [region::BIOS, region::ME, region::GBE];

/// Step used to scan the BIOS region for volumes.
pub const BIOS_SCAN_STEP: usize = 0x1000;

pub fn region_name(idx: u64) -> Option<&'static str> {
    REGION_NAMES.iter().find(|(known, _)| *known == idx).map(|(_, name)| *name)
}

pub fn region_from_name(name: &str) -> Option<u64> {
    REGION_NAMES.iter().find(|(_, known)| *known == name).map(|(idx, _)| *idx)
}

bitflags::bitflags! {
    /// Access a flash master has to a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IfdAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl IfdAccess {
    pub fn as_str(&self) -> &'static str {
        match (self.contains(IfdAccess::READ), self.contains(IfdAccess::WRITE)) {
            (false, false) => "--",
            (true, false) => "r-",
            (false, true) => "-w",
            (true, true) => "rw",
        }
    }
}

/// Decodes the access bits a master word grants to `region`.
///
/// Skylake and later index the bits by region (read at `region + 8`, write at `region + 20`); older
/// descriptors only describe the descriptor, BIOS, ME and GbE regions.
pub fn region_access(region: u64, flash_master: u32, is_skylake: bool) -> IfdAccess {
    let (bit_read, bit_write) = if is_skylake {
        (region + 8, region + 20)
    } else {
        match region {
            region::DESC => (16, 24),
            region::BIOS => (17, 25),
            region::ME => (18, 26),
            region::GBE => (19, 27),
            _ => return IfdAccess::empty(),
        }
    };
    let bit = |idx: u64| idx < 32 && (flash_master >> idx) & 0b1 != 0;
    let mut access = IfdAccess::empty();
    access.set(IfdAccess::READ, bit(bit_read));
    access.set(IfdAccess::WRITE, bit(bit_write));
    access
}

/// One region of a flash image.
#[derive(Debug, Clone, PartialEq)]
pub struct IfdRegion {
    node: FirmwareNode,
    access: [IfdAccess; 3],
}

impl IfdRegion {
    /// Creates an empty region at flash address `addr`.
    pub fn new(idx: u64, addr: u64) -> Self {
        let node = FirmwareNode { id: region_name(idx).map(str::to_string), idx, addr, ..FirmwareNode::default() };
        Self { node, access: [IfdAccess::empty(); 3] }
    }

    /// Creates a region holding opaque bytes.
    pub fn from_bytes(idx: u64, addr: u64, bytes: Vec<u8>) -> Self {
        let mut region = Self::new(idx, addr);
        region.node.size = bytes.len();
        region.node.set_bytes(bytes);
        region
    }

    pub fn is_bios(&self) -> bool {
        self.node.idx == region::BIOS
    }

    /// Access granted to the master owning `master` (one of [`MASTERS`]).
    pub fn access(&self, master: u64) -> Option<IfdAccess> {
        MASTERS.iter().position(|known| *known == master).map(|idx| self.access[idx])
    }

    pub(crate) fn set_access(&mut self, access: [IfdAccess; 3]) {
        self.access = access;
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.node.children().iter().filter_map(Firmware::as_volume)
    }

    pub fn add_volume(&mut self, volume: Volume) -> Result<()> {
        self.node.add_child(volume.into_firmware())
    }

    fn parse_volumes(&mut self, body: &[u8], ctx: &ParseContext) -> Result<()> {
        self.node.set_images_max(ctx.limits.bios_images_max);
        let volume_ctx = ctx.nested()?;
        let mut offset = 0;
        while offset < body.len() {
            if !Volume::check_magic(body, offset) {
                offset += BIOS_SCAN_STEP;
                continue;
            }
            match Volume::parse_at(body, offset, &volume_ctx) {
                Ok(volume) => {
                    log::debug!("BIOS volume at 0x{offset:x}, size 0x{:x}", volume.node().size);
                    let size = volume.node().size;
                    self.node.add_child(volume.into_firmware())?;
                    offset += size;
                }
                Err(err) => {
                    log::warn!("skipping BIOS offset 0x{offset:x}: {err}");
                    offset += BIOS_SCAN_STEP;
                }
            }
        }
        if !self.node.has_children() {
            Err(FirmwareError::invalid_data("no volumes found in BIOS region"))?;
        }
        Ok(())
    }
}

impl FirmwareCodec for IfdRegion {
    const KIND: FirmwareKind = FirmwareKind::IfdRegion;

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        (offset..buf.len()).step_by(BIOS_SCAN_STEP).any(|candidate| Volume::check_magic(buf, candidate))
    }

    /// Parses `buf` from `offset` to the end as a BIOS region located at flash address `offset`.
    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let body = buf
            .get(offset..)
            .ok_or_else(|| FirmwareError::invalid_data(format!("region offset 0x{offset:x} is out of range")))?;
        let mut bios = Self::new(region::BIOS, offset as u64);
        bios.node.offset = offset;
        bios.node.size = body.len();
        bios.parse_volumes(body, ctx)?;
        Ok(bios)
    }

    /// Serializes the region. Volumes go back to their parsed offsets and gaps are filled with erase
    /// bytes; the result is never shorter than the node size.
    fn write(&self) -> Result<Vec<u8>> {
        let mut buf = match self.node.payload() {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Children(children) => {
                let mut buf = Vec::new();
                for child in children {
                    let start = child.node().offset.max(buf.len());
                    buf.resize(start, ERASE_BYTE);
                    buf.extend(child.write()?);
                }
                buf
            }
        };
        if buf.len() < self.node.size {
            buf.resize(self.node.size, ERASE_BYTE);
        }
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        let mut tree = self.node.export(Self::KIND, flags);
        for (master, access) in MASTERS.iter().zip(self.access) {
            if let Some(name) = region_name(*master) {
                tree.set_label(&format!("access_{name}"), access.as_str());
            }
        }
        tree
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        let mut node = FirmwareNode::build(tree)?;
        if node.id.is_none() {
            node.id = region_name(node.idx).map(str::to_string);
        } else if tree.idx.is_none()
            && let Some(idx) = node.id.as_deref().and_then(region_from_name)
        {
            node.idx = idx;
        }
        Ok(Self { node, access: [IfdAccess::empty(); 3] })
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> Firmware {
        Firmware::IfdRegion(self)
    }
}
