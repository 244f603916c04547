//! Intel Flash Descriptor (IFD) parsing and composition.
//!
//! The descriptor lives in the first 4 KiB of a SPI flash image. The FDBAR at offset 0 holds three
//! descriptor-map words which encode the region, component and master counts together with the base
//! addresses of the other tables:
//!
//! | Table | Contents                                   | Base address              |
//! | ----- | ------------------------------------------ | ------------------------- |
//! | FCBA  | component parameters, illegal JEDEC words  | `(map0 << 4) & 0xFF0`     |
//! | FRBA  | one base/limit register per region         | `(map0 >> 12) & 0xFF0`    |
//! | FMBA  | one access word per master                 | `(map1 << 4) & 0xFF0`     |
//!
//! Each present region is carved into an [`IfdRegion`]; the BIOS region is further decoded as a
//! sequence of firmware volumes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
mod flash_region;

pub use flash_region::{
    BIOS_SCAN_STEP, IfdAccess, IfdRegion, MASTERS, region, region_access, region_from_name, region_name,
};

use alloc::{format, vec::Vec};
use scroll::{LE, Pread, Pwrite};

use crate::{
    config::{ExportFlags, ParseContext},
    error::{FirmwareError, Result, ResultExt},
    export::NodeExport,
    filesystem::ERASE_BYTE,
    node::{Firmware, FirmwareCodec, FirmwareKind, FirmwareNode},
    structs::binary_struct,
};

/// Size of the descriptor region; images must be larger than this.
pub const DESCRIPTOR_SIZE: usize = 0x1000;
pub const SIGNATURE: u32 = 0x0FF0_A55A;
/// Region count used when the descriptor encodes zero.
pub const REGION_COUNT_MAX: usize = 10;

const REGION_BASE_ABSENT: u32 = 0x7FF_F000;
const REGION_GRANULARITY: usize = 0x1000;

binary_struct! {
    /// Flash descriptor signature and map.
    pub struct Fdbar: LE {
        reserved: [u8; 16] = constant([0xFF; 16]),
        signature: u32 = constant(SIGNATURE),
        descriptor_map0: u32,
        descriptor_map1: u32,
        descriptor_map2: u32,
    }
}

binary_struct! {
    /// Flash component table.
    pub struct Fcba: LE {
        flcomp: u32,
        flill: u32,
        flill1: u32,
    }
}

binary_struct! {
    /// Flash master table.
    pub struct Fmba: LE {
        flmstr1: u32,
        flmstr2: u32,
        flmstr3: u32,
    }
}

fn freg_base(flreg: u32) -> usize {
    ((flreg << 12) & 0x07FF_F000) as usize
}

fn freg_limit(flreg: u32) -> usize {
    (((flreg >> 4) & 0x07FF_F000) | 0xFFF) as usize
}

fn flreg(base: u32, limit: u32) -> u32 {
    ((limit << 4) & 0xFFFF_0000) | (base >> 12)
}

/// A base address stored in a descriptor map as bits 4..11.
fn map_base(name: &str, addr: usize) -> Result<u32> {
    if addr & !0xFF0 != 0 {
        Err(FirmwareError::invalid_data(format!("{name} 0x{addr:x} cannot be encoded in the descriptor map")))?;
    }
    Ok((addr >> 4) as u32)
}

/// A whole flash image: descriptor tables plus the regions they describe.
#[derive(Debug, Clone, PartialEq)]
pub struct IfdImage {
    node: FirmwareNode,
    descriptor_map0: u32,
    descriptor_map1: u32,
    descriptor_map2: u32,
    num_regions: usize,
    num_components: u32,
    flash_region_base_addr: usize,
    flash_component_base_addr: usize,
    flash_master_base_addr: usize,
    flash_ich_strap_base_addr: usize,
    flash_mch_strap_base_addr: usize,
    components_rcd: u32,
    illegal_jedec: u32,
    illegal_jedec1: u32,
    flash_master: [u32; 3],
    is_skylake: bool,
}

impl Default for IfdImage {
    fn default() -> Self {
        Self::new()
    }
}

impl IfdImage {
    /// An image with the table layout of a current descriptor and no regions.
    pub fn new() -> Self {
        Self {
            node: FirmwareNode::new(),
            descriptor_map0: 0,
            descriptor_map1: 0,
            descriptor_map2: 0,
            num_regions: REGION_COUNT_MAX,
            num_components: 0,
            flash_region_base_addr: 0x40,
            flash_component_base_addr: 0x30,
            flash_master_base_addr: 0x80,
            flash_ich_strap_base_addr: 0x100,
            flash_mch_strap_base_addr: 0x300,
            components_rcd: 0,
            illegal_jedec: 0,
            illegal_jedec1: 0,
            flash_master: [0x00A0_0F00, 0x0040_0D00, 0x0080_0900],
            is_skylake: true,
        }
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn num_components(&self) -> u32 {
        self.num_components
    }

    pub fn flash_region_base_addr(&self) -> usize {
        self.flash_region_base_addr
    }

    pub fn flash_component_base_addr(&self) -> usize {
        self.flash_component_base_addr
    }

    pub fn flash_master_base_addr(&self) -> usize {
        self.flash_master_base_addr
    }

    pub fn flash_ich_strap_base_addr(&self) -> usize {
        self.flash_ich_strap_base_addr
    }

    pub fn flash_mch_strap_base_addr(&self) -> usize {
        self.flash_mch_strap_base_addr
    }

    pub fn components_rcd(&self) -> u32 {
        self.components_rcd
    }

    /// Both illegal JEDEC words, `flill1` in the upper half.
    pub fn illegal_jedec(&self) -> u64 {
        ((self.illegal_jedec1 as u64) << 32) | self.illegal_jedec as u64
    }

    pub fn set_illegal_jedec(&mut self, illegal_jedec: u64) {
        self.illegal_jedec = illegal_jedec as u32;
        self.illegal_jedec1 = (illegal_jedec >> 32) as u32;
    }

    /// Access word of `master` (one of [`MASTERS`]).
    pub fn flash_master(&self, master: u64) -> Option<u32> {
        MASTERS.iter().position(|known| *known == master).map(|idx| self.flash_master[idx])
    }

    pub fn set_flash_master(&mut self, master: u64, value: u32) -> Result<()> {
        let idx = MASTERS
            .iter()
            .position(|known| *known == master)
            .ok_or_else(|| FirmwareError::invalid_data(format!("region {master} is not a flash master")))?;
        self.flash_master[idx] = value;
        Ok(())
    }

    pub fn is_skylake(&self) -> bool {
        self.is_skylake
    }

    pub fn set_skylake(&mut self, is_skylake: bool) {
        self.is_skylake = is_skylake;
    }

    /// True unless `cmd` is one of the eight illegal JEDEC command slots.
    pub fn check_jedec_cmd(&self, cmd: u8) -> bool {
        (0..32).step_by(8).all(|shift| {
            ((self.illegal_jedec >> shift) & 0xFF) as u8 != cmd && ((self.illegal_jedec1 >> shift) & 0xFF) as u8 != cmd
        })
    }

    pub fn regions(&self) -> impl Iterator<Item = &IfdRegion> {
        self.node.children().iter().filter_map(Firmware::as_ifd_region)
    }

    pub fn region(&self, idx: u64) -> Option<&IfdRegion> {
        self.node.child_by_idx(idx).and_then(Firmware::as_ifd_region)
    }

    pub fn add_region(&mut self, region: IfdRegion) -> Result<()> {
        self.node.add_child(region.into_firmware())
    }

    /// Access `master` has to region `idx` under the current layout.
    pub fn access(&self, idx: u64, master: u64) -> Option<IfdAccess> {
        self.flash_master(master).map(|word| region_access(idx, word, self.is_skylake))
    }

    fn set_descriptor_maps(&mut self, map0: u32, map1: u32, map2: u32) {
        self.descriptor_map0 = map0;
        self.descriptor_map1 = map1;
        self.descriptor_map2 = map2;
        self.num_regions = match (map0 >> 24) & 0b111 {
            0 => REGION_COUNT_MAX,
            count => count as usize,
        };
        self.num_components = (map0 >> 8) & 0b11;
        self.flash_component_base_addr = ((map0 << 4) & 0xFF0) as usize;
        self.flash_region_base_addr = ((map0 >> 12) & 0xFF0) as usize;
        self.flash_master_base_addr = ((map1 << 4) & 0xFF0) as usize;
        self.flash_ich_strap_base_addr = ((map1 >> 12) & 0xFF0) as usize;
        self.flash_mch_strap_base_addr = ((map2 << 4) & 0xFF0) as usize;
    }

    /// The descriptor-map words with every decoded field folded back in.
    pub fn descriptor_maps(&self) -> Result<[u32; 3]> {
        let num_regions = match self.num_regions {
            REGION_COUNT_MAX => 0,
            count @ 1..=7 => count as u32,
            count => Err(FirmwareError::invalid_data(format!("{count} regions cannot be encoded")))?,
        };
        let map0 = (self.descriptor_map0 & 0xF800_FC00)
            | map_base("FCBA", self.flash_component_base_addr)?
            | ((self.num_components & 0b11) << 8)
            | (map_base("FRBA", self.flash_region_base_addr)? << 16)
            | (num_regions << 24);
        let map1 = (self.descriptor_map1 & 0xFF00_FF00)
            | map_base("FMBA", self.flash_master_base_addr)?
            | (map_base("FISBA", self.flash_ich_strap_base_addr)? << 16);
        let map2 = (self.descriptor_map2 & 0xFFFF_FF00) | map_base("FMSBA", self.flash_mch_strap_base_addr)?;
        Ok([map0, map1, map2])
    }
}

impl FirmwareCodec for IfdImage {
    const KIND: FirmwareKind = FirmwareKind::Ifd;

    fn check_magic(buf: &[u8], offset: usize) -> bool {
        Fdbar::validate(buf, offset).is_ok()
    }

    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let image = buf
            .get(offset..)
            .ok_or_else(|| FirmwareError::invalid_data(format!("image offset 0x{offset:x} is out of range")))?;
        if image.len() <= DESCRIPTOR_SIZE {
            Err(FirmwareError::internal(format!("file is too small, expected more than 0x{DESCRIPTOR_SIZE:x} bytes")))?;
        }

        let fdbar = Fdbar::parse(image, 0)?;
        let mut ifd = IfdImage::new();
        ifd.set_descriptor_maps(fdbar.descriptor_map0, fdbar.descriptor_map1, fdbar.descriptor_map2);
        ifd.node.offset = offset;
        ifd.node.size = image.len();

        let fcba = Fcba::parse(image, ifd.flash_component_base_addr).context("failed to parse FCBA")?;
        ifd.components_rcd = fcba.flcomp;
        ifd.illegal_jedec = fcba.flill;
        ifd.illegal_jedec1 = fcba.flill1;

        let fmba = Fmba::parse(image, ifd.flash_master_base_addr).context("failed to parse FMBA")?;
        ifd.flash_master = [fmba.flmstr1, fmba.flmstr2, fmba.flmstr3];

        let region_ctx = ctx.nested()?;
        for idx in 0..ifd.num_regions {
            let reg: u32 = image.pread_with(ifd.flash_region_base_addr + idx * 4, LE)?;
            let (base, limit) = (freg_base(reg), freg_limit(reg));
            let idx = idx as u64;
            let name = region_name(idx).unwrap_or("unknown");
            if base > limit {
                log::debug!("region {name} is absent");
                continue;
            }
            if limit >= image.len() {
                Err(FirmwareError::invalid_data(format!(
                    "region {name} 0x{base:x}..0x{limit:x} exceeds image of 0x{:x}",
                    image.len()
                )))?;
            }
            log::debug!("region {name} 0x{base:x} -> 0x{limit:x}");

            let mut region = if idx == region::BIOS {
                IfdRegion::parse_at(&image[..=limit], base, &region_ctx).context("failed to parse BIOS region")?
            } else {
                let mut region = IfdRegion::from_bytes(idx, base as u64, image[base..=limit].to_vec());
                region.node_mut().offset = base;
                region
            };
            region.set_access(ifd.flash_master.map(|word| region_access(idx, word, ifd.is_skylake)));
            ifd.node.add_child(region.into_firmware())?;
        }
        Ok(ifd)
    }

    fn write(&self) -> Result<Vec<u8>> {
        let mut blobs = Vec::new();
        for region in self.regions() {
            let mut bytes = region.write()?;
            let addr = usize::try_from(region.node().addr)
                .map_err(|_| FirmwareError::invalid_data("region address is too large"))?;
            if addr % REGION_GRANULARITY != 0 {
                Err(FirmwareError::invalid_data(format!("region address 0x{addr:x} is not 4 KiB aligned")))?;
            }
            if bytes.is_empty() {
                Err(FirmwareError::invalid_data(format!("region at 0x{addr:x} is empty")))?;
            }
            bytes.resize(bytes.len().next_multiple_of(REGION_GRANULARITY), ERASE_BYTE);
            blobs.push((region.node().idx, addr, bytes));
        }
        if !blobs.iter().any(|(idx, _, _)| *idx == region::DESC) {
            blobs.insert(0, (region::DESC, 0, alloc::vec![0; DESCRIPTOR_SIZE]));
        }

        let size = blobs.iter().map(|(_, addr, bytes)| addr + bytes.len()).max().unwrap_or(DESCRIPTOR_SIZE);
        let mut buf = alloc::vec![ERASE_BYTE; size.max(DESCRIPTOR_SIZE)];
        blobs.sort_by_key(|(idx, _, _)| *idx != region::DESC);
        for (_, addr, bytes) in &blobs {
            buf[*addr..*addr + bytes.len()].copy_from_slice(bytes);
        }

        let [descriptor_map0, descriptor_map1, descriptor_map2] = self.descriptor_maps()?;
        Fdbar { descriptor_map0, descriptor_map1, descriptor_map2, ..Fdbar::default() }.write_into(&mut buf, 0)?;
        Fcba { flcomp: self.components_rcd, flill: self.illegal_jedec, flill1: self.illegal_jedec1 }
            .write_into(&mut buf, self.flash_component_base_addr)?;
        let [flmstr1, flmstr2, flmstr3] = self.flash_master;
        Fmba { flmstr1, flmstr2, flmstr3 }.write_into(&mut buf, self.flash_master_base_addr)?;

        for idx in 0..self.num_regions {
            let (base, limit) = match blobs.iter().find(|(region, _, _)| *region == idx as u64) {
                Some((_, addr, bytes)) => (*addr as u32, (addr + bytes.len() - 1) as u32),
                None => (REGION_BASE_ABSENT, 0),
            };
            let flreg = flreg(base, limit);
            log::debug!("region {idx} 0x{base:x} -> 0x{limit:x} = 0x{flreg:08x}");
            buf.pwrite_with(flreg, self.flash_region_base_addr + idx * 4, LE)?;
        }
        Ok(buf)
    }

    fn export(&self, flags: ExportFlags) -> NodeExport {
        let mut tree = self.node.export(Self::KIND, flags);
        if let Ok([map0, map1, map2]) = self.descriptor_maps() {
            tree.set_field("descriptor_map0", map0 as u64);
            tree.set_field("descriptor_map1", map1 as u64);
            tree.set_field("descriptor_map2", map2 as u64);
        }
        tree.set_field("num_regions", self.num_regions as u64);
        tree.set_field("num_components", self.num_components as u64 + 1);
        tree.set_field("flash_region_base_addr", self.flash_region_base_addr as u64);
        tree.set_field("flash_component_base_addr", self.flash_component_base_addr as u64);
        tree.set_field("flash_master_base_addr", self.flash_master_base_addr as u64);
        tree.set_field("flash_ich_strap_base_addr", self.flash_ich_strap_base_addr as u64);
        tree.set_field("flash_mch_strap_base_addr", self.flash_mch_strap_base_addr as u64);
        tree.set_field("components_rcd", self.components_rcd as u64);
        tree.set_field("illegal_jedec", self.illegal_jedec());
        for (master, word) in MASTERS.iter().zip(self.flash_master) {
            if let Some(name) = region_name(*master) {
                tree.set_field(&format!("flash_master_{name}"), word as u64);
            }
        }
        tree.set_field("is_skylake", self.is_skylake as u64);
        tree
    }

    fn build(tree: &NodeExport) -> Result<Self> {
        let mut ifd = IfdImage::new();
        ifd.node = FirmwareNode::build(tree)?;
        let map = |name: &str, default: u32| tree.field(name).map_or(Ok(default), |hex| hex.to_u32(name));
        let [map0, map1, map2] = ifd.descriptor_maps()?;
        if tree.field("descriptor_map0").is_some()
            || tree.field("descriptor_map1").is_some()
            || tree.field("descriptor_map2").is_some()
        {
            ifd.set_descriptor_maps(
                map("descriptor_map0", map0)?,
                map("descriptor_map1", map1)?,
                map("descriptor_map2", map2)?,
            );
        }
        ifd.components_rcd = map("components_rcd", 0)?;
        if let Some(illegal_jedec) = tree.field("illegal_jedec") {
            ifd.set_illegal_jedec(illegal_jedec.0);
        }
        for master in MASTERS {
            if let Some(name) = region_name(master)
                && let Some(word) = tree.field(&format!("flash_master_{name}"))
            {
                ifd.set_flash_master(master, word.to_u32("flash_master")?)?;
            }
        }
        if let Some(is_skylake) = tree.field("is_skylake") {
            ifd.is_skylake = is_skylake.0 != 0;
        }
        for child in ifd.node.children() {
            if child.as_ifd_region().is_none() {
                Err(FirmwareError::invalid_data(format!("an IFD image cannot hold a {}", child.kind().as_str())))?;
            }
        }
        Ok(ifd)
    }

    fn node(&self) -> &FirmwareNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut FirmwareNode {
        &mut self.node
    }

    fn into_firmware(self) -> Firmware {
        Firmware::Ifd(self)
    }
}
