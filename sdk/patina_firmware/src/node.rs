//! The firmware tree.
//!
//! Every concrete codec ([`Volume`], [`Filesystem`], [`File`], [`Section`], [`IfdImage`] and
//! [`IfdRegion`]) embeds a [`FirmwareNode`] holding identity and geometry plus either opaque bytes or an
//! ordered list of children, and implements [`FirmwareCodec`]. [`Firmware`] is the closed set of those
//! codecs and is what a node stores for each child.
//!
//! Parsing is top-down: a parent validates its own header, carves its body and hands the body to the
//! child codec it expects. Writing is bottom-up: children are serialized first and the parent wraps the
//! result with its own header.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::String, vec::Vec};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ExportFlags, ParseContext},
    error::{FirmwareError, Result},
    export::{Hex, NodeExport},
    file::File,
    filesystem::Filesystem,
    ifd::{IfdImage, IfdRegion},
    section::Section,
    volume::Volume,
};

/// Discriminates the concrete codec of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    #[default]
    Volume,
    Filesystem,
    File,
    Section,
    Ifd,
    IfdRegion,
}

impl FirmwareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirmwareKind::Volume => "volume",
            FirmwareKind::Filesystem => "filesystem",
            FirmwareKind::File => "file",
            FirmwareKind::Section => "section",
            FirmwareKind::Ifd => "ifd",
            FirmwareKind::IfdRegion => "ifd region",
        }
    }
}

/// Contents of a node: opaque bytes or an ordered list of children, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Children(Vec<Firmware>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

/// Identity, geometry and contents shared by every node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareNode {
    /// Identifier, frequently a GUID string.
    pub id: Option<String>,
    /// Numeric slot, e.g. the IFD region index.
    pub idx: u64,
    /// Position within the parent's stream.
    pub offset: usize,
    /// Validated declared length.
    pub size: usize,
    /// Power-of-two exponent the node is aligned to inside its parent.
    pub alignment: u8,
    /// Absolute flash address, where meaningful.
    pub addr: u64,
    pub version: Option<String>,
    pub version_raw: Option<u64>,
    pub(crate) payload: Payload,
    pub(crate) images_max: Option<usize>,
    pub(crate) size_max: Option<usize>,
}

impl FirmwareNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a node holding opaque bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { payload: Payload::Bytes(bytes), ..Self::default() }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The opaque bytes, or `None` when the node holds children.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Children(_) => None,
        }
    }

    /// Replaces the contents with opaque bytes, dropping any children.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.payload = Payload::Bytes(bytes);
    }

    /// Child nodes in order; empty for a node holding bytes.
    pub fn children(&self) -> &[Firmware] {
        match &self.payload {
            Payload::Bytes(_) => &[],
            Payload::Children(children) => children,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Firmware>> {
        match &mut self.payload {
            Payload::Bytes(_) => None,
            Payload::Children(children) => Some(children),
        }
    }

    pub fn has_children(&self) -> bool {
        matches!(&self.payload, Payload::Children(children) if !children.is_empty())
    }

    /// Limits how many children [`add_child`](Self::add_child) accepts.
    pub fn set_images_max(&mut self, images_max: usize) {
        self.images_max = Some(images_max);
    }

    /// Records the size ceiling the node was parsed under, enforced again on write.
    pub fn set_size_max(&mut self, size_max: usize) {
        self.size_max = Some(size_max);
    }

    pub fn size_max(&self) -> Option<usize> {
        self.size_max
    }

    /// Appends a child.
    ///
    /// A node still holding opaque bytes switches to holding children, which is only allowed while the
    /// bytes are empty.
    pub fn add_child(&mut self, child: Firmware) -> Result<()> {
        if let Payload::Bytes(bytes) = &self.payload {
            if !bytes.is_empty() {
                Err(FirmwareError::internal("cannot add a child to a node holding opaque data"))?;
            }
            self.payload = Payload::Children(Vec::new());
        }
        let images_max = self.images_max;
        if let Payload::Children(children) = &mut self.payload {
            if let Some(images_max) = images_max
                && children.len() >= images_max
            {
                Err(FirmwareError::invalid_file(format!("too many images, limit is {images_max}")))?;
            }
            children.push(child);
        }
        Ok(())
    }

    /// Finds a child by its numeric slot.
    pub fn child_by_idx(&self, idx: u64) -> Option<&Firmware> {
        self.children().iter().find(|child| child.node().idx == idx)
    }

    /// Finds a child by its identifier.
    pub fn child_by_id(&self, id: &str) -> Option<&Firmware> {
        self.children().iter().find(|child| child.node().id.as_deref() == Some(id))
    }

    /// Serializes the contents: the bytes, or every child placed at its alignment with `pad` filling gaps.
    pub fn write_payload(&self, pad: u8) -> Result<Vec<u8>> {
        match &self.payload {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Children(children) => {
                let mut buf = Vec::new();
                for child in children {
                    let aligned = align_up(buf.len(), child.node().alignment)?;
                    buf.resize(aligned, pad);
                    buf.extend(child.write()?);
                }
                Ok(buf)
            }
        }
    }

    /// Exports the shared fields, the payload and the children.
    pub fn export(&self, kind: FirmwareKind, flags: ExportFlags) -> NodeExport {
        let non_zero = |value: u64| (value != 0).then_some(Hex(value));
        let mut tree = NodeExport {
            kind,
            id: self.id.clone(),
            idx: non_zero(self.idx),
            size: non_zero(self.size as u64),
            alignment: non_zero(self.alignment as u64),
            addr: non_zero(self.addr),
            version: self.version.clone(),
            version_raw: self.version_raw.map(Hex),
            ..NodeExport::default()
        };
        if flags.contains(ExportFlags::INCLUDE_DEBUG) {
            tree.offset = Some(Hex(self.offset as u64));
        }
        match &self.payload {
            Payload::Bytes(bytes) => {
                if flags.contains(ExportFlags::INCLUDE_DATA) && !bytes.is_empty() {
                    tree.data = Some(hex::encode(bytes));
                }
            }
            Payload::Children(children) => {
                tree.children = children.iter().map(|child| child.export(flags)).collect();
            }
        }
        tree
    }

    /// Rebuilds the shared fields, the payload and the children from an exported tree.
    pub fn build(tree: &NodeExport) -> Result<Self> {
        let mut node = FirmwareNode {
            id: tree.id.clone(),
            idx: tree.idx.map_or(0, |hex| hex.0),
            offset: tree.offset.map_or(Ok(0), |hex| hex.to_usize("offset"))?,
            size: tree.size.map_or(Ok(0), |hex| hex.to_usize("size"))?,
            alignment: tree.alignment.map_or(Ok(0), |hex| hex.to_u8("alignment"))?,
            addr: tree.addr.map_or(0, |hex| hex.0),
            version: tree.version.clone(),
            version_raw: tree.version_raw.map(|hex| hex.0),
            ..FirmwareNode::default()
        };
        if let Some(data) = &tree.data {
            if !tree.children.is_empty() {
                Err(FirmwareError::invalid_data("a node cannot have both data and children"))?;
            }
            let bytes =
                hex::decode(data).map_err(|err| FirmwareError::invalid_data(format!("invalid hex data: {err}")))?;
            node.set_bytes(bytes);
        }
        for child in &tree.children {
            node.add_child(Firmware::build(child)?)?;
        }
        Ok(node)
    }
}

/// Rounds `value` up to a multiple of `1 << exponent`.
pub fn align_up(value: usize, exponent: u8) -> Result<usize> {
    if exponent >= usize::BITS as u8 {
        Err(FirmwareError::invalid_data(format!("alignment 2^{exponent} is too large")))?;
    }
    let mask = (1usize << exponent) - 1;
    value
        .checked_add(mask)
        .map(|value| value & !mask)
        .ok_or_else(|| FirmwareError::invalid_data(format!("0x{value:x} cannot be aligned to 2^{exponent}")))
}

/// Capabilities every concrete codec provides.
pub trait FirmwareCodec: Sized {
    const KIND: FirmwareKind;

    /// Stride used when searching forward for the magic; `None` for formats without one.
    const SEARCH_STEP: Option<usize> = None;

    /// Cheap sniff for the format at `offset`, without a full parse.
    fn check_magic(buf: &[u8], offset: usize) -> bool;

    /// Parses a node that starts exactly at `offset`.
    fn parse_at(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self>;

    /// Parses a node at `offset`, searching forward for the magic unless the context disables it.
    fn parse(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        let offset = locate::<Self>(buf, offset, ctx)?;
        Self::parse_at(buf, offset, ctx)
    }

    /// Serializes the node, recomputing every length and checksum.
    fn write(&self) -> Result<Vec<u8>>;

    /// Emits the diagnostic tree.
    fn export(&self, flags: ExportFlags) -> NodeExport;

    /// Rebuilds a node from a diagnostic tree.
    fn build(tree: &NodeExport) -> Result<Self>;

    fn node(&self) -> &FirmwareNode;

    fn node_mut(&mut self) -> &mut FirmwareNode;

    fn into_firmware(self) -> Firmware;
}

fn locate<C: FirmwareCodec>(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<usize> {
    let Some(step) = C::SEARCH_STEP else {
        return Ok(offset);
    };
    if ctx.no_search() || C::check_magic(buf, offset) {
        return Ok(offset);
    }
    let mut candidate = offset;
    while let Some(next) = candidate.checked_add(step)
        && next < buf.len()
    {
        if C::check_magic(buf, next) {
            log::debug!("found {} magic at 0x{:x}", C::KIND.as_str(), next);
            return Ok(next);
        }
        candidate = next;
    }
    Err(FirmwareError::invalid_data(format!("no {} magic found after 0x{offset:x}", C::KIND.as_str())))
}

/// A node of any concrete codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Firmware {
    Volume(Volume),
    Filesystem(Filesystem),
    File(File),
    Section(Section),
    Ifd(IfdImage),
    IfdRegion(IfdRegion),
}

macro_rules! dispatch {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Firmware::Volume($inner) => $body,
            Firmware::Filesystem($inner) => $body,
            Firmware::File($inner) => $body,
            Firmware::Section($inner) => $body,
            Firmware::Ifd($inner) => $body,
            Firmware::IfdRegion($inner) => $body,
        }
    };
}

impl Firmware {
    pub fn kind(&self) -> FirmwareKind {
        match self {
            Firmware::Volume(_) => FirmwareKind::Volume,
            Firmware::Filesystem(_) => FirmwareKind::Filesystem,
            Firmware::File(_) => FirmwareKind::File,
            Firmware::Section(_) => FirmwareKind::Section,
            Firmware::Ifd(_) => FirmwareKind::Ifd,
            Firmware::IfdRegion(_) => FirmwareKind::IfdRegion,
        }
    }

    /// Sniffs the outermost container type at `offset`.
    pub fn detect(buf: &[u8], offset: usize) -> Option<FirmwareKind> {
        if IfdImage::check_magic(buf, offset) {
            Some(FirmwareKind::Ifd)
        } else if Volume::check_magic(buf, offset) {
            Some(FirmwareKind::Volume)
        } else {
            None
        }
    }

    /// Parses a flash image or a volume, detecting which one `buf` holds.
    pub fn parse(buf: &[u8], offset: usize, ctx: &ParseContext) -> Result<Self> {
        match Self::detect(buf, offset) {
            Some(FirmwareKind::Ifd) => IfdImage::parse_at(buf, offset, ctx).map(Firmware::Ifd),
            _ => Volume::parse(buf, offset, ctx).map(Firmware::Volume),
        }
    }

    pub fn node(&self) -> &FirmwareNode {
        dispatch!(self, inner => inner.node())
    }

    pub fn node_mut(&mut self) -> &mut FirmwareNode {
        dispatch!(self, inner => inner.node_mut())
    }

    pub fn write(&self) -> Result<Vec<u8>> {
        dispatch!(self, inner => inner.write())
    }

    pub fn export(&self, flags: ExportFlags) -> NodeExport {
        dispatch!(self, inner => inner.export(flags))
    }

    /// Rebuilds a node of the kind named by the tree.
    pub fn build(tree: &NodeExport) -> Result<Self> {
        let firmware = match tree.kind {
            FirmwareKind::Volume => Volume::build(tree)?.into_firmware(),
            FirmwareKind::Filesystem => Filesystem::build(tree)?.into_firmware(),
            FirmwareKind::File => File::build(tree)?.into_firmware(),
            FirmwareKind::Section => Section::build(tree)?.into_firmware(),
            FirmwareKind::Ifd => IfdImage::build(tree)?.into_firmware(),
            FirmwareKind::IfdRegion => IfdRegion::build(tree)?.into_firmware(),
        };
        Ok(firmware)
    }

    pub fn as_volume(&self) -> Option<&Volume> {
        match self {
            Firmware::Volume(volume) => Some(volume),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&Filesystem> {
        match self {
            Firmware::Filesystem(filesystem) => Some(filesystem),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Firmware::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn as_section(&self) -> Option<&Section> {
        match self {
            Firmware::Section(section) => Some(section),
            _ => None,
        }
    }

    pub fn as_ifd(&self) -> Option<&IfdImage> {
        match self {
            Firmware::Ifd(ifd) => Some(ifd),
            _ => None,
        }
    }

    pub fn as_ifd_region(&self) -> Option<&IfdRegion> {
        match self {
            Firmware::IfdRegion(region) => Some(region),
            _ => None,
        }
    }
}
