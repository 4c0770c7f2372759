// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISOBMFF box tree.
//!
//! Boxes are parsed into a closed [`BoxKind`] variant plus an ordered child
//! list. The generic reader parses a header, hands the concrete parser a
//! child range spanning exactly the box content, and advances the parent
//! range past the box end no matter how much the parser consumed.
//!
//! See ISO 14496-12:2015 § 4.2 for the box grammar and ISO/IEC 23008-12:2017
//! for the image-item boxes.

use std::fmt::Write as _;

use fallible_collections::TryVec;
use log::debug;

use crate::bitstream::{BitstreamRange, TryString};
use crate::error::{Error, ErrorCode, Result, SubError};

pub(crate) const MAX_CHILDREN_PER_BOX: usize = 1024;
pub(crate) const MAX_ILOC_ITEMS: usize = 1024;
pub(crate) const MAX_ILOC_EXTENTS_PER_ITEM: usize = 32;
/// Cumulative cap on bytes materialized for a single item.
pub(crate) const MAX_MEMORY_BLOCK_SIZE: u64 = 50 * 1024 * 1024;

/// Four-character code identifying a box or reference type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const META: Self = Self(*b"meta");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const PITM: Self = Self(*b"pitm");
    pub const ILOC: Self = Self(*b"iloc");
    pub const IINF: Self = Self(*b"iinf");
    pub const INFE: Self = Self(*b"infe");
    pub const IPRP: Self = Self(*b"iprp");
    pub const IPCO: Self = Self(*b"ipco");
    pub const IPMA: Self = Self(*b"ipma");
    pub const ISPE: Self = Self(*b"ispe");
    pub const AUXC: Self = Self(*b"auxC");
    pub const IROT: Self = Self(*b"irot");
    pub const IMIR: Self = Self(*b"imir");
    pub const CLAP: Self = Self(*b"clap");
    pub const IREF: Self = Self(*b"iref");
    pub const HVCC: Self = Self(*b"hvcC");
    pub const IDAT: Self = Self(*b"idat");
    pub const GRPL: Self = Self(*b"grpl");
    pub const DINF: Self = Self(*b"dinf");
    pub const DREF: Self = Self(*b"dref");
    pub const URL: Self = Self(*b"url ");
    pub const UUID: Self = Self(*b"uuid");

    pub const HVC1: Self = Self(*b"hvc1");
    pub const GRID: Self = Self(*b"grid");
    pub const IDEN: Self = Self(*b"iden");
    pub const IOVL: Self = Self(*b"iovl");
    pub const EXIF: Self = Self(*b"Exif");
    pub const MIME: Self = Self(*b"mime");
    pub const URI: Self = Self(*b"uri ");

    pub const HEIC: Self = Self(*b"heic");
    pub const PICT: Self = Self(*b"pict");

    pub const THMB: Self = Self(*b"thmb");
    pub const AUXL: Self = Self(*b"auxl");
    pub const CDSC: Self = Self(*b"cdsc");
    pub const DIMG: Self = Self(*b"dimg");

    fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCC({self})")
    }
}

/// Exact rational used by the clean-aperture arithmetic. Intermediate sums
/// are carried on `i64` so 32-bit wire values never lose precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: i64,
    pub denominator: i64,
}

impl Fraction {
    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn round_down(self) -> i64 {
        if self.denominator == 0 {
            return 0;
        }
        self.numerator.div_euclid(self.denominator)
    }

    pub fn round_up(self) -> i64 {
        if self.denominator == 0 {
            return 0;
        }
        (self.numerator + self.denominator - 1).div_euclid(self.denominator)
    }

    pub fn round(self) -> i64 {
        if self.denominator == 0 {
            return 0;
        }
        (self.numerator + self.denominator / 2).div_euclid(self.denominator)
    }
}

impl std::ops::Add for Fraction {
    type Output = Fraction;

    fn add(self, b: Fraction) -> Fraction {
        if self.denominator == b.denominator {
            Fraction::new(self.numerator + b.numerator, self.denominator)
        } else {
            Fraction::new(
                self.numerator * b.denominator + b.numerator * self.denominator,
                self.denominator * b.denominator,
            )
        }
    }
}

impl std::ops::Sub for Fraction {
    type Output = Fraction;

    fn sub(self, b: Fraction) -> Fraction {
        if self.denominator == b.denominator {
            Fraction::new(self.numerator - b.numerator, self.denominator)
        } else {
            Fraction::new(
                self.numerator * b.denominator - b.numerator * self.denominator,
                self.denominator * b.denominator,
            )
        }
    }
}

impl std::ops::Sub<i64> for Fraction {
    type Output = Fraction;

    fn sub(self, v: i64) -> Fraction {
        Fraction::new(self.numerator - v * self.denominator, self.denominator)
    }
}

impl std::ops::Div<i64> for Fraction {
    type Output = Fraction;

    fn div(self, v: i64) -> Fraction {
        Fraction::new(self.numerator, self.denominator * v)
    }
}

/// Parsed box header.
///
/// `header_size` is the number of bytes already consumed for the header, so
/// the content length is `size - header_size` (a `size` of 0 means the box
/// extends to the end of the file).
#[derive(Debug, Clone)]
pub struct BoxHeader {
    pub size: u64,
    pub box_type: FourCC,
    pub header_size: u32,
    pub uuid: Option<[u8; 16]>,
}

/// Box size value meaning "extends to the end of the file".
pub const SIZE_UNTIL_END_OF_FILE: u64 = 0;

impl BoxHeader {
    pub fn parse(range: &mut BitstreamRange<'_>) -> Result<Self> {
        let size32 = range.read32();
        let box_type = FourCC::from_u32(range.read32());
        let mut header_size = 8u32;

        let size = if size32 == 1 {
            let high = u64::from(range.read32());
            let low = u64::from(range.read32());
            header_size += 8;
            (high << 32) | low
        } else {
            u64::from(size32)
        };

        let uuid = if box_type == FourCC::UUID {
            header_size += 16;
            let mut uuid = [0u8; 16];
            if range.read(16) {
                for b in &mut uuid {
                    *b = range.read8();
                }
            }
            Some(uuid)
        } else {
            None
        };

        range.get_error()?;

        Ok(Self {
            size,
            box_type,
            header_size,
            uuid,
        })
    }
}

/// Read the extra (version, flags) word of a full box.
pub(crate) fn read_fullbox_extra(range: &mut BitstreamRange<'_>) -> (u8, u32) {
    let word = range.read32();
    ((word >> 24) as u8, word & 0x00FF_FFFF)
}

// --- concrete box payloads ---------------------------------------------

/// File type box 'ftyp'. See ISO 14496-12:2015 § 4.3
#[derive(Debug)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    pub fn has_compatible_brand(&self, brand: FourCC) -> bool {
        self.compatible_brands.iter().any(|&b| b == brand)
    }
}

/// Handler reference box 'hdlr'. See ISO 14496-12:2015 § 8.4.3
#[derive(Debug)]
pub struct HandlerBox {
    pub handler_type: FourCC,
    pub name: TryString,
}

/// Primary item box 'pitm'. See ISO 14496-12:2015 § 8.11.4
#[derive(Debug)]
pub struct PrimaryItemBox {
    pub item_id: u32,
}

/// One extent of an 'iloc' item.
#[derive(Debug, Clone, Copy, Default)]
pub struct IlocExtent {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

/// One item entry of an 'iloc' box.
#[derive(Debug)]
pub struct IlocItem {
    pub item_id: u32,
    /// 0 = file offsets, 1 = offsets into 'idat'.
    pub construction_method: u8,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<IlocExtent>,
}

/// Item location box 'iloc'. See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
pub struct ItemLocationBox {
    pub items: TryVec<IlocItem>,
}

impl ItemLocationBox {
    pub fn item_by_id(&self, item_id: u32) -> Option<&IlocItem> {
        self.items.iter().find(|item| item.item_id == item_id)
    }
}

/// Item info entry 'infe'. See ISO 14496-12:2015 § 8.11.6.2
#[derive(Debug)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    pub item_protection_index: u16,
    /// Absent for version ≤ 1, where HEVC is implied.
    pub item_type: Option<FourCC>,
    pub item_name: TryString,
    pub content_type: TryString,
    pub content_encoding: TryString,
    pub item_uri_type: TryString,
    pub hidden: bool,
}

impl ItemInfoEntry {
    /// The effective item type; version ≤ 1 entries imply 'hvc1'.
    pub fn effective_item_type(&self) -> FourCC {
        self.item_type.unwrap_or(FourCC::HVC1)
    }
}

/// One (property index, essential) association of an 'ipma' entry.
#[derive(Debug, Clone, Copy)]
pub struct PropertyAssociation {
    pub property_index: u16,
    pub essential: bool,
}

#[derive(Debug)]
pub struct IpmaEntry {
    pub item_id: u32,
    pub associations: TryVec<PropertyAssociation>,
}

/// Item property association box 'ipma'. See ISO/IEC 23008-12:2017 § 9.3.2
#[derive(Debug)]
pub struct ItemPropertyAssociationBox {
    pub entries: TryVec<IpmaEntry>,
}

impl ItemPropertyAssociationBox {
    pub fn associations_for_item(&self, item_id: u32) -> Option<&[PropertyAssociation]> {
        self.entries
            .iter()
            .find(|entry| entry.item_id == item_id)
            .map(|entry| &*entry.associations)
    }
}

/// Image spatial extents property 'ispe'. See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, Clone, Copy)]
pub struct ImageSpatialExtentsBox {
    pub width: u32,
    pub height: u32,
}

/// Auxiliary type property 'auxC'. See ISO/IEC 23008-12:2017 § 6.5.8
#[derive(Debug)]
pub struct AuxiliaryTypeBox {
    pub aux_type: TryString,
    pub aux_subtypes: TryVec<u8>,
}

/// Image rotation property 'irot'; degrees counter-clockwise.
#[derive(Debug, Clone, Copy)]
pub struct ImageRotation {
    pub rotation: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAxis {
    /// Flip the rows (top row becomes the bottom row).
    Horizontal,
    /// Flip the columns.
    Vertical,
}

/// Image mirroring property 'imir'.
#[derive(Debug, Clone, Copy)]
pub struct ImageMirror {
    pub axis: MirrorAxis,
}

/// Clean aperture property 'clap'. See ISO 14496-12:2015 § 12.1.4
#[derive(Debug, Clone, Copy)]
pub struct CleanApertureBox {
    pub clean_aperture_width: Fraction,
    pub clean_aperture_height: Fraction,
    pub horizontal_offset: Fraction,
    pub vertical_offset: Fraction,
}

impl CleanApertureBox {
    // left = horiz_off + (image_width-1)/2 - (clap_width-1)/2

    pub fn left_rounded(&self, image_width: i64) -> i64 {
        let pc_x = self.horizontal_offset + Fraction::new(image_width - 1, 2);
        (pc_x - (self.clean_aperture_width - 1) / 2).round()
    }

    pub fn right_rounded(&self, image_width: i64) -> i64 {
        let pc_x = self.horizontal_offset + Fraction::new(image_width - 1, 2);
        (pc_x + (self.clean_aperture_width - 1) / 2).round()
    }

    pub fn top_rounded(&self, image_height: i64) -> i64 {
        let pc_y = self.vertical_offset + Fraction::new(image_height - 1, 2);
        (pc_y - (self.clean_aperture_height - 1) / 2).round()
    }

    pub fn bottom_rounded(&self, image_height: i64) -> i64 {
        let pc_y = self.vertical_offset + Fraction::new(image_height - 1, 2);
        (pc_y + (self.clean_aperture_height - 1) / 2).round()
    }

    pub fn width_rounded(&self) -> i64 {
        let left = (Fraction::new(0, 1) - (self.clean_aperture_width - 1) / 2).round();
        let right = ((self.clean_aperture_width - 1) / 2).round();
        right + 1 - left
    }

    pub fn height_rounded(&self) -> i64 {
        let top = (Fraction::new(0, 1) - (self.clean_aperture_height - 1) / 2).round();
        let bottom = ((self.clean_aperture_height - 1) / 2).round();
        bottom + 1 - top
    }
}

/// One typed reference record of an 'iref' box.
#[derive(Debug)]
pub struct SingleItemTypeReference {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: TryVec<u32>,
}

/// Item reference box 'iref'. See ISO 14496-12:2015 § 8.11.12
#[derive(Debug)]
pub struct ItemReferenceBox {
    pub references: TryVec<SingleItemTypeReference>,
}

impl ItemReferenceBox {
    /// Type of the first outgoing reference of `item_id`, if any.
    pub fn reference_type(&self, item_id: u32) -> Option<FourCC> {
        self.references
            .iter()
            .find(|r| r.from_item_id == item_id)
            .map(|r| r.reference_type)
    }

    /// Targets of the first outgoing reference of `item_id`.
    pub fn references_from(&self, item_id: u32) -> &[u32] {
        self.references
            .iter()
            .find(|r| r.from_item_id == item_id)
            .map_or(&[], |r| &*r.to_item_ids)
    }
}

#[derive(Debug)]
pub struct NalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    pub nal_units: TryVec<TryVec<u8>>,
}

/// HEVC decoder configuration record 'hvcC'. See ISO/IEC 14496-15 § 8.3.3
#[derive(Debug)]
pub struct HevcConfigurationBox {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: [bool; 48],
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    /// NALU length field size in bytes (1..=4).
    pub length_size: u8,
    pub nal_arrays: TryVec<NalArray>,
}

impl HevcConfigurationBox {
    /// Append the parameter-set NAL units, each prefixed with a 4-byte
    /// big-endian length (HVCC framing), to `dest`.
    pub fn get_headers(&self, dest: &mut TryVec<u8>) -> Result<()> {
        for array in &self.nal_arrays {
            for unit in &array.nal_units {
                let len = unit.len() as u32;
                dest.extend_from_slice(&len.to_be_bytes())?;
                dest.extend_from_slice(unit)?;
            }
        }
        Ok(())
    }
}

/// Item data box 'idat'; only the byte range within the file is recorded.
#[derive(Debug, Clone, Copy)]
pub struct ItemDataBox {
    pub data_start: u64,
    pub data_len: u64,
}

#[derive(Debug)]
pub struct EntityGroup {
    pub group_type: FourCC,
    pub group_id: u32,
    pub entity_ids: TryVec<u32>,
}

/// Groups list box 'grpl'. See ISO 14496-12:2015 § 8.18
#[derive(Debug)]
pub struct EntityGroupListBox {
    pub entity_groups: TryVec<EntityGroup>,
}

/// Data reference box 'dref'. See ISO 14496-12:2015 § 8.7.2
#[derive(Debug)]
pub struct DataReferenceBox {
    pub entry_count: u32,
}

/// Data entry box 'url '. See ISO 14496-12:2015 § 8.7.2
#[derive(Debug)]
pub struct DataEntryUrlBox {
    pub location: TryString,
}

// --- the tagged tree ----------------------------------------------------

#[derive(Debug)]
pub enum BoxKind {
    FileType(FileTypeBox),
    Meta,
    Handler(HandlerBox),
    PrimaryItem(PrimaryItemBox),
    ItemLocation(ItemLocationBox),
    ItemInfo,
    ItemInfoEntry(ItemInfoEntry),
    ItemProperties,
    ItemPropertyContainer,
    ItemPropertyAssociation(ItemPropertyAssociationBox),
    ImageSpatialExtents(ImageSpatialExtentsBox),
    AuxiliaryType(AuxiliaryTypeBox),
    ImageRotation(ImageRotation),
    ImageMirror(ImageMirror),
    CleanAperture(CleanApertureBox),
    ItemReference(ItemReferenceBox),
    HevcConfiguration(HevcConfigurationBox),
    ItemData(ItemDataBox),
    EntityGroupList(EntityGroupListBox),
    DataInformation,
    DataReference(DataReferenceBox),
    DataEntryUrl(DataEntryUrlBox),
    Unknown,
}

/// A parsed box: header, typed payload and ordered children.
#[derive(Debug)]
pub struct BmffBox {
    pub header: BoxHeader,
    pub kind: BoxKind,
    pub children: TryVec<BmffBox>,
}

impl BmffBox {
    /// Read one box from `range`, advancing `range` past the box end
    /// whether or not the concrete parser consumed all of its content.
    pub fn read(range: &mut BitstreamRange<'_>) -> Result<BmffBox> {
        let header = BoxHeader::parse(range)?;

        if header.size != SIZE_UNTIL_END_OF_FILE && header.size < u64::from(header.header_size) {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::InvalidBoxSize,
                format!(
                    "Box size ({} bytes) smaller than header size ({} bytes)",
                    header.size, header.header_size
                ),
            ));
        }

        let content_len = if header.size == SIZE_UNTIL_END_OF_FILE {
            range.remaining()
        } else {
            header.size - u64::from(header.header_size)
        };

        let mut content = range.child(content_len);
        let box_end = content.end_position();
        let result = parse_box_kind(&header, &mut content);
        range.set_position(box_end);

        let (kind, children) = result?;
        Ok(BmffBox {
            header,
            kind,
            children,
        })
    }

    /// First child with the given box type; linear scan.
    pub fn child_box(&self, box_type: FourCC) -> Option<&BmffBox> {
        self.children.iter().find(|b| b.header.box_type == box_type)
    }

    pub fn child_boxes(&self, box_type: FourCC) -> impl Iterator<Item = &BmffBox> {
        self.children
            .iter()
            .filter(move |b| b.header.box_type == box_type)
    }

    /// Read boxes until the range is exhausted, or `max_number` boxes were
    /// read. Bounded by [`MAX_CHILDREN_PER_BOX`].
    pub fn read_children(
        range: &mut BitstreamRange<'_>,
        max_number: Option<usize>,
    ) -> Result<TryVec<BmffBox>> {
        let mut children = TryVec::new();

        while !range.eof() && !range.error() {
            let child = BmffBox::read(range)?;
            children.push(child)?;

            if children.len() > MAX_CHILDREN_PER_BOX {
                return Err(Error::with_message(
                    ErrorCode::MemoryAllocationError,
                    SubError::SecurityLimitExceeded,
                    format!("Maximum number of child boxes {MAX_CHILDREN_PER_BOX} exceeded"),
                ));
            }

            if max_number == Some(children.len()) {
                break;
            }
        }

        range.get_error()?;
        Ok(children)
    }

    /// Text rendering of this box and its children; indentation tracks
    /// nesting. The format is diagnostic output, not a stable API.
    pub fn dump(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{indent}Box: {} -----", self.header.box_type);
        let _ = writeln!(
            out,
            "{indent}size: {}   (header size: {})",
            self.header.size, self.header.header_size
        );
        if let Some(uuid) = &self.header.uuid {
            let _ = write!(out, "{indent}uuid:");
            for b in uuid {
                let _ = write!(out, " {b:02x}");
            }
            let _ = writeln!(out);
        }
        self.dump_fields(out, &indent);
        for child in &self.children {
            child.dump(out, depth + 1);
        }
    }

    fn dump_fields(&self, out: &mut String, indent: &str) {
        match &self.kind {
            BoxKind::FileType(ftyp) => {
                let _ = writeln!(out, "{indent}major brand: {}", ftyp.major_brand);
                let _ = writeln!(out, "{indent}minor version: {}", ftyp.minor_version);
                let _ = write!(out, "{indent}compatible brands: ");
                for (i, brand) in ftyp.compatible_brands.iter().enumerate() {
                    if i > 0 {
                        let _ = write!(out, ",");
                    }
                    let _ = write!(out, "{brand}");
                }
                let _ = writeln!(out);
            }
            BoxKind::Handler(hdlr) => {
                let _ = writeln!(out, "{indent}handler_type: {}", hdlr.handler_type);
                let _ = writeln!(
                    out,
                    "{indent}name: {}",
                    String::from_utf8_lossy(&hdlr.name)
                );
            }
            BoxKind::PrimaryItem(pitm) => {
                let _ = writeln!(out, "{indent}item_ID: {}", pitm.item_id);
            }
            BoxKind::ItemLocation(iloc) => {
                for item in &iloc.items {
                    let _ = writeln!(out, "{indent}item ID: {}", item.item_id);
                    let _ = writeln!(
                        out,
                        "{indent}  construction method: {}",
                        item.construction_method
                    );
                    let _ = writeln!(
                        out,
                        "{indent}  data_reference_index: {:#x}",
                        item.data_reference_index
                    );
                    let _ = writeln!(out, "{indent}  base_offset: {}", item.base_offset);
                    let _ = write!(out, "{indent}  extents: ");
                    for extent in &item.extents {
                        let _ = write!(out, "{},{}", extent.offset, extent.length);
                        if extent.index != 0 {
                            let _ = write!(out, ";index={}", extent.index);
                        }
                        let _ = write!(out, " ");
                    }
                    let _ = writeln!(out);
                }
            }
            BoxKind::ItemInfoEntry(infe) => {
                let _ = writeln!(out, "{indent}item_ID: {}", infe.item_id);
                let _ = writeln!(
                    out,
                    "{indent}item_protection_index: {}",
                    infe.item_protection_index
                );
                let _ = writeln!(out, "{indent}item_type: {}", infe.effective_item_type());
                let _ = writeln!(
                    out,
                    "{indent}item_name: {}",
                    String::from_utf8_lossy(&infe.item_name)
                );
                let _ = writeln!(
                    out,
                    "{indent}content_type: {}",
                    String::from_utf8_lossy(&infe.content_type)
                );
                let _ = writeln!(
                    out,
                    "{indent}content_encoding: {}",
                    String::from_utf8_lossy(&infe.content_encoding)
                );
                let _ = writeln!(
                    out,
                    "{indent}item uri type: {}",
                    String::from_utf8_lossy(&infe.item_uri_type)
                );
                let _ = writeln!(out, "{indent}hidden item: {}", infe.hidden);
            }
            BoxKind::ItemPropertyAssociation(ipma) => {
                for entry in &ipma.entries {
                    let _ = writeln!(
                        out,
                        "{indent}associations for item ID: {}",
                        entry.item_id
                    );
                    for assoc in &entry.associations {
                        let _ = writeln!(
                            out,
                            "{indent}  property index: {} (essential: {})",
                            assoc.property_index, assoc.essential
                        );
                    }
                }
            }
            BoxKind::ImageSpatialExtents(ispe) => {
                let _ = writeln!(out, "{indent}image width: {}", ispe.width);
                let _ = writeln!(out, "{indent}image height: {}", ispe.height);
            }
            BoxKind::AuxiliaryType(auxc) => {
                let _ = writeln!(
                    out,
                    "{indent}aux type: {}",
                    String::from_utf8_lossy(&auxc.aux_type)
                );
                let _ = write!(out, "{indent}aux subtypes:");
                for byte in &auxc.aux_subtypes {
                    let _ = write!(out, " {byte:02x}");
                }
                let _ = writeln!(out);
            }
            BoxKind::ImageRotation(irot) => {
                let _ = writeln!(out, "{indent}rotation: {} degrees (CCW)", irot.rotation);
            }
            BoxKind::ImageMirror(imir) => {
                let axis = match imir.axis {
                    MirrorAxis::Horizontal => "horizontal",
                    MirrorAxis::Vertical => "vertical",
                };
                let _ = writeln!(out, "{indent}mirror axis: {axis}");
            }
            BoxKind::CleanAperture(clap) => {
                let _ = writeln!(
                    out,
                    "{indent}clean_aperture: {}/{} x {}/{}",
                    clap.clean_aperture_width.numerator,
                    clap.clean_aperture_width.denominator,
                    clap.clean_aperture_height.numerator,
                    clap.clean_aperture_height.denominator
                );
                let _ = writeln!(
                    out,
                    "{indent}offset: {}/{} ; {}/{}",
                    clap.horizontal_offset.numerator,
                    clap.horizontal_offset.denominator,
                    clap.vertical_offset.numerator,
                    clap.vertical_offset.denominator
                );
            }
            BoxKind::ItemReference(iref) => {
                for r in &iref.references {
                    let _ = write!(
                        out,
                        "{indent}reference with type '{}' from ID: {} to IDs: ",
                        r.reference_type, r.from_item_id
                    );
                    for id in &r.to_item_ids {
                        let _ = write!(out, "{id} ");
                    }
                    let _ = writeln!(out);
                }
            }
            BoxKind::HevcConfiguration(hvcc) => {
                let _ = writeln!(
                    out,
                    "{indent}configuration_version: {}",
                    hvcc.configuration_version
                );
                let _ = writeln!(
                    out,
                    "{indent}general_profile_space: {}",
                    hvcc.general_profile_space
                );
                let _ = writeln!(out, "{indent}general_tier_flag: {}", hvcc.general_tier_flag);
                let _ = writeln!(
                    out,
                    "{indent}general_profile_idc: {}",
                    hvcc.general_profile_idc
                );
                let _ = writeln!(
                    out,
                    "{indent}general_profile_compatibility_flags: {:032b}",
                    hvcc.general_profile_compatibility_flags
                );
                let _ = write!(out, "{indent}general_constraint_indicator_flags: ");
                for (i, flag) in hvcc.general_constraint_indicator_flags.iter().enumerate() {
                    let _ = write!(out, "{}", u8::from(*flag));
                    if i % 8 == 7 {
                        let _ = write!(out, " ");
                    }
                }
                let _ = writeln!(out);
                let _ = writeln!(out, "{indent}general_level_idc: {}", hvcc.general_level_idc);
                let _ = writeln!(
                    out,
                    "{indent}min_spatial_segmentation_idc: {}",
                    hvcc.min_spatial_segmentation_idc
                );
                let _ = writeln!(out, "{indent}parallelism_type: {}", hvcc.parallelism_type);
                let _ = writeln!(out, "{indent}chroma_format: {}", hvcc.chroma_format);
                let _ = writeln!(out, "{indent}bit_depth_luma: {}", hvcc.bit_depth_luma);
                let _ = writeln!(out, "{indent}bit_depth_chroma: {}", hvcc.bit_depth_chroma);
                let _ = writeln!(out, "{indent}avg_frame_rate: {}", hvcc.avg_frame_rate);
                let _ = writeln!(
                    out,
                    "{indent}constant_frame_rate: {}",
                    hvcc.constant_frame_rate
                );
                let _ = writeln!(
                    out,
                    "{indent}num_temporal_layers: {}",
                    hvcc.num_temporal_layers
                );
                let _ = writeln!(
                    out,
                    "{indent}temporal_id_nested: {}",
                    hvcc.temporal_id_nested
                );
                let _ = writeln!(out, "{indent}length_size: {}", hvcc.length_size);
                for array in &hvcc.nal_arrays {
                    let _ = writeln!(out, "{indent}<array>");
                    let _ = writeln!(
                        out,
                        "{indent}  array_completeness: {}",
                        array.array_completeness
                    );
                    let _ = writeln!(
                        out,
                        "{indent}  NAL_unit_type: {}",
                        array.nal_unit_type
                    );
                    for unit in &array.nal_units {
                        let _ = write!(out, "{indent}  ");
                        for b in unit {
                            let _ = write!(out, "{b:02x} ");
                        }
                        let _ = writeln!(out);
                    }
                }
            }
            BoxKind::ItemData(idat) => {
                let _ = writeln!(out, "{indent}number of data bytes: {}", idat.data_len);
            }
            BoxKind::EntityGroupList(grpl) => {
                for group in &grpl.entity_groups {
                    let _ = writeln!(out, "{indent}group type: {}", group.group_type);
                    let _ = writeln!(out, "{indent}| group id: {}", group.group_id);
                    let _ = write!(out, "{indent}| entity IDs: ");
                    for id in &group.entity_ids {
                        let _ = write!(out, "{id} ");
                    }
                    let _ = writeln!(out);
                }
            }
            BoxKind::DataReference(dref) => {
                let _ = writeln!(out, "{indent}entry count: {}", dref.entry_count);
            }
            BoxKind::DataEntryUrl(url) => {
                let _ = writeln!(
                    out,
                    "{indent}location: {}",
                    String::from_utf8_lossy(&url.location)
                );
            }
            _ => {}
        }
    }
}

type ParsedKind = (BoxKind, TryVec<BmffBox>);

fn no_children(kind: BoxKind) -> Result<ParsedKind> {
    Ok((kind, TryVec::new()))
}

fn parse_box_kind(header: &BoxHeader, range: &mut BitstreamRange<'_>) -> Result<ParsedKind> {
    match header.box_type {
        FourCC::FTYP => no_children(BoxKind::FileType(read_ftyp(header, range)?)),
        FourCC::META => {
            let _ = read_fullbox_extra(range);
            Ok((BoxKind::Meta, BmffBox::read_children(range, None)?))
        }
        FourCC::HDLR => no_children(BoxKind::Handler(read_hdlr(range)?)),
        FourCC::PITM => no_children(BoxKind::PrimaryItem(read_pitm(range)?)),
        FourCC::ILOC => no_children(BoxKind::ItemLocation(read_iloc(range)?)),
        FourCC::IINF => {
            let children = read_iinf(range)?;
            Ok((BoxKind::ItemInfo, children))
        }
        FourCC::INFE => no_children(BoxKind::ItemInfoEntry(read_infe(range)?)),
        FourCC::IPRP => Ok((BoxKind::ItemProperties, BmffBox::read_children(range, None)?)),
        FourCC::IPCO => Ok((
            BoxKind::ItemPropertyContainer,
            BmffBox::read_children(range, None)?,
        )),
        FourCC::IPMA => no_children(BoxKind::ItemPropertyAssociation(read_ipma(range)?)),
        FourCC::ISPE => no_children(BoxKind::ImageSpatialExtents(read_ispe(range)?)),
        FourCC::AUXC => no_children(BoxKind::AuxiliaryType(read_auxc(range)?)),
        FourCC::IROT => no_children(BoxKind::ImageRotation(read_irot(range)?)),
        FourCC::IMIR => no_children(BoxKind::ImageMirror(read_imir(range)?)),
        FourCC::CLAP => no_children(BoxKind::CleanAperture(read_clap(range)?)),
        FourCC::IREF => no_children(BoxKind::ItemReference(read_iref(range)?)),
        FourCC::HVCC => no_children(BoxKind::HevcConfiguration(read_hvcc(range)?)),
        FourCC::IDAT => no_children(BoxKind::ItemData(read_idat(range))),
        FourCC::GRPL => no_children(BoxKind::EntityGroupList(read_grpl(range)?)),
        FourCC::DINF => Ok((
            BoxKind::DataInformation,
            BmffBox::read_children(range, None)?,
        )),
        FourCC::DREF => {
            let _ = read_fullbox_extra(range);
            let entry_count = range.read32();
            let children = BmffBox::read_children(range, Some(entry_count as usize))?;
            Ok((
                BoxKind::DataReference(DataReferenceBox { entry_count }),
                children,
            ))
        }
        FourCC::URL => no_children(BoxKind::DataEntryUrl(read_url(range)?)),
        other => {
            debug!("skipping unknown box '{other}' ({} bytes)", range.remaining());
            if header.size == SIZE_UNTIL_END_OF_FILE {
                range.skip_to_end_of_file();
            } else {
                range.skip_to_end_of_box();
            }
            no_children(BoxKind::Unknown)
        }
    }
}

fn read_ftyp(header: &BoxHeader, range: &mut BitstreamRange<'_>) -> Result<FileTypeBox> {
    let major_brand = FourCC::from_u32(range.read32());
    let minor_version = range.read32();

    if header.size <= u64::from(header.header_size) + 8 {
        return Err(Error::with_message(
            ErrorCode::InvalidInput,
            SubError::InvalidBoxSize,
            "ftyp box too small (less than 8 bytes)",
        ));
    }

    let n_brands = (header.size - u64::from(header.header_size) - 8) / 4;
    let mut compatible_brands = TryVec::new();
    for _ in 0..n_brands {
        if range.error() {
            break;
        }
        compatible_brands.push(FourCC::from_u32(range.read32()))?;
    }

    range.get_error()?;
    Ok(FileTypeBox {
        major_brand,
        minor_version,
        compatible_brands,
    })
}

fn read_hdlr(range: &mut BitstreamRange<'_>) -> Result<HandlerBox> {
    let _ = read_fullbox_extra(range);
    let _pre_defined = range.read32();
    let handler_type = FourCC::from_u32(range.read32());
    for _ in 0..3 {
        let _reserved = range.read32();
    }
    let name = range.read_string()?;

    range.get_error()?;
    Ok(HandlerBox { handler_type, name })
}

fn read_pitm(range: &mut BitstreamRange<'_>) -> Result<PrimaryItemBox> {
    let (version, _flags) = read_fullbox_extra(range);

    let item_id = if version == 0 {
        u32::from(range.read16())
    } else {
        range.read32()
    };

    range.get_error()?;
    Ok(PrimaryItemBox { item_id })
}

fn read_iloc(range: &mut BitstreamRange<'_>) -> Result<ItemLocationBox> {
    let (version, _flags) = read_fullbox_extra(range);

    let values4 = range.read16();
    let offset_size = ((values4 >> 12) & 0xF) as u8;
    let length_size = ((values4 >> 8) & 0xF) as u8;
    let base_offset_size = ((values4 >> 4) & 0xF) as u8;
    let index_size = if version > 1 { (values4 & 0xF) as u8 } else { 0 };

    let item_count = if version < 2 {
        usize::from(range.read16())
    } else {
        range.read32() as usize
    };

    if item_count > MAX_ILOC_ITEMS {
        return Err(Error::with_message(
            ErrorCode::MemoryAllocationError,
            SubError::SecurityLimitExceeded,
            format!(
                "iloc box contains {item_count} items, which exceeds the security limit of {MAX_ILOC_ITEMS} items"
            ),
        ));
    }

    let mut items = TryVec::new();

    for _ in 0..item_count {
        let item_id = if version < 2 {
            u32::from(range.read16())
        } else {
            range.read32()
        };

        let construction_method = if version >= 1 {
            (range.read16() & 0xF) as u8
        } else {
            0
        };

        let data_reference_index = range.read16();

        let base_offset = match base_offset_size {
            4 => u64::from(range.read32()),
            8 => (u64::from(range.read32()) << 32) | u64::from(range.read32()),
            _ => 0,
        };

        let extent_count = usize::from(range.read16());
        if extent_count > MAX_ILOC_EXTENTS_PER_ITEM {
            return Err(Error::with_message(
                ErrorCode::MemoryAllocationError,
                SubError::SecurityLimitExceeded,
                format!(
                    "Number of extents in iloc box ({extent_count}) exceeds security limit ({MAX_ILOC_EXTENTS_PER_ITEM})"
                ),
            ));
        }

        let mut extents = TryVec::new();
        for _ in 0..extent_count {
            let mut extent = IlocExtent::default();

            if version > 1 && index_size > 0 {
                extent.index = match index_size {
                    4 => u64::from(range.read32()),
                    8 => (u64::from(range.read32()) << 32) | u64::from(range.read32()),
                    _ => 0,
                };
            }

            extent.offset = match offset_size {
                4 => u64::from(range.read32()),
                8 => (u64::from(range.read32()) << 32) | u64::from(range.read32()),
                _ => 0,
            };

            extent.length = match length_size {
                4 => u64::from(range.read32()),
                8 => (u64::from(range.read32()) << 32) | u64::from(range.read32()),
                _ => 0,
            };

            extents.push(extent)?;
        }

        if !range.error() {
            items.push(IlocItem {
                item_id,
                construction_method,
                data_reference_index,
                base_offset,
                extents,
            })?;
        }
    }

    range.get_error()?;
    Ok(ItemLocationBox { items })
}

fn read_iinf(range: &mut BitstreamRange<'_>) -> Result<TryVec<BmffBox>> {
    let (version, _flags) = read_fullbox_extra(range);

    let entry_count = if version > 0 {
        range.read32() as usize
    } else {
        usize::from(range.read16())
    };

    if entry_count == 0 {
        return Ok(TryVec::new());
    }

    // TODO: read only `entry_count` children.
    BmffBox::read_children(range, None)
}

fn read_infe(range: &mut BitstreamRange<'_>) -> Result<ItemInfoEntry> {
    let (version, flags) = read_fullbox_extra(range);

    let mut entry = ItemInfoEntry {
        item_id: 0,
        item_protection_index: 0,
        item_type: None,
        item_name: TryString::new(),
        content_type: TryString::new(),
        content_encoding: TryString::new(),
        item_uri_type: TryString::new(),
        hidden: false,
    };

    if version <= 1 {
        entry.item_id = u32::from(range.read16());
        entry.item_protection_index = range.read16();
        entry.item_name = range.read_string()?;
        entry.content_type = range.read_string()?;
        entry.content_encoding = range.read_string()?;
    } else {
        // The hidden flag exists on the wire only from version 2 on.
        entry.hidden = (flags & 1) != 0;

        entry.item_id = if version == 2 {
            u32::from(range.read16())
        } else {
            range.read32()
        };

        entry.item_protection_index = range.read16();
        let item_type = range.read32();
        if item_type != 0 {
            entry.item_type = Some(FourCC::from_u32(item_type));
        }

        entry.item_name = range.read_string()?;
        if entry.item_type == Some(FourCC::MIME) {
            entry.content_type = range.read_string()?;
            entry.content_encoding = range.read_string()?;
        } else if entry.item_type == Some(FourCC::URI) {
            entry.item_uri_type = range.read_string()?;
        }
    }

    range.get_error()?;
    Ok(entry)
}

fn read_ipma(range: &mut BitstreamRange<'_>) -> Result<ItemPropertyAssociationBox> {
    let (version, flags) = read_fullbox_extra(range);

    let entry_count = range.read32();
    let mut entries = TryVec::new();

    for _ in 0..entry_count {
        if range.error() || range.eof() {
            break;
        }

        let item_id = if version < 1 {
            u32::from(range.read16())
        } else {
            range.read32()
        };

        let assoc_count = range.read8();
        let mut associations = TryVec::new();
        for _ in 0..assoc_count {
            let association = if flags & 1 != 0 {
                let word = range.read16();
                PropertyAssociation {
                    essential: (word & 0x8000) != 0,
                    property_index: word & 0x7FFF,
                }
            } else {
                let byte = range.read8();
                PropertyAssociation {
                    essential: (byte & 0x80) != 0,
                    property_index: u16::from(byte & 0x7F),
                }
            };
            associations.push(association)?;
        }

        entries.push(IpmaEntry {
            item_id,
            associations,
        })?;
    }

    range.get_error()?;
    Ok(ItemPropertyAssociationBox { entries })
}

fn read_ispe(range: &mut BitstreamRange<'_>) -> Result<ImageSpatialExtentsBox> {
    let _ = read_fullbox_extra(range);
    let width = range.read32();
    let height = range.read32();

    range.get_error()?;
    Ok(ImageSpatialExtentsBox { width, height })
}

fn read_auxc(range: &mut BitstreamRange<'_>) -> Result<AuxiliaryTypeBox> {
    let _ = read_fullbox_extra(range);
    let aux_type = range.read_string()?;

    let mut aux_subtypes = TryVec::new();
    while !range.eof() && !range.error() {
        aux_subtypes.push(range.read8())?;
    }

    range.get_error()?;
    Ok(AuxiliaryTypeBox {
        aux_type,
        aux_subtypes,
    })
}

fn read_irot(range: &mut BitstreamRange<'_>) -> Result<ImageRotation> {
    let rotation = u16::from(range.read8() & 0x03) * 90;

    range.get_error()?;
    Ok(ImageRotation { rotation })
}

fn read_imir(range: &mut BitstreamRange<'_>) -> Result<ImageMirror> {
    let axis = if range.read8() & 1 != 0 {
        MirrorAxis::Horizontal
    } else {
        MirrorAxis::Vertical
    };

    range.get_error()?;
    Ok(ImageMirror { axis })
}

fn read_fraction(range: &mut BitstreamRange<'_>) -> Fraction {
    let numerator = i64::from(range.read32() as i32);
    let denominator = i64::from(range.read32() as i32);
    Fraction::new(numerator, denominator)
}

fn read_clap(range: &mut BitstreamRange<'_>) -> Result<CleanApertureBox> {
    let clean_aperture_width = read_fraction(range);
    let clean_aperture_height = read_fraction(range);
    let horizontal_offset = read_fraction(range);
    let vertical_offset = read_fraction(range);

    range.get_error()?;
    Ok(CleanApertureBox {
        clean_aperture_width,
        clean_aperture_height,
        horizontal_offset,
        vertical_offset,
    })
}

fn read_iref(range: &mut BitstreamRange<'_>) -> Result<ItemReferenceBox> {
    let (version, _flags) = read_fullbox_extra(range);

    let mut references = TryVec::new();
    while !range.eof() && !range.error() {
        // Reference records carry a plain (size, type) header.
        let header = BoxHeader::parse(range)?;

        let from_item_id = if version == 0 {
            u32::from(range.read16())
        } else {
            range.read32()
        };

        let n_refs = range.read16();
        let mut to_item_ids = TryVec::new();
        for _ in 0..n_refs {
            let id = if version == 0 {
                u32::from(range.read16())
            } else {
                range.read32()
            };
            to_item_ids.push(id)?;
            if range.eof() {
                break;
            }
        }

        references.push(SingleItemTypeReference {
            reference_type: header.box_type,
            from_item_id,
            to_item_ids,
        })?;
    }

    range.get_error()?;
    Ok(ItemReferenceBox { references })
}

fn read_hvcc(range: &mut BitstreamRange<'_>) -> Result<HevcConfigurationBox> {
    let configuration_version = range.read8();

    let byte = range.read8();
    let general_profile_space = (byte >> 6) & 0x03;
    let general_tier_flag = (byte >> 5) & 1 != 0;
    let general_profile_idc = byte & 0x1F;

    let general_profile_compatibility_flags = range.read32();

    let mut general_constraint_indicator_flags = [false; 48];
    for i in 0..6 {
        let byte = range.read8();
        for b in 0..8 {
            general_constraint_indicator_flags[i * 8 + b] = (byte >> (7 - b)) & 1 != 0;
        }
    }

    let general_level_idc = range.read8();
    let min_spatial_segmentation_idc = range.read16() & 0x0FFF;
    let parallelism_type = range.read8() & 0x03;
    let chroma_format = range.read8() & 0x03;
    let bit_depth_luma = (range.read8() & 0x07) + 8;
    let bit_depth_chroma = (range.read8() & 0x07) + 8;
    let avg_frame_rate = range.read16();

    let byte = range.read8();
    let constant_frame_rate = (byte >> 6) & 0x03;
    let num_temporal_layers = (byte >> 3) & 0x07;
    let temporal_id_nested = (byte >> 2) & 1 != 0;
    let length_size = (byte & 0x03) + 1;

    let n_arrays = range.read8();
    let mut nal_arrays = TryVec::new();

    for _ in 0..n_arrays {
        if range.error() {
            break;
        }

        let byte = range.read8();
        let array_completeness = (byte >> 6) & 1 != 0;
        let nal_unit_type = byte & 0x3F;

        let n_units = range.read16();
        let mut nal_units = TryVec::new();
        for _ in 0..n_units {
            if range.error() {
                break;
            }
            let size = usize::from(range.read16());
            if size == 0 {
                // Ignore empty NAL units.
                continue;
            }
            let unit = range.read_vec(size)?;
            if !range.error() {
                nal_units.push(unit)?;
            }
        }

        nal_arrays.push(NalArray {
            array_completeness,
            nal_unit_type,
            nal_units,
        })?;
    }

    range.skip_to_end_of_box();

    Ok(HevcConfigurationBox {
        configuration_version,
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        min_spatial_segmentation_idc,
        parallelism_type,
        chroma_format,
        bit_depth_luma,
        bit_depth_chroma,
        avg_frame_rate,
        constant_frame_rate,
        num_temporal_layers,
        temporal_id_nested,
        length_size,
        nal_arrays,
    })
}

fn read_idat(range: &mut BitstreamRange<'_>) -> ItemDataBox {
    let idat = ItemDataBox {
        data_start: range.position(),
        data_len: range.remaining(),
    };
    range.skip_to_end_of_box();
    idat
}

fn read_grpl(range: &mut BitstreamRange<'_>) -> Result<EntityGroupListBox> {
    let mut entity_groups = TryVec::new();

    while !range.eof() && !range.error() {
        let header = BoxHeader::parse(range)?;
        let _ = read_fullbox_extra(range);

        let group_id = range.read32();
        let n_entities = range.read32();
        let mut entity_ids = TryVec::new();
        for _ in 0..n_entities {
            if range.eof() {
                break;
            }
            entity_ids.push(range.read32())?;
        }

        entity_groups.push(EntityGroup {
            group_type: header.box_type,
            group_id,
            entity_ids,
        })?;
    }

    range.get_error()?;
    Ok(EntityGroupListBox { entity_groups })
}

fn read_url(range: &mut BitstreamRange<'_>) -> Result<DataEntryUrlBox> {
    let _ = read_fullbox_extra(range);
    let location = range.read_string()?;

    range.get_error()?;
    Ok(DataEntryUrlBox { location })
}
