// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The file model: top-level box list, required-box validation, the item
//! table and on-demand item data access.
//!
//! The model is immutable after parsing. The raw byte buffer is kept so
//! extent reads can slice compressed data out lazily.

use std::borrow::Cow;
use std::fmt::Write as _;

use fallible_collections::TryVec;

use crate::bitstream::BitstreamRange;
use crate::boxes::{
    BmffBox, BoxKind, FileTypeBox, FourCC, HevcConfigurationBox, IlocItem, ItemDataBox,
    ItemInfoEntry, ItemLocationBox, ItemPropertyAssociationBox, ItemReferenceBox,
    PrimaryItemBox, MAX_MEMORY_BLOCK_SIZE,
};
use crate::error::{Error, ErrorCode, Result, SubError};

/// A property box associated with an item, in ipma order.
#[derive(Debug, Clone, Copy)]
pub struct ItemProperty<'a> {
    #[allow(unused)]
    pub essential: bool,
    pub property: &'a BmffBox,
}

#[derive(Debug)]
pub(crate) struct HeifFile<'data> {
    raw: Cow<'data, [u8]>,
    top_level: TryVec<BmffBox>,
    primary_item_id: u32,
    item_ids: TryVec<u32>,
}

impl<'data> HeifFile<'data> {
    pub fn parse(raw: Cow<'data, [u8]>) -> Result<HeifFile<'data>> {
        let mut top_level = TryVec::new();

        {
            let mut range = BitstreamRange::new(&raw);
            // A failed box ends top-level reading; the required-box checks
            // below turn a truncated file into the user-visible error.
            while !range.eof() && !range.error() {
                match BmffBox::read(&mut range) {
                    Ok(parsed) => top_level.push(parsed)?,
                    Err(err) => {
                        log::debug!("stopping top-level box scan: {err}");
                        break;
                    }
                }
            }
        }

        let mut file = HeifFile {
            raw,
            top_level,
            primary_item_id: 0,
            item_ids: TryVec::new(),
        };
        file.check_structure()?;
        Ok(file)
    }

    fn check_structure(&mut self) -> Result<()> {
        let ftyp = self
            .ftyp()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoFtypBox))?;

        if !ftyp.has_compatible_brand(FourCC::HEIC) {
            return Err(Error::with_message(
                ErrorCode::UnsupportedFiletype,
                SubError::Unspecified,
                "File does not support the 'heic' brand",
            ));
        }

        let meta = self
            .meta()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoMetaBox))?;

        let hdlr = meta
            .child_box(FourCC::HDLR)
            .and_then(|b| match &b.kind {
                BoxKind::Handler(hdlr) => Some(hdlr),
                _ => None,
            })
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoHdlrBox))?;

        if hdlr.handler_type != FourCC::PICT {
            return Err(Error::new(ErrorCode::InvalidInput, SubError::NoPictHandler));
        }

        let pitm = self
            .pitm()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoPitmBox))?;
        let primary_item_id = pitm.item_id;

        let iprp = meta
            .child_box(FourCC::IPRP)
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIprpBox))?;
        if iprp.child_box(FourCC::IPCO).is_none() {
            return Err(Error::new(ErrorCode::InvalidInput, SubError::NoIpcoBox));
        }
        if self.ipma().is_none() {
            return Err(Error::new(ErrorCode::InvalidInput, SubError::NoIpmaBox));
        }

        if self.iloc().is_none() {
            return Err(Error::new(ErrorCode::InvalidInput, SubError::NoIlocBox));
        }

        let iinf = meta
            .child_box(FourCC::IINF)
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIinfBox))?;

        let mut item_ids = TryVec::new();
        for child in iinf.child_boxes(FourCC::INFE) {
            let BoxKind::ItemInfoEntry(infe) = &child.kind else {
                return Err(Error::new(ErrorCode::InvalidInput, SubError::NoInfeBox));
            };
            if !item_ids.contains(&infe.item_id) {
                item_ids.push(infe.item_id)?;
            }
        }
        // The C item table is keyed by id; iterate ascending for the same
        // deterministic top-level ordering.
        item_ids.sort_unstable();

        self.primary_item_id = primary_item_id;
        self.item_ids = item_ids;
        Ok(())
    }

    // --- box accessors ---------------------------------------------------

    fn ftyp(&self) -> Option<&FileTypeBox> {
        self.top_level.iter().find_map(|b| match &b.kind {
            BoxKind::FileType(ftyp) => Some(ftyp),
            _ => None,
        })
    }

    fn meta(&self) -> Option<&BmffBox> {
        self.top_level
            .iter()
            .find(|b| matches!(b.kind, BoxKind::Meta))
    }

    fn pitm(&self) -> Option<&PrimaryItemBox> {
        self.meta()?.child_box(FourCC::PITM).and_then(|b| match &b.kind {
            BoxKind::PrimaryItem(pitm) => Some(pitm),
            _ => None,
        })
    }

    pub fn iloc(&self) -> Option<&ItemLocationBox> {
        self.meta()?.child_box(FourCC::ILOC).and_then(|b| match &b.kind {
            BoxKind::ItemLocation(iloc) => Some(iloc),
            _ => None,
        })
    }

    /// The ipco container box; properties are its children, 1-indexed.
    pub fn ipco(&self) -> Option<&BmffBox> {
        self.meta()?
            .child_box(FourCC::IPRP)?
            .child_box(FourCC::IPCO)
    }

    pub fn ipma(&self) -> Option<&ItemPropertyAssociationBox> {
        self.meta()?
            .child_box(FourCC::IPRP)?
            .child_box(FourCC::IPMA)
            .and_then(|b| match &b.kind {
                BoxKind::ItemPropertyAssociation(ipma) => Some(ipma),
                _ => None,
            })
    }

    pub fn iref(&self) -> Option<&ItemReferenceBox> {
        self.meta()?.child_box(FourCC::IREF).and_then(|b| match &b.kind {
            BoxKind::ItemReference(iref) => Some(iref),
            _ => None,
        })
    }

    fn idat(&self) -> Option<&ItemDataBox> {
        self.meta()?.child_box(FourCC::IDAT).and_then(|b| match &b.kind {
            BoxKind::ItemData(idat) => Some(idat),
            _ => None,
        })
    }

    // --- item table -------------------------------------------------------

    pub fn primary_item_id(&self) -> u32 {
        self.primary_item_id
    }

    pub fn item_ids(&self) -> &[u32] {
        &self.item_ids
    }

    pub fn item_exists(&self, item_id: u32) -> bool {
        self.item_ids.contains(&item_id)
    }

    pub fn infe_by_id(&self, item_id: u32) -> Option<&ItemInfoEntry> {
        let iinf = self.meta()?.child_box(FourCC::IINF)?;
        iinf.child_boxes(FourCC::INFE).find_map(|b| match &b.kind {
            BoxKind::ItemInfoEntry(infe) if infe.item_id == item_id => Some(infe),
            _ => None,
        })
    }

    /// The effective item type; absent for ids outside the item table.
    pub fn item_type(&self, item_id: u32) -> Option<FourCC> {
        self.infe_by_id(item_id).map(ItemInfoEntry::effective_item_type)
    }

    /// The properties associated with an item, in ipma order.
    pub fn properties_for_item(&self, item_id: u32) -> Result<TryVec<ItemProperty<'_>>> {
        let ipco = self
            .ipco()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIpcoBox))?;
        let ipma = self
            .ipma()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIpmaBox))?;

        let associations = ipma.associations_for_item(item_id).ok_or_else(|| {
            Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NoPropertiesAssignedToItem,
                format!("Item (ID={item_id}) has no properties assigned to it in ipma box"),
            )
        })?;

        let mut properties = TryVec::new();
        for assoc in associations {
            if usize::from(assoc.property_index) > ipco.children.len() {
                return Err(Error::with_message(
                    ErrorCode::InvalidInput,
                    SubError::IpmaBoxReferencesNonexistingProperty,
                    format!(
                        "Nonexisting property (index={}) for item ID={item_id} referenced in ipma box",
                        assoc.property_index
                    ),
                ));
            }

            // Index 0 is tolerated as "no property".
            if assoc.property_index > 0 {
                properties.push(ItemProperty {
                    essential: assoc.essential,
                    property: &ipco.children[usize::from(assoc.property_index) - 1],
                })?;
            }
        }
        Ok(properties)
    }

    fn hvcc_for_item(&self, item_id: u32) -> Result<&HevcConfigurationBox> {
        let properties = self.properties_for_item(item_id)?;
        properties
            .iter()
            .find_map(|prop| match &prop.property.kind {
                BoxKind::HevcConfiguration(hvcc) => Some(hvcc),
                _ => None,
            })
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoHvccBox))
    }

    // --- item data --------------------------------------------------------

    /// Fetch the compressed bitstream for an item. For `hvc1` items the
    /// hvcC parameter sets are re-emitted as a length-prefixed prelude
    /// before the extent bytes.
    pub fn compressed_item_data(&self, item_id: u32) -> Result<TryVec<u8>> {
        if !self.item_exists(item_id) {
            return Err(Error::new(
                ErrorCode::UsageError,
                SubError::NonexistingImageReferenced,
            ));
        }

        let item_type = self
            .item_type(item_id)
            .ok_or(Error::new(ErrorCode::UsageError, SubError::NonexistingImageReferenced))?;

        let iloc = self
            .iloc()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIlocBox))?;
        let item = iloc.item_by_id(item_id).ok_or_else(|| {
            Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NoItemData,
                format!("Item with ID {item_id} has no compressed data"),
            )
        })?;

        let mut data = TryVec::new();
        if item_type == FourCC::HVC1 {
            self.hvcc_for_item(item_id)?.get_headers(&mut data)?;
            self.read_iloc_data(item, &mut data)?;
        } else if item_type == FourCC::GRID
            || item_type == FourCC::IOVL
            || item_type == FourCC::EXIF
        {
            self.read_iloc_data(item, &mut data)?;
        } else {
            return Err(Error::new(
                ErrorCode::UnsupportedFeature,
                SubError::UnsupportedCodec,
            ));
        }

        Ok(data)
    }

    fn check_memory_limit(dest_len: usize, extent_length: u64) -> Result<()> {
        if MAX_MEMORY_BLOCK_SIZE.saturating_sub(dest_len as u64) < extent_length {
            return Err(Error::with_message(
                ErrorCode::MemoryAllocationError,
                SubError::SecurityLimitExceeded,
                format!(
                    "item contained {extent_length} bytes, total memory size would be {} bytes, exceeding the security limit of {MAX_MEMORY_BLOCK_SIZE} bytes",
                    dest_len as u64 + extent_length
                ),
            ));
        }
        Ok(())
    }

    fn read_iloc_data(&self, item: &IlocItem, dest: &mut TryVec<u8>) -> Result<()> {
        for extent in &item.extents {
            match item.construction_method {
                0 => {
                    let start = item
                        .base_offset
                        .checked_add(extent.offset)
                        .ok_or(Error::new(ErrorCode::InvalidInput, SubError::EndOfData))?;

                    Self::check_memory_limit(dest.len(), extent.length)?;

                    let end = start
                        .checked_add(extent.length)
                        .ok_or(Error::new(ErrorCode::InvalidInput, SubError::EndOfData))?;
                    let slice = usize::try_from(start)
                        .ok()
                        .zip(usize::try_from(end).ok())
                        .and_then(|(s, e)| self.raw.get(s..e))
                        .ok_or_else(|| {
                            Error::with_message(
                                ErrorCode::InvalidInput,
                                SubError::EndOfData,
                                format!(
                                    "Extent in iloc box references data outside of file bounds (points to file position {start})"
                                ),
                            )
                        })?;
                    dest.extend_from_slice(slice)?;
                }
                1 => {
                    let idat = self.idat().ok_or(Error::with_message(
                        ErrorCode::InvalidInput,
                        SubError::NoIdatBox,
                        "idat box referenced in iloc box is not present in file",
                    ))?;

                    Self::check_memory_limit(dest.len(), extent.length)?;

                    let offset = item
                        .base_offset
                        .checked_add(extent.offset)
                        .ok_or(Error::new(ErrorCode::InvalidInput, SubError::EndOfData))?;
                    if offset.checked_add(extent.length).map_or(true, |end| end > idat.data_len) {
                        return Err(Error::new(ErrorCode::InvalidInput, SubError::EndOfData));
                    }

                    let start = usize::try_from(idat.data_start + offset)
                        .map_err(|_| Error::new(ErrorCode::InvalidInput, SubError::EndOfData))?;
                    let slice = self
                        .raw
                        .get(start..start + extent.length as usize)
                        .ok_or(Error::new(ErrorCode::InvalidInput, SubError::EndOfData))?;
                    dest.extend_from_slice(slice)?;
                }
                _ => {
                    return Err(Error::with_message(
                        ErrorCode::UnsupportedFeature,
                        SubError::Unspecified,
                        "iloc construction method 'item' is not supported",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Text rendering of the full box tree, for diagnostics.
    pub fn debug_dump_boxes(&self) -> String {
        let mut out = String::new();
        for (i, parsed) in self.top_level.iter().enumerate() {
            if i > 0 {
                let _ = writeln!(out);
            }
            parsed.dump(&mut out, 0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        out.extend_from_slice(box_type);
        out.extend_from_slice(payload);
        out
    }

    fn ftyp(brands: &[&[u8; 4]]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"mif1");
        payload.extend_from_slice(&0u32.to_be_bytes());
        for brand in brands {
            payload.extend_from_slice(*brand);
        }
        make_box(b"ftyp", &payload)
    }

    #[test]
    fn missing_ftyp_is_reported() {
        let err = HeifFile::parse(Cow::Borrowed(&[][..])).unwrap_err();
        assert_eq!(err.sub_code, SubError::NoFtypBox);
    }

    #[test]
    fn missing_heic_brand_is_unsupported_filetype() {
        let data = ftyp(&[b"avif"]);
        let err = HeifFile::parse(Cow::Owned(data)).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFiletype);
    }

    #[test]
    fn missing_meta_is_reported() {
        let data = ftyp(&[b"heic"]);
        let err = HeifFile::parse(Cow::Owned(data)).unwrap_err();
        assert_eq!(err.sub_code, SubError::NoMetaBox);
    }

    #[test]
    fn meta_without_hdlr_is_reported() {
        let mut data = ftyp(&[b"heic"]);
        let mut meta_payload = vec![0, 0, 0, 0]; // full box header
        meta_payload.extend_from_slice(&make_box(b"free", &[]));
        data.extend_from_slice(&make_box(b"meta", &meta_payload));
        let err = HeifFile::parse(Cow::Owned(data)).unwrap_err();
        assert_eq!(err.sub_code, SubError::NoHdlrBox);
    }
}
