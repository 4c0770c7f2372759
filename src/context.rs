// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image-level view of a HEIF file.
//!
//! `HeifContext` interprets the parsed file into a graph of logical images
//! (primary, thumbnails, alpha/depth auxiliaries, attached metadata) and
//! assembles decoded pixel images on request, driving the registered
//! decoder plugins for coded items and compositing grids and overlays.

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;

use fallible_collections::TryVec;
use log::debug;

use crate::boxes::{BoxKind, FourCC, MirrorAxis};
use crate::error::{Error, ErrorCode, Result, SubError};
use crate::file::HeifFile;
use crate::image::{Channel, Chroma, Colorspace, PixelImage};
use crate::plugin::{CompressionFormat, Decoder, DecoderPlugin, PLUGIN_API_VERSION};
use crate::sei::{decode_hevc_aux_sei_messages, DepthRepresentationInfo, SeiMessage};

/// Item identifier; 16 or 32 bits on the wire depending on box versions.
pub type ItemId = u32;

/// Grid/iden/iovl items may nest; decoding deeper than this fails with
/// [`SubError::RecursionLimitReached`].
const MAX_DECODE_RECURSION_DEPTH: u32 = 4;

fn item_type_is_image(item_type: FourCC) -> bool {
    matches!(
        item_type,
        FourCC::HVC1 | FourCC::GRID | FourCC::IDEN | FourCC::IOVL
    )
}

/// A metadata block (EXIF) attached to an image.
#[derive(Debug)]
pub struct ImageMetadata {
    pub item_type: FourCC,
    pub data: TryVec<u8>,
}

/// One logical image in the interpreted graph. Edges are item ids into the
/// context-owned table.
#[derive(Debug)]
pub(crate) struct ImageRecord {
    pub id: ItemId,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
    pub thumbnail_of: Option<ItemId>,
    pub alpha_of: Option<ItemId>,
    pub depth_of: Option<ItemId>,
    pub alpha_child: Option<ItemId>,
    pub depth_child: Option<ItemId>,
    pub depth_info: Option<DepthRepresentationInfo>,
    pub thumbnails: TryVec<ItemId>,
    pub metadata: TryVec<ImageMetadata>,
}

impl ImageRecord {
    fn new(id: ItemId) -> Self {
        Self {
            id,
            width: 0,
            height: 0,
            is_primary: false,
            thumbnail_of: None,
            alpha_of: None,
            depth_of: None,
            alpha_child: None,
            depth_child: None,
            depth_info: None,
            thumbnails: TryVec::new(),
            metadata: TryVec::new(),
        }
    }
}

/// Options for [`HeifContext::decode_image`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodingOptions {
    /// Skip the irot/imir/clap transformation chain.
    pub ignore_transformations: bool,
}

/// An opened HEIF file plus its interpreted image graph.
pub struct HeifContext<'data> {
    file: HeifFile<'data>,
    images: TryVec<ImageRecord>,
    top_level_ids: TryVec<ItemId>,
    primary_image_id: Option<ItemId>,
    decoders: Vec<Box<dyn DecoderPlugin>>,
}

impl<'data> std::fmt::Debug for HeifContext<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeifContext").finish_non_exhaustive()
    }
}

impl<'data> HeifContext<'data> {
    /// Open a HEIF file from a borrowed byte slice.
    pub fn from_bytes(data: &'data [u8]) -> Result<HeifContext<'data>> {
        Self::open(Cow::Borrowed(data))
    }

    /// Open a HEIF file from an owned buffer.
    pub fn from_owned(data: Vec<u8>) -> Result<HeifContext<'static>> {
        HeifContext::open(Cow::Owned(data))
    }

    /// Read all of `reader`, then open the buffer.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<HeifContext<'static>> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        HeifContext::from_owned(buf)
    }

    /// Open a HEIF file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<HeifContext<'static>> {
        HeifContext::from_owned(std::fs::read(path)?)
    }

    fn open(raw: Cow<'data, [u8]>) -> Result<HeifContext<'data>> {
        let file = HeifFile::parse(raw)?;
        let mut context = HeifContext {
            file,
            images: TryVec::new(),
            top_level_ids: TryVec::new(),
            primary_image_id: None,
            decoders: Vec::new(),
        };
        context.interpret()?;
        Ok(context)
    }

    /// Register a decoder plugin. Plugins registered later win ties on
    /// priority only if strictly higher.
    pub fn register_decoder(&mut self, plugin: Box<dyn DecoderPlugin>) -> Result<()> {
        if plugin.api_version() != PLUGIN_API_VERSION {
            return Err(Error::new(
                ErrorCode::UsageError,
                SubError::UnsupportedPluginVersion,
            ));
        }
        self.decoders.push(plugin);
        Ok(())
    }

    fn decoder_for(&self, format: CompressionFormat) -> Option<&dyn DecoderPlugin> {
        let mut highest_priority = 0;
        let mut best: Option<&dyn DecoderPlugin> = None;
        for plugin in &self.decoders {
            let priority = plugin.does_support_format(format);
            if priority > highest_priority {
                highest_priority = priority;
                best = Some(&**plugin);
            }
        }
        best
    }

    /// Text rendering of the full box tree, for diagnostics.
    pub fn debug_dump_boxes(&self) -> String {
        self.file.debug_dump_boxes()
    }

    // --- interpretation ---------------------------------------------------

    fn image_index(images: &[ImageRecord], id: ItemId) -> Option<usize> {
        images.iter().position(|img| img.id == id)
    }

    fn interpret(&mut self) -> Result<()> {
        // --- pass A: reference all images, find the primary one

        for &id in self.file.item_ids() {
            let Some(infe) = self.file.infe_by_id(id) else {
                continue;
            };

            if !item_type_is_image(infe.effective_item_type()) {
                continue;
            }

            let mut record = ImageRecord::new(id);
            if !infe.hidden {
                if id == self.file.primary_item_id() {
                    record.is_primary = true;
                    self.primary_image_id = Some(id);
                }
                self.top_level_ids.push(id)?;
            }
            self.images.push(record)?;
        }

        if self.primary_image_id.is_none() {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
                "'pitm' box references a non-existing image",
            ));
        }

        // --- wire thumbnails and auxiliary images via iref

        if self.file.iref().is_some() {
            let ids: Vec<ItemId> = self.images.iter().map(|img| img.id).collect();
            for id in ids {
                let ref_type = self.file.iref().and_then(|iref| iref.reference_type(id));
                if ref_type == Some(FourCC::THMB) {
                    self.attach_thumbnail(id)?;
                } else if ref_type == Some(FourCC::AUXL) {
                    self.attach_auxiliary(id)?;
                }
                // Anything else is a normal image; it stays top-level.
            }
        }

        // --- pass B: resolve displayed resolutions from the properties

        for idx in 0..self.images.len() {
            let id = self.images[idx].id;
            let properties = self.file.properties_for_item(id)?;

            let mut ispe_read = false;
            for prop in &properties {
                if let BoxKind::ImageSpatialExtents(ispe) = &prop.property.kind {
                    if ispe.width >= i32::MAX as u32 || ispe.height >= i32::MAX as u32 {
                        return Err(Error::with_message(
                            ErrorCode::MemoryAllocationError,
                            SubError::SecurityLimitExceeded,
                            format!(
                                "Image size {}x{} exceeds the maximum image size",
                                ispe.width, ispe.height
                            ),
                        ));
                    }
                    self.images[idx].width = ispe.width;
                    self.images[idx].height = ispe.height;
                    ispe_read = true;
                }

                if ispe_read {
                    if let BoxKind::CleanAperture(clap) = &prop.property.kind {
                        self.images[idx].width = clap.width_rounded().max(0) as u32;
                        self.images[idx].height = clap.height_rounded().max(0) as u32;
                    }

                    if let BoxKind::ImageRotation(irot) = &prop.property.kind {
                        if irot.rotation == 90 || irot.rotation == 270 {
                            let record = &mut self.images[idx];
                            std::mem::swap(&mut record.width, &mut record.height);
                        }
                    }
                }
            }
        }

        // --- attach EXIF metadata

        for &id in self.file.item_ids() {
            if self.file.item_type(id) != Some(FourCC::EXIF) {
                continue;
            }

            let data = self.file.compressed_item_data(id)?;

            let Some(iref) = self.file.iref() else {
                continue;
            };
            if iref.reference_type(id) != Some(FourCC::CDSC) {
                continue;
            }

            let refs = iref.references_from(id);
            if refs.len() != 1 {
                return Err(Error::with_message(
                    ErrorCode::InvalidInput,
                    SubError::Unspecified,
                    "Exif data not correctly assigned to image",
                ));
            }

            let Some(idx) = Self::image_index(&self.images, refs[0]) else {
                return Err(Error::with_message(
                    ErrorCode::InvalidInput,
                    SubError::NonexistingImageReferenced,
                    "Exif data assigned to non-existing image",
                ));
            };
            self.images[idx].metadata.push(ImageMetadata {
                item_type: FourCC::EXIF,
                data,
            })?;
        }

        Ok(())
    }

    fn remove_top_level_image(&mut self, id: ItemId) {
        let ids: Vec<ItemId> = std::mem::take(&mut self.top_level_ids)
            .into_iter()
            .filter(|&t| t != id)
            .collect();
        self.top_level_ids = TryVec::from(ids);
    }

    fn attach_thumbnail(&mut self, id: ItemId) -> Result<()> {
        let iref = self
            .file
            .iref()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIrefBox))?;
        let refs = iref.references_from(id);
        if refs.len() != 1 {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::Unspecified,
                "Too many thumbnail references",
            ));
        }
        let target = refs[0];

        let Some(target_idx) = Self::image_index(&self.images, target) else {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
                "Thumbnail references a non-existing image",
            ));
        };

        if self.images[target_idx].thumbnail_of.is_some() {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
                "Thumbnail references another thumbnail",
            ));
        }

        let Some(idx) = Self::image_index(&self.images, id) else {
            return Err(Error::new(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
            ));
        };
        self.images[idx].thumbnail_of = Some(target);
        self.images[target_idx].thumbnails.push(id)?;
        self.remove_top_level_image(id);
        Ok(())
    }

    fn attach_auxiliary(&mut self, id: ItemId) -> Result<()> {
        enum AuxKind {
            Alpha,
            Depth(Option<DepthRepresentationInfo>),
            Other,
        }

        let aux = {
            let properties = self.file.properties_for_item(id)?;
            let auxc = properties
                .iter()
                .find_map(|prop| match &prop.property.kind {
                    BoxKind::AuxiliaryType(auxc) => Some(auxc),
                    _ => None,
                })
                .ok_or_else(|| {
                    Error::with_message(
                        ErrorCode::InvalidInput,
                        SubError::AuxiliaryImageTypeUnspecified,
                        format!("No auxC property for image {id}"),
                    )
                })?;

            let aux_type: &[u8] = &auxc.aux_type;
            if aux_type == b"urn:mpeg:avc:2015:auxid:1"
                || aux_type == b"urn:mpeg:hevc:2015:auxid:1"
            {
                AuxKind::Alpha
            } else if aux_type == b"urn:mpeg:hevc:2015:auxid:2" {
                let mut depth_info = None;
                let messages = decode_hevc_aux_sei_messages(&auxc.aux_subtypes)?;
                for msg in messages {
                    let SeiMessage::DepthRepresentationInfo(info) = msg;
                    depth_info = Some(info);
                }
                AuxKind::Depth(depth_info)
            } else {
                debug!(
                    "unhandled auxiliary type '{}' on item {id}",
                    String::from_utf8_lossy(aux_type)
                );
                AuxKind::Other
            }
        };

        let iref = self
            .file
            .iref()
            .ok_or(Error::new(ErrorCode::InvalidInput, SubError::NoIrefBox))?;
        let refs = iref.references_from(id);
        if refs.len() != 1 {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::Unspecified,
                "Too many auxiliary image references",
            ));
        }
        let target = refs[0];

        let Some(target_idx) = Self::image_index(&self.images, target) else {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
                "Auxiliary image references a non-existing image",
            ));
        };
        let Some(idx) = Self::image_index(&self.images, id) else {
            return Err(Error::new(
                ErrorCode::InvalidInput,
                SubError::NonexistingImageReferenced,
            ));
        };

        match aux {
            AuxKind::Alpha => {
                self.images[idx].alpha_of = Some(target);
                self.images[target_idx].alpha_child = Some(id);
            }
            AuxKind::Depth(depth_info) => {
                self.images[idx].depth_of = Some(target);
                self.images[target_idx].depth_child = Some(id);
                if let Some(info) = depth_info {
                    self.images[target_idx].depth_info = Some(info);
                }
            }
            AuxKind::Other => {}
        }

        self.remove_top_level_image(id);
        Ok(())
    }

    // --- graph accessors --------------------------------------------------

    pub(crate) fn image_record(&self, id: ItemId) -> Option<&ImageRecord> {
        self.images.iter().find(|img| img.id == id)
    }

    pub(crate) fn primary_image_id_opt(&self) -> Option<ItemId> {
        self.primary_image_id
    }

    /// Ids of all non-hidden, non-attached images, ascending.
    pub fn top_level_image_ids(&self) -> &[ItemId] {
        &self.top_level_ids
    }

    pub fn is_top_level_image_id(&self, id: ItemId) -> bool {
        self.top_level_ids.contains(&id)
    }

    // --- decoding ---------------------------------------------------------

    /// Decode the image item `item_id` into pixels, including alpha
    /// attachment and the transformation chain.
    pub fn decode_image(&self, item_id: ItemId, options: &DecodingOptions) -> Result<PixelImage> {
        self.decode_image_at_depth(item_id, options, 0)
    }

    fn decode_image_at_depth(
        &self,
        item_id: ItemId,
        options: &DecodingOptions,
        depth: u32,
    ) -> Result<PixelImage> {
        if depth > MAX_DECODE_RECURSION_DEPTH {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::RecursionLimitReached,
                format!("derived images nested deeper than {MAX_DECODE_RECURSION_DEPTH}"),
            ));
        }

        let item_type = self.file.item_type(item_id);

        let mut img = if item_type == Some(FourCC::HVC1) {
            self.decode_coded_image(item_id)?
        } else if item_type == Some(FourCC::GRID) {
            let data = self.file.compressed_item_data(item_id)?;
            self.decode_full_grid_image(item_id, &data, depth)?
        } else if item_type == Some(FourCC::IDEN) {
            self.decode_derived_image(item_id, depth)?
        } else if item_type == Some(FourCC::IOVL) {
            let data = self.file.compressed_item_data(item_id)?;
            self.decode_overlay_image(item_id, &data, depth)?
        } else {
            return Err(Error::new(
                ErrorCode::UnsupportedFeature,
                SubError::UnsupportedImageType,
            ));
        };

        // --- add the alpha channel, if the graph attaches one

        if let Some(record) = self.image_record(item_id) {
            if let Some(alpha_id) = record.alpha_child {
                let alpha = self.decode_image_at_depth(
                    alpha_id,
                    &DecodingOptions::default(),
                    depth + 1,
                )?;
                img.transfer_plane_from_image_as(&alpha, Channel::Y, Channel::Alpha)?;
            }
        }

        // --- apply the transformation chain in ipma order

        if !options.ignore_transformations {
            // An item without property associations simply has no
            // transformations; the fetch error is not surfaced here.
            let properties = self
                .file
                .properties_for_item(item_id)
                .unwrap_or_else(|_| TryVec::new());

            for prop in &properties {
                match &prop.property.kind {
                    BoxKind::ImageRotation(rot) => {
                        img = img.rotate_ccw(rot.rotation)?;
                    }
                    BoxKind::ImageMirror(mirror) => {
                        img.mirror_inplace(mirror.axis == MirrorAxis::Horizontal);
                    }
                    BoxKind::CleanAperture(clap) => {
                        let img_width = i64::from(img.width());
                        let img_height = i64::from(img.height());

                        let mut left = clap.left_rounded(img_width);
                        let mut right = clap.right_rounded(img_width);
                        let mut top = clap.top_rounded(img_height);
                        let mut bottom = clap.bottom_rounded(img_height);

                        left = left.max(0);
                        top = top.max(0);
                        right = right.min(img_width - 1);
                        bottom = bottom.min(img_height - 1);

                        if left >= right || top >= bottom {
                            return Err(Error::new(
                                ErrorCode::InvalidInput,
                                SubError::InvalidCleanAperture,
                            ));
                        }

                        img = img.crop(left as u32, right as u32, top as u32, bottom as u32)?;
                    }
                    _ => {}
                }
            }
        }

        Ok(img)
    }

    fn decode_coded_image(&self, item_id: ItemId) -> Result<PixelImage> {
        let plugin = self
            .decoder_for(CompressionFormat::Hevc)
            .ok_or(Error::new(ErrorCode::UnsupportedFeature, SubError::UnsupportedCodec))?;

        let data = self.file.compressed_item_data(item_id)?;

        let mut decoder: Box<dyn Decoder> = plugin.new_decoder()?;
        decoder.push_data(&data)?;
        decoder
            .decode_image()?
            .ok_or(Error::new(ErrorCode::DecoderPluginError, SubError::Unspecified))
    }

    // Hard-coded to 8-bit YCbCr 4:2:0 output.
    // TODO: take bit depth and chroma format from the tiles' hvcC
    // properties once sample files with other formats exist.
    fn decode_full_grid_image(
        &self,
        item_id: ItemId,
        grid_data: &[u8],
        depth: u32,
    ) -> Result<PixelImage> {
        let grid = ImageGrid::parse(grid_data)?;

        let iref = self.file.iref().ok_or(Error::with_message(
            ErrorCode::InvalidInput,
            SubError::NoIrefBox,
            "No iref box available, but needed for grid image",
        ))?;

        let image_references = iref.references_from(item_id);
        let n_tiles = usize::from(grid.rows) * usize::from(grid.columns);
        if image_references.len() != n_tiles {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::MissingGridImages,
                format!(
                    "Tiled image with {}x{}={} tiles, but only {} tile images in file",
                    grid.rows,
                    grid.columns,
                    n_tiles,
                    image_references.len()
                ),
            ));
        }

        let w = grid.output_width;
        let h = grid.output_height;

        let mut img = PixelImage::create(w, h, Colorspace::YCbCr, Chroma::C420);
        img.add_plane(Channel::Y, w, h, 8)?;
        img.add_plane(Channel::Cb, w / 2, h / 2, 8)?;
        img.add_plane(Channel::Cr, w / 2, h / 2, 8)?;

        let mut y0 = 0u32;
        let mut reference_idx = 0usize;

        for _row in 0..grid.rows {
            let mut x0 = 0u32;
            let mut tile_height = 0u32;

            for _col in 0..grid.columns {
                let tile_img = self.decode_image_at_depth(
                    image_references[reference_idx],
                    &DecodingOptions::default(),
                    depth + 1,
                )?;

                let src_width = tile_img.width();
                let src_height = tile_img.height();
                tile_height = src_height;

                for channel in [Channel::Y, Channel::Cb, Channel::Cr] {
                    let Some(tile_plane) = tile_img.plane(channel) else {
                        continue;
                    };

                    let mut copy_width = src_width.min(w.saturating_sub(x0));
                    let mut copy_height = src_height.min(h.saturating_sub(y0));
                    let mut xs = x0;
                    let mut ys = y0;

                    if channel != Channel::Y {
                        copy_width /= 2;
                        copy_height /= 2;
                        xs /= 2;
                        ys /= 2;
                    }

                    let Some(out_plane) = img.plane_mut(channel) else {
                        continue;
                    };

                    for py in 0..copy_height as usize {
                        let src_start = py * tile_plane.stride;
                        let dst_start = xs as usize + (ys as usize + py) * out_plane.stride;
                        out_plane.data[dst_start..dst_start + copy_width as usize]
                            .copy_from_slice(
                                &tile_plane.data[src_start..src_start + copy_width as usize],
                            );
                    }
                }

                x0 += src_width;
                reference_idx += 1;
            }

            y0 += tile_height;
        }

        Ok(img)
    }

    fn decode_derived_image(&self, item_id: ItemId, depth: u32) -> Result<PixelImage> {
        let iref = self.file.iref().ok_or(Error::with_message(
            ErrorCode::InvalidInput,
            SubError::NoIrefBox,
            "No iref box available, but needed for iden image",
        ))?;

        let image_references = iref.references_from(item_id);
        if image_references.len() != 1 {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::MissingGridImages,
                "'iden' image with more than one reference image",
            ));
        }

        self.decode_image_at_depth(
            image_references[0],
            &DecodingOptions::default(),
            depth + 1,
        )
    }

    fn decode_overlay_image(
        &self,
        item_id: ItemId,
        overlay_data: &[u8],
        depth: u32,
    ) -> Result<PixelImage> {
        let iref = self.file.iref().ok_or(Error::with_message(
            ErrorCode::InvalidInput,
            SubError::NoIrefBox,
            "No iref box available, but needed for iovl image",
        ))?;

        let image_references = iref.references_from(item_id);

        let overlay = ImageOverlay::parse(image_references.len(), overlay_data)?;

        if image_references.len() != overlay.offsets.len() {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::InvalidOverlayData,
                "Number of image offsets does not match the number of image references",
            ));
        }

        let w = overlay.width;
        let h = overlay.height;

        // The background color is an RGB value, so the canvas is composed
        // in RGB 4:4:4.
        let mut img = PixelImage::create(w, h, Colorspace::Rgb, Chroma::C444);
        img.add_plane(Channel::R, w, h, 8)?;
        img.add_plane(Channel::G, w, h, 8)?;
        img.add_plane(Channel::B, w, h, 8)?;

        let [r, g, b, a] = overlay.background_color;
        img.fill_rgb_16bit(r, g, b, a);

        for (i, &ref_id) in image_references.iter().enumerate() {
            let overlay_img =
                self.decode_image_at_depth(ref_id, &DecodingOptions::default(), depth + 1)?;
            let overlay_img = overlay_img.convert_colorspace(Colorspace::Rgb, Chroma::C444)?;

            let (dx, dy) = overlay.offsets[i];
            match img.overlay(&overlay_img, i64::from(dx), i64::from(dy)) {
                Ok(()) => {}
                Err(err) if err.sub_code == SubError::OverlayImageOutsideOfCanvas => {
                    // The only swallowed error: the image is simply not
                    // visible on the canvas.
                    debug!("overlay image {ref_id} is entirely off-canvas");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(img)
    }
}

// --- tiny binary payload readers ----------------------------------------

fn readvec(data: &[u8], ptr: &mut usize, len: usize) -> u32 {
    let mut val = 0u32;
    for _ in 0..len {
        val = (val << 8) | u32::from(data[*ptr]);
        *ptr += 1;
    }
    val
}

fn readvec_signed(data: &[u8], ptr: &mut usize, len: usize) -> i32 {
    let high_bit = 0x80u32 << ((len - 1) * 8);

    let mut val = readvec(data, ptr, len);
    let negative = (val & high_bit) != 0;
    val &= !high_bit;

    if negative {
        -((high_bit - val) as i64) as i32
    } else {
        val as i32
    }
}

/// The raw payload of a 'grid' item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageGrid {
    pub rows: u16,
    pub columns: u16,
    pub output_width: u32,
    pub output_height: u32,
}

impl ImageGrid {
    pub fn parse(data: &[u8]) -> Result<ImageGrid> {
        if data.len() < 8 {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::InvalidGridData,
                "Less than 8 bytes of data",
            ));
        }

        // data[0] is the version; it is unused.
        let flags = data[1];
        let rows = u16::from(data[2]) + 1;
        let columns = u16::from(data[3]) + 1;

        let (output_width, output_height) = if flags & 1 != 0 {
            if data.len() < 12 {
                return Err(Error::with_message(
                    ErrorCode::InvalidInput,
                    SubError::InvalidGridData,
                    "Grid image data incomplete",
                ));
            }
            let mut ptr = 4;
            (readvec(data, &mut ptr, 4), readvec(data, &mut ptr, 4))
        } else {
            let mut ptr = 4;
            (readvec(data, &mut ptr, 2), readvec(data, &mut ptr, 2))
        };

        Ok(ImageGrid {
            rows,
            columns,
            output_width,
            output_height,
        })
    }
}

/// The raw payload of an 'iovl' item.
#[derive(Debug)]
pub(crate) struct ImageOverlay {
    pub background_color: [u16; 4],
    pub width: u32,
    pub height: u32,
    pub offsets: TryVec<(i32, i32)>,
}

impl ImageOverlay {
    pub fn parse(num_images: usize, data: &[u8]) -> Result<ImageOverlay> {
        let eof_error = || {
            Error::with_message(
                ErrorCode::InvalidInput,
                SubError::InvalidGridData,
                "Overlay image data incomplete",
            )
        };

        if data.len() < 2 + 4 * 2 {
            return Err(eof_error());
        }

        let version = data[0];
        let flags = data[1];

        if version != 0 {
            return Err(Error::with_message(
                ErrorCode::UnsupportedFeature,
                SubError::UnsupportedDataVersion,
                format!("Overlay image data version {version} is not implemented yet"),
            ));
        }

        let field_len = if flags & 1 != 0 { 4 } else { 2 };
        let mut ptr = 2;

        if ptr + 4 * 2 + 2 * field_len + num_images * 2 * field_len > data.len() {
            return Err(eof_error());
        }

        let mut background_color = [0u16; 4];
        for color in &mut background_color {
            *color = readvec(data, &mut ptr, 2) as u16;
        }

        let width = readvec(data, &mut ptr, field_len);
        let height = readvec(data, &mut ptr, field_len);

        let mut offsets = TryVec::new();
        for _ in 0..num_images {
            let x = readvec_signed(data, &mut ptr, field_len);
            let y = readvec_signed(data, &mut ptr, field_len);
            offsets.push((x, y))?;
        }

        Ok(ImageOverlay {
            background_color,
            width,
            height,
            offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_payload_16_bit_fields() {
        let data = [0u8, 0, 1, 1, 0x00, 0x80, 0x00, 0x60];
        let grid = ImageGrid::parse(&data).unwrap();
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.columns, 2);
        assert_eq!(grid.output_width, 128);
        assert_eq!(grid.output_height, 96);
    }

    #[test]
    fn grid_payload_32_bit_fields() {
        let mut data = vec![0u8, 1, 0, 3];
        data.extend_from_slice(&70000u32.to_be_bytes());
        data.extend_from_slice(&48u32.to_be_bytes());
        let grid = ImageGrid::parse(&data).unwrap();
        assert_eq!(grid.rows, 1);
        assert_eq!(grid.columns, 4);
        assert_eq!(grid.output_width, 70000);
        assert_eq!(grid.output_height, 48);
    }

    #[test]
    fn grid_payload_too_short() {
        let err = ImageGrid::parse(&[0, 0, 1]).unwrap_err();
        assert_eq!(err.sub_code, SubError::InvalidGridData);
        let err = ImageGrid::parse(&[0, 1, 1, 1, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.sub_code, SubError::InvalidGridData);
    }

    fn overlay_payload(flags: u8, offsets: &[(i32, i32)]) -> Vec<u8> {
        let field_len = if flags & 1 != 0 { 4 } else { 2 };
        let mut data = vec![0u8, flags];
        for color in [0xFFFFu16, 0, 0, 0xFFFF] {
            data.extend_from_slice(&color.to_be_bytes());
        }
        // canvas 100x100
        if field_len == 4 {
            data.extend_from_slice(&100u32.to_be_bytes());
            data.extend_from_slice(&100u32.to_be_bytes());
        } else {
            data.extend_from_slice(&100u16.to_be_bytes());
            data.extend_from_slice(&100u16.to_be_bytes());
        }
        for &(x, y) in offsets {
            if field_len == 4 {
                data.extend_from_slice(&(x as u32).to_be_bytes());
                data.extend_from_slice(&(y as u32).to_be_bytes());
            } else {
                data.extend_from_slice(&(x as u16).to_be_bytes());
                data.extend_from_slice(&(y as u16).to_be_bytes());
            }
        }
        data
    }

    #[test]
    fn overlay_payload_with_negative_offsets() {
        let data = overlay_payload(0, &[(-50, -50)]);
        let overlay = ImageOverlay::parse(1, &data).unwrap();
        assert_eq!(overlay.background_color, [0xFFFF, 0, 0, 0xFFFF]);
        assert_eq!(overlay.width, 100);
        assert_eq!(overlay.height, 100);
        assert_eq!(&*overlay.offsets, &[(-50, -50)]);
    }

    #[test]
    fn overlay_payload_32_bit_offsets() {
        let data = overlay_payload(1, &[(70000, -3)]);
        let overlay = ImageOverlay::parse(1, &data).unwrap();
        assert_eq!(&*overlay.offsets, &[(70000, -3)]);
    }

    #[test]
    fn overlay_version_and_truncation() {
        let mut data = overlay_payload(0, &[(0, 0)]);
        data[0] = 1;
        let err = ImageOverlay::parse(1, &data).unwrap_err();
        assert_eq!(err.sub_code, SubError::UnsupportedDataVersion);

        let data = overlay_payload(0, &[]);
        let err = ImageOverlay::parse(3, &data).unwrap_err();
        assert_eq!(err.sub_code, SubError::InvalidGridData);
    }

    #[test]
    fn readvec_signed_two_byte() {
        let data = [0x80u8, 0x32, 0x00, 0x32];
        let mut ptr = 0;
        assert_eq!(readvec_signed(&data, &mut ptr, 2), -(0x8000 - 0x32));
        assert_eq!(readvec_signed(&data, &mut ptr, 2), 0x32);
    }
}
