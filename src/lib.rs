#![deny(unsafe_code)]
//! Reader for HEIC/HEIF still images (ISO Base Media File Format).
//!
//! This crate parses the ISOBMFF container of HEVC-coded still images,
//! resolves the logical image graph (primary image, thumbnails, alpha and
//! depth auxiliaries, EXIF metadata) and assembles final pixel images,
//! including grid tiling, identity derivation, overlay composition and the
//! irot/imir/clap transformation chain.
//!
//! The HEVC bitstream decoder itself is pluggable: register a
//! [`DecoderPlugin`] before decoding.
//!
//! ```no_run
//! use heif_reader::HeifContext;
//!
//! let data = std::fs::read("image.heic")?;
//! let context = HeifContext::from_bytes(&data)?;
//! let primary = context.primary_image_handle()?;
//! println!("{}x{}", primary.width(), primary.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod bitstream;
mod boxes;
mod context;
mod error;
mod file;
mod image;
mod plugin;
mod sei;

pub use bitstream::BitstreamRange;
pub use boxes::{FourCC, Fraction};
pub use context::{DecodingOptions, HeifContext, ImageMetadata, ItemId};
pub use error::{Error, ErrorCode, Result, SubError};
pub use image::{Channel, Chroma, Colorspace, PixelImage, Plane};
pub use plugin::{CompressionFormat, Decoder, DecoderPlugin, PLUGIN_API_VERSION};
pub use sei::{DepthRepresentationInfo, DepthRepresentationType};

/// A lightweight handle to one logical image in a [`HeifContext`].
///
/// Handles borrow the context; decoded pixel images are owned by the
/// caller.
#[derive(Clone, Copy)]
pub struct ImageHandle<'a> {
    context: &'a HeifContext<'a>,
    id: ItemId,
}

impl<'data> HeifContext<'data> {
    /// Handle to the primary image.
    pub fn primary_image_handle(&self) -> Result<ImageHandle<'_>> {
        let id = self.primary_image_id_opt().ok_or(Error::new(
            ErrorCode::InvalidInput,
            SubError::NoOrInvalidPrimaryImage,
        ))?;
        Ok(ImageHandle { context: self, id })
    }

    /// Handle to a top-level image by item id.
    pub fn image_handle(&self, id: ItemId) -> Result<ImageHandle<'_>> {
        if self.is_top_level_image_id(id) {
            Ok(ImageHandle { context: self, id })
        } else {
            Err(Error::new(
                ErrorCode::UsageError,
                SubError::NonexistingImageReferenced,
            ))
        }
    }

    /// Handles to all top-level images, ascending by item id.
    pub fn top_level_image_handles(&self) -> Vec<ImageHandle<'_>> {
        self.top_level_image_ids()
            .iter()
            .map(|&id| ImageHandle { context: self, id })
            .collect()
    }
}

impl<'a> ImageHandle<'a> {
    fn handle(&self, id: ItemId) -> ImageHandle<'a> {
        ImageHandle {
            context: self.context,
            id,
        }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn is_primary(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.is_primary)
    }

    /// Displayed width, after clap/irot are taken into account.
    pub fn width(&self) -> u32 {
        self.context.image_record(self.id).map_or(0, |r| r.width)
    }

    /// Displayed height, after clap/irot are taken into account.
    pub fn height(&self) -> u32 {
        self.context.image_record(self.id).map_or(0, |r| r.height)
    }

    pub fn is_thumbnail(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.thumbnail_of.is_some())
    }

    pub fn thumbnail_count(&self) -> usize {
        self.context
            .image_record(self.id)
            .map_or(0, |r| r.thumbnails.len())
    }

    pub fn thumbnail(&self, index: usize) -> Result<ImageHandle<'a>> {
        self.context
            .image_record(self.id)
            .and_then(|r| r.thumbnails.get(index).copied())
            .map(|id| self.handle(id))
            .ok_or(Error::new(
                ErrorCode::UsageError,
                SubError::NonexistingImageReferenced,
            ))
    }

    pub fn thumbnails(&self) -> Vec<ImageHandle<'a>> {
        self.context
            .image_record(self.id)
            .map_or_else(Vec::new, |r| {
                r.thumbnails.iter().map(|&id| self.handle(id)).collect()
            })
    }

    /// True if this image is itself the alpha plane of another image.
    pub fn is_alpha_channel(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.alpha_of.is_some())
    }

    /// True if this image is itself the depth map of another image.
    pub fn is_depth_channel(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.depth_of.is_some())
    }

    pub fn has_alpha_channel(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.alpha_child.is_some())
    }

    pub fn has_depth_channel(&self) -> bool {
        self.context
            .image_record(self.id)
            .map_or(false, |r| r.depth_child.is_some())
    }

    pub fn alpha_channel(&self) -> Option<ImageHandle<'a>> {
        let id = self.context.image_record(self.id)?.alpha_child?;
        Some(self.handle(id))
    }

    pub fn depth_channel(&self) -> Option<ImageHandle<'a>> {
        let id = self.context.image_record(self.id)?.depth_child?;
        Some(self.handle(id))
    }

    pub fn depth_representation_info(&self) -> Option<&'a DepthRepresentationInfo> {
        self.context.image_record(self.id)?.depth_info.as_ref()
    }

    pub fn metadata_count(&self) -> usize {
        self.context
            .image_record(self.id)
            .map_or(0, |r| r.metadata.len())
    }

    pub fn metadata(&self, index: usize) -> Result<&'a ImageMetadata> {
        self.context
            .image_record(self.id)
            .and_then(|r| r.metadata.get(index))
            .ok_or(Error::new(ErrorCode::UsageError, SubError::IndexOutOfRange))
    }

    /// Decode this image in its native colorspace.
    pub fn decode(&self, options: &DecodingOptions) -> Result<PixelImage> {
        self.context.decode_image(self.id, options)
    }

    /// Decode and convert to the requested colorspace/chroma.
    /// `Undefined` keeps the decoded value.
    pub fn decode_as(
        &self,
        colorspace: Colorspace,
        chroma: Chroma,
        options: &DecodingOptions,
    ) -> Result<PixelImage> {
        let img = self.context.decode_image(self.id, options)?;

        let target_chroma = if chroma == Chroma::Undefined {
            img.chroma()
        } else {
            chroma
        };
        let target_colorspace = if colorspace == Colorspace::Undefined {
            img.colorspace()
        } else {
            colorspace
        };

        if target_chroma != img.chroma() || target_colorspace != img.colorspace() {
            img.convert_colorspace(target_colorspace, target_chroma)
        } else {
            Ok(img)
        }
    }
}
