// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The decoder plugin boundary.
//!
//! The bitstream decoder is pluggable: a registered [`DecoderPlugin`]
//! announces which compression formats it supports with a priority, and
//! produces per-decode [`Decoder`] instances that accept a framed byte
//! stream and return one planar image. The registry is a plain value owned
//! by the context; registration before decoding is sufficient because
//! decodes are synchronous.

use crate::error::Result;
use crate::image::PixelImage;

/// The plugin ABI version this crate understands.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Compression formats a plugin may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompressionFormat {
    Undefined,
    Hevc,
    Avc,
    Jpeg,
}

/// A stateless decoder factory registered with the context.
pub trait DecoderPlugin {
    /// Must equal [`PLUGIN_API_VERSION`]; mismatches reject registration.
    fn api_version(&self) -> u32 {
        PLUGIN_API_VERSION
    }

    /// Priority for the given format; 0 means unsupported. The highest
    /// priority across all registered plugins wins.
    fn does_support_format(&self, format: CompressionFormat) -> i32;

    /// Create a fresh decoder instance for one image.
    fn new_decoder(&self) -> Result<Box<dyn Decoder>>;
}

/// A single-use decoder. Dropped after each decode.
pub trait Decoder {
    /// Push the complete compressed bitstream (for HEVC: the hvcC
    /// parameter sets followed by the slice data, all length-prefixed).
    fn push_data(&mut self, data: &[u8]) -> Result<()>;

    /// Decode one image. `Ok(None)` means the plugin produced no image,
    /// which the caller reports as a decoder plugin error.
    fn decode_image(&mut self) -> Result<Option<PixelImage>>;
}
