// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planar pixel images and the pixel operations used by the assembler.
//!
//! Planes are tightly packed 8-bit rows (`stride == width`). The assembler
//! builds YCbCr 4:2:0 outputs for grids and RGB 4:4:4 canvases for
//! overlays; the transform chain rotates, mirrors and crops whole images.

use fallible_collections::{TryClone, TryVec};

use crate::error::{Error, ErrorCode, Result, SubError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    Undefined,
    YCbCr,
    Rgb,
    Monochrome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    Undefined,
    Monochrome,
    C420,
    C422,
    C444,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Y,
    Cb,
    Cr,
    R,
    G,
    B,
    Alpha,
}

#[derive(Debug)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub stride: usize,
    pub data: TryVec<u8>,
}

impl Plane {
    fn try_clone(&self) -> Result<Plane> {
        Ok(Plane {
            width: self.width,
            height: self.height,
            bit_depth: self.bit_depth,
            stride: self.stride,
            data: self.data.try_clone()?,
        })
    }

    fn alloc(width: u32, height: u32, bit_depth: u8) -> Result<Plane> {
        let size = (width as usize)
            .checked_mul(height as usize)
            .ok_or(Error::new(
                ErrorCode::MemoryAllocationError,
                SubError::SecurityLimitExceeded,
            ))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| {
            Error::new(ErrorCode::MemoryAllocationError, SubError::Unspecified)
        })?;
        data.resize(size, 0);
        Ok(Plane {
            width,
            height,
            bit_depth,
            stride: width as usize,
            data: data.into(),
        })
    }
}

/// A decoded planar image.
#[derive(Debug)]
pub struct PixelImage {
    width: u32,
    height: u32,
    colorspace: Colorspace,
    chroma: Chroma,
    planes: Vec<(Channel, Plane)>,
}

impl PixelImage {
    pub fn create(width: u32, height: u32, colorspace: Colorspace, chroma: Chroma) -> Self {
        Self {
            width,
            height,
            colorspace,
            chroma,
            planes: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    pub fn chroma(&self) -> Chroma {
        self.chroma
    }

    pub fn add_plane(&mut self, channel: Channel, width: u32, height: u32, bit_depth: u8) -> Result<()> {
        let plane = Plane::alloc(width, height, bit_depth)?;
        self.planes.retain(|(c, _)| *c != channel);
        self.planes.push((channel, plane));
        Ok(())
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.planes.iter().any(|(c, _)| *c == channel)
    }

    pub fn plane(&self, channel: Channel) -> Option<&Plane> {
        self.planes
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, p)| p)
    }

    pub fn plane_mut(&mut self, channel: Channel) -> Option<&mut Plane> {
        self.planes
            .iter_mut()
            .find(|(c, _)| *c == channel)
            .map(|(_, p)| p)
    }

    fn take_plane(&mut self, channel: Channel) -> Option<Plane> {
        let idx = self.planes.iter().position(|(c, _)| *c == channel)?;
        Some(self.planes.remove(idx).1)
    }

    /// Copy `src_channel` of `src` into this image as `dst_channel`.
    pub fn transfer_plane_from_image_as(
        &mut self,
        src: &PixelImage,
        src_channel: Channel,
        dst_channel: Channel,
    ) -> Result<()> {
        let plane = src.plane(src_channel).ok_or(Error::new(
            ErrorCode::InvalidInput,
            SubError::NoItemData,
        ))?;
        let plane = plane.try_clone()?;
        self.planes.retain(|(c, _)| *c != dst_channel);
        self.planes.push((dst_channel, plane));
        Ok(())
    }

    /// Rotate counter-clockwise by 0, 90, 180 or 270 degrees.
    pub fn rotate_ccw(self, angle_degrees: u16) -> Result<PixelImage> {
        if angle_degrees == 0 {
            return Ok(self);
        }

        let (out_width, out_height) = match angle_degrees {
            90 | 270 => (self.height, self.width),
            180 => (self.width, self.height),
            _ => {
                return Err(Error::new(
                    ErrorCode::UnsupportedFeature,
                    SubError::Unspecified,
                ))
            }
        };

        let mut out = PixelImage::create(out_width, out_height, self.colorspace, self.chroma);
        for (channel, plane) in &self.planes {
            let (pw, ph) = (plane.width as usize, plane.height as usize);
            let (ow, oh) = match angle_degrees {
                90 | 270 => (plane.height, plane.width),
                _ => (plane.width, plane.height),
            };
            let mut dst = Plane::alloc(ow, oh, plane.bit_depth)?;
            for y in 0..oh as usize {
                for x in 0..ow as usize {
                    let (sx, sy) = match angle_degrees {
                        90 => (pw - 1 - y, x),
                        180 => (pw - 1 - x, ph - 1 - y),
                        _ => (y, ph - 1 - x),
                    };
                    dst.data[y * dst.stride + x] = plane.data[sy * plane.stride + sx];
                }
            }
            out.planes.push((*channel, dst));
        }
        Ok(out)
    }

    /// Mirror in place. A horizontal-axis mirror flips the rows; a
    /// vertical-axis mirror reverses each row.
    pub fn mirror_inplace(&mut self, horizontal_axis: bool) {
        for (_, plane) in &mut self.planes {
            let stride = plane.stride;
            let height = plane.height as usize;
            if horizontal_axis {
                for y in 0..height / 2 {
                    let (top, rest) = plane.data.split_at_mut((height - 1 - y) * stride);
                    let top_row = &mut top[y * stride..y * stride + stride];
                    let bottom_row = &mut rest[..stride];
                    top_row.swap_with_slice(bottom_row);
                }
            } else {
                for y in 0..height {
                    plane.data[y * stride..y * stride + stride].reverse();
                }
            }
        }
    }

    fn chroma_subsampling(&self, channel: Channel) -> (u32, u32) {
        match channel {
            Channel::Cb | Channel::Cr => match self.chroma {
                Chroma::C420 => (2, 2),
                Chroma::C422 => (2, 1),
                _ => (1, 1),
            },
            _ => (1, 1),
        }
    }

    /// Crop to the inclusive window `[left, right] x [top, bottom]`.
    pub fn crop(self, left: u32, right: u32, top: u32, bottom: u32) -> Result<PixelImage> {
        let out_width = right - left + 1;
        let out_height = bottom - top + 1;
        let mut out = PixelImage::create(out_width, out_height, self.colorspace, self.chroma);

        for (channel, plane) in &self.planes {
            let (sub_x, sub_y) = self.chroma_subsampling(*channel);
            let (pl, pr) = (left / sub_x, right / sub_x);
            let (pt, pb) = (top / sub_y, bottom / sub_y);
            let pw = pr - pl + 1;
            let ph = pb - pt + 1;

            let mut dst = Plane::alloc(pw, ph, plane.bit_depth)?;
            for y in 0..ph as usize {
                let src_start = (pt as usize + y) * plane.stride + pl as usize;
                let dst_start = y * dst.stride;
                dst.data[dst_start..dst_start + pw as usize]
                    .copy_from_slice(&plane.data[src_start..src_start + pw as usize]);
            }
            out.planes.push((*channel, dst));
        }
        Ok(out)
    }

    /// Fill the R/G/B (and alpha, if allocated) planes from 16-bit color
    /// components; 8-bit planes take the high byte.
    pub fn fill_rgb_16bit(&mut self, r: u16, g: u16, b: u16, a: u16) {
        for (channel, value) in [
            (Channel::R, r),
            (Channel::G, g),
            (Channel::B, b),
            (Channel::Alpha, a),
        ] {
            if let Some(plane) = self.plane_mut(channel) {
                plane.data.fill((value >> 8) as u8);
            }
        }
    }

    /// Blit `overlay` onto this canvas at the signed offset. A placement
    /// entirely outside the canvas is an error the caller may choose to
    /// swallow.
    pub fn overlay(&mut self, overlay: &PixelImage, dx: i64, dy: i64) -> Result<()> {
        let canvas_w = i64::from(self.width);
        let canvas_h = i64::from(self.height);
        let ov_w = i64::from(overlay.width);
        let ov_h = i64::from(overlay.height);

        if dx >= canvas_w || dy >= canvas_h || dx + ov_w <= 0 || dy + ov_h <= 0 {
            return Err(Error::new(
                ErrorCode::InvalidInput,
                SubError::OverlayImageOutsideOfCanvas,
            ));
        }

        let x_start = dx.max(0);
        let y_start = dy.max(0);
        let x_end = (dx + ov_w).min(canvas_w);
        let y_end = (dy + ov_h).min(canvas_h);

        for channel in [Channel::R, Channel::G, Channel::B] {
            let Some(src) = overlay.plane(channel) else {
                continue;
            };
            let Some(dst) = self.plane_mut(channel) else {
                continue;
            };
            for y in y_start..y_end {
                let src_y = (y - dy) as usize;
                let src_x0 = (x_start - dx) as usize;
                let count = (x_end - x_start) as usize;
                let src_row = &src.data[src_y * src.stride + src_x0..][..count];
                let dst_start = y as usize * dst.stride + x_start as usize;
                dst.data[dst_start..dst_start + count].copy_from_slice(src_row);
            }
        }
        Ok(())
    }

    /// Convert to the requested colorspace/chroma, or fail with
    /// `UnsupportedColorConversion`.
    pub fn convert_colorspace(
        mut self,
        colorspace: Colorspace,
        chroma: Chroma,
    ) -> Result<PixelImage> {
        if self.colorspace == colorspace && self.chroma == chroma {
            return Ok(self);
        }

        match (self.colorspace, colorspace, chroma) {
            (Colorspace::YCbCr, Colorspace::Rgb, Chroma::C444) => self.ycbcr_to_rgb444(),
            (Colorspace::Monochrome, Colorspace::Rgb, Chroma::C444) => {
                let y = self.take_plane(Channel::Y).ok_or(Error::new(
                    ErrorCode::UnsupportedFeature,
                    SubError::UnsupportedColorConversion,
                ))?;
                let alpha = self.take_plane(Channel::Alpha);
                let mut out =
                    PixelImage::create(self.width, self.height, Colorspace::Rgb, Chroma::C444);
                out.planes.push((Channel::R, y.try_clone()?));
                out.planes.push((Channel::G, y.try_clone()?));
                out.planes.push((Channel::B, y));
                if let Some(alpha) = alpha {
                    out.planes.push((Channel::Alpha, alpha));
                }
                Ok(out)
            }
            _ => Err(Error::new(
                ErrorCode::UnsupportedFeature,
                SubError::UnsupportedColorConversion,
            )),
        }
    }

    fn ycbcr_to_rgb444(mut self) -> Result<PixelImage> {
        let y_plane = self.take_plane(Channel::Y).ok_or(Error::new(
            ErrorCode::UnsupportedFeature,
            SubError::UnsupportedColorConversion,
        ))?;
        let cb_plane = self.take_plane(Channel::Cb);
        let cr_plane = self.take_plane(Channel::Cr);
        let alpha = self.take_plane(Channel::Alpha);

        let (sub_x, sub_y) = match self.chroma {
            Chroma::C420 => (2u32, 2u32),
            Chroma::C422 => (2, 1),
            Chroma::C444 => (1, 1),
            _ => {
                return Err(Error::new(
                    ErrorCode::UnsupportedFeature,
                    SubError::UnsupportedColorConversion,
                ))
            }
        };

        let width = self.width;
        let height = self.height;
        let mut r_plane = Plane::alloc(width, height, 8)?;
        let mut g_plane = Plane::alloc(width, height, 8)?;
        let mut b_plane = Plane::alloc(width, height, 8)?;

        // Full-range BT.601, 16.16 fixed point.
        const CR_R: i32 = 91881;
        const CB_G: i32 = 22554;
        const CR_G: i32 = 46802;
        const CB_B: i32 = 116130;

        for py in 0..height as usize {
            for px in 0..width as usize {
                let y = i32::from(y_plane.data[py * y_plane.stride + px]);
                let (cb, cr) = match (&cb_plane, &cr_plane) {
                    (Some(cb_p), Some(cr_p)) => {
                        let cx = px / sub_x as usize;
                        let cy = py / sub_y as usize;
                        (
                            i32::from(cb_p.data[cy * cb_p.stride + cx]) - 128,
                            i32::from(cr_p.data[cy * cr_p.stride + cx]) - 128,
                        )
                    }
                    _ => (0, 0),
                };

                let r = y + ((CR_R * cr + 32768) >> 16);
                let g = y - ((CB_G * cb + CR_G * cr + 32768) >> 16);
                let b = y + ((CB_B * cb + 32768) >> 16);

                let idx = py * width as usize + px;
                r_plane.data[idx] = r.clamp(0, 255) as u8;
                g_plane.data[idx] = g.clamp(0, 255) as u8;
                b_plane.data[idx] = b.clamp(0, 255) as u8;
            }
        }

        let mut out = PixelImage::create(width, height, Colorspace::Rgb, Chroma::C444);
        out.planes.push((Channel::R, r_plane));
        out.planes.push((Channel::G, g_plane));
        out.planes.push((Channel::B, b_plane));
        if let Some(alpha) = alpha {
            out.planes.push((Channel::Alpha, alpha));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_image(width: u32, height: u32) -> PixelImage {
        let mut img = PixelImage::create(width, height, Colorspace::YCbCr, Chroma::C420);
        img.add_plane(Channel::Y, width, height, 8).unwrap();
        img.add_plane(Channel::Cb, width / 2, height / 2, 8).unwrap();
        img.add_plane(Channel::Cr, width / 2, height / 2, 8).unwrap();
        img
    }

    #[test]
    fn rotate_90_ccw_moves_right_column_to_top_row() {
        let mut img = PixelImage::create(2, 3, Colorspace::Monochrome, Chroma::Monochrome);
        img.add_plane(Channel::Y, 2, 3, 8).unwrap();
        let plane = img.plane_mut(Channel::Y).unwrap();
        plane.data.copy_from_slice(&[1, 2, 3, 4, 5, 6]);

        let rotated = img.rotate_ccw(90).unwrap();
        assert_eq!(rotated.width(), 3);
        assert_eq!(rotated.height(), 2);
        let plane = rotated.plane(Channel::Y).unwrap();
        assert_eq!(&*plane.data, &[2, 4, 6, 1, 3, 5]);
    }

    #[test]
    fn rotate_180_reverses_both_axes() {
        let mut img = PixelImage::create(2, 2, Colorspace::Monochrome, Chroma::Monochrome);
        img.add_plane(Channel::Y, 2, 2, 8).unwrap();
        img.plane_mut(Channel::Y).unwrap().data.copy_from_slice(&[1, 2, 3, 4]);
        let rotated = img.rotate_ccw(180).unwrap();
        assert_eq!(&*rotated.plane(Channel::Y).unwrap().data, &[4, 3, 2, 1]);
    }

    #[test]
    fn mirror_horizontal_axis_flips_rows() {
        let mut img = PixelImage::create(2, 2, Colorspace::Monochrome, Chroma::Monochrome);
        img.add_plane(Channel::Y, 2, 2, 8).unwrap();
        img.plane_mut(Channel::Y).unwrap().data.copy_from_slice(&[1, 2, 3, 4]);
        img.mirror_inplace(true);
        assert_eq!(&*img.plane(Channel::Y).unwrap().data, &[3, 4, 1, 2]);
    }

    #[test]
    fn mirror_vertical_axis_reverses_rows() {
        let mut img = PixelImage::create(2, 2, Colorspace::Monochrome, Chroma::Monochrome);
        img.add_plane(Channel::Y, 2, 2, 8).unwrap();
        img.plane_mut(Channel::Y).unwrap().data.copy_from_slice(&[1, 2, 3, 4]);
        img.mirror_inplace(false);
        assert_eq!(&*img.plane(Channel::Y).unwrap().data, &[2, 1, 4, 3]);
    }

    #[test]
    fn crop_divides_chroma_coordinates() {
        let img = gray_image(8, 8);
        let cropped = img.crop(2, 5, 2, 5).unwrap();
        assert_eq!(cropped.width(), 4);
        assert_eq!(cropped.height(), 4);
        let cb = cropped.plane(Channel::Cb).unwrap();
        assert_eq!(cb.width, 2);
        assert_eq!(cb.height, 2);
    }

    #[test]
    fn overlay_clips_and_rejects_fully_outside() {
        let mut canvas = PixelImage::create(4, 4, Colorspace::Rgb, Chroma::C444);
        canvas.add_plane(Channel::R, 4, 4, 8).unwrap();
        canvas.add_plane(Channel::G, 4, 4, 8).unwrap();
        canvas.add_plane(Channel::B, 4, 4, 8).unwrap();

        let mut sprite = PixelImage::create(2, 2, Colorspace::Rgb, Chroma::C444);
        sprite.add_plane(Channel::R, 2, 2, 8).unwrap();
        sprite.add_plane(Channel::G, 2, 2, 8).unwrap();
        sprite.add_plane(Channel::B, 2, 2, 8).unwrap();
        sprite.plane_mut(Channel::R).unwrap().data.fill(200);

        // Clipped at the top-left corner: only the bottom-right sprite pixel lands.
        canvas.overlay(&sprite, -1, -1).unwrap();
        assert_eq!(canvas.plane(Channel::R).unwrap().data[0], 200);
        assert_eq!(canvas.plane(Channel::R).unwrap().data[1], 0);

        let err = canvas.overlay(&sprite, -2, -2).unwrap_err();
        assert_eq!(err.sub_code, SubError::OverlayImageOutsideOfCanvas);
        let err = canvas.overlay(&sprite, 4, 0).unwrap_err();
        assert_eq!(err.sub_code, SubError::OverlayImageOutsideOfCanvas);
    }

    #[test]
    fn fill_rgb_takes_high_byte() {
        let mut canvas = PixelImage::create(2, 2, Colorspace::Rgb, Chroma::C444);
        canvas.add_plane(Channel::R, 2, 2, 8).unwrap();
        canvas.add_plane(Channel::G, 2, 2, 8).unwrap();
        canvas.add_plane(Channel::B, 2, 2, 8).unwrap();
        canvas.fill_rgb_16bit(0xFFFF, 0x1234, 0, 0xFFFF);
        assert_eq!(canvas.plane(Channel::R).unwrap().data[0], 0xFF);
        assert_eq!(canvas.plane(Channel::G).unwrap().data[0], 0x12);
        assert_eq!(canvas.plane(Channel::B).unwrap().data[0], 0);
    }

    #[test]
    fn ycbcr_gray_converts_to_equal_rgb() {
        let mut img = gray_image(2, 2);
        img.plane_mut(Channel::Y).unwrap().data.fill(120);
        img.plane_mut(Channel::Cb).unwrap().data.fill(128);
        img.plane_mut(Channel::Cr).unwrap().data.fill(128);
        let rgb = img.convert_colorspace(Colorspace::Rgb, Chroma::C444).unwrap();
        assert_eq!(rgb.plane(Channel::R).unwrap().data[0], 120);
        assert_eq!(rgb.plane(Channel::G).unwrap().data[0], 120);
        assert_eq!(rgb.plane(Channel::B).unwrap().data[0], 120);
    }

    #[test]
    fn transfer_plane_installs_alpha() {
        let mut target = gray_image(4, 4);
        let mut alpha_src = gray_image(4, 4);
        alpha_src.plane_mut(Channel::Y).unwrap().data.fill(77);
        target
            .transfer_plane_from_image_as(&alpha_src, Channel::Y, Channel::Alpha)
            .unwrap();
        assert!(target.has_channel(Channel::Alpha));
        assert_eq!(target.plane(Channel::Alpha).unwrap().data[0], 77);
    }
}
