// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests over synthetic in-memory HEIF files.
//!
//! The builder below assembles minimal but structurally complete files
//! (ftyp + meta + mdat); the fake decoder plugin consumes the
//! length-prefixed stream produced by the hvcC prelude logic and turns a
//! trailing descriptor chunk into a solid or row-gradient YCbCr image.

use heif_reader::{
    Channel, Chroma, Colorspace, CompressionFormat, Decoder, DecoderPlugin, DecodingOptions,
    DepthRepresentationType, ErrorCode, HeifContext, PixelImage, Result, SubError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// --- box builder ---------------------------------------------------------

fn bx(box_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(payload);
    out
}

fn full(box_type: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&((u32::from(version) << 24) | flags).to_be_bytes());
    body.extend_from_slice(payload);
    bx(box_type, &body)
}

fn infe_v2(item_id: u16, item_type: &[u8; 4], hidden: bool) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&item_id.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes()); // protection index
    payload.extend_from_slice(item_type);
    payload.push(0); // empty item name
    full(b"infe", 2, u32::from(hidden), &payload)
}

fn ispe_prop(width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&width.to_be_bytes());
    payload.extend_from_slice(&height.to_be_bytes());
    full(b"ispe", 0, 0, &payload)
}

fn hvcc_prop() -> Vec<u8> {
    let mut p = Vec::new();
    p.push(1); // configuration version
    p.push(0x01); // profile space 0, tier 0, profile idc 1
    p.extend_from_slice(&0x6000_0000u32.to_be_bytes());
    p.extend_from_slice(&[0x90, 0, 0, 0, 0, 0]);
    p.push(93); // level idc
    p.extend_from_slice(&0u16.to_be_bytes());
    p.push(0); // parallelism
    p.push(1); // chroma format 4:2:0
    p.push(0); // bit depth luma - 8
    p.push(0); // bit depth chroma - 8
    p.extend_from_slice(&0u16.to_be_bytes());
    p.push(0x03); // length size 4
    p.push(2); // two parameter set arrays
    p.push(0x20); // VPS
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&3u16.to_be_bytes());
    p.extend_from_slice(&[0x40, 0x01, 0x0C]);
    p.push(0x21); // SPS
    p.extend_from_slice(&1u16.to_be_bytes());
    p.extend_from_slice(&2u16.to_be_bytes());
    p.extend_from_slice(&[0x42, 0x01]);
    bx(b"hvcC", &p)
}

fn auxc_prop(urn: &[u8], subtypes: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(urn);
    payload.push(0);
    payload.extend_from_slice(subtypes);
    full(b"auxC", 0, 0, &payload)
}

fn irot_prop(angle: u16) -> Vec<u8> {
    bx(b"irot", &[(angle / 90) as u8])
}

fn imir_prop(horizontal: bool) -> Vec<u8> {
    bx(b"imir", &[u8::from(horizontal)])
}

fn clap_prop(width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    for value in [width, 1, height, 1, 0, 1, 0, 1] {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    bx(b"clap", &payload)
}

#[derive(Clone, Copy)]
enum Storage {
    Mdat,
    Idat,
}

struct RawExtents {
    item_id: u16,
    construction_method: u16,
    extents: Vec<(u32, u32)>,
}

/// Builds a complete file: ftyp, meta (hdlr/pitm/iinf/iprp/iloc/iref/idat)
/// and one mdat. Extent offsets are absolute, so the meta box is built
/// twice: once to measure, once with the real mdat position.
struct FileBuilder {
    compatible_brands: Vec<[u8; 4]>,
    pitm_id: u16,
    infes: Vec<Vec<u8>>,
    ipco: Vec<Vec<u8>>,
    ipma: Vec<(u16, Vec<(u8, bool)>)>,
    irefs: Vec<([u8; 4], u16, Vec<u16>)>,
    items: Vec<(u16, Storage, Vec<u8>)>,
    raw_iloc: Vec<RawExtents>,
}

impl FileBuilder {
    fn new() -> Self {
        Self {
            compatible_brands: vec![*b"heic", *b"mif1"],
            pitm_id: 1,
            infes: Vec::new(),
            ipco: Vec::new(),
            ipma: Vec::new(),
            irefs: Vec::new(),
            items: Vec::new(),
            raw_iloc: Vec::new(),
        }
    }

    fn infe(&mut self, item_id: u16, item_type: &[u8; 4], hidden: bool) -> &mut Self {
        self.infes.push(infe_v2(item_id, item_type, hidden));
        self
    }

    /// Adds a property box and returns its 1-based ipco index.
    fn property(&mut self, prop: Vec<u8>) -> u8 {
        self.ipco.push(prop);
        self.ipco.len() as u8
    }

    fn associate(&mut self, item_id: u16, props: &[(u8, bool)]) -> &mut Self {
        self.ipma.push((item_id, props.to_vec()));
        self
    }

    fn reference(&mut self, ref_type: &[u8; 4], from: u16, to: &[u16]) -> &mut Self {
        self.irefs.push((*ref_type, from, to.to_vec()));
        self
    }

    fn item_data(&mut self, item_id: u16, storage: Storage, data: Vec<u8>) -> &mut Self {
        self.items.push((item_id, storage, data));
        self
    }

    fn build(&self) -> Vec<u8> {
        let mut mdat = Vec::new();
        let mut mdat_ranges = Vec::new();
        let mut idat = Vec::new();
        let mut idat_ranges = Vec::new();
        for (id, storage, data) in &self.items {
            match storage {
                Storage::Mdat => {
                    mdat_ranges.push((*id, mdat.len() as u32, data.len() as u32));
                    mdat.extend_from_slice(data);
                }
                Storage::Idat => {
                    idat_ranges.push((*id, idat.len() as u32, data.len() as u32));
                    idat.extend_from_slice(data);
                }
            }
        }

        let ftyp = {
            let mut payload = Vec::new();
            payload.extend_from_slice(b"mif1");
            payload.extend_from_slice(&0u32.to_be_bytes());
            for brand in &self.compatible_brands {
                payload.extend_from_slice(brand);
            }
            bx(b"ftyp", &payload)
        };

        let probe = self.build_meta(0, &mdat_ranges, &idat_ranges, &idat);
        let mdat_base = (ftyp.len() + probe.len() + 8) as u32;
        let meta = self.build_meta(mdat_base, &mdat_ranges, &idat_ranges, &idat);
        assert_eq!(probe.len(), meta.len());

        let mut file = ftyp;
        file.extend_from_slice(&meta);
        file.extend_from_slice(&bx(b"mdat", &mdat));
        file
    }

    fn build_meta(
        &self,
        mdat_base: u32,
        mdat_ranges: &[(u16, u32, u32)],
        idat_ranges: &[(u16, u32, u32)],
        idat: &[u8],
    ) -> Vec<u8> {
        let hdlr = {
            let mut payload = Vec::new();
            payload.extend_from_slice(&0u32.to_be_bytes());
            payload.extend_from_slice(b"pict");
            payload.extend_from_slice(&[0u8; 12]);
            payload.push(0);
            full(b"hdlr", 0, 0, &payload)
        };

        let pitm = full(b"pitm", 0, 0, &self.pitm_id.to_be_bytes());

        let iinf = {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(self.infes.len() as u16).to_be_bytes());
            for infe in &self.infes {
                payload.extend_from_slice(infe);
            }
            full(b"iinf", 0, 0, &payload)
        };

        let iprp = {
            let mut ipco_payload = Vec::new();
            for prop in &self.ipco {
                ipco_payload.extend_from_slice(prop);
            }
            let ipco = bx(b"ipco", &ipco_payload);

            let mut ipma_payload = Vec::new();
            ipma_payload.extend_from_slice(&(self.ipma.len() as u32).to_be_bytes());
            for (item_id, assocs) in &self.ipma {
                ipma_payload.extend_from_slice(&item_id.to_be_bytes());
                ipma_payload.push(assocs.len() as u8);
                for &(index, essential) in assocs {
                    ipma_payload.push(index | if essential { 0x80 } else { 0 });
                }
            }
            let ipma = full(b"ipma", 0, 0, &ipma_payload);

            let mut payload = ipco;
            payload.extend_from_slice(&ipma);
            bx(b"iprp", &payload)
        };

        let iloc = {
            let n_items = mdat_ranges.len() + idat_ranges.len() + self.raw_iloc.len();
            let mut payload = Vec::new();
            payload.extend_from_slice(&0x4400u16.to_be_bytes()); // offset 4, length 4
            payload.extend_from_slice(&(n_items as u16).to_be_bytes());
            let mut push_item = |id: u16, method: u16, extents: &[(u32, u32)]| {
                payload.extend_from_slice(&id.to_be_bytes());
                payload.extend_from_slice(&method.to_be_bytes());
                payload.extend_from_slice(&0u16.to_be_bytes()); // data ref index
                payload.extend_from_slice(&(extents.len() as u16).to_be_bytes());
                for &(offset, length) in extents {
                    payload.extend_from_slice(&offset.to_be_bytes());
                    payload.extend_from_slice(&length.to_be_bytes());
                }
            };
            for &(id, offset, length) in mdat_ranges {
                push_item(id, 0, &[(mdat_base + offset, length)]);
            }
            for &(id, offset, length) in idat_ranges {
                push_item(id, 1, &[(offset, length)]);
            }
            for raw in &self.raw_iloc {
                push_item(raw.item_id, raw.construction_method, &raw.extents);
            }
            full(b"iloc", 1, 0, &payload)
        };

        let mut children = hdlr;
        children.extend_from_slice(&pitm);
        children.extend_from_slice(&iinf);
        children.extend_from_slice(&iprp);
        children.extend_from_slice(&iloc);

        if !self.irefs.is_empty() {
            let mut payload = Vec::new();
            for (ref_type, from, to) in &self.irefs {
                let mut body = Vec::new();
                body.extend_from_slice(&from.to_be_bytes());
                body.extend_from_slice(&(to.len() as u16).to_be_bytes());
                for id in to {
                    body.extend_from_slice(&id.to_be_bytes());
                }
                payload.extend_from_slice(&bx(ref_type, &body));
            }
            children.extend_from_slice(&full(b"iref", 0, 0, &payload));
        }

        if !idat.is_empty() {
            children.extend_from_slice(&bx(b"idat", idat));
        }

        full(b"meta", 0, 0, &children)
    }
}

// --- fake decoder plugin -------------------------------------------------

/// Descriptor chunk consumed by the fake decoder, wrapped in the same
/// 4-byte length framing the hvcC prelude uses:
/// `[w(2) h(2) y cb cr pattern?]`; pattern 1 fills luma with the row index.
fn fake_bitstream(width: u16, height: u16, y: u8, cb: u8, cr: u8, pattern: bool) -> Vec<u8> {
    let mut desc = Vec::new();
    desc.extend_from_slice(&width.to_be_bytes());
    desc.extend_from_slice(&height.to_be_bytes());
    desc.extend_from_slice(&[y, cb, cr]);
    if pattern {
        desc.push(1);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(desc.len() as u32).to_be_bytes());
    out.extend_from_slice(&desc);
    out
}

struct FakeHevcDecoder {
    data: Vec<u8>,
}

impl Decoder for FakeHevcDecoder {
    fn push_data(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn decode_image(&mut self) -> Result<Option<PixelImage>> {
        // The stream is a sequence of length-prefixed units (parameter
        // sets first); the last one is the image descriptor.
        let mut pos = 0usize;
        let mut descriptor: Option<&[u8]> = None;
        while pos + 4 <= self.data.len() {
            let len =
                u32::from_be_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > self.data.len() {
                return Ok(None);
            }
            descriptor = Some(&self.data[pos..pos + len]);
            pos += len;
        }

        let Some(desc) = descriptor else {
            return Ok(None);
        };
        if desc.len() < 7 {
            return Ok(None);
        }

        let width = u32::from(u16::from_be_bytes([desc[0], desc[1]]));
        let height = u32::from(u16::from_be_bytes([desc[2], desc[3]]));
        let (y, cb, cr) = (desc[4], desc[5], desc[6]);
        let pattern = desc.get(7) == Some(&1);

        let mut img = PixelImage::create(width, height, Colorspace::YCbCr, Chroma::C420);
        img.add_plane(Channel::Y, width, height, 8)?;
        img.add_plane(Channel::Cb, width / 2, height / 2, 8)?;
        img.add_plane(Channel::Cr, width / 2, height / 2, 8)?;

        let y_plane = img.plane_mut(Channel::Y).unwrap();
        if pattern {
            let stride = y_plane.stride;
            for row in 0..height as usize {
                y_plane.data[row * stride..(row + 1) * stride].fill(row as u8);
            }
        } else {
            y_plane.data.fill(y);
        }
        img.plane_mut(Channel::Cb).unwrap().data.fill(cb);
        img.plane_mut(Channel::Cr).unwrap().data.fill(cr);
        Ok(Some(img))
    }
}

struct FakeHevcPlugin;

impl DecoderPlugin for FakeHevcPlugin {
    fn does_support_format(&self, format: CompressionFormat) -> i32 {
        if format == CompressionFormat::Hevc {
            100
        } else {
            0
        }
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(FakeHevcDecoder { data: Vec::new() }))
    }
}

struct NullImagePlugin;

impl DecoderPlugin for NullImagePlugin {
    fn does_support_format(&self, _format: CompressionFormat) -> i32 {
        50
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
        struct NullDecoder;
        impl Decoder for NullDecoder {
            fn push_data(&mut self, _data: &[u8]) -> Result<()> {
                Ok(())
            }
            fn decode_image(&mut self) -> Result<Option<PixelImage>> {
                Ok(None)
            }
        }
        Ok(Box::new(NullDecoder))
    }
}

struct WrongVersionPlugin;

impl DecoderPlugin for WrongVersionPlugin {
    fn api_version(&self) -> u32 {
        2
    }

    fn does_support_format(&self, _format: CompressionFormat) -> i32 {
        1
    }

    fn new_decoder(&self) -> Result<Box<dyn Decoder>> {
        unreachable!("never registered")
    }
}

// --- file fixtures -------------------------------------------------------

/// One visible 64x48 hvc1 primary item.
fn basic_file() -> Vec<u8> {
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 100, 128, 128, false));
    b.build()
}

fn open_with_decoder(data: &[u8]) -> HeifContext<'_> {
    let mut context = HeifContext::from_bytes(data).expect("open failed");
    context
        .register_decoder(Box::new(FakeHevcPlugin))
        .expect("register failed");
    context
}

// --- scenarios -----------------------------------------------------------

#[test]
fn ftyp_without_heic_brand_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    b.compatible_brands = vec![*b"mif1", *b"avif"];
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"hvc1", false).associate(1, &[(ispe, true)]);
    let err = HeifContext::from_bytes(&b.build()).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedFiletype);
}

#[test]
fn basic_primary_image() {
    init_logging();
    let data = basic_file();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert!(primary.is_primary());
    assert_eq!(primary.id(), 1);
    assert_eq!(primary.width(), 64);
    assert_eq!(primary.height(), 48);
    assert_eq!(primary.thumbnail_count(), 0);
    assert!(!primary.has_alpha_channel());
    assert!(!primary.has_depth_channel());
    assert_eq!(context.top_level_image_ids(), &[1]);

    let img = primary.decode(&DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 64);
    assert_eq!(img.height(), 48);
    assert_eq!(img.colorspace(), Colorspace::YCbCr);
    assert_eq!(img.chroma(), Chroma::C420);
    let y = img.plane(Channel::Y).unwrap();
    assert_eq!(y.width, 64);
    assert_eq!(y.height, 48);
    assert!(y.data.iter().all(|&v| v == 100));
    let cb = img.plane(Channel::Cb).unwrap();
    assert_eq!(cb.width, 32);
    assert_eq!(cb.height, 24);
}

#[test]
fn decode_as_rgb() {
    init_logging();
    let data = basic_file();
    let context = open_with_decoder(&data);
    let primary = context.primary_image_handle().unwrap();

    let rgb = primary
        .decode_as(Colorspace::Rgb, Chroma::C444, &DecodingOptions::default())
        .unwrap();
    assert_eq!(rgb.colorspace(), Colorspace::Rgb);
    assert_eq!(rgb.plane(Channel::R).unwrap().data[0], 100);
    assert_eq!(rgb.plane(Channel::G).unwrap().data[0], 100);
    assert_eq!(rgb.plane(Channel::B).unwrap().data[0], 100);
}

#[test]
fn hidden_thumbnail_is_attached_to_primary() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe_main = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let ispe_thumb = b.property(ispe_prop(32, 24));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe_main, true), (hvcc, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 100, 128, 128, false));
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe_thumb, true), (hvcc, true)])
        .item_data(2, Storage::Mdat, fake_bitstream(32, 24, 60, 128, 128, false))
        .reference(b"thmb", 2, &[1]);
    let data = b.build();
    let context = open_with_decoder(&data);

    assert_eq!(context.top_level_image_ids(), &[1]);
    assert!(context.image_handle(2).is_err());

    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.thumbnail_count(), 1);
    let thumb = primary.thumbnail(0).unwrap();
    assert!(thumb.is_thumbnail());
    assert_eq!(thumb.width(), 32);
    assert_eq!(thumb.height(), 24);

    let img = thumb.decode(&DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 32);
    assert_eq!(img.plane(Channel::Y).unwrap().data[0], 60);
}

#[test]
fn thumbnail_of_thumbnail_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"hvc1", false).associate(1, &[(ispe, true)]);
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe, true)])
        .reference(b"thmb", 2, &[1]);
    b.infe(3, b"hvc1", true)
        .associate(3, &[(ispe, true)])
        .reference(b"thmb", 3, &[2]);
    let err = HeifContext::from_bytes(&b.build()).unwrap_err();
    assert_eq!(err.sub_code, SubError::NonexistingImageReferenced);
}

#[test]
fn alpha_auxiliary_becomes_alpha_plane() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let auxc = b.property(auxc_prop(b"urn:mpeg:hevc:2015:auxid:1", &[]));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 100, 128, 128, false));
    b.infe(3, b"hvc1", true)
        .associate(3, &[(ispe, true), (hvcc, true), (auxc, true)])
        .item_data(3, Storage::Mdat, fake_bitstream(64, 48, 222, 128, 128, false))
        .reference(b"auxl", 3, &[1]);
    let data = b.build();
    let context = open_with_decoder(&data);

    assert_eq!(context.top_level_image_ids(), &[1]);
    let primary = context.primary_image_handle().unwrap();
    assert!(primary.has_alpha_channel());
    assert_eq!(primary.alpha_channel().unwrap().id(), 3);

    let img = primary.decode(&DecodingOptions::default()).unwrap();
    let alpha = img.plane(Channel::Alpha).unwrap();
    // The alpha plane is the decoded auxiliary image's luma plane.
    assert_eq!(alpha.width, 64);
    assert_eq!(alpha.height, 48);
    assert!(alpha.data.iter().all(|&v| v == 222));
}

/// The depth SEI blob used in the depth test: one prefix SEI NAL with
/// payload 177 declaring z_near = 1.0 and uniform-disparity mapping.
fn depth_sei_blob() -> Vec<u8> {
    // bits: 1000 | 010 | 0 0011111 00000 0  (flags, uvlc(1), custom float)
    let payload = [0b1000_0100, 0b0011_1110, 0b0000_0000];
    let mut nal = Vec::new();
    nal.push(39u8 << 1);
    nal.push(0);
    nal.push(177);
    nal.push(payload.len() as u8);
    nal.extend_from_slice(&payload);

    let mut blob = Vec::new();
    blob.extend_from_slice(&((nal.len() + 4) as u32).to_be_bytes());
    blob.extend_from_slice(&(nal.len() as u32).to_be_bytes());
    blob.extend_from_slice(&nal);
    blob
}

#[test]
fn depth_auxiliary_carries_representation_info() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let auxc = b.property(auxc_prop(b"urn:mpeg:hevc:2015:auxid:2", &depth_sei_blob()));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 100, 128, 128, false));
    b.infe(4, b"hvc1", true)
        .associate(4, &[(ispe, true), (hvcc, true), (auxc, true)])
        .item_data(4, Storage::Mdat, fake_bitstream(64, 48, 50, 128, 128, false))
        .reference(b"auxl", 4, &[1]);
    let data = b.build();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert!(primary.has_depth_channel());
    assert_eq!(primary.depth_channel().unwrap().id(), 4);

    let info = primary.depth_representation_info().unwrap();
    assert!(info.has_z_near);
    assert!((info.z_near - 1.0).abs() < 1e-9);
    assert_eq!(
        info.depth_representation_type,
        DepthRepresentationType::UniformDisparity
    );
}

#[test]
fn auxiliary_without_auxc_property_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"hvc1", false).associate(1, &[(ispe, true)]);
    b.infe(3, b"hvc1", true)
        .associate(3, &[(ispe, true)])
        .reference(b"auxl", 3, &[1]);
    let err = HeifContext::from_bytes(&b.build()).unwrap_err();
    assert_eq!(err.sub_code, SubError::AuxiliaryImageTypeUnspecified);
}

#[test]
fn grid_assembles_tiles_row_major() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe_grid = b.property(ispe_prop(128, 96));
    let ispe_tile = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());

    b.infe(1, b"grid", false).associate(1, &[(ispe_grid, true)]);
    // 2x2 grid, 16-bit dimension fields, output 128x96; stored in idat.
    b.item_data(
        1,
        Storage::Idat,
        vec![0, 0, 1, 1, 0x00, 0x80, 0x00, 0x60],
    );
    b.reference(b"dimg", 1, &[2, 3, 4, 5]);

    for (i, id) in (2u16..=5).enumerate() {
        let y = 10 * (i as u8 + 1);
        b.infe(id, b"hvc1", true)
            .associate(id, &[(ispe_tile, true), (hvcc, true)])
            .item_data(id, Storage::Mdat, fake_bitstream(64, 48, y, y + 1, 128, false));
    }

    let data = b.build();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.width(), 128);
    assert_eq!(primary.height(), 96);

    let img = primary.decode(&DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 128);
    assert_eq!(img.height(), 96);
    assert_eq!(img.chroma(), Chroma::C420);

    let y = img.plane(Channel::Y).unwrap();
    let stride = y.stride;
    assert_eq!(y.data[0], 10); // top-left tile
    assert_eq!(y.data[127], 20); // top-right tile
    assert_eq!(y.data[95 * stride], 30); // bottom-left tile
    assert_eq!(y.data[95 * stride + 127], 40); // bottom-right tile

    let cb = img.plane(Channel::Cb).unwrap();
    assert_eq!(cb.width, 64);
    assert_eq!(cb.height, 48);
    assert_eq!(cb.data[0], 11);
    assert_eq!(cb.data[63], 21);
}

#[test]
fn grid_with_missing_tiles_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe_grid = b.property(ispe_prop(128, 96));
    let ispe_tile = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    b.infe(1, b"grid", false).associate(1, &[(ispe_grid, true)]);
    b.item_data(1, Storage::Mdat, vec![0, 0, 1, 1, 0x00, 0x80, 0x00, 0x60]);
    b.reference(b"dimg", 1, &[2]);
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe_tile, true), (hvcc, true)])
        .item_data(2, Storage::Mdat, fake_bitstream(64, 48, 10, 128, 128, false));
    let data = b.build();
    let context = open_with_decoder(&data);

    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.sub_code, SubError::MissingGridImages);
}

#[test]
fn iden_decodes_its_reference() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    b.infe(1, b"iden", false)
        .associate(1, &[(ispe, true)])
        .reference(b"dimg", 1, &[2]);
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe, true), (hvcc, true)])
        .item_data(2, Storage::Mdat, fake_bitstream(64, 48, 77, 128, 128, false));
    let data = b.build();
    let context = open_with_decoder(&data);

    let img = context.decode_image(1, &DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 64);
    assert_eq!(img.plane(Channel::Y).unwrap().data[0], 77);
}

#[test]
fn overlay_entirely_off_canvas_yields_background() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe_ovl = b.property(ispe_prop(100, 100));
    let ispe_img = b.property(ispe_prop(32, 32));
    let hvcc = b.property(hvcc_prop());

    // canvas 100x100, background (0xFFFF, 0, 0, 0xFFFF), offset (-50, -50)
    let mut iovl = vec![0u8, 0];
    for color in [0xFFFFu16, 0, 0, 0xFFFF] {
        iovl.extend_from_slice(&color.to_be_bytes());
    }
    iovl.extend_from_slice(&100u16.to_be_bytes());
    iovl.extend_from_slice(&100u16.to_be_bytes());
    iovl.extend_from_slice(&(-50i16 as u16).to_be_bytes());
    iovl.extend_from_slice(&(-50i16 as u16).to_be_bytes());

    b.infe(1, b"iovl", false)
        .associate(1, &[(ispe_ovl, true)])
        .item_data(1, Storage::Mdat, iovl)
        .reference(b"dimg", 1, &[2]);
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe_img, true), (hvcc, true)])
        .item_data(2, Storage::Mdat, fake_bitstream(32, 32, 100, 128, 128, false));
    let data = b.build();
    let context = open_with_decoder(&data);

    let img = context.decode_image(1, &DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 100);
    assert_eq!(img.height(), 100);
    assert_eq!(img.colorspace(), Colorspace::Rgb);
    // Solid red: the overlaid image is entirely off-canvas and skipped.
    assert!(img.plane(Channel::R).unwrap().data.iter().all(|&v| v == 0xFF));
    assert!(img.plane(Channel::G).unwrap().data.iter().all(|&v| v == 0));
    assert!(img.plane(Channel::B).unwrap().data.iter().all(|&v| v == 0));
}

#[test]
fn overlay_blits_visible_image() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe_ovl = b.property(ispe_prop(100, 100));
    let ispe_img = b.property(ispe_prop(32, 32));
    let hvcc = b.property(hvcc_prop());

    let mut iovl = vec![0u8, 0];
    for color in [0xFFFFu16, 0, 0, 0xFFFF] {
        iovl.extend_from_slice(&color.to_be_bytes());
    }
    iovl.extend_from_slice(&100u16.to_be_bytes());
    iovl.extend_from_slice(&100u16.to_be_bytes());
    iovl.extend_from_slice(&10u16.to_be_bytes());
    iovl.extend_from_slice(&20u16.to_be_bytes());

    b.infe(1, b"iovl", false)
        .associate(1, &[(ispe_ovl, true)])
        .item_data(1, Storage::Mdat, iovl)
        .reference(b"dimg", 1, &[2]);
    // Neutral gray overlay image: converts to r == g == b == 100.
    b.infe(2, b"hvc1", true)
        .associate(2, &[(ispe_img, true), (hvcc, true)])
        .item_data(2, Storage::Mdat, fake_bitstream(32, 32, 100, 128, 128, false));
    let data = b.build();
    let context = open_with_decoder(&data);

    let img = context.decode_image(1, &DecodingOptions::default()).unwrap();
    let r = img.plane(Channel::R).unwrap();
    let stride = r.stride;
    assert_eq!(r.data[19 * stride + 10], 0xFF); // above the overlay
    assert_eq!(r.data[20 * stride + 10], 100); // overlay top-left
    assert_eq!(r.data[51 * stride + 41], 100); // overlay bottom-right
    assert_eq!(r.data[52 * stride + 42], 0xFF); // past the overlay
}

#[test]
fn rotation_swaps_handle_resolution_and_rotates_pixels() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let irot = b.property(irot_prop(90));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true), (irot, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 0, 128, 128, true));
    let data = b.build();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.width(), 48);
    assert_eq!(primary.height(), 64);

    let img = primary.decode(&DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 48);
    assert_eq!(img.height(), 64);
    // The source luma is the row index; after CCW rotation it becomes a
    // column gradient.
    let y = img.plane(Channel::Y).unwrap();
    assert_eq!(y.data[0], 0);
    assert_eq!(y.data[1], 1);
    assert_eq!(y.data[47], 47);
    assert_eq!(y.data[y.stride], 0);

    let raw = primary
        .decode(&DecodingOptions {
            ignore_transformations: true,
        })
        .unwrap();
    assert_eq!(raw.width(), 64);
    assert_eq!(raw.height(), 48);
}

#[test]
fn mirror_flips_rows() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let imir = b.property(imir_prop(true));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true), (imir, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 0, 128, 128, true));
    let data = b.build();
    let context = open_with_decoder(&data);

    let img = context.decode_image(1, &DecodingOptions::default()).unwrap();
    let y = img.plane(Channel::Y).unwrap();
    assert_eq!(y.data[0], 47);
    assert_eq!(y.data[47 * y.stride], 0);
}

#[test]
fn clean_aperture_crops_decoded_image() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let clap = b.property(clap_prop(60, 40));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true), (clap, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 0, 128, 128, true));
    let data = b.build();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.width(), 60);
    assert_eq!(primary.height(), 40);

    let img = primary.decode(&DecodingOptions::default()).unwrap();
    assert_eq!(img.width(), 60);
    assert_eq!(img.height(), 40);
    // Centered window over 64x48: the first kept row is row 4.
    assert_eq!(img.plane(Channel::Y).unwrap().data[0], 4);
}

#[test]
fn empty_clean_aperture_window_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    let clap = b.property(clap_prop(1, 1));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true), (clap, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 0, 128, 128, false));
    let data = b.build();
    let context = open_with_decoder(&data);

    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.sub_code, SubError::InvalidCleanAperture);
}

#[test]
fn exif_metadata_is_attached() {
    init_logging();
    let exif_bytes = b"II*\x00\x08\x00\x00\x00".to_vec();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true)])
        .item_data(1, Storage::Mdat, fake_bitstream(64, 48, 100, 128, 128, false));
    b.infe(3, b"Exif", false)
        .item_data(3, Storage::Mdat, exif_bytes.clone())
        .reference(b"cdsc", 3, &[1]);
    let data = b.build();
    let context = open_with_decoder(&data);

    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.metadata_count(), 1);
    let metadata = primary.metadata(0).unwrap();
    assert_eq!(&*metadata.data, &exif_bytes[..]);
    let err = primary.metadata(1).unwrap_err();
    assert_eq!(err.sub_code, SubError::IndexOutOfRange);
}

#[test]
fn cumulative_extent_size_limit_is_enforced() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    let hvcc = b.property(hvcc_prop());
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (hvcc, true)]);
    b.raw_iloc.push(RawExtents {
        item_id: 1,
        construction_method: 0,
        extents: vec![(0, 51 * 1024 * 1024)],
    });
    let data = b.build();
    let context = open_with_decoder(&data);

    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::MemoryAllocationError);
    assert_eq!(err.sub_code, SubError::SecurityLimitExceeded);
}

#[test]
fn derived_image_recursion_is_bounded() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"iden", false)
        .associate(1, &[(ispe, true)])
        .reference(b"dimg", 1, &[1]);
    let data = b.build();
    let context = open_with_decoder(&data);

    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.sub_code, SubError::RecursionLimitReached);
}

#[test]
fn decoding_without_plugin_is_unsupported_codec() {
    init_logging();
    let data = basic_file();
    let context = HeifContext::from_bytes(&data).unwrap();
    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.sub_code, SubError::UnsupportedCodec);
}

#[test]
fn null_plugin_image_is_a_plugin_error() {
    init_logging();
    let data = basic_file();
    let mut context = HeifContext::from_bytes(&data).unwrap();
    context.register_decoder(Box::new(NullImagePlugin)).unwrap();
    let err = context.decode_image(1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::DecoderPluginError);
}

#[test]
fn wrong_plugin_api_version_is_rejected() {
    init_logging();
    let data = basic_file();
    let mut context = HeifContext::from_bytes(&data).unwrap();
    let err = context
        .register_decoder(Box::new(WrongVersionPlugin))
        .unwrap_err();
    assert_eq!(err.sub_code, SubError::UnsupportedPluginVersion);
}

#[test]
fn ipma_index_out_of_range_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(ispe, true), (9, false)]);
    let err = HeifContext::from_bytes(&b.build()).unwrap_err();
    assert_eq!(err.sub_code, SubError::IpmaBoxReferencesNonexistingProperty);
}

#[test]
fn ipma_index_zero_is_tolerated() {
    init_logging();
    let mut b = FileBuilder::new();
    let ispe = b.property(ispe_prop(64, 48));
    b.infe(1, b"hvc1", false)
        .associate(1, &[(0, false), (ispe, true)]);
    let data = b.build();
    let context = HeifContext::from_bytes(&data).unwrap();
    let primary = context.primary_image_handle().unwrap();
    assert_eq!(primary.width(), 64);
    assert_eq!(primary.height(), 48);
}

#[test]
fn image_without_property_associations_is_rejected() {
    init_logging();
    let mut b = FileBuilder::new();
    b.infe(1, b"hvc1", false);
    let err = HeifContext::from_bytes(&b.build()).unwrap_err();
    assert_eq!(err.sub_code, SubError::NoPropertiesAssignedToItem);
}

#[test]
fn debug_dump_renders_the_tree() {
    init_logging();
    let data = basic_file();
    let context = HeifContext::from_bytes(&data).unwrap();
    let dump = context.debug_dump_boxes();
    assert!(dump.contains("Box: ftyp"));
    assert!(dump.contains("Box: meta"));
    assert!(dump.contains("Box: hvcC"));
    assert!(dump.contains("image width: 64"));
    assert!(dump.contains("item_ID: 1"));
}
