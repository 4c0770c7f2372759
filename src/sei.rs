// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HEVC SEI messages carried in the 'auxC' subtype bytes of depth images.
//!
//! The blob starts with a 32-bit length followed by length-prefixed NAL
//! units. Only the depth-representation-info payload (id 177) of SEI NAL
//! units (types 39/40) is understood.

use bitreader::BitReader;
use fallible_collections::TryVec;

use crate::bitstream::read_uvlc;
use crate::error::{Error, ErrorCode, Result, SubError};

/// How depth samples map to scene geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthRepresentationType {
    UniformInverseZ,
    UniformDisparity,
    UniformZ,
    NonuniformDisparity,
}

impl TryFrom<u32> for DepthRepresentationType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::UniformInverseZ),
            1 => Ok(Self::UniformDisparity),
            2 => Ok(Self::UniformZ),
            3 => Ok(Self::NonuniformDisparity),
            _ => Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::Unspecified,
                "unknown depth representation type",
            )),
        }
    }
}

/// Depth representation information SEI (payload id 177).
#[derive(Debug, PartialEq)]
pub struct DepthRepresentationInfo {
    pub version: u8,
    pub has_z_near: bool,
    pub has_z_far: bool,
    pub has_d_min: bool,
    pub has_d_max: bool,
    pub z_near: f64,
    pub z_far: f64,
    pub d_min: f64,
    pub d_max: f64,
    pub depth_representation_type: DepthRepresentationType,
    pub disparity_reference_view: u32,
    pub nonlinear_model: TryVec<u8>,
}

#[derive(Debug)]
pub enum SeiMessage {
    DepthRepresentationInfo(DepthRepresentationInfo),
}

/// The 14-and-more-bit custom float of the depth SEI:
/// `sign(1) | exponent(7) | mantissa_len-1(5) | mantissa(mantissa_len)`.
fn read_depth_rep_info_element(reader: &mut BitReader<'_>) -> Result<f64> {
    let sign = reader.read_bool()?;
    let exponent = reader.read_u8(7)?;
    let mantissa_len = reader.read_u8(5)? + 1;
    // Exponent 127 is reserved; the value is unspecified but still consumed.
    let mantissa = reader.read_u32(mantissa_len)?;

    let value = if exponent > 0 {
        2f64.powi(i32::from(exponent) - 31)
            * (1.0 + f64::from(mantissa) / 2f64.powi(i32::from(mantissa_len)))
    } else {
        2f64.powi(-(30 + i32::from(mantissa_len))) * f64::from(mantissa)
    };

    Ok(if sign { -value } else { value })
}

fn read_depth_representation_info(reader: &mut BitReader<'_>) -> Result<DepthRepresentationInfo> {
    let mut msg = DepthRepresentationInfo {
        version: 1,
        has_z_near: false,
        has_z_far: false,
        has_d_min: false,
        has_d_max: false,
        z_near: 0.0,
        z_far: 0.0,
        d_min: 0.0,
        d_max: 0.0,
        depth_representation_type: DepthRepresentationType::UniformInverseZ,
        disparity_reference_view: 0,
        nonlinear_model: TryVec::new(),
    };

    msg.has_z_near = reader.read_bool()?;
    msg.has_z_far = reader.read_bool()?;
    msg.has_d_min = reader.read_bool()?;
    msg.has_d_max = reader.read_bool()?;

    msg.depth_representation_type = read_uvlc(reader)?.try_into()?;

    if msg.has_d_min || msg.has_d_max {
        msg.disparity_reference_view = read_uvlc(reader)?;
    }

    if msg.has_z_near {
        msg.z_near = read_depth_rep_info_element(reader)?;
    }
    if msg.has_z_far {
        msg.z_far = read_depth_rep_info_element(reader)?;
    }
    if msg.has_d_min {
        msg.d_min = read_depth_rep_info_element(reader)?;
    }
    if msg.has_d_max {
        msg.d_max = read_depth_rep_info_element(reader)?;
    }

    // TODO: load the non-uniform response curve for
    // DepthRepresentationType::NonuniformDisparity.

    Ok(msg)
}

/// Walk the 'auxC' subtype bytes and collect understood SEI messages.
pub fn decode_hevc_aux_sei_messages(data: &[u8]) -> Result<TryVec<SeiMessage>> {
    let mut msgs = TryVec::new();

    if data.len() < 4 {
        return Ok(msgs);
    }

    let mut reader = BitReader::new(data);
    let len = reader.read_u32(32)?;
    if u64::from(len) > data.len() as u64 - 4 {
        return Err(Error::with_message(
            ErrorCode::InvalidInput,
            SubError::EndOfData,
            "SEI length exceeds auxC subtype data",
        ));
    }

    if (reader.position() / 8) < u64::from(len) {
        let _nal_size = reader.read_u32(32)?;
        let nal_type = reader.read_u8(8)? >> 1;
        reader.skip(8)?;

        if nal_type == 39 || nal_type == 40 {
            // TODO: multi-byte SEI payload headers.
            let payload_id = reader.read_u8(8)?;
            let _payload_size = reader.read_u8(8)?;

            if payload_id == 177 {
                let sei = read_depth_representation_info(&mut reader)?;
                msgs.push(SeiMessage::DepthRepresentationInfo(sei))?;
            }
        }

        // TODO: read the following SEI NAL units once sample files with
        // more than one message are available.
    }

    Ok(msgs)
}
