// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured error type for the HEIF reader.
//!
//! Every failure carries a coarse [`ErrorCode`], a fine-grained [`SubError`]
//! and an optional human-readable message. Parsers return on the first
//! error; callers surface errors unchanged except for added context text.

use std::borrow::Cow;
use std::fmt;

use fallible_collections::TryReserveError;

/// Result shorthand using our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Corrupt or structurally invalid input data.
    InvalidInput,
    /// Input uses a feature this reader does not implement.
    UnsupportedFeature,
    /// The file is not a HEIF file of a supported structural brand.
    UnsupportedFiletype,
    /// The library was used incorrectly by the caller.
    UsageError,
    /// An allocation failed or a security limit on allocations was hit.
    MemoryAllocationError,
    /// A registered decoder plugin failed.
    DecoderPluginError,
}

/// Fine-grained error cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubError {
    Unspecified,

    // --- structural
    NoFtypBox,
    NoMetaBox,
    NoHdlrBox,
    NoPictHandler,
    NoPitmBox,
    NoIprpBox,
    NoIpcoBox,
    NoIpmaBox,
    NoIlocBox,
    NoIinfBox,
    NoInfeBox,
    NoHvccBox,
    NoIrefBox,
    NoIdatBox,
    NoItemData,
    InvalidBoxSize,

    // --- content
    EndOfData,
    InvalidGridData,
    InvalidOverlayData,
    MissingGridImages,
    OverlayImageOutsideOfCanvas,
    InvalidCleanAperture,
    IpmaBoxReferencesNonexistingProperty,
    NoPropertiesAssignedToItem,
    AuxiliaryImageTypeUnspecified,

    // --- policy
    SecurityLimitExceeded,
    RecursionLimitReached,
    UnsupportedCodec,
    UnsupportedImageType,
    UnsupportedColorConversion,
    UnsupportedDataVersion,
    UnsupportedPluginVersion,

    // --- usage
    IndexOutOfRange,
    NonexistingImageReferenced,
    NoOrInvalidPrimaryImage,
}

impl SubError {
    fn description(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::NoFtypBox => "no 'ftyp' box",
            Self::NoMetaBox => "no 'meta' box",
            Self::NoHdlrBox => "no 'hdlr' box",
            Self::NoPictHandler => "handler type is not 'pict'",
            Self::NoPitmBox => "no 'pitm' box",
            Self::NoIprpBox => "no 'iprp' box",
            Self::NoIpcoBox => "no 'ipco' box",
            Self::NoIpmaBox => "no 'ipma' box",
            Self::NoIlocBox => "no 'iloc' box",
            Self::NoIinfBox => "no 'iinf' box",
            Self::NoInfeBox => "no 'infe' box",
            Self::NoHvccBox => "no 'hvcC' box",
            Self::NoIrefBox => "no 'iref' box",
            Self::NoIdatBox => "no 'idat' box",
            Self::NoItemData => "item has no data",
            Self::InvalidBoxSize => "invalid box size",
            Self::EndOfData => "unexpected end of data",
            Self::InvalidGridData => "invalid grid data",
            Self::InvalidOverlayData => "invalid overlay data",
            Self::MissingGridImages => "missing grid images",
            Self::OverlayImageOutsideOfCanvas => "overlay image outside of canvas",
            Self::InvalidCleanAperture => "invalid clean aperture",
            Self::IpmaBoxReferencesNonexistingProperty => {
                "ipma box references a nonexisting property"
            }
            Self::NoPropertiesAssignedToItem => "no properties assigned to item",
            Self::AuxiliaryImageTypeUnspecified => "auxiliary image type unspecified",
            Self::SecurityLimitExceeded => "security limit exceeded",
            Self::RecursionLimitReached => "derived image recursion limit reached",
            Self::UnsupportedCodec => "unsupported codec",
            Self::UnsupportedImageType => "unsupported image type",
            Self::UnsupportedColorConversion => "unsupported color conversion",
            Self::UnsupportedDataVersion => "unsupported data version",
            Self::UnsupportedPluginVersion => "unsupported plugin version",
            Self::IndexOutOfRange => "index out of range",
            Self::NonexistingImageReferenced => "non-existing image referenced",
            Self::NoOrInvalidPrimaryImage => "no or invalid primary image",
        }
    }
}

/// Describes reader failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    pub sub_code: SubError,
    pub message: Cow<'static, str>,
}

impl Error {
    pub(crate) const fn new(code: ErrorCode, sub_code: SubError) -> Self {
        Self {
            code,
            sub_code,
            message: Cow::Borrowed(""),
        }
    }

    pub(crate) fn with_message(
        code: ErrorCode,
        sub_code: SubError,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            sub_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.sub_code.description())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::new(ErrorCode::MemoryAllocationError, SubError::Unspecified)
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        Self::new(ErrorCode::InvalidInput, SubError::EndOfData)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Self::new(ErrorCode::InvalidInput, SubError::EndOfData)
            }
            _ => Self::with_message(ErrorCode::InvalidInput, SubError::Unspecified, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_subcode_and_message() {
        let err = Error::with_message(
            ErrorCode::InvalidInput,
            SubError::InvalidBoxSize,
            "box size 4 smaller than header size 8",
        );
        let text = err.to_string();
        assert!(text.contains("invalid box size"));
        assert!(text.contains("smaller than header size"));
    }

    #[test]
    fn oom_maps_to_memory_allocation_code() {
        fn fails() -> Result<()> {
            let _v: fallible_collections::TryVec<u8> =
                fallible_collections::TryVec::with_capacity(usize::MAX)?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoryAllocationError);
    }
}
