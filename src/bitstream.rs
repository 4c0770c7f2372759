// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded byte cursor over the file buffer.
//!
//! A [`BitstreamRange`] spans a sub-range of the input and carries a sticky
//! error flag: the first read past the remaining budget sets the flag and
//! every subsequent read is a no-op returning zero. Box parsers receive a
//! child range covering exactly the box content; the box reader advances
//! the parent past the box end regardless of how much the child consumed.

use bitreader::BitReader;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, ErrorCode, Result, SubError};

pub(crate) type TryString = fallible_collections::TryVec<u8>;

pub struct BitstreamRange<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    error: bool,
}

impl<'a> BitstreamRange<'a> {
    /// Range over an entire buffer.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
            error: false,
        }
    }

    /// Child range covering `content_len` bytes starting at the current
    /// position. A declared length beyond the parent budget is clamped, so
    /// the child hits its sticky error at the real end of data. Exhausting
    /// the child does not poison the parent.
    pub fn child(&self, content_len: u64) -> BitstreamRange<'a> {
        let end = (self.pos as u64)
            .saturating_add(content_len)
            .min(self.end as u64) as usize;
        BitstreamRange {
            data: self.data,
            pos: self.pos,
            end,
            error: false,
        }
    }

    /// Absolute byte position within the file buffer.
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Absolute position of the end of this range.
    pub(crate) fn end_position(&self) -> u64 {
        self.end as u64
    }

    /// Move the cursor to an absolute position inside this range.
    pub(crate) fn set_position(&mut self, pos: u64) {
        debug_assert!(pos <= self.end as u64);
        self.pos = (pos as usize).min(self.end);
    }

    pub fn remaining(&self) -> u64 {
        (self.end - self.pos) as u64
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.end
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub(crate) fn set_error(&mut self) {
        self.error = true;
    }

    /// Turn the sticky error state into a `Result`.
    pub fn get_error(&self) -> Result<()> {
        if self.error {
            Err(Error::new(ErrorCode::InvalidInput, SubError::EndOfData))
        } else {
            Ok(())
        }
    }

    /// Check-only availability test. An unavailable count sets the sticky
    /// error flag.
    pub fn read(&mut self, n: u64) -> bool {
        if self.error {
            return false;
        }
        if n > self.remaining() {
            self.error = true;
            return false;
        }
        true
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.read(n as u64) {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn read8(&mut self) -> u8 {
        self.take(1).map_or(0, |s| s[0])
    }

    pub fn read16(&mut self) -> u16 {
        self.take(2).map_or(0, BigEndian::read_u16)
    }

    pub fn read32(&mut self) -> u32 {
        self.take(4).map_or(0, BigEndian::read_u32)
    }

    pub fn read64(&mut self) -> u64 {
        self.take(8).map_or(0, BigEndian::read_u64)
    }

    /// Read exactly `n` bytes into a fresh vector. Short data sets the
    /// sticky error and yields an empty vector.
    pub fn read_vec(&mut self, n: usize) -> Result<fallible_collections::TryVec<u8>> {
        let mut out = fallible_collections::TryVec::new();
        if let Some(slice) = self.take(n) {
            out.extend_from_slice(slice)?;
        }
        Ok(out)
    }

    /// Read a NUL-terminated string, bounded by the range. A missing
    /// terminator consumes the remaining budget and sets the sticky error.
    pub fn read_string(&mut self) -> Result<TryString> {
        let mut out = TryString::new();
        loop {
            if self.eof() {
                self.error = true;
                break;
            }
            let byte = self.read8();
            if self.error || byte == 0 {
                break;
            }
            out.push(byte)?;
        }
        Ok(out)
    }

    pub fn skip_to_end_of_box(&mut self) {
        self.pos = self.end;
    }

    /// Only meaningful on the top-level range, where the box budget is the
    /// file itself.
    pub fn skip_to_end_of_file(&mut self) {
        self.skip_to_end_of_box();
    }
}

/// Unsigned Exp-Golomb code, as used by HEVC SEI payloads.
pub(crate) fn read_uvlc(reader: &mut BitReader) -> Result<u32> {
    let mut leading_zeros = 0u8;
    while !reader.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(Error::with_message(
                ErrorCode::InvalidInput,
                SubError::EndOfData,
                "Exp-Golomb code exceeds 32 bits",
            ));
        }
    }
    let suffix = reader.read_u32(leading_zeros)?;
    Ok((1u32 << leading_zeros) - 1 + suffix)
}
