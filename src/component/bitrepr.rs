// Copyright 2024-2025 cadenza developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp::max;

use crate::bitsink::BitSink;
use crate::bitsink::MemSink;
use crate::constant::rice::ESCAPE_4BIT;
use crate::constant::rice::ESCAPE_5BIT;
use crate::constant::STREAM_SYNC;
use crate::error::OutputError;
use crate::error::RangeError;
use crate::reusable;
use crate::reuse;
use crate::rice;

use super::datatype::BlockSizeSpec;
use super::datatype::ChannelAssignment;
use super::datatype::Constant;
use super::datatype::FixedLpc;
use super::datatype::Frame;
use super::datatype::FrameHeader;
use super::datatype::Lpc;
use super::datatype::MetadataBlock;
use super::datatype::MetadataBlockData;
use super::datatype::Padding;
use super::datatype::Residual;
use super::datatype::SampleRateSpec;
use super::datatype::SeekTable;
use super::datatype::Stream;
use super::datatype::StreamInfo;
use super::datatype::SubFrame;
use super::datatype::Verbatim;

const CRC_8_FLAC: crc::Algorithm<u8> = crc::CRC_8_SMBUS; // poly 0x07
const CRC_16_FLAC: crc::Algorithm<u16> = crc::CRC_16_UMTS; // poly 0x8005

/// CRC-8 of frame headers, poly `x^8 + x^2 + x + 1`, initial 0.
pub static HEADER_CRC: crc::Crc<u8> = crc::Crc::<u8>::new(&CRC_8_FLAC);

/// CRC-16 of whole frames, poly `x^16 + x^15 + x^2 + 1`, initial 0.
pub static FRAME_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&CRC_16_FLAC);

pub mod seal_bit_repr {
    pub trait Sealed {}
    impl Sealed for super::Stream {}
    impl Sealed for super::MetadataBlock {}
    impl Sealed for super::MetadataBlockData {}
    impl Sealed for super::StreamInfo {}
    impl Sealed for super::Padding {}
    impl Sealed for super::SeekTable {}
    impl Sealed for super::Frame {}
    impl Sealed for super::FrameHeader {}
    impl Sealed for super::ChannelAssignment {}
    impl Sealed for super::SubFrame {}
    impl Sealed for super::Constant {}
    impl Sealed for super::FixedLpc {}
    impl Sealed for super::Verbatim {}
    impl Sealed for super::Lpc {}
    impl Sealed for super::Residual {}
}

/// Components that can be serialized into a bit sequence.
pub trait BitRepr: seal_bit_repr::Sealed {
    /// Counts the number of bits required to store the component.
    fn count_bits(&self) -> usize;

    /// Writes the bit sequence to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` contains a value that does not fit
    /// the bitstream format, or if a [`BitSink`] method fails.
    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>>;

    /// Test utility for obtaining the bits as a [`Vec`] of [`u8`].
    #[cfg(test)]
    fn to_bytes(&self) -> Vec<u8> {
        let mut sink = MemSink::new();
        self.write(&mut sink).expect("No error expected");
        sink.into_inner()
    }

    /// Test utility for obtaining bits as an eight-bit separated string.
    #[cfg(test)]
    fn to_bitstring(&self) -> String {
        let mut sink = MemSink::new();
        self.write(&mut sink).expect("No error expected");
        sink.to_bitstring()
    }

    /// Checks that `count_bits` matches the written length.
    ///
    /// # Errors
    ///
    /// On success returns `Ok(bits)`; on mismatch
    /// `Err((expected_bits, actual_bits))`.
    #[cfg(test)]
    fn verify_bit_counter(&self) -> Result<usize, (usize, usize)> {
        let expected = self.count_bits();
        let mut sink = MemSink::new();
        self.write(&mut sink).expect("No error expected");
        if expected == sink.len() {
            Ok(expected)
        } else {
            Err((expected, sink.len()))
        }
    }
}

/// Lookup table for `encode_to_utf8like`.
const UTF8_HEADS: [u8; 7] = [0x80, 0xC0, 0xE0, 0xF0, 0xF8, 0xFC, 0xFE];

/// Encodes the given integer into a UTF-8-like byte sequence.
///
/// The classic UTF-8 pattern is extended to 7 bytes so that values up
/// to 36 bits can be written.
///
/// # Errors
///
/// Returns an error if `val` exceeds 36 bits.
#[inline]
pub fn encode_to_utf8like(val: u64) -> Result<heapless::Vec<u8, 7>, RangeError> {
    let val_size = u64::BITS as usize;
    let code_bits: usize = val_size - val.leading_zeros() as usize;
    let mut ret = heapless::Vec::new();
    if code_bits <= 7 {
        ret.push(val as u8)
            .expect(crate::constant::panic_msg::DATA_INCONSISTENT);
    } else if code_bits > 36 {
        return Err(RangeError::from_display(
            "input",
            "cannot exceed 36 bits.",
            &val,
        ));
    } else {
        // trailing bytes carry 6 bits each; the head byte carries
        // `6 - trailing_bytes` bits.
        let trailing_bytes: usize = (code_bits - 2) / 5;
        debug_assert!((1..=6).contains(&trailing_bytes));
        let capacity = trailing_bytes * 6 + 6 - trailing_bytes;
        debug_assert!(capacity >= code_bits);

        let first_bits = 6 - trailing_bytes;
        let mut val = val << (val_size - capacity);
        let head_byte: u8 = if trailing_bytes == 6 {
            0xFEu8
        } else {
            UTF8_HEADS[trailing_bytes] | ((val >> (64 - first_bits)) & 0xFF) as u8
        };
        ret.push(head_byte)
            .expect(crate::constant::panic_msg::DATA_INCONSISTENT);
        val <<= first_bits;

        for _i in 0..trailing_bytes {
            let b = 0x80u8 | (val >> 58) as u8;
            ret.push(b)
                .expect(crate::constant::panic_msg::DATA_INCONSISTENT);
            val <<= 6;
        }
    }
    Ok(ret)
}

/// Computes the number of bytes for the UTF-8-like encoding of `val`.
pub(crate) const fn utf8like_bytesize(val: u64) -> usize {
    let val_size = u64::BITS as usize;
    let code_bits: usize = val_size - val.leading_zeros() as usize;
    if code_bits <= 7 {
        1
    } else {
        1 + (code_bits - 2) / 5
    }
}

impl BitRepr for Stream {
    #[inline]
    fn count_bits(&self) -> usize {
        let mut ret = 32 + self.stream_info_block().count_bits();
        for elem in self.metadata() {
            ret += elem.count_bits();
        }
        for frame in self.frames() {
            ret += frame.count_bits();
        }
        ret
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        dest.write_bytes_aligned(&STREAM_SYNC)
            .map_err(OutputError::<S>::from_sink)?;
        self.stream_info_block().write(dest)?;
        for elem in self.metadata() {
            elem.write(dest)?;
        }
        for frame in self.frames() {
            frame.write(dest)?;
        }
        Ok(())
    }
}

impl BitRepr for MetadataBlock {
    #[inline]
    fn count_bits(&self) -> usize {
        // `self.data.count_bits` does not include the 32 header bits.
        32 + self.data.count_bits()
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        let block_type: u8 = self.data.typetag() + if self.is_last { 0x80 } else { 0x00 };
        dest.write(block_type)
            .map_err(OutputError::<S>::from_sink)?;
        let data_size: u32 = (self.data.count_bits() / 8) as u32;
        dest.write_lsbs(data_size, 24)
            .map_err(OutputError::<S>::from_sink)?;
        self.data.write(dest)?;
        Ok(())
    }
}

impl BitRepr for MetadataBlockData {
    #[inline]
    fn count_bits(&self) -> usize {
        match self {
            Self::StreamInfo(info) => info.count_bits(),
            Self::Padding(padding) => padding.count_bits(),
            Self::SeekTable(table) => table.count_bits(),
            Self::Unknown { data, .. } => data.len() * 8,
        }
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        match self {
            Self::StreamInfo(info) => info.write(dest)?,
            Self::Padding(padding) => padding.write(dest)?,
            Self::SeekTable(table) => table.write(dest)?,
            Self::Unknown { data, .. } => {
                dest.write_bytes_aligned(data)
                    .map_err(OutputError::<S>::from_sink)?;
            }
        };
        Ok(())
    }
}

impl BitRepr for StreamInfo {
    #[inline]
    fn count_bits(&self) -> usize {
        272
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        dest.write::<u16>(self.min_block_size() as u16)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write::<u16>(self.max_block_size() as u16)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs(self.min_frame_size() as u32, 24)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs(self.max_frame_size() as u32, 24)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs(self.sample_rate() as u32, 20)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs((self.channels() - 1) as u8, 3)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs((self.bits_per_sample() - 1) as u8, 5)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs(self.total_samples(), 36)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_bytes_aligned(self.md5_digest())
            .map_err(OutputError::<S>::from_sink)?;
        Ok(())
    }
}

impl BitRepr for Padding {
    #[inline]
    fn count_bits(&self) -> usize {
        self.size() * 8
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        const ZEROS: [u8; 64] = [0u8; 64];
        let mut rest = self.size();
        while rest > 0 {
            let n = std::cmp::min(rest, ZEROS.len());
            dest.write_bytes_aligned(&ZEROS[..n])
                .map_err(OutputError::<S>::from_sink)?;
            rest -= n;
        }
        Ok(())
    }
}

impl BitRepr for SeekTable {
    #[inline]
    fn count_bits(&self) -> usize {
        self.points().len() * (64 + 64 + 16)
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        for point in self.points() {
            dest.write_lsbs(point.sample_number, 64)
                .map_err(OutputError::<S>::from_sink)?;
            dest.write_lsbs(point.stream_offset, 64)
                .map_err(OutputError::<S>::from_sink)?;
            dest.write_lsbs(point.frame_samples, 16)
                .map_err(OutputError::<S>::from_sink)?;
        }
        Ok(())
    }
}

reusable!(FRAME_BUFFER: MemSink = MemSink::new());

impl BitRepr for Frame {
    #[inline]
    fn count_bits(&self) -> usize {
        self.precomputed_bitstream().as_ref().map_or_else(
            || {
                let header = self.header().count_bits();
                let body: usize = self.subframes().iter().map(BitRepr::count_bits).sum();

                let aligned = ((header + body + 7) >> 3) << 3;
                let footer = 16;
                aligned + footer
            },
            |bytes| bytes.len() << 3,
        )
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        if let Some(bytes) = self.precomputed_bitstream() {
            dest.write_bytes_aligned(bytes)
                .map_err(OutputError::<S>::from_sink)?;
            Ok(())
        } else {
            reuse!(FRAME_BUFFER, |frame_sink: &mut MemSink| {
                frame_sink.clear();
                frame_sink.reserve(self.count_bits());

                self.header()
                    .write(frame_sink)
                    .map_err(OutputError::<S>::ignore_sink_error)?;
                for sub in self.subframes() {
                    sub.write(frame_sink)
                        .map_err(OutputError::<S>::ignore_sink_error)?;
                }
                frame_sink
                    .align_to_byte()
                    .expect(crate::constant::panic_msg::ERROR_NOT_EXPECTED);

                dest.write_bytes_aligned(frame_sink.as_slice())
                    .map_err(OutputError::<S>::from_sink)?;
                dest.write_lsbs(FRAME_CRC.checksum(frame_sink.as_slice()), 16)
                    .map_err(OutputError::<S>::from_sink)
            })
        }
    }
}

impl BitRepr for ChannelAssignment {
    #[inline]
    fn count_bits(&self) -> usize {
        4
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        match *self {
            Self::Independent(ch) => {
                if ch > 8 {
                    return Err(RangeError::from_display("#channel", "cannot exceed 8", &ch).into());
                }
                dest.write_lsbs(ch - 1, 4)
                    .map_err(OutputError::<S>::from_sink)?;
            }
            Self::LeftSide => {
                dest.write_lsbs(0x8u8, 4)
                    .map_err(OutputError::<S>::from_sink)?;
            }
            Self::RightSide => {
                dest.write_lsbs(0x9u8, 4)
                    .map_err(OutputError::<S>::from_sink)?;
            }
            Self::MidSide => {
                dest.write_lsbs(0xAu8, 4)
                    .map_err(OutputError::<S>::from_sink)?;
            }
        }
        Ok(())
    }
}

#[inline]
fn write_block_size_extra<S: BitSink>(spec: BlockSizeSpec, dest: &mut S) -> Result<(), S::Error> {
    match spec {
        BlockSizeSpec::ExtraByte(v) => dest.write_lsbs(v, 8),
        BlockSizeSpec::ExtraTwoBytes(v) => dest.write_lsbs(v, 16),
        _ => Ok(()),
    }
}

#[inline]
fn write_sample_rate_extra<S: BitSink>(spec: &SampleRateSpec, dest: &mut S) -> Result<(), S::Error> {
    match *spec {
        SampleRateSpec::KHz(v) => dest.write_lsbs(v, 8),
        SampleRateSpec::DaHz(v) | SampleRateSpec::Hz(v) => dest.write_lsbs(v, 16),
        _ => Ok(()),
    }
}

reusable!(HEADER_BUFFER: MemSink = MemSink::new());

impl BitRepr for FrameHeader {
    #[inline]
    fn count_bits(&self) -> usize {
        let mut ret = 40;
        if self.is_variable_blocking() {
            ret += 8 * utf8like_bytesize(self.start_sample_number());
        } else {
            ret += 8 * utf8like_bytesize(u64::from(self.frame_number()));
        }
        ret += self.block_size_spec().count_extra_bits();
        ret += self.sample_rate_spec().count_extra_bits();
        ret
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        reuse!(HEADER_BUFFER, |header_buffer: &mut MemSink| {
            header_buffer.clear();
            header_buffer.reserve(self.count_bits());

            let unexpected = crate::constant::panic_msg::ERROR_NOT_EXPECTED;

            // sync-code + reserved 1-bit + variable-block indicator
            let header_word = 0xFFF8u16 + u16::from(self.is_variable_blocking());
            header_buffer.write_lsbs(header_word, 16).expect(unexpected);

            // 4-bit block size tag + 4-bit sample rate tag.
            header_buffer
                .write_lsbs(
                    self.block_size_spec().tag() << 4 | self.sample_rate_spec().tag(),
                    8,
                )
                .expect(unexpected);
            self.channel_assignment()
                .write(header_buffer)
                .map_err(OutputError::<S>::ignore_sink_error)?;

            // 3-bit sample size tag + 1-bit reserved (zero)
            header_buffer
                .write_lsbs(self.sample_size_spec().into_tag() << 1, 4)
                .expect(unexpected);

            if self.is_variable_blocking() {
                let v = encode_to_utf8like(self.start_sample_number())?;
                header_buffer.write_bytes_aligned(&v).expect(unexpected);
            } else {
                let v = encode_to_utf8like(self.frame_number().into())?;
                header_buffer.write_bytes_aligned(&v).expect(unexpected);
            }
            write_block_size_extra(self.block_size_spec(), header_buffer).expect(unexpected);
            write_sample_rate_extra(self.sample_rate_spec(), header_buffer).expect(unexpected);

            dest.write_bytes_aligned(header_buffer.as_slice())
                .map_err(OutputError::<S>::from_sink)?;
            dest.write(HEADER_CRC.checksum(header_buffer.as_slice()))
                .map_err(OutputError::<S>::from_sink)?;
            Ok(())
        })
    }
}

/// Writes a subframe header given the 6-bit type tag.
#[inline]
fn write_subframe_header<S: BitSink>(
    dest: &mut S,
    typetag: u8,
    wasted_bits: usize,
) -> Result<(), S::Error> {
    // 1 zero-pad bit, 6-bit type, 1-bit wasted flag.
    if wasted_bits == 0 {
        dest.write_lsbs(typetag << 1, 8)
    } else {
        dest.write_lsbs((typetag << 1) | 1, 8)?;
        dest.write_unary(wasted_bits as u32 - 1)
    }
}

/// Returns the size of a subframe header in bits.
#[inline]
const fn subframe_header_bits(wasted_bits: usize) -> usize {
    8 + wasted_bits
}

impl BitRepr for SubFrame {
    #[inline]
    fn count_bits(&self) -> usize {
        match self {
            Self::Verbatim(c) => c.count_bits(),
            Self::Constant(c) => c.count_bits(),
            Self::FixedLpc(c) => c.count_bits(),
            Self::Lpc(c) => c.count_bits(),
        }
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        match self {
            Self::Verbatim(c) => c.write(dest),
            Self::Constant(c) => c.write(dest),
            Self::FixedLpc(c) => c.write(dest),
            Self::Lpc(c) => c.write(dest),
        }
    }
}

impl BitRepr for Constant {
    #[inline]
    fn count_bits(&self) -> usize {
        subframe_header_bits(self.wasted_bits()) + self.bits_per_sample()
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        write_subframe_header(dest, 0x00, self.wasted_bits())
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_twoc(self.dc_offset(), self.bits_per_sample())
            .map_err(OutputError::<S>::from_sink)?;
        Ok(())
    }
}

impl BitRepr for Verbatim {
    #[inline]
    fn count_bits(&self) -> usize {
        Self::count_bits_from_metadata(
            self.samples().len(),
            self.bits_per_sample(),
            self.wasted_bits(),
        )
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        write_subframe_header(dest, 0x01, self.wasted_bits())
            .map_err(OutputError::<S>::from_sink)?;
        for i in 0..self.samples().len() {
            dest.write_twoc(self.samples()[i], self.bits_per_sample())
                .map_err(OutputError::<S>::from_sink)?;
        }
        Ok(())
    }
}

impl BitRepr for FixedLpc {
    #[inline]
    fn count_bits(&self) -> usize {
        subframe_header_bits(self.wasted_bits())
            + self.bits_per_sample() * self.order()
            + self.residual().count_bits()
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        let typetag = 0x08u8 | self.order() as u8;
        write_subframe_header(dest, typetag, self.wasted_bits())
            .map_err(OutputError::<S>::from_sink)?;
        for v in self.warm_up() {
            dest.write_twoc(*v, self.bits_per_sample())
                .map_err(OutputError::<S>::from_sink)?;
        }
        self.residual().write(dest)
    }
}

impl BitRepr for Lpc {
    #[inline]
    fn count_bits(&self) -> usize {
        let warm_up_bits = self.bits_per_sample() * self.order();
        subframe_header_bits(self.wasted_bits())
            + warm_up_bits
            + 4
            + 5
            + self.parameters().precision() * self.order()
            + self.residual().count_bits()
    }

    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        let typetag = 0x20u8 | (self.order() - 1) as u8;
        write_subframe_header(dest, typetag, self.wasted_bits())
            .map_err(OutputError::<S>::from_sink)?;

        for i in 0..self.order() {
            dest.write_twoc(self.warm_up()[i], self.bits_per_sample())
                .map_err(OutputError::<S>::from_sink)?;
        }

        debug_assert!(self.parameters().precision() < 16);
        dest.write_lsbs((self.parameters().precision() - 1) as u8, 4)
            .map_err(OutputError::<S>::from_sink)?;

        // the reference decoders do not support negative shifts.
        debug_assert!(self.parameters().shift() >= 0);
        dest.write_twoc(self.parameters().shift(), 5)
            .map_err(OutputError::<S>::from_sink)?;

        for ref_coef in self.parameters().coefs() {
            debug_assert!(*ref_coef < (1 << (self.parameters().precision() - 1)));
            debug_assert!(*ref_coef >= -(1 << (self.parameters().precision() - 1)));
            dest.write_twoc(*ref_coef, self.parameters().precision())
                .map_err(OutputError::<S>::from_sink)?;
        }

        self.residual().write(dest)
    }
}

impl Residual {
    /// Returns `(method_tag, parameter_width, escape_code)`.
    #[inline]
    fn method_spec(&self) -> (u8, usize, u8) {
        if self.five_bit_params() {
            (0b01, 5, ESCAPE_5BIT)
        } else {
            (0b00, 4, ESCAPE_4BIT)
        }
    }
}

impl BitRepr for Residual {
    #[inline]
    fn count_bits(&self) -> usize {
        let (_method, p_bits, _escape) = self.method_spec();
        let nparts = 1usize << self.partition_order();
        let part_len = self.block_size() >> self.partition_order();

        if self.escape_bits().iter().all(|&x| x == 0) {
            let quotient_bits: usize =
                self.sum_quotients() + self.block_size() - self.warmup_length();
            let mut remainder_bits: usize = self.sum_rice_params() * part_len;
            remainder_bits -= self.warmup_length() * self.rice_params()[0] as usize;
            2 + 4 + nparts * p_bits + quotient_bits + remainder_bits
        } else {
            // escaped partitions are rare; pay for the exact loop.
            let mut bits = 2 + 4;
            let mut offset = 0;
            for p in 0..nparts {
                let start = max(self.warmup_length(), offset);
                offset += part_len;
                let samples = offset - start;
                bits += p_bits;
                if self.escape_bits()[p] != 0 {
                    bits += 5 + self.escape_bits()[p] as usize * samples;
                } else {
                    let rice_p = self.rice_params()[p] as usize;
                    bits += (rice_p + 1) * samples;
                    for t in start..offset {
                        bits += self.quotients()[t] as usize;
                    }
                }
            }
            bits
        }
    }

    /// Writes `Residual` to the [`BitSink`].
    ///
    /// This is the innermost loop of the output side of the encoder, so
    /// computational efficiency is prioritized over readability.
    fn write<S: BitSink>(&self, dest: &mut S) -> Result<(), OutputError<S>> {
        let (method, p_bits, escape_code) = self.method_spec();
        dest.write_lsbs(method, 2)
            .map_err(OutputError::<S>::from_sink)?;
        dest.write_lsbs(self.partition_order() as u8, 4)
            .map_err(OutputError::<S>::from_sink)?;
        let nparts = 1usize << self.partition_order();

        let part_len = self.block_size() >> self.partition_order();
        let mut p = 0;
        let mut offset = 0;
        while p < nparts {
            let start = max(self.warmup_length(), offset);
            offset += part_len;
            let end = offset;

            if self.escape_bits()[p] != 0 {
                let width = self.escape_bits()[p] as usize;
                dest.write_lsbs(escape_code, p_bits)
                    .map_err(OutputError::<S>::from_sink)?;
                dest.write_lsbs(self.escape_bits()[p], 5)
                    .map_err(OutputError::<S>::from_sink)?;
                for t in start..end {
                    dest.write_twoc(rice::decode_signbit(self.remainders()[t]), width)
                        .map_err(OutputError::<S>::from_sink)?;
                }
            } else {
                let rice_p = self.rice_params()[p];
                dest.write_lsbs(rice_p, p_bits)
                    .map_err(OutputError::<S>::from_sink)?;
                let startbit = 1u32 << rice_p;
                let rice_p_plus_1 = (rice_p + 1) as usize;
                for t in start..end {
                    dest.write_zeros(self.quotients()[t] as usize)
                        .map_err(OutputError::<S>::from_sink)?;
                    dest.write_lsbs(self.remainders()[t] | startbit, rice_p_plus_1)
                        .map_err(OutputError::<S>::from_sink)?;
                }
            }
            p += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FrameOffset;
    use crate::component::SampleSizeSpec;
    use crate::component::SeekPoint;
    use crate::error::Verify;
    use crate::test_helper::make_random_residual;
    use crate::test_helper::make_verbatim_frame;

    #[test]
    fn write_empty_stream() {
        let stream = Stream::new(44100, 2, 16).expect("`Stream::new` should not fail.");
        let stream_bytes = stream.to_bytes();
        assert_eq!(
            stream_bytes.len() * 8,
            32 // fLaC
      + 1 + 7 + 24 // METADATA_BLOCK_HEADER
      + 16 + 16 + 24 + 24 + 20 + 3 + 5 + 36 + 128 // METADATA_BLOCK_STREAMINFO
        );
        assert_eq!(stream.count_bits(), stream_bytes.len() * 8);
        assert_eq!(&stream_bytes[0..4], b"fLaC");
    }

    #[test]
    fn write_stream_info() {
        let stream_info = StreamInfo::new(44100, 2, 16).expect("construction should not fail");
        let stream_info_bytes = stream_info.to_bytes();
        assert_eq!(
            stream_info_bytes.len() * 8,
            16 + 16 + 24 + 24 + 20 + 3 + 5 + 36 + 128
        );
        assert_eq!(stream_info.count_bits(), stream_info_bytes.len() * 8);
    }

    #[test]
    fn write_padding_and_seek_table() {
        let padding = Padding::new(17).expect("construction should not fail");
        assert_eq!(padding.to_bytes(), vec![0u8; 17]);

        let table = SeekTable::from_points(vec![
            SeekPoint::new(0, 0, 4096),
            SeekPoint::PLACEHOLDER,
        ]);
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), 2 * 18);
        assert_eq!(table.count_bits(), bytes.len() * 8);
        assert_eq!(&bytes[18..26], &[0xFF; 8]);
    }

    #[test]
    fn write_frame_header() {
        let header = FrameHeader::from_specs(
            BlockSizeSpec::from_size(2304),
            ChannelAssignment::Independent(2),
            SampleSizeSpec::Unspecified,
            SampleRateSpec::Unspecified,
        );
        header.to_bytes(); // just checking it doesn't panic.

        // test with a canonical frame
        let header = FrameHeader::from_specs(
            BlockSizeSpec::from_size(192),
            ChannelAssignment::Independent(2),
            SampleSizeSpec::Unspecified,
            SampleRateSpec::Unspecified,
        );
        header
            .verify_bit_counter()
            .expect("`FrameHeader::count_bits` should be accurate.");
        assert_eq!(
            header.to_bitstring(),
            concat!(
                "11111111_111110", // sync
                "01_",             // reserved / blocking strategy
                "00010000_",       // block size / sample rate (0=streaminfo)
                "00010000_",       // channel / bps (0=streaminfo) / reserved
                "00000000_",       // sample number
                "01101001",        // crc8
            )
        );

        assert_eq!(header.count_bits(), 48);
    }

    #[test]
    fn channel_assignment_encoding() {
        let ch = ChannelAssignment::Independent(8);
        assert_eq!(ch.to_bitstring(), "0111****");
        let ch = ChannelAssignment::RightSide;
        assert_eq!(ch.to_bitstring(), "1001****");
        ch.verify_bit_counter()
            .expect("`ChannelAssignment::count_bits` should be accurate.");
    }

    #[test]
    fn write_verbatim_frame() {
        let nchannels: usize = 3;
        let nsamples: usize = 17;
        let bits_per_sample: usize = 16;
        let stream_info = StreamInfo::new(16000, nchannels, bits_per_sample)
            .expect("`StreamInfo::new` should not return error");
        let framebuf = vec![-1i32; nsamples * nchannels];
        let frame = make_verbatim_frame(&stream_info, &framebuf, 0);
        frame
            .header()
            .verify_bit_counter()
            .expect("`FrameHeader::count_bits` should be accurate.");

        for ch in 0..3 {
            frame
                .subframe(ch)
                .unwrap()
                .verify_bit_counter()
                .expect("`SubFrame::count_bits` should be accurate.");
        }

        frame
            .verify_bit_counter()
            .expect("`Frame::count_bits` should be accurate.");
    }

    #[test]
    fn frame_crc_footer_is_over_whole_frame() {
        let stream_info = StreamInfo::new(16000, 1, 16).unwrap();
        let framebuf = vec![0x55i32; 64];
        let frame = make_verbatim_frame(&stream_info, &framebuf, 0);
        let bytes = frame.to_bytes();
        let body_len = bytes.len() - 2;
        let expected = FRAME_CRC.checksum(&bytes[..body_len]);
        let stored = u16::from(bytes[body_len]) << 8 | u16::from(bytes[body_len + 1]);
        assert_eq!(stored, expected);
    }

    #[test]
    fn subframe_header_with_wasted_bits() {
        // k=2: flag bit set, then unary-coded k-1 ("01").
        let constant = Constant::from_parts(64, 3, 14, 2);
        let mut sink = MemSink::new();
        constant.write(&mut sink).unwrap();
        assert_eq!(sink.len(), 8 + 2 + 14);
        assert_eq!(&sink.to_bitstring()[0..10], "00000001_0");
        constant
            .verify_bit_counter()
            .expect("`Constant::count_bits` should be accurate.");
    }

    #[test]
    fn utf8_encoding() {
        let v = 0x56;
        let bs = encode_to_utf8like(v).unwrap();
        assert_eq!(bs, &[0x56]);

        let v = 0x1024;
        let bs = encode_to_utf8like(v).unwrap();
        assert_eq!(bs, &[0xE1, 0x80, 0xA4]);

        let v = 0xF_FFFF_FFFFu64; // 36 bits of ones
        let bs = encode_to_utf8like(v).unwrap();
        assert_eq!(bs, &[0xFE, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF]);

        let v = 0x10_0000_0000u64; // out of domain
        encode_to_utf8like(v).expect_err("Should be out of domain");

        for v in [0u64, 127, 128, 65535, (1 << 36) - 1] {
            assert_eq!(utf8like_bytesize(v), encode_to_utf8like(v).unwrap().len());
        }
    }

    #[test]
    fn bit_count_residual() {
        let residual = make_random_residual(rand::thread_rng(), 0);
        residual
            .verify()
            .expect("should construct a valid Residual");
        residual
            .verify_bit_counter()
            .expect("`Residual::count_bits` should be accurate");
    }

    #[test]
    fn bit_count_escaped_residual() {
        // 2 partitions, the second escaped with 7-bit raw samples.
        let block_size = 8;
        let quotients = vec![1, 1, 1, 1, 0, 0, 0, 0];
        let mut remainders = vec![0u32; 8];
        for (t, v) in [-3i32, 60, -60, 5].iter().enumerate() {
            remainders[4 + t] = crate::rice::encode_signbit(*v);
        }
        let residual = Residual::from_parts_with_escapes(
            1,
            block_size,
            0,
            vec![0, ESCAPE_4BIT],
            vec![0, 7],
            quotients,
            remainders,
        );
        residual
            .verify_bit_counter()
            .expect("`Residual::count_bits` should be accurate");
        // method(2) + order(4) + [param(4) + 4*(q+1+0)] + [param(4) + width(5) + 4*7]
        assert_eq!(residual.count_bits(), 2 + 4 + 4 + 8 + 4 + 5 + 28);
        assert_eq!(residual.residual(5), 60);
        assert_eq!(residual.residual(6), -60);
    }

    #[test]
    fn frame_bitstream_precomputation() {
        let stream_info = StreamInfo::new(44100, 2, 16).unwrap();
        let samples: Vec<i32> = (0..512).map(|t| (t % 100) - 50).collect();
        let mut frame = make_verbatim_frame(&stream_info, &samples, 0);
        let frame_cloned = frame.clone();
        let reference = {
            let mut bv = MemSink::new();
            frame_cloned.write(&mut bv).unwrap();
            assert!(bv.len() % 8 == 0); // frames must be byte-aligned.
            bv.into_inner()
        };

        frame.precompute_bitstream();
        assert!(frame.is_bitstream_precomputed());
        assert!(!frame_cloned.is_bitstream_precomputed());

        let mut bv = MemSink::new();
        frame.write(&mut bv).unwrap();
        assert_eq!(bv.into_inner(), reference);
        assert_eq!(frame.count_bits(), reference.len() * 8);
    }

    #[test]
    fn frame_offsets_roundtrip_through_utf8() {
        let mut header = FrameHeader::new(
            4096,
            ChannelAssignment::Independent(1),
            16,
            44100,
            FrameOffset::Frame(0),
        )
        .unwrap();
        let short = header.count_bits();
        header.set_frame_offset(FrameOffset::Frame(1_000_000));
        assert!(header.count_bits() > short);
        header
            .verify_bit_counter()
            .expect("`FrameHeader::count_bits` should be accurate.");
    }
}
