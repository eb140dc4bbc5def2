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
use std::cmp::min;

use super::bitrepr::BitRepr;
use super::verify::verify_block_size;
use super::verify::verify_bps;
use super::verify::verify_sample_range;
use crate::bitsink::MemSink;
use crate::constant::panic_msg;
use crate::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use crate::constant::MAX_CHANNELS;
use crate::error::verify_range;
use crate::error::verify_true;
use crate::error::Verify;
use crate::error::VerifyError;
use crate::rice;

/// The whole stream: STREAMINFO, other metadata blocks, audio frames.
#[derive(Debug)]
pub struct Stream {
    stream_info: MetadataBlock,
    metadata: Vec<MetadataBlock>,
    frames: Vec<Frame>,
}

impl Stream {
    /// Constructs `Stream` with the given meta information.
    ///
    /// # Errors
    ///
    /// Returns error if an input argument is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cadenza::component::*;
    /// let stream = Stream::new(16000, 1, 16).unwrap();
    /// assert_eq!(stream.stream_info().channels(), 1);
    /// ```
    pub fn new(
        sample_rate: usize,
        channels: usize,
        bits_per_sample: usize,
    ) -> Result<Self, VerifyError> {
        Ok(Self::with_stream_info(StreamInfo::new(
            sample_rate,
            channels,
            bits_per_sample,
        )?))
    }

    /// Constructs `Stream` with the given `StreamInfo`.
    pub fn with_stream_info(stream_info: StreamInfo) -> Self {
        Self {
            stream_info: MetadataBlock::from_stream_info(stream_info, true),
            metadata: vec![],
            frames: vec![],
        }
    }

    /// Returns a reference to the [`StreamInfo`] of `self`.
    ///
    /// # Panics
    ///
    /// Panics if `self` is corrupted by manually modifying fields.
    pub fn stream_info(&self) -> &StreamInfo {
        if let MetadataBlockData::StreamInfo(ref info) = self.stream_info.data {
            info
        } else {
            panic!("{}", panic_msg::DATA_INCONSISTENT)
        }
    }

    /// Returns [`StreamInfo`] wrapped in a [`MetadataBlock`].
    pub(crate) fn stream_info_block(&self) -> &MetadataBlock {
        &self.stream_info
    }

    /// Returns a mutable reference to the [`StreamInfo`] of `self`.
    ///
    /// # Panics
    ///
    /// Panics if `self` is corrupted by manually modifying fields.
    pub fn stream_info_mut(&mut self) -> &mut StreamInfo {
        if let MetadataBlockData::StreamInfo(ref mut info) = self.stream_info.data {
            info
        } else {
            panic!("{}", panic_msg::DATA_INCONSISTENT)
        }
    }

    /// Appends [`Frame`] to this `Stream` and updates [`StreamInfo`].
    ///
    /// This updates the frame statistics in `stream_info` but not the
    /// MD5 digest; call `set_md5_digest` manually via
    /// [`Self::stream_info_mut`].
    pub fn add_frame(&mut self, frame: Frame) {
        self.stream_info_mut().update_frame_info(&frame);
        self.frames.push(frame);
    }

    /// Adds [`MetadataBlockData`] to this `Stream`.
    pub fn add_metadata_block(&mut self, metadata: MetadataBlockData) {
        let metadata = MetadataBlock::from_parts(true, metadata);
        if let Some(x) = self.metadata.last_mut() {
            x.is_last = false;
        } else {
            self.stream_info.is_last = false;
        }
        self.metadata.push(metadata);
    }

    /// Returns [`Frame`] for the given frame number.
    pub fn frame(&self, n: usize) -> Option<&Frame> {
        self.frames.get(n)
    }

    /// Returns the number of [`Frame`]s in the stream.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn metadata(&self) -> &[MetadataBlock] {
        &self.metadata
    }

    /// Returns [`Frame`]s as a slice.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn frames_mut(&mut self) -> &mut Vec<Frame> {
        &mut self.frames
    }

    /// Returns the seek table of the stream, if any.
    pub fn seek_table(&self) -> Option<&SeekTable> {
        self.metadata.iter().find_map(|m| m.data.as_seek_table())
    }

    /// Resolves seek-table template points against the collected frames.
    ///
    /// Every point whose target sample is covered by a frame receives
    /// that frame's first sample number, its byte offset relative to the
    /// first frame, and its sample count. Points beyond the last frame
    /// become placeholders. A point never resolves to an earlier frame
    /// than a preceding point.
    pub fn resolve_seek_points(&mut self) {
        let mut locations = Vec::with_capacity(self.frames.len());
        let mut sample = 0u64;
        let mut offset = 0u64;
        for frame in &self.frames {
            locations.push((sample, offset, frame.block_size() as u16));
            sample += frame.block_size() as u64;
            offset += (frame.count_bits() / 8) as u64;
        }
        let total_samples = sample;

        for block in &mut self.metadata {
            if let MetadataBlockData::SeekTable(ref mut table) = block.data {
                for point in &mut table.points {
                    if point.sample_number >= total_samples {
                        *point = SeekPoint::PLACEHOLDER;
                        continue;
                    }
                    let idx = locations
                        .partition_point(|&(first, _, _)| first <= point.sample_number)
                        - 1;
                    let (first, byte_offset, samples) = locations[idx];
                    point.sample_number = first;
                    point.stream_offset = byte_offset;
                    point.frame_samples = samples;
                }
            }
        }
    }

    pub(crate) fn verify_variable_blocking_frames(&self) -> Result<(), VerifyError> {
        let mut current = 0u64;

        for (i, frame) in self.frames.iter().enumerate() {
            verify_true!(
                "variable_block_size",
                frame.header.variable_block_size,
                "must be same for all frames"
            )
            .and_then(|()| {
                verify_true!(
                    "start_sample_number",
                    frame.header.start_sample_number == current,
                    "must be the sum of the block sizes of the preceding frames"
                )
            })
            .map_err(|e| e.within("header").within(&format!("frames[{i}]")))?;
            frame
                .verify()
                .map_err(|e| e.within(&format!("frames[{i}]")))?;
            current = current.wrapping_add(frame.header.block_size() as u64);
        }
        Ok(())
    }

    pub(crate) fn verify_fixed_blocking_frames(&self) -> Result<(), VerifyError> {
        let mut current = 0u32;

        for (i, frame) in self.frames.iter().enumerate() {
            verify_true!(
                "variable_block_size",
                !frame.header.variable_block_size,
                "must be same for all frames"
            )
            .and_then(|()| {
                verify_true!(
                    "frame_number",
                    frame.header.frame_number == current,
                    "must be the count of the preceding frames"
                )
            })
            .map_err(|e| e.within("header").within(&format!("frames[{i}]")))?;
            frame
                .verify()
                .map_err(|e| e.within(&format!("frames[{i}]")))?;
            current = current.wrapping_add(1);
        }
        Ok(())
    }
}

/// A metadata block: the last-block flag plus one block body.
#[derive(Clone, Debug)]
pub struct MetadataBlock {
    pub(crate) is_last: bool,
    pub(crate) data: MetadataBlockData,
}

impl MetadataBlock {
    pub(crate) const fn from_parts(is_last: bool, data: MetadataBlockData) -> Self {
        Self { is_last, data }
    }

    const fn from_stream_info(info: StreamInfo, is_last: bool) -> Self {
        Self {
            is_last,
            data: MetadataBlockData::StreamInfo(info),
        }
    }

    /// Returns true when this is the last metadata block of the stream.
    pub const fn is_last(&self) -> bool {
        self.is_last
    }

    /// Returns the block body.
    pub const fn data(&self) -> &MetadataBlockData {
        &self.data
    }
}

/// Enum that covers the variants of a metadata block body.
///
/// STREAMINFO, PADDING and SEEKTABLE are understood by the core; other
/// block types are preserved verbatim.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum MetadataBlockData {
    /// Mandatory first block carrying the stream parameters.
    StreamInfo(StreamInfo),
    /// A run of zero bytes reserved for later in-place edits.
    Padding(Padding),
    /// An ordered list of seek points.
    SeekTable(SeekTable),
    /// A block of a type the core does not interpret.
    Unknown {
        /// 7-bit metadata type tag.
        typetag: u8,
        /// Metadata content.
        data: Vec<u8>,
    },
}

impl MetadataBlockData {
    /// Constructs a new `MetadataBlockData::Unknown` from its content.
    ///
    /// # Errors
    ///
    /// Emits an error when `tag` is out of range.
    pub fn new_unknown(tag: u8, data: &[u8]) -> Result<Self, VerifyError> {
        verify_range!("tag", tag, 4..=126)?;
        Ok(Self::Unknown {
            typetag: tag,
            data: data.to_owned(),
        })
    }

    pub(crate) fn typetag(&self) -> u8 {
        match self {
            Self::StreamInfo(_) => 0,
            Self::Padding(_) => 1,
            Self::SeekTable(_) => 3,
            Self::Unknown { typetag, .. } => *typetag,
        }
    }

    /// Obtains the inner [`StreamInfo`] if `self` contains one.
    pub fn as_stream_info(&self) -> Option<&StreamInfo> {
        if let Self::StreamInfo(ref info) = self {
            Some(info)
        } else {
            None
        }
    }

    /// Obtains the inner [`SeekTable`] if `self` contains one.
    pub fn as_seek_table(&self) -> Option<&SeekTable> {
        if let Self::SeekTable(ref table) = self {
            Some(table)
        } else {
            None
        }
    }
}

impl From<StreamInfo> for MetadataBlockData {
    fn from(value: StreamInfo) -> Self {
        Self::StreamInfo(value)
    }
}

impl From<Padding> for MetadataBlockData {
    fn from(value: Padding) -> Self {
        Self::Padding(value)
    }
}

impl From<SeekTable> for MetadataBlockData {
    fn from(value: SeekTable) -> Self {
        Self::SeekTable(value)
    }
}

/// PADDING metadata block: `size` zero bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Padding {
    size: usize,
}

impl Padding {
    /// Constructs a `Padding` block of the given byte size.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` exceeds the 24-bit length field.
    pub fn new(size: usize) -> Result<Self, VerifyError> {
        let ret = Self { size };
        ret.verify()?;
        Ok(ret)
    }

    pub(crate) const fn from_parts(size: usize) -> Self {
        Self { size }
    }

    /// Returns the size of the padding body in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// One entry of a [`SeekTable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeekPoint {
    /// First sample number of the target frame, or the placeholder.
    pub sample_number: u64,
    /// Byte offset of the target frame relative to the first frame.
    pub stream_offset: u64,
    /// Number of samples in the target frame.
    pub frame_samples: u16,
}

impl SeekPoint {
    /// The reserved sample number marking an unused seek point.
    pub const PLACEHOLDER_SAMPLE: u64 = u64::MAX;

    /// An unused seek point.
    pub const PLACEHOLDER: Self = Self {
        sample_number: Self::PLACEHOLDER_SAMPLE,
        stream_offset: 0,
        frame_samples: 0,
    };

    /// Constructs a resolved seek point.
    pub const fn new(sample_number: u64, stream_offset: u64, frame_samples: u16) -> Self {
        Self {
            sample_number,
            stream_offset,
            frame_samples,
        }
    }

    /// Returns true for the reserved placeholder point.
    pub const fn is_placeholder(&self) -> bool {
        self.sample_number == Self::PLACEHOLDER_SAMPLE
    }
}

/// SEEKTABLE metadata block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SeekTable {
    pub(crate) points: Vec<SeekPoint>,
}

impl SeekTable {
    /// Constructs an empty seek table.
    pub const fn new() -> Self {
        Self { points: vec![] }
    }

    pub(crate) fn from_points(points: Vec<SeekPoint>) -> Self {
        Self { points }
    }

    /// Constructs a template with one point per `interval` samples.
    ///
    /// The points carry their target sample numbers and must be
    /// resolved to actual frame locations after encoding (see
    /// [`Stream::resolve_seek_points`]).
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn with_spaced_points(interval: usize, total_samples: u64) -> Self {
        assert!(interval > 0);
        let mut points = vec![];
        let mut target = 0u64;
        while target < total_samples {
            points.push(SeekPoint::new(target, 0, 0));
            target += interval as u64;
        }
        Self { points }
    }

    /// Returns the seek points.
    pub fn points(&self) -> &[SeekPoint] {
        &self.points
    }
}

/// Enum for channel assignment in a frame header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelAssignment {
    /// The frame contains its channels independently.
    ///
    /// The `u8` field is the number of channels. This is the only
    /// option when the number of channels is not two.
    Independent(u8),
    /// The frame contains left and side channels.
    LeftSide,
    /// The frame contains right and side channels.
    RightSide,
    /// The frame contains mid and side channels.
    MidSide,
}

impl ChannelAssignment {
    /// Constructs `ChannelAssignment` from the 4-bit header tag.
    #[inline]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        if tag < 8 {
            Some(Self::Independent(tag + 1))
        } else if tag == 8 {
            Some(Self::LeftSide)
        } else if tag == 9 {
            Some(Self::RightSide)
        } else if tag == 10 {
            Some(Self::MidSide)
        } else {
            None
        }
    }

    /// Returns the number of extra sample bits for channel `ch`.
    ///
    /// The side signal needs one extra bit to hold differences as large
    /// as `MAX - MIN`.
    #[inline]
    pub const fn bits_per_sample_offset(&self, ch: usize) -> usize {
        #[allow(clippy::match_same_arms, clippy::bool_to_int_with_if)]
        match *self {
            Self::Independent(_) => 0,
            Self::LeftSide => {
                if ch == 1 {
                    1 // side
                } else {
                    0 // left
                }
            }
            Self::RightSide => {
                if ch == 0 {
                    1 // side
                } else {
                    0 // right
                }
            }
            Self::MidSide => {
                if ch == 1 {
                    1 // side
                } else {
                    0 // mid
                }
            }
        }
    }

    #[inline]
    pub(crate) fn select_channels(
        &self,
        l: SubFrame,
        r: SubFrame,
        m: SubFrame,
        s: SubFrame,
    ) -> (SubFrame, SubFrame) {
        match *self {
            Self::Independent(_) => (l, r),
            Self::LeftSide => (l, s),
            Self::RightSide => (s, r),
            Self::MidSide => (m, s),
        }
    }

    /// Returns the number of channels the frame carries.
    #[inline]
    pub fn channels(&self) -> usize {
        if let Self::Independent(n) = self {
            *n as usize
        } else {
            2
        }
    }
}

/// The location of a frame, as a frame count or a starting sample.
///
/// `Self::Frame` implies fixed-blocking mode, `Self::StartSample`
/// variable-blocking mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameOffset {
    /// Offset specified by the number of preceding frames.
    Frame(u32),
    /// Offset specified by the number of preceding samples.
    StartSample(u64),
}

/// Reimplementation of `u32::ilog2` for older compilers.
#[inline]
fn ilog2(x: u32) -> u32 {
    31 - x.leading_zeros()
}

/// Enum for the block-size specifier in a frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockSizeSpec {
    /// Reserved.
    Reserved,
    /// Special case for `size == 192`.
    S192,
    /// Sizes of the form `576 * 2^n` for `n` in `0..=3`.
    Pow2Mul576(u8),
    /// Size stored in one byte at the end of the frame header.
    ExtraByte(u8),
    /// Size stored in two bytes at the end of the frame header.
    ExtraTwoBytes(u16),
    /// Sizes of the form `256 * 2^n` for `n` in `0..=7`.
    Pow2Mul256(u8),
}

impl BlockSizeSpec {
    /// Constructs `BlockSizeSpec` from a size in samples.
    ///
    /// This function never returns `Self::Reserved`.
    #[inline]
    pub fn from_size(size: u16) -> Self {
        match size {
            192 => Self::S192,
            576 | 1152 | 2304 | 4608 => Self::Pow2Mul576(ilog2(u32::from(size / 576)) as u8),
            256 | 512 | 1024 | 2048 | 4096 | 8192 | 16384 | 32768 => {
                Self::Pow2Mul256(ilog2(u32::from(size / 256)) as u8)
            }
            x if x <= 256 => Self::ExtraByte((x - 1) as u8),
            x => Self::ExtraTwoBytes(x - 1),
        }
    }

    /// Returns the number of extra bits required after the header body.
    #[inline]
    pub(crate) fn count_extra_bits(self) -> usize {
        match self {
            Self::ExtraByte(_) => 8,
            Self::ExtraTwoBytes(_) => 16,
            Self::Reserved | Self::S192 | Self::Pow2Mul576(_) | Self::Pow2Mul256(_) => 0,
        }
    }

    /// Returns the block size encoded by this spec.
    #[inline]
    pub fn block_size(self) -> Option<usize> {
        match self {
            Self::Reserved => None,
            Self::S192 => Some(192),
            Self::Pow2Mul576(x) => Some(576usize << x as usize),
            Self::ExtraByte(x) => Some(x as usize + 1),
            Self::ExtraTwoBytes(x) => Some(x as usize + 1),
            Self::Pow2Mul256(x) => Some(256usize << x as usize),
        }
    }

    /// Returns true when the size has a dedicated code (no extra bytes).
    ///
    /// Streamable-subset frames may only use such sizes.
    #[inline]
    pub fn is_enumerated(self) -> bool {
        matches!(self, Self::S192 | Self::Pow2Mul576(_) | Self::Pow2Mul256(_))
    }

    /// Returns the 4-bit indicator for this spec.
    #[inline]
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Reserved => 0,
            Self::S192 => 1,
            Self::Pow2Mul576(x) => 2 + x,
            Self::ExtraByte(_) => 6,
            Self::ExtraTwoBytes(_) => 7,
            Self::Pow2Mul256(x) => 8 + x,
        }
    }
}

/// Enum for the sample-size (bits-per-sample) specifier.
///
/// Codes exist only for the widths enumerated here; all other widths
/// are written as `Unspecified` and inherited from STREAMINFO.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SampleSizeSpec {
    /// Instructs decoders to take the sample size from STREAMINFO.
    Unspecified = 0,
    /// 8 bits per sample.
    B8 = 1,
    /// 12 bits per sample.
    B12 = 2,
    /// `tag == 3` is reserved.
    Reserved3 = 3,
    /// 16 bits per sample.
    B16 = 4,
    /// 20 bits per sample.
    B20 = 5,
    /// 24 bits per sample.
    B24 = 6,
    /// `tag == 7` is reserved.
    Reserved7 = 7,
}

impl SampleSizeSpec {
    /// Constructs `SampleSizeSpec` from the 3-bit tag.
    #[inline]
    pub const fn from_tag(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unspecified),
            1 => Some(Self::B8),
            2 => Some(Self::B12),
            3 => Some(Self::Reserved3),
            4 => Some(Self::B16),
            5 => Some(Self::B20),
            6 => Some(Self::B24),
            7 => Some(Self::Reserved7),
            _ => None,
        }
    }

    /// Returns the tag corresponding to `self`.
    #[inline]
    pub const fn into_tag(self) -> u8 {
        self as u8
    }

    /// Constructs `SampleSizeSpec` from the bits-per-sample value.
    #[inline]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::B8),
            12 => Some(Self::B12),
            16 => Some(Self::B16),
            20 => Some(Self::B20),
            24 => Some(Self::B24),
            _ => None,
        }
    }

    /// Returns the bits-per-sample value corresponding to `self`.
    #[inline]
    pub const fn into_bits(self) -> Option<u8> {
        match self {
            Self::Unspecified | Self::Reserved3 | Self::Reserved7 => None,
            Self::B8 => Some(8),
            Self::B12 => Some(12),
            Self::B16 => Some(16),
            Self::B20 => Some(20),
            Self::B24 => Some(24),
        }
    }

    /// Returns true for the reserved tags.
    #[inline]
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved3 | Self::Reserved7)
    }
}

/// Enum for the sample-rate specifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SampleRateSpec {
    /// Instructs decoders to take the rate from STREAMINFO.
    Unspecified,
    /// 88.2kHz.
    R88_2kHz,
    /// 176.4kHz.
    R176_4kHz,
    /// 192kHz.
    R192kHz,
    /// 8kHz.
    R8kHz,
    /// 16kHz.
    R16kHz,
    /// 22.05kHz.
    R22_05kHz,
    /// 24kHz.
    R24kHz,
    /// 32kHz.
    R32kHz,
    /// 44.1kHz.
    R44_1kHz,
    /// 48kHz.
    R48kHz,
    /// 96kHz.
    R96kHz,
    /// An immediate value specifying kHz up to 255kHz.
    KHz(u8),
    /// An immediate value specifying Hz up to 65535Hz.
    Hz(u16),
    /// An immediate value specifying deca-Hz up to 655.35kHz.
    DaHz(u16),
}

impl SampleRateSpec {
    /// Constructs `SampleRateSpec` from a frequency in Hz.
    ///
    /// Returns `None` when `freq` is not representable. For frequencies
    /// without a dedicated code, `KHz`, `DaHz` and `Hz` immediates are
    /// tried in this order. This function never returns
    /// `Self::Unspecified`.
    #[inline]
    pub fn from_freq(freq: u32) -> Option<Self> {
        match freq {
            88_200 => Some(Self::R88_2kHz),
            176_400 => Some(Self::R176_4kHz),
            192_000 => Some(Self::R192kHz),
            8_000 => Some(Self::R8kHz),
            16_000 => Some(Self::R16kHz),
            22_050 => Some(Self::R22_05kHz),
            24_000 => Some(Self::R24kHz),
            32_000 => Some(Self::R32kHz),
            44_100 => Some(Self::R44_1kHz),
            48_000 => Some(Self::R48kHz),
            96_000 => Some(Self::R96kHz),
            _ => None,
        }
        .or_else(|| {
            (0 == freq % 1000)
                .then(|| (freq / 1000).try_into().ok().map(Self::KHz))
                .flatten()
        })
        .or_else(|| {
            (0 == freq % 10)
                .then(|| (freq / 10).try_into().ok().map(Self::DaHz))
                .flatten()
        })
        .or_else(|| freq.try_into().ok().map(Self::Hz))
    }

    /// Constructs `SampleRateSpec` from the tag and its extra data.
    #[inline]
    pub(crate) fn from_tag_and_data(tag: u8, value: Option<usize>) -> Option<Self> {
        if tag > 0b1110 {
            return None;
        }
        Some(match tag {
            0b0000 => Self::Unspecified,
            0b0001 => Self::R88_2kHz,
            0b0010 => Self::R176_4kHz,
            0b0011 => Self::R192kHz,
            0b0100 => Self::R8kHz,
            0b0101 => Self::R16kHz,
            0b0110 => Self::R22_05kHz,
            0b0111 => Self::R24kHz,
            0b1000 => Self::R32kHz,
            0b1001 => Self::R44_1kHz,
            0b1010 => Self::R48kHz,
            0b1011 => Self::R96kHz,
            0b1100 => Self::KHz(value? as u8),
            0b1101 => Self::Hz(value? as u16),
            0b1110 => Self::DaHz(value? as u16),
            _ => unreachable!(), // covered by the first if-stmt of this fn.
        })
    }

    /// Returns the frequency in Hz, when specified.
    #[inline]
    pub fn freq(&self) -> Option<u32> {
        match *self {
            Self::Unspecified => None,
            Self::R88_2kHz => Some(88_200),
            Self::R176_4kHz => Some(176_400),
            Self::R192kHz => Some(192_000),
            Self::R8kHz => Some(8_000),
            Self::R16kHz => Some(16_000),
            Self::R22_05kHz => Some(22_050),
            Self::R24kHz => Some(24_000),
            Self::R32kHz => Some(32_000),
            Self::R44_1kHz => Some(44_100),
            Self::R48kHz => Some(48_000),
            Self::R96kHz => Some(96_000),
            Self::KHz(x) => Some(u32::from(x) * 1000),
            Self::Hz(x) => Some(u32::from(x)),
            Self::DaHz(x) => Some(u32::from(x) * 10),
        }
    }

    /// Returns true when the rate has a dedicated code (no extra bytes).
    #[inline]
    pub fn is_enumerated(&self) -> bool {
        !matches!(
            self,
            Self::Unspecified | Self::KHz(_) | Self::Hz(_) | Self::DaHz(_)
        )
    }

    /// Returns the number of extra bits required after the header body.
    #[inline]
    pub(crate) fn count_extra_bits(self) -> usize {
        match self {
            Self::KHz(_) => 8,
            Self::DaHz(_) | Self::Hz(_) => 16,
            _ => 0,
        }
    }

    /// Returns the 4-bit indicator for this spec.
    #[inline]
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::R88_2kHz => 1,
            Self::R176_4kHz => 2,
            Self::R192kHz => 3,
            Self::R8kHz => 4,
            Self::R16kHz => 5,
            Self::R22_05kHz => 6,
            Self::R24kHz => 7,
            Self::R32kHz => 8,
            Self::R44_1kHz => 9,
            Self::R48kHz => 10,
            Self::R96kHz => 11,
            Self::KHz(_) => 12,
            Self::Hz(_) => 13,
            Self::DaHz(_) => 14,
        }
    }
}

/// STREAMINFO metadata block body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamInfo {
    min_block_size: u16, // 16 bits: Minimum block size in samples.
    max_block_size: u16, // 16 bits: Maximum block size in samples.
    min_frame_size: u32, // 24 bits: Minimum frame size in bytes.
    max_frame_size: u32, // 24 bits: Maximum frame size in bytes.
    sample_rate: u32,    // 20 bits: Sample rate in Hz.
    channels: u8,        // 3 bits: written with a bias (-1)
    bits_per_sample: u8, // 5 bits: written with a bias (-1)
    total_samples: u64,  // 36 bits: Can be zero (unknown)
    md5: [u8; 16],
}

impl StreamInfo {
    /// Constructs new `StreamInfo`.
    ///
    /// For unspecified fields, the following default values are used:
    ///
    /// -  `min_block_size`: [`u16::MAX`],
    /// -  `max_block_size`: `0`,
    /// -  `min_frame_size`: [`u32::MAX`],
    /// -  `max_frame_size`: `0`,
    /// -  `total_samples`: `0`,
    /// -  `md5_digest`: `[0u8; 16]` (indicating "unknown").
    ///
    /// # Errors
    ///
    /// Returns an error if an input argument is out of range.
    pub fn new(
        sample_rate: usize,
        channels: usize,
        bits_per_sample: usize,
    ) -> Result<Self, VerifyError> {
        let ret = Self {
            min_block_size: u16::MAX,
            max_block_size: 0,
            min_frame_size: u32::MAX,
            max_frame_size: 0,
            sample_rate: sample_rate as u32,
            channels: channels as u8,
            bits_per_sample: bits_per_sample as u8,
            total_samples: 0,
            md5: [0; 16],
        };
        ret.verify()?;
        Ok(ret)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        min_block_size: u16,
        max_block_size: u16,
        min_frame_size: u32,
        max_frame_size: u32,
        sample_rate: u32,
        channels: u8,
        bits_per_sample: u8,
        total_samples: u64,
        md5: [u8; 16],
    ) -> Self {
        Self {
            min_block_size,
            max_block_size,
            min_frame_size,
            max_frame_size,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            md5,
        }
    }

    /// Updates `StreamInfo` with values from the given [`Frame`].
    ///
    /// This function updates `{min|max}_{block|frame}_size` and
    /// `total_samples`.
    pub fn update_frame_info(&mut self, frame: &Frame) {
        let block_size = frame.block_size() as u16;
        self.min_block_size = min(block_size, self.min_block_size);
        self.max_block_size = max(block_size, self.max_block_size);
        let frame_size_in_bytes = (frame.count_bits() / 8) as u32;
        self.min_frame_size = min(frame_size_in_bytes, self.min_frame_size);
        self.max_frame_size = max(frame_size_in_bytes, self.max_frame_size);

        self.total_samples += u64::from(block_size);
    }

    /// Returns the minimum frame size in bytes.
    #[inline]
    pub fn min_frame_size(&self) -> usize {
        self.min_frame_size as usize
    }

    /// Returns the maximum frame size in bytes.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size as usize
    }

    /// Returns the minimum block size in samples.
    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.min_block_size as usize
    }

    /// Returns the maximum block size in samples.
    #[inline]
    pub fn max_block_size(&self) -> usize {
        self.max_block_size as usize
    }

    /// Returns the sampling rate of the stream.
    #[inline]
    pub fn sample_rate(&self) -> usize {
        self.sample_rate as usize
    }

    /// Returns the number of channels of the stream.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels as usize
    }

    /// Returns bits-per-sample of the stream.
    #[inline]
    pub fn bits_per_sample(&self) -> usize {
        self.bits_per_sample as usize
    }

    /// Returns the number of inter-channel samples, 0 when unknown.
    #[inline]
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Sets the number of inter-channel samples.
    #[inline]
    pub fn set_total_samples(&mut self, n: u64) {
        self.total_samples = n;
    }

    /// Returns the MD5 digest of the input waveform.
    ///
    /// An all-zero digest means the digest is unknown.
    #[inline]
    pub fn md5_digest(&self) -> &[u8; 16] {
        &self.md5
    }

    /// Resets the MD5 digest value from the given slice.
    pub fn set_md5_digest(&mut self, digest: &[u8; 16]) {
        self.md5.copy_from_slice(digest);
    }

    /// Returns true if the stream declares a fixed block size.
    #[inline]
    pub fn is_fixed_blocking(&self) -> bool {
        self.min_block_size == self.max_block_size && self.min_block_size > 0
    }

    /// Resets the minimum/maximum block sizes.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is not a valid block size, or when
    /// `min_value > max_value`.
    pub fn set_block_sizes(
        &mut self,
        min_value: usize,
        max_value: usize,
    ) -> Result<(), VerifyError> {
        self.min_block_size = min_value
            .try_into()
            .map_err(|_| VerifyError::new("min_block_size", "must be a valid block size."))?;
        self.max_block_size = max_value
            .try_into()
            .map_err(|_| VerifyError::new("max_block_size", "must be a valid block size."))?;
        verify_block_size!("min_block_size", self.min_block_size as usize)?;
        verify_block_size!("max_block_size", self.max_block_size as usize)?;
        verify_true!(
            "min_block_size",
            self.min_block_size <= self.max_block_size,
            "must be smaller than `max_block_size`"
        )?;
        Ok(())
    }

    /// Resets the minimum/maximum frame sizes.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is not 24-bit representable, or
    /// when `min_value > max_value`.
    pub fn set_frame_sizes(
        &mut self,
        min_value: usize,
        max_value: usize,
    ) -> Result<(), VerifyError> {
        self.min_frame_size = min_value
            .try_into()
            .map_err(|_| VerifyError::new("min_frame_size", "must be a 24-bit integer."))?;
        self.max_frame_size = max_value
            .try_into()
            .map_err(|_| VerifyError::new("max_frame_size", "must be a 24-bit integer."))?;
        verify_true!(
            "min_frame_size",
            self.min_frame_size <= self.max_frame_size,
            "must be smaller than `max_frame_size`"
        )?;
        Ok(())
    }
}

/// One audio frame: a header and one subframe per channel.
#[derive(Clone, Debug)]
pub struct Frame {
    header: FrameHeader,
    subframes: Vec<SubFrame>,
    precomputed_bitstream: Option<Vec<u8>>,
}

impl Frame {
    /// Constructs `Frame` from a header and subframes.
    ///
    /// # Errors
    ///
    /// Emits an error if the number of channels specified in `header`
    /// does not match the number of subframes.
    pub fn new<I>(header: FrameHeader, subframes: I) -> Result<Self, VerifyError>
    where
        I: Iterator<Item = SubFrame>,
    {
        let subframes: Vec<SubFrame> = subframes.collect();
        verify_true!(
            "subframes.len()",
            header.channel_assignment().channels() == subframes.len(),
            "must match the channel specification in the header"
        )?;
        Ok(Self::from_parts(header, subframes))
    }

    #[inline]
    pub(crate) fn from_parts(header: FrameHeader, subframes: Vec<SubFrame>) -> Self {
        Self {
            header,
            subframes,
            precomputed_bitstream: None,
        }
    }

    pub(crate) fn with_capacity(header: FrameHeader) -> Self {
        Self {
            header,
            subframes: Vec::with_capacity(MAX_CHANNELS),
            precomputed_bitstream: None,
        }
    }

    /// Deconstructs the frame and transfers ownership of the parts.
    #[inline]
    pub fn into_parts(self) -> (FrameHeader, Vec<SubFrame>) {
        (self.header, self.subframes)
    }

    /// Adds a subframe.
    ///
    /// # Panics
    ///
    /// Panics when the number of subframes exceeds `MAX_CHANNELS`.
    #[inline]
    pub(crate) fn add_subframe(&mut self, subframe: SubFrame) {
        self.precomputed_bitstream = None;
        self.subframes.push(subframe);
        assert!(self.subframes.len() <= MAX_CHANNELS);
    }

    /// Returns a reference to the [`FrameHeader`] of this frame.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Returns the [`SubFrame`] for the given channel.
    #[inline]
    pub fn subframe(&self, ch: usize) -> Option<&SubFrame> {
        self.subframes.get(ch)
    }

    /// Returns the number of [`SubFrame`]s in this frame.
    #[inline]
    pub fn subframe_count(&self) -> usize {
        self.subframes.len()
    }

    #[inline]
    pub(crate) fn subframes(&self) -> &[SubFrame] {
        &self.subframes
    }

    /// Returns the block size of this frame.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.header.block_size()
    }

    /// Serializes into an internal buffer so later writes are copies.
    ///
    /// Idempotent, and does not change the written bytes.
    pub fn precompute_bitstream(&mut self) {
        if self.precomputed_bitstream.is_some() {
            return;
        }
        let mut dest = MemSink::with_capacity(self.count_bits());
        if self.write(&mut dest).is_ok() {
            self.precomputed_bitstream = Some(dest.into_inner());
        }
    }

    #[inline]
    pub(crate) fn precomputed_bitstream(&self) -> Option<&Vec<u8>> {
        self.precomputed_bitstream.as_ref()
    }

    /// Consumes `self` and returns the parts if it is a stereo frame.
    ///
    /// # Errors
    ///
    /// When `self.subframe_count() != 2`, returns the reconstructed self.
    #[inline]
    pub fn into_stereo_channels(self) -> Result<(FrameHeader, SubFrame, SubFrame), Self> {
        if self.subframe_count() != 2 {
            return Err(self);
        }
        let (header, subframes) = self.into_parts();
        let mut iter = subframes.into_iter();
        let ch0 = iter.next().expect(panic_msg::DATA_INCONSISTENT);
        let ch1 = iter.next().expect(panic_msg::DATA_INCONSISTENT);
        Ok((header, ch0, ch1))
    }

    #[cfg(test)]
    #[inline]
    pub(crate) const fn is_bitstream_precomputed(&self) -> bool {
        self.precomputed_bitstream.is_some()
    }
}

/// Frame header fields.
#[derive(Clone, Debug)]
pub struct FrameHeader {
    variable_block_size: bool, // must be same in all frames
    block_size_spec: BlockSizeSpec,
    channel_assignment: ChannelAssignment,
    sample_size_spec: SampleSizeSpec,
    sample_rate_spec: SampleRateSpec,
    frame_number: u32,        // used when variable_block_size == false
    start_sample_number: u64, // used when variable_block_size == true
}

impl FrameHeader {
    #[inline]
    pub(crate) const fn from_specs(
        block_size_spec: BlockSizeSpec,
        channel_assignment: ChannelAssignment,
        sample_size_spec: SampleSizeSpec,
        sample_rate_spec: SampleRateSpec,
    ) -> Self {
        Self {
            variable_block_size: true,
            block_size_spec,
            channel_assignment,
            sample_size_spec,
            sample_rate_spec,
            frame_number: 0,
            start_sample_number: 0,
        }
    }

    /// Constructs `FrameHeader` from the given metadata.
    ///
    /// Sample widths without a dedicated header code and sample rates
    /// that are representable in STREAMINFO but not in the header are
    /// written as "unspecified" and inherited from STREAMINFO on read.
    ///
    /// # Errors
    ///
    /// Returns an error when `block_size` is invalid.
    #[inline]
    pub fn new(
        block_size: usize,
        channel_assignment: ChannelAssignment,
        bits_per_sample: usize,
        sample_rate: usize,
        offset: FrameOffset,
    ) -> Result<Self, VerifyError> {
        verify_block_size!("block_size", block_size)?;
        let block_size_spec = BlockSizeSpec::from_size(block_size as u16);
        let sample_size_spec =
            SampleSizeSpec::from_bits(bits_per_sample as u8).unwrap_or(SampleSizeSpec::Unspecified);
        channel_assignment.verify()?;
        let sample_rate_spec =
            SampleRateSpec::from_freq(sample_rate as u32).unwrap_or(SampleRateSpec::Unspecified);
        let mut ret = Self::from_specs(
            block_size_spec,
            channel_assignment,
            sample_size_spec,
            sample_rate_spec,
        );
        ret.set_frame_offset(offset);
        Ok(ret)
    }

    #[inline]
    pub(crate) fn is_variable_blocking(&self) -> bool {
        self.variable_block_size
    }

    /// Sets the location of the frame.
    #[inline]
    pub fn set_frame_offset(&mut self, offset: FrameOffset) {
        match offset {
            FrameOffset::Frame(n) => {
                self.variable_block_size = false;
                self.frame_number = n;
            }
            FrameOffset::StartSample(n) => {
                self.variable_block_size = true;
                self.start_sample_number = n;
            }
        }
    }

    #[inline]
    pub(crate) fn frame_number(&self) -> u32 {
        self.frame_number
    }

    #[inline]
    pub(crate) fn start_sample_number(&self) -> u64 {
        self.start_sample_number
    }

    /// Returns the first sample number of this frame.
    ///
    /// In fixed-blocking mode the number is derived from the frame
    /// number and the stream block size.
    #[inline]
    pub fn start_sample(&self, stream_block_size: usize) -> u64 {
        if self.variable_block_size {
            self.start_sample_number
        } else {
            u64::from(self.frame_number) * stream_block_size as u64
        }
    }

    #[inline]
    pub(crate) fn sample_rate_spec(&self) -> &SampleRateSpec {
        &self.sample_rate_spec
    }

    #[inline]
    pub(crate) fn sample_size_spec(&self) -> &SampleSizeSpec {
        &self.sample_size_spec
    }

    /// Overwrites the channel assignment of the frame.
    #[inline]
    pub(crate) fn reset_channel_assignment(&mut self, channel_assignment: ChannelAssignment) {
        self.channel_assignment = channel_assignment;
    }

    /// Returns the block size.
    ///
    /// # Panics
    ///
    /// Panics if `self` carries the reserved block-size tag; headers
    /// built through the public constructors never do.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size_spec
            .block_size()
            .expect("Reserved block-size tag should not be used.")
    }

    #[inline]
    pub(crate) fn block_size_spec(&self) -> BlockSizeSpec {
        self.block_size_spec
    }

    /// Returns bits-per-sample, or `None` when the header inherits the
    /// value from STREAMINFO.
    #[inline]
    pub fn bits_per_sample(&self) -> Option<usize> {
        self.sample_size_spec.into_bits().map(|x| x as usize)
    }

    /// Returns the [`ChannelAssignment`] of this frame.
    #[inline]
    pub fn channel_assignment(&self) -> &ChannelAssignment {
        &self.channel_assignment
    }
}

/// The encoding of one channel's block.
#[derive(Clone, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum SubFrame {
    /// A constant-valued subframe.
    Constant(Constant),
    /// An uncompressed subframe.
    Verbatim(Verbatim),
    /// A fixed-predictor subframe.
    FixedLpc(FixedLpc),
    /// A linear-prediction subframe.
    Lpc(Lpc),
}

impl SubFrame {
    /// Returns the wasted-bits count of this subframe.
    #[inline]
    pub fn wasted_bits(&self) -> usize {
        match self {
            Self::Constant(c) => c.wasted_bits(),
            Self::Verbatim(c) => c.wasted_bits(),
            Self::FixedLpc(c) => c.wasted_bits(),
            Self::Lpc(c) => c.wasted_bits(),
        }
    }
}

impl From<Constant> for SubFrame {
    fn from(c: Constant) -> Self {
        Self::Constant(c)
    }
}

impl From<Verbatim> for SubFrame {
    fn from(c: Verbatim) -> Self {
        Self::Verbatim(c)
    }
}

impl From<FixedLpc> for SubFrame {
    fn from(c: FixedLpc) -> Self {
        Self::FixedLpc(c)
    }
}

impl From<Lpc> for SubFrame {
    fn from(c: Lpc) -> Self {
        Self::Lpc(c)
    }
}

/// A constant subframe: one value repeated over the block.
#[derive(Clone, Debug)]
pub struct Constant {
    block_size: usize,
    dc_offset: i32,
    bits_per_sample: u8,
    wasted_bits: u8,
}

impl Constant {
    /// Constructs new `Constant`.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// # use cadenza::component::*;
    /// # use cadenza::bitsink::*;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let subframe = Constant::new(1024, 3, 16)?;
    /// let mut sink = MemSink::new();
    /// subframe.write(&mut sink)?;
    /// assert_eq!(sink.as_slice(), [
    ///     0x00, /* tag */
    ///     0x00, 0x03, /* 16 bits written from MSB to LSB */
    /// ]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(
        block_size: usize,
        dc_offset: i32,
        bits_per_sample: usize,
    ) -> Result<Self, VerifyError> {
        verify_block_size!("block_size", block_size)?;
        verify_bps!("bits_per_sample", bits_per_sample)?;
        verify_sample_range!("dc_offset", dc_offset, bits_per_sample)?;
        Ok(Self::from_parts(
            block_size,
            dc_offset,
            bits_per_sample as u8,
            0,
        ))
    }

    /// Constructs new `Constant`. (unverified version)
    #[inline]
    pub(crate) fn from_parts(
        block_size: usize,
        dc_offset: i32,
        bits_per_sample: u8,
        wasted_bits: u8,
    ) -> Self {
        Self {
            block_size,
            dc_offset,
            bits_per_sample,
            wasted_bits,
        }
    }

    /// Returns the block size.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the constant value.
    #[inline]
    pub fn dc_offset(&self) -> i32 {
        self.dc_offset
    }

    /// Returns bits-per-sample (after wasted-bits reduction).
    #[inline]
    pub fn bits_per_sample(&self) -> usize {
        self.bits_per_sample as usize
    }

    /// Returns the wasted-bits count.
    #[inline]
    pub fn wasted_bits(&self) -> usize {
        self.wasted_bits as usize
    }
}

/// An uncompressed subframe.
#[derive(Clone, Debug)]
pub struct Verbatim {
    data: Vec<i32>,
    bits_per_sample: u8,
    wasted_bits: u8,
}

impl Verbatim {
    /// Constructs new `Verbatim`.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    pub fn new(samples: &[i32], bits_per_sample: usize) -> Result<Self, VerifyError> {
        verify_bps!("bits_per_sample", bits_per_sample)?;
        for v in samples {
            verify_sample_range!("samples", *v, bits_per_sample)?;
        }
        Ok(Self::from_samples(samples, bits_per_sample as u8, 0))
    }

    /// Constructs new `Verbatim`. (unverified version)
    pub(crate) fn from_samples(samples: &[i32], bits_per_sample: u8, wasted_bits: u8) -> Self {
        Self {
            data: Vec::from(samples),
            bits_per_sample,
            wasted_bits,
        }
    }

    /// Bit count of a verbatim subframe with the given parameters.
    #[inline]
    pub(crate) const fn count_bits_from_metadata(
        block_size: usize,
        bits_per_sample: usize,
        wasted_bits: usize,
    ) -> usize {
        8 + wasted_bits + block_size * bits_per_sample
    }

    /// Returns a slice of the verbatim samples.
    #[inline]
    pub fn samples(&self) -> &[i32] {
        &self.data
    }

    /// Returns bits-per-sample (after wasted-bits reduction).
    #[inline]
    pub fn bits_per_sample(&self) -> usize {
        self.bits_per_sample as usize
    }

    /// Returns the wasted-bits count.
    #[inline]
    pub fn wasted_bits(&self) -> usize {
        self.wasted_bits as usize
    }
}

/// A fixed-predictor subframe.
#[derive(Clone, Debug)]
pub struct FixedLpc {
    warm_up: heapless::Vec<i32, 4>,
    residual: Residual,
    bits_per_sample: u8,
    wasted_bits: u8,
}

impl FixedLpc {
    /// Constructs new `FixedLpc`.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    pub fn new(
        warm_up: &[i32],
        residual: Residual,
        bits_per_sample: usize,
    ) -> Result<Self, VerifyError> {
        verify_bps!("bits_per_sample", bits_per_sample)?;
        for v in warm_up {
            verify_sample_range!("warm_up", *v, bits_per_sample)?;
        }
        let warm_up = heapless::Vec::from_slice(warm_up)
            .map_err(|()| VerifyError::new("warm_up", "must be shorter than (or equal to) 4"))?;
        Ok(Self::from_parts(warm_up, residual, bits_per_sample as u8, 0))
    }

    #[inline]
    pub(crate) fn from_parts(
        warm_up: heapless::Vec<i32, 4>,
        residual: Residual,
        bits_per_sample: u8,
        wasted_bits: u8,
    ) -> Self {
        Self {
            warm_up,
            residual,
            bits_per_sample,
            wasted_bits,
        }
    }

    /// Returns the predictor order.
    #[inline]
    pub fn order(&self) -> usize {
        self.warm_up.len()
    }

    /// Returns the warm-up samples as a slice.
    #[inline]
    pub fn warm_up(&self) -> &[i32] {
        &self.warm_up
    }

    /// Returns a reference to the internal [`Residual`] component.
    #[inline]
    pub fn residual(&self) -> &Residual {
        &self.residual
    }

    /// Returns bits-per-sample (after wasted-bits reduction).
    #[inline]
    pub fn bits_per_sample(&self) -> usize {
        self.bits_per_sample as usize
    }

    /// Returns the wasted-bits count.
    #[inline]
    pub fn wasted_bits(&self) -> usize {
        self.wasted_bits as usize
    }
}

/// A linear-prediction subframe.
#[derive(Clone, Debug)]
pub struct Lpc {
    parameters: QuantizedParameters,
    warm_up: heapless::Vec<i32, MAX_LPC_ORDER>,
    residual: Residual,
    bits_per_sample: u8,
    wasted_bits: u8,
}

impl Lpc {
    /// Constructs new `Lpc`.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    pub fn new(
        warm_up: &[i32],
        parameters: QuantizedParameters,
        residual: Residual,
        bits_per_sample: usize,
    ) -> Result<Self, VerifyError> {
        verify_bps!("bits_per_sample", bits_per_sample)?;
        for v in warm_up {
            verify_sample_range!("warm_up", *v, bits_per_sample)?;
        }
        let warm_up = heapless::Vec::from_slice(warm_up).map_err(|()| {
            VerifyError::new("warm_up", "must be shorter than the maximum LPC order")
        })?;
        let ret = Self::from_parts(warm_up, parameters, residual, bits_per_sample as u8, 0);
        ret.verify()?;
        Ok(ret)
    }

    /// Constructs `Lpc` from parts.
    ///
    /// # Panics
    ///
    /// Panics if the length of `warm_up` differs from `parameters.order()`.
    #[inline]
    pub(crate) fn from_parts(
        warm_up: heapless::Vec<i32, MAX_LPC_ORDER>,
        parameters: QuantizedParameters,
        residual: Residual,
        bits_per_sample: u8,
        wasted_bits: u8,
    ) -> Self {
        assert_eq!(warm_up.len(), parameters.order());
        Self {
            parameters,
            warm_up,
            residual,
            bits_per_sample,
            wasted_bits,
        }
    }

    /// Returns the predictor order.
    #[inline]
    pub fn order(&self) -> usize {
        self.parameters.order()
    }

    /// Returns the warm-up samples as a slice.
    #[inline]
    pub fn warm_up(&self) -> &[i32] {
        &self.warm_up
    }

    /// Returns a reference to the parameter struct.
    #[inline]
    pub fn parameters(&self) -> &QuantizedParameters {
        &self.parameters
    }

    /// Returns a reference to the internal [`Residual`] component.
    #[inline]
    pub fn residual(&self) -> &Residual {
        &self.residual
    }

    /// Returns bits-per-sample (after wasted-bits reduction).
    #[inline]
    pub fn bits_per_sample(&self) -> usize {
        self.bits_per_sample as usize
    }

    /// Returns the wasted-bits count.
    #[inline]
    pub fn wasted_bits(&self) -> usize {
        self.wasted_bits as usize
    }
}

/// Quantized LPC coefficients with their shared shift and precision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuantizedParameters {
    coefs: heapless::Vec<i16, MAX_LPC_ORDER>,
    shift: i8,
    precision: usize,
}

/// Dequantizes a QLPC parameter. (Only used for debug/test currently.)
#[inline]
fn dequantize_parameter(coef: i16, shift: i8) -> f32 {
    let scalefac = 2.0f32.powi(-i32::from(shift));
    f32::from(coef) * scalefac
}

impl QuantizedParameters {
    /// Constructs new `QuantizedParameters`.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    pub fn new(coefs: &[i16], order: usize, shift: i8, precision: usize) -> Result<Self, VerifyError> {
        let ret = Self::from_parts(coefs, order, shift, precision);
        ret.verify()?;
        Ok(ret)
    }

    /// Constructs new `QuantizedParameters` without data verification.
    #[inline]
    pub(crate) fn from_parts(coefs: &[i16], order: usize, shift: i8, precision: usize) -> Self {
        debug_assert!(coefs.len() == order);
        let coefs = heapless::Vec::from_slice(coefs).expect(panic_msg::DATA_INCONSISTENT);
        Self {
            coefs,
            shift,
            precision,
        }
    }

    /// Returns the order of the LPC specified by this parameter.
    #[inline]
    pub fn order(&self) -> usize {
        self.coefs.len()
    }

    /// Returns the precision.
    #[inline]
    pub const fn precision(&self) -> usize {
        self.precision
    }

    /// Returns the shift parameter (quantization level).
    #[inline]
    pub const fn shift(&self) -> i8 {
        self.shift
    }

    /// Returns an individual coefficient in quantized form.
    pub fn coefficient(&self, idx: usize) -> Option<i16> {
        self.coefs.get(idx).copied()
    }

    /// Returns the quantized coefficients as a slice.
    #[inline]
    pub fn coefs(&self) -> &[i16] {
        &self.coefs
    }

    /// Returns a `Vec` containing dequantized coefficients.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn dequantized(&self) -> Vec<f32> {
        self.coefs
            .iter()
            .map(|x| dequantize_parameter(*x, self.shift))
            .collect()
    }
}

/// A partitioned-Rice coded residual signal.
///
/// The residual is split into `2^partition_order` partitions, each with
/// its own Rice parameter; the first partition is shortened by
/// `warmup_length`. A partition may instead be "escaped": stored as raw
/// two's-complement integers of a fixed bit width. Escaped partitions
/// are supported on the read side only.
#[derive(Clone, Debug)]
pub struct Residual {
    partition_order: u8,
    block_size: usize,
    warmup_length: usize,
    rice_params: Vec<u8>,
    // Per-partition raw bit width; non-zero only for escaped partitions.
    escape_bits: Vec<u8>,
    // Entropy-coding method 1 stores parameters in 5 bits instead of 4.
    five_bit_params: bool,

    // Sign bits are encoded into the LSBs (also for escaped samples).
    quotients: Vec<u32>,  // left-padded with zeros for warm-up samples
    remainders: Vec<u32>, // left-padded with zeros for warm-up samples

    // Some pre-computed values.
    sum_quotients: usize,
    sum_rice_params: usize,
}

impl Residual {
    /// Constructs `Residual` from pre-encoded parts.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` if an argument is invalid.
    pub fn new(
        partition_order: usize,
        block_size: usize,
        warmup_length: usize,
        rice_params: &[u8],
        quotients: &[u32],
        remainders: &[u32],
    ) -> Result<Self, VerifyError> {
        let ret = Self::from_parts(
            partition_order as u8,
            block_size,
            warmup_length,
            rice_params.to_owned(),
            quotients.to_owned(),
            remainders.to_owned(),
        );
        ret.verify()?;
        Ok(ret)
    }

    /// Constructs `Residual` with no escaped partitions.
    #[inline]
    pub(crate) fn from_parts(
        partition_order: u8,
        block_size: usize,
        warmup_length: usize,
        rice_params: Vec<u8>,
        quotients: Vec<u32>,
        remainders: Vec<u32>,
    ) -> Self {
        let escape_bits = vec![0u8; rice_params.len()];
        Self::from_parts_with_escapes(
            partition_order,
            block_size,
            warmup_length,
            rice_params,
            escape_bits,
            quotients,
            remainders,
        )
    }

    /// Constructs `Residual` allowing escaped partitions.
    ///
    /// For an escaped partition `p`, `escape_bits[p]` holds the raw bit
    /// width and `remainders[t]` holds the sign-folded sample values;
    /// `quotients[t]` must be zero there.
    #[inline]
    pub(crate) fn from_parts_with_escapes(
        partition_order: u8,
        block_size: usize,
        warmup_length: usize,
        rice_params: Vec<u8>,
        escape_bits: Vec<u8>,
        quotients: Vec<u32>,
        remainders: Vec<u32>,
    ) -> Self {
        debug_assert!(rice_params.len() == 1usize << partition_order as usize);
        debug_assert!(escape_bits.len() == rice_params.len());

        let sum_quotients: usize = quotients.iter().map(|x| *x as usize).sum();
        let sum_rice_params: usize = rice_params
            .iter()
            .zip(&escape_bits)
            .filter(|(_, &esc)| esc == 0)
            .map(|(x, _)| *x as usize)
            .sum();

        Self {
            partition_order,
            block_size,
            warmup_length,
            rice_params,
            escape_bits,
            five_bit_params: false,
            quotients,
            remainders,
            sum_quotients,
            sum_rice_params,
        }
    }

    /// Marks this residual as using the 5-bit parameter method.
    #[must_use]
    pub(crate) fn with_five_bit_parameters(mut self) -> Self {
        self.five_bit_params = true;
        self
    }

    /// Returns true when parameters are stored in 5-bit fields.
    #[inline]
    pub fn five_bit_params(&self) -> bool {
        self.five_bit_params
    }

    /// Returns the partition order.
    #[inline]
    pub fn partition_order(&self) -> usize {
        self.partition_order as usize
    }

    /// Returns the Rice parameter for the `p`-th partition.
    #[inline]
    pub fn rice_parameter(&self, p: usize) -> usize {
        self.rice_params[p] as usize
    }

    /// Returns the raw bit width of partition `p`, 0 when Rice-coded.
    #[inline]
    pub fn escape_bit_width(&self, p: usize) -> usize {
        self.escape_bits[p] as usize
    }

    /// Returns the residual value for the `t`-th sample.
    pub fn residual(&self, t: usize) -> i32 {
        let nparts = 1usize << self.partition_order as usize;
        let part_id = t * nparts / self.block_size;
        if self.escape_bits[part_id] != 0 {
            return rice::decode_signbit(self.remainders[t]);
        }
        let quotient = self.quotients[t];
        let shift = u32::from(self.rice_params[part_id]);
        let remainder = self.remainders[t];
        let v = (quotient << shift) + remainder;
        rice::decode_signbit(v)
    }

    /// Returns the block size of this `Residual`.
    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the warm-up length of this `Residual`.
    #[inline]
    pub(crate) fn warmup_length(&self) -> usize {
        self.warmup_length
    }

    #[inline]
    pub(crate) fn sum_quotients(&self) -> usize {
        self.sum_quotients
    }

    #[inline]
    pub(crate) fn sum_rice_params(&self) -> usize {
        self.sum_rice_params
    }

    #[inline]
    pub(crate) fn rice_params(&self) -> &[u8] {
        &self.rice_params
    }

    #[inline]
    pub(crate) fn escape_bits(&self) -> &[u8] {
        &self.escape_bits
    }

    #[inline]
    pub(crate) fn quotients(&self) -> &[u32] {
        &self.quotients
    }

    #[inline]
    pub(crate) fn remainders(&self) -> &[u32] {
        &self.remainders
    }
}
