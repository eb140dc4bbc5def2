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

//! The streaming decoder.
//!
//! [`StreamDecoder`] is a state machine driven by the caller:
//! [`process_metadata`], [`process_one_frame`] and [`process_until_end`]
//! pull bytes on demand from a [`ByteSource`] and push decoded blocks
//! out through a [`FrameSink`]. Recoverable bitstream damage is reported
//! through the sink and decoding resumes at the next frame sync code.
//!
//! [`process_metadata`]: StreamDecoder::process_metadata
//! [`process_one_frame`]: StreamDecoder::process_one_frame
//! [`process_until_end`]: StreamDecoder::process_until_end

use std::io;

use crate::component::decorrelate_channels;
use crate::component::parser;
use crate::component::Decode;
use crate::component::FrameHeader;
use crate::component::MetadataBlock;
use crate::component::MetadataBlockData;
use crate::component::SeekTable;
use crate::component::StreamInfo;
use crate::component::SubFrame;
use crate::component::FRAME_CRC;
use crate::constant::panic_msg;
use crate::constant::MAX_CHANNELS;
use crate::constant::STREAM_SYNC;
use crate::error::DecodeError;
use crate::error::FormatError;
use crate::error::SourceError;
use crate::error::StreamError;

/// Result of one pull from a [`ByteSource`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadStatus {
    /// This many bytes were placed at the head of the buffer.
    Ready(usize),
    /// No more bytes will ever be available.
    EndOfStream,
    /// The producer wants decoding to stop at the next byte boundary.
    Abort,
}

/// Pull-based byte producer feeding the decoder.
pub trait ByteSource {
    /// Reads at most `dest.len()` bytes into `dest`.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] on I/O failure, which aborts decoding.
    fn read(&mut self, dest: &mut [u8]) -> Result<ReadStatus, SourceError>;
}

/// Adapter making any [`io::Read`] usable as a [`ByteSource`].
pub struct IoSource<R> {
    inner: R,
}

impl<R> IoSource<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: io::Read> ByteSource for IoSource<R> {
    fn read(&mut self, dest: &mut [u8]) -> Result<ReadStatus, SourceError> {
        match self.inner.read(dest) {
            Ok(0) => Ok(ReadStatus::EndOfStream),
            Ok(n) => Ok(ReadStatus::Ready(n)),
            Err(e) => Err(SourceError::from_io_error(e)),
        }
    }
}

/// Response from a sink callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SinkResponse {
    /// Keep decoding.
    Continue,
    /// Halt; the decoder enters the aborted state.
    Abort,
}

/// Receiver of decoder output.
///
/// All callbacks run synchronously inside the decoder's processing
/// functions. Blocks arrive in ascending sample order; the metadata
/// callbacks always precede the first audio callback. The channel
/// slices passed to [`FrameSink::frame`] are valid only for the
/// duration of the call.
pub trait FrameSink {
    /// Called once per metadata block.
    fn metadata(&mut self, _block: &MetadataBlock) {}

    /// Called once per decoded frame with one slice per channel.
    fn frame(&mut self, header: &FrameHeader, channels: &[&[i32]]) -> SinkResponse;

    /// Called on recoverable bitstream damage; may fire several times.
    fn error(&mut self, _err: StreamError) {}
}

/// Sink that concatenates all decoded samples per channel.
#[derive(Clone, Debug, Default)]
pub struct CollectSink {
    /// Decoded samples, one `Vec` per channel.
    pub channels: Vec<Vec<i32>>,
    /// All recoverable errors reported during decoding.
    pub errors: Vec<StreamError>,
    /// The number of metadata blocks seen.
    pub metadata_blocks: usize,
}

impl FrameSink for CollectSink {
    fn metadata(&mut self, _block: &MetadataBlock) {
        self.metadata_blocks += 1;
    }

    fn frame(&mut self, _header: &FrameHeader, channels: &[&[i32]]) -> SinkResponse {
        if self.channels.is_empty() {
            self.channels = vec![vec![]; channels.len()];
        }
        for (ch, s) in channels.iter().enumerate() {
            self.channels[ch].extend_from_slice(s);
        }
        SinkResponse::Continue
    }

    fn error(&mut self, err: StreamError) {
        self.errors.push(err);
    }
}

/// State of the decoding state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecoderState {
    /// Scanning for the stream magic (skipping ID3 tags).
    SearchForMetadata,
    /// Reading metadata blocks up to the last-block flag.
    ReadMetadata,
    /// Scanning for the 14-bit frame sync code.
    SearchForFrameSync,
    /// Reading one frame.
    ReadFrame,
    /// All samples have been decoded.
    EndOfStream,
    /// A callback aborted; only a reset leaves this state.
    Aborted,
}

/// How many bytes each refill asks the source for.
const REFILL_CHUNK: usize = 8192;

enum ParseAttempt<T> {
    Done(usize, T),
    NeedMore,
    Failed,
}

enum FrameOutcome {
    Delivered,
    Resync,
    End,
}

/// The streaming decoder.
pub struct StreamDecoder<S: ByteSource> {
    source: S,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    source_eof: bool,
    bytes_read: u64,

    state: DecoderState,
    stream_info: Option<StreamInfo>,
    seek_table: Option<SeekTable>,
    first_frame_offset: u64,

    channel_bufs: Vec<Vec<i32>>,
    last_frame: Option<FrameHeader>,
    samples_decoded: u64,

    md5: md5::Context,
    md5_bytes: Vec<u8>,
    md5_checking: bool,
}

impl<S: ByteSource> StreamDecoder<S> {
    /// Constructs a decoder pulling from `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            buf: vec![],
            pos: 0,
            filled: 0,
            source_eof: false,
            bytes_read: 0,
            state: DecoderState::SearchForMetadata,
            stream_info: None,
            seek_table: None,
            first_frame_offset: 0,
            channel_bufs: vec![],
            last_frame: None,
            samples_decoded: 0,
            md5: md5::Context::new(),
            md5_bytes: vec![],
            md5_checking: true,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Returns the STREAMINFO once metadata has been processed.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    /// Returns the seek table, when the stream carries one.
    pub fn seek_table(&self) -> Option<&SeekTable> {
        self.seek_table.as_ref()
    }

    /// Returns the header of the frame decoded last.
    pub fn last_frame_header(&self) -> Option<&FrameHeader> {
        self.last_frame.as_ref()
    }

    /// Returns the number of inter-channel samples decoded so far.
    pub fn samples_decoded(&self) -> u64 {
        self.samples_decoded
    }

    /// Returns true while MD5 accumulation is meaningful.
    pub fn md5_checking(&self) -> bool {
        self.md5_checking
    }

    /// Turns off MD5 accumulation for the remainder of the stream.
    ///
    /// Done automatically when a seek breaks the decoding order.
    pub fn disable_md5_checking(&mut self) {
        self.md5_checking = false;
    }

    /// Returns a mutable reference to the byte source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Bytes pulled from the source but not consumed yet.
    pub(crate) fn unconsumed_bytes(&self) -> usize {
        self.filled - self.pos
    }

    /// The absolute stream offset of the next byte to be consumed.
    pub(crate) fn consumed_offset(&self) -> u64 {
        self.bytes_read - self.unconsumed_bytes() as u64
    }

    /// The stream offset at which the first audio frame begins.
    pub(crate) fn first_frame_offset(&self) -> u64 {
        self.first_frame_offset
    }

    /// Drops all buffered input and continues at stream offset
    /// `offset`, which the source must have been repositioned to.
    ///
    /// Metadata knowledge is retained; the next read scans for a frame
    /// sync code.
    pub(crate) fn resync_at(&mut self, offset: u64) {
        self.pos = 0;
        self.filled = 0;
        self.source_eof = false;
        self.bytes_read = offset;
        self.state = if self.stream_info.is_some() {
            DecoderState::SearchForFrameSync
        } else {
            DecoderState::SearchForMetadata
        };
    }

    pub(crate) fn set_samples_decoded(&mut self, n: u64) {
        self.samples_decoded = n;
    }

    /// Resets the decoder to its initial state.
    ///
    /// The source must be repositioned to the start of the stream by
    /// the caller; buffered bytes and metadata knowledge are dropped.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.filled = 0;
        self.source_eof = false;
        self.bytes_read = 0;
        self.state = DecoderState::SearchForMetadata;
        self.stream_info = None;
        self.seek_table = None;
        self.first_frame_offset = 0;
        self.last_frame = None;
        self.samples_decoded = 0;
        self.md5 = md5::Context::new();
        self.md5_checking = true;
    }

    /// Verifies the accumulated MD5 against STREAMINFO.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Md5Mismatch`] when checking is enabled,
    /// the stream stores a digest, and the decoded samples hash
    /// differently.
    pub fn finish(self) -> Result<(), DecodeError> {
        if !self.md5_checking {
            return Ok(());
        }
        let Some(info) = self.stream_info else {
            return Ok(());
        };
        if info.md5_digest() == &[0u8; 16] {
            return Ok(());
        }
        let digest: [u8; 16] = self.md5.compute().into();
        if &digest == info.md5_digest() {
            Ok(())
        } else {
            Err(DecodeError::Md5Mismatch)
        }
    }

    fn avail(&self) -> usize {
        self.filled - self.pos
    }

    /// Pulls more bytes from the source, compacting the buffer first.
    ///
    /// Returns the number of new bytes, 0 at the end of the source.
    fn refill(&mut self) -> Result<usize, DecodeError> {
        if self.source_eof {
            return Ok(0);
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        if self.buf.len() < self.filled + REFILL_CHUNK {
            self.buf.resize(self.filled + REFILL_CHUNK, 0u8);
        }
        match self.source.read(&mut self.buf[self.filled..])? {
            ReadStatus::Ready(0) | ReadStatus::EndOfStream => {
                self.source_eof = true;
                Ok(0)
            }
            ReadStatus::Ready(n) => {
                let n = n.min(self.buf.len() - self.filled);
                self.filled += n;
                self.bytes_read += n as u64;
                Ok(n)
            }
            ReadStatus::Abort => {
                self.state = DecoderState::Aborted;
                Err(DecodeError::Aborted)
            }
        }
    }

    /// Ensures `n` unconsumed bytes are buffered; false at end of data.
    fn ensure(&mut self, n: usize) -> Result<bool, DecodeError> {
        while self.avail() < n {
            if self.refill()? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Consumes `n` bytes, refilling across the gap as needed.
    fn skip_bytes(&mut self, n: u64) -> Result<bool, DecodeError> {
        let mut rest = n;
        while rest > 0 {
            if self.avail() == 0 && self.refill()? == 0 {
                return Ok(false);
            }
            let take = (self.avail() as u64).min(rest) as usize;
            self.pos += take;
            rest -= take as u64;
        }
        Ok(true)
    }

    /// Processes all metadata blocks up to the last-block flag.
    ///
    /// A no-op when metadata has already been processed.
    ///
    /// # Errors
    ///
    /// Fatal errors only; see [`DecodeError`].
    pub fn process_metadata<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        if self.state == DecoderState::SearchForMetadata {
            self.search_metadata(sink)?;
        }
        if self.state == DecoderState::ReadMetadata {
            self.read_metadata(sink)?;
        }
        Ok(())
    }

    /// Scans for the stream magic, skipping ID3v2 tags.
    fn search_metadata<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        let mut reported = false;
        loop {
            if !self.ensure(4)? {
                return Err(FormatError::new(
                    self.consumed_offset(),
                    "stream magic not found",
                )
                .into());
            }
            let window = &self.buf[self.pos..self.pos + 4];
            if window == &STREAM_SYNC[..] {
                self.pos += 4;
                self.state = DecoderState::ReadMetadata;
                return Ok(());
            }
            if &window[..3] == b"ID3" {
                // 10-byte ID3v2 header with a 7-bit-per-byte size.
                if !self.ensure(10)? {
                    return Err(FormatError::new(
                        self.consumed_offset(),
                        "truncated ID3 tag before stream magic",
                    )
                    .into());
                }
                let size_bytes = &self.buf[self.pos + 6..self.pos + 10];
                let mut size = 0u64;
                for b in size_bytes {
                    size = (size << 7) | u64::from(b & 0x7F);
                }
                self.pos += 10;
                log::debug!("skipping {size}-byte ID3 tag before the stream magic");
                if !self.skip_bytes(size)? {
                    return Err(FormatError::new(
                        self.consumed_offset(),
                        "truncated ID3 tag before stream magic",
                    )
                    .into());
                }
                continue;
            }
            if !reported {
                sink.error(StreamError::LostSync);
                reported = true;
            }
            self.pos += 1;
        }
    }

    /// Reads metadata blocks until the last-block flag is seen.
    fn read_metadata<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        let mut first = true;
        loop {
            if !self.ensure(4)? {
                return Err(DecodeError::StreamEnded);
            }
            let header_byte = self.buf[self.pos];
            let is_last = header_byte & 0x80 != 0;
            let block_type = header_byte & 0x7F;
            let length = (usize::from(self.buf[self.pos + 1]) << 16)
                | (usize::from(self.buf[self.pos + 2]) << 8)
                | usize::from(self.buf[self.pos + 3]);
            if first && block_type != 0 {
                return Err(FormatError::new(
                    self.consumed_offset(),
                    "first metadata block must be STREAMINFO",
                )
                .into());
            }
            if !self.ensure(4 + length)? {
                return Err(DecodeError::StreamEnded);
            }
            let span = &self.buf[self.pos..self.pos + 4 + length];
            let block = match parser::metadata_block::<(&[u8], nom::error::ErrorKind)>(span) {
                Ok((_rest, block)) => block,
                Err(_) => {
                    return Err(FormatError::new(
                        self.consumed_offset(),
                        "unparseable metadata block",
                    )
                    .into());
                }
            };
            match block.data() {
                MetadataBlockData::StreamInfo(info) => {
                    self.stream_info = Some(info.clone());
                    self.channel_bufs = vec![vec![]; info.channels()];
                }
                MetadataBlockData::SeekTable(table) => {
                    self.seek_table = Some(table.clone());
                }
                _ => {}
            }
            sink.metadata(&block);
            self.pos += 4 + length;
            first = false;
            if is_last {
                if self.stream_info.is_none() {
                    return Err(FormatError::new(
                        self.consumed_offset(),
                        "metadata without STREAMINFO",
                    )
                    .into());
                }
                self.first_frame_offset = self.consumed_offset();
                self.state = DecoderState::SearchForFrameSync;
                return Ok(());
            }
        }
    }

    /// Scans for the next frame sync code.
    ///
    /// Returns false when the input ends before another frame starts.
    fn find_frame_sync<F: FrameSink>(&mut self, sink: &mut F) -> Result<bool, DecodeError> {
        let mut skipped = false;
        loop {
            if !self.ensure(2)? {
                if self.avail() > 0 {
                    skipped = true;
                    self.pos = self.filled;
                }
                if skipped {
                    log::debug!("lost sync at the end of the stream");
                    sink.error(StreamError::LostSync);
                }
                return Ok(false);
            }
            if self.buf[self.pos] == 0xFF && self.buf[self.pos + 1] & 0xFC == 0xF8 {
                if skipped {
                    log::debug!(
                        "lost sync; resuming at stream offset {}",
                        self.consumed_offset()
                    );
                    sink.error(StreamError::LostSync);
                }
                return Ok(true);
            }
            self.pos += 1;
            skipped = true;
        }
    }

    fn try_parse_header(&self) -> ParseAttempt<FrameHeader> {
        let input = &self.buf[self.pos..self.filled];
        match parser::frame_header::<(&[u8], nom::error::ErrorKind)>(true)(input) {
            Ok((rest, header)) => ParseAttempt::Done(input.len() - rest.len(), header),
            Err(nom::Err::Incomplete(_)) => ParseAttempt::NeedMore,
            Err(_) => ParseAttempt::Failed,
        }
    }

    fn try_parse_body(
        &self,
        header_len: usize,
        block_size: usize,
        bits_per_sample: usize,
        header: &FrameHeader,
    ) -> ParseAttempt<Vec<SubFrame>> {
        let input = &self.buf[self.pos + header_len..self.filled];
        match parser::frame_body::<(&[u8], nom::error::ErrorKind)>(
            block_size,
            bits_per_sample,
            header.channel_assignment().clone(),
        )(input)
        {
            Ok((rest, subframes)) => ParseAttempt::Done(input.len() - rest.len(), subframes),
            Err(nom::Err::Incomplete(_)) => ParseAttempt::NeedMore,
            Err(_) => ParseAttempt::Failed,
        }
    }

    /// Reads, validates and delivers the frame at the current sync.
    fn read_one_frame<F: FrameSink>(
        &mut self,
        info: &StreamInfo,
        sink: &mut F,
    ) -> Result<FrameOutcome, DecodeError> {
        // frame header, CRC-8 protected.
        let (header_len, header) = loop {
            match self.try_parse_header() {
                ParseAttempt::Done(len, header) => break (len, header),
                ParseAttempt::NeedMore => {
                    if self.refill()? == 0 {
                        // ends inside a header; likely trailing garbage.
                        self.pos = self.filled;
                        sink.error(StreamError::LostSync);
                        return Ok(FrameOutcome::End);
                    }
                }
                ParseAttempt::Failed => {
                    log::debug!("bad frame header at offset {}", self.consumed_offset());
                    sink.error(StreamError::BadHeader);
                    self.pos += 1;
                    return Ok(FrameOutcome::Resync);
                }
            }
        };

        let channels = header.channel_assignment().channels();
        let block_size = header.block_size();
        let bits_per_sample = header.bits_per_sample().unwrap_or(info.bits_per_sample());
        if channels != info.channels() || bits_per_sample != info.bits_per_sample() {
            sink.error(StreamError::BadHeader);
            self.pos += 1;
            return Ok(FrameOutcome::Resync);
        }

        // subframes, zero padding included.
        let (body_len, subframes) = loop {
            match self.try_parse_body(header_len, block_size, bits_per_sample, &header) {
                ParseAttempt::Done(len, subframes) => break (len, subframes),
                ParseAttempt::NeedMore => {
                    if self.refill()? == 0 {
                        return Err(DecodeError::StreamEnded);
                    }
                }
                ParseAttempt::Failed => {
                    log::debug!("unparseable subframe at offset {}", self.consumed_offset());
                    sink.error(StreamError::LostSync);
                    self.pos += 1;
                    return Ok(FrameOutcome::Resync);
                }
            }
        };

        // CRC-16 footer over everything above.
        let frame_len = header_len + body_len;
        if !self.ensure(frame_len + 2)? {
            return Err(DecodeError::StreamEnded);
        }
        let expected_crc = FRAME_CRC.checksum(&self.buf[self.pos..self.pos + frame_len]);
        let stored_crc = u16::from_be_bytes([
            self.buf[self.pos + frame_len],
            self.buf[self.pos + frame_len + 1],
        ]);
        let crc_ok = expected_crc == stored_crc;

        for (ch, subframe) in subframes.iter().enumerate() {
            let buf = &mut self.channel_bufs[ch];
            buf.clear();
            buf.resize(block_size, 0i32);
            if crc_ok {
                subframe.copy_signal(buf);
            }
        }
        if crc_ok {
            decorrelate_channels(
                header.channel_assignment(),
                &mut self.channel_bufs,
                block_size,
            );
        } else {
            log::warn!(
                "frame CRC-16 mismatch at offset {} (expected {expected_crc:04x}, stored {stored_crc:04x})",
                self.consumed_offset()
            );
            sink.error(StreamError::FrameCrcMismatch);
        }
        self.pos += frame_len + 2;

        if self.md5_checking {
            self.update_md5(block_size, info);
        }
        self.samples_decoded += block_size as u64;

        let mut refs: heapless::Vec<&[i32], MAX_CHANNELS> = heapless::Vec::new();
        for buf in &self.channel_bufs[..channels] {
            refs.push(&buf[..block_size])
                .expect(panic_msg::DATA_INCONSISTENT);
        }
        let response = sink.frame(&header, &refs);
        self.last_frame = Some(header);
        if response == SinkResponse::Abort {
            self.state = DecoderState::Aborted;
            return Err(DecodeError::Aborted);
        }
        Ok(FrameOutcome::Delivered)
    }

    /// Accumulates the decoded block into the MD5 digest.
    fn update_md5(&mut self, block_size: usize, info: &StreamInfo) {
        let bytes_per_sample = (info.bits_per_sample() + 7) / 8;
        self.md5_bytes.clear();
        self.md5_bytes
            .reserve(block_size * info.channels() * bytes_per_sample);
        for t in 0..block_size {
            for buf in &self.channel_bufs[..info.channels()] {
                self.md5_bytes
                    .extend_from_slice(&buf[t].to_le_bytes()[..bytes_per_sample]);
            }
        }
        self.md5.consume(&self.md5_bytes);
    }

    /// Decodes and delivers the next frame.
    ///
    /// Processes metadata first if that has not happened yet. Returns
    /// `Ok(false)` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Fatal errors only; recoverable damage is reported through
    /// `sink.error` and decoding continues.
    pub fn process_one_frame<F: FrameSink>(&mut self, sink: &mut F) -> Result<bool, DecodeError> {
        match self.state {
            DecoderState::SearchForMetadata | DecoderState::ReadMetadata => {
                self.process_metadata(sink)?;
            }
            DecoderState::EndOfStream => return Ok(false),
            DecoderState::Aborted => return Err(DecodeError::Aborted),
            DecoderState::SearchForFrameSync | DecoderState::ReadFrame => {}
        }
        let info = self
            .stream_info
            .clone()
            .expect(panic_msg::STREAM_INFO_MISSING);
        let total = info.total_samples();

        loop {
            // with a known length, trailing garbage is not resynced on.
            if total > 0 && self.samples_decoded >= total {
                self.state = DecoderState::EndOfStream;
                return Ok(false);
            }
            if !self.find_frame_sync(sink)? {
                self.state = DecoderState::EndOfStream;
                return Ok(false);
            }
            self.state = DecoderState::ReadFrame;
            match self.read_one_frame(&info, sink)? {
                FrameOutcome::Delivered => {
                    self.state = DecoderState::SearchForFrameSync;
                    return Ok(true);
                }
                FrameOutcome::Resync => {
                    self.state = DecoderState::SearchForFrameSync;
                }
                FrameOutcome::End => {
                    self.state = DecoderState::EndOfStream;
                    return Ok(false);
                }
            }
        }
    }

    /// Decodes every remaining frame in the stream.
    ///
    /// # Errors
    ///
    /// Fatal errors only; see [`process_one_frame`].
    ///
    /// [`process_one_frame`]: StreamDecoder::process_one_frame
    pub fn process_until_end<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        while self.process_one_frame(sink)? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitsink::MemSink;
    use crate::coding::encode_with_fixed_block_size;
    use crate::component::BitRepr;
    use crate::config;
    use crate::seek::MemBytes;
    use crate::sigen;
    use crate::sigen::Signal;
    use crate::source::MemSource;

    fn encode_to_bytes(signal: &[i32], channels: usize, bps: usize, rate: usize, bs: usize) -> Vec<u8> {
        let source = MemSource::from_samples(signal, channels, bps, rate);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, bs)
            .expect("encode failed");
        let mut sink = MemSink::new();
        stream.write(&mut sink).expect("serialize failed");
        sink.into_inner()
    }

    fn deinterleave(signal: &[i32], channels: usize) -> Vec<Vec<i32>> {
        let mut ret = vec![vec![]; channels];
        for (t, x) in signal.iter().enumerate() {
            ret[t % channels].push(*x);
        }
        ret
    }

    #[test]
    fn decodes_encoded_stream_bit_exactly() {
        let channels = 2;
        let signal = sigen::Sine::new(300, 0.5)
            .noise(0.1)
            .to_vec_quantized(16, 9000 * channels);
        let bytes = encode_to_bytes(&signal, channels, 16, 44100, 4096);

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = CollectSink::default();
        decoder.process_until_end(&mut sink).expect("decode failed");

        assert_eq!(sink.metadata_blocks, 1);
        assert!(sink.errors.is_empty());
        assert_eq!(sink.channels, deinterleave(&signal, channels));
        assert_eq!(decoder.samples_decoded(), 9000);
        decoder.finish().expect("MD5 must match");
    }

    #[test]
    fn decodes_wide_and_multichannel_streams() {
        for channels in [1usize, 3, 8] {
            let signal = sigen::Sine::new(100, 0.3)
                .noise(0.2)
                .to_vec_quantized(24, 2000 * channels);
            let bytes = encode_to_bytes(&signal, channels, 24, 96000, 512);

            let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
            let mut sink = CollectSink::default();
            decoder.process_until_end(&mut sink).expect("decode failed");
            assert_eq!(sink.channels, deinterleave(&signal, channels));
            decoder.finish().expect("MD5 must match");
        }
    }

    #[test]
    fn process_one_frame_steps_through_stream() {
        let signal = sigen::Noise::new(0.3).to_vec_quantized(16, 3 * 1024);
        let bytes = encode_to_bytes(&signal, 1, 16, 32000, 1024);

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = CollectSink::default();
        decoder.process_metadata(&mut sink).expect("metadata failed");
        assert_eq!(decoder.state(), DecoderState::SearchForFrameSync);
        assert_eq!(
            decoder.stream_info().map(|i| i.total_samples()),
            Some(3 * 1024)
        );

        let mut frames = 0;
        while decoder.process_one_frame(&mut sink).expect("decode failed") {
            frames += 1;
        }
        assert_eq!(frames, 3);
        assert_eq!(decoder.state(), DecoderState::EndOfStream);
    }

    #[test]
    fn skips_id3_tag_and_garbage_prefix() {
        let signal = sigen::Sine::new(64, 0.4).to_vec_quantized(16, 1024);
        let bytes = encode_to_bytes(&signal, 1, 16, 44100, 1024);

        // ID3v2 header: "ID3", version, flags, 7-bit syncsafe size.
        let mut tagged = b"ID3\x04\x00\x00\x00\x00\x00\x14".to_vec();
        tagged.extend_from_slice(&[0xAAu8; 0x14]);
        tagged.extend_from_slice(&bytes);

        let mut decoder = StreamDecoder::new(MemBytes::new(tagged));
        let mut sink = CollectSink::default();
        decoder.process_until_end(&mut sink).expect("decode failed");
        assert!(sink.errors.is_empty());
        assert_eq!(sink.channels[0], signal);

        // non-tag garbage costs one LostSync but still recovers.
        let mut garbage = vec![0x42u8; 9];
        garbage.extend_from_slice(&bytes);
        let mut decoder = StreamDecoder::new(MemBytes::new(garbage));
        let mut sink = CollectSink::default();
        decoder.process_until_end(&mut sink).expect("decode failed");
        assert_eq!(sink.errors, vec![StreamError::LostSync]);
        assert_eq!(sink.channels[0], signal);
    }

    #[test]
    fn corrupt_frame_is_reported_and_rest_survives() {
        let block_size = 1024usize;
        let signal = sigen::Sine::new(120, 0.5)
            .noise(0.05)
            .to_vec_quantized(16, 4 * block_size);
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, block_size)
            .expect("encode failed");

        // locate the second frame in the byte image.
        let metadata_bytes = (32 + 32 + 272) / 8;
        let frame0_bytes = stream.frame(0).unwrap().count_bits() / 8;
        let frame1_bytes = stream.frame(1).unwrap().count_bits() / 8;
        let mut bytes = MemSink::new();
        stream.write(&mut bytes).expect("serialize failed");
        let mut bytes = bytes.into_inner();

        // zero eight bytes deep inside the second frame's residual.
        let target = metadata_bytes + frame0_bytes + frame1_bytes / 2;
        for b in &mut bytes[target..target + 8] {
            *b = 0;
        }

        struct FrameLog {
            blocks: Vec<(u64, Vec<i32>)>,
            errors: Vec<StreamError>,
        }
        impl FrameSink for FrameLog {
            fn frame(&mut self, header: &FrameHeader, channels: &[&[i32]]) -> SinkResponse {
                self.blocks
                    .push((header.start_sample(1024), channels[0].to_vec()));
                SinkResponse::Continue
            }
            fn error(&mut self, err: StreamError) {
                self.errors.push(err);
            }
        }

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = FrameLog {
            blocks: vec![],
            errors: vec![],
        };
        decoder.process_until_end(&mut sink).expect("decode failed");

        assert!(!sink.errors.is_empty(), "damage must be reported");
        let crc_mismatches = sink
            .errors
            .iter()
            .filter(|e| **e == StreamError::FrameCrcMismatch)
            .count();
        assert!(crc_mismatches <= 1, "only one frame was damaged");
        // the first and the last frame must come through bit-exactly.
        let first = sink.blocks.iter().find(|(s, _)| *s == 0).expect("frame 0");
        assert_eq!(first.1, signal[..block_size]);
        let last = sink
            .blocks
            .iter()
            .find(|(s, _)| *s == 3 * block_size as u64)
            .expect("frame 3");
        assert_eq!(last.1, signal[3 * block_size..]);
        // the damaged frame either failed its CRC (delivered zeroed) or
        // was dropped after a lost sync.
        if let Some(second) = sink.blocks.iter().find(|(s, _)| *s == 1024) {
            assert!(second.1.iter().all(|&x| x == 0));
        } else {
            assert!(sink.errors.contains(&StreamError::LostSync));
        }
    }

    #[test]
    fn truncated_stream_surfaces_as_error() {
        let signal = sigen::Noise::new(0.4).to_vec_quantized(16, 4096);
        let bytes = encode_to_bytes(&signal, 1, 16, 44100, 4096);
        let cut = bytes.len() / 2;

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes[..cut].to_vec()));
        let mut sink = CollectSink::default();
        let err = decoder
            .process_until_end(&mut sink)
            .expect_err("truncated stream must fail");
        assert!(err.is_stream_ended());
    }

    #[test]
    fn trailing_garbage_after_known_length_is_ignored() {
        let signal = sigen::Sine::new(77, 0.3).to_vec_quantized(16, 2048);
        let mut bytes = encode_to_bytes(&signal, 1, 16, 44100, 1024);
        bytes.extend_from_slice(&[0xFF; 64]);

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = CollectSink::default();
        decoder.process_until_end(&mut sink).expect("decode failed");
        assert!(sink.errors.is_empty());
        assert_eq!(sink.channels[0], signal);
        assert_eq!(decoder.state(), DecoderState::EndOfStream);
        decoder.finish().expect("MD5 must match");
    }

    #[test]
    fn aborting_sink_halts_decoding() {
        struct AbortAfterOne {
            seen: usize,
        }
        impl FrameSink for AbortAfterOne {
            fn frame(&mut self, _header: &FrameHeader, _channels: &[&[i32]]) -> SinkResponse {
                self.seen += 1;
                SinkResponse::Abort
            }
        }

        let signal = sigen::Noise::new(0.2).to_vec_quantized(16, 4 * 256);
        let bytes = encode_to_bytes(&signal, 1, 16, 8000, 256);
        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = AbortAfterOne { seen: 0 };
        let err = decoder
            .process_until_end(&mut sink)
            .expect_err("abort must surface");
        assert!(matches!(err, DecodeError::Aborted));
        assert_eq!(sink.seen, 1);
        assert_eq!(decoder.state(), DecoderState::Aborted);
    }

    #[test]
    fn md5_mismatch_is_detected_on_finish() {
        let signal = sigen::Noise::new(0.5).to_vec_quantized(16, 1024);
        let mut bytes = encode_to_bytes(&signal, 1, 16, 44100, 1024);
        // tamper with the stored digest (bytes 4+4+18 .. +16 of STREAMINFO).
        let md5_offset = 4 + 4 + 18;
        bytes[md5_offset] ^= 0xFF;

        let mut decoder = StreamDecoder::new(MemBytes::new(bytes));
        let mut sink = CollectSink::default();
        decoder.process_until_end(&mut sink).expect("decode failed");
        let err = decoder.finish().expect_err("digest must mismatch");
        assert!(matches!(err, DecodeError::Md5Mismatch));
    }
}
