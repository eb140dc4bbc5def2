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

//! Random-access decoding with sample-accurate seeking.
//!
//! [`SeekableDecoder`] wraps a [`StreamDecoder`] whose byte source
//! additionally supports `seek`/`tell`/`length`. Seeking narrows the
//! byte range with the seek table when one is present, probes with
//! linearly interpolated positions, and refines from the start sample
//! of each decoded frame until the frame covering the target is found.

use std::io;

use crate::component::FrameHeader;
use crate::component::MetadataBlock;
use crate::constant::panic_msg;
use crate::constant::MAX_BLOCK_SIZE;
use crate::constant::MAX_CHANNELS;
use crate::decoder::ByteSource;
use crate::decoder::FrameSink;
use crate::decoder::IoSource;
use crate::decoder::ReadStatus;
use crate::decoder::SinkResponse;
use crate::decoder::StreamDecoder;
use crate::error::DecodeError;
use crate::error::FormatError;
use crate::error::SourceError;
use crate::error::SourceErrorReason;

/// Extension of [`ByteSource`] with random access.
pub trait RandomAccess: ByteSource {
    /// Repositions the source to an absolute byte offset.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the offset is unreachable.
    fn seek(&mut self, offset: u64) -> Result<(), SourceError>;

    /// Returns the current absolute byte offset.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] on I/O failure.
    fn tell(&mut self) -> Result<u64, SourceError>;

    /// Returns the total length of the source in bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] on I/O failure.
    fn length(&mut self) -> Result<u64, SourceError>;

    /// Returns true when the read position is at the end.
    fn is_eof(&mut self) -> bool;
}

/// In-memory random-access byte source.
#[derive(Clone, Debug, Default)]
pub struct MemBytes {
    data: Vec<u8>,
    pos: usize,
}

impl MemBytes {
    /// Wraps a byte vector.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ByteSource for MemBytes {
    fn read(&mut self, dest: &mut [u8]) -> Result<ReadStatus, SourceError> {
        if self.pos >= self.data.len() {
            return Ok(ReadStatus::EndOfStream);
        }
        let n = dest.len().min(self.data.len() - self.pos);
        dest[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(ReadStatus::Ready(n))
    }
}

impl RandomAccess for MemBytes {
    fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        if offset > self.data.len() as u64 {
            return Err(SourceError::by_reason(SourceErrorReason::Seek));
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64, SourceError> {
        Ok(self.pos as u64)
    }

    fn length(&mut self) -> Result<u64, SourceError> {
        Ok(self.data.len() as u64)
    }

    fn is_eof(&mut self) -> bool {
        self.pos >= self.data.len()
    }
}

impl<R: io::Read + io::Seek> RandomAccess for IoSource<R> {
    fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        self.inner_mut()
            .seek(io::SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(SourceError::from_io_error)
    }

    fn tell(&mut self) -> Result<u64, SourceError> {
        self.inner_mut()
            .stream_position()
            .map_err(SourceError::from_io_error)
    }

    fn length(&mut self) -> Result<u64, SourceError> {
        let here = self.tell()?;
        let end = self
            .inner_mut()
            .seek(io::SeekFrom::End(0))
            .map_err(SourceError::from_io_error)?;
        self.seek(here)?;
        Ok(end)
    }

    fn is_eof(&mut self) -> bool {
        match (self.tell(), self.length()) {
            (Ok(a), Ok(b)) => a >= b,
            _ => true,
        }
    }
}

/// Sink that keeps only the most recent frame.
#[derive(Default)]
struct CaptureSink {
    header: Option<FrameHeader>,
    channels: Vec<Vec<i32>>,
}

impl FrameSink for CaptureSink {
    fn frame(&mut self, header: &FrameHeader, channels: &[&[i32]]) -> SinkResponse {
        self.header = Some(header.clone());
        self.channels.clear();
        self.channels.extend(channels.iter().map(|s| s.to_vec()));
        SinkResponse::Continue
    }
}

/// Sink that discards everything (used while re-reading metadata).
struct NullSink;

impl FrameSink for NullSink {
    fn frame(&mut self, _header: &FrameHeader, _channels: &[&[i32]]) -> SinkResponse {
        SinkResponse::Continue
    }

    fn metadata(&mut self, _block: &MetadataBlock) {}
}

/// A [`StreamDecoder`] over a random-access source, with seeking.
pub struct SeekableDecoder<S: RandomAccess> {
    inner: StreamDecoder<S>,
}

impl<S: RandomAccess> SeekableDecoder<S> {
    /// Constructs a seekable decoder over `source`.
    pub fn new(source: S) -> Self {
        Self {
            inner: StreamDecoder::new(source),
        }
    }

    /// Returns a reference to the wrapped [`StreamDecoder`].
    pub fn decoder(&self) -> &StreamDecoder<S> {
        &self.inner
    }

    /// Returns a mutable reference to the wrapped [`StreamDecoder`].
    pub fn decoder_mut(&mut self) -> &mut StreamDecoder<S> {
        &mut self.inner
    }

    /// Unwraps the inner decoder.
    pub fn into_inner(self) -> StreamDecoder<S> {
        self.inner
    }

    /// See [`StreamDecoder::process_metadata`].
    ///
    /// # Errors
    ///
    /// Fatal errors only; see [`DecodeError`].
    pub fn process_metadata<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        self.inner.process_metadata(sink)
    }

    /// See [`StreamDecoder::process_one_frame`].
    ///
    /// # Errors
    ///
    /// Fatal errors only; see [`DecodeError`].
    pub fn process_one_frame<F: FrameSink>(&mut self, sink: &mut F) -> Result<bool, DecodeError> {
        self.inner.process_one_frame(sink)
    }

    /// See [`StreamDecoder::process_until_end`].
    ///
    /// # Errors
    ///
    /// Fatal errors only; see [`DecodeError`].
    pub fn process_until_end<F: FrameSink>(&mut self, sink: &mut F) -> Result<(), DecodeError> {
        self.inner.process_until_end(sink)
    }

    /// Seeks so that the next delivered sample is exactly
    /// `target_sample`.
    ///
    /// The frame covering the target is decoded and delivered through
    /// `sink`, trimmed to start at `target_sample`; subsequent calls to
    /// [`process_one_frame`] continue from the following frame. MD5
    /// checking is disabled for the remainder of the stream since the
    /// decoding order no longer matches the digest.
    ///
    /// [`process_one_frame`]: Self::process_one_frame
    ///
    /// # Errors
    ///
    /// Returns an error when the target is out of range, the source
    /// cannot seek, or the stream around the probe positions cannot be
    /// decoded at all.
    pub fn seek_absolute<F: FrameSink>(
        &mut self,
        target_sample: u64,
        sink: &mut F,
    ) -> Result<(), DecodeError> {
        // Make sure STREAMINFO is known, then restart from byte 0 so
        // the state machine is in a well-defined position.
        if self.inner.stream_info().is_none() {
            self.inner.process_metadata(&mut NullSink)?;
        }
        let info = self
            .inner
            .stream_info()
            .cloned()
            .expect(panic_msg::STREAM_INFO_MISSING);
        let total_samples = info.total_samples();
        if total_samples > 0 && target_sample >= total_samples {
            return Err(FormatError::new(
                0,
                "seek target is past the end of the stream",
            )
            .into());
        }

        self.inner.source_mut().seek(0)?;
        self.inner.reset();
        self.inner.process_metadata(&mut NullSink)?;
        self.inner.disable_md5_checking();

        let first_frame_offset = self.inner.first_frame_offset();
        let stream_length = self.inner.source_mut().length()?;
        let channels = info.channels() as u64;
        let bps = info.bits_per_sample() as u64;

        let mut approx_bytes_per_frame: u64 = if info.max_frame_size() > 0 {
            info.max_frame_size() as u64
        } else if info.is_fixed_blocking() {
            info.min_block_size() as u64 * channels * bps / 8 + 64
        } else {
            4096 * channels * bps / 8 + 64
        };

        let mut lower_bound: u64 = first_frame_offset;
        // never probe into the region where the final frame (plus a
        // possible 128-byte trailing tag and indexing slack) must fit.
        let headroom: u64 = if info.max_frame_size() > 0 {
            info.max_frame_size() as u64 + 130
        } else {
            channels * bps * MAX_BLOCK_SIZE as u64 / 8 + 130
        };
        let mut upper_bound: u64 = stream_length.saturating_sub(headroom).max(lower_bound + 1);

        // Narrow both bounds with the seek table when one is present.
        let mut lower_point: Option<(u64, u16)> = None;
        let mut upper_point_sample: Option<u64> = None;
        if let Some(table) = self.inner.seek_table().cloned() {
            for p in table.points().iter().rev() {
                if !p.is_placeholder() && p.sample_number <= target_sample {
                    lower_bound = first_frame_offset + p.stream_offset;
                    lower_point = Some((p.sample_number, p.frame_samples));
                    break;
                }
            }
            for p in table.points() {
                if !p.is_placeholder() && p.sample_number > target_sample {
                    upper_bound = first_frame_offset + p.stream_offset;
                    upper_point_sample = Some(p.sample_number);
                    break;
                }
            }
            upper_bound = upper_bound.max(lower_bound + 1);
        }

        // First probe: interpolate between the bracketing seek points,
        // or against the STREAMINFO totals when there are none.
        let mut pos: i64 = -1;
        if let Some((point_sample, point_frame_samples)) = lower_point {
            if target_sample < point_sample + u64::from(point_frame_samples) * 4 {
                pos = lower_bound as i64;
            } else if let Some(upper_sample) = upper_point_sample {
                let range_samples = (upper_sample - point_sample) as f64;
                let target_offset = (target_sample - point_sample) as f64;
                let range_bytes = (upper_bound - lower_bound).saturating_sub(1) as f64;
                pos = lower_bound as i64 + (target_offset / range_samples * range_bytes) as i64
                    - approx_bytes_per_frame as i64;
            }
        }
        if pos < 0 {
            if total_samples > 0 {
                let fraction = target_sample as f64 / total_samples as f64;
                let span = (stream_length - first_frame_offset).saturating_sub(1) as f64;
                pos = first_frame_offset as i64 + (fraction * span) as i64
                    - approx_bytes_per_frame as i64;
            } else {
                pos = lower_bound as i64;
            }
        }
        pos = pos.clamp(lower_bound as i64, upper_bound as i64 - 1);

        let mut last_frame_sample: Option<u64> = None;
        let mut last_pos: i64 = pos;
        let mut needs_seek = true;
        // Forward walking visits at most every frame once; probing
        // converges long before that.
        let max_iterations =
            64 + (total_samples / info.min_block_size().max(1) as u64) as usize;

        for _iteration in 0..max_iterations {
            if needs_seek {
                log::trace!("seek probe at byte {pos} for sample {target_sample}");
                self.inner.source_mut().seek(pos as u64)?;
                self.inner.resync_at(pos as u64);
            }

            // keep the total-samples bookkeeping out of the way while
            // probing; it is restored when the target frame is found.
            self.inner.set_samples_decoded(0);
            let mut capture = CaptureSink::default();
            let delivered = self.inner.process_one_frame(&mut capture)?;
            let Some(header) = capture.header else {
                if !delivered && pos > lower_bound as i64 {
                    // ran off the end of the stream; step backwards.
                    last_pos = pos;
                    pos = (pos - approx_bytes_per_frame as i64).max(lower_bound as i64);
                    needs_seek = true;
                    continue;
                }
                return Err(FormatError::new(
                    pos as u64,
                    "no decodable frame around the seek target",
                )
                .into());
            };

            let this_block = header.block_size() as u64;
            let this_sample = header.start_sample(info.max_block_size());

            if target_sample >= this_sample && target_sample < this_sample + this_block {
                let skip = (target_sample - this_sample) as usize;
                let mut refs: heapless::Vec<&[i32], MAX_CHANNELS> = heapless::Vec::new();
                for ch in &capture.channels {
                    refs.push(&ch[skip..]).expect(panic_msg::DATA_INCONSISTENT);
                }
                self.inner.set_samples_decoded(this_sample + this_block);
                if sink.frame(&header, &refs) == SinkResponse::Abort {
                    return Err(DecodeError::Aborted);
                }
                return Ok(());
            }

            if last_frame_sample == Some(this_sample) {
                // the last backward move was not big enough; double it.
                let step = last_pos - pos;
                pos -= step;
                needs_seek = true;
            } else if target_sample < this_sample {
                last_pos = pos;
                approx_bytes_per_frame = this_block * channels * bps / 8 + 64;
                pos -= approx_bytes_per_frame as i64;
                needs_seek = true;
            } else {
                // the target lies beyond this frame; continue forward
                // from the decoder's current position without seeking.
                last_pos = pos;
                pos = self.inner.consumed_offset() as i64;
                needs_seek = false;
            }
            pos = pos.clamp(lower_bound as i64, upper_bound as i64 - 1);
            last_frame_sample = Some(this_sample);
        }
        Err(FormatError::new(pos as u64, "seek did not converge").into())
    }
}
