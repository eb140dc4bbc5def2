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

//! Module for input source handling.

use seq_macro::seq;

use super::error::SourceError;
use super::error::SourceErrorReason;

// The deinterleaver is often on the critical path of ingestion. Hoping
// that the optimizer can vectorize it, `seq_macro` is used to define
// channel-specific implementations with unrolled loops.

#[inline]
#[allow(dead_code)]
fn deinterleave_gen(interleaved: &[i32], channels: usize, dest: &mut [i32]) {
    let samples = dest.len() / channels;
    let src_samples = interleaved.len() / channels;
    for t in 0..samples {
        for ch in 0..channels {
            dest[samples * ch + t] = if t < src_samples {
                interleaved[channels * t + ch]
            } else {
                0i32
            }
        }
    }
}

seq!(N in 2..=8 {
    #[inline]
    #[allow(dead_code)]
    #[allow(clippy::cognitive_complexity)]
    #[allow(clippy::identity_op)]
    #[allow(clippy::erasing_op)]
    fn deinterleave_ch~N(interleaved: &[i32], dest: &mut [i32]) {
        let samples = dest.len() / N;
        let src_samples = interleaved.len() / N;
        let mut t = 0;
        while t < samples {
            let t0 = t;
            seq!(UNROLL in 0..32 {
                seq!(CH in 0..N {
                    dest[samples * CH + t0 + UNROLL] = if t < src_samples {
                        interleaved[N * (t0 + UNROLL) + CH]
                    } else {
                        0i32
                    };
                });
                t += 1;
                if t >= samples {
                    break;
                }
            });
        }
    }
});

fn deinterleave_ch1(interleaved: &[i32], dest: &mut [i32]) {
    let n = std::cmp::min(dest.len(), interleaved.len());
    dest[0..n].copy_from_slice(&interleaved[0..n]);
    for p in &mut dest[n..] {
        *p = 0i32;
    }
}

/// Deinterleaves channel-interleaved samples to the channel-major order.
pub fn deinterleave(interleaved: &[i32], channels: usize, dest: &mut [i32]) {
    seq!(CH in 1..=8 {
        if channels == CH {
            return deinterleave_ch~CH(interleaved, dest);
        }
    });
    // Not reachable for any supported stream, but keep it total.
    deinterleave_gen(interleaved, channels, dest);
}

/// Reusable buffer for multi-channel framed signals.
#[derive(Clone, Debug)]
pub struct FrameBuf {
    samples: Vec<i32>,
    channels: usize,
    size: usize,
}

impl FrameBuf {
    /// Constructs `FrameBuf` of the specified size.
    pub fn with_size(channels: usize, size: usize) -> Self {
        Self {
            samples: vec![0i32; size * channels],
            channels,
            size,
        }
    }

    /// Returns the size in inter-channel samples.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Resizes `FrameBuf`.
    ///
    /// The channel contents are not preserved across a resize.
    pub fn resize(&mut self, new_size: usize) {
        self.size = new_size;
        self.samples.resize(self.size * self.channels, 0i32);
    }

    /// Fills from the interleaved slice, zeroing any remainder.
    pub fn fill_from_interleaved(&mut self, interleaved: &[i32]) {
        deinterleave(interleaved, self.channels, &mut self.samples);
    }

    /// Fills from per-channel slices, zeroing any remainder.
    ///
    /// # Panics
    ///
    /// Panics when the number of slices differs from the channel count.
    pub fn fill_from_planar(&mut self, channels: &[&[i32]]) {
        assert_eq!(channels.len(), self.channels);
        for (ch, src) in channels.iter().enumerate() {
            let size = self.size;
            let dest = self.channel_slice_mut(ch);
            let n = std::cmp::min(size, src.len());
            dest[..n].copy_from_slice(&src[..n]);
            for p in &mut dest[n..] {
                *p = 0i32;
            }
        }
    }

    /// Returns the number of channels.
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Returns samples of the given channel.
    ///
    /// # Panics
    ///
    /// Panics if `ch` is out of range.
    pub fn channel_slice(&self, ch: usize) -> &[i32] {
        &self.samples[ch * self.size..(ch + 1) * self.size]
    }

    /// Returns mutable samples of the given channel.
    ///
    /// # Panics
    ///
    /// Panics if `ch` is out of range.
    pub fn channel_slice_mut(&mut self, ch: usize) -> &mut [i32] {
        &mut self.samples[ch * self.size..(ch + 1) * self.size]
    }

    /// Returns the internal channel-major storage.
    #[cfg(test)]
    pub(crate) fn raw_slice(&self) -> &[i32] {
        &self.samples
    }
}

/// Per-stream ingestion context: MD5 accumulator and counters.
#[derive(Clone)]
pub struct Context {
    md5: md5::Context,
    bytes_per_sample: usize,
    channels: usize,
    sample_count: usize,
    frame_count: usize,
}

impl Context {
    /// Creates a new context.
    ///
    /// # Panics
    ///
    /// Panics if `bits_per_sample > 32`.
    pub fn new(bits_per_sample: usize, channels: usize) -> Self {
        let bytes_per_sample = (bits_per_sample + 7) / 8;
        assert!(
            bytes_per_sample <= 4,
            "bits_per_sample={bits_per_sample} cannot be larger than 32."
        );
        Self {
            md5: md5::Context::new(),
            bytes_per_sample,
            channels,
            sample_count: 0,
            frame_count: 0,
        }
    }

    /// Updates the MD5 accumulator with interleaved samples.
    ///
    /// Each sample contributes its `ceil(bps / 8)` low-order bytes in
    /// little-endian order.
    #[inline]
    fn update_md5(&mut self, interleaved: &[i32]) {
        for v in interleaved {
            self.md5.consume(&v.to_le_bytes()[0..self.bytes_per_sample]);
        }
    }

    /// Updates the context with the read samples.
    ///
    /// This function is typically called from [`Source::read_samples`].
    ///
    /// # Errors
    ///
    /// This function currently does not return an error.
    pub fn update(&mut self, interleaved: &[i32]) -> Result<(), SourceError> {
        self.update_md5(interleaved);
        self.sample_count += interleaved.len() / self.channels;
        self.frame_count += 1;
        Ok(())
    }

    /// Returns the number of the frame loaded last.
    ///
    /// # Panics
    ///
    /// Panics when called before `update` has been called at least once.
    #[inline]
    pub fn current_frame_number(&self) -> usize {
        assert!(self.frame_count > 0);
        self.frame_count - 1
    }

    /// Returns the MD5 digest of the consumed samples.
    #[inline]
    pub fn md5_digest(&self) -> [u8; 16] {
        self.md5.clone().compute().into()
    }

    /// Returns the number of inter-channel samples consumed.
    #[inline]
    pub fn total_samples(&self) -> usize {
        self.sample_count
    }
}

/// Trait for encoder input sources.
pub trait Source {
    /// Returns the number of channels.
    fn channels(&self) -> usize;
    /// Returns the number of bits per sample.
    fn bits_per_sample(&self) -> usize;
    /// Returns the sampling rate in Hz.
    fn sample_rate(&self) -> usize;
    /// Reads up to `dest.size()` samples into the buffer.
    ///
    /// When fewer samples remain, `dest` is resized to the remainder.
    /// Returns the number of inter-channel samples read; 0 at the end.
    #[allow(clippy::missing_errors_doc)]
    fn read_samples(
        &mut self,
        dest: &mut FrameBuf,
        context: &mut Context,
    ) -> Result<usize, SourceError>;
    /// Returns the length of the source if it is known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Source with preloaded samples.
#[derive(Clone, Debug)]
pub struct MemSource {
    channels: usize,
    bits_per_sample: usize,
    sample_rate: usize,
    samples: Vec<i32>,
    read_head: usize,
}

impl MemSource {
    /// Constructs `MemSource` from interleaved samples.
    pub fn from_samples(
        samples: &[i32],
        channels: usize,
        bits_per_sample: usize,
        sample_rate: usize,
    ) -> Self {
        Self {
            channels,
            bits_per_sample,
            sample_rate,
            samples: samples.to_owned(),
            read_head: 0,
        }
    }

    /// Returns the sample buffer as a raw interleaved slice.
    pub fn as_raw_slice(&self) -> &[i32] {
        &self.samples
    }

    /// Returns the length in inter-channel samples.
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Returns true if the source contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Source for MemSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn bits_per_sample(&self) -> usize {
        self.bits_per_sample
    }

    fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    fn read_samples(
        &mut self,
        dest: &mut FrameBuf,
        context: &mut Context,
    ) -> Result<usize, SourceError> {
        if dest.channels() != self.channels {
            return Err(SourceError::by_reason(SourceErrorReason::InvalidBuffer));
        }
        let begin = std::cmp::min(self.read_head * self.channels, self.samples.len());
        let end = std::cmp::min(begin + dest.size() * self.channels, self.samples.len());
        let src = &self.samples[begin..end];
        let read = src.len() / self.channels;

        if read < dest.size() {
            dest.resize(read);
        }
        dest.fill_from_interleaved(src);
        if !src.is_empty() {
            context.update(src)?;
        }
        self.read_head += read;
        Ok(read)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}
