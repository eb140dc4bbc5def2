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

//! Shared utilities for the unit tests of this crate.

use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::io::Write;

use once_cell::sync::Lazy;
use rand::distributions::Distribution;
use rand::distributions::Uniform;
use rand::Rng;
use tempfile::NamedTempFile;

use super::bitsink::MemSink;
use super::coding;
use super::component::BitRepr;
use super::component::ChannelAssignment;
use super::component::Frame;
use super::component::FrameHeader;
use super::component::FrameOffset;
use super::component::Residual;
use super::component::StreamInfo;
use super::component::Verbatim;
use super::config;
use super::decoder::CollectSink;
use super::decoder::IoSource;
use super::decoder::StreamDecoder;
use super::sigen;
use super::sigen::Signal;
use super::source::MemSource;
use super::source::Source;

#[macro_export]
macro_rules! assert_close {
    ($actual:expr, $expected:expr, rtol = $rtol:expr, atol = $atol:expr) => {{
        let err = ($actual - $expected).abs();
        #[allow(clippy::suboptimal_flops)]
        let tol = $rtol * ($expected).abs() + $atol;
        assert!(err < tol);
    }};
    ($actual:expr, $expected:expr) => {{
        assert_close!($actual, $expected, rtol = 0.00001, atol = 0.00001);
    }};
}

#[macro_export]
macro_rules! assert_finite {
    ($result:expr) => {{
        for (i, &value) in $result.iter().enumerate() {
            assert!(
                value.is_normal() || value == 0.0,
                "{}-th element in a vector is not finite ({}), x={:?}.",
                i,
                value,
                $result
            );
        }
    }};
}

/// Generates a test signal with a sinusoid plus uniform white noise.
pub fn sinusoid_plus_noise(
    block_size: usize,
    period: usize,
    amplitude: f32,
    noise_width: i32,
) -> Vec<i32> {
    let mut rng = rand::thread_rng();
    let period = period as f32;
    let die = Uniform::from(-noise_width..=noise_width);
    let mut ret = Vec::new();
    for t in 0..block_size {
        let sin = (amplitude * (2.0 * (t as f32) * PI / period).sin()) as i32;
        ret.push(sin + die.sample(&mut rng));
    }
    ret
}

/// Generates a DC signal with uniform white noise.
pub fn constant_plus_noise(block_size: usize, dc_offset: i32, noise_width: i32) -> Vec<i32> {
    let mut rng = rand::thread_rng();
    let die = Uniform::from(-noise_width..=noise_width);
    let mut ret = Vec::new();
    for _t in 0..block_size {
        ret.push(dc_offset + die.sample(&mut rng));
    }
    ret
}

/// Named deterministic reference signals shared across tests.
///
/// The generators are seeded, so every access observes the same
/// samples.
static TEST_SIGNALS: Lazy<BTreeMap<(&str, usize), Vec<i32>>> = Lazy::new(|| {
    BTreeMap::from([
        (
            ("sustain", 0),
            sigen::Sine::new(227, 0.5)
                .noise_with_seed(1, 0.01)
                .to_vec_quantized(16, 32768),
        ),
        (
            ("sustain", 1),
            sigen::Sine::with_initial_phase(227, 0.5, 0.3)
                .noise_with_seed(2, 0.01)
                .to_vec_quantized(16, 32768),
        ),
        (
            ("attack", 0),
            sigen::Dc::new(0.0)
                .concat(512, sigen::Sine::new(64, 0.8).noise_with_seed(3, 0.05))
                .to_vec_quantized(16, 32768),
        ),
        (
            ("attack", 1),
            sigen::Dc::new(0.0)
                .concat(700, sigen::Sine::new(65, 0.8).noise_with_seed(4, 0.05))
                .to_vec_quantized(16, 32768),
        ),
    ])
});

/// Returns a channel of one of the named reference signals.
pub fn test_signal(src: &str, ch: usize) -> Vec<i32> {
    TEST_SIGNALS
        .get(&(src, ch))
        .expect("Specified test signal not found.")
        .clone()
}

/// Builds a frame holding the interleaved `samples` verbatim.
pub fn make_verbatim_frame(stream_info: &StreamInfo, samples: &[i32], frame_number: u32) -> Frame {
    let channels = stream_info.channels();
    let block_size = samples.len() / channels;
    let bits_per_sample = stream_info.bits_per_sample();
    let header = FrameHeader::new(
        block_size,
        ChannelAssignment::Independent(channels as u8),
        bits_per_sample,
        stream_info.sample_rate(),
        FrameOffset::Frame(frame_number),
    )
    .expect("header parameters must be valid in tests");
    let mut frame = Frame::with_capacity(header);
    for ch in 0..channels {
        let channel_samples: Vec<i32> = samples
            .iter()
            .skip(ch)
            .step_by(channels)
            .copied()
            .collect();
        frame.add_subframe(Verbatim::from_samples(&channel_samples, bits_per_sample as u8, 0).into());
    }
    frame
}

/// Builds a valid random `Residual` with the given warm-up length.
pub fn make_random_residual<R: Rng>(mut rng: R, warmup_length: usize) -> Residual {
    let block_size = Uniform::from(4..=64).sample(&mut rng) * 16;
    let errors: Vec<i32> = (0..block_size)
        .map(|t| {
            if t < warmup_length {
                0
            } else {
                Uniform::from(-100..=100).sample(&mut rng)
            }
        })
        .collect();
    coding::encode_residual(&config::Prc::default(), &errors, warmup_length)
}

/// Encodes `src`, writes the stream to a temporary file, decodes the
/// file back, and asserts the decoded samples match the input.
pub fn integrity_test(config: &config::Encoder, src: &MemSource, block_size: usize) {
    let stream = coding::encode_with_fixed_block_size(config, src.clone(), block_size)
        .expect("encoding failed");

    let mut sink = MemSink::with_capacity(stream.count_bits());
    stream.write(&mut sink).expect("bitstream formatting failed");

    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(sink.as_slice()).expect("file write failed");
    let file = file.reopen().expect("failed to reopen temp file");

    let mut decoder = StreamDecoder::new(IoSource::new(file));
    let mut collected = CollectSink::default();
    decoder
        .process_until_end(&mut collected)
        .expect("decoding failed");

    assert!(collected.errors.is_empty(), "unexpected stream errors");
    let info = decoder.stream_info().expect("missing STREAMINFO");
    assert_eq!(info.channels(), src.channels());
    assert_eq!(info.sample_rate(), src.sample_rate());
    assert_eq!(info.bits_per_sample(), src.bits_per_sample());
    assert_eq!(info.total_samples(), src.len() as u64);

    let channels = src.channels();
    for ch in 0..channels {
        for (t, &x) in collected.channels[ch].iter().enumerate() {
            assert_eq!(
                x,
                src.as_raw_slice()[t * channels + ch],
                "decoded sample differs at t={t} of ch={ch}"
            );
        }
        assert_eq!(collected.channels[ch].len(), src.len());
    }
    decoder.finish().expect("MD5 mismatch after a clean decode");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_signals_are_deterministic() {
        let a = test_signal("sustain", 0);
        let b = test_signal("sustain", 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32768);
        assert_ne!(a, test_signal("sustain", 1));
    }

    #[test]
    fn integrity_through_a_file() {
        let signal = test_signal("attack", 0);
        let src = MemSource::from_samples(&signal[..8192], 1, 16, 44100);
        integrity_test(&config::Encoder::default(), &src, 1024);
    }
}
