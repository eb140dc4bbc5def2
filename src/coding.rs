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

//! Controller connecting the coding algorithms.

use super::bitsink::MemSink;
use super::component::parser;
use super::component::BitRepr;
use super::component::ChannelAssignment;
use super::component::Constant;
use super::component::Decode;
use super::component::FixedLpc;
use super::component::Frame;
use super::component::FrameHeader;
use super::component::FrameOffset;
use super::component::Lpc;
use super::component::Padding;
use super::component::Residual;
use super::component::SampleRateSpec;
use super::component::SampleSizeSpec;
use super::component::SeekTable;
use super::component::BlockSizeSpec;
use super::component::Stream;
use super::component::StreamInfo;
use super::component::SubFrame;
use super::component::Verbatim;
use super::config;
use super::constant::fixed::MAX_ORDER as MAX_FIXED_LPC_ORDER;
use super::constant::panic_msg;
use super::constant::MAX_BLOCK_SIZE;
use super::constant::MIN_BLOCK_SIZE;
use super::error::EncodeError;
use super::error::Verify;
use super::error::VerifyError;
use super::error::VerifyMismatch;
use super::lpc;
use super::reusable;
use super::reuse;
use super::rice;
use super::source::Context;
use super::source::FrameBuf;
use super::source::Source;

/// The widest effective sample for which an order-4 difference still
/// fits `i32`.
const MAX_PREDICTOR_BPS: usize = 27;

/// The widest effective sample offered to the LPC search.
const MAX_LPC_BPS: usize = 26;

/// Returns true if all elements are equal.
fn is_constant<T: PartialEq>(samples: &[T]) -> bool {
    samples.windows(2).all(|w| w[0] == w[1])
}

/// Returns the greatest `k` such that every sample is a multiple of
/// `2^k`, capped below the sample width; 0 for all-zero signals.
fn wasted_bits_of(samples: &[i32], bits_per_sample: u8) -> u8 {
    let mut k = u32::MAX;
    for &x in samples {
        if x != 0 {
            k = k.min(x.trailing_zeros());
            if k == 0 {
                return 0;
            }
        }
    }
    if k == u32::MAX {
        0
    } else {
        k.min(u32::from(bits_per_sample) - 1) as u8
    }
}

/// Computes the Rice encoding of a scalar (used in `encode_residual`).
#[inline]
const fn quotients_and_remainders(err: i32, rice_p: u8) -> (u32, u32) {
    let remainder_mask = (1u32 << rice_p) - 1;
    let err = rice::encode_signbit(err);
    (err >> rice_p, err & remainder_mask)
}

/// Computes `Residual` from the given error signal and PRC parameters.
fn encode_residual_with_prc_parameter(
    errors: &[i32],
    warmup_length: usize,
    prc_p: rice::PrcParameter,
) -> Residual {
    let block_size = errors.len();
    let nparts = 1 << prc_p.order;
    let part_size = errors.len() >> prc_p.order;
    debug_assert!(part_size >= warmup_length);

    let mut quotients = vec![0u32; block_size];
    let mut remainders = vec![0u32; block_size];

    let mut offset = 0;
    for rice_p in &prc_p.ps[0..nparts] {
        let start = std::cmp::max(offset, warmup_length);
        offset += part_size;
        let end = offset;
        for t in start..end {
            (quotients[t], remainders[t]) = quotients_and_remainders(errors[t], *rice_p);
        }
    }
    Residual::from_parts(
        prc_p.order as u8,
        block_size,
        warmup_length,
        prc_p.ps,
        quotients,
        remainders,
    )
}

/// Constructs a `Residual` component given the error signal.
pub(crate) fn encode_residual(
    config: &config::Prc,
    errors: &[i32],
    warmup_length: usize,
) -> Residual {
    let prc_p = rice::find_partitioned_rice_parameter(errors, warmup_length, config.max_parameter);
    encode_residual_with_prc_parameter(errors, warmup_length, prc_p)
}

type FixedLpcErrors = [Vec<i32>; MAX_FIXED_LPC_ORDER + 1];
reusable!(FIXED_LPC_ERRORS: FixedLpcErrors);

/// Recomputes forward differences of `signal` for every fixed order.
fn reset_fixed_lpc_errors(errors: &mut FixedLpcErrors, signal: &[i32]) {
    errors[0].clear();
    errors[0].extend_from_slice(signal);

    for order in 0..MAX_FIXED_LPC_ORDER {
        let (lower, upper) = errors.split_at_mut(order + 1);
        let prev = &lower[order];
        let next = &mut upper[0];
        next.clear();
        next.resize(signal.len(), 0i32);
        if !signal.is_empty() {
            next[0] = prev[0];
            for t in 1..signal.len() {
                next[t] = prev[t] - prev[t - 1];
            }
        }
    }
}

/// Sums absolute values into `f32` (sufficient for cost estimates).
#[inline]
fn find_sum_abs_f32(errors: &[i32]) -> f32 {
    let mut acc = 0.0f32;
    for x in errors {
        acc += x.unsigned_abs() as f32;
    }
    acc
}

/// Estimates the bit count from the error signal.
fn estimate_entropy(errors: &[i32], warmup_len: usize, partitions: usize) -> usize {
    // this function computes the partition average of:
    //   (1 + e) log (1 + e) - e * log e
    // where log-base is 2 and e is the average error magnitude, i.e.
    // the cross-entropy of a geometric distribution fitted per
    // partition.
    let block_size = errors.len();
    let partition_size = (block_size + partitions - 1) / partitions;

    let mut offset = 0;
    let mut acc = 0;
    for _p in 0..partitions {
        let end = std::cmp::min(block_size, offset + partition_size);
        let partition_len = end - offset;
        if end >= warmup_len {
            let sample_count = std::cmp::min(end - warmup_len, partition_len);
            let sum_errors = find_sum_abs_f32(&errors[offset..end]);
            let avg_errors = sum_errors * 2.0 / (sample_count as f32 + 0.00001);
            let geom_p = 1.0 / (avg_errors + 1.0);
            let xent = avg_errors.mul_add(-(1.0 - geom_p).log2(), -geom_p.log2());
            acc += (xent * sample_count as f32) as usize;
        }
        offset = end;
    }
    acc
}

/// Selects the best fixed-LPC order and encodes its `Residual`.
fn select_order_and_encode_residual<'a, I>(
    order_sel: &config::OrderSel,
    prc_config: &config::Prc,
    errors: I,
    bits_per_sample: usize,
    baseline_bits: usize,
) -> Option<(usize, Residual)>
where
    I: Iterator<Item = (usize, &'a [i32])>,
{
    let max_rice_p = prc_config.max_parameter;
    match *order_sel {
        config::OrderSel::BitCount => errors
            .map(|(order, err)| {
                let prc_p = rice::find_partitioned_rice_parameter(err, order, max_rice_p);
                let bits = bits_per_sample * order + prc_p.code_bits;
                (order, err, prc_p, bits)
            })
            .min_by_key(|(_order, _err, _prc_p, bits)| *bits)
            .and_then(|(order, err, prc_p, bits)| {
                (bits < baseline_bits)
                    .then(|| (order, encode_residual_with_prc_parameter(err, order, prc_p)))
            }),
        config::OrderSel::ApproxEnt { partitions } => errors
            .map(|(order, err)| {
                (
                    order,
                    err,
                    estimate_entropy(err, order, partitions) + bits_per_sample * order,
                )
            })
            .min_by_key(|(_order, _err, bits)| *bits)
            .and_then(|(order, err, bits)| {
                (bits < baseline_bits).then(|| (order, encode_residual(prc_config, err, order)))
            }),
    }
}

/// Tries `0..=4`-th order fixed LPC and returns the smallest `SubFrame`.
#[inline]
fn fixed_lpc(
    config: &config::SubFrameCoding,
    signal: &[i32],
    bits_per_sample: u8,
    wasted_bits: u8,
    baseline_bits: usize,
) -> Option<SubFrame> {
    let max_order = config.fixed.max_order.min(signal.len());

    reuse!(FIXED_LPC_ERRORS, |errors: &mut FixedLpcErrors| {
        reset_fixed_lpc_errors(errors, signal);
        let errors = errors
            .iter()
            .map(Vec::as_slice)
            .take(max_order + 1)
            .enumerate();
        select_order_and_encode_residual(
            &config.fixed.order_sel,
            &config.prc,
            errors,
            bits_per_sample as usize,
            baseline_bits,
        )
        .map(|(order, residual)| {
            FixedLpc::from_parts(
                heapless::Vec::from_slice(&signal[..order])
                    .expect("Exceeded maximum order for FixedLpc component."),
                residual,
                bits_per_sample,
                wasted_bits,
            )
            .into()
        })
    })
}

reusable!(QLPC_ERROR_BUFFER: Vec<i32>);

/// Estimates the optimal LPC coefficients and returns a `SubFrame`.
///
/// Returns `None` when no LPC candidate beats `baseline_bits`, or when
/// no candidate order is quantizable at the configured precision.
fn estimated_qlpc(
    config: &config::SubFrameCoding,
    signal: &[i32],
    bits_per_sample: u8,
    wasted_bits: u8,
    baseline_bits: usize,
) -> Option<SubFrame> {
    let max_order = config.qlpc.lpc_order.min(signal.len() - 1);
    let precision = config.qlpc.quant_precision;
    let analysis = lpc::analyze(signal, &config.qlpc.window, max_order);

    let orders: Vec<usize> = if config.qlpc.exhaustive_order_search {
        (1..=max_order).collect()
    } else {
        vec![analysis.estimate_best_order(signal.len(), bits_per_sample as usize + precision)]
    };

    let mut best: Option<SubFrame> = None;
    let mut best_bits = baseline_bits;
    reuse!(QLPC_ERROR_BUFFER, |errors: &mut Vec<i32>| {
        for order in orders {
            let Some(qlpc) = lpc::quantize_parameters(analysis.coefs(order), precision) else {
                continue;
            };
            errors.clear();
            errors.resize(signal.len(), 0i32);
            lpc::compute_error(&qlpc, signal, errors);
            let residual = encode_residual(&config.prc, errors, qlpc.order());
            let candidate: SubFrame = Lpc::from_parts(
                heapless::Vec::from_slice(&signal[0..qlpc.order()])
                    .expect("LPC order exceeded the maximum"),
                qlpc,
                residual,
                bits_per_sample,
                wasted_bits,
            )
            .into();
            let bits = candidate.count_bits();
            if bits < best_bits {
                best_bits = bits;
                best = Some(candidate);
            }
        }
    });
    best
}

reusable!(SHIFTED_SIGNAL_BUFFER: Vec<i32>);

/// Runs the model search over the (already wasted-bits-reduced) signal.
fn encode_subframe_models(
    config: &config::SubFrameCoding,
    signal: &[i32],
    bits_per_sample: u8,
    wasted_bits: u8,
) -> SubFrame {
    let baseline_bits = Verbatim::count_bits_from_metadata(
        signal.len(),
        bits_per_sample as usize,
        wasted_bits as usize,
    );

    let fixed = if config.use_fixed && (bits_per_sample as usize) <= MAX_PREDICTOR_BPS {
        fixed_lpc(config, signal, bits_per_sample, wasted_bits, baseline_bits)
    } else {
        None
    };

    let baseline_bits = fixed.as_ref().map_or(baseline_bits, |x| {
        std::cmp::min(baseline_bits, x.count_bits())
    });
    let est_lpc = if config.use_lpc && (bits_per_sample as usize) <= MAX_LPC_BPS && signal.len() >= 2
    {
        estimated_qlpc(config, signal, bits_per_sample, wasted_bits, baseline_bits)
    } else {
        None
    };

    est_lpc
        .or(fixed)
        .unwrap_or_else(|| Verbatim::from_samples(signal, bits_per_sample, wasted_bits).into())
}

/// Finds the best method to encode the given samples.
fn encode_subframe(
    config: &config::SubFrameCoding,
    samples: &[i32],
    bits_per_sample: u8,
) -> SubFrame {
    if config.use_constant && is_constant(samples) {
        // Constant is always best when applicable.
        return Constant::from_parts(samples.len(), samples[0], bits_per_sample, 0).into();
    }
    let wasted = if config.use_wasted_bits {
        wasted_bits_of(samples, bits_per_sample)
    } else {
        0
    };
    if wasted == 0 {
        return encode_subframe_models(config, samples, bits_per_sample, 0);
    }
    reuse!(SHIFTED_SIGNAL_BUFFER, |buf: &mut Vec<i32>| {
        buf.clear();
        buf.extend(samples.iter().map(|x| x >> wasted));
        encode_subframe_models(config, buf, bits_per_sample - wasted, wasted)
    })
}

/// Builds the frame header for the given stream parameters.
fn make_frame_header(
    stream_info: &StreamInfo,
    block_size: usize,
    ch_info: ChannelAssignment,
    frame_number: u32,
) -> FrameHeader {
    let mut header = FrameHeader::from_specs(
        BlockSizeSpec::from_size(block_size as u16),
        ch_info,
        SampleSizeSpec::from_bits(stream_info.bits_per_sample() as u8)
            .unwrap_or(SampleSizeSpec::Unspecified),
        SampleRateSpec::from_freq(stream_info.sample_rate() as u32)
            .unwrap_or(SampleRateSpec::Unspecified),
    );
    header.set_frame_offset(FrameOffset::Frame(frame_number));
    header
}

/// Encodes a frame with the given channel assignment.
fn encode_frame_impl(
    config: &config::Encoder,
    framebuf: &FrameBuf,
    frame_number: u32,
    stream_info: &StreamInfo,
    ch_info: &ChannelAssignment,
) -> Frame {
    let nchannels = stream_info.channels();
    let bits_per_sample = stream_info.bits_per_sample();
    let header = make_frame_header(stream_info, framebuf.size(), ch_info.clone(), frame_number);
    let mut frame = Frame::with_capacity(header);
    for ch in 0..nchannels {
        frame.add_subframe(encode_subframe(
            &config.subframe_coding,
            framebuf.channel_slice(ch),
            (bits_per_sample + ch_info.bits_per_sample_offset(ch)) as u8,
        ));
    }
    frame
}

/// Recombines a stereo frame out of independent and mid/side candidates.
#[inline]
fn recombine_stereo_frame(header: FrameHeader, indep: Frame, ms: Frame) -> Frame {
    let (_header, l, r) = indep
        .into_stereo_channels()
        .expect(panic_msg::DATA_INCONSISTENT);
    let (_header, m, s) = ms
        .into_stereo_channels()
        .expect(panic_msg::DATA_INCONSISTENT);

    let chans = header.channel_assignment().select_channels(l, r, m, s);
    Frame::from_parts(header, vec![chans.0, chans.1])
}

reusable!(MSFRAMEBUF: FrameBuf = FrameBuf::with_size(2, 4096));

/// Fills the mid/side buffer from a left/right buffer.
fn fill_mid_side(framebuf: &FrameBuf, ms_framebuf: &mut FrameBuf) {
    ms_framebuf.resize(framebuf.size());
    for t in 0..framebuf.size() {
        let l = framebuf.channel_slice(0)[t];
        let r = framebuf.channel_slice(1)[t];
        let (mid, side) = ((l + r) >> 1, l - r);
        ms_framebuf.channel_slice_mut(0)[t] = mid;
        ms_framebuf.channel_slice_mut(1)[t] = side;
    }
}

/// Tries all enabled stereo channel recombinations, returns the best.
fn try_stereo_coding(
    config: &config::Encoder,
    framebuf: &FrameBuf,
    indep: Frame,
    frame_number: u32,
    stream_info: &StreamInfo,
) -> Frame {
    reuse!(MSFRAMEBUF, |ms_framebuf: &mut FrameBuf| {
        fill_mid_side(framebuf, ms_framebuf);

        let ms_frame = encode_frame_impl(
            config,
            ms_framebuf,
            frame_number,
            stream_info,
            &ChannelAssignment::MidSide,
        );

        let (bits_l, bits_r, bits_m, bits_s) = (
            indep.subframe(0).unwrap().count_bits(),
            indep.subframe(1).unwrap().count_bits(),
            ms_frame.subframe(0).unwrap().count_bits(),
            ms_frame.subframe(1).unwrap().count_bits(),
        );

        let combinations = [
            config
                .stereo_coding
                .use_leftside
                .then_some((ChannelAssignment::LeftSide, bits_l + bits_s)),
            config
                .stereo_coding
                .use_rightside
                .then_some((ChannelAssignment::RightSide, bits_r + bits_s)),
            config
                .stereo_coding
                .use_midside
                .then_some((ChannelAssignment::MidSide, bits_m + bits_s)),
        ];

        let mut min_bits = bits_l + bits_r;
        let mut min_ch_info = ChannelAssignment::Independent(2);
        for (ch_info, bits) in combinations.iter().flatten() {
            if *bits < min_bits {
                min_bits = *bits;
                min_ch_info = ch_info.clone();
            }
        }
        let mut header = ms_frame.header().clone();
        header.reset_channel_assignment(min_ch_info);
        recombine_stereo_frame(header, indep, ms_frame)
    })
}

/// Encodes a stereo frame with a fixed, pre-selected assignment.
fn encode_stereo_with_assignment(
    config: &config::Encoder,
    framebuf: &FrameBuf,
    frame_number: u32,
    stream_info: &StreamInfo,
    assignment: ChannelAssignment,
) -> Frame {
    if assignment == ChannelAssignment::Independent(2) {
        return encode_frame_impl(config, framebuf, frame_number, stream_info, &assignment);
    }
    reuse!(MSFRAMEBUF, |ms_framebuf: &mut FrameBuf| {
        fill_mid_side(framebuf, ms_framebuf);
        let bits_per_sample = stream_info.bits_per_sample();
        let header = make_frame_header(stream_info, framebuf.size(), assignment.clone(), frame_number);
        let mut frame = Frame::with_capacity(header);
        for ch in 0..2 {
            let signal = match (&assignment, ch) {
                (ChannelAssignment::LeftSide, 0) => framebuf.channel_slice(0),
                (ChannelAssignment::LeftSide, _) => ms_framebuf.channel_slice(1),
                (ChannelAssignment::RightSide, 0) => ms_framebuf.channel_slice(1),
                (ChannelAssignment::RightSide, _) => framebuf.channel_slice(1),
                (ChannelAssignment::MidSide, 0) => ms_framebuf.channel_slice(0),
                (ChannelAssignment::MidSide, _) => ms_framebuf.channel_slice(1),
                _ => unreachable!(),
            };
            frame.add_subframe(encode_subframe(
                &config.subframe_coding,
                signal,
                (bits_per_sample + assignment.bits_per_sample_offset(ch)) as u8,
            ));
        }
        frame
    })
}

/// State carried across frames by the loose stereo-coding mode.
#[derive(Default)]
pub(crate) struct StereoContext {
    held_assignment: Option<ChannelAssignment>,
    frames_left: usize,
}

impl StereoContext {
    fn hold_span(stream_info: &StreamInfo, block_size: usize) -> usize {
        // re-evaluate roughly every 0.4 seconds.
        std::cmp::max(1, 2 * stream_info.sample_rate() / (5 * block_size.max(1)))
    }
}

/// Finds the best configuration for the samples and returns a `Frame`.
fn encode_frame(
    config: &config::Encoder,
    framebuf: &FrameBuf,
    frame_number: u32,
    stream_info: &StreamInfo,
    stereo_ctx: &mut StereoContext,
) -> Frame {
    let nchannels = stream_info.channels();
    // the side channel needs one extra bit, so stereo recombination is
    // only attempted when that still fits the 32-bit sample lanes.
    let try_stereo = nchannels == 2 && stream_info.bits_per_sample() < 32;

    if try_stereo && config.stereo_coding.loose {
        if let Some(assignment) = stereo_ctx.held_assignment.clone() {
            if stereo_ctx.frames_left > 0 {
                stereo_ctx.frames_left -= 1;
                return encode_stereo_with_assignment(
                    config,
                    framebuf,
                    frame_number,
                    stream_info,
                    assignment,
                );
            }
        }
    }

    let ch_info = ChannelAssignment::Independent(nchannels as u8);
    let mut ret = encode_frame_impl(config, framebuf, frame_number, stream_info, &ch_info);

    if try_stereo {
        ret = try_stereo_coding(config, framebuf, ret, frame_number, stream_info);
        if config.stereo_coding.loose {
            stereo_ctx.held_assignment = Some(ret.header().channel_assignment().clone());
            stereo_ctx.frames_left = StereoContext::hold_span(stream_info, framebuf.size());
        }
    }
    ret
}

/// Encodes a [`FrameBuf`] into a [`Frame`].
///
/// The block size is taken from `FrameBuf::size`.
///
/// # Errors
///
/// Returns an error when the block size is out of range or a sample
/// does not fit the declared bits-per-sample.
pub fn encode_fixed_size_frame(
    config: &config::Encoder,
    framebuf: &FrameBuf,
    frame_number: usize,
    stream_info: &StreamInfo,
) -> Result<Frame, EncodeError> {
    let block_size = framebuf.size();
    if block_size < MIN_BLOCK_SIZE {
        return Err(VerifyError::new(
            "input.framebuf.size",
            &format!("must be greater than or equal to {MIN_BLOCK_SIZE}"),
        )
        .into());
    }
    if block_size > MAX_BLOCK_SIZE {
        return Err(VerifyError::new(
            "input.framebuf.size",
            &format!("must be less than or equal to {MAX_BLOCK_SIZE}"),
        )
        .into());
    }

    let bps = stream_info.bits_per_sample();
    let max_allowed = ((1u64 << (bps - 1)) - 1) as i64;
    let min_allowed = -(1i64 << (bps - 1));
    for ch in 0..framebuf.channels() {
        let slice = framebuf.channel_slice(ch);
        let min = slice.iter().min().copied().unwrap_or(0);
        let max = slice.iter().max().copied().unwrap_or(0);
        if i64::from(min) < min_allowed || i64::from(max) > max_allowed {
            return Err(VerifyError::new(
                "input.framebuf",
                &format!("input sample must be in the range of bits={bps}"),
            )
            .into());
        }
    }

    let mut stereo_ctx = StereoContext::default();
    Ok(encode_frame(
        config,
        framebuf,
        frame_number as u32,
        stream_info,
        &mut stereo_ctx,
    ))
}

/// Checks that the stream parameters all have dedicated header codes,
/// so any decoder can resume from a frame sync without STREAMINFO.
fn verify_streamable_subset(
    block_size: usize,
    sample_rate: usize,
    bits_per_sample: usize,
) -> Result<(), VerifyError> {
    if !BlockSizeSpec::from_size(block_size as u16).is_enumerated() {
        return Err(VerifyError::new(
            "block_size",
            "must be an enumerated size in streamable-subset mode",
        ));
    }
    if !SampleRateSpec::from_freq(sample_rate as u32).is_some_and(|s| s.is_enumerated()) {
        return Err(VerifyError::new(
            "sample_rate",
            "must be an enumerated rate in streamable-subset mode",
        ));
    }
    if SampleSizeSpec::from_bits(bits_per_sample as u8).is_none() {
        return Err(VerifyError::new(
            "bits_per_sample",
            "must be an enumerated width in streamable-subset mode",
        ));
    }
    Ok(())
}

/// Feeds the emitted bytes of `frame` back through the parser and
/// compares the reconstruction with the input samples.
fn verify_frame(
    frame: &Frame,
    framebuf: &FrameBuf,
    stream_info: &StreamInfo,
    frame_number: usize,
    start_sample: u64,
) -> Result<(), EncodeError> {
    let mut sink = MemSink::with_capacity(frame.count_bits());
    frame
        .write(&mut sink)
        .map_err(|_| VerifyError::new("frame", "emitted frame could not be serialized"))?;
    let (_rest, parsed) =
        parser::frame::<(&[u8], nom::error::ErrorKind)>(stream_info, true)(sink.as_slice())
            .map_err(|_| VerifyError::new("frame", "emitted frame failed to parse back"))?;

    let decoded = parsed.decode();
    let channels = framebuf.channels();
    for t in 0..framebuf.size() {
        for ch in 0..channels {
            let expected = framebuf.channel_slice(ch)[t];
            let got = decoded[t * channels + ch];
            if expected != got {
                let mismatch = VerifyMismatch {
                    frame: frame_number,
                    channel: ch,
                    sample: start_sample + t as u64,
                    expected,
                    got,
                };
                log::error!("verification failed: {mismatch}");
                return Err(mismatch.into());
            }
        }
    }
    Ok(())
}

/// Encodes a [`Source`] into a [`Stream`].
///
/// This is the main entry point of this library crate. `block_size`
/// overrides `config.block_size`.
///
/// # Errors
///
/// Returns [`EncodeError`] when the configuration is invalid (always
/// before the first frame is encoded), when reading from `src` fails,
/// or when self-verification detects a mismatch.
///
/// # Panics
///
/// This function panics only due to internal errors.
///
/// # Examples
///
/// ```
/// use cadenza::config;
/// use cadenza::source::MemSource;
/// use cadenza::encode_with_fixed_block_size;
///
/// let (signal_len, block_size, channels, sample_rate) = (32000, 256, 2, 16000);
/// let signal = vec![0i32; signal_len * channels];
/// let source = MemSource::from_samples(&signal, channels, 16, sample_rate);
/// let stream = encode_with_fixed_block_size(
///     &config::Encoder::default(), source, block_size
/// ).expect("encoder error");
/// assert_eq!(stream.stream_info().total_samples(), 32000);
/// ```
pub fn encode_with_fixed_block_size<T: Source>(
    config: &config::Encoder,
    mut src: T,
    block_size: usize,
) -> Result<Stream, EncodeError> {
    config.verify().map_err(EncodeError::Config)?;
    if block_size < MIN_BLOCK_SIZE || block_size > MAX_BLOCK_SIZE {
        return Err(VerifyError::new("block_size", "must be a valid block size").into());
    }
    if block_size <= config.subframe_coding.qlpc.lpc_order {
        return Err(
            VerifyError::new("block_size", "must be greater than the LPC order").into(),
        );
    }
    if config.streamable_subset {
        verify_streamable_subset(block_size, src.sample_rate(), src.bits_per_sample())?;
    }

    let mut stream = Stream::new(src.sample_rate(), src.channels(), src.bits_per_sample())?;
    if let Some(padding) = config.padding {
        stream.add_metadata_block(Padding::new(padding)?.into());
    }
    if let (Some(interval), Some(total)) = (config.seek_point_interval, src.len_hint()) {
        if interval > 0 && total > 0 {
            stream
                .add_metadata_block(SeekTable::with_spaced_points(interval, total as u64).into());
        }
    }

    let mut framebuf = FrameBuf::with_size(src.channels(), block_size);
    let mut context = Context::new(src.bits_per_sample(), src.channels());
    let mut stereo_ctx = StereoContext::default();
    let mut start_sample = 0u64;
    loop {
        framebuf.resize(block_size);
        let read_samples = src.read_samples(&mut framebuf, &mut context)?;
        if read_samples == 0 {
            break;
        }
        let frame_number = context.current_frame_number();
        let frame = encode_frame(
            config,
            &framebuf,
            frame_number as u32,
            stream.stream_info(),
            &mut stereo_ctx,
        );
        if config.verify {
            verify_frame(
                &frame,
                &framebuf,
                stream.stream_info(),
                frame_number,
                start_sample,
            )?;
        }
        start_sample += read_samples as u64;
        stream.add_frame(frame);
    }

    stream
        .stream_info_mut()
        .set_md5_digest(&context.md5_digest());
    stream
        .stream_info_mut()
        .set_total_samples(src.len_hint().unwrap_or_else(|| context.total_samples()) as u64);
    stream.resolve_seek_points();
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigen;
    use crate::sigen::Signal;
    use crate::source::MemSource;

    fn decode_stream_interleaved(stream: &Stream) -> Vec<i32> {
        let mut ret = vec![];
        for frame in stream.frames() {
            ret.extend(frame.decode());
        }
        ret
    }

    #[test]
    fn constant_detector() {
        assert!(is_constant(&[5; 64]));
        assert!(is_constant(&[-3; 1]));
        assert!(is_constant::<i32>(&[]));
        assert!(!is_constant(&[1, 1, 2]));
    }

    #[test]
    fn wasted_bit_detection() {
        assert_eq!(wasted_bits_of(&[4, 8, -12], 16), 2);
        assert_eq!(wasted_bits_of(&[4, 8, -12, 1], 16), 0);
        assert_eq!(wasted_bits_of(&[0, 0, 0], 16), 0);
        assert_eq!(wasted_bits_of(&[0, 16, 0], 16), 4);
        assert_eq!(wasted_bits_of(&[i32::MIN], 32), 31);
    }

    #[test]
    fn fixed_lpc_error_computation() {
        let mut errors = FixedLpcErrors::default();
        let signal = sigen::Sine::new(32, 0.3)
            .noise(0.1)
            .to_vec_quantized(16, 64);
        reset_fixed_lpc_errors(&mut errors, &signal);
        let unpacked = &errors[1];
        for t in 1..signal.len() {
            assert_eq!(unpacked[t], signal[t] - signal[t - 1]);
        }
        let unpacked = &errors[2];
        for t in 2..signal.len() {
            assert_eq!(unpacked[t], signal[t] - 2 * signal[t - 1] + signal[t - 2]);
        }
    }

    #[test]
    fn fixed_lpc_of_sine() {
        let signal = sigen::Sine::new(100, 0.6).to_vec_quantized(8, 1024);
        let mut config = config::SubFrameCoding::default();
        for order in 0..=MAX_FIXED_LPC_ORDER {
            config.fixed.max_order = order;
            let subframe = fixed_lpc(&config, &signal, 8, 0, usize::MAX)
                .expect("Should return Some because `baseline_bits` is usize::MAX.");
            assert_eq!(subframe.decode(), signal);
        }
    }

    #[test]
    fn losslessness_residual_coding() {
        let signal = sigen::Noise::new(0.4).to_vec_quantized(8, 64);
        let residual = encode_residual(&config::Prc::default(), &signal, 0);
        assert_eq!(residual.decode(), signal);

        let signal = sigen::Noise::new(0.9)
            .concat(2048, sigen::Sine::new(40, 0.1))
            .to_vec_quantized(8, 4096);
        let residual = encode_residual(&config::Prc::default(), &signal, 0);
        assert_eq!(residual.decode(), signal);
    }

    #[test]
    fn losslessness_subframe_coding() {
        let bits_per_sample = 8;
        let config = config::SubFrameCoding::default();
        let signal = sigen::Noise::new(0.4).to_vec_quantized(bits_per_sample, 64);
        let subframe = encode_subframe(&config, &signal, bits_per_sample as u8);
        assert_eq!(subframe.decode(), signal);

        let signal = sigen::Sine::new(40, 0.9).to_vec_quantized(bits_per_sample, 64);
        let subframe = encode_subframe(&config, &signal, bits_per_sample as u8);
        assert_eq!(subframe.decode(), signal);
    }

    #[test]
    fn wasted_bits_roundtrip() {
        let config = config::SubFrameCoding::default();
        let signal: Vec<i32> = sigen::Sine::new(129, 0.7)
            .to_vec_quantized(12, 256)
            .into_iter()
            .map(|x| x << 3)
            .collect();
        let subframe = encode_subframe(&config, &signal, 16);
        assert!(subframe.wasted_bits() >= 3);
        assert_eq!(subframe.decode(), signal);
    }

    #[test]
    fn encoding_zeros() {
        let stream_info = StreamInfo::new(88200, 1, 8).unwrap();
        let mut fb = FrameBuf::with_size(1, 64);
        fb.fill_from_interleaved(&[0; 64]);
        let frame =
            encode_fixed_size_frame(&config::Encoder::default(), &fb, 0, &stream_info).unwrap();
        frame.verify().unwrap();

        assert_eq!(frame.decode(), vec![0; 64]);
    }

    #[test]
    fn order_selector_bitcount() {
        let block_size = 256;
        let bits_per_sample = 16;
        let prc_config = config::Prc::default();
        let errors = [
            vec![255i32; block_size],
            vec![256i32; block_size],
            vec![128i32; block_size],
        ];
        let select_result = select_order_and_encode_residual(
            &config::OrderSel::BitCount,
            &prc_config,
            errors.iter().map(AsRef::as_ref).enumerate(),
            bits_per_sample,
            usize::MAX,
        );
        let (selected_order, residual) =
            select_result.expect("should be `Some` because baseline_bits == usize::MAX.");
        residual.verify().expect("should return a valid residual.");

        assert_eq!(selected_order, 0);
        let selected_count = residual.count_bits() + selected_order * bits_per_sample;

        for (order, err) in errors.iter().enumerate() {
            let ref_residual = encode_residual(&prc_config, err, order);
            let ref_count = ref_residual.count_bits() + bits_per_sample * order;
            assert!(
                ref_count >= selected_count,
                "should select the error sequence that minimizes the bit count."
            );
        }
    }

    #[test]
    fn order_selector_approxent() {
        let block_size = 256;
        let bits_per_sample = 16;
        let prc_config = config::Prc::default();
        let errors = [
            vec![255i32; block_size],
            vec![256i32; block_size],
            vec![128i32; block_size],
            vec![127i32; block_size],
        ];
        let select_result = select_order_and_encode_residual(
            &config::OrderSel::ApproxEnt { partitions: 32 },
            &prc_config,
            errors.iter().map(AsRef::as_ref).enumerate(),
            bits_per_sample,
            usize::MAX,
        );
        let (selected_order, residual) =
            select_result.expect("should be `Some` because baseline_bits == usize::MAX.");
        residual.verify().expect("should return a valid residual.");

        assert_eq!(selected_order, 2);
    }

    #[test]
    fn md5_invariance() {
        let channels = 2;
        let bits_per_sample = 24;
        let sample_rate = 16000;
        let block_size = 128;
        let constant: f32 = (23f64 / f64::from(1 << 23)) as f32;
        let signal_len = 1024;
        let signal =
            sigen::Dc::new(constant).to_vec_quantized(bits_per_sample, signal_len * channels);
        assert_eq!(signal[0], 23);
        let source = MemSource::from_samples(&signal, channels, bits_per_sample, sample_rate);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, block_size)
            .expect("Source read error");
        assert_eq!(
            stream.stream_info().md5_digest(),
            &[
                0xEE, 0x78, 0x7A, 0x6E, 0x99, 0x01, 0x36, 0x79, 0xA5, 0xBB, 0x6D, 0x5C, 0x10, 0xAF,
                0x0B, 0x87
            ]
        );
    }

    // Scenario: 4096 zero samples make a single CONSTANT(0) frame.
    #[test]
    fn silence_makes_single_constant_frame() {
        let signal = vec![0i32; 4096];
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, 4096)
            .expect("encode failed");
        assert_eq!(stream.frame_count(), 1);
        let frame = stream.frame(0).unwrap();
        assert_eq!(frame.subframe_count(), 1);
        match frame.subframe(0).unwrap() {
            SubFrame::Constant(c) => assert_eq!(c.dc_offset(), 0),
            other => panic!("expected a constant subframe, got {other:?}"),
        }
        assert_eq!(stream.stream_info().total_samples(), 4096);
    }

    // Scenario: an antisymmetric step signal has mid == 0, so a side
    // assignment must win over independent coding.
    #[test]
    fn step_signal_picks_side_coding() {
        let mut signal = vec![];
        for i in 0..1024i32 {
            signal.push(i % 256);
            signal.push(-(i % 256));
        }
        let source = MemSource::from_samples(&signal, 2, 16, 48000);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, 1024)
            .expect("encode failed");
        assert_eq!(stream.frame_count(), 1);
        let assignment = stream.frame(0).unwrap().header().channel_assignment();
        assert!(
            matches!(
                assignment,
                ChannelAssignment::MidSide | ChannelAssignment::RightSide
            ),
            "unexpected assignment {assignment:?}"
        );
        assert_eq!(decode_stream_interleaved(&stream), signal);
    }

    // Scenario: a pure tone must compress well below verbatim.
    #[test]
    fn sine_beats_verbatim_by_margin() {
        let signal: Vec<i32> = (0..2048)
            .map(|n| {
                (f64::sin(2.0 * std::f64::consts::PI * 100.0 * n as f64 / 44100.0) * 16000.0)
                    .round() as i32
            })
            .collect();
        let stream_info = StreamInfo::new(44100, 1, 16).unwrap();
        let mut fb = FrameBuf::with_size(1, 2048);
        fb.fill_from_interleaved(&signal);
        let frame =
            encode_fixed_size_frame(&config::Encoder::default(), &fb, 0, &stream_info).unwrap();
        let best_bits = frame.subframe(0).unwrap().count_bits();
        let verbatim_bits = Verbatim::count_bits_from_metadata(2048, 16, 0);
        assert!(
            (best_bits as f64) < 0.8 * verbatim_bits as f64,
            "prediction gained only {best_bits}/{verbatim_bits} bits"
        );
        assert_eq!(frame.decode(), signal);
    }

    // Scenario: random 24-bit stereo noise roundtrips bit-exactly and
    // the stored MD5 matches the input digest.
    #[test]
    fn random_noise_roundtrip() {
        let channels = 2;
        let signal = sigen::Noise::with_seed(0x5EED, 0.9).to_vec_quantized(24, 10000 * channels);
        let source = MemSource::from_samples(&signal, channels, 24, 44100);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, 4096)
            .expect("encode failed");
        assert_eq!(decode_stream_interleaved(&stream), signal);

        let mut ctx = Context::new(24, channels);
        ctx.update(&signal).unwrap();
        assert_eq!(stream.stream_info().md5_digest(), &ctx.md5_digest());
        assert_eq!(stream.stream_info().total_samples(), 10000);
    }

    #[test]
    fn partial_final_frame() {
        let signal = sigen::Sine::new(300, 0.4)
            .noise(0.1)
            .to_vec_quantized(16, 2500);
        let source = MemSource::from_samples(&signal, 1, 16, 32000);
        let stream = encode_with_fixed_block_size(&config::Encoder::default(), source, 1024)
            .expect("encode failed");
        assert_eq!(stream.frame_count(), 3);
        assert_eq!(stream.frame(2).unwrap().block_size(), 2500 - 2048);
        assert_eq!(stream.stream_info().min_block_size(), 452);
        assert_eq!(stream.stream_info().max_block_size(), 1024);
        assert_eq!(decode_stream_interleaved(&stream), signal);
    }

    #[test]
    fn loose_stereo_is_still_lossless() {
        let channels = 2;
        let mut config = config::Encoder::default();
        config.stereo_coding.loose = true;
        let signal = sigen::Sine::new(80, 0.5)
            .noise(0.05)
            .to_vec_quantized(16, 256 * 40 * channels);
        let source = MemSource::from_samples(&signal, channels, 16, 8000);
        let stream = encode_with_fixed_block_size(&config, source, 256).expect("encode failed");
        assert_eq!(stream.frame_count(), 40);
        assert_eq!(decode_stream_interleaved(&stream), signal);
    }

    #[test]
    fn verification_detects_a_mismatch() {
        let signal = sigen::Sine::new(100, 0.8)
            .noise(0.2)
            .to_vec_quantized(16, 1024);
        let stream_info = StreamInfo::new(44100, 1, 16).unwrap();
        let mut fb = FrameBuf::with_size(1, 1024);
        fb.fill_from_interleaved(&signal);
        let frame =
            encode_fixed_size_frame(&config::Encoder::default(), &fb, 0, &stream_info).unwrap();

        // verifying against different input must name the first
        // diverging sample.
        let mut tampered = signal.clone();
        tampered[123] ^= 1;
        fb.fill_from_interleaved(&tampered);
        let err = verify_frame(&frame, &fb, &stream_info, 0, 0).expect_err("must mismatch");
        match err {
            EncodeError::Verification(m) => {
                assert_eq!(m.sample, 123);
                assert_eq!(m.channel, 0);
                assert_eq!(m.expected, tampered[123]);
                assert_eq!(m.got, signal[123]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // and the untouched input passes.
        fb.fill_from_interleaved(&signal);
        verify_frame(&frame, &fb, &stream_info, 0, 0).expect("must verify");
    }

    #[test]
    fn verification_accepts_good_frames() {
        let mut config = config::Encoder::default();
        config.verify = true;
        let signal = sigen::Sine::new(100, 0.8)
            .noise(0.2)
            .to_vec_quantized(16, 8192);
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        encode_with_fixed_block_size(&config, source, 4096).expect("verification should pass");
    }

    #[test]
    fn exhaustive_lpc_order_search_is_lossless() {
        let mut config = config::Encoder::default();
        config.subframe_coding.qlpc.exhaustive_order_search = true;
        config.subframe_coding.qlpc.lpc_order = 12;
        let signal = sigen::Sine::new(50, 0.7)
            .noise(0.01)
            .to_vec_quantized(16, 4096);
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        let stream = encode_with_fixed_block_size(&config, source, 4096).expect("encode failed");
        assert_eq!(decode_stream_interleaved(&stream), signal);
    }

    #[test]
    fn subset_violations_are_rejected_before_encoding() {
        let signal = vec![0i32; 256];

        // non-enumerated block size
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        let err = encode_with_fixed_block_size(&config::Encoder::default(), source, 100)
            .expect_err("must be rejected");
        assert!(matches!(err, EncodeError::Config(_)));

        // non-enumerated sample rate
        let source = MemSource::from_samples(&signal, 1, 16, 44000);
        let err = encode_with_fixed_block_size(&config::Encoder::default(), source, 256)
            .expect_err("must be rejected");
        assert!(matches!(err, EncodeError::Config(_)));

        // disabling the subset admits both
        let mut config = config::Encoder::default();
        config.streamable_subset = false;
        let source = MemSource::from_samples(&signal, 1, 16, 44000);
        encode_with_fixed_block_size(&config, source, 100).expect("must be accepted");
    }

    #[test]
    fn seek_table_and_padding_are_emitted() {
        let mut config = config::Encoder::default();
        config.padding = Some(64);
        config.seek_point_interval = Some(4096);
        let signal = sigen::Noise::new(0.2).to_vec_quantized(16, 3 * 4096);
        let source = MemSource::from_samples(&signal, 1, 16, 44100);
        let stream = encode_with_fixed_block_size(&config, source, 4096).expect("encode failed");

        let table = stream.seek_table().expect("seek table must be present");
        assert_eq!(table.points().len(), 3);
        for (n, point) in table.points().iter().enumerate() {
            assert!(!point.is_placeholder());
            assert_eq!(point.sample_number, n as u64 * 4096);
            assert_eq!(point.frame_samples, 4096);
        }
        let mut offset = 0u64;
        for (n, frame) in stream.frames().iter().enumerate() {
            assert_eq!(table.points()[n].stream_offset, offset);
            offset += (frame.count_bits() / 8) as u64;
        }
    }
}
