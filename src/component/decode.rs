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

use super::super::constant::fixed::MAX_ORDER as MAX_FIXED_LPC_ORDER;
use super::super::rice;
use super::bitrepr::seal_bit_repr;

use super::datatype::ChannelAssignment;
use super::datatype::Constant;
use super::datatype::FixedLpc;
use super::datatype::Frame;
use super::datatype::Lpc;
use super::datatype::Residual;
use super::datatype::SubFrame;
use super::datatype::Verbatim;

/// Trait for components containing signals (represented in [`i32`]).
///
/// "Signal" has a slightly different meaning depending on the component
/// that implements this trait. For `Residual`, the signal is a
/// prediction-error signal. For `SubFrame`, it is a single channel's
/// samples, whereas for `Frame` it is the interleaved multi-channel
/// samples.
pub trait Decode: seal_bit_repr::Sealed {
    /// Decodes and copies the signal to the specified buffer.
    ///
    /// # Panics
    ///
    /// Implementations of this method panic when `dest` is not
    /// sufficiently long.
    fn copy_signal(&self, dest: &mut [i32]);

    /// Returns the number of elements in the decoded signal.
    fn signal_len(&self) -> usize;

    /// Returns the signal as a `Vec<i32>`.
    fn decode(&self) -> Vec<i32> {
        let mut ret = vec![0i32; self.signal_len()];
        self.copy_signal(&mut ret);
        ret
    }
}

/// Undoes channel decorrelation in place over per-channel buffers.
///
/// `channels[0]` and `channels[1]` hold the two decoded subframe
/// signals; on return they hold left and right.
pub(crate) fn decorrelate_channels(assignment: &ChannelAssignment, channels: &mut [Vec<i32>], block_size: usize) {
    match assignment {
        ChannelAssignment::Independent(_) => {}
        ChannelAssignment::LeftSide => {
            let (l, s) = channels.split_at_mut(1);
            for t in 0..block_size {
                s[0][t] = l[0][t] - s[0][t];
            }
        }
        ChannelAssignment::RightSide => {
            let (s, r) = channels.split_at_mut(1);
            for t in 0..block_size {
                s[0][t] += r[0][t];
            }
        }
        ChannelAssignment::MidSide => {
            let (m, s) = channels.split_at_mut(1);
            for t in 0..block_size {
                let side = s[0][t];
                let mid = (m[0][t] << 1) | (side & 0x01);
                m[0][t] = (mid + side) >> 1;
                s[0][t] = (mid - side) >> 1;
            }
        }
    }
}

impl Decode for Frame {
    fn signal_len(&self) -> usize {
        self.block_size() * self.subframe_count()
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        assert!(dest.len() >= self.signal_len());

        let mut channels = vec![];
        for sf in self.subframes() {
            channels.push(sf.decode());
        }

        decorrelate_channels(
            self.header().channel_assignment(),
            &mut channels,
            self.block_size(),
        );

        // interleave
        let channel_count = channels.len();
        for (ch, sig) in channels.iter().enumerate() {
            for (t, x) in sig.iter().enumerate() {
                dest[t * channel_count + ch] = *x;
            }
        }
    }
}

/// Restores wasted bits by shifting every decoded sample back up.
#[inline]
fn restore_wasted_bits(dest: &mut [i32], wasted_bits: usize) {
    if wasted_bits > 0 {
        for p in dest {
            *p <<= wasted_bits;
        }
    }
}

impl Decode for SubFrame {
    fn signal_len(&self) -> usize {
        match self {
            Self::Verbatim(c) => c.signal_len(),
            Self::Constant(c) => c.signal_len(),
            Self::FixedLpc(c) => c.signal_len(),
            Self::Lpc(c) => c.signal_len(),
        }
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        match self {
            Self::Verbatim(c) => c.copy_signal(dest),
            Self::Constant(c) => c.copy_signal(dest),
            Self::FixedLpc(c) => c.copy_signal(dest),
            Self::Lpc(c) => c.copy_signal(dest),
        }
    }
}

impl Decode for Constant {
    fn signal_len(&self) -> usize {
        self.block_size()
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        assert!(dest.len() >= self.block_size());
        dest[0..self.signal_len()].fill(self.dc_offset() << self.wasted_bits());
    }
}

impl Decode for Verbatim {
    fn signal_len(&self) -> usize {
        self.samples().len()
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        assert!(dest.len() >= self.signal_len());
        dest[0..self.signal_len()].copy_from_slice(self.samples());
        restore_wasted_bits(&mut dest[0..self.signal_len()], self.wasted_bits());
    }
}

/// Reconstructs the signal with a 32-bit prediction accumulator.
///
/// Exact whenever the products and their running sum stay within `i32`,
/// which is guaranteed for sample widths up to 16 with coefficient
/// precisions up to 16.
fn restore_lpc_narrow<T: Into<i32> + Copy>(
    coefs: &[T],
    shift: usize,
    signal_len: usize,
    dest: &mut [i32],
) {
    let order = coefs.len();
    for t in order..signal_len {
        let mut pred: i32 = 0;
        for (tau, w) in coefs.iter().enumerate() {
            pred += <T as Into<i32>>::into(*w) * dest[t - 1 - tau];
        }
        dest[t] += pred >> shift;
    }
}

/// Reconstructs the signal with a 64-bit prediction accumulator.
fn restore_lpc_wide<T: Into<i64> + Copy>(
    coefs: &[T],
    shift: usize,
    signal_len: usize,
    dest: &mut [i32],
) {
    let order = coefs.len();
    for t in order..signal_len {
        let mut pred: i64 = 0;
        for (tau, w) in coefs.iter().enumerate() {
            pred += <T as Into<i64>>::into(*w) * i64::from(dest[t - 1 - tau]);
        }
        dest[t] += (pred >> shift) as i32;
    }
}

/// Common utility function for decoding both `FixedLpc` and `Lpc`.
///
/// Two reconstruction paths are provided, differing only in the
/// accumulator width: the 32-bit one is used when both the samples and
/// the coefficients are known to be narrow.
fn decode_lpc(
    warm_up: &[i32],
    coefs: &[i16],
    shift: usize,
    bits_per_sample: usize,
    residual: &Residual,
    dest: &mut [i32],
) {
    residual.copy_signal(dest);
    dest[..warm_up.len()].copy_from_slice(warm_up);

    let coef_width = coefs
        .iter()
        .map(|c| 16 - (if *c < 0 { !*c } else { *c }).leading_zeros() as usize + 1)
        .max()
        .unwrap_or(1);
    let order_bits = (usize::BITS - coefs.len().leading_zeros()) as usize;
    // The sum of `order` products of `bps`-bit samples and
    // `coef_width`-bit coefficients must stay within `i32`.
    if bits_per_sample + coef_width + order_bits <= 31 {
        restore_lpc_narrow(coefs, shift, residual.signal_len(), dest);
    } else {
        restore_lpc_wide(coefs, shift, residual.signal_len(), dest);
    }
}

pub(crate) const FIXED_LPC_COEFS: [[i16; MAX_FIXED_LPC_ORDER]; MAX_FIXED_LPC_ORDER + 1] = [
    [0, 0, 0, 0],
    [1, 0, 0, 0],
    [2, -1, 0, 0],
    [3, -3, 1, 0],
    [4, -6, 4, -1],
];

impl Decode for FixedLpc {
    fn signal_len(&self) -> usize {
        self.residual().signal_len()
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        let order = self.order();
        decode_lpc(
            self.warm_up(),
            &FIXED_LPC_COEFS[order][0..order],
            0usize,
            self.bits_per_sample(),
            self.residual(),
            dest,
        );
        restore_wasted_bits(&mut dest[0..self.signal_len()], self.wasted_bits());
    }
}

impl Decode for Lpc {
    fn signal_len(&self) -> usize {
        self.residual().signal_len()
    }

    fn copy_signal(&self, dest: &mut [i32]) {
        decode_lpc(
            self.warm_up(),
            self.parameters().coefs(),
            self.parameters().shift() as usize,
            self.bits_per_sample(),
            self.residual(),
            dest,
        );
        restore_wasted_bits(&mut dest[0..self.signal_len()], self.wasted_bits());
    }
}

impl Decode for Residual {
    fn signal_len(&self) -> usize {
        self.block_size()
    }

    #[allow(clippy::needless_range_loop)]
    fn copy_signal(&self, dest: &mut [i32]) {
        assert!(dest.len() >= self.signal_len());

        let part_len = self.block_size() >> self.partition_order();
        assert!(part_len > 0);

        for t in 0..self.block_size() {
            let part = t / part_len;
            dest[t] = if self.escape_bits()[part] != 0 {
                rice::decode_signbit(self.remainders()[t])
            } else {
                rice::decode_signbit(
                    (self.quotients()[t] << self.rice_params()[part]) + self.remainders()[t],
                )
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FrameHeader;
    use crate::component::FrameOffset;

    #[test]
    fn decoding_fixed_lpc_orders() {
        // second-order: y[n] = 2 y[n-1] - y[n-2] + r[n]
        let residual = Residual::from_parts(
            0,
            8,
            2,
            vec![1],
            vec![0, 0, 1, 0, 1, 0, 1, 0],
            vec![0, 0, 0, 1, 0, 1, 0, 1],
        );
        let warm_up = heapless::Vec::from_slice(&[0, 3]).unwrap();
        let subframe = FixedLpc::from_parts(warm_up, residual, 16, 0);
        // residuals decoded: [_, _, 1, -1, 1, -1, 1, -1]
        let expect = [0, 3, 7, 10, 14, 17, 21, 24];
        assert_eq!(subframe.decode(), expect);
    }

    #[test]
    fn decoding_constant_with_wasted_bits() {
        let subframe = Constant::from_parts(4, 3, 13, 3);
        assert_eq!(subframe.decode(), vec![24, 24, 24, 24]);
    }

    #[test]
    fn narrow_and_wide_lpc_paths_agree() {
        let coefs: Vec<i16> = vec![205, -102, 51, -26];
        let warm_up = [12, -45, 300, -4096];
        let residuals: Vec<i32> = (0..64).map(|t| (t % 13) - 6).collect();
        let quotients: Vec<u32> = residuals
            .iter()
            .map(|&r| crate::rice::encode_signbit(r))
            .collect();
        let residual = Residual::from_parts(0, 64, 4, vec![0], quotients, vec![0u32; 64]);

        let mut narrow = vec![0i32; 64];
        residual.copy_signal(&mut narrow);
        narrow[..4].copy_from_slice(&warm_up);
        let mut wide = narrow.clone();
        restore_lpc_narrow(&coefs, 8, 64, &mut narrow);
        restore_lpc_wide(&coefs, 8, 64, &mut wide);
        assert_eq!(narrow, wide);
    }

    #[test]
    fn mid_side_reconstruction() {
        // l = 5, r = 2 -> mid = 3, side = 3 (odd sum keeps its low bit
        // in the side channel).
        let mut channels = vec![vec![3, -2, -1], vec![3, -3, 7]];
        decorrelate_channels(&ChannelAssignment::MidSide, &mut channels, 3);
        assert_eq!(channels[0], vec![5, -3, 3]);
        assert_eq!(channels[1], vec![2, 0, -4]);
    }

    #[test]
    fn left_and_right_side_reconstruction() {
        let mut channels = vec![vec![5, -1], vec![3, -4]];
        decorrelate_channels(&ChannelAssignment::LeftSide, &mut channels, 2);
        assert_eq!(channels[0], vec![5, -1]);
        assert_eq!(channels[1], vec![2, 3]);

        let mut channels = vec![vec![3, -4], vec![2, 3]];
        decorrelate_channels(&ChannelAssignment::RightSide, &mut channels, 2);
        assert_eq!(channels[0], vec![5, -1]);
        assert_eq!(channels[1], vec![2, 3]);
    }

    #[test]
    fn frame_decode_interleaves() {
        let header = FrameHeader::new(
            4,
            ChannelAssignment::Independent(2),
            8,
            8000,
            FrameOffset::Frame(0),
        )
        .unwrap();
        let mut frame = Frame::with_capacity(header);
        frame.add_subframe(Constant::from_parts(4, 1, 8, 0).into());
        frame.add_subframe(Constant::from_parts(4, -1, 8, 0).into());
        assert_eq!(frame.decode(), vec![1, -1, 1, -1, 1, -1, 1, -1]);
    }
}
