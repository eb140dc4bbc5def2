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

//! Format constants.

/// The four-byte magic word at the head of every stream.
pub const STREAM_SYNC: [u8; 4] = [0x66, 0x4C, 0x61, 0x43]; // "fLaC"

/// Minimum block size accepted by the encoder.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Maximum block size representable in the format.
pub const MAX_BLOCK_SIZE: usize = 65535;

/// Maximum number of channels.
pub const MAX_CHANNELS: usize = 8;

/// Minimum bits-per-sample.
pub const MIN_BITS_PER_SAMPLE: usize = 4;

/// Maximum bits-per-sample.
pub const MAX_BITS_PER_SAMPLE: usize = 32;

/// Maximum sample rate representable in the 20-bit STREAMINFO field.
pub const MAX_SAMPLE_RATE: usize = 655_350;

/// Maximum sample count representable in the 36-bit STREAMINFO field.
pub const MAX_TOTAL_SAMPLES: u64 = (1u64 << 36) - 1;

/// Constants for quantized linear-predictive coding (QLPC).
pub mod qlpc {
    /// Maximum LPC order supported by the format.
    pub const MAX_ORDER: usize = 32;

    /// Maximum precision for storing quantized coefficients.
    ///
    /// The 4-bit field can indicate up to 16 bits, but the quantizer
    /// never needs the last one and `i16` coefficient storage stays
    /// comfortable at 15.
    pub const MAX_PRECISION: usize = 15;

    /// The number of bits used for the shift (quantization level) field.
    pub const SHIFT_BITS: usize = 5;

    /// Maximum shift representable in the 5-bit signed field.
    pub const MAX_SHIFT: i8 = (1i8 << (SHIFT_BITS - 1)) - 1;

    /// Minimum shift emitted by the encoder.
    ///
    /// The format allows negative shifts but reference decoders do not
    /// accept them, so the quantizer refuses to go below zero.
    pub const MIN_SHIFT: i8 = 0;

    /// Default LPC order.
    pub const DEFAULT_ORDER: usize = 8;

    /// Default precision for quantized coefficients.
    pub const DEFAULT_PRECISION: usize = 12;
}

/// Constants for the fixed (polynomial) predictors.
pub mod fixed {
    /// Maximum order of the fixed predictors.
    pub const MAX_ORDER: usize = 4;
}

/// Constants for partitioned Rice coding (PRC).
pub mod rice {
    /// Maximum Rice parameter emitted with 4-bit parameter fields.
    ///
    /// `0b1111` is the escape code, so 14 is the largest usable value.
    pub const MAX_PARAMETER: usize = 14;

    /// Escape code in the 4-bit parameter field.
    pub const ESCAPE_4BIT: u8 = 0x0F;

    /// Escape code in the 5-bit parameter field.
    pub const ESCAPE_5BIT: u8 = 0x1F;

    /// Maximum Rice parameter readable from 5-bit parameter fields.
    pub const MAX_PARAMETER_5BIT: usize = 30;

    /// Maximum partition order (inclusive).
    pub const MAX_PARTITION_ORDER: usize = 15;

    /// Maximum number of partitions (exclusive).
    pub const MAX_PARTITIONS: usize = 1usize << MAX_PARTITION_ORDER;

    /// Minimum partition size targeted by the partition-order search.
    ///
    /// The format allows down to 1; very small partitions only add
    /// parameter overhead, and no gain was observed below this value.
    pub const MIN_PARTITION_SIZE: usize = 64;
}

/// Messages for panics that indicate an internal bug.
pub mod panic_msg {
    pub const DATA_INCONSISTENT: &str =
        "INTERNAL ERROR: data inconsistency detected. Please file a bug.";
    pub const ERROR_NOT_EXPECTED: &str =
        "INTERNAL ERROR: this operation should not be able to fail here.";
    pub const STREAM_INFO_MISSING: &str =
        "INTERNAL ERROR: stream info must be parsed before this operation.";
}
