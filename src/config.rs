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

//! Encoder configuration structs.

use serde::Deserialize;
use serde::Serialize;

use super::constant;
use super::constant::qlpc::DEFAULT_ORDER as QLPC_DEFAULT_ORDER;
use super::constant::qlpc::DEFAULT_PRECISION as QLPC_DEFAULT_PRECISION;
use super::error::verify_range;
use super::error::verify_true;
use super::error::Verify;
use super::error::VerifyError;

pub use super::lpc::Window;

/// Configuration for the encoder.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Encoder {
    /// Block size in inter-channel samples.
    ///
    /// The encoder always emits fixed-blocksize streams; only the last
    /// frame may be shorter.
    pub block_size: usize,
    /// If set, restrict block sizes, sample rates and sample sizes to
    /// the values any decoder can resume from without STREAMINFO.
    pub streamable_subset: bool,
    /// If set, append a PADDING block of this many zero bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub padding: Option<usize>,
    /// If set, build a SEEKTABLE with one point per this many samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_point_interval: Option<usize>,
    /// If set, parse back every emitted frame and compare it with the
    /// input before accepting it.
    pub verify: bool,
    /// Configuration for the stereo-coding module.
    pub stereo_coding: StereoCoding,
    /// Configuration for individual channels.
    pub subframe_coding: SubFrameCoding,
}

impl Default for Encoder {
    fn default() -> Self {
        Self {
            block_size: 4096,
            streamable_subset: true,
            padding: None,
            seek_point_interval: None,
            verify: false,
            stereo_coding: StereoCoding::default(),
            subframe_coding: SubFrameCoding::default(),
        }
    }
}

impl Verify for Encoder {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_range!(
            "block_size",
            self.block_size,
            (constant::MIN_BLOCK_SIZE)..=(constant::MAX_BLOCK_SIZE)
        )?;
        verify_true!(
            "block_size",
            self.block_size > self.subframe_coding.qlpc.lpc_order,
            "must be greater than the configured LPC order"
        )?;
        self.stereo_coding
            .verify()
            .map_err(|e| e.within("stereo_coding"))?;
        self.subframe_coding
            .verify()
            .map_err(|e| e.within("subframe_coding"))
    }
}

/// Configuration for stereo coding algorithms.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct StereoCoding {
    /// If set to false, left-side coding will not be used.
    pub use_leftside: bool,
    /// If set to false, right-side coding will not be used.
    pub use_rightside: bool,
    /// If set to false, mid-side coding will not be used.
    pub use_midside: bool,
    /// If set, the winning channel assignment is kept for roughly 0.4
    /// seconds worth of frames before it is re-evaluated.
    pub loose: bool,
}

impl Default for StereoCoding {
    fn default() -> Self {
        Self {
            use_leftside: true,
            use_rightside: true,
            use_midside: true,
            loose: false,
        }
    }
}

impl Verify for StereoCoding {
    fn verify(&self) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Configuration for sub-frame (individual channel) coding.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct SubFrameCoding {
    // Disabling verbatim coding is intentionally prohibited.
    /// If set to false, constant mode will not be used.
    pub use_constant: bool,
    /// If set to false, fixed-LPC mode will not be used.
    pub use_fixed: bool,
    /// If set to false, LPC mode will not be used.
    pub use_lpc: bool,
    /// If set to false, trailing zero bits shared by all samples are
    /// not factored out.
    pub use_wasted_bits: bool,
    /// Configuration for fixed-predictor coding.
    pub fixed: Fixed,
    /// Configuration for the quantized LPC encoder.
    pub qlpc: Qlpc,
    /// Configuration for partitioned Rice coding.
    pub prc: Prc,
}

impl Default for SubFrameCoding {
    fn default() -> Self {
        Self {
            use_constant: true,
            use_fixed: true,
            use_lpc: true,
            use_wasted_bits: true,
            fixed: Fixed::default(),
            qlpc: Qlpc::default(),
            prc: Prc::default(),
        }
    }
}

impl Verify for SubFrameCoding {
    fn verify(&self) -> Result<(), VerifyError> {
        self.fixed.verify().map_err(|e| e.within("fixed"))?;
        self.qlpc.verify().map_err(|e| e.within("qlpc"))?;
        self.prc.verify().map_err(|e| e.within("prc"))
    }
}

/// Order-selection strategy for predictor-based subframes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum OrderSel {
    /// Exhaustive search: every order is fully coded and the smallest
    /// result wins.
    BitCount,
    /// Pick the order from an entropy estimate over the residual,
    /// averaged over this many partitions.
    ApproxEnt { partitions: usize },
}

impl Default for OrderSel {
    fn default() -> Self {
        Self::ApproxEnt { partitions: 4 }
    }
}

/// Configuration for fixed-predictor coding.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Fixed {
    /// Maximum order of the fixed predictors tried.
    pub max_order: usize,
    /// Order-selection strategy.
    pub order_sel: OrderSel,
}

impl Default for Fixed {
    fn default() -> Self {
        Self {
            max_order: constant::fixed::MAX_ORDER,
            order_sel: OrderSel::default(),
        }
    }
}

impl Verify for Fixed {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_range!("max_order", self.max_order, ..=(constant::fixed::MAX_ORDER))?;
        if let OrderSel::ApproxEnt { partitions } = self.order_sel {
            verify_range!("order_sel.partitions", partitions, 1..)?;
        }
        Ok(())
    }
}

/// Configuration for quantized linear-predictive coding (QLPC).
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Qlpc {
    /// Maximum LPC order.
    pub lpc_order: usize,
    /// Precision for quantized LPC coefficients.
    pub quant_precision: usize,
    /// If set, every order up to `lpc_order` is fully coded and
    /// compared; otherwise the order is picked from the per-order
    /// prediction errors of the Levinson-Durbin recursion.
    pub exhaustive_order_search: bool,
    /// Window function used for LPC estimation.
    pub window: Window,
}

impl Default for Qlpc {
    fn default() -> Self {
        Self {
            lpc_order: QLPC_DEFAULT_ORDER,
            quant_precision: QLPC_DEFAULT_PRECISION,
            exhaustive_order_search: false,
            window: Window::default(),
        }
    }
}

impl Verify for Qlpc {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_range!("lpc_order", self.lpc_order, 1..=(constant::qlpc::MAX_ORDER))?;
        verify_range!(
            "quant_precision",
            self.quant_precision,
            4..=(constant::qlpc::MAX_PRECISION)
        )
    }
}

/// Configuration for partitioned Rice coding (PRC).
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Prc {
    /// Max value for the Rice coding parameter.
    pub max_parameter: usize,
}

impl Default for Prc {
    fn default() -> Self {
        Self {
            max_parameter: constant::rice::MAX_PARAMETER,
        }
    }
}

impl Verify for Prc {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_range!(
            "max_parameter",
            self.max_parameter,
            ..=(constant::rice::MAX_PARAMETER)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization() {
        let config = Encoder::default();
        assert!(toml::to_string(&config).is_ok());
    }

    #[test]
    fn deserialization() {
        let src = "
[subframe_coding.qlpc]
lpc_order = 7
";
        let config: Encoder = toml::from_str(src).expect("Parse error.");
        assert_eq!(config.subframe_coding.qlpc.lpc_order, 7);
        assert_eq!(
            config.subframe_coding.qlpc.quant_precision,
            QLPC_DEFAULT_PRECISION
        );

        // Check the rest is default.
        assert_eq!(config.block_size, 4096);
        assert!(config.subframe_coding.use_lpc);
    }

    #[test]
    fn if_empty_source_yields_default_config() {
        let empty_src = "";
        let config: Encoder = toml::from_str(empty_src).expect("Parse error.");
        let default_config: Encoder = Encoder::default();
        assert_eq!(
            toml::to_string(&config).unwrap(),
            toml::to_string(&default_config).unwrap()
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = Encoder::default();
        config.subframe_coding.prc.max_parameter = 256;
        assert!(config.verify().is_err());

        let mut config = Encoder::default();
        config.block_size = 4;
        assert!(config.verify().is_err());

        let mut config = Encoder::default();
        config.subframe_coding.qlpc.lpc_order = 64;
        assert!(config.verify().is_err());
    }
}
