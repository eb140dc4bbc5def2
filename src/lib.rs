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

#![doc = include_str!("../README.md")]
#![warn(clippy::all, clippy::pedantic)]
// Some of clippy::pedantic rules are actually useful, so use it with a
// lot of ad-hoc exceptions.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::uninlined_format_args
)]
// Some from the restriction lint-group.
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::dbg_macro,
    clippy::exit,
    clippy::lossy_float_literal,
    clippy::print_stdout,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::string_add,
    clippy::try_err,
    clippy::unnecessary_self_imports
)]

pub mod bitsink;
pub(crate) mod coding;
pub mod component;
pub mod config;
pub mod constant;
pub mod decoder;
pub mod error;
pub(crate) mod lpc;
mod reuse;
pub(crate) mod rice;
pub mod seek;
pub mod sigen;
pub mod source;

#[cfg(test)]
pub mod test_helper;

// global entry points of the encoder side.
pub use coding::encode_fixed_size_frame;
pub use coding::encode_with_fixed_block_size;
