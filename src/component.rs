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

//! Components of the compressed stream and their representations.

mod bitrepr;
mod datatype;
mod decode;
pub mod parser;
mod verify;

pub use bitrepr::*;
pub use datatype::*;
pub use decode::*;

pub(crate) use decode::decorrelate_channels;
