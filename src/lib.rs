// SPDX-License-Identifier: MIT

pub mod backend;
pub mod casefile;
