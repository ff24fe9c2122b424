// SPDX-License-Identifier: MIT

pub mod builder;
pub mod graph;
pub mod loader;
pub mod registry;
pub mod state;
pub mod task;
pub mod types;
