// SPDX-License-Identifier: MIT

pub mod app;
pub mod config;
pub mod jobs;
pub mod server;
pub mod tasks;
pub mod workflow;
