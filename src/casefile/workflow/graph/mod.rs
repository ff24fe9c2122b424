// SPDX-License-Identifier: MIT

//! Task graph execution
//!
//! This module provides the validated task table, the resolver that turns a
//! request into waves and the scheduler that runs them.

pub mod executor;
pub mod resolver;
pub mod spec;

pub use executor::{
    DocumentContent, DocumentInput, FailurePolicy, NoopObserver, ProgressObserver, RunReport, RunRequest,
    Scheduler, SchedulerConfig, DOCUMENT_NAME, DOCUMENT_TEXT,
};
pub use resolver::{DependencyResolver, Wave};
pub use spec::{TaskSpec, TaskTable};
