// SPDX-License-Identifier: MIT

//! Dependency resolution into waves
//!
//! The requested set is closed over prerequisites (transitively), then each
//! task is placed at `level = 1 + max(level of its prerequisites)`, tasks
//! without prerequisites at level 0. Every level is one wave; inside a wave
//! tasks keep table declaration order.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::spec::TaskTable;
use crate::backend::error::PipelineError;

/// Tasks that may run concurrently
pub type Wave = Vec<String>;

pub struct DependencyResolver;

impl DependencyResolver {
    /// Split `requested` into ordered waves.
    ///
    /// Prerequisites are pulled in even when not requested, and every task
    /// appears exactly once however often it is named.
    pub fn resolve<S: AsRef<str>>(
        requested: &[S],
        table: &TaskTable,
    ) -> Result<Vec<Wave>, PipelineError> {
        let mut closure: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for name in requested {
            let spec = table
                .get(name.as_ref())
                .ok_or_else(|| PipelineError::UnknownTask(name.as_ref().to_string()))?;
            stack.push(spec.name.as_str());
        }

        while let Some(name) = stack.pop() {
            if !closure.insert(name) {
                continue;
            }
            if let Some(spec) = table.get(name) {
                stack.extend(spec.prerequisites.iter().map(String::as_str));
            }
        }

        let mut levels: HashMap<&str, usize> = HashMap::new();
        for name in &closure {
            Self::level(name, table, &mut levels);
        }

        let mut by_level: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for (name, level) in levels {
            by_level.entry(level).or_default().push(name);
        }

        Ok(by_level
            .into_values()
            .map(|mut names| {
                names.sort_by_key(|n| table.position(n).unwrap_or(usize::MAX));
                names.into_iter().map(str::to_string).collect()
            })
            .collect())
    }

    /// Cycles are rejected when the table is built, so this terminates
    fn level<'a>(name: &'a str, table: &'a TaskTable, memo: &mut HashMap<&'a str, usize>) -> usize {
        if let Some(level) = memo.get(name) {
            return *level;
        }
        let level = match table.get(name) {
            Some(spec) if !spec.prerequisites.is_empty() => {
                1 + spec
                    .prerequisites
                    .iter()
                    .map(|p| Self::level(p, table, memo))
                    .max()
                    .unwrap_or(0)
            }
            _ => 0,
        };
        memo.insert(name, level);
        level
    }
}
