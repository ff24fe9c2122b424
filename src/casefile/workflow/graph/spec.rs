// SPDX-License-Identifier: MIT

//! Declarative task table
//!
//! A [`TaskTable`] is the validated set of [`TaskSpec`]s the resolver and
//! scheduler work from. Declaration order is preserved and used as the
//! deterministic order inside a wave.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::backend::error::PipelineError;
use crate::casefile::workflow::types::PipelineDefinition;

/// Identity and data contract of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Fields that must be present before the task may run
    pub requires: Vec<String>,
    /// Fields the task writes; no other task writes them
    pub produces: Vec<String>,
    /// Tasks that must complete first
    pub prerequisites: Vec<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            produces: Vec::new(),
            prerequisites: Vec::new(),
        }
    }

    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn produces<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn after<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = tasks.into_iter().map(Into::into).collect();
        self
    }
}

/// Validated, immutable set of task specs
#[derive(Debug, Clone)]
pub struct TaskTable {
    specs: Vec<TaskSpec>,
    index: HashMap<String, usize>,
    fixed: Vec<String>,
}

impl TaskTable {
    /// Validate and build a table.
    ///
    /// Rejects duplicate names, unknown prerequisites or fixed tasks,
    /// dependency cycles and fields claimed by more than one task.
    pub fn new(specs: Vec<TaskSpec>, fixed: Vec<String>) -> Result<Self, PipelineError> {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(PipelineError::DuplicateTask(spec.name.clone()));
            }
        }

        for spec in &specs {
            for prerequisite in &spec.prerequisites {
                if !index.contains_key(prerequisite) {
                    return Err(PipelineError::UnknownPrerequisite {
                        task: spec.name.clone(),
                        prerequisite: prerequisite.clone(),
                    });
                }
            }
        }

        for name in &fixed {
            if !index.contains_key(name) {
                return Err(PipelineError::UnknownTask(name.clone()));
            }
        }

        let mut producers: HashMap<&str, &str> = HashMap::new();
        for spec in &specs {
            for field in &spec.produces {
                if let Some(first) = producers.insert(field, &spec.name) {
                    return Err(PipelineError::FieldProducedTwice {
                        field: field.clone(),
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }

        let table = Self {
            specs,
            index,
            fixed,
        };
        table.check_acyclic()?;
        Ok(table)
    }

    /// Build the table for a pipeline definition
    pub fn from_definition(def: &PipelineDefinition) -> Result<Self, PipelineError> {
        let specs = def
            .tasks
            .iter()
            .map(|t| TaskSpec {
                name: t.name.clone(),
                requires: t.requires.clone(),
                produces: t.produces.clone(),
                prerequisites: t.depends_on.to_vec(),
            })
            .collect();
        Self::new(specs, def.fixed.clone())
    }

    fn check_acyclic(&self) -> Result<(), PipelineError> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks = vec![0u8; self.specs.len()];
        let mut path = Vec::new();

        for start in 0..self.specs.len() {
            self.visit(start, &mut marks, &mut path)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [u8],
        path: &mut Vec<usize>,
    ) -> Result<(), PipelineError> {
        match marks[node] {
            2 => return Ok(()),
            1 => {
                let from = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[from..]
                    .iter()
                    .map(|n| self.specs[*n].name.clone())
                    .collect();
                cycle.push(self.specs[node].name.clone());
                return Err(PipelineError::CircularDependency(cycle));
            }
            _ => {}
        }

        marks[node] = 1;
        path.push(node);
        for prerequisite in &self.specs[node].prerequisites {
            if let Some(&next) = self.index.get(prerequisite) {
                self.visit(next, marks, path)?;
            }
        }
        path.pop();
        marks[node] = 2;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.index.get(name).map(|i| &self.specs[*i])
    }

    /// Declaration position, used to order tasks inside a wave
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    /// Tasks added to every request
    pub fn fixed(&self) -> &[String] {
        &self.fixed
    }

    /// The task that writes `field`, if any
    pub fn producer_of(&self, field: &str) -> Option<&TaskSpec> {
        self.specs
            .iter()
            .find(|s| s.produces.iter().any(|f| f == field))
    }

    /// Every produced field, in declaration order
    pub fn produced_fields(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.specs
            .iter()
            .flat_map(|s| s.produces.iter())
            .filter(|f| seen.insert(f.as_str()))
            .map(String::as_str)
            .collect()
    }
}
