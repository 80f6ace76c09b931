//! Dependency table and next-stage resolution.
//!
//! The resolver scans stages in priority order and stops at the first one
//! not yet completed. Priority order is authoritative: the resolver never
//! skips ahead to a later stage whose prerequisites happen to be met, and it
//! reports [`NextStage::Blocked`] instead of guessing when the earliest
//! incomplete stage is not runnable.

use crate::core::StageId;
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use crate::state::RunState;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Outcome of a resolver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStage {
    /// This stage is runnable.
    Run(StageId),
    /// Every stage is completed.
    Done,
    /// The earliest incomplete stage has unmet prerequisites.
    Blocked {
        /// The earliest incomplete stage.
        stage: StageId,
        /// Its prerequisites missing from `completed_stages`.
        missing: Vec<StageId>,
    },
}

/// Immutable stage order plus prerequisite sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTable {
    order: Vec<StageId>,
    prerequisites: BTreeMap<StageId, BTreeSet<StageId>>,
}

impl DependencyTable {
    /// The table of the deck workflow:
    ///
    /// ```text
    /// 0A: {}      0B: {}      1: {0A}
    /// 2: {1}      3: {0B, 2}  4: {3}
    /// 5: {4}      6: {3, 5}   7: {4, 6}
    /// ```
    #[must_use]
    pub fn standard() -> Self {
        Self {
            order: StageId::ALL.to_vec(),
            prerequisites: StageId::ALL
                .into_iter()
                .map(|stage| (stage, stage.prerequisites().iter().copied().collect()))
                .collect(),
        }
    }

    /// Builds a custom table.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage appears twice in `order`, a prerequisite
    /// is not itself part of `order` or does not come earlier, a stage
    /// depends on itself, or the prerequisites form a cycle.
    pub fn new(
        order: Vec<StageId>,
        prerequisites: impl IntoIterator<Item = (StageId, Vec<StageId>)>,
    ) -> Result<Self, PipelineValidationError> {
        let mut seen = HashSet::new();
        for stage in &order {
            if !seen.insert(*stage) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{stage}' appears more than once in the stage order"
                ))
                .with_stages(vec![*stage]));
            }
        }

        let mut table: BTreeMap<StageId, BTreeSet<StageId>> =
            order.iter().map(|s| (*s, BTreeSet::new())).collect();

        for (stage, deps) in prerequisites {
            let Some(entry) = table.get_mut(&stage) else {
                return Err(PipelineValidationError::new(format!(
                    "Prerequisites declared for '{stage}' which is not in the stage order"
                ))
                .with_stages(vec![stage]));
            };
            entry.extend(deps);
        }

        let built = Self {
            order,
            prerequisites: table,
        };
        built.validate()?;
        Ok(built)
    }

    /// Returns the priority order.
    #[must_use]
    pub fn order(&self) -> &[StageId] {
        &self.order
    }

    /// Returns the prerequisites of a stage.
    #[must_use]
    pub fn prerequisites(&self, stage: StageId) -> Vec<StageId> {
        self.prerequisites
            .get(&stage)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the stages that list `stage` as a prerequisite.
    #[must_use]
    pub fn dependents(&self, stage: StageId) -> Vec<StageId> {
        self.order
            .iter()
            .copied()
            .filter(|s| self.prerequisites.get(s).is_some_and(|deps| deps.contains(&stage)))
            .collect()
    }

    /// Returns the earliest stage in priority order not yet completed.
    #[must_use]
    pub fn first_incomplete(&self, state: &RunState) -> Option<StageId> {
        self.order
            .iter()
            .copied()
            .find(|stage| !state.is_completed(*stage))
    }

    /// Computes the next stage to run.
    ///
    /// Pure: only `completed_stages` is consulted. Terminal statuses are the
    /// caller's concern.
    #[must_use]
    pub fn next_stage(&self, state: &RunState) -> NextStage {
        let Some(stage) = self.first_incomplete(state) else {
            return NextStage::Done;
        };

        let missing: Vec<StageId> = self
            .prerequisites(stage)
            .into_iter()
            .filter(|dep| !state.is_completed(*dep))
            .collect();

        if missing.is_empty() {
            NextStage::Run(stage)
        } else {
            NextStage::Blocked { stage, missing }
        }
    }

    fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.order.is_empty() {
            return Err(PipelineValidationError::new("Dependency table has no stages")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot schedule an empty table")
                        .with_fix_hint("Add at least one stage to the stage order."),
                ));
        }

        for (stage, deps) in &self.prerequisites {
            if deps.contains(stage) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{stage}' cannot depend on itself"
                ))
                .with_stages(vec![*stage]));
            }
            for dep in deps {
                if !self.prerequisites.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{stage}' depends on unknown stage '{dep}'"
                    ))
                    .with_stages(vec![*stage, *dep])
                    .with_error_info(
                        ContractErrorInfo::new(
                            "CONTRACT-004-MISSING_DEP",
                            format!("Dependency '{dep}' not found"),
                        )
                        .with_fix_hint("Add the prerequisite to the stage order."),
                    ));
                }
            }
        }

        self.detect_cycles()?;

        // With a linear scan, a prerequisite ordered after its dependent
        // would block the run forever.
        for (position, stage) in self.order.iter().enumerate() {
            for dep in &self.prerequisites[stage] {
                let dep_position = self.order.iter().position(|s| s == dep).unwrap_or(usize::MAX);
                if dep_position > position {
                    return Err(PipelineValidationError::new(format!(
                        "Prerequisite '{dep}' is ordered after its dependent '{stage}'"
                    ))
                    .with_stages(vec![*stage, *dep])
                    .with_error_info(
                        ContractErrorInfo::new(
                            "CONTRACT-004-ORDER",
                            "Priority order is not a topological order",
                        )
                        .with_fix_hint("Move the prerequisite before the stages that need it."),
                    ));
                }
            }
        }

        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for stage in &self.order {
            if !visited.contains(stage) {
                if let Some(cycle) = self.dfs_cycle(*stage, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: StageId,
        visited: &mut HashSet<StageId>,
        rec_stack: &mut HashSet<StageId>,
        path: &mut Vec<StageId>,
    ) -> Option<Vec<StageId>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(deps) = self.prerequisites.get(&node) {
            for dep in deps {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(*dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(*dep);
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(&node);
        None
    }
}

impl Default for DependencyTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Resolves the next stage against the standard dependency table.
#[must_use]
pub fn next_stage(state: &RunState) -> NextStage {
    DependencyTable::standard().next_stage(state)
}
