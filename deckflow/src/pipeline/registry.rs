//! Immutable stage registry.

use super::resolver::DependencyTable;
use crate::core::StageId;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::stages::StageHandler;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handlers for every scheduled stage plus the dependency table.
///
/// Built once and shared by `Arc` between run loops.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    handlers: BTreeMap<StageId, Arc<dyn StageHandler>>,
    table: DependencyTable,
}

impl StageRegistry {
    /// Starts a registry over the standard dependency table.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    /// Returns the handler for a stage.
    #[must_use]
    pub fn handler(&self, stage: StageId) -> Option<&Arc<dyn StageHandler>> {
        self.handlers.get(&stage)
    }

    /// Returns the dependency table.
    #[must_use]
    pub fn table(&self) -> &DependencyTable {
        &self.table
    }

    /// Returns the registered stages in priority order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageId> {
        self.table
            .order()
            .iter()
            .copied()
            .filter(|s| self.handlers.contains_key(s))
            .collect()
    }
}

/// Builder for [`StageRegistry`].
#[derive(Debug, Clone)]
pub struct StageRegistryBuilder {
    handlers: BTreeMap<StageId, Arc<dyn StageHandler>>,
    table: DependencyTable,
}

impl Default for StageRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistryBuilder {
    /// Creates an empty builder over the standard table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            table: DependencyTable::standard(),
        }
    }

    /// Replaces the dependency table.
    #[must_use]
    pub fn with_table(mut self, table: DependencyTable) -> Self {
        self.table = table;
        self
    }

    /// Registers a handler under the stage it reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage already has a handler.
    pub fn handler(
        mut self,
        handler: Arc<dyn StageHandler>,
    ) -> Result<Self, PipelineValidationError> {
        let stage = handler.stage();
        if self.handlers.contains_key(&stage) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{stage}' already has a handler"
            ))
            .with_stages(vec![stage])
            .with_error_info(
                ContractErrorInfo::new(
                    "CONTRACT-004-CONFLICT",
                    format!("Duplicate handler for '{stage}'"),
                )
                .with_fix_hint("Register exactly one handler per stage."),
            ));
        }
        self.handlers.insert(stage, handler);
        Ok(self)
    }

    /// Validates and freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage in the table has no handler.
    pub fn build(self) -> Result<StageRegistry, PipelineValidationError> {
        let missing: Vec<StageId> = self
            .table
            .order()
            .iter()
            .copied()
            .filter(|s| !self.handlers.contains_key(s))
            .collect();

        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(StageId::as_str).collect();
            return Err(PipelineValidationError::new(format!(
                "No handler registered for: {}",
                names.join(", ")
            ))
            .with_stages(missing)
            .with_error_info(
                ContractErrorInfo::new("CONTRACT-004-MISSING_HANDLER", "Registry is incomplete")
                    .with_fix_hint("Register a handler for every stage in the dependency table."),
            ));
        }

        Ok(StageRegistry {
            handlers: self.handlers,
            table: self.table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;

    #[test]
    fn test_complete_registry_builds() {
        let mut builder = StageRegistry::builder();
        for stage in StageId::ALL {
            builder = builder.handler(Arc::new(RecordingHandler::new(stage))).unwrap();
        }
        let registry = builder.build().unwrap();

        assert_eq!(registry.stages(), StageId::ALL.to_vec());
        assert_eq!(registry.handler(StageId::Outline).map(|h| h.stage()), Some(StageId::Outline));
    }

    #[test]
    fn test_missing_handlers_reported() {
        let err = StageRegistry::builder()
            .handler(Arc::new(RecordingHandler::new(StageId::TemplateIntake)))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.stages.len(), 8);
        assert!(err.message.contains("stage0b_source_intake"));
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let err = StageRegistry::builder()
            .handler(Arc::new(RecordingHandler::new(StageId::Extract)))
            .unwrap()
            .handler(Arc::new(RecordingHandler::new(StageId::Extract)))
            .unwrap_err();

        assert_eq!(err.stages, vec![StageId::Extract]);
    }

    #[test]
    fn test_custom_table_needs_only_its_stages() {
        let table = DependencyTable::new(
            vec![StageId::TemplateIntake, StageId::Extract],
            vec![(StageId::Extract, vec![StageId::TemplateIntake])],
        )
        .unwrap();

        let registry = StageRegistry::builder()
            .with_table(table)
            .handler(Arc::new(RecordingHandler::new(StageId::TemplateIntake)))
            .unwrap()
            .handler(Arc::new(RecordingHandler::new(StageId::Extract)))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(registry.stages().len(), 2);
    }
}
