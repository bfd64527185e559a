//! Tool catalog: the operations the selector may propose and how each maps
//! onto the AAS.

use std::collections::HashMap;

use twin_client::OperationRef;
use twin_primitives::{RiskLevel, ToolSchema};

/// One catalog entry: the schema shown to the selector plus the operation
/// reference the invoker needs.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    schema: ToolSchema,
    operation: OperationRef,
}

impl CatalogEntry {
    /// Creates an entry binding a schema to its AAS operation.
    #[must_use]
    pub const fn new(schema: ToolSchema, operation: OperationRef) -> Self {
        Self { schema, operation }
    }

    /// Returns the selector-facing schema.
    #[must_use]
    pub const fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    /// Returns the AAS operation reference.
    #[must_use]
    pub const fn operation(&self) -> &OperationRef {
        &self.operation
    }
}

/// Immutable catalog assembled at startup.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Builds a catalog; later entries shadow earlier ones with the same
    /// name.
    #[must_use]
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.schema.name().to_owned(), position))
            .collect();
        Self { entries, index }
    }

    /// Returns the entry for the named tool.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.index.get(name).map(|position| &self.entries[*position])
    }

    /// Returns the schemas in catalog order, for the selector context.
    #[must_use]
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.entries.iter().map(|entry| entry.schema.clone()).collect()
    }

    /// Returns the schema risk hint for the named tool.
    #[must_use]
    pub fn risk_hint(&self, name: &str) -> Option<RiskLevel> {
        self.get(name).and_then(|entry| entry.schema.risk())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new(vec![
            CatalogEntry::new(
                ToolSchema::new("GetStatus", "Read pump status", json!({"type": "object"})),
                OperationRef::direct("StatusData", "GetStatus"),
            ),
            CatalogEntry::new(
                ToolSchema::new("StartPump", "Start the pump", json!({"type": "object"}))
                    .with_risk(RiskLevel::High),
                OperationRef::direct("Control", "StartPump"),
            ),
            CatalogEntry::new(
                ToolSchema::new("Calibrate", "Run calibration", json!({"type": "object"}))
                    .delegated(),
                OperationRef::delegated("Maintenance", "Calibrate"),
            ),
        ])
    }

    #[test]
    fn lookups_resolve_operations() {
        let catalog = catalog();
        let entry = catalog.get("StartPump").unwrap();
        assert_eq!(entry.operation().submodel(), "Control");
        assert!(!entry.operation().is_delegated());
        assert!(catalog.get("Calibrate").unwrap().operation().is_delegated());
        assert!(catalog.get("Unknown").is_none());
    }

    #[test]
    fn risk_hints_come_from_schemas() {
        let catalog = catalog();
        assert_eq!(catalog.risk_hint("StartPump"), Some(RiskLevel::High));
        assert_eq!(catalog.risk_hint("GetStatus"), None);
    }

    #[test]
    fn schemas_preserve_order() {
        let schemas = catalog().schemas();
        assert_eq!(schemas.len(), 3);
        assert_eq!(schemas[0].name(), "GetStatus");
        assert_eq!(schemas[2].name(), "Calibrate");
    }
}
