//! Operation → request stream routing
//!
//! Every logical operation is published to its own Redis stream. The table is
//! fixed at construction; an operation without a route is a configuration error.

use std::collections::HashMap;

use crate::error::RelayError;

/// Prefix shared by all request streams
pub const REQUEST_STREAM_PREFIX: &str = "requests:";

const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("calculate-damage", "damage-calculation"),
    ("get-all-people", "people-get-all"),
    ("get-person-by-name", "people-get-by-name"),
    ("get-people-names", "people-get-names"),
    ("insert-person", "people-insert"),
    ("update-person", "people-update"),
    ("delete-all-people", "people-delete-all"),
    ("get-all-weapons", "weapon-get-all"),
    ("get-weapon-by-name", "weapon-get-by-name"),
    ("get-weapons-by-owner", "weapon-get-by-owner"),
    ("save-weapon", "weapon-save"),
    ("delete-weapon", "weapon-delete"),
    ("delete-all-weapons", "weapon-delete-all"),
    ("weapon-exists", "weapon-exists"),
    ("draw-cards", "deckofcards"),
];

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    /// Empty table; add routes with [`RouteTable::with_route`]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard operation set
    pub fn standard() -> Self {
        DEFAULT_ROUTES
            .iter()
            .fold(Self::empty(), |table, (operation, queue)| {
                table.with_route(*operation, format!("{}{}", REQUEST_STREAM_PREFIX, queue))
            })
    }

    pub fn with_route(mut self, operation: impl Into<String>, stream: impl Into<String>) -> Self {
        self.routes.insert(operation.into(), stream.into());
        self
    }

    /// Stream for an operation
    pub fn resolve(&self, operation: &str) -> Result<&str, RelayError> {
        self.routes
            .get(operation)
            .map(String::as_str)
            .ok_or_else(|| RelayError::UnknownOperation(operation.to_string()))
    }

    /// Operation names, sorted
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_routes() {
        let table = RouteTable::standard();
        assert_eq!(table.resolve("get-all-people").unwrap(), "requests:people-get-all");
        assert_eq!(table.resolve("draw-cards").unwrap(), "requests:deckofcards");
        assert_eq!(table.operations().len(), DEFAULT_ROUTES.len());
    }

    #[test]
    fn test_unknown_operation() {
        let err = RouteTable::standard().resolve("launch-rockets").unwrap_err();
        assert!(matches!(err, RelayError::UnknownOperation(ref op) if op == "launch-rockets"));
    }

    #[test]
    fn test_custom_route_overrides() {
        let table = RouteTable::standard().with_route("get-all-people", "custom:people");
        assert_eq!(table.resolve("get-all-people").unwrap(), "custom:people");
    }
}
