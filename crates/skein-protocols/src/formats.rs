//! Format handler registry.
//!
//! Credential and proof exchanges carry payload attachments whose
//! construction and validation is format-specific (anoncreds, W3C VC and
//! so on). The state machines stay format-agnostic; an attachment's
//! format id selects the handler from this registry.

use dashmap::DashMap;
use skein_types::{SkeinError, SkeinResult};
use std::sync::Arc;

/// Maps attachment format ids to their handlers.
pub struct FormatRegistry<H: ?Sized> {
    handlers: DashMap<String, Arc<H>>,
}

impl<H: ?Sized> Default for FormatRegistry<H> {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}

impl<H: ?Sized> FormatRegistry<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a format id to a handler. Fails if already bound.
    pub fn register(&self, format_id: &str, handler: Arc<H>) -> SkeinResult<()> {
        match self.handlers.entry(format_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SkeinError::DuplicateHandler(format_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Resolve the handler for a format id. An unknown format is a
    /// validation failure, surfaced to the peer as a problem report.
    pub fn get(&self, format_id: &str) -> SkeinResult<Arc<H>> {
        self.handlers
            .get(format_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| SkeinError::Validation(format!("unsupported format: {format_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait StubFormat: Send + Sync {}
    struct A;
    impl StubFormat for A {}

    #[test]
    fn test_duplicate_format_rejected() {
        let registry: FormatRegistry<dyn StubFormat> = FormatRegistry::new();
        registry.register("fmt/1.0", Arc::new(A)).unwrap();
        let err = registry.register("fmt/1.0", Arc::new(A)).unwrap_err();
        assert!(matches!(err, SkeinError::DuplicateHandler(_)));
    }

    #[test]
    fn test_unknown_format_is_validation_error() {
        let registry: FormatRegistry<dyn StubFormat> = FormatRegistry::new();
        let err = registry.get("nope").err().unwrap();
        assert!(matches!(err, SkeinError::Validation(_)));
    }
}
