//! Static searchable-field registry.
//!
//! Tables opt into search by registering their searchable field list at
//! startup. The change-tracking hook consults this table instead of asking
//! rows whether they are searchable.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::{Entity, Post};

/// Fields of [`Post`] mirrored into the search index.
pub const POST_SEARCHABLE: &[&str] = &["body"];

#[derive(Debug, Clone, Default)]
pub struct SearchableRegistry {
    tables: BTreeMap<&'static str, Vec<&'static str>>,
}

impl SearchableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every searchable table of the application.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Post::TABLE, POST_SEARCHABLE);
        registry
    }

    /// Declares `fields` of `table` searchable. Re-registering replaces the list.
    pub fn register(&mut self, table: &'static str, fields: &[&'static str]) -> &mut Self {
        self.tables.insert(table, fields.to_vec());
        self
    }

    pub fn fields(&self, table: &str) -> Option<&[&'static str]> {
        self.tables.get(table).map(|f| f.as_slice())
    }

    pub fn is_searchable(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tables.keys().copied()
    }

    /// Projects a captured row onto the declared searchable fields of its
    /// table, in declaration order. `None` if the table is not registered.
    pub fn project(&self, table: &str, values: &Map<String, Value>) -> Option<Map<String, Value>> {
        let fields = self.fields(table)?;
        let mut document = Map::new();
        for field in fields {
            let value = values.get(*field).cloned().unwrap_or(Value::Null);
            document.insert((*field).to_string(), value);
        }
        Some(document)
    }
}
