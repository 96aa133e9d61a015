//! Documents and mutation batches
//!
//! A batch is the unit of atomic ingestion: all of its mutations become
//! visible in one snapshot, or none do. Within a batch the last mutation
//! for an external id wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A document keyed by an external string id, carrying named text fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: String,
    fields: BTreeMap<String, String>,
}

impl Document {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field<K: Into<String>, V: Into<String>>(mut self, name: K, text: V) -> Self {
        self.fields.insert(name.into(), text.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }

    /// Iterate fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// One mutation within a batch
#[derive(Clone, Debug)]
pub(crate) enum Mutation {
    Update(Document),
    Delete,
}

/// An ordered set of document mutations applied atomically
#[derive(Clone, Debug, Default)]
pub struct Batch {
    ops: BTreeMap<String, Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the document with this id
    pub fn update(&mut self, doc: Document) {
        self.ops.insert(doc.id.clone(), Mutation::Update(doc));
    }

    /// Delete the document with this external id
    pub fn delete<S: Into<String>>(&mut self, id: S) {
        self.ops.insert(id.into(), Mutation::Delete);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// External ids touched by this batch, in id order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(|k| k.as_str())
    }

    /// Documents being inserted or updated, in id order
    pub(crate) fn updates(&self) -> impl Iterator<Item = &Document> {
        self.ops.values().filter_map(|op| match op {
            Mutation::Update(doc) => Some(doc),
            Mutation::Delete => None,
        })
    }

    pub(crate) fn has_empty_id(&self) -> bool {
        self.ops.keys().any(|k| k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_fields() {
        let doc = Document::new("a")
            .with_field("title", "One")
            .with_field("body", "two three");

        assert_eq!(doc.id(), "a");
        assert_eq!(doc.field("title"), Some("One"));
        assert_eq!(doc.field("missing"), None);
        assert_eq!(doc.field_count(), 2);
    }

    #[test]
    fn test_batch_last_wins() {
        let mut batch = Batch::new();
        batch.update(Document::new("a").with_field("v", "1"));
        batch.update(Document::new("a").with_field("v", "2"));

        assert_eq!(batch.len(), 1);
        let docs: Vec<_> = batch.updates().collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].field("v"), Some("2"));
    }

    #[test]
    fn test_batch_delete_supersedes_update() {
        let mut batch = Batch::new();
        batch.update(Document::new("a").with_field("v", "1"));
        batch.delete("a");

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.updates().count(), 0);
        assert_eq!(batch.ids().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_batch_ids_cover_deletes() {
        let mut batch = Batch::new();
        batch.update(Document::new("b").with_field("v", "1"));
        batch.delete("a");

        let ids: Vec<_> = batch.ids().collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
