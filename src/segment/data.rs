//! In-memory segment representation
//!
//! `SegmentData` is the single representation behind every segment: built
//! from an analyzed batch, produced by a merge, or decoded from a segment
//! file. It is immutable once constructed. Local docnums are dense in
//! `0..doc_count` and postings for every term are stored in one shared
//! byte region addressed by per-term metadata.

use std::collections::{BTreeMap, HashMap};
use std::io;

use roaring::RoaringBitmap;

use crate::analysis::AnalyzedDocument;

use super::postings::{PostingIterator, PostingsWriter};
use super::term_dict::{TermDictionary, TermDictionaryBuilder};
use super::types::{DocNo, Posting, PostingListMeta};

/// Immutable, internally sorted segment content
pub struct SegmentData {
    doc_count: u32,
    /// Field names in sorted order
    fields: Vec<String>,
    /// Per-field term dictionary
    dicts: HashMap<String, TermDictionary>,
    /// Shared postings region; dictionary metadata points into it
    postings: Vec<u8>,
    /// docno -> external id
    doc_ids: Vec<String>,
    /// external id -> docno
    id_lookup: HashMap<String, DocNo>,
    /// docno -> stored field values
    stored: Vec<BTreeMap<String, String>>,
}

impl SegmentData {
    /// Build a segment from an analyzed batch. Documents are numbered in
    /// input order; input ids must already be deduplicated.
    pub fn from_analyzed(docs: Vec<AnalyzedDocument>) -> io::Result<Self> {
        let doc_count = docs.len() as u32;

        let mut doc_ids = Vec::with_capacity(docs.len());
        let mut stored = Vec::with_capacity(docs.len());

        // field -> term -> postings in ascending docno order
        let mut field_terms: BTreeMap<String, BTreeMap<String, Vec<Posting>>> = BTreeMap::new();

        for (docno, doc) in docs.into_iter().enumerate() {
            let docno = DocNo::new(docno as u32);
            doc_ids.push(doc.id);

            let mut row = BTreeMap::new();
            for field in doc.fields {
                for (term, positions) in &field.terms {
                    field_terms
                        .entry(field.name.clone())
                        .or_default()
                        .entry(term.clone())
                        .or_default()
                        .push(Posting::new(
                            docno,
                            positions.len() as u32,
                            field.length,
                            positions.clone(),
                        ));
                }
                row.insert(field.name, field.stored);
            }
            stored.push(row);
        }

        let mut writer = PostingsWriter::new();
        let mut dicts = HashMap::with_capacity(field_terms.len());
        let mut fields = Vec::with_capacity(field_terms.len());

        for (field, terms) in field_terms {
            let mut dict_builder = TermDictionaryBuilder::with_capacity(terms.len());
            for (term, postings) in terms {
                writer.start_posting_list();
                for posting in &postings {
                    writer.add_posting(posting);
                }
                dict_builder.add(term, writer.finish_posting_list());
            }
            dicts.insert(field.clone(), dict_builder.build()?);
            fields.push(field);
        }

        Ok(Self::assemble(
            doc_count,
            fields,
            dicts,
            writer.into_data(),
            doc_ids,
            stored,
        ))
    }

    /// Assemble a segment from already-built parts (merge and file-open paths)
    pub(crate) fn assemble(
        doc_count: u32,
        fields: Vec<String>,
        dicts: HashMap<String, TermDictionary>,
        postings: Vec<u8>,
        doc_ids: Vec<String>,
        stored: Vec<BTreeMap<String, String>>,
    ) -> Self {
        let id_lookup = doc_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), DocNo::new(i as u32)))
            .collect();

        Self {
            doc_count,
            fields,
            dicts,
            postings,
            doc_ids,
            id_lookup,
            stored,
        }
    }

    /// Number of documents, live and deleted alike
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Field names in sorted order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Term dictionary for a field, if the field exists in this segment
    pub fn dictionary(&self, field: &str) -> Option<&TermDictionary> {
        self.dicts.get(field)
    }

    /// Posting iterator for (field, term)
    pub fn postings(&self, field: &str, term: &str) -> io::Result<Option<PostingIterator<'_>>> {
        match self.dicts.get(field).and_then(|d| d.get(term)) {
            Some(meta) => Ok(Some(PostingIterator::new(&self.postings, meta)?)),
            None => Ok(None),
        }
    }

    /// Posting iterator for metadata obtained from this segment's dictionary
    pub fn postings_for_meta(&self, meta: &PostingListMeta) -> io::Result<PostingIterator<'_>> {
        PostingIterator::new(&self.postings, meta)
    }

    /// Local docnums of the given external ids, without deletion masking
    pub fn doc_numbers<S: AsRef<str>>(&self, ids: &[S]) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        for id in ids {
            if let Some(docno) = self.id_lookup.get(id.as_ref()) {
                bitmap.insert(docno.as_u32());
            }
        }
        bitmap
    }

    /// Resolve an external id to its local docnum
    pub fn docno_for_id(&self, id: &str) -> Option<DocNo> {
        self.id_lookup.get(id).copied()
    }

    /// Resolve a local docnum to its external id
    pub fn external_id(&self, docno: DocNo) -> Option<&str> {
        self.doc_ids.get(docno.as_usize()).map(|s| s.as_str())
    }

    /// Stored field values for a document
    pub fn stored_fields(&self, docno: DocNo) -> Option<&BTreeMap<String, String>> {
        self.stored.get(docno.as_usize())
    }

    pub(crate) fn postings_bytes(&self) -> &[u8] {
        &self.postings
    }

    pub(crate) fn doc_ids_vec(&self) -> &[String] {
        &self.doc_ids
    }

    pub(crate) fn stored_rows(&self) -> &[BTreeMap<String, String>] {
        &self.stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::AnalyzerConfig;
    use crate::document::Document;

    fn analyzed(docs: Vec<Document>) -> Vec<AnalyzedDocument> {
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        docs.iter().map(|d| analyzer.analyze(d)).collect()
    }

    fn sample_segment() -> SegmentData {
        SegmentData::from_analyzed(analyzed(vec![
            Document::new("a").with_field("body", "rust programming"),
            Document::new("b").with_field("body", "rust language").with_field("title", "intro"),
            Document::new("c").with_field("body", "programming language"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_from_analyzed_basic() {
        let seg = sample_segment();

        assert_eq!(seg.doc_count(), 3);
        assert_eq!(seg.fields(), &["body".to_string(), "title".to_string()]);
        assert_eq!(seg.external_id(DocNo::new(0)), Some("a"));
        assert_eq!(seg.external_id(DocNo::new(2)), Some("c"));
        assert_eq!(seg.docno_for_id("b"), Some(DocNo::new(1)));
        assert_eq!(seg.docno_for_id("missing"), None);
    }

    #[test]
    fn test_postings_lookup() {
        let seg = sample_segment();

        let rust: Vec<_> = seg
            .postings("body", "rust")
            .unwrap()
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();
        assert_eq!(rust.len(), 2);
        assert_eq!(rust[0].docno, DocNo::new(0));
        assert_eq!(rust[1].docno, DocNo::new(1));

        // norms carry the field length
        assert_eq!(rust[0].norm, 2);

        assert!(seg.postings("body", "missing").unwrap().is_none());
        assert!(seg.postings("missing", "rust").unwrap().is_none());
    }

    #[test]
    fn test_doc_numbers() {
        let seg = sample_segment();

        let found = seg.doc_numbers(&["a", "c", "nope"]);
        assert_eq!(found.len(), 2);
        assert!(found.contains(0));
        assert!(found.contains(2));
    }

    #[test]
    fn test_stored_fields() {
        let seg = sample_segment();

        let row = seg.stored_fields(DocNo::new(1)).unwrap();
        assert_eq!(row.get("body").map(|s| s.as_str()), Some("rust language"));
        assert_eq!(row.get("title").map(|s| s.as_str()), Some("intro"));
        assert!(seg.stored_fields(DocNo::new(9)).is_none());
    }

    #[test]
    fn test_dictionary_masks_nothing() {
        let seg = sample_segment();

        let dict = seg.dictionary("body").unwrap();
        assert_eq!(dict.len(), 3); // rust, programming, language
        assert_eq!(dict.get("programming").unwrap().doc_frequency, 2);
    }
}
