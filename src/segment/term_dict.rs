//! Term dictionary backed by an FST
//!
//! Terms map to indexes into a parallel metadata array describing each
//! posting list. The FST gives O(|term|) lookups and ordered streams for
//! full, prefix, and range iteration.

use std::io;

use fst::{IntoStreamer, Map, MapBuilder, Streamer};

use super::types::PostingListMeta;

/// Immutable term dictionary for one field of one segment
pub struct TermDictionary {
    /// FST mapping term -> index into `metas`
    fst: Map<Vec<u8>>,
    /// Posting list metadata, parallel to the FST output values
    metas: Vec<PostingListMeta>,
}

impl TermDictionary {
    /// Rebuild a dictionary from its serialized parts
    pub fn new(fst_bytes: Vec<u8>, metas: Vec<PostingListMeta>) -> io::Result<Self> {
        let fst =
            Map::new(fst_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self { fst, metas })
    }

    /// Look up a term
    pub fn get(&self, term: &str) -> Option<&PostingListMeta> {
        self.fst
            .get(term.as_bytes())
            .map(|idx| &self.metas[idx as usize])
    }

    pub fn contains(&self, term: &str) -> bool {
        self.fst.contains_key(term.as_bytes())
    }

    /// Number of distinct terms
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Stream every term in lexicographic order
    pub fn stream(&self) -> TermStream<'_> {
        TermStream {
            inner: self.fst.stream(),
            metas: &self.metas,
        }
    }

    /// Stream terms starting with `prefix`
    pub fn prefix_stream(&self, prefix: &str) -> TermStream<'_> {
        let mut builder = self.fst.range().ge(prefix.as_bytes());
        if let Some(upper) = prefix_upper_bound(prefix.as_bytes()) {
            builder = builder.lt(upper);
        }
        TermStream {
            inner: builder.into_stream(),
            metas: &self.metas,
        }
    }

    /// Stream terms in `[start, end)`; an empty `end` means unbounded
    pub fn range_stream(&self, start: &str, end: &str) -> TermStream<'_> {
        let mut builder = self.fst.range().ge(start.as_bytes());
        if !end.is_empty() {
            builder = builder.lt(end.as_bytes());
        }
        TermStream {
            inner: builder.into_stream(),
            metas: &self.metas,
        }
    }

    /// Raw FST bytes for serialization
    pub fn fst_bytes(&self) -> &[u8] {
        self.fst.as_fst().as_bytes()
    }

    /// Metadata array for serialization
    pub fn metas(&self) -> &[PostingListMeta] {
        &self.metas
    }
}

/// Smallest byte string greater than every string with the given prefix,
/// or None when no such bound exists
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(&last) = upper.last() {
        if last < 0xff {
            *upper.last_mut().unwrap() = last + 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

/// Lazy, restartable stream of (term, metadata) pairs in term order
pub struct TermStream<'a> {
    inner: fst::map::Stream<'a>,
    metas: &'a [PostingListMeta],
}

impl<'a> Iterator for TermStream<'a> {
    type Item = (String, &'a PostingListMeta);

    fn next(&mut self) -> Option<Self::Item> {
        let metas = self.metas;
        self.inner.next().map(|(key, idx)| {
            let term = String::from_utf8_lossy(key).into_owned();
            (term, &metas[idx as usize])
        })
    }
}

/// Builder for term dictionaries; input need not arrive sorted
pub struct TermDictionaryBuilder {
    terms: Vec<(String, PostingListMeta)>,
}

impl TermDictionaryBuilder {
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            terms: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, term: String, meta: PostingListMeta) {
        self.terms.push((term, meta));
    }

    pub fn build(mut self) -> io::Result<TermDictionary> {
        // FST construction requires sorted input
        self.terms.sort_by(|a, b| a.0.cmp(&b.0));

        let mut fst_builder = MapBuilder::memory();
        let mut metas = Vec::with_capacity(self.terms.len());

        for (idx, (term, meta)) in self.terms.into_iter().enumerate() {
            fst_builder
                .insert(term.as_bytes(), idx as u64)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            metas.push(meta);
        }

        let fst_bytes = fst_builder
            .into_inner()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        TermDictionary::new(fst_bytes, metas)
    }
}

impl Default for TermDictionaryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
