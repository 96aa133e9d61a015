//! Point-in-time views of the index
//!
//! An [`IndexSnapshot`] is an immutable ordered list of segment snapshots.
//! The concatenation of segments defines the global docnum space:
//! `global = base(segment_index) + local`, with bases the prefix sums of
//! segment counts. Snapshots carry an explicit reference count; every
//! acquisition must pair with a release, and releasing the last reference
//! frees the child segments (and, for obsolete file segments, their files).

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use roaring::{RoaringBitmap, RoaringTreemap};

use crate::error::{Result, TrawlError};
use crate::segment::{
    DictEntry, DocNo, Posting, PostingIterator, Segment, SegmentId, TermDictionary,
};

/// Separator between terms in cached per-field doc term lists
pub const BYTE_SEPARATOR: u8 = 0xff;

/// One segment plus the deletions that apply to it in this snapshot
#[derive(Clone)]
pub struct SegmentSnapshot {
    segment: Arc<Segment>,
    deleted: Option<Arc<RoaringBitmap>>,
    cached: Arc<CachedDocs>,
}

impl SegmentSnapshot {
    pub(crate) fn new(segment: Arc<Segment>, deleted: Option<Arc<RoaringBitmap>>) -> Self {
        Self {
            segment,
            deleted,
            cached: Arc::new(CachedDocs::default()),
        }
    }

    /// Same segment, different deletions (batch introduction path)
    pub(crate) fn with_deleted(&self, deleted: Option<Arc<RoaringBitmap>>) -> Self {
        Self {
            segment: self.segment.clone(),
            deleted,
            cached: self.cached.clone(),
        }
    }

    /// Different representation of the same documents (persistence swap);
    /// the cache is tied to the representation and starts fresh
    pub(crate) fn with_segment(&self, segment: Arc<Segment>) -> Self {
        Self {
            segment,
            deleted: self.deleted.clone(),
            cached: Arc::new(CachedDocs::default()),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.segment.id()
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn deleted(&self) -> Option<&RoaringBitmap> {
        self.deleted.as_deref()
    }

    /// Documents in the segment, live and deleted alike
    pub fn full_count(&self) -> u32 {
        self.segment.data().doc_count()
    }

    /// Live documents only
    pub fn live_count(&self) -> u64 {
        let deleted = self.deleted.as_ref().map_or(0, |d| d.len());
        self.full_count() as u64 - deleted
    }

    pub fn is_deleted(&self, docno: DocNo) -> bool {
        self.deleted
            .as_ref()
            .map_or(false, |d| d.contains(docno.as_u32()))
    }

    /// Local docnums of the given external ids, deletions masked out
    pub fn doc_numbers<S: AsRef<str>>(&self, ids: &[S]) -> RoaringBitmap {
        let mut found = self.segment.data().doc_numbers(ids);
        if let Some(deleted) = &self.deleted {
            found -= deleted.as_ref();
        }
        found
    }

    /// Bitmap of all live local docnums
    pub fn live_doc_numbers(&self) -> RoaringBitmap {
        let mut live = RoaringBitmap::new();
        live.insert_range(0..self.full_count());
        if let Some(deleted) = &self.deleted {
            live -= deleted.as_ref();
        }
        live
    }

    /// Term dictionary view masking postings by this snapshot's deletions
    pub fn dictionary(&self, field: &str) -> Option<SegmentDictionarySnapshot<'_>> {
        self.segment
            .data()
            .dictionary(field)
            .map(|dict| SegmentDictionarySnapshot { owner: self, dict })
    }

    /// Masked posting iterator for (field, term)
    pub fn postings<'a>(
        &'a self,
        field: &str,
        term: &str,
        except: Option<&'a RoaringBitmap>,
    ) -> io::Result<Option<MaskedPostings<'a>>> {
        match self.segment.data().postings(field, term)? {
            Some(inner) => Ok(Some(MaskedPostings {
                inner,
                deleted: self.deleted.as_deref(),
                except,
            })),
            None => Ok(None),
        }
    }

    pub fn fields(&self) -> &[String] {
        self.segment.data().fields()
    }

    /// Visit the indexed terms of `docno` for each wanted field, through the
    /// per-field cache
    pub fn document_field_terms(
        &self,
        docno: DocNo,
        fields: &[&str],
        visitor: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<()> {
        for field in fields {
            let cached = self.cached.prepare_field(field, &self.segment);
            let docs = cached.wait()?;
            if let Some(bytes) = docs.get(&docno.as_u32()) {
                for term in bytes.split(|b| *b == BYTE_SEPARATOR) {
                    if !term.is_empty() {
                        visitor(field, term);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Dictionary view bound to one segment snapshot
pub struct SegmentDictionarySnapshot<'a> {
    owner: &'a SegmentSnapshot,
    dict: &'a TermDictionary,
}

impl<'a> SegmentDictionarySnapshot<'a> {
    /// Masked postings for a term under this dictionary's field
    pub fn postings_for_meta(
        &self,
        meta: &crate::segment::PostingListMeta,
    ) -> io::Result<MaskedPostings<'a>> {
        Ok(MaskedPostings {
            inner: self.owner.segment.data().postings_for_meta(meta)?,
            deleted: self.owner.deleted.as_deref(),
            except: None,
        })
    }

    pub fn get(&self, term: &str) -> Option<&'a crate::segment::PostingListMeta> {
        self.dict.get(term)
    }

    pub fn stream(&self) -> crate::segment::TermStream<'a> {
        self.dict.stream()
    }

    pub fn prefix_stream(&self, prefix: &str) -> crate::segment::TermStream<'a> {
        self.dict.prefix_stream(prefix)
    }

    pub fn range_stream(&self, start: &str, end: &str) -> crate::segment::TermStream<'a> {
        self.dict.range_stream(start, end)
    }
}

/// Posting iterator that skips deleted and excepted docnums
pub struct MaskedPostings<'a> {
    inner: PostingIterator<'a>,
    deleted: Option<&'a RoaringBitmap>,
    except: Option<&'a RoaringBitmap>,
}

impl<'a> Iterator for MaskedPostings<'a> {
    type Item = io::Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let posting = match self.inner.next()? {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };
            let docno = posting.docno.as_u32();
            if self.deleted.map_or(false, |d| d.contains(docno)) {
                continue;
            }
            if self.except.map_or(false, |e| e.contains(docno)) {
                continue;
            }
            return Some(Ok(posting));
        }
    }
}

/// A posting resolved into the global docnum space
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalPosting {
    pub docnum: u64,
    pub term_frequency: u32,
    pub norm: u32,
    pub positions: Vec<u32>,
}

/// Immutable root snapshot of the whole index
pub struct IndexSnapshot {
    epoch: u64,
    segments: Vec<SegmentSnapshot>,
    /// Global docnum base of each segment (prefix sums of full counts)
    offsets: Vec<u64>,
    refs: AtomicU64,
}

impl IndexSnapshot {
    pub(crate) fn new(epoch: u64, segments: Vec<SegmentSnapshot>) -> Arc<Self> {
        let mut offsets = Vec::with_capacity(segments.len());
        let mut base = 0u64;
        for seg in &segments {
            offsets.push(base);
            base += seg.full_count() as u64;
        }
        Arc::new(Self {
            epoch,
            segments,
            offsets,
            refs: AtomicU64::new(1),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Take an additional reference. Acquiring a snapshot whose count
    /// already reached zero is a programming error.
    pub(crate) fn add_ref(&self) {
        let prev = self.refs.fetch_add(1, Ordering::SeqCst);
        assert!(prev > 0, "acquired snapshot with zero references");
    }

    /// Drop one reference
    pub(crate) fn dec_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "snapshot reference count underflow");
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }

    fn debug_check_live(&self) {
        debug_assert!(
            self.refs.load(Ordering::SeqCst) > 0,
            "read from released snapshot"
        );
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[SegmentSnapshot] {
        &self.segments
    }

    /// Live documents across all segments
    pub fn doc_count(&self) -> u64 {
        self.debug_check_live();
        self.segments.iter().map(|s| s.live_count()).sum()
    }

    /// Global docnums of the given external ids, deletions masked out
    pub fn doc_numbers<S: AsRef<str>>(&self, ids: &[S]) -> RoaringTreemap {
        self.debug_check_live();
        let mut result = RoaringTreemap::new();
        for (seg, base) in self.segments.iter().zip(self.offsets.iter()) {
            for local in seg.doc_numbers(ids) {
                result.insert(base + local as u64);
            }
        }
        result
    }

    /// Global docnum of one external id, if live in this snapshot
    pub fn docnum_for_external_id(&self, id: &str) -> Option<u64> {
        self.debug_check_live();
        for (seg, base) in self.segments.iter().zip(self.offsets.iter()) {
            if let Some(docno) = seg.segment().data().docno_for_id(id) {
                if !seg.is_deleted(docno) {
                    return Some(base + docno.as_u32() as u64);
                }
            }
        }
        None
    }

    /// External id of a global docnum
    pub fn external_id_for_docnum(&self, docnum: u64) -> Option<&str> {
        self.debug_check_live();
        let (idx, local) = self.locate(docnum)?;
        self.segments[idx].segment().data().external_id(local)
    }

    /// Stored field values of a global docnum
    pub fn stored_fields(&self, docnum: u64) -> Option<&BTreeMap<String, String>> {
        self.debug_check_live();
        let (idx, local) = self.locate(docnum)?;
        self.segments[idx].segment().data().stored_fields(local)
    }

    /// Sorted union of field names across segments
    pub fn fields(&self) -> Vec<String> {
        self.debug_check_live();
        let mut fields: Vec<String> = Vec::new();
        for seg in &self.segments {
            for field in seg.fields() {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        }
        fields.sort();
        fields
    }

    /// Merged term dictionary over all segments for a field
    pub fn dictionary(&self, field: &str) -> IndexDictionary<'_> {
        self.debug_check_live();
        let streams = self
            .segments
            .iter()
            .filter_map(|seg| seg.dictionary(field))
            .map(|dict| dict.stream().peekable())
            .collect();
        IndexDictionary { streams }
    }

    /// Global posting iterator for (field, term); `except` masks global
    /// docnums on top of per-segment deletions
    pub fn posting_list<'a>(
        &'a self,
        field: &str,
        term: &str,
        except: Option<&'a RoaringTreemap>,
    ) -> io::Result<Vec<GlobalPosting>> {
        self.debug_check_live();
        let mut result = Vec::new();
        for (seg, base) in self.segments.iter().zip(self.offsets.iter()) {
            if let Some(postings) = seg.postings(field, term, None)? {
                for posting in postings {
                    let posting = posting?;
                    let docnum = base + posting.docno.as_u32() as u64;
                    if except.map_or(false, |e| e.contains(docnum)) {
                        continue;
                    }
                    result.push(GlobalPosting {
                        docnum,
                        term_frequency: posting.term_frequency,
                        norm: posting.norm,
                        positions: posting.positions,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Visit the indexed terms of a global docnum for the wanted fields
    pub fn document_field_terms(
        &self,
        docnum: u64,
        fields: &[&str],
        visitor: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<()> {
        self.debug_check_live();
        let (idx, local) = self
            .locate(docnum)
            .ok_or_else(|| TrawlError::Corrupt {
                path: String::new(),
                detail: format!("global docnum {} outside snapshot", docnum),
            })?;
        self.segments[idx].document_field_terms(local, fields, visitor)
    }

    /// Map a global docnum to (segment index, local docnum)
    fn locate(&self, docnum: u64) -> Option<(usize, DocNo)> {
        if self.segments.is_empty() {
            return None;
        }
        let mut idx = match self.offsets.binary_search(&docnum) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        // skip zero-width segments sharing this base
        while idx + 1 < self.offsets.len() && self.offsets[idx + 1] <= docnum {
            idx += 1;
        }
        let local = docnum - self.offsets[idx];
        if local >= self.segments[idx].full_count() as u64 {
            return None;
        }
        Some((idx, DocNo::new(local as u32)))
    }
}

/// K-way merged dictionary iteration across segments, in term order, with
/// doc frequencies summed per term
pub struct IndexDictionary<'a> {
    streams: Vec<std::iter::Peekable<crate::segment::TermStream<'a>>>,
}

impl<'a> Iterator for IndexDictionary<'a> {
    type Item = DictEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let mut min_term: Option<String> = None;
        for stream in self.streams.iter_mut() {
            if let Some((term, _)) = stream.peek() {
                match &min_term {
                    Some(current) if term >= current => {}
                    _ => min_term = Some(term.clone()),
                }
            }
        }
        let term = min_term?;

        let mut doc_frequency = 0u32;
        for stream in self.streams.iter_mut() {
            if stream.peek().map_or(false, |(t, _)| *t == term) {
                let (_, meta) = stream.next().unwrap();
                doc_frequency += meta.doc_frequency;
            }
        }

        Some(DictEntry {
            term,
            doc_frequency,
        })
    }
}

/// Per-field cache of docno -> indexed terms, filled lazily by the first
/// caller; later callers wait for the readiness signal
#[derive(Default)]
pub(crate) struct CachedDocs {
    cache: Mutex<HashMap<String, Arc<CachedFieldDocs>>>,
}

impl CachedDocs {
    /// Get or create the cache entry for `field`, spawning the filler on
    /// first request
    fn prepare_field(&self, field: &str, segment: &Arc<Segment>) -> Arc<CachedFieldDocs> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(field) {
            return entry.clone();
        }

        let entry = Arc::new(CachedFieldDocs::default());
        cache.insert(field.to_string(), entry.clone());

        let filler = entry.clone();
        let segment = segment.clone();
        let field = field.to_string();
        std::thread::spawn(move || {
            filler.fill(&segment, &field);
        });

        entry
    }
}

#[derive(Default)]
pub(crate) struct CachedFieldDocs {
    state: Mutex<CachedFieldState>,
    ready: Condvar,
}

#[derive(Default)]
struct CachedFieldState {
    done: bool,
    err: Option<String>,
    docs: Arc<HashMap<u32, Vec<u8>>>,
}

impl CachedFieldDocs {
    /// Build docno -> separator-joined terms for the whole field. The
    /// readiness signal fires on every exit path.
    fn fill(&self, segment: &Arc<Segment>, field: &str) {
        let result = Self::collect(segment, field);
        let mut state = self.state.lock();
        match result {
            Ok(docs) => state.docs = Arc::new(docs),
            Err(err) => state.err = Some(err.to_string()),
        }
        state.done = true;
        self.ready.notify_all();
    }

    fn collect(segment: &Arc<Segment>, field: &str) -> io::Result<HashMap<u32, Vec<u8>>> {
        let mut docs: HashMap<u32, Vec<u8>> = HashMap::new();
        if let Some(dict) = segment.data().dictionary(field) {
            let mut stream = dict.stream();
            while let Some((term, meta)) = stream.next() {
                for posting in segment.data().postings_for_meta(meta)? {
                    let posting = posting?;
                    let entry = docs.entry(posting.docno.as_u32()).or_default();
                    entry.extend_from_slice(term.as_bytes());
                    entry.push(BYTE_SEPARATOR);
                }
            }
        }
        Ok(docs)
    }

    /// Block until the filler signals readiness
    fn wait(&self) -> Result<Arc<HashMap<u32, Vec<u8>>>> {
        let mut state = self.state.lock();
        while !state.done {
            self.ready.wait(&mut state);
        }
        if let Some(err) = &state.err {
            return Err(TrawlError::Corrupt {
                path: String::new(),
                detail: err.clone(),
            });
        }
        Ok(state.docs.clone())
    }
}
