//! The index façade and its background machinery
//!
//! [`Index`] orchestrates batch ingestion, hands readers refcounted
//! snapshots, and owns the three long-lived loops: the introducer (single
//! writer of the root), the persister, and the merger. Subsystems receive
//! their collaborators by construction; there is no module-level state.

mod introducer;
pub mod manifest;
pub mod mergeplan;
mod merger;
mod persister;
pub mod snapshot;

pub use manifest::{Manifest, ManifestEntry, MANIFEST_FILE};
pub use mergeplan::{MergePlan, MergePolicy, MergeTask, PlanSegment, TieredMergePolicy};
pub use snapshot::{
    GlobalPosting, IndexDictionary, IndexSnapshot, MaskedPostings, SegmentDictionarySnapshot,
    SegmentSnapshot,
};

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;
use tracing::{debug, warn};

use crate::analysis::{AnalyzedDocument, Analyzer};
use crate::config::IndexConfig;
use crate::document::Batch;
use crate::error::{Result, TrawlError};
use crate::events::{EventSink, NullSink};
use crate::segment::{
    file, segment_file_name, DictEntry, FileCleanup, Segment, SegmentData, SegmentId,
    SEGMENT_EXTENSION,
};

use introducer::{BatchIntroduction, Introducer, Introduction};
use merger::Merger;
use persister::Persister;

/// A log-structured, snapshot-isolated full-text index
pub struct Index {
    inner: Arc<IndexInner>,
}

struct IndexInner {
    config: IndexConfig,
    analyzer: Analyzer,
    root: Arc<RwLock<Arc<IndexSnapshot>>>,
    introductions: Sender<Introduction>,
    persister_notifier: Sender<Sender<()>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next_segment_id: Arc<AtomicU64>,
    next_batch_epoch: AtomicU64,
    closed: AtomicBool,
    poisoned: Arc<AtomicBool>,
}

impl Index {
    /// Open or create an index at the configured path
    pub fn open(config: IndexConfig) -> Result<Index> {
        Self::open_with_events(config, Arc::new(NullSink))
    }

    /// Open with a telemetry sink for lifecycle events
    pub fn open_with_events(config: IndexConfig, events: Arc<dyn EventSink>) -> Result<Index> {
        let policy = Arc::new(TieredMergePolicy::new(config.merge.clone()));
        Self::open_with_policy(config, events, policy)
    }

    /// Open with a custom merge policy
    pub fn open_with_policy(
        config: IndexConfig,
        events: Arc<dyn EventSink>,
        policy: Arc<dyn MergePolicy>,
    ) -> Result<Index> {
        fs::create_dir_all(&config.path)?;

        let cleanup = Arc::new(FileCleanup::new());
        let (segments, epoch, next_segment_id) = recover(&config.path, &cleanup)?;

        let root_snapshot = IndexSnapshot::new(epoch, segments);
        let next_segment_id = Arc::new(AtomicU64::new(next_segment_id));

        // stamp the post-recovery state
        manifest::write_manifest(
            &config.path,
            &Manifest::from_snapshot(&root_snapshot, next_segment_id.load(Ordering::SeqCst))?,
        )?;

        let root = Arc::new(RwLock::new(root_snapshot));
        let poisoned = Arc::new(AtomicBool::new(false));

        let (intro_tx, intro_rx) = bounded(config.introducer_channel_capacity.max(1));
        let (notify_tx, notify_rx) = bounded(config.persister_channel_capacity.max(1));
        let (close_tx, close_rx) = bounded::<()>(0);

        let mut threads = Vec::with_capacity(3);

        let introducer = Introducer {
            root: root.clone(),
            introductions: intro_rx,
            close: close_rx.clone(),
            dir: config.path.clone(),
            next_segment_id: next_segment_id.clone(),
            events: events.clone(),
            poisoned: poisoned.clone(),
        };
        threads.push(
            std::thread::Builder::new()
                .name("trawl-introducer".to_string())
                .spawn(move || introducer.run())?,
        );

        let persister = Persister {
            root: root.clone(),
            introductions: intro_tx.clone(),
            notifier: notify_rx,
            close: close_rx.clone(),
            dir: config.path.clone(),
            cleanup: cleanup.clone(),
            chunk_factor: config.chunk_factor,
            events: events.clone(),
        };
        threads.push(
            std::thread::Builder::new()
                .name("trawl-persister".to_string())
                .spawn(move || persister.run())?,
        );

        let merger = Merger {
            root: root.clone(),
            introductions: intro_tx.clone(),
            persister_notifier: notify_tx.clone(),
            close: close_rx.clone(),
            dir: config.path.clone(),
            cleanup: cleanup.clone(),
            policy,
            workers: config.merge_workers.max(1),
            chunk_factor: config.chunk_factor,
            next_segment_id: next_segment_id.clone(),
            events,
        };
        threads.push(
            std::thread::Builder::new()
                .name("trawl-merger".to_string())
                .spawn(move || merger.run())?,
        );

        let analyzer = Analyzer::new(&config.analyzer);

        Ok(Index {
            inner: Arc::new(IndexInner {
                config,
                analyzer,
                root,
                introductions: intro_tx,
                persister_notifier: notify_tx,
                close_tx: Mutex::new(Some(close_tx)),
                close_rx,
                threads: Mutex::new(threads),
                next_segment_id,
                next_batch_epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                poisoned,
            }),
        })
    }

    /// Apply a batch of mutations atomically. Returns once the batch is
    /// visible in the root snapshot.
    pub fn batch(&self, batch: Batch) -> Result<()> {
        self.inner.check_open()?;

        if batch.has_empty_id() {
            return Err(TrawlError::EmptyDocumentId);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let analyzed: Vec<AnalyzedDocument> = batch
            .updates()
            .map(|doc| self.inner.analyzer.analyze(doc))
            .collect();
        let segment = if analyzed.is_empty() {
            None
        } else {
            let id = SegmentId::new(self.inner.next_segment_id.fetch_add(1, Ordering::SeqCst));
            Some(Arc::new(Segment::new_memory(
                id,
                SegmentData::from_analyzed(analyzed)?,
            )))
        };

        let obsolete_ids: Vec<String> = batch.ids().map(|s| s.to_string()).collect();
        let batch_epoch = self.inner.next_batch_epoch.fetch_add(1, Ordering::SeqCst);

        let (applied_tx, applied_rx) = bounded(1);
        self.inner
            .introductions
            .send(Introduction::Batch(BatchIntroduction {
                segment,
                obsolete_ids,
                batch_epoch,
                applied: applied_tx,
            }))
            .map_err(|_| TrawlError::Closed)?;

        let applied = select! {
            recv(self.inner.close_rx) -> _ => return Err(TrawlError::Closed),
            recv(applied_rx) -> res => res.map_err(|_| TrawlError::Closed)?,
        };
        applied?;

        // nudge the persister; it answers wakers after its next cycle
        let (wake_tx, _wake_rx) = bounded(1);
        let _ = self.inner.persister_notifier.try_send(wake_tx);

        Ok(())
    }

    /// Acquire a refcounted snapshot for reading. The snapshot's view never
    /// changes; drop the reader to release it.
    pub fn reader(&self) -> Result<IndexReader> {
        self.inner.check_open()?;
        let snapshot = {
            let guard = self.inner.root.read();
            let snapshot = guard.clone();
            snapshot.add_ref();
            snapshot
        };
        Ok(IndexReader {
            snapshot: Some(snapshot),
        })
    }

    /// Live document count in the current root
    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.reader()?.doc_count())
    }

    /// Current root epoch
    pub fn epoch(&self) -> Result<u64> {
        Ok(self.reader()?.epoch())
    }

    /// Path of the index directory
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Drain the background loops and release the root. Safe to call twice.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // dropping the close sender signals every loop at its next select
        self.inner.close_tx.lock().take();

        let handles: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // release the root exactly once
        let old = {
            let mut guard = self.inner.root.write();
            let epoch = guard.epoch() + 1;
            std::mem::replace(&mut *guard, IndexSnapshot::new(epoch, Vec::new()))
        };
        old.dec_ref();

        debug!("index closed");
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl IndexInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TrawlError::Closed);
        }
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(TrawlError::Poisoned);
        }
        Ok(())
    }
}

/// Refcounted handle to one immutable snapshot; releases on drop
pub struct IndexReader {
    snapshot: Option<Arc<IndexSnapshot>>,
}

impl IndexReader {
    fn snap(&self) -> &IndexSnapshot {
        self.snapshot.as_ref().expect("reader already released")
    }

    /// The underlying snapshot
    pub fn snapshot(&self) -> &IndexSnapshot {
        self.snap()
    }

    pub fn epoch(&self) -> u64 {
        self.snap().epoch()
    }

    pub fn segment_count(&self) -> usize {
        self.snap().segment_count()
    }

    /// Live document count
    pub fn count(&self) -> u64 {
        self.snap().doc_count()
    }

    /// Alias for [`count`](Self::count)
    pub fn doc_count(&self) -> u64 {
        self.snap().doc_count()
    }

    pub fn fields(&self) -> Vec<String> {
        self.snap().fields()
    }

    pub fn doc_numbers<S: AsRef<str>>(&self, ids: &[S]) -> RoaringTreemap {
        self.snap().doc_numbers(ids)
    }

    pub fn docnum_for_external_id(&self, id: &str) -> Option<u64> {
        self.snap().docnum_for_external_id(id)
    }

    pub fn external_id_for_docnum(&self, docnum: u64) -> Option<&str> {
        self.snap().external_id_for_docnum(docnum)
    }

    pub fn stored_fields(&self, docnum: u64) -> Option<&BTreeMap<String, String>> {
        self.snap().stored_fields(docnum)
    }

    /// Merged term dictionary over all segments
    pub fn dictionary(&self, field: &str) -> impl Iterator<Item = DictEntry> + '_ {
        self.snap().dictionary(field)
    }

    /// Global postings for (field, term) with an optional exception mask
    pub fn posting_list(
        &self,
        field: &str,
        term: &str,
        except: Option<&RoaringTreemap>,
    ) -> Result<Vec<GlobalPosting>> {
        Ok(self.snap().posting_list(field, term, except)?)
    }

    /// Visit the indexed terms of a document for the wanted fields
    pub fn document_field_terms(
        &self,
        docnum: u64,
        fields: &[&str],
        visitor: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<()> {
        self.snap().document_field_terms(docnum, fields, visitor)
    }
}

impl Drop for IndexReader {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.dec_ref();
        }
    }
}

/// Load the manifest and rebuild the root: adopt the segments it names,
/// quarantine corrupt ones, and sweep orphan files
fn recover(
    dir: &Path,
    cleanup: &Arc<FileCleanup>,
) -> Result<(Vec<SegmentSnapshot>, u64, u64)> {
    let manifest = manifest::load_manifest(dir)?.unwrap_or_else(Manifest::empty);

    let mut segments = Vec::with_capacity(manifest.segments.len());
    let mut adopted: Vec<OsString> = Vec::new();
    let mut max_seen_id = 0u64;

    for entry in &manifest.segments {
        let filename = segment_file_name(entry.id);
        let path = dir.join(&filename);
        match file::open(&path) {
            Ok(data) => {
                let deleted = entry.deleted_bitmap()?.map(Arc::new);
                let segment =
                    Arc::new(Segment::new_file(entry.id, data, path, cleanup.clone()));
                segments.push(SegmentSnapshot::new(segment, deleted));
                adopted.push(OsString::from(filename));
                max_seen_id = max_seen_id.max(entry.id.0);
            }
            Err(err @ TrawlError::Corrupt { .. }) => {
                warn!(%err, id = %entry.id, "quarantining corrupt segment");
                let _ = file::quarantine(&path);
            }
            Err(TrawlError::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!(id = %entry.id, "segment file named by manifest is missing");
            }
            Err(err) => return Err(err),
        }
    }

    // remove files the manifest does not name: orphans from a crash between
    // rename and introduction, and stale temp files
    for dir_entry in fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let path = dir_entry.path();

        let is_orphan_segment = path
            .extension()
            .map_or(false, |ext| ext == SEGMENT_EXTENSION)
            && !adopted.contains(&name);
        let is_stale_temp = path.extension().map_or(false, |ext| ext == "tmp");

        if is_orphan_segment || is_stale_temp {
            warn!(path = %path.display(), "removing file not named by the manifest");
            let _ = fs::remove_file(&path);
        }
    }

    let next_segment_id = manifest.next_segment_id.max(max_seen_id + 1);
    Ok((segments, manifest.epoch, next_segment_id))
}
