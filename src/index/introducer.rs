//! The introducer: single writer of the root snapshot
//!
//! Every root transition funnels through this component as one of three
//! event kinds. Events are applied in arrival order and each applied event
//! bumps the epoch by exactly one. The introducer is the only code that
//! takes the root's write lock, and it releases the previous root exactly
//! once per publish.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::events::{AsyncErrorKind, Event, EventSink};
use crate::segment::{Segment, SegmentId, DROPPED_DOC};

use super::manifest::{self, Manifest};
use super::snapshot::{IndexSnapshot, SegmentSnapshot};

/// A new in-memory segment from a batch, plus the external ids it
/// supersedes or deletes
pub(crate) struct BatchIntroduction {
    /// Absent for delete-only batches
    pub segment: Option<Arc<Segment>>,
    /// Every external id touched by the batch
    pub obsolete_ids: Vec<String>,
    /// Internal batch ordinal assigned at ingestion
    pub batch_epoch: u64,
    /// Acked once the batch is visible in the root
    pub applied: Sender<Result<()>>,
}

/// Swap an in-memory segment for its on-disk equivalent
pub(crate) struct PersistedIntroduction {
    pub memory_id: SegmentId,
    pub segment: Arc<Segment>,
    pub applied: Sender<Result<()>>,
}

/// Replace a set of old segments with their merged result
pub(crate) struct SegmentMerge {
    pub id: SegmentId,
    pub old_ids: Vec<SegmentId>,
    /// Per-old-segment translation: old local docnum -> new local docnum,
    /// or DROPPED_DOC
    pub old_new_docnums: HashMap<SegmentId, Vec<u32>>,
    pub segment: Arc<Segment>,
    /// Signalled when the record has been handled, introduced or not
    pub notify: Sender<()>,
}

/// Tagged introduction event; the three cases are closed
pub(crate) enum Introduction {
    Batch(BatchIntroduction),
    Persisted(PersistedIntroduction),
    Merge(SegmentMerge),
}

pub(crate) struct Introducer {
    pub root: Arc<RwLock<Arc<IndexSnapshot>>>,
    pub introductions: Receiver<Introduction>,
    pub close: Receiver<()>,
    pub dir: PathBuf,
    pub next_segment_id: Arc<AtomicU64>,
    pub events: Arc<dyn EventSink>,
    pub poisoned: Arc<AtomicBool>,
}

impl Introducer {
    pub(crate) fn run(self) {
        loop {
            select! {
                recv(self.close) -> _ => break,
                recv(self.introductions) -> msg => match msg {
                    Ok(Introduction::Batch(batch)) => self.introduce_batch(batch),
                    Ok(Introduction::Persisted(persisted)) => {
                        self.introduce_persisted(persisted)
                    }
                    Ok(Introduction::Merge(merge)) => self.introduce_merge(merge),
                    Err(_) => break,
                },
            }
        }
        debug!("introducer exiting");
    }

    fn current_root(&self) -> Arc<IndexSnapshot> {
        self.root.read().clone()
    }

    /// Swap in a new root and release the previous one
    fn publish(&self, segments: Vec<SegmentSnapshot>) -> u64 {
        let mut guard = self.root.write();
        let old = guard.clone();
        let epoch = old.epoch() + 1;
        *guard = IndexSnapshot::new(epoch, segments);
        drop(guard);
        old.dec_ref();
        epoch
    }

    fn introduce_batch(&self, batch: BatchIntroduction) {
        let old = self.current_root();

        let mut segments = Vec::with_capacity(old.segment_count() + 1);
        for seg in old.segments() {
            let obsoleted = seg.doc_numbers(&batch.obsolete_ids);
            if obsoleted.is_empty() {
                segments.push(seg.clone());
            } else {
                let mut deleted = seg.deleted().cloned().unwrap_or_default();
                deleted |= obsoleted;
                segments.push(seg.with_deleted(Some(Arc::new(deleted))));
            }
        }

        let mut doc_count = 0;
        if let Some(segment) = &batch.segment {
            doc_count = segment.data().doc_count();
            segments.push(SegmentSnapshot::new(segment.clone(), None));
        }

        let epoch = self.publish(segments);
        let _ = batch.applied.send(Ok(()));
        self.events
            .on_event(&Event::BatchIntroduced { epoch, doc_count });
        debug!(epoch, batch_epoch = batch.batch_epoch, "batch introduced");
    }

    fn introduce_persisted(&self, persisted: PersistedIntroduction) {
        let old = self.current_root();

        let pos = old
            .segments()
            .iter()
            .position(|s| s.id() == persisted.memory_id && !s.segment().is_persisted());

        match pos {
            None => {
                // lost race: the segment already left the root; drop the
                // freshly written file once its protection lifts
                persisted.segment.mark_obsolete();
                let _ = persisted.applied.send(Ok(()));
                debug!(id = %persisted.memory_id, "persist discarded, segment left the root");
            }
            Some(pos) => {
                let mut segments = old.segments().to_vec();
                segments[pos] = segments[pos].with_segment(persisted.segment.clone());
                let epoch = self.publish(segments);
                self.write_manifest();
                let _ = persisted.applied.send(Ok(()));
                debug!(epoch, id = %persisted.memory_id, "persisted segment introduced");
            }
        }
    }

    fn introduce_merge(&self, merge: SegmentMerge) {
        let old = self.current_root();

        // whole-set match: abort unless every old segment is still present
        let all_present = merge
            .old_ids
            .iter()
            .all(|id| old.segments().iter().any(|s| s.id() == *id));
        if !all_present {
            merge.segment.mark_obsolete();
            let _ = merge.notify.send(());
            debug!(id = %merge.id, "merge discarded, source segments left the root");
            return;
        }

        // deletions accrued between planning and introduction, translated
        // into the merged segment's docnum space
        let mut new_deleted = RoaringBitmap::new();
        for old_id in &merge.old_ids {
            let seg = old
                .segments()
                .iter()
                .find(|s| s.id() == *old_id)
                .expect("old segment present");
            let translation = match merge.old_new_docnums.get(old_id) {
                Some(t) => t,
                None => {
                    self.poison(format!("merge record missing translation for {}", old_id));
                    let _ = merge.notify.send(());
                    return;
                }
            };
            if let Some(deleted) = seg.deleted() {
                for docno in deleted {
                    match translation.get(docno as usize) {
                        Some(&new_docno) if new_docno != DROPPED_DOC => {
                            new_deleted.insert(new_docno);
                        }
                        Some(_) => {} // dropped at merge time
                        None => {
                            self.poison(format!(
                                "translation for {} shorter than its segment",
                                old_id
                            ));
                            let _ = merge.notify.send(());
                            return;
                        }
                    }
                }
            }
        }

        let mut segments: Vec<SegmentSnapshot> = old
            .segments()
            .iter()
            .filter(|s| !merge.old_ids.contains(&s.id()))
            .cloned()
            .collect();
        let deleted = if new_deleted.is_empty() {
            None
        } else {
            Some(Arc::new(new_deleted))
        };
        segments.push(SegmentSnapshot::new(merge.segment.clone(), deleted));

        let epoch = self.publish(segments);

        // merged-out files may go once the last snapshot drops them
        for old_id in &merge.old_ids {
            if let Some(seg) = old.segments().iter().find(|s| s.id() == *old_id) {
                seg.segment().mark_obsolete();
            }
        }

        self.write_manifest();
        let _ = merge.notify.send(());
        debug!(epoch, id = %merge.id, merged = merge.old_ids.len(), "merge introduced");
    }

    /// Rewrite the manifest to match the current root's persisted set
    fn write_manifest(&self) {
        let root = self.current_root();
        let result = Manifest::from_snapshot(&root, self.next_segment_id.load(Ordering::SeqCst))
            .and_then(|m| manifest::write_manifest(&self.dir, &m));
        if let Err(err) = result {
            warn!(%err, "manifest write failed");
            self.events.on_event(&Event::AsyncError {
                kind: AsyncErrorKind::Manifest,
                detail: err.to_string(),
            });
        }
    }

    fn poison(&self, detail: String) {
        error!(%detail, "invariant violation, poisoning index");
        self.poisoned.store(true, Ordering::SeqCst);
        self.events.on_event(&Event::AsyncError {
            kind: AsyncErrorKind::Merge,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::AnalyzerConfig;
    use crate::document::Document;
    use crate::events::NullSink;
    use crate::segment::{file, segment_file_name, FileCleanup, SegmentData};
    use crossbeam_channel::{bounded, unbounded};
    use tempfile::TempDir;

    fn memory_segment(id: u64, docs: Vec<Document>) -> Arc<Segment> {
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        let data =
            SegmentData::from_analyzed(docs.iter().map(|d| analyzer.analyze(d)).collect()).unwrap();
        Arc::new(Segment::new_memory(SegmentId::new(id), data))
    }

    struct Harness {
        introducer: Introducer,
        _dir: TempDir,
        cleanup: Arc<FileCleanup>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let (_intro_tx, intro_rx) = unbounded();
        let (_close_tx, close_rx) = unbounded();
        let root = Arc::new(RwLock::new(IndexSnapshot::new(0, Vec::new())));
        Harness {
            introducer: Introducer {
                root,
                introductions: intro_rx,
                close: close_rx,
                dir: dir.path().to_path_buf(),
                next_segment_id: Arc::new(AtomicU64::new(100)),
                events: Arc::new(NullSink),
                poisoned: Arc::new(AtomicBool::new(false)),
            },
            _dir: dir,
            cleanup: Arc::new(FileCleanup::new()),
        }
    }

    fn applied_channel() -> (Sender<Result<()>>, Receiver<Result<()>>) {
        bounded(1)
    }

    fn introduce_docs(h: &Harness, seg_id: u64, docs: Vec<Document>) {
        let ids: Vec<String> = docs.iter().map(|d| d.id().to_string()).collect();
        let (tx, rx) = applied_channel();
        h.introducer.introduce_batch(BatchIntroduction {
            segment: Some(memory_segment(seg_id, docs)),
            obsolete_ids: ids,
            batch_epoch: seg_id,
            applied: tx,
        });
        rx.recv().unwrap().unwrap();
    }

    #[test]
    fn test_batch_appends_segment_and_bumps_epoch() {
        let h = harness();

        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);
        introduce_docs(&h, 2, vec![Document::new("b").with_field("body", "two")]);

        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), 2);
        assert_eq!(root.segment_count(), 2);
        assert_eq!(root.doc_count(), 2);
    }

    #[test]
    fn test_batch_update_supersedes_prior_copy() {
        let h = harness();

        introduce_docs(&h, 1, vec![Document::new("a").with_field("v", "1")]);
        introduce_docs(&h, 2, vec![Document::new("a").with_field("v", "2")]);

        let root = h.introducer.current_root();
        assert_eq!(root.doc_count(), 1);

        // the first segment carries a's docnum in its deleted bitmap
        let first = &root.segments()[0];
        assert_eq!(first.deleted().unwrap().len(), 1);
        assert!(first.deleted().unwrap().contains(0));

        let g = root.docnum_for_external_id("a").unwrap();
        let stored = root.stored_fields(g).unwrap();
        assert_eq!(stored.get("v").map(|s| s.as_str()), Some("2"));
    }

    #[test]
    fn test_delete_only_batch() {
        let h = harness();

        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);

        let (tx, rx) = applied_channel();
        h.introducer.introduce_batch(BatchIntroduction {
            segment: None,
            obsolete_ids: vec!["a".to_string()],
            batch_epoch: 2,
            applied: tx,
        });
        rx.recv().unwrap().unwrap();

        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), 2);
        assert_eq!(root.doc_count(), 0);
        assert_eq!(root.docnum_for_external_id("a"), None);
    }

    #[test]
    fn test_persisted_swap_preserves_live_set() {
        let h = harness();
        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);

        let root = h.introducer.current_root();
        let mem = root.segments()[0].segment().clone();
        let path = h.introducer.dir.join(segment_file_name(mem.id()));
        file::write(mem.data(), &path, 1024).unwrap();
        let data = file::open(&path).unwrap();
        let persisted = Arc::new(Segment::new_file(
            mem.id(),
            data,
            path.clone(),
            h.cleanup.clone(),
        ));

        let (tx, rx) = applied_channel();
        h.introducer.introduce_persisted(PersistedIntroduction {
            memory_id: mem.id(),
            segment: persisted,
            applied: tx,
        });
        rx.recv().unwrap().unwrap();

        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), 2);
        assert_eq!(root.segment_count(), 1);
        assert!(root.segments()[0].segment().is_persisted());
        assert_eq!(root.doc_count(), 1);
        assert!(root.docnum_for_external_id("a").is_some());

        // the manifest now names the persisted segment
        let manifest = manifest::load_manifest(&h.introducer.dir).unwrap().unwrap();
        assert!(manifest.contains(mem.id()));
    }

    #[test]
    fn test_persisted_swap_discarded_when_gone() {
        let h = harness();
        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);

        let dir = h.introducer.dir.clone();
        let path = dir.join(segment_file_name(SegmentId::new(9)));
        let data = memory_segment(9, vec![Document::new("z").with_field("body", "zz")]);
        file::write(data.data(), &path, 1024).unwrap();
        let persisted = Arc::new(Segment::new_file(
            SegmentId::new(9),
            file::open(&path).unwrap(),
            path.clone(),
            h.cleanup.clone(),
        ));

        let (tx, rx) = applied_channel();
        h.introducer.introduce_persisted(PersistedIntroduction {
            memory_id: SegmentId::new(9), // not in the root
            segment: persisted,
            applied: tx,
        });
        rx.recv().unwrap().unwrap();

        // no epoch bump, and the stray file is gone
        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), 1);
        assert!(!path.exists());
    }

    fn persist_all(h: &Harness) {
        let root = h.introducer.current_root();
        for seg in root.segments() {
            if seg.segment().is_persisted() {
                continue;
            }
            let mem = seg.segment().clone();
            let path = h.introducer.dir.join(segment_file_name(mem.id()));
            file::write(mem.data(), &path, 1024).unwrap();
            let persisted = Arc::new(Segment::new_file(
                mem.id(),
                file::open(&path).unwrap(),
                path,
                h.cleanup.clone(),
            ));
            let (tx, rx) = applied_channel();
            h.introducer.introduce_persisted(PersistedIntroduction {
                memory_id: mem.id(),
                segment: persisted,
                applied: tx,
            });
            rx.recv().unwrap().unwrap();
        }
    }

    fn merge_record(
        h: &Harness,
        new_id: u64,
        old_ids: &[SegmentId],
    ) -> (SegmentMerge, Receiver<()>, PathBuf) {
        let root = h.introducer.current_root();
        let olds: Vec<_> = old_ids
            .iter()
            .map(|id| {
                root.segments()
                    .iter()
                    .find(|s| s.id() == *id)
                    .unwrap()
                    .clone()
            })
            .collect();
        let datas: Vec<&SegmentData> = olds.iter().map(|s| s.segment().data()).collect();
        let drops: Vec<Option<&RoaringBitmap>> = olds.iter().map(|s| s.deleted()).collect();

        let path = h.introducer.dir.join(segment_file_name(SegmentId::new(new_id)));
        let translations = file::merge(&datas, &drops, &path, 1024).unwrap();
        let segment = Arc::new(Segment::new_file(
            SegmentId::new(new_id),
            file::open(&path).unwrap(),
            path.clone(),
            h.cleanup.clone(),
        ));

        let mut old_new_docnums = HashMap::new();
        for (i, id) in old_ids.iter().enumerate() {
            old_new_docnums.insert(*id, translations[i].clone());
        }

        let (notify_tx, notify_rx) = bounded(1);
        (
            SegmentMerge {
                id: SegmentId::new(new_id),
                old_ids: old_ids.to_vec(),
                old_new_docnums,
                segment,
                notify: notify_tx,
            },
            notify_rx,
            path,
        )
    }

    use std::path::PathBuf;

    #[test]
    fn test_merge_replaces_old_set() {
        let h = harness();
        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);
        introduce_docs(&h, 2, vec![Document::new("b").with_field("body", "two")]);
        persist_all(&h);

        let (record, notify_rx, _path) =
            merge_record(&h, 50, &[SegmentId::new(1), SegmentId::new(2)]);
        let epoch_before = h.introducer.current_root().epoch();
        h.introducer.introduce_merge(record);
        notify_rx.recv().unwrap();

        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), epoch_before + 1);
        assert_eq!(root.segment_count(), 1);
        assert_eq!(root.segments()[0].id(), SegmentId::new(50));
        assert_eq!(root.doc_count(), 2);
        assert!(root.docnum_for_external_id("a").is_some());
        assert!(root.docnum_for_external_id("b").is_some());

        let manifest = manifest::load_manifest(&h.introducer.dir).unwrap().unwrap();
        assert!(manifest.contains(SegmentId::new(50)));
        assert!(!manifest.contains(SegmentId::new(1)));
    }

    #[test]
    fn test_merge_translates_interval_deletions() {
        let h = harness();
        introduce_docs(
            &h,
            1,
            vec![
                Document::new("a").with_field("body", "one"),
                Document::new("b").with_field("body", "two"),
            ],
        );
        persist_all(&h);

        // plan-time view: nothing deleted yet
        let (record, notify_rx, _path) = merge_record(&h, 50, &[SegmentId::new(1)]);

        // deletion arrives between planning and introduction
        let (tx, rx) = applied_channel();
        h.introducer.introduce_batch(BatchIntroduction {
            segment: None,
            obsolete_ids: vec!["a".to_string()],
            batch_epoch: 9,
            applied: tx,
        });
        rx.recv().unwrap().unwrap();

        h.introducer.introduce_merge(record);
        notify_rx.recv().unwrap();

        let root = h.introducer.current_root();
        assert_eq!(root.segment_count(), 1);
        // the translated deletion masks "a" in the merged segment
        assert_eq!(root.doc_count(), 1);
        assert_eq!(root.docnum_for_external_id("a"), None);
        assert!(root.docnum_for_external_id("b").is_some());
    }

    #[test]
    fn test_merge_aborts_on_partial_overlap() {
        let h = harness();
        introduce_docs(&h, 1, vec![Document::new("a").with_field("body", "one")]);
        introduce_docs(&h, 2, vec![Document::new("b").with_field("body", "two")]);
        persist_all(&h);

        let (first, first_rx, _p) =
            merge_record(&h, 50, &[SegmentId::new(1), SegmentId::new(2)]);
        let (second, second_rx, second_path) =
            merge_record(&h, 51, &[SegmentId::new(1), SegmentId::new(2)]);

        h.introducer.introduce_merge(first);
        first_rx.recv().unwrap();
        let epoch_after_first = h.introducer.current_root().epoch();

        // the second merge names segments that already left the root
        h.introducer.introduce_merge(second);
        second_rx.recv().unwrap();

        let root = h.introducer.current_root();
        assert_eq!(root.epoch(), epoch_after_first);
        assert_eq!(root.segments()[0].id(), SegmentId::new(50));
        // the losing merge's file is removed
        assert!(!second_path.exists());
        assert!(!h.introducer.poisoned.load(Ordering::SeqCst));
    }
}
