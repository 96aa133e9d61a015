//! The merger: plans and executes segment merges
//!
//! The planner runs over the root snapshot and sees only persisted
//! segments. Each plan's tasks are drawn from a bounded queue by
//! min(task count, parallelism) short-lived workers. A worker builds the
//! merged file, opens it, and submits a merge record to the introducer with
//! a notification channel; the loop then waits for every acknowledgement.
//! Between rounds the merger hands the persister a one-shot wake channel
//! and re-checks the root before sleeping, so no work is lost when a new
//! root arrives during the handshake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{AsyncErrorKind, Event, EventSink};
use crate::segment::{file, segment_file_name, FileCleanup, Segment, SegmentData, SegmentId};

use super::introducer::{Introduction, SegmentMerge};
use super::mergeplan::{MergePlan, MergePolicy, MergeTask, PlanSegment};
use super::snapshot::{IndexSnapshot, SegmentSnapshot};

pub(crate) struct Merger {
    pub root: Arc<RwLock<Arc<IndexSnapshot>>>,
    pub introductions: Sender<Introduction>,
    pub persister_notifier: Sender<Sender<()>>,
    pub close: Receiver<()>,
    pub dir: PathBuf,
    pub cleanup: Arc<FileCleanup>,
    pub policy: Arc<dyn MergePolicy>,
    pub workers: usize,
    pub chunk_factor: u32,
    pub next_segment_id: Arc<AtomicU64>,
    pub events: Arc<dyn EventSink>,
}

impl Merger {
    pub(crate) fn run(self) {
        let mut last_epoch_planned: Option<u64> = None;

        loop {
            if self.closing() {
                break;
            }

            let snapshot = self.acquire_root();
            if last_epoch_planned != Some(snapshot.epoch()) {
                match self.plan_at_snapshot(&snapshot) {
                    Ok(tasks) => {
                        last_epoch_planned = Some(snapshot.epoch());
                        if tasks > 0 {
                            self.events.on_event(&Event::MergerProgress {
                                epoch: snapshot.epoch(),
                                tasks,
                            });
                        }
                    }
                    Err(err) => {
                        warn!(%err, "merge planning failed");
                        self.events.on_event(&Event::AsyncError {
                            kind: AsyncErrorKind::Merge,
                            detail: err.to_string(),
                        });
                        snapshot.dec_ref();
                        continue;
                    }
                }
            }
            snapshot.dec_ref();

            // ask the persister to stay active until progress is observed
            let (wake_tx, wake_rx) = bounded(1);
            let sent = select! {
                recv(self.close) -> _ => false,
                send(self.persister_notifier, wake_tx) -> res => res.is_ok(),
            };
            if !sent {
                break;
            }

            // a new root may have landed during the handshake; re-check
            // before sleeping so that work is not lost
            let snapshot = self.acquire_root();
            if last_epoch_planned != Some(snapshot.epoch()) {
                if let Ok(tasks) = self.plan_at_snapshot(&snapshot) {
                    last_epoch_planned = Some(snapshot.epoch());
                    if tasks > 0 {
                        self.events.on_event(&Event::MergerProgress {
                            epoch: snapshot.epoch(),
                            tasks,
                        });
                    }
                }
            }
            snapshot.dec_ref();

            select! {
                recv(self.close) -> _ => break,
                recv(wake_rx) -> _ => {}
            }
        }
        debug!("merger exiting");
    }

    fn acquire_root(&self) -> Arc<IndexSnapshot> {
        let guard = self.root.read();
        let snapshot = guard.clone();
        snapshot.add_ref();
        snapshot
    }

    fn closing(&self) -> bool {
        matches!(self.close.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Plan over the snapshot's persisted segments and execute the result.
    /// Returns the number of tasks run.
    fn plan_at_snapshot(&self, snapshot: &IndexSnapshot) -> Result<usize> {
        let candidates: Vec<PlanSegment> = snapshot
            .segments()
            .iter()
            .filter(|s| s.segment().is_persisted())
            .map(|s| PlanSegment {
                id: s.id(),
                doc_count: s.full_count(),
                live_doc_count: s.live_count(),
            })
            .collect();

        let plan = self.policy.plan(&candidates)?;
        if plan.is_empty() {
            return Ok(0);
        }

        let task_count = plan.tasks.len();
        let errors = self.execute_plan(snapshot, plan);
        for detail in errors {
            warn!(%detail, "merge task failed");
            self.events.on_event(&Event::AsyncError {
                kind: AsyncErrorKind::Merge,
                detail,
            });
        }
        Ok(task_count)
    }

    /// Run the plan's tasks on a bounded worker pool, then wait for all
    /// introducer acknowledgements
    fn execute_plan(&self, snapshot: &IndexSnapshot, plan: MergePlan) -> Vec<String> {
        let task_count = plan.tasks.len();
        let workers = self.workers.max(1).min(task_count);

        let (task_tx, task_rx) = bounded::<MergeTask>(task_count);
        for task in plan.tasks {
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let notifications: Mutex<Vec<(Receiver<()>, String)>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let errors = &errors;
                let notifications = &notifications;
                scope.spawn(move || {
                    while let Ok(task) = task_rx.recv() {
                        if self.closing() {
                            return;
                        }
                        match self.merge_task(snapshot, &task) {
                            Ok(Some(pending)) => notifications.lock().push(pending),
                            Ok(None) => return, // closing, task abandoned
                            Err(err) => errors.lock().push(err.to_string()),
                        }
                    }
                });
            }
        });

        for (notify_rx, filename) in notifications.into_inner() {
            select! {
                recv(self.close) -> _ => {}
                recv(notify_rx) -> _ => {}
            }
            self.cleanup.unmark_ineligible(&filename);
        }

        errors.into_inner()
    }

    /// Build one merged segment and submit it for introduction. Returns the
    /// pending acknowledgement, or None when the index is closing.
    fn merge_task(
        &self,
        snapshot: &IndexSnapshot,
        task: &MergeTask,
    ) -> Result<Option<(Receiver<()>, String)>> {
        let mut olds: Vec<&SegmentSnapshot> = Vec::with_capacity(task.segment_ids.len());
        for id in &task.segment_ids {
            match snapshot.segments().iter().find(|s| s.id() == *id) {
                Some(seg) => olds.push(seg),
                None => return Err(crate::error::TrawlError::SegmentNotFound(*id)),
            }
        }

        let new_id = SegmentId::new(self.next_segment_id.fetch_add(1, Ordering::SeqCst));
        let filename = segment_file_name(new_id);
        let path = self.dir.join(&filename);

        self.cleanup.mark_ineligible(&filename);

        let datas: Vec<&SegmentData> = olds.iter().map(|s| s.segment().data()).collect();
        let drops: Vec<Option<&RoaringBitmap>> = olds.iter().map(|s| s.deleted()).collect();

        let translations = match file::merge(&datas, &drops, &path, self.chunk_factor) {
            Ok(translations) => translations,
            Err(err) => {
                self.cleanup.unmark_ineligible(&filename);
                return Err(err);
            }
        };
        let data = match file::open(&path) {
            Ok(data) => data,
            Err(err) => {
                self.cleanup.unmark_ineligible(&filename);
                return Err(err);
            }
        };

        let segment = Arc::new(Segment::new_file(
            new_id,
            data,
            path.clone(),
            self.cleanup.clone(),
        ));

        let mut old_new_docnums = HashMap::with_capacity(task.segment_ids.len());
        for (i, id) in task.segment_ids.iter().enumerate() {
            old_new_docnums.insert(*id, translations[i].clone());
        }

        let (notify_tx, notify_rx) = bounded(1);
        let record = Introduction::Merge(SegmentMerge {
            id: new_id,
            old_ids: task.segment_ids.clone(),
            old_new_docnums,
            segment,
            notify: notify_tx,
        });

        let sent = select! {
            recv(self.close) -> _ => false,
            send(self.introductions, record) -> res => res.is_ok(),
        };
        if !sent {
            // abandon the partially introduced segment
            self.cleanup.unmark_ineligible(&filename);
            self.cleanup.request_removal(&path);
            return Ok(None);
        }

        debug!(id = %new_id, inputs = task.segment_ids.len(), "merge submitted");
        Ok(Some((notify_rx, filename)))
    }
}
