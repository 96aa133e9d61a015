//! The persister: drives in-memory segments to stable storage
//!
//! Each cycle observes the current root, writes every in-memory segment to
//! its file (temp + fsync + atomic rename), and asks the introducer to swap
//! the representations. The filename is held ineligible for removal from
//! the moment writing starts until the introduction is acknowledged, so a
//! crash between rename and introduction can only leave an orphan file for
//! startup recovery to sweep. Between cycles the persister sleeps on its
//! notifier channel; wakers hand over one-shot channels that are answered
//! after the next cycle completes.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::events::{AsyncErrorKind, Event, EventSink};
use crate::segment::{file, segment_file_name, FileCleanup, Segment};

use super::introducer::{Introduction, PersistedIntroduction};
use super::snapshot::IndexSnapshot;

pub(crate) struct Persister {
    pub root: Arc<RwLock<Arc<IndexSnapshot>>>,
    pub introductions: Sender<Introduction>,
    pub notifier: Receiver<Sender<()>>,
    pub close: Receiver<()>,
    pub dir: PathBuf,
    pub cleanup: Arc<FileCleanup>,
    pub chunk_factor: u32,
    pub events: Arc<dyn EventSink>,
}

impl Persister {
    pub(crate) fn run(self) {
        // watchers stay pending until a cycle observes progress, so a waker
        // is never answered with a stale root
        let mut watchers: Vec<Sender<()>> = Vec::new();
        let mut last_observed_epoch: Option<u64> = None;

        loop {
            select! {
                recv(self.close) -> _ => break,
                recv(self.notifier) -> watcher => match watcher {
                    Ok(watcher) => watchers.push(watcher),
                    Err(_) => break,
                },
            }
            while let Ok(watcher) = self.notifier.try_recv() {
                watchers.push(watcher);
            }

            let snapshot = {
                let guard = self.root.read();
                let snapshot = guard.clone();
                snapshot.add_ref();
                snapshot
            };
            let epoch = snapshot.epoch();
            let has_memory = snapshot
                .segments()
                .iter()
                .any(|s| !s.segment().is_persisted());

            // nothing new since the last cycle: hold the watchers and sleep
            if last_observed_epoch == Some(epoch) && !has_memory {
                snapshot.dec_ref();
                continue;
            }
            last_observed_epoch = Some(epoch);

            let persisted = self.persist_snapshot(&snapshot);
            snapshot.dec_ref();

            match persisted {
                Some(persisted) => {
                    if persisted > 0 {
                        self.events
                            .on_event(&Event::PersisterProgress { epoch, persisted });
                        debug!(epoch, persisted, "persister progress");
                    }
                }
                // closing mid-cycle
                None => break,
            }

            for watcher in watchers.drain(..) {
                let _ = watcher.send(());
            }
        }
        debug!("persister exiting");
    }

    /// Write every in-memory segment of `snapshot` to disk and introduce
    /// the swaps. Returns None when the index is closing.
    fn persist_snapshot(&self, snapshot: &IndexSnapshot) -> Option<usize> {
        let mut persisted = 0;

        for seg_snap in snapshot.segments() {
            if seg_snap.segment().is_persisted() {
                continue;
            }
            if self.closing() {
                return None;
            }

            let memory = seg_snap.segment();
            let id = memory.id();
            let filename = segment_file_name(id);
            let path = self.dir.join(&filename);

            self.cleanup.mark_ineligible(&filename);

            let opened = file::write(memory.data(), &path, self.chunk_factor)
                .and_then(|_| file::open(&path));
            let data = match opened {
                Ok(data) => data,
                Err(err) => {
                    // retried on the next cycle
                    self.cleanup.unmark_ineligible(&filename);
                    warn!(%id, %err, "segment persist failed");
                    self.events.on_event(&Event::AsyncError {
                        kind: AsyncErrorKind::Persist,
                        detail: format!("{}: {}", id, err),
                    });
                    continue;
                }
            };

            let segment = Arc::new(Segment::new_file(id, data, path, self.cleanup.clone()));
            let (applied_tx, applied_rx) = bounded(1);
            let introduction = Introduction::Persisted(PersistedIntroduction {
                memory_id: id,
                segment,
                applied: applied_tx,
            });

            let sent = select! {
                recv(self.close) -> _ => false,
                send(self.introductions, introduction) -> res => res.is_ok(),
            };
            if !sent {
                self.cleanup.unmark_ineligible(&filename);
                return None;
            }
            let acked = select! {
                recv(self.close) -> _ => false,
                recv(applied_rx) -> res => res.is_ok(),
            };
            if !acked {
                self.cleanup.unmark_ineligible(&filename);
                return None;
            }

            self.cleanup.unmark_ineligible(&filename);
            persisted += 1;
        }

        Some(persisted)
    }

    fn closing(&self) -> bool {
        matches!(
            self.close.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }
}
