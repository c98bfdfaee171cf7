//! Worker-pool lookup: the same algorithm as the serial router, with waves
//! dispatched to a fixed pool over a bounded work queue
//!
//! Each lookup carries its own shared record: candidate sets the workers
//! fold results into, a found slot the first value hit promotes, and a stop
//! flag that makes late workers drain silently. The pool is shut down with
//! one sentinel per worker.

use super::{
    classify_returned, issue_rpc, k_closest, seed_candidates, LookupKind, LookupResult, Router,
};
use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::node::Node;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Depth of the shared work queue
const WORK_QUEUE_DEPTH: usize = 64;

enum WorkItem {
    Query(Box<QueryJob>),
    Shutdown,
}

struct QueryJob {
    node: Arc<Node>,
    key: NodeId,
    kind: LookupKind,
    target: Contact,
    shared: Arc<LookupShared>,
}

#[derive(Default)]
struct CandidateSets {
    closer: Vec<Contact>,
    further: Vec<Contact>,
}

struct FoundValue {
    value: Vec<u8>,
    found_by: Contact,
}

/// Per-lookup state shared between the scheduling loop and the workers
struct LookupShared {
    sets: Mutex<CandidateSets>,
    found: Mutex<Option<FoundValue>>,
    stop_work: AtomicBool,
}

impl LookupShared {
    fn new(closer: Vec<Contact>, further: Vec<Contact>) -> Arc<Self> {
        Arc::new(Self {
            sets: Mutex::new(CandidateSets { closer, further }),
            found: Mutex::new(None),
            stop_work: AtomicBool::new(false),
        })
    }
}

/// Parallel lookup driver over a fixed worker pool
pub struct ParallelRouter {
    config: DhtConfig,
    work_tx: mpsc::Sender<WorkItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ParallelRouter {
    pub fn new(config: DhtConfig) -> Self {
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_DEPTH);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut workers = Vec::with_capacity(config.max_threads);
        for worker_id in 0..config.max_threads {
            let work_rx = work_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    match item {
                        Some(WorkItem::Query(job)) => run_job(*job).await,
                        Some(WorkItem::Shutdown) | None => {
                            debug!(worker_id, "lookup worker stopping");
                            break;
                        }
                    }
                }
            }));
        }

        Self {
            config,
            work_tx,
            workers: Mutex::new(workers),
        }
    }

    async fn enqueue(&self, job: QueryJob) {
        if self
            .work_tx
            .send(WorkItem::Query(Box::new(job)))
            .await
            .is_err()
        {
            debug!("work queue closed; dropping lookup job");
        }
    }

    fn take_found(shared: &LookupShared, k: usize, key: &NodeId) -> Option<LookupResult> {
        let found = shared.found.lock().take()?;
        shared.stop_work.store(true, Ordering::SeqCst);

        let sets = shared.sets.lock();
        let mut encountered = sets.closer.clone();
        encountered.extend(sets.further.iter().cloned());
        Some(LookupResult {
            found: true,
            contacts: k_closest(encountered, key, k),
            found_by: Some(found.found_by),
            value: Some(found.value),
        })
    }
}

async fn run_job(job: QueryJob) {
    if job.shared.stop_work.load(Ordering::SeqCst) {
        return;
    }

    match issue_rpc(&job.node, job.kind, job.key, &job.target).await {
        Err(e) => {
            debug!(peer = %job.target.id, "lookup rpc failed: {e}");
            job.node.report_error(&e, &job.target).await;
        }
        Ok((returned, value)) => {
            {
                let mut sets = job.shared.sets.lock();
                let CandidateSets { closer, further } = &mut *sets;
                classify_returned(
                    job.node.our_id(),
                    job.key,
                    &job.target,
                    returned,
                    closer,
                    further,
                );
            }
            if let Some(value) = value {
                if !job.shared.stop_work.load(Ordering::SeqCst) {
                    let mut found = job.shared.found.lock();
                    // first hit wins; later hits are duplicates
                    if found.is_none() {
                        *found = Some(FoundValue {
                            value,
                            found_by: job.target.clone(),
                        });
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Router for ParallelRouter {
    async fn lookup(
        &self,
        node: &Arc<Node>,
        key: NodeId,
        kind: LookupKind,
    ) -> Result<LookupResult> {
        let initial = node.bucket_list().close_contacts(&key, None).await;
        if initial.is_empty() {
            return Err(Error::AllBucketsEmpty);
        }

        let mut closer = Vec::new();
        let mut further = Vec::new();
        let wave = seed_candidates(
            node.our_id(),
            key,
            self.config.alpha,
            &initial,
            &mut closer,
            &mut further,
        );

        let shared = LookupShared::new(closer, further);
        let mut contacted: HashSet<NodeId> = HashSet::new();
        let mut ret: Vec<Contact> = Vec::new();

        contacted.extend(wave.iter().map(|c| c.id));
        for target in wave {
            self.enqueue(QueryJob {
                node: node.clone(),
                key,
                kind,
                target,
                shared: shared.clone(),
            })
            .await;
        }
        let mut last_wave = Instant::now();

        loop {
            tokio::time::sleep(self.config.response_wait).await;

            if let Some(found) = Self::take_found(&shared, self.config.k, &key) {
                return Ok(found);
            }

            let (closer_uncontacted, further_uncontacted) = {
                let sets = shared.sets.lock();
                for contact in &sets.closer {
                    if !ret.iter().any(|c| c.id == contact.id) {
                        ret.push(contact.clone());
                    }
                }
                (
                    sets.closer
                        .iter()
                        .filter(|c| !contacted.contains(&c.id))
                        .cloned()
                        .collect::<Vec<_>>(),
                    sets.further
                        .iter()
                        .filter(|c| !contacted.contains(&c.id))
                        .cloned()
                        .collect::<Vec<_>>(),
                )
            };

            if ret.len() >= self.config.k {
                break;
            }

            let wave: Vec<Contact> = if !closer_uncontacted.is_empty() {
                closer_uncontacted.into_iter().take(self.config.alpha).collect()
            } else {
                further_uncontacted
                    .into_iter()
                    .take(self.config.alpha)
                    .collect()
            };

            if wave.is_empty() {
                // no candidates left: wait out the watchdog in case an
                // in-flight reply still widens the sets
                if last_wave.elapsed() >= self.config.query_time {
                    break;
                }
                continue;
            }

            contacted.extend(wave.iter().map(|c| c.id));
            for target in wave {
                self.enqueue(QueryJob {
                    node: node.clone(),
                    key,
                    kind,
                    target,
                    shared: shared.clone(),
                })
                .await;
            }
            last_wave = Instant::now();
        }

        // one final check: a worker may have hit the value while we decided
        // to stop
        if let Some(found) = Self::take_found(&shared, self.config.k, &key) {
            return Ok(found);
        }
        shared.stop_work.store(true, Ordering::SeqCst);

        ret.extend(initial);
        Ok(LookupResult {
            found: false,
            contacts: k_closest(ret, &key, self.config.k),
            found_by: None,
            value: None,
        })
    }

    /// Sentinel-driven shutdown: one per worker, then join
    async fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            if self.work_tx.send(WorkItem::Shutdown).await.is_err() {
                break;
            }
        }
        for worker in workers {
            let _ = worker.await;
        }
    }
}
