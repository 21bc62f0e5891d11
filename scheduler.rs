//! Bounded worker pool that generates cache artifacts in viewport order.
//!
//! Waiting requests are ordered by `(priority desc, request sequence asc)`, so a
//! higher priority always wins and ties go to the oldest request. Work already
//! running is only ever stopped cooperatively through its cancel flag.

use crate::artifacts::ArtifactProducer;
use crate::cache::ContentCache;
use crate::error::Error;
use crate::events::{EventBus, LibraryEvent};
use crate::models::{ArtifactKind, ContentHash};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Prefetch,
    NearVisible,
    Visible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Running,
    Done,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done | RequestState::Cancelled | RequestState::Failed)
    }
}

type Key = (ContentHash, ArtifactKind);
type QueueKey = (Reverse<Priority>, u64, Key);

struct RequestSlot {
    state: Mutex<RequestState>,
    changed: Condvar,
    cancel: AtomicBool,
}

impl RequestSlot {
    fn new(state: RequestState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
            cancel: AtomicBool::new(false),
        })
    }

    fn set(&self, state: RequestState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        self.changed.notify_all();
    }

    fn get(&self) -> RequestState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Caller's view of one (hash, kind) request. Handles for the same pair share state.
#[derive(Clone)]
pub struct RequestHandle {
    key: Key,
    slot: Arc<RequestSlot>,
}

impl RequestHandle {
    pub fn hash(&self) -> ContentHash {
        self.key.0
    }

    pub fn kind(&self) -> ArtifactKind {
        self.key.1
    }

    pub fn state(&self) -> RequestState {
        self.slot.get()
    }

    /// Blocks until the request is terminal or `timeout` elapses; returns the state seen last.
    pub fn wait_timeout(&self, timeout: Duration) -> RequestState {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock().unwrap_or_else(|p| p.into_inner());
        while !state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.slot.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *state
    }
}

struct Pending {
    slot: Arc<RequestSlot>,
    base: Priority,
    priority: Priority,
    seq: u64,
    index: Option<usize>,
    running: bool,
    preempted: bool,
}

#[derive(Default)]
struct Inner {
    queue: BTreeSet<QueueKey>,
    pending: HashMap<Key, Pending>,
    running: usize,
    seq: u64,
    visible: Option<(usize, usize)>,
    shutdown: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    work: Condvar,
    cache: Arc<ContentCache>,
    producer: Arc<dyn ArtifactProducer>,
    events: EventBus,
    concurrency: usize,
    prefetch_pages: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct PriorityScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

fn score(index: usize, visible: Option<(usize, usize)>, prefetch_pages: usize) -> Priority {
    let Some((first, last)) = visible else {
        return Priority::Background;
    };
    let page = last.saturating_sub(first) + 1;
    let distance = if index < first {
        first - index
    } else if index > last {
        index - last
    } else {
        return Priority::Visible;
    };
    if distance <= page {
        Priority::NearVisible
    } else if distance <= page * prefetch_pages {
        Priority::Prefetch
    } else {
        Priority::Background
    }
}

impl PriorityScheduler {
    pub fn new(
        concurrency: usize,
        prefetch_pages: usize,
        cache: Arc<ContentCache>,
        producer: Arc<dyn ArtifactProducer>,
        events: EventBus,
    ) -> crate::error::Result<Self> {
        let concurrency = concurrency.max(1);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            work: Condvar::new(),
            cache,
            producer,
            events,
            concurrency,
            prefetch_pages,
        });
        let mut workers = Vec::with_capacity(concurrency);
        for idx in 0..concurrency {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("artifact-worker-{idx}"))
                    .spawn(move || run_worker(shared))?,
            );
        }
        Ok(Self { shared, workers })
    }

    /// Enqueues generation of `kind` for `hash`, or raises the priority of an
    /// existing request for the same pair. `index` ties the request to a grid
    /// position so later visible-range changes re-score it.
    pub fn request(
        &self,
        hash: ContentHash,
        kind: ArtifactKind,
        priority: Priority,
        index: Option<usize>,
    ) -> RequestHandle {
        let key = (hash, kind);
        let prefetch_pages = self.shared.prefetch_pages;
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if let Some(pending) = inner.pending.get_mut(&key) {
            let old = pending.priority;
            pending.base = pending.base.max(priority);
            if index.is_some() {
                pending.index = index;
            }
            pending.priority = match pending.index {
                Some(i) => score(i, inner.visible, prefetch_pages).max(pending.base),
                None => pending.base,
            };
            // A live request revives a running job that was cancelled.
            if pending.running && !pending.preempted {
                pending.slot.cancel.store(false, Ordering::Relaxed);
            }
            let slot = pending.slot.clone();
            if !pending.running && pending.priority != old {
                inner.queue.remove(&(Reverse(old), pending.seq, key));
                inner.queue.insert((Reverse(pending.priority), pending.seq, key));
            }
            self.preempt_if_saturated(inner);
            return RequestHandle { key, slot };
        }

        if self.shared.cache.contains(&hash, kind) {
            return RequestHandle {
                key,
                slot: RequestSlot::new(RequestState::Done),
            };
        }

        inner.seq += 1;
        let seq = inner.seq;
        let effective = index
            .map(|i| score(i, inner.visible, prefetch_pages).max(priority))
            .unwrap_or(priority);
        let slot = RequestSlot::new(RequestState::Queued);
        inner.pending.insert(
            key,
            Pending {
                slot: slot.clone(),
                base: priority,
                priority: effective,
                seq,
                index,
                running: false,
                preempted: false,
            },
        );
        inner.queue.insert((Reverse(effective), seq, key));
        self.preempt_if_saturated(inner);
        drop(guard);
        self.shared.work.notify_one();
        RequestHandle { key, slot }
    }

    /// Re-scores every indexed request against the new viewport.
    pub fn set_visible_range(&self, first: usize, last: usize) {
        let (first, last) = (first.min(last), first.max(last));
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        inner.visible = Some((first, last));
        let prefetch_pages = self.shared.prefetch_pages;
        let mut moves = Vec::new();
        for (key, pending) in inner.pending.iter_mut() {
            let Some(index) = pending.index else {
                continue;
            };
            let next = score(index, Some((first, last)), prefetch_pages).max(pending.base);
            if next != pending.priority {
                if !pending.running {
                    moves.push(((Reverse(pending.priority), pending.seq, *key), (Reverse(next), pending.seq, *key)));
                }
                pending.priority = next;
            }
        }
        for (old, new) in moves {
            inner.queue.remove(&old);
            inner.queue.insert(new);
        }
        self.preempt_if_saturated(inner);
        drop(guard);
        self.shared.work.notify_all();
    }

    /// Best effort: a queued request is dropped, a running one is asked to stop
    /// and still fills the cache if it gets that far.
    pub fn cancel(&self, handle: &RequestHandle) {
        let mut inner = self.shared.lock();
        let Some(pending) = inner.pending.get(&handle.key) else {
            return;
        };
        if pending.running {
            pending.slot.cancel.store(true, Ordering::Relaxed);
            if let Some(pending) = inner.pending.get_mut(&handle.key) {
                pending.preempted = false;
            }
            return;
        }
        let queue_key = (Reverse(pending.priority), pending.seq, handle.key);
        inner.queue.remove(&queue_key);
        if let Some(pending) = inner.pending.remove(&handle.key) {
            pending.slot.set(RequestState::Cancelled);
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    pub fn priority_of(&self, handle: &RequestHandle) -> Option<Priority> {
        self.shared.lock().pending.get(&handle.key).map(|p| p.priority)
    }

    /// When every worker is busy, asks low-priority running work to yield to
    /// queued visible or near-visible requests. Yielded work is re-queued.
    fn preempt_if_saturated(&self, inner: &mut Inner) {
        if inner.running < self.shared.concurrency {
            return;
        }
        let urgent = inner
            .queue
            .iter()
            .take_while(|(Reverse(p), _, _)| *p >= Priority::NearVisible)
            .count();
        if urgent == 0 {
            return;
        }
        let mut victims: Vec<(Priority, Reverse<u64>, Key)> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.running && !p.preempted && p.priority <= Priority::Prefetch)
            .map(|(key, p)| (p.priority, Reverse(p.seq), *key))
            .collect();
        victims.sort();
        for (_, _, key) in victims.into_iter().take(urgent) {
            if let Some(pending) = inner.pending.get_mut(&key) {
                log::debug!("Preempting {:?} artifact for {}", key.1, key.0);
                pending.preempted = true;
                pending.slot.cancel.store(true, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.shutdown = true;
            for (_, pending) in inner.pending.iter() {
                pending.slot.cancel.store(true, Ordering::Relaxed);
                if !pending.running {
                    pending.slot.set(RequestState::Cancelled);
                }
            }
            inner.queue.clear();
        }
        self.shared.work.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let (key, slot) = {
            let mut inner = shared.lock();
            loop {
                if inner.shutdown {
                    return;
                }
                if let Some(next) = inner.queue.pop_first() {
                    let key = next.2;
                    if let Some(pending) = inner.pending.get_mut(&key) {
                        pending.running = true;
                        let slot = pending.slot.clone();
                        inner.running += 1;
                        break (key, slot);
                    }
                    continue;
                }
                inner = match shared.work.wait(inner) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        slot.set(RequestState::Running);

        let outcome = if shared.cache.contains(&key.0, key.1) {
            Ok(None)
        } else {
            shared
                .producer
                .produce(key.0, key.1, &slot.cancel)
                .map(Some)
        };
        let state = match outcome {
            Ok(None) => RequestState::Done,
            Ok(Some(bytes)) => match shared.cache.put(&key.0, key.1, bytes) {
                Ok(_) => {
                    shared.events.emit(LibraryEvent::ArtifactReady {
                        hash: key.0,
                        kind: key.1,
                    });
                    RequestState::Done
                }
                Err(err) => {
                    log::warn!("Storing {:?} artifact for {} failed: {}", key.1, key.0, err);
                    RequestState::Failed
                }
            },
            Err(Error::Cancelled) => RequestState::Cancelled,
            Err(err) => {
                log::warn!("Generating {:?} artifact for {} failed: {}", key.1, key.0, err);
                RequestState::Failed
            }
        };

        let mut inner = shared.lock();
        inner.running -= 1;
        let requeue = state == RequestState::Cancelled
            && !inner.shutdown
            && inner
                .pending
                .get(&key)
                .map(|p| p.preempted || !p.slot.cancel.load(Ordering::Relaxed))
                .unwrap_or(false);
        if requeue {
            if let Some(pending) = inner.pending.get_mut(&key) {
                pending.running = false;
                pending.preempted = false;
                pending.slot.cancel.store(false, Ordering::Relaxed);
                let queue_key = (Reverse(pending.priority), pending.seq, key);
                inner.queue.insert(queue_key);
            }
            drop(inner);
            slot.set(RequestState::Queued);
            shared.work.notify_one();
            continue;
        }
        inner.pending.remove(&key);
        drop(inner);
        slot.set(state);
    }
}
