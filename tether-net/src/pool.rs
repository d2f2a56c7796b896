// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Fixed-capacity task pool with a non-blocking poll protocol
//!
//! Each slot runs at most one task on its own OS thread. Callers keep a
//! [`TaskId`] and poll it; the payload handed to [`TaskPool::dispatch`] is
//! mutated in place by the task body and is how results come back.
//!
//! # Slot lifecycle
//!
//! ```text
//! Idle --dispatch--> Running --body returns--> Completed --detach--> Idle
//!                       |                                   ^
//!                       +--detach (cleanup deferred)--------+ (when body returns)
//! ```
//!
//! Slot 0 is never dispatched to, so `TaskId::to_raw() == 0` can mean "no task".
//! Every dispatch bumps the slot's generation, so a handle kept past a detach
//! can never observe or detach the next task that reuses the slot.

use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Generation-tagged handle to a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: NonZeroU32,
    generation: u32,
}

impl TaskId {
    /// 1-based slot index
    pub fn index(&self) -> u32 {
        self.index.get()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single word; never returns 0
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index.get())
    }

    /// Unpack a word produced by [`TaskId::to_raw`]; 0 yields `None`
    pub fn from_raw(raw: u64) -> Option<Self> {
        let index = NonZeroU32::new((raw & 0xFFFF_FFFF) as u32)?;
        Some(Self {
            index,
            generation: (raw >> 32) as u32,
        })
    }
}

/// Result of [`TaskPool::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll<R> {
    /// Body has not returned yet
    Running,
    /// Body returned; carries whatever the inspector extracted from the payload
    Completed(R),
    /// No task behind this handle (never dispatched, detached, or recycled)
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Idle,
    Running,
    Completed,
}

type Cleanup<T> = Box<dyn FnOnce(T) + Send>;

struct SlotState<T> {
    status: SlotStatus,
    generation: u32,
    payload: Option<T>,
    cleanup: Option<Cleanup<T>>,
    thread: Option<JoinHandle<()>>,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                status: SlotStatus::Idle,
                generation: 0,
                payload: None,
                cleanup: None,
                thread: None,
            }),
        }
    }
}

/// Fixed-size pool of worker slots
pub struct TaskPool<T: Send + 'static> {
    slots: Vec<Arc<Slot<T>>>,
    metrics: Option<Metrics>,
}

impl<T: Send + 'static> TaskPool<T> {
    /// Allocate `max_concurrency + 1` slots; slot 0 stays reserved
    pub fn new(max_concurrency: u32) -> Self {
        let slots = (0..=max_concurrency).map(|_| Arc::new(Slot::new())).collect();
        Self {
            slots,
            metrics: None,
        }
    }

    /// Count saturation events into `metrics`
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of dispatchable slots
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// Slots currently running or holding an unclaimed result
    pub fn busy(&self) -> usize {
        self.slots
            .iter()
            .skip(1)
            .filter(|slot| slot.state.lock().status != SlotStatus::Idle)
            .count()
    }

    /// Run `task(&mut payload)` on the first idle slot
    ///
    /// Returns `None` when every slot is busy. This is a capacity condition the
    /// caller is expected to handle, not a failure.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to create a thread.
    pub fn dispatch<F>(&self, payload: T, task: F) -> Option<TaskId>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        for (index, slot) in self.slots.iter().enumerate().skip(1) {
            let mut state = slot.state.lock();
            if state.status != SlotStatus::Idle {
                continue;
            }

            state.generation = state.generation.wrapping_add(1);
            state.status = SlotStatus::Running;
            state.payload = None;
            state.cleanup = None;

            let generation = state.generation;
            let worker = Arc::clone(slot);
            let spawned = std::thread::Builder::new()
                .name(format!("tether-pool-{}", index))
                .spawn(move || run_task(worker, generation, payload, task));

            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Failed to spawn pool thread for slot {}: {}", index, e);
                    panic!("task pool could not create a thread: {}", e);
                }
            };

            // A previous thread on this slot already finished its body
            state.thread = Some(handle);

            let index = NonZeroU32::new(index as u32)?;
            debug!("Dispatched task to slot {} (generation {})", index, generation);
            return Some(TaskId { index, generation });
        }

        warn!("Task pool saturated: all {} slots busy", self.capacity());
        if let Some(metrics) = &self.metrics {
            metrics.record_pool_saturated();
        }
        None
    }

    /// Non-blocking status check; `inspect` sees the payload only once completed
    pub fn poll<R>(&self, id: TaskId, inspect: impl FnOnce(&T) -> R) -> TaskPoll<R> {
        let Some(slot) = self.slot(id) else {
            return TaskPoll::Idle;
        };

        let state = slot.state.lock();
        if state.generation != id.generation {
            return TaskPoll::Idle;
        }

        match state.status {
            // A detached task is no longer the caller's
            SlotStatus::Running if state.cleanup.is_some() => TaskPoll::Idle,
            SlotStatus::Running => TaskPoll::Running,
            SlotStatus::Completed => match state.payload.as_ref() {
                Some(payload) => TaskPoll::Completed(inspect(payload)),
                None => TaskPoll::Idle,
            },
            SlotStatus::Idle => TaskPoll::Idle,
        }
    }

    /// Stop caring about a task, dropping its payload when it is done
    pub fn detach(&self, id: TaskId) {
        self.detach_with(id, drop);
    }

    /// Stop caring about a task and run `cleanup` on its payload exactly once
    ///
    /// If the task is still running, `cleanup` runs on the task's own thread,
    /// under the slot lock, as soon as the body returns. If it already
    /// completed, `cleanup` runs before this call returns. Stale handles and
    /// repeated detaches are ignored.
    pub fn detach_with<C>(&self, id: TaskId, cleanup: C)
    where
        C: FnOnce(T) + Send + 'static,
    {
        let Some(slot) = self.slot(id) else {
            return;
        };

        let finished = {
            let mut state = slot.state.lock();
            if state.generation != id.generation {
                return;
            }

            match state.status {
                SlotStatus::Running => {
                    if state.cleanup.is_none() {
                        state.cleanup = Some(Box::new(cleanup));
                    }
                    return;
                }
                SlotStatus::Completed => {
                    state.status = SlotStatus::Idle;
                    state.payload.take()
                }
                SlotStatus::Idle => None,
            }
        };

        if let Some(payload) = finished {
            cleanup(payload);
        }
    }

    /// Detach every slot with `cleanup` and join every thread
    pub fn shutdown_with<C>(mut self, cleanup: C)
    where
        C: Fn(T) + Send + Sync + 'static,
    {
        self.teardown(Arc::new(cleanup));
    }

    fn teardown(&mut self, cleanup: Arc<dyn Fn(T) + Send + Sync>) {
        let slots = std::mem::take(&mut self.slots);

        for slot in slots.iter().skip(1) {
            let finished = {
                let mut state = slot.state.lock();
                match state.status {
                    SlotStatus::Running => {
                        if state.cleanup.is_none() {
                            let cleanup = Arc::clone(&cleanup);
                            state.cleanup = Some(Box::new(move |payload| cleanup(payload)));
                        }
                        None
                    }
                    SlotStatus::Completed => {
                        state.status = SlotStatus::Idle;
                        state.payload.take()
                    }
                    SlotStatus::Idle => None,
                }
            };

            if let Some(payload) = finished {
                cleanup(payload);
            }
        }

        for (index, slot) in slots.iter().enumerate().skip(1) {
            let handle = slot.state.lock().thread.take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("Pool thread for slot {} panicked during shutdown", index);
                }
            }
        }
    }

    fn slot(&self, id: TaskId) -> Option<&Arc<Slot<T>>> {
        self.slots.get(id.index.get() as usize)
    }
}

impl<T: Send + 'static> Drop for TaskPool<T> {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            self.teardown(Arc::new(|payload: T| drop(payload)));
        }
    }
}

fn run_task<T, F>(slot: Arc<Slot<T>>, generation: u32, mut payload: T, task: F)
where
    F: FnOnce(&mut T),
{
    if catch_unwind(AssertUnwindSafe(|| task(&mut payload))).is_err() {
        error!("Task in generation {} panicked", generation);
    }

    let mut state = slot.state.lock();
    if state.generation != generation {
        // Generation only changes while the slot is Idle
        return;
    }

    match state.cleanup.take() {
        Some(cleanup) => {
            cleanup(payload);
            state.status = SlotStatus::Idle;
        }
        None => {
            state.payload = Some(payload);
            state.status = SlotStatus::Completed;
        }
    }
}
