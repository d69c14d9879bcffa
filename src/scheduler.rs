//! Replays an ingested batch: a cold-start burst that seeds forecaster
//! history, then one reading per timer tick.

use crate::error::ControlError;
use crate::gateway::{PersistenceGateway, SaveOutcome};
use crate::reading::Reading;
use arc_swap::ArcSwap;
use chrono::Utc;
use crossbeam::queue::SegQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lock-free FIFO whose whole contents can be swapped in one step.
#[derive(Default)]
pub struct PendingQueue {
    inner: ArcSwap<SegQueue<Reading>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, readings: Vec<Reading>) {
        let queue = SegQueue::new();
        for reading in readings {
            queue.push(reading);
        }
        self.inner.store(Arc::new(queue));
    }

    pub fn pop(&self) -> Option<Reading> {
        self.inner.load().pop()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    pub fn clear(&self) {
        self.inner.store(Arc::new(SegQueue::new()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SchedulerState {
    Stopped = 0,
    Burst = 1,
    Steady = 2,
    Finished = 3,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::Burst,
            2 => SchedulerState::Steady,
            3 => SchedulerState::Finished,
            _ => SchedulerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Emitted(SaveOutcome),
    Finished,
}

pub struct Scheduler {
    queue: PendingQueue,
    gateway: Arc<PersistenceGateway>,
    state: AtomicU8,
    burst_size: usize,
    tick_interval: Duration,
    transitions: Mutex<()>,
}

impl Scheduler {
    pub fn new(gateway: Arc<PersistenceGateway>, burst_size: usize, tick_interval: Duration) -> Self {
        Self {
            queue: PendingQueue::new(),
            gateway,
            state: AtomicU8::new(SchedulerState::Stopped as u8),
            burst_size,
            tick_interval,
            transitions: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn load_queue(&self, readings: Vec<Reading>) {
        let count = readings.len();
        self.queue.replace(readings);
        tracing::info!(count, "pending queue loaded");
    }

    pub fn clear_queue(&self) {
        self.queue.clear();
    }

    /// Starts emission. A cold store gets an immediate burst first; a warm
    /// store goes straight to steady ticks.
    pub async fn start(&self) -> Result<SchedulerState, ControlError> {
        let _transition = self.transitions.lock().await;
        match self.state() {
            SchedulerState::Burst | SchedulerState::Steady => return Ok(self.state()),
            SchedulerState::Stopped | SchedulerState::Finished => {}
        }
        if self.queue.is_empty() {
            return Err(ControlError::EmptyQueue);
        }

        let existing = self.gateway.record_count().await;
        if existing > 0 {
            tracing::info!(existing, pending = self.queue.len(), "store warm; starting steady emission");
            self.set_state(SchedulerState::Steady);
            return Ok(SchedulerState::Steady);
        }

        self.set_state(SchedulerState::Burst);
        let mut emitted = 0usize;
        while emitted < self.burst_size && self.state() == SchedulerState::Burst {
            let Some(reading) = self.queue.pop() else {
                break;
            };
            self.gateway.save(reading).await;
            emitted += 1;
        }
        tracing::info!(emitted, pending = self.queue.len(), "cold-start burst complete");

        if self
            .state
            .compare_exchange(
                SchedulerState::Burst as u8,
                SchedulerState::Steady as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            tracing::info!(state = ?self.state(), "scheduler stopped during burst");
        }
        Ok(self.state())
    }

    pub fn stop(&self) {
        let previous = SchedulerState::from_u8(self.state.swap(SchedulerState::Stopped as u8, Ordering::SeqCst));
        tracing::info!(?previous, pending = self.queue.len(), "scheduler stopped");
    }

    /// One steady-state step: pop, restamp and forward a reading.
    pub async fn tick(&self) -> TickOutcome {
        if self.state() != SchedulerState::Steady {
            return TickOutcome::Idle;
        }
        let _transition = self.transitions.lock().await;
        if self.state() != SchedulerState::Steady {
            return TickOutcome::Idle;
        }
        let Some(mut reading) = self.queue.pop() else {
            self.set_state(SchedulerState::Finished);
            tracing::info!("pending queue drained; scheduler finished");
            return TickOutcome::Finished;
        };
        reading.stamp(Utc::now().naive_utc());
        TickOutcome::Emitted(self.gateway.save(reading).await)
    }

    pub fn spawn_timer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}
