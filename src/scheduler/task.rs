//! Long-lived task lifecycle
//!
//! A task is not a one-shot job: it is driven repeatedly by a worker thread,
//! paused between acquisitions and resumed without leaving its thread.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::{TASK_IDLE_SLEEP, TASK_THROTTLE_SLEEP};

/// Scheduling priority of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// Pool-wide priority threshold
///
/// Tasks below the target skip their work until it is lowered again. Raising
/// it to `High` while frames arrive keeps receivers alone on the CPU.
#[derive(Debug, Clone)]
pub struct PriorityGate {
    target: Arc<AtomicU8>,
}

impl PriorityGate {
    pub fn new(target: Priority) -> Self {
        Self {
            target: Arc::new(AtomicU8::new(target as u8)),
        }
    }

    pub fn set(&self, target: Priority) {
        self.target.store(target as u8, Ordering::Release);
    }

    pub fn target(&self) -> Priority {
        Priority::from_u8(self.target.load(Ordering::Acquire))
    }

    /// Whether a task of `priority` may run now
    pub fn admits(&self, priority: Priority) -> bool {
        priority >= self.target()
    }
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self::new(Priority::Low)
    }
}

/// Keeps the gate at `High` until the requested frames have arrived
///
/// Decoders are the only consumers of the raw pool, so the gate drops to
/// `Normal` whenever the pool is down to `low_water` free slots and goes
/// back up once `high_water` slots are free again.
#[derive(Debug, Clone)]
pub struct ReceptionThrottle {
    gate: PriorityGate,
    requested: Arc<AtomicU64>,
    engaged: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    low_water: usize,
    high_water: usize,
}

impl ReceptionThrottle {
    pub fn new(gate: PriorityGate) -> Self {
        Self {
            gate,
            requested: Arc::new(AtomicU64::new(0)),
            engaged: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            low_water: 0,
            high_water: 1,
        }
    }

    /// Free raw slots at which decoders are let in, and at which they are
    /// held back again
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.low_water = low;
        self.high_water = high.max(low + 1);
        self
    }

    /// Watermarks for a pool with `usable` insertable slots
    pub fn for_pool(gate: PriorityGate, usable: usize) -> Self {
        let low = (usable / 4).max(1);
        Self::new(gate).with_watermarks(low, usable / 2)
    }

    /// Raise the gate until `requested` frames were received
    ///
    /// Without a frame count there is no end of reception to wait for, so
    /// the gate stays low.
    pub fn engage(&self, requested: u64) {
        self.requested.store(requested, Ordering::Release);
        self.draining.store(false, Ordering::Release);
        let engaged = requested > 0;
        self.engaged.store(engaged, Ordering::Release);
        self.gate.set(if engaged { Priority::High } else { Priority::Low });
    }

    pub fn release(&self) {
        self.draining.store(false, Ordering::Release);
        if self.engaged.swap(false, Ordering::AcqRel) {
            self.gate.set(Priority::Low);
            tracing::debug!("Reception finished, decoders released");
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Decoders are currently let in to free raw slots
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Report the frames received so far and the raw slots still free
    pub fn observe(&self, received: u64, free_slots: usize) {
        if !self.is_engaged() {
            return;
        }
        if received >= self.requested.load(Ordering::Acquire) {
            self.release();
            return;
        }

        if free_slots <= self.low_water {
            if !self.draining.swap(true, Ordering::AcqRel) {
                self.gate.set(Priority::Normal);
                tracing::debug!("Raw pool down to {} free slots, decoders admitted", free_slots);
            }
        } else if free_slots >= self.high_water && self.draining.swap(false, Ordering::AcqRel) {
            self.gate.set(Priority::High);
        }
        // a release racing the lines above must still leave the gate low
        if !self.is_engaged() {
            self.gate.set(Priority::Low);
        }
    }
}

/// Outcome of one task iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Work was done, iterate again right away
    Busy,
    /// Nothing to do, back off briefly
    Idle,
}

/// A long-running unit of work driven by the scheduler
pub trait Task: Send {
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Called on the worker thread each time the task is (re)started
    fn on_start(&mut self) {}

    /// One iteration of work. Loops inside a step should give up once
    /// `control.is_running()` turns false.
    fn step(&mut self, control: &TaskControl) -> Step;

    /// Called once before the worker thread lets go of the task
    fn on_exit(&mut self) {}
}

#[derive(Debug)]
struct ControlState {
    paused: bool,
    exit: bool,
    /// Incremented by every `start`
    epoch: u64,
    /// Epoch whose `on_start` has run
    started: u64,
    /// Blocked waiting for `start`
    parked: bool,
    finished: bool,
}

pub(crate) enum Wake {
    Run(u64),
    Exit,
}

/// Start/stop/exit switch shared between a task and its owner
#[derive(Debug)]
pub struct TaskControl {
    name: String,
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl TaskControl {
    /// New control, paused until the first `start`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ControlState {
                paused: true,
                exit: false,
                epoch: 0,
                started: 0,
                parked: true,
                finished: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.exit {
            return;
        }
        state.paused = false;
        state.epoch += 1;
        self.wake.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        self.wake.notify_all();
    }

    /// Terminal: the worker thread returns after the current step
    pub fn exit(&self) {
        let mut state = self.state.lock();
        state.exit = true;
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        !state.paused && !state.exit
    }

    pub fn is_exiting(&self) -> bool {
        self.state.lock().exit
    }

    pub fn is_parked(&self) -> bool {
        self.state.lock().parked
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Block until the task is parked after `stop`, or gone after `exit`
    pub fn wait_parked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !(state.parked || state.finished) {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.parked || state.finished;
            }
        }
        true
    }

    /// Block until the task ran `on_start` for the latest `start`
    pub fn wait_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.started != state.epoch && !state.exit && !state.finished {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.started == state.epoch;
            }
        }
        true
    }

    /// Repeat `attempt` every `interval` until it succeeds or the task
    /// is stopped
    pub fn retry_until(&self, interval: Duration, mut attempt: impl FnMut() -> bool) -> bool {
        loop {
            if attempt() {
                return true;
            }
            if !self.is_running() {
                return false;
            }
            thread::sleep(interval);
        }
    }

    pub(crate) fn wait_for_work(&self) -> Wake {
        let mut state = self.state.lock();
        loop {
            if state.exit {
                return Wake::Exit;
            }
            if !state.paused {
                state.parked = false;
                return Wake::Run(state.epoch);
            }
            if !state.parked {
                state.parked = true;
                self.wake.notify_all();
            }
            self.wake.wait(&mut state);
        }
    }

    pub(crate) fn mark_started(&self, epoch: u64) {
        let mut state = self.state.lock();
        state.started = state.started.max(epoch);
        self.wake.notify_all();
    }

    pub(crate) fn mark_finished(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        state.parked = false;
        self.wake.notify_all();
    }
}

/// Run `task` until its control is told to exit
pub(crate) fn drive(task: &mut dyn Task, control: &TaskControl, gate: &PriorityGate) {
    let mut epoch = 0;
    loop {
        match control.wait_for_work() {
            Wake::Exit => break,
            Wake::Run(current) if current != epoch => {
                epoch = current;
                task.on_start();
                control.mark_started(epoch);
            }
            Wake::Run(_) => {}
        }

        if !gate.admits(task.priority()) {
            thread::sleep(TASK_THROTTLE_SLEEP);
            continue;
        }

        if task.step(control) == Step::Idle {
            thread::sleep(TASK_IDLE_SLEEP);
        }
    }
    task.on_exit();
    control.mark_finished();
}
