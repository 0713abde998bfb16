//! Fixed-size worker pool for long-lived tasks

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::task::{drive, PriorityGate, Task, TaskControl};

struct Job {
    task: Box<dyn Task>,
    control: Arc<TaskControl>,
}

/// Worker threads consuming a queue of tasks
///
/// A worker keeps a task until the task exits, so the pool needs at least
/// as many threads as tasks that should run concurrently. Extra tasks wait
/// in the queue for a free worker.
pub struct TaskScheduler {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    controls: Vec<Arc<TaskControl>>,
    gate: PriorityGate,
}

impl TaskScheduler {
    /// Spawn `threads` worker threads
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let gate = PriorityGate::default();

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let gate = gate.clone();
                thread::Builder::new()
                    .name(format!("pixel-worker-{}", i))
                    .spawn(move || worker_loop(receiver, gate))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!("Task scheduler started with {} workers", workers.len());

        Ok(Self {
            sender: Some(sender),
            workers,
            controls: Vec::new(),
            gate,
        })
    }

    /// Shared priority threshold checked by every task
    pub fn gate(&self) -> PriorityGate {
        self.gate.clone()
    }

    /// Queue a task; it stays paused until started
    pub fn spawn(&mut self, task: Box<dyn Task>) -> Arc<TaskControl> {
        let control = Arc::new(TaskControl::new(task.name()));
        if self.controls.len() >= self.workers.len() {
            warn!(
                "Task '{}' queued behind {} tasks on {} workers",
                task.name(),
                self.controls.len(),
                self.workers.len()
            );
        }
        self.controls.push(control.clone());

        if let Some(sender) = &self.sender {
            let job = Job {
                task,
                control: control.clone(),
            };
            if sender.send(job).is_err() {
                warn!("Task scheduler is shut down, task dropped");
                control.mark_finished();
            }
        }
        control
    }

    pub fn start_all(&self) {
        self.controls.iter().for_each(|c| c.start());
    }

    pub fn stop_all(&self) {
        self.controls.iter().for_each(|c| c.stop());
    }

    /// Wait until every stopped task has parked
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.controls.iter().all(|c| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            c.wait_parked(remaining)
        })
    }

    pub fn task_count(&self) -> usize {
        self.controls.len()
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Exit all tasks and join the workers
    pub fn shutdown(&mut self) {
        if self.sender.is_none() {
            return;
        }
        self.controls.iter().for_each(|c| c.exit());
        // closing the queue releases idle workers
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        info!("Task scheduler stopped ({} tasks)", self.controls.len());
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>, gate: PriorityGate) {
    while let Ok(mut job) = receiver.recv() {
        debug!("Worker picked up task '{}'", job.task.name());
        drive(job.task.as_mut(), &job.control, &gate);
        debug!("Task '{}' exited", job.task.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Priority, Step};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct CountingTask {
        name: String,
        priority: Priority,
        steps: Arc<AtomicU64>,
        starts: Arc<AtomicUsize>,
        exits: Arc<AtomicUsize>,
    }

    impl Task for CountingTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn on_start(&mut self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn step(&mut self, _control: &TaskControl) -> Step {
            self.steps.fetch_add(1, Ordering::SeqCst);
            Step::Idle
        }

        fn on_exit(&mut self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counters {
        steps: Arc<AtomicU64>,
        starts: Arc<AtomicUsize>,
        exits: Arc<AtomicUsize>,
    }

    fn counting(name: &str, priority: Priority) -> (Box<dyn Task>, Counters) {
        let counters = Counters {
            steps: Arc::new(AtomicU64::new(0)),
            starts: Arc::new(AtomicUsize::new(0)),
            exits: Arc::new(AtomicUsize::new(0)),
        };
        let task = CountingTask {
            name: name.to_string(),
            priority,
            steps: counters.steps.clone(),
            starts: counters.starts.clone(),
            exits: counters.exits.clone(),
        };
        (Box::new(task), counters)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_start_stop_exit() {
        let mut scheduler = TaskScheduler::new(2).unwrap();
        let (task, counters) = counting("count", Priority::Normal);
        let control = scheduler.spawn(task);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(counters.steps.load(Ordering::SeqCst), 0);

        control.start();
        assert!(control.wait_started(Duration::from_secs(5)));
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert!(wait_for(|| counters.steps.load(Ordering::SeqCst) > 3));
        control.stop();
        assert!(control.wait_parked(Duration::from_secs(5)));
        let paused_at = counters.steps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counters.steps.load(Ordering::SeqCst), paused_at);

        control.start();
        assert!(wait_for(|| counters.steps.load(Ordering::SeqCst) > paused_at));
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);

        scheduler.shutdown();
        assert_eq!(counters.exits.load(Ordering::SeqCst), 1);
        assert!(control.is_finished());
    }

    #[test]
    fn test_gate_throttles_low_priority() {
        let mut scheduler = TaskScheduler::new(2).unwrap();
        let gate = scheduler.gate();
        gate.set(Priority::High);

        let (high, high_counters) = counting("receiver", Priority::High);
        let (low, low_counters) = counting("decoder", Priority::Normal);
        scheduler.spawn(high);
        scheduler.spawn(low);
        scheduler.start_all();

        assert!(wait_for(|| high_counters.steps.load(Ordering::SeqCst) > 3));
        assert_eq!(low_counters.steps.load(Ordering::SeqCst), 0);

        gate.set(Priority::Low);
        assert!(wait_for(|| low_counters.steps.load(Ordering::SeqCst) > 0));
    }

    #[test]
    fn test_queued_task_runs_after_worker_frees_up() {
        let mut scheduler = TaskScheduler::new(1).unwrap();
        let (first, _first_counters) = counting("first", Priority::Normal);
        let (second, second_counters) = counting("second", Priority::Normal);
        let first_control = scheduler.spawn(first);
        let second_control = scheduler.spawn(second);
        assert_eq!(scheduler.task_count(), 2);
        assert_eq!(scheduler.thread_count(), 1);

        second_control.start();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(second_counters.steps.load(Ordering::SeqCst), 0);

        first_control.exit();
        assert!(wait_for(|| second_counters.steps.load(Ordering::SeqCst) > 0));
    }
}
