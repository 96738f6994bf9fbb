//! Pipelined I/O scheduler: one worker thread per data disk and per
//! parity split, each reading its own disk strictly in increasing
//! parity-position order into a ring of column buffers, with the main
//! thread collecting one fully-produced column at a time.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use thiserror::Error;

/// Depth of the per-worker ring.
const IO_MAX: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    IoError,
}

#[derive(Clone, Copy, Debug)]
pub struct TaskResult {
    pub parity_pos: u32,
    pub state: TaskState,
    pub read_size: usize,
}

/// One disk's contribution to a column: either a data disk or a parity
/// split, implemented by the caller. Mirrors the `BlockReader` seam
/// described for this engine: the scheduler is generic over the source,
/// not over a read-implementation function pointer.
pub trait BlockSource: Send {
    /// Read the block at `parity_pos` into `buf`, returning the number
    /// of valid bytes (short reads beyond EOF are padded by the caller
    /// with zeros up to `buf.len()`).
    fn read_block(&mut self, parity_pos: u32, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerRole {
    Data(usize),
    Parity(usize),
}

struct RingSlot {
    result: Option<TaskResult>,
}

struct WorkerState {
    role: WorkerRole,
    produced: usize,
    ring: Vec<RingSlot>,
}

struct Inner {
    workers: Vec<WorkerState>,
    buffers: Vec<Vec<Vec<u8>>>,
    consumed: usize,
    ready_order: Vec<usize>,
    enabled: Vec<u32>,
    done: bool,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("io error limit of {limit} exceeded for this operation")]
    IoErrorLimitExceeded { limit: u32 },
    #[error("scheduler interrupted")]
    Interrupted,
}

/// Column-level I/O pipeline. Construct with [`Scheduler::new`], call
/// [`Scheduler::io_start`], drive the column loop with
/// [`Scheduler::io_read_next`]/[`io_data_read`](Scheduler::io_data_read)/
/// [`io_parity_read`](Scheduler::io_parity_read), and finish with
/// [`Scheduler::io_stop`].
pub struct Scheduler {
    disk_count: usize,
    parity_level: usize,
    block_size: usize,
    inner: Arc<Mutex<Inner>>,
    not_full: Arc<Condvar>,
    not_empty: Arc<Condvar>,
    interrupt: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
    io_error_limit: u32,
    io_errors_seen: u32,
}

impl Scheduler {
    pub fn new(disk_count: usize, parity_level: usize, block_size: usize, io_error_limit: u32) -> Self {
        Self {
            disk_count,
            parity_level,
            block_size,
            inner: Arc::new(Mutex::new(Inner {
                workers: Vec::new(),
                buffers: Vec::new(),
                consumed: 0,
                ready_order: Vec::new(),
                enabled: Vec::new(),
                done: false,
            })),
            not_full: Arc::new(Condvar::new()),
            not_empty: Arc::new(Condvar::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            io_error_limit,
            io_errors_seen: 0,
        }
    }

    /// Cooperative cancellation: consulted by the main thread between
    /// columns and by workers between reads.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Initialize the pending-column set (filtered through `enable_fn`)
    /// and launch one worker thread per data source and per parity
    /// source.
    pub fn io_start(
        &mut self,
        blockstart: u32,
        blockmax: u32,
        data_sources: Vec<Box<dyn BlockSource>>,
        parity_sources: Vec<Box<dyn BlockSource>>,
        enable_fn: impl Fn(u32) -> bool,
    ) {
        assert_eq!(data_sources.len(), self.disk_count);
        assert_eq!(parity_sources.len(), self.parity_level);

        let enabled: Vec<u32> = (blockstart..blockmax).filter(|&p| enable_fn(p)).collect();
        let total_workers = self.disk_count + self.parity_level;
        let block_size = self.block_size;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.enabled = enabled;
            inner.consumed = 0;
            inner.ready_order.clear();
            inner.done = false;
            inner.buffers = (0..IO_MAX)
                .map(|_| (0..total_workers).map(|_| vec![0u8; block_size]).collect())
                .collect();
            inner.workers = (0..total_workers)
                .map(|i| WorkerState {
                    role: if i < self.disk_count {
                        WorkerRole::Data(i)
                    } else {
                        WorkerRole::Parity(i - self.disk_count)
                    },
                    produced: 0,
                    ring: (0..IO_MAX).map(|_| RingSlot { result: None }).collect(),
                })
                .collect();
        }

        let mut sources: Vec<Box<dyn BlockSource>> = data_sources;
        sources.extend(parity_sources);

        for (worker_id, source) in sources.into_iter().enumerate() {
            let inner = self.inner.clone();
            let not_full = self.not_full.clone();
            let not_empty = self.not_empty.clone();
            let interrupt = self.interrupt.clone();
            let handle = thread::spawn(move || {
                worker_loop(worker_id, source, inner, not_full, not_empty, interrupt, block_size)
            });
            self.handles.push(handle);
        }
    }

    /// Block until the next enabled column has a result from every
    /// worker, return its parity position, and advance the ring so
    /// workers may begin producing the following column.
    pub fn io_read_next(&mut self) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.consumed;
        let parity_pos = *inner.enabled.get(idx)?;

        inner = self
            .not_empty
            .wait_while(inner, |inner| {
                !inner.done
                    && inner
                        .workers
                        .iter()
                        .any(|w| w.produced <= idx)
            })
            .unwrap();

        if inner.done {
            return None;
        }

        inner.consumed += 1;
        inner.ready_order.clear();
        drop(inner);
        self.not_full.notify_all();
        Some(parity_pos)
    }

    fn read_next_ready(&mut self, role_filter: impl Fn(&WorkerRole) -> Option<usize>) -> Option<(TaskResult, usize)> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.consumed.checked_sub(1)?;
        let slot = idx % IO_MAX;
        loop {
            let candidate = inner
                .ready_order
                .iter()
                .find_map(|&w| role_filter(&inner.workers[w].role).map(|id| (w, id)));
            if let Some((worker, id)) = candidate {
                inner.ready_order.retain(|&w| w != worker);
                let result = inner.workers[worker].ring[slot].result.take()?;
                if result.state == TaskState::IoError {
                    self.io_errors_seen += 1;
                }
                return Some((result, id));
            }
            let all_assigned = inner
                .workers
                .iter()
                .filter(|w| role_filter(&w.role).is_some())
                .count()
                == 0;
            if all_assigned {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Pick an already-finished data-disk task for the current column,
    /// in worker-completion order.
    pub fn io_data_read(&mut self) -> Option<(TaskResult, usize)> {
        self.read_next_ready(|role| match role {
            WorkerRole::Data(i) => Some(*i),
            WorkerRole::Parity(_) => None,
        })
    }

    /// Pick an already-finished parity-split task for the current
    /// column.
    pub fn io_parity_read(&mut self) -> Option<(TaskResult, usize)> {
        self.read_next_ready(|role| match role {
            WorkerRole::Parity(i) => Some(*i),
            WorkerRole::Data(_) => None,
        })
    }

    /// Borrow the buffer slots for the column last returned by
    /// [`io_read_next`](Scheduler::io_read_next).
    pub fn current_buffers(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let idx = inner.consumed.saturating_sub(1);
        inner.buffers[idx % IO_MAX].clone()
    }

    pub fn write_buffer(&self, worker_id: usize, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.consumed.saturating_sub(1);
        let slot = idx % IO_MAX;
        inner.buffers[slot][worker_id] = data;
    }

    /// Check whether the per-operation I/O error budget has been
    /// exceeded.
    pub fn check_io_error_budget(&self) -> Result<(), SchedulerError> {
        if self.io_errors_seen > self.io_error_limit {
            return Err(SchedulerError::IoErrorLimitExceeded {
                limit: self.io_error_limit,
            });
        }
        Ok(())
    }

    /// Signal `done`, wake every worker, and join them.
    pub fn io_stop(mut self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.done = true;
        }
        self.not_full.notify_all();
        self.not_empty.notify_all();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    mut source: Box<dyn BlockSource>,
    inner: Arc<Mutex<Inner>>,
    not_full: Arc<Condvar>,
    not_empty: Arc<Condvar>,
    interrupt: Arc<AtomicBool>,
    block_size: usize,
) {
    let mut index = 0usize;
    loop {
        if interrupt.load(Ordering::Relaxed) {
            return;
        }

        let parity_pos = {
            let guard = inner.lock().unwrap();
            if guard.done {
                return;
            }
            match guard.enabled.get(index) {
                Some(&p) => p,
                None => return,
            }
        };

        // Wait until the ring has room: this worker may not be more
        // than IO_MAX columns ahead of the slowest consumer.
        {
            let guard = inner.lock().unwrap();
            let _guard = not_full
                .wait_while(guard, |g| {
                    !g.done && index >= g.consumed + IO_MAX
                })
                .unwrap();
        }

        let mut buf = vec![0u8; block_size];
        let read = source.read_block(parity_pos, &mut buf);
        let (state, read_size) = match read {
            Ok(n) => (TaskState::Ready, n),
            Err(_) => (TaskState::IoError, 0),
        };

        let mut guard = inner.lock().unwrap();
        if guard.done {
            return;
        }
        let slot = index % IO_MAX;
        guard.buffers[slot][worker_id] = buf;
        guard.workers[worker_id].ring[slot].result = Some(TaskResult {
            parity_pos,
            state,
            read_size,
        });
        guard.workers[worker_id].produced = index + 1;
        guard.ready_order.push(worker_id);
        drop(guard);
        not_empty.notify_all();

        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FixedSource {
        value: u8,
        fail_at: Option<u32>,
    }

    impl BlockSource for FixedSource {
        fn read_block(&mut self, parity_pos: u32, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_at == Some(parity_pos) {
                return Err(io::Error::new(io::ErrorKind::Other, "simulated EIO"));
            }
            for b in buf.iter_mut() {
                *b = self.value;
            }
            Ok(buf.len())
        }
    }

    #[test]
    fn reads_all_columns_in_order() {
        let mut sched = Scheduler::new(2, 1, 8, 10);
        let data: Vec<Box<dyn BlockSource>> = vec![
            Box::new(FixedSource { value: 1, fail_at: None }),
            Box::new(FixedSource { value: 2, fail_at: None }),
        ];
        let parity: Vec<Box<dyn BlockSource>> =
            vec![Box::new(FixedSource { value: 0, fail_at: None })];
        sched.io_start(0, 5, data, parity, |_| true);

        let mut seen = Vec::new();
        while let Some(pos) = sched.io_read_next() {
            seen.push(pos);
            let mut got_data = 0;
            while let Some((result, disk)) = sched.io_data_read() {
                assert_eq!(result.state, TaskState::Ready);
                let _ = disk;
                got_data += 1;
            }
            assert_eq!(got_data, 2);
            while sched.io_parity_read().is_some() {}
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        sched.io_stop();
    }

    #[test]
    fn enable_fn_filters_columns() {
        let mut sched = Scheduler::new(1, 0, 8, 10);
        let data: Vec<Box<dyn BlockSource>> =
            vec![Box::new(FixedSource { value: 1, fail_at: None })];
        sched.io_start(0, 6, data, vec![], |p| p % 2 == 0);

        let mut seen = Vec::new();
        while let Some(pos) = sched.io_read_next() {
            seen.push(pos);
            while sched.io_data_read().is_some() {}
        }
        assert_eq!(seen, vec![0, 2, 4]);
        sched.io_stop();
    }

    #[test]
    fn io_error_is_surfaced_as_task_state() {
        let mut sched = Scheduler::new(1, 0, 8, 10);
        let data: Vec<Box<dyn BlockSource>> = vec![Box::new(FixedSource {
            value: 1,
            fail_at: Some(1),
        })];
        sched.io_start(0, 3, data, vec![], |_| true);

        let mut error_seen = false;
        while let Some(_pos) = sched.io_read_next() {
            while let Some((result, _)) = sched.io_data_read() {
                if result.state == TaskState::IoError {
                    error_seen = true;
                }
            }
        }
        assert!(error_seen);
        sched.io_stop();
    }

    #[test]
    fn interrupt_stops_workers_promptly() {
        let counter = Arc::new(AtomicU32::new(0));
        struct CountingSource(Arc<AtomicU32>);
        impl BlockSource for CountingSource {
            fn read_block(&mut self, _pos: u32, buf: &mut [u8]) -> io::Result<usize> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(buf.len())
            }
        }
        let mut sched = Scheduler::new(1, 0, 8, 10);
        let data: Vec<Box<dyn BlockSource>> = vec![Box::new(CountingSource(counter.clone()))];
        let interrupt = sched.interrupt_handle();
        sched.io_start(0, 1_000_000, data, vec![], |_| true);
        let _ = sched.io_read_next();
        interrupt.store(true, Ordering::Relaxed);
        sched.io_stop();
        assert!(counter.load(Ordering::Relaxed) < 1_000_000);
    }
}
