//! Ordered task queue
//!
//! Network threads hold a [`TaskSender`] and post closures; the thread that
//! owns the playback context runs them with [`TaskQueue::run_pending`]. Tasks
//! run one at a time in posting order and receive `&mut C`, never the queue,
//! so a running task cannot re-enter the queue. Tasks posted while a batch is
//! running wait for the next call.

use crossbeam::channel::{self, Receiver, Sender};
use std::time::Duration;
use tracing::Span;

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

struct LabeledTask<C> {
    label: &'static str,
    task: Task<C>,
}

/// Posting side of a [`TaskQueue`]
pub struct TaskSender<C> {
    sender: Sender<LabeledTask<C>>,
}

impl<C> Clone for TaskSender<C> {
    fn clone(&self) -> Self {
        TaskSender {
            sender: self.sender.clone(),
        }
    }
}

impl<C> TaskSender<C> {
    /// Post a task; returns false if the queue no longer exists
    pub fn post<F>(&self, label: &'static str, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.sender
            .send(LabeledTask {
                label,
                task: Box::new(task),
            })
            .is_ok()
    }
}

/// Executing side, owned by the playback thread
pub struct TaskQueue<C> {
    sender: Sender<LabeledTask<C>>,
    receiver: Receiver<LabeledTask<C>>,
    span: Span,
}

impl<C> TaskQueue<C> {
    pub fn new(span: Span) -> Self {
        let (sender, receiver) = channel::unbounded();
        TaskQueue {
            sender,
            receiver,
            span,
        }
    }

    /// Get a handle for posting tasks from other threads
    pub fn sender(&self) -> TaskSender<C> {
        TaskSender {
            sender: self.sender.clone(),
        }
    }

    /// Number of tasks waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Run the tasks that were queued when the call started
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self, context: &mut C) -> usize {
        let batch = self.receiver.len();
        let mut ran = 0;
        while ran < batch {
            match self.receiver.try_recv() {
                Ok(task) => {
                    self.run(task, context);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Wait up to `timeout` for work, then run the pending batch
    pub fn run_for(&self, context: &mut C, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                self.run(task, context);
                1 + self.run_pending(context)
            }
            Err(_) => 0,
        }
    }

    fn run(&self, task: LabeledTask<C>, context: &mut C) {
        let _enter = self.span.enter();
        tracing::trace!("Running task {}", task.label);
        (task.task)(context);
    }
}
