// ============================================================================
// Non-realtime worker
// ============================================================================
//
// Runs deferred rebuilds (file loads, resampler and engine construction) and
// drops resources retired by the realtime side. The queue is a bounded
// channel so posting from the realtime thread never allocates.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::any::Any;
use std::sync::Weak;
use std::thread::{self, JoinHandle};

/// Work that a plugin defers to the worker
pub trait Deferred: Send + Sync {
    /// Called on the worker thread; the implementation must check its own
    /// "destroyed" flag before touching plugin state.
    fn run_deferred(&self);
}

enum Task {
    Deferred(Weak<dyn Deferred>),
    Retire(Box<dyn Any + Send>),
    Barrier(Sender<()>),
    Shutdown,
}

/// Cloneable handle used to post work
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<Task>,
}

impl WorkerHandle {
    /// Queue a deferred task; returns false when the queue is full or closed
    ///
    /// Realtime safe.
    pub fn submit(&self, target: Weak<dyn Deferred>) -> bool {
        match self.tx.try_send(Task::Deferred(target)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Hand a resource to the worker so it is dropped there
    ///
    /// Falls back to dropping inline when the worker is gone.
    pub fn retire<T: Send + 'static>(&self, resource: T) {
        if let Err(err) = self.tx.send(Task::Retire(Box::new(resource))) {
            drop(err.into_inner());
        }
    }

    /// Block until every task queued before this call has run
    pub fn wait_idle(&self) {
        let (tx, rx) = channel::bounded(1);
        if self.tx.send(Task::Barrier(tx)).is_ok() {
            let _ = rx.recv();
        }
    }
}

/// Owner of the worker thread
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread
    ///
    /// # Arguments
    /// * `queue` - Capacity of the task queue
    pub fn spawn(queue: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded(queue.max(1));
        let thread = thread::Builder::new()
            .name("fx-worker".to_string())
            .spawn(move || Self::run(rx))?;
        log::debug!("worker started (queue {})", queue);
        Ok(Self {
            handle: WorkerHandle { tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    fn run(rx: Receiver<Task>) {
        while let Ok(task) = rx.recv() {
            match task {
                Task::Deferred(target) => match target.upgrade() {
                    Some(target) => target.run_deferred(),
                    None => log::trace!("deferred task target already dropped"),
                },
                Task::Retire(resource) => drop(resource),
                Task::Barrier(done) => {
                    let _ = done.send(());
                }
                Task::Shutdown => break,
            }
        }
        log::debug!("worker stopped");
    }

    /// Finish queued tasks and join the thread
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(Task::Shutdown);
            if thread.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
