//! Thread objects. A `Thread` wraps a run closure with a name, a result
//! value, a lifecycle state and a `finished` audience, and registers
//! itself in a process-wide table so `Thread::current()` can find the
//! caller's thread object.

use crate::audience::Audience;
use crate::error::{Error, Result};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread as os_thread;
use std::time::Duration;

pub type ThreadResult = isize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    Created,
    Running,
    Finished,
}

/// Event emitted on the `finished` audience after the run closure returns.
pub struct ThreadFinished {
    pub thread: Arc<Thread>,
}

struct Lifecycle {
    state: ThreadState,
    result: ThreadResult,
    handle: Option<os_thread::JoinHandle<()>>,
}

pub struct Thread {
    self_ref: Weak<Thread>,
    name: String,
    run: Mutex<Option<Box<dyn FnOnce() -> ThreadResult + Send>>>,
    lifecycle: Mutex<Lifecycle>,
    finished_cond: Condvar,
    finished: Audience<ThreadFinished>,
}

lazy_static! {
    static ref RUNNING: Mutex<HashMap<os_thread::ThreadId, Weak<Thread>>> =
        Mutex::new(HashMap::new());
}

impl Thread {
    pub fn new<F>(name: &str, run: F) -> Arc<Thread>
    where
        F: FnOnce() -> ThreadResult + Send + 'static,
    {
        Arc::new_cyclic(|self_ref| Thread {
            self_ref: self_ref.clone(),
            name: name.to_string(),
            run: Mutex::new(Some(Box::new(run))),
            lifecycle: Mutex::new(Lifecycle {
                state: ThreadState::Created,
                result: 0,
                handle: None,
            }),
            finished_cond: Condvar::new(),
            finished: Audience::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finished(&self) -> &Audience<ThreadFinished> {
        &self.finished
    }

    pub fn state(&self) -> ThreadState {
        self.lifecycle.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ThreadState::Finished
    }

    /// Spawns the underlying OS thread. Fails if the thread was already
    /// started.
    pub fn start(&self) -> Result<()> {
        let this = self
            .self_ref
            .upgrade()
            .expect("Thread must be started through its Arc handle");
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state != ThreadState::Created {
            return Err(Error::InvalidState("thread already started"));
        }
        let run = self
            .run
            .lock()
            .unwrap()
            .take()
            .expect("Created thread must hold its run closure");
        lifecycle.state = ThreadState::Running;
        let handle = os_thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                RUNNING
                    .lock()
                    .unwrap()
                    .insert(os_thread::current().id(), Arc::downgrade(&this));
                let result = run();
                RUNNING.lock().unwrap().remove(&os_thread::current().id());
                this.finish(result);
            })?;
        lifecycle.handle = Some(handle);
        Ok(())
    }

    /// Runs the closure on the calling thread. Used by the pool to execute
    /// queued jobs inside its workers.
    pub(crate) fn execute_inline(&self) {
        let run = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            assert_eq!(
                lifecycle.state,
                ThreadState::Created,
                "Pooled jobs must not be started separately"
            );
            lifecycle.state = ThreadState::Running;
            self.run
                .lock()
                .unwrap()
                .take()
                .expect("Created thread must hold its run closure")
        };
        let result = run();
        self.finish(result);
    }

    fn finish(&self, result: ThreadResult) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.result = result;
            lifecycle.state = ThreadState::Finished;
            self.finished_cond.notify_all();
        }
        if let Some(this) = self.self_ref.upgrade() {
            self.finished.notify(&ThreadFinished { thread: this });
        }
    }

    /// Blocks until the thread has finished. A no-op when called from the
    /// thread itself or on a thread that was never started.
    pub fn join(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if let Some(handle) = &lifecycle.handle {
            if handle.thread().id() == os_thread::current().id() {
                return;
            }
        }
        while lifecycle.state == ThreadState::Running {
            lifecycle = self.finished_cond.wait(lifecycle).unwrap();
        }
        if let Some(handle) = lifecycle.handle.take() {
            drop(lifecycle);
            let _ = handle.join();
        }
    }

    /// Joins and returns the run closure's result.
    pub fn result(&self) -> ThreadResult {
        self.join();
        self.lifecycle.lock().unwrap().result
    }

    /// The Thread object of the calling thread, when the caller was
    /// spawned through `start`.
    pub fn current() -> Option<Arc<Thread>> {
        RUNNING
            .lock()
            .unwrap()
            .get(&os_thread::current().id())
            .and_then(Weak::upgrade)
    }

    pub fn sleep(duration: Duration) {
        os_thread::sleep(duration);
    }
}
