//! The host side of a promise: something that runs a callback on a later turn.
//!
//! [`EventLoop`] is a plain FIFO queue drained by the caller. Anything else
//! that can defer a closure (a UI main loop, a local executor) can stand in by
//! implementing [`Schedule`].
use log::{trace, warn};
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};

pub type Task = Box<dyn FnOnce()>;

/// Handle to the scheduler a promise hands its callbacks to.
pub type Host = Rc<dyn Schedule>;

/// Runs tasks after the current synchronous execution completes.
///
/// Tasks submitted through the same handle must run in submission order.
pub trait Schedule {
    fn schedule(&self, task: Task);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on turns taken by one [`EventLoop::run_until_idle`] call.
    pub turn_limit: Option<usize>,
}

/// Single-threaded FIFO task queue.
///
/// # Examples
///
/// ```
/// use promise_aplus::{EventLoop, Schedule};
/// use std::{cell::Cell, rc::Rc};
///
/// let event_loop = EventLoop::new();
/// let ran = Rc::new(Cell::new(false));
/// let flag = ran.clone();
/// event_loop.schedule(Box::new(move || flag.set(true)));
/// assert!(!ran.get());
/// assert_eq!(event_loop.run_until_idle(), 1);
/// assert!(ran.get());
/// ```
#[derive(Clone, Default)]
pub struct EventLoop {
    queue: Rc<RefCell<VecDeque<Task>>>,
    config: Config,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .field("config", &self.config)
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            queue: Rc::default(),
            config,
        }
    }

    /// A [`Host`] sharing this loop's queue.
    pub fn handle(&self) -> Host {
        Rc::new(self.clone())
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Runs the oldest queued task. Returns `false` if there was none.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs; tasks schedule more tasks.
        let task = self.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks, including ones scheduled along the way, until the queue is
    /// empty or the configured turn limit is reached. Returns the number of
    /// turns taken.
    pub fn run_until_idle(&self) -> usize {
        let mut turns = 0;
        while self.config.turn_limit.map_or(true, |limit| turns < limit) && self.run_once() {
            turns += 1;
        }
        if !self.is_idle() {
            warn!(
                "event loop stopped after {} turns with {} tasks still queued",
                turns,
                self.pending()
            );
        }
        trace!("event loop ran {} turns", turns);
        turns
    }
}

impl Schedule for EventLoop {
    fn schedule(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }
}
