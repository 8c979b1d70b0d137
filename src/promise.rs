//! The settlement state machine.
//!
//! A [`Promise`] is a handle over shared state that leaves `Pending` at most
//! once. The only writers are its [`Resolve`] and [`Reject`] capabilities.
use crate::{
    resolution::{resolve_promise, Resolution},
    scheduler::Host,
    settled::Settled,
    Error,
};
use log::{debug, trace, warn};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    task::Waker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

type Callback<A> = Box<dyn FnOnce(A)>;
type Handler<A, U, E> = Box<dyn FnOnce(A) -> Result<Resolution<U, E>, E>>;

struct Core<T, E> {
    state: State<T, E>,
    fulfill_callbacks: Vec<Callback<T>>,
    reject_callbacks: Vec<Callback<E>>,
}

impl<T, E> Core<T, E> {
    fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending)
    }

    fn projection(&self) -> PromiseState {
        match self.state {
            State::Pending => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }
}

impl<T: Clone, E: Clone> Core<T, E> {
    fn outcome(&self) -> Option<Result<T, E>> {
        match &self.state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

pub(crate) struct Shared<T, E> {
    core: RefCell<Core<T, E>>,
    waiters: RefCell<Vec<Waker>>,
    // Live Resolve/Reject capabilities.
    settlers: Cell<usize>,
    abandoned: Cell<bool>,
}

impl<T, E> Shared<T, E> {
    fn new() -> Self {
        Self {
            core: RefCell::new(Core {
                state: State::Pending,
                fulfill_callbacks: vec![],
                reject_callbacks: vec![],
            }),
            waiters: RefCell::new(vec![]),
            settlers: Cell::new(0),
            abandoned: Cell::new(false),
        }
    }

    fn state(&self) -> PromiseState {
        self.core.borrow().projection()
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }

    pub(crate) fn register_waker(&self, waker: &Waker) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    fn wake_waiters(&self) {
        let waiters = mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
    }

    fn release_settler(&self) {
        let remaining = self.settlers.get().saturating_sub(1);
        self.settlers.set(remaining);
        if remaining > 0 {
            return;
        }
        let pending = self.core.try_borrow().map_or(false, |core| core.is_pending());
        if pending && !self.abandoned.replace(true) {
            debug!("promise abandoned: last settle capability dropped while pending");
            self.wake_waiters();
        }
    }
}

impl<T: Clone, E: Clone> Shared<T, E> {
    pub(crate) fn outcome(&self) -> Option<Result<T, E>> {
        self.core.borrow().outcome()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Shared<T, E> {
    fn fulfill(&self, host: &Host, value: T) {
        let mut core = self.core.borrow_mut();
        if !core.is_pending() {
            drop(core);
            trace!("resolve ignored: promise already settled");
            return;
        }
        core.state = State::Fulfilled(value.clone());
        let callbacks = mem::take(&mut core.fulfill_callbacks);
        let discarded = mem::take(&mut core.reject_callbacks);
        drop(core);
        drop(discarded);
        trace!("promise fulfilled; scheduling {} callbacks", callbacks.len());
        self.wake_waiters();
        for callback in callbacks {
            let value = value.clone();
            host.schedule(Box::new(move || callback(value)));
        }
    }

    fn reject(&self, host: &Host, reason: E) {
        let mut core = self.core.borrow_mut();
        if !core.is_pending() {
            drop(core);
            trace!("reject ignored: promise already settled");
            return;
        }
        core.state = State::Rejected(reason.clone());
        let callbacks = mem::take(&mut core.reject_callbacks);
        let discarded = mem::take(&mut core.fulfill_callbacks);
        drop(core);
        drop(discarded);
        trace!("promise rejected; scheduling {} callbacks", callbacks.len());
        self.wake_waiters();
        for callback in callbacks {
            let reason = reason.clone();
            host.schedule(Box::new(move || callback(reason)));
        }
    }
}

struct Settler<T, E> {
    shared: Rc<Shared<T, E>>,
    host: Host,
}

impl<T, E> Settler<T, E> {
    fn new(shared: Rc<Shared<T, E>>, host: Host) -> Self {
        shared.settlers.set(shared.settlers.get() + 1);
        Self { shared, host }
    }
}

impl<T, E> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone(), self.host.clone())
    }
}

impl<T, E> Drop for Settler<T, E> {
    /// If this was the last capability of a pending promise, wake awaiters.
    fn drop(&mut self) {
        self.shared.release_settler()
    }
}

/// Fulfils the promise it was created for. Only the first settle call of
/// either kind has any effect.
pub struct Resolve<T, E = Error>(Settler<T, E>);

/// Rejects the promise it was created for. Only the first settle call of
/// either kind has any effect.
pub struct Reject<T, E = Error>(Settler<T, E>);

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, E> fmt::Debug for Resolve<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resolve").field(&self.0.shared.state()).finish()
    }
}

impl<T, E> fmt::Debug for Reject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reject").field(&self.0.shared.state()).finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Resolve<T, E> {
    /// Fulfils with `value` as is. Nested promises and thenables are not
    /// unwrapped here; return them from a chaining callback instead.
    pub fn resolve(&self, value: T) {
        self.0.shared.fulfill(&self.0.host, value)
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Reject<T, E> {
    pub fn reject(&self, reason: E) {
        self.0.shared.reject(&self.0.host, reason)
    }
}

/// A promise together with its settle capabilities, for driving it from
/// outside a setup routine.
pub struct Deferred<T, E = Error> {
    pub promise: Promise<T, E>,
    pub resolve: Resolve<T, E>,
    pub reject: Reject<T, E>,
}

/// A value that becomes available later.
///
/// Cloning yields another handle to the same promise.
pub struct Promise<T, E = Error> {
    shared: Rc<Shared<T, E>>,
    host: Host,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            host: self.host.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("abandoned", &self.shared.is_abandoned())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    fn pending(host: Host) -> Self {
        Self {
            shared: Rc::new(Shared::new()),
            host,
        }
    }

    fn resolve_capability(&self) -> Resolve<T, E> {
        Resolve(Settler::new(self.shared.clone(), self.host.clone()))
    }

    fn reject_capability(&self) -> Reject<T, E> {
        Reject(Settler::new(self.shared.clone(), self.host.clone()))
    }

    pub fn state(&self) -> PromiseState {
        self.shared.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// A future that completes when this promise settles.
    pub fn settled(&self) -> Settled<T, E> {
        Settled::new(self.shared.clone())
    }
}

impl<T: Clone, E: Clone> Promise<T, E> {
    pub fn value(&self) -> Option<T> {
        self.shared.outcome().and_then(Result::ok)
    }

    pub fn reason(&self) -> Option<E> {
        self.shared.outcome().and_then(|outcome| outcome.err())
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `setup` synchronously with its settle
    /// capabilities. A setup routine that fails or panics rejects the promise.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Error, EventLoop, Promise, PromiseState};
    ///
    /// let event_loop = EventLoop::new();
    /// let promise = Promise::<i32>::new(event_loop.handle(), |_resolve, _reject| {
    ///     Err(Error::from("setup failed"))
    /// });
    /// assert_eq!(promise.state(), PromiseState::Rejected);
    /// ```
    pub fn new<F>(host: Host, setup: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let promise = Self::pending(host);
        let resolve = promise.resolve_capability();
        let reject = promise.reject_capability();
        let fallback = reject.clone();
        if let Err(reason) = guard(move || setup(resolve, reject)) {
            debug!("setup routine failed; rejecting");
            fallback.reject(reason);
        }
        promise
    }

    /// An already fulfilled promise.
    pub fn resolved(host: Host, value: T) -> Self {
        Self::new(host, |resolve, _| {
            resolve.resolve(value);
            Ok(())
        })
    }

    /// An already rejected promise.
    pub fn rejected(host: Host, reason: E) -> Self {
        Self::new(host, |_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    /// A promise settled by running the resolution procedure on `x`, so
    /// nested promises and thenables are adopted.
    pub fn from_resolution(host: Host, x: Resolution<T, E>) -> Self {
        let Deferred {
            promise,
            resolve,
            reject,
        } = Self::deferred(host);
        resolve_promise(&promise, x, &resolve, &reject);
        promise
    }

    /// A pending promise plus the capabilities that settle it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{EventLoop, Promise};
    ///
    /// let event_loop = EventLoop::new();
    /// let deferred = Promise::<&str>::deferred(event_loop.handle());
    /// let shouted = deferred.promise.map(|s| s.to_uppercase());
    /// deferred.resolve.resolve("hi");
    /// event_loop.run_until_idle();
    /// assert_eq!(shouted.value().as_deref(), Some("HI"));
    /// ```
    pub fn deferred(host: Host) -> Deferred<T, E> {
        let promise = Self::pending(host);
        Deferred {
            resolve: promise.resolve_capability(),
            reject: promise.reject_capability(),
            promise,
        }
    }

    /// Registers both callbacks and returns the promise their result settles.
    ///
    /// Exactly one of the callbacks runs, on a later turn than this call.
    /// Its `Ok` result goes through the resolution procedure; its `Err`
    /// rejects the returned promise.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Box::new(on_fulfilled), Box::new(on_rejected))
    }

    /// `then` without a rejection callback: rejections pass through.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(Box::new(on_fulfilled), Box::new(|reason| Err(reason)))
    }

    /// `then` without a fulfilment callback: values pass through.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.chain(
            Box::new(|value| Ok(Resolution::Value(value))),
            Box::new(on_rejected),
        )
    }

    /// `then` with neither callback: a new promise settling the same way.
    pub fn forward(&self) -> Promise<T, E> {
        self.chain(
            Box::new(|value| Ok(Resolution::Value(value))),
            Box::new(|reason| Err(reason)),
        )
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.and_then(move |value| Ok(Resolution::Value(f(value))))
    }

    fn chain<U>(
        &self,
        on_fulfilled: Handler<T, U, E>,
        on_rejected: Handler<E, U, E>,
    ) -> Promise<U, E>
    where
        U: Clone + 'static,
    {
        let child = Promise::<U, E>::pending(self.host.clone());
        let fulfilled = Reaction::new(&child, on_fulfilled);
        let rejected = Reaction::new(&child, on_rejected);

        let outcome = {
            let mut core = self.shared.core.borrow_mut();
            match core.outcome() {
                Some(outcome) => outcome,
                None => {
                    core.fulfill_callbacks
                        .push(Box::new(move |value| fulfilled.run(value)));
                    core.reject_callbacks
                        .push(Box::new(move |reason| rejected.run(reason)));
                    return child;
                }
            }
        };
        match outcome {
            Ok(value) => self.host.schedule(Box::new(move || fulfilled.run(value))),
            Err(reason) => self.host.schedule(Box::new(move || rejected.run(reason))),
        }
        child
    }
}

/// One side of a `then` registration: the user callback plus what it drives.
struct Reaction<A, U, E> {
    handler: Handler<A, U, E>,
    target: Promise<U, E>,
    resolve: Resolve<U, E>,
    reject: Reject<U, E>,
}

impl<A, U, E> Reaction<A, U, E>
where
    U: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn new(target: &Promise<U, E>, handler: Handler<A, U, E>) -> Self {
        Self {
            handler,
            target: target.clone(),
            resolve: target.resolve_capability(),
            reject: target.reject_capability(),
        }
    }

    fn run(self, argument: A) {
        let Reaction {
            handler,
            target,
            resolve,
            reject,
        } = self;
        match guard(move || handler(argument)) {
            Ok(x) => resolve_promise(&target, x, &resolve, &reject),
            Err(reason) => {
                debug!("callback failed; rejecting the derived promise");
                reject.reject(reason);
            }
        }
    }
}

/// Runs user code, turning a panic into a rejection reason.
pub(crate) fn guard<R, E>(f: impl FnOnce() -> Result<R, E>) -> Result<R, E>
where
    E: From<Error>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("caught panic in user code: {}", message);
            Err(Error::Panicked(message).into())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;
    use std::cell::RefCell;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_first_settle_call_wins() {
        init();
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::new(event_loop.handle(), |resolve, reject| {
            resolve.resolve(1);
            resolve.resolve(2);
            reject.reject("x".into());
            Ok(())
        });
        assert_eq!(promise.state(), PromiseState::Fulfilled);
        assert_eq!(promise.value(), Some(1));
        assert_eq!(promise.reason(), None);
    }

    #[test]
    fn test_reject_then_resolve_stays_rejected() {
        let event_loop = EventLoop::new();
        let deferred = Promise::<i32>::deferred(event_loop.handle());
        deferred.reject.reject("first".into());
        deferred.resolve.resolve(9);
        deferred.reject.reject("second".into());
        assert_eq!(deferred.promise.reason(), Some(Error::from("first")));
    }

    #[test]
    fn test_setup_error_rejects() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::new(event_loop.handle(), |_, _| Err("boom".into()));
        assert_eq!(promise.reason(), Some(Error::from("boom")));
    }

    #[test]
    fn test_setup_error_after_resolve_is_ignored() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::new(event_loop.handle(), |resolve, _| {
            resolve.resolve(3);
            Err("late".into())
        });
        assert_eq!(promise.value(), Some(3));
    }

    #[test]
    fn test_setup_panic_rejects() {
        init();
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::new(event_loop.handle(), |_, _| panic!("setup exploded"));
        assert_eq!(
            promise.reason(),
            Some(Error::Panicked("setup exploded".to_owned()))
        );
    }

    #[test]
    fn test_pending_registrations_are_queued_not_scheduled() {
        let event_loop = EventLoop::new();
        let deferred = Promise::<i32>::deferred(event_loop.handle());
        deferred.promise.map(|v| v + 1);
        deferred.promise.map(|v| v + 2);
        assert!(event_loop.is_idle());
        assert_eq!(deferred.promise.shared.core.borrow().fulfill_callbacks.len(), 2);

        deferred.resolve.resolve(0);
        assert_eq!(event_loop.pending(), 2);
        let core = deferred.promise.shared.core.borrow();
        assert!(core.fulfill_callbacks.is_empty());
        assert!(core.reject_callbacks.is_empty());
    }

    #[test]
    fn test_settled_registrations_are_scheduled_immediately() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::resolved(event_loop.handle(), 5);
        let child = promise.map(|v| v * 10);
        assert_eq!(event_loop.pending(), 1);
        assert!(promise.shared.core.borrow().fulfill_callbacks.is_empty());
        assert!(child.is_pending());
        event_loop.run_until_idle();
        assert_eq!(child.value(), Some(50));
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let event_loop = EventLoop::new();
        let deferred = Promise::<i32>::deferred(event_loop.handle());
        let order = Rc::new(RefCell::new(vec![]));
        for i in 1..=3 {
            let order = order.clone();
            deferred.promise.map(move |_| order.borrow_mut().push(i));
        }
        deferred.resolve.resolve(0);
        event_loop.run_until_idle();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_callback_error_rejects_child() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::resolved(event_loop.handle(), 1);
        let child: Promise<i32> = promise.and_then(|_| Err("nope".into()));
        event_loop.run_until_idle();
        assert_eq!(child.reason(), Some(Error::from("nope")));
    }

    #[test]
    fn test_callback_panic_rejects_child() {
        init();
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::resolved(event_loop.handle(), 1);
        let child: Promise<i32> = promise.map(|_| panic!("kaboom"));
        event_loop.run_until_idle();
        assert_eq!(child.reason(), Some(Error::Panicked("kaboom".to_owned())));
    }

    #[test]
    fn test_catch_recovers() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::rejected(event_loop.handle(), "bad".into());
        let recovered = promise.catch(|_| Ok(Resolution::Value(-1)));
        event_loop.run_until_idle();
        assert_eq!(recovered.value(), Some(-1));
    }

    #[test]
    fn test_abandoned_when_capabilities_dropped() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::new(event_loop.handle(), |_, _| Ok(()));
        assert!(promise.is_pending());
        assert!(promise.shared.is_abandoned());
        assert_eq!(promise.shared.settlers.get(), 0);
    }

    #[test]
    fn test_settled_promise_is_never_abandoned() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32>::resolved(event_loop.handle(), 1);
        assert!(!promise.shared.is_abandoned());
    }

    #[test]
    fn test_child_keeps_capabilities_while_parent_pending() {
        let event_loop = EventLoop::new();
        let deferred = Promise::<i32>::deferred(event_loop.handle());
        let child = deferred.promise.map(|v| v);
        assert!(!child.shared.is_abandoned());
        drop(deferred);
        assert!(child.shared.is_abandoned());
    }
}
