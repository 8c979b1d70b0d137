//! The resolution procedure: settling a promise from a callback's result.
//!
//! A result is either a plain value, another [`Promise`] of this crate, or any
//! foreign [`Thenable`]. Promises and thenables are unwrapped until a plain
//! value or a rejection is reached.
use crate::{
    promise::{guard, Promise, Reject, Resolve},
    Error,
};
use log::{debug, trace, warn};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

/// What a chaining callback hands back.
pub enum Resolution<T, E = Error> {
    Value(T),
    Promise(Promise<T, E>),
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Rc::new(thenable))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Result of looking up a thenable's chaining member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Callable,
    /// The member exists but is not callable; the object counts as this
    /// plain value.
    Plain(T),
}

/// Anything exposing a compatible `then`, whatever its concrete type.
///
/// Implementations are untrusted: they may call both capabilities, call one
/// several times, fail after calling one, or never call either. Only the
/// first capability call counts.
///
/// # Examples
///
/// ```
/// use promise_aplus::{
///     Error, EventLoop, Promise, Resolution, ThenReject, ThenResolve, Thenable,
/// };
///
/// struct Answer;
///
/// impl Thenable<i32> for Answer {
///     fn call_then(
///         &self,
///         resolve: ThenResolve<i32>,
///         _reject: ThenReject<i32>,
///     ) -> Result<(), Error> {
///         resolve.fulfill(42);
///         Ok(())
///     }
/// }
///
/// let event_loop = EventLoop::new();
/// let promise = Promise::<i32>::resolved(event_loop.handle(), 0)
///     .and_then(|_| Ok(Resolution::thenable(Answer)));
/// event_loop.run_until_idle();
/// assert_eq!(promise.value(), Some(42));
/// ```
pub trait Thenable<T, E = Error> {
    /// Reads the chaining member. An `Err` rejects the adopting promise.
    fn probe(&self) -> Result<Probe<T>, E> {
        Ok(Probe::Callable)
    }

    /// The native promise behind this thenable, if there is one. Lets the
    /// resolution procedure see through the wrapper and catch self-adoption.
    fn as_promise(&self) -> Option<Promise<T, E>> {
        None
    }

    fn call_then(&self, resolve: ThenResolve<T, E>, reject: ThenReject<T, E>) -> Result<(), E>;
}

/// State shared by the two capabilities handed to one `call_then`.
struct Adoption<T, E> {
    target: Promise<T, E>,
    resolve: Resolve<T, E>,
    reject: Reject<T, E>,
    called: Cell<bool>,
    // Set while `call_then` is on the stack.
    in_call: Cell<bool>,
    bounced: RefCell<Option<Resolution<T, E>>>,
}

/// Fulfil capability handed to a [`Thenable`].
pub struct ThenResolve<T, E = Error> {
    adoption: Rc<Adoption<T, E>>,
}

/// Reject capability handed to a [`Thenable`].
pub struct ThenReject<T, E = Error> {
    adoption: Rc<Adoption<T, E>>,
}

impl<T, E> Clone for ThenResolve<T, E> {
    fn clone(&self) -> Self {
        Self {
            adoption: self.adoption.clone(),
        }
    }
}

impl<T, E> Clone for ThenReject<T, E> {
    fn clone(&self) -> Self {
        Self {
            adoption: self.adoption.clone(),
        }
    }
}

impl<T, E> ThenResolve<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Settles the adopting promise with `y`, which is itself unwrapped if it
    /// is a promise or thenable.
    pub fn resolve(&self, y: Resolution<T, E>) {
        let adoption = &self.adoption;
        if adoption.called.replace(true) {
            trace!("thenable settled more than once; ignored");
            return;
        }
        if adoption.in_call.get() {
            // Unwound by the loop in `resolve_promise` once `call_then` returns.
            *adoption.bounced.borrow_mut() = Some(y);
        } else {
            resolve_promise(&adoption.target, y, &adoption.resolve, &adoption.reject);
        }
    }

    pub fn fulfill(&self, value: T) {
        self.resolve(Resolution::Value(value))
    }
}

impl<T, E> ThenReject<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub fn reject(&self, reason: E) {
        let adoption = &self.adoption;
        if adoption.called.replace(true) {
            trace!("thenable settled more than once; ignored");
            return;
        }
        adoption.reject.reject(reason);
    }
}

/// Drives `promise` to settlement from `x`.
///
/// `resolve` and `reject` must be the capabilities of `promise`. Resolving a
/// promise with itself rejects it with [`Error::SelfResolution`].
///
/// Thenables that answer synchronously with further thenables are unwound in
/// a loop, so arbitrarily deep chains do not grow the stack.
pub fn resolve_promise<T, E>(
    promise: &Promise<T, E>,
    x: Resolution<T, E>,
    resolve: &Resolve<T, E>,
    reject: &Reject<T, E>,
) where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    let mut x = x;
    loop {
        x = match x {
            Resolution::Promise(inner) if inner.ptr_eq(promise) => {
                warn!("promise resolved with itself; rejecting");
                reject.reject(Error::SelfResolution.into());
                return;
            }
            Resolution::Promise(inner) => {
                adopt_promise(inner, resolve, reject);
                return;
            }
            Resolution::Thenable(thenable) => match thenable.as_promise() {
                Some(inner) => Resolution::Promise(inner),
                None => match adopt_thenable(promise, thenable, resolve, reject) {
                    Some(next) => next,
                    None => return,
                },
            },
            Resolution::Value(value) => {
                resolve.resolve(value);
                return;
            }
        };
    }
}

fn adopt_promise<T, E>(inner: Promise<T, E>, resolve: &Resolve<T, E>, reject: &Reject<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    debug!("adopting the state of a nested promise");
    let resolve = resolve.clone();
    let reject = reject.clone();
    inner.then(
        move |value| {
            resolve.resolve(value);
            Ok(Resolution::Value(()))
        },
        move |reason| {
            reject.reject(reason);
            Ok(Resolution::Value(()))
        },
    );
}

/// Returns the value a thenable answered with synchronously, if the
/// procedure has to continue with it.
fn adopt_thenable<T, E>(
    promise: &Promise<T, E>,
    thenable: Rc<dyn Thenable<T, E>>,
    resolve: &Resolve<T, E>,
    reject: &Reject<T, E>,
) -> Option<Resolution<T, E>>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    match guard(|| thenable.probe()) {
        Ok(Probe::Callable) => {}
        Ok(Probe::Plain(value)) => {
            trace!("chaining member not callable; treating thenable as a plain value");
            resolve.resolve(value);
            return None;
        }
        Err(reason) => {
            debug!("reading the chaining member failed; rejecting");
            reject.reject(reason);
            return None;
        }
    }

    debug!("adopting the state of a thenable");
    let adoption = Rc::new(Adoption {
        target: promise.clone(),
        resolve: resolve.clone(),
        reject: reject.clone(),
        called: Cell::new(false),
        in_call: Cell::new(true),
        bounced: RefCell::new(None),
    });
    let on_fulfilled = ThenResolve {
        adoption: adoption.clone(),
    };
    let on_rejected = ThenReject {
        adoption: adoption.clone(),
    };
    let outcome = guard(move || thenable.call_then(on_fulfilled, on_rejected));
    adoption.in_call.set(false);

    if let Err(reason) = outcome {
        if adoption.called.replace(true) {
            warn!("thenable failed after settling; failure discarded");
        } else {
            debug!("thenable failed before settling; rejecting");
            reject.reject(reason);
            return None;
        }
    }
    let bounced = adoption.bounced.borrow_mut().take();
    bounced
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn as_promise(&self) -> Option<Promise<T, E>> {
        Some(self.clone())
    }

    fn call_then(&self, resolve: ThenResolve<T, E>, reject: ThenReject<T, E>) -> Result<(), E> {
        Promise::then(
            self,
            move |value| {
                resolve.fulfill(value);
                Ok(Resolution::Value(()))
            },
            move |reason| {
                reject.reject(reason);
                Ok(Resolution::Value(()))
            },
        );
        Ok(())
    }
}
