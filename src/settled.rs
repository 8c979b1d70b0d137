//! Awaiting a promise from async code.
use crate::{promise::Shared, Error};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

/// Completes with the promise's outcome once it settles.
///
/// Any number of these may wait on the same promise. If the promise is
/// abandoned (every settle capability dropped while pending) the future
/// completes with [`Error::Abandoned`] instead of hanging.
///
/// # Examples
///
/// ```
/// use promise_aplus::{EventLoop, Promise};
/// use futures::executor::block_on;
///
/// let event_loop = EventLoop::new();
/// let promise = Promise::<i32>::resolved(event_loop.handle(), 1).map(|v| v + 1);
/// event_loop.run_until_idle();
/// assert_eq!(block_on(promise.settled()), Ok(2));
/// ```
pub struct Settled<T, E = Error> {
    shared: Rc<Shared<T, E>>,
}

impl<T, E> Settled<T, E> {
    pub(crate) fn new(shared: Rc<Shared<T, E>>) -> Self {
        Self { shared }
    }
}

impl<T, E> Clone for Settled<T, E> {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone())
    }
}

impl<T, E> fmt::Debug for Settled<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled")
            .field("abandoned", &self.shared.is_abandoned())
            .finish()
    }
}

impl<T: Clone, E: Clone + From<Error>> Future for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.shared.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None if self.shared.is_abandoned() => Poll::Ready(Err(Error::Abandoned.into())),
            None => {
                self.shared.register_waker(cx.waker());
                Poll::Pending
            }
        }
    }
}
