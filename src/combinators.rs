//! Helpers built on top of `then`.
use crate::{scheduler::Host, Error, Promise, Resolution};

/// Waits for each promise in turn and fulfils with their values in order.
///
/// Rejects with the reason of the first rejected promise reached; later
/// promises are not waited for.
///
/// # Examples
///
/// ```
/// use promise_aplus::{all, EventLoop, Promise};
///
/// let event_loop = EventLoop::new();
/// let host = event_loop.handle();
/// let promises = (1..=3).map(|i| Promise::<i32>::resolved(host.clone(), i));
/// let joined = all(host.clone(), promises);
/// event_loop.run_until_idle();
/// assert_eq!(joined.value(), Some(vec![1, 2, 3]));
/// ```
pub fn all<T, E, I>(host: Host, promises: I) -> Promise<Vec<T>, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
    I: IntoIterator<Item = Promise<T, E>>,
{
    promises
        .into_iter()
        .fold(Promise::resolved(host, vec![]), |collected, next| {
            collected.and_then(move |mut values: Vec<T>| {
                Ok(Resolution::Promise(next.map(move |value| {
                    values.push(value);
                    values
                })))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;

    #[test]
    fn test_all_empty() {
        let event_loop = EventLoop::new();
        let joined = all::<i32, Error, _>(event_loop.handle(), vec![]);
        assert_eq!(joined.value(), Some(vec![]));
    }

    #[test]
    fn test_all_keeps_input_order() {
        let event_loop = EventLoop::new();
        let host = event_loop.handle();
        let first = Promise::<&str>::deferred(host.clone());
        let second = Promise::<&str>::deferred(host.clone());
        let joined = all(host, vec![first.promise.clone(), second.promise.clone()]);
        second.resolve.resolve("b");
        event_loop.run_until_idle();
        assert!(joined.is_pending());
        first.resolve.resolve("a");
        event_loop.run_until_idle();
        assert_eq!(joined.value(), Some(vec!["a", "b"]));
    }

    #[test]
    fn test_all_rejects_with_first_reached_rejection() {
        let event_loop = EventLoop::new();
        let host = event_loop.handle();
        let promises = vec![
            Promise::<i32>::resolved(host.clone(), 1),
            Promise::rejected(host.clone(), "second".into()),
            Promise::rejected(host.clone(), "third".into()),
        ];
        let joined = all(host, promises);
        event_loop.run_until_idle();
        assert_eq!(joined.reason(), Some(Error::from("second")));
    }
}
