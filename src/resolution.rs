//! What a promise can be resolved with, classified up front instead of probed
//! at runtime.
//!
use crate::{Promise, Resolver};
use std::fmt;

/// A chaining capability read off a thenable. It receives the settlement
/// handle of the promise being resolved and "throws" by returning `Err`.
pub type ThenFn<T, E> = Box<dyn FnOnce(Resolver<T, E>) -> Result<(), E>>;

/// Result of reading the chaining capability off a [`Thenable`].
pub enum Probe<T, E> {
    /// The object can be chained on; it will be invoked exactly once.
    Callable(ThenFn<T, E>),
    /// The object has nothing callable and stands for a plain value.
    Plain(T),
}

/// An object that may expose a chaining capability, typically a promise from
/// some other implementation.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, MicrotaskQueue, Probe, Promise, Resolution, Resolver, Thenable};
/// use std::rc::Rc;
///
/// struct Answer;
///
/// impl Thenable<i32, Error> for Answer {
///     fn probe(self: Box<Self>) -> Result<Probe<i32, Error>, Error> {
///         Ok(Probe::Callable(Box::new(|resolver: Resolver<i32, Error>| {
///             resolver.resolve(42);
///             Ok(())
///         })))
///     }
/// }
///
/// let queue = Rc::new(MicrotaskQueue::new());
/// let promise = Promise::<i32, Error>::new(queue.clone(), |resolver| {
///     resolver.resolve_with(Resolution::Thenable(Box::new(Answer)));
/// });
/// assert_eq!(queue.block_on(promise.waiter()), Ok(Ok(42)));
/// ```
pub trait Thenable<T, E> {
    /// Reads the chaining capability. The resolution procedure calls this
    /// once and never again for the same object; an `Err` rejects the promise
    /// being resolved.
    fn probe(self: Box<Self>) -> Result<Probe<T, E>, E>;
}

/// A value handed to the success path of a promise.
pub enum Resolution<T, E> {
    /// Fulfills directly.
    Value(T),
    /// A promise from this crate; adopted without going through [`Thenable`].
    Promise(Promise<T, E>),
    /// Anything else that might be chained on.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    /// Wraps a closure as a thenable whose capability is always callable.
    pub fn thenable<F>(then: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E> + 'static,
        T: 'static,
        E: 'static,
    {
        Resolution::Thenable(Box::new(FnThenable(then)))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

struct FnThenable<F>(F);

impl<T, E, F> Thenable<T, E> for FnThenable<F>
where
    F: FnOnce(Resolver<T, E>) -> Result<(), E> + 'static,
{
    fn probe(self: Box<Self>) -> Result<Probe<T, E>, E> {
        Ok(Probe::Callable(Box::new(self.0)))
    }
}
