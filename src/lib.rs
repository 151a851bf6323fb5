//! A single-threaded promise that follows the Promises/A+ resolution
//! procedure.
//!
//! A [`Promise`] settles once, either fulfilled with a value or rejected with
//! a reason. Continuations registered with [`Promise::then`] and friends run
//! on a [`Defer`] queue, never inside the call that registered them or that
//! settled the promise. Resolving with another [`Promise`] or any
//! [`Thenable`] adopts its outcome instead of fulfilling with it.
//!
//! ```
//! use promise_aplus::{Error, MicrotaskQueue, Promise, Resolution};
//! use std::rc::Rc;
//!
//! let queue = Rc::new(MicrotaskQueue::new());
//! let promise = Promise::<i32, Error>::new(queue.clone(), |resolver| {
//!     resolver.resolve_with(Resolution::thenable(|inner| {
//!         inner.resolve(42);
//!         Ok(())
//!     }));
//! });
//! let recovered = promise
//!     .and_then(|_| Err::<Resolution<i32, Error>, _>(Error::Thrown("boom".into())))
//!     .or_else(|reason| {
//!         assert_eq!(reason, Error::Thrown("boom".into()));
//!         Ok(Resolution::Value(5))
//!     });
//! assert_eq!(queue.block_on(recovered.waiter()), Ok(Ok(5)));
//! ```
use thiserror::Error;

mod promise;
mod queue;
mod resolution;
mod waiter;

pub use promise::{Promise, PromiseId, Resolver, State};
pub use queue::{Defer, Job, MicrotaskQueue};
pub use resolution::{Probe, Resolution, ThenFn, Thenable};
pub use waiter::Waiter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A promise was resolved with itself, or with a promise already waiting
    /// on it.
    #[error("promise {0} was resolved into a chain that waits on itself")]
    Cycle(PromiseId),
    /// An error raised by user code, carried as a rejection reason.
    #[error("{0}")]
    Thrown(String),
    #[error("the queue ran dry while the promise was still pending")]
    Stalled,
    #[error("the waiter already returned its outcome")]
    Consumed,
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Thrown(message.to_owned())
    }
}
