use crate::Error;
use std::cell::RefCell;
use std::rc::Rc;
use std::{future::Future, pin::Pin, task::{Context, Poll, Waker}};

/// A future that completes with a promise's outcome, returned by
/// [`Promise::waiter`](crate::Promise::waiter).
///
/// It only makes progress while the promise's queue is being run, e.g. under
/// [`MicrotaskQueue::block_on`](crate::MicrotaskQueue::block_on). Polling it
/// again after it returned the outcome yields [`Error::Consumed`].
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, MicrotaskQueue, Promise};
/// use std::rc::Rc;
///
/// let queue = Rc::new(MicrotaskQueue::new());
/// let promise = Promise::<i32, Error>::rejected(queue.clone(), Error::Thrown("💥".into()));
/// let outcome = queue.block_on(async move { promise.await });
/// assert_eq!(outcome, Ok(Err(Error::Thrown("💥".into()))));
/// ```
#[derive(Debug)]
pub struct Waiter<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

/// Feeds the outcome into a [`Waiter`].
#[derive(Debug)]
pub(crate) struct Deliver<T, E> {
    slot: Rc<RefCell<Slot<T, E>>>,
}

impl<T, E> Clone for Deliver<T, E> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

#[derive(Debug)]
struct Slot<T, E> {
    outcome: Option<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

impl<T, E> Waiter<T, E> {
    pub(crate) fn new() -> (Self, Deliver<T, E>) {
        let slot = Rc::new(RefCell::new(Slot {
            outcome: None,
            waker: Err(WakerState::Fresh),
        }));
        (Self { slot: slot.clone() }, Deliver { slot })
    }
}

impl<T, E> Deliver<T, E> {
    pub(crate) fn deliver(&self, outcome: Result<T, E>) {
        let mut slot = self.slot.borrow_mut();
        slot.outcome = Some(outcome);
        let waker = std::mem::replace(&mut slot.waker, Err(WakerState::Fresh));
        drop(slot);
        if let Ok(waker) = waker {
            waker.wake()
        }
    }
}

impl<T, E: From<Error>> Future for Waiter<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.outcome.take() {
            Some(outcome) => {
                slot.waker = Err(WakerState::Tainted);
                Poll::Ready(outcome)
            }
            None => match std::mem::replace(&mut slot.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => {
                    slot.waker = Err(WakerState::Tainted);
                    Poll::Ready(Err(E::from(Error::Consumed)))
                }
                _ => Poll::Pending,
            },
        }
    }
}
