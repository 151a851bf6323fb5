//! The deferred execution queue that promise reactions are scheduled on.
//!
use crate::Error;
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::Future,
    task::{Context, Poll},
};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce()>;

/// Something that runs jobs later, after the caller's stack has unwound, in
/// the order they were deferred and one at a time.
pub trait Defer {
    fn defer(&self, job: Job);
}

/// A FIFO microtask queue driven by hand.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, MicrotaskQueue, Promise};
/// use std::rc::Rc;
///
/// let queue = Rc::new(MicrotaskQueue::new());
/// let promise = Promise::<i32, Error>::resolved(queue.clone(), 20).map(|v| v + 1);
/// assert_eq!(queue.block_on(promise.waiter()), Ok(Ok(21)));
/// ```
#[derive(Default)]
pub struct MicrotaskQueue {
    jobs: RefCell<VecDeque<Job>>,
}

impl MicrotaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    /// Runs the oldest job. Returns `false` when there was nothing to run.
    pub fn run_next(&self) -> bool {
        let job = self.jobs.borrow_mut().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until the queue is empty, including jobs deferred while
    /// draining. Returns how many ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Polls `future` to completion, running queued jobs in between polls.
    ///
    /// Fails with [`Error::Stalled`] if the future is still pending once the
    /// queue is empty, since nothing is left that could complete it.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        futures::pin_mut!(future);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if !self.run_next() {
                return Err(Error::Stalled);
            }
        }
    }
}

impl Defer for MicrotaskQueue {
    fn defer(&self, job: Job) {
        let mut jobs = self.jobs.borrow_mut();
        jobs.push_back(job);
        tracing::trace!(queued = jobs.len(), "job deferred");
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("queued", &self.len())
            .finish()
    }
}
