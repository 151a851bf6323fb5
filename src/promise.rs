use crate::{Defer, Error, Job, Probe, Resolution, Waiter};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    future::IntoFuture,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, trace};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a promise, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl PromiseId {
    fn next() -> Self {
        PromiseId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a promise is in its life. Only `Pending` ever changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

type Reaction<A> = Box<dyn FnOnce(A)>;

struct Inner<T, E> {
    id: PromiseId,
    state: State<T, E>,
    on_fulfilled: VecDeque<Reaction<T>>,
    on_rejected: VecDeque<Reaction<E>>,
    queue: Rc<dyn Defer>,
    /// The promise this one is waiting on after being resolved with it.
    adopts: Option<Weak<RefCell<Inner<T, E>>>>,
    release: fn(VecDeque<Reaction<T>>, VecDeque<Reaction<E>>),
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        let on_fulfilled = std::mem::take(&mut self.on_fulfilled);
        let on_rejected = std::mem::take(&mut self.on_rejected);
        (self.release)(on_fulfilled, on_rejected);
    }
}

thread_local! {
    static RELEASED: RefCell<Option<Vec<Box<dyn Any>>>> = RefCell::new(None);
}

/// Drops unrun reactions one at a time instead of recursively.
///
/// Reactions own the resolvers of derived promises, so dropping a pending
/// chain would otherwise nest one `Drop` per link. The outermost call drains
/// a thread-local list that nested calls only push onto.
fn release<T: 'static, E: 'static>(
    on_fulfilled: VecDeque<Reaction<T>>,
    on_rejected: VecDeque<Reaction<E>>,
) {
    if on_fulfilled.is_empty() && on_rejected.is_empty() {
        return;
    }
    let parked: Box<dyn Any> = Box::new((on_fulfilled, on_rejected));
    let outermost = RELEASED.try_with(|released| {
        let mut released = released.borrow_mut();
        let outermost = released.is_none();
        released.get_or_insert_with(Vec::new).push(parked);
        outermost
    });
    if !matches!(outermost, Ok(true)) {
        return;
    }
    loop {
        let next = RELEASED.with(|released| {
            let mut released = released.borrow_mut();
            let next = released.as_mut().and_then(Vec::pop);
            if next.is_none() {
                *released = None;
            }
            next
        });
        match next {
            Some(parked) => drop(parked),
            None => break,
        }
    }
}

/// A single-assignment value that is either fulfilled or rejected exactly
/// once, with continuations registered through [`Promise::then`].
///
/// Cloning a `Promise` clones the handle, not the value: every clone observes
/// the same settlement.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Error, MicrotaskQueue, Promise, Resolution};
/// use std::rc::Rc;
///
/// let queue = Rc::new(MicrotaskQueue::new());
/// let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
/// let doubled = promise.and_then(|v| Ok(Resolution::Value(v * 2)));
/// resolver.resolve(21);
/// assert_eq!(queue.block_on(doubled.waiter()), Ok(Ok(42)));
/// ```
pub struct Promise<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The settlement capability of a promise.
///
/// `resolve` and `reject` share one guard: whichever is called first wins and
/// every later call through this resolver (or its clones) is ignored, even if
/// the first call only locked the promise onto a thenable that is still
/// pending.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
    resolved: Rc<Cell<bool>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a promise and runs `producer` synchronously with its resolver.
    pub fn new<P>(queue: Rc<dyn Defer>, producer: P) -> Self
    where
        P: FnOnce(Resolver<T, E>),
    {
        let (resolver, promise) = Self::pair(queue);
        producer(resolver);
        promise
    }

    /// Like [`Promise::new`], but a producer returning `Err` rejects the
    /// promise unless it was already resolved.
    pub fn try_new<P>(queue: Rc<dyn Defer>, producer: P) -> Self
    where
        P: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (resolver, promise) = Self::pair(queue);
        if let Err(reason) = producer(resolver.clone()) {
            if resolver.claim() {
                promise.reject(reason);
            } else {
                trace!(promise = %promise.id(), "producer error after resolution ignored");
            }
        }
        promise
    }

    /// Creates a pending promise together with the resolver that settles it.
    pub fn pair(queue: Rc<dyn Defer>) -> (Resolver<T, E>, Self) {
        let promise = Self {
            inner: Rc::new(RefCell::new(Inner {
                id: PromiseId::next(),
                state: State::Pending,
                on_fulfilled: VecDeque::new(),
                on_rejected: VecDeque::new(),
                queue,
                adopts: None,
                release: release::<T, E>,
            })),
        };
        (Resolver::new(promise.clone()), promise)
    }

    pub fn resolved(queue: Rc<dyn Defer>, value: T) -> Self {
        Self::new(queue, |resolver| resolver.resolve(value))
    }

    pub fn rejected(queue: Rc<dyn Defer>, reason: E) -> Self {
        Self::new(queue, |resolver| resolver.reject(reason))
    }

    pub fn id(&self) -> PromiseId {
        self.inner.borrow().id
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers continuations for both outcomes and returns the promise they
    /// settle.
    ///
    /// Whatever a handler returns in `Ok` goes through the resolution
    /// procedure, so a recovered rejection becomes a fulfillment unless the
    /// handler hands back another failing promise. An `Err` rejects the
    /// returned promise. Handlers never run before the caller's stack has
    /// unwound, even when this promise is already settled.
    pub fn then<U, S, F>(&self, on_success: S, on_failure: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        S: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        F: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(
            move |value, derived| derived.complete(on_success(value)),
            move |reason, derived| derived.complete(on_failure(reason)),
        )
    }

    /// Registers a success continuation; a rejection passes through unchanged.
    pub fn and_then<U, S>(&self, on_success: S) -> Promise<U, E>
    where
        U: Clone + 'static,
        S: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(
            move |value, derived| derived.complete(on_success(value)),
            |reason, derived| derived.reject(reason),
        )
    }

    /// Registers a failure continuation; a fulfillment passes through
    /// unchanged.
    pub fn or_else<F>(&self, on_failure: F) -> Promise<T, E>
    where
        F: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.chain::<T, _, _>(
            |value, derived| derived.resolve(value),
            move |reason, derived| derived.complete(on_failure(reason)),
        )
    }

    /// A derived promise that settles the same way as this one.
    pub fn pass_through(&self) -> Promise<T, E> {
        self.chain::<T, _, _>(
            |value, derived| derived.resolve(value),
            |reason, derived| derived.reject(reason),
        )
    }

    /// Maps the fulfillment value with an infallible function.
    pub fn map<U, M>(&self, f: M) -> Promise<U, E>
    where
        U: Clone + 'static,
        M: FnOnce(T) -> U + 'static,
    {
        self.and_then(move |value| Ok(Resolution::Value(f(value))))
    }

    /// A future that completes with this promise's outcome.
    pub fn waiter(&self) -> Waiter<T, E> {
        let (waiter, deliver) = Waiter::new();
        let deliver_err = deliver.clone();
        self.subscribe(
            Box::new(move |value| deliver.deliver(Ok(value))),
            Box::new(move |reason| deliver_err.deliver(Err(reason))),
        );
        waiter
    }

    fn chain<U, S, F>(&self, on_fulfilled: S, on_rejected: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        S: FnOnce(T, Resolver<U, E>) + 'static,
        F: FnOnce(E, Resolver<U, E>) + 'static,
    {
        let (derived, promise) = Promise::pair(self.queue());
        let derived_err = derived.clone();
        self.subscribe(
            Box::new(move |value| on_fulfilled(value, derived)),
            Box::new(move |reason| on_rejected(reason, derived_err)),
        );
        promise
    }

    /// Whether this is `target`, or is pending on a chain of adoptions that
    /// leads to `target`.
    fn waits_on(&self, target: &Self) -> bool {
        let mut node = self.inner.clone();
        loop {
            if Rc::ptr_eq(&node, &target.inner) {
                return true;
            }
            let next = {
                let inner = node.borrow();
                if !inner.state.is_pending() {
                    return false;
                }
                inner.adopts.as_ref().and_then(Weak::upgrade)
            };
            match next {
                Some(next) => node = next,
                None => return false,
            }
        }
    }

    fn queue(&self) -> Rc<dyn Defer> {
        self.inner.borrow().queue.clone()
    }

    /// Queues a reaction pair, or defers the matching one straight away when
    /// already settled.
    fn subscribe(&self, on_fulfilled: Reaction<T>, on_rejected: Reaction<E>) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let job: Job = match &inner.state {
            State::Pending => {
                inner.on_fulfilled.push_back(on_fulfilled);
                inner.on_rejected.push_back(on_rejected);
                return;
            }
            State::Fulfilled(value) => {
                let value = value.clone();
                Box::new(move || on_fulfilled(value))
            }
            State::Rejected(reason) => {
                let reason = reason.clone();
                Box::new(move || on_rejected(reason))
            }
        };
        let queue = inner.queue.clone();
        drop(guard);
        queue.defer(job);
    }

    /// The resolution procedure.
    fn resolve_with(&self, resolution: Resolution<T, E>) {
        if !self.is_pending() {
            trace!(promise = %self.id(), "resolution of settled promise ignored");
            return;
        }
        match resolution {
            Resolution::Value(value) => self.fulfill(value),
            Resolution::Promise(other) if other.waits_on(self) => {
                let id = self.id();
                self.reject(E::from(Error::Cycle(id)));
            }
            Resolution::Promise(other) => {
                trace!(promise = %self.id(), adopting = %other.id(), "adopting promise");
                self.inner.borrow_mut().adopts = Some(Rc::downgrade(&other.inner));
                let (this, this_err) = (self.clone(), self.clone());
                other.subscribe(
                    Box::new(move |value| this.resolve_with(Resolution::Value(value))),
                    Box::new(move |reason| this_err.reject(reason)),
                );
            }
            Resolution::Thenable(thenable) => match thenable.probe() {
                Err(reason) => self.reject(reason),
                Ok(Probe::Plain(value)) => self.fulfill(value),
                Ok(Probe::Callable(then)) => {
                    let resolver = Resolver::new(self.clone());
                    if let Err(reason) = then(resolver.clone()) {
                        if resolver.claim() {
                            self.reject(reason);
                        } else {
                            trace!(promise = %self.id(), "thenable error after resolution ignored");
                        }
                    }
                }
            },
        }
    }

    fn fulfill(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        if !inner.state.is_pending() {
            return;
        }
        debug!(promise = %inner.id, reactions = inner.on_fulfilled.len(), "promise fulfilled");
        let reactions = std::mem::take(&mut inner.on_fulfilled);
        inner.on_rejected.clear();
        inner.state = State::Fulfilled(value.clone());
        let queue = inner.queue.clone();
        drop(inner);
        for reaction in reactions {
            let value = value.clone();
            queue.defer(Box::new(move || reaction(value)));
        }
    }

    fn reject(&self, reason: E) {
        let mut inner = self.inner.borrow_mut();
        if !inner.state.is_pending() {
            return;
        }
        if inner.on_rejected.is_empty() {
            debug!(promise = %inner.id, "promise rejected with no failure reactions registered");
        } else {
            debug!(promise = %inner.id, reactions = inner.on_rejected.len(), "promise rejected");
        }
        let reactions = std::mem::take(&mut inner.on_rejected);
        inner.on_fulfilled.clear();
        inner.state = State::Rejected(reason.clone());
        let queue = inner.queue.clone();
        drop(inner);
        for reaction in reactions {
            let reason = reason.clone();
            queue.defer(Box::new(move || reaction(reason)));
        }
    }
}

impl<T, E> IntoFuture for Promise<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Waiter<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.waiter()
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Promise")
                .field("id", &inner.id)
                .field("state", &inner.state)
                .finish(),
            Err(_) => f.write_str("Promise { <borrowed> }"),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    fn new(promise: Promise<T, E>) -> Self {
        Self {
            promise,
            resolved: Rc::new(Cell::new(false)),
        }
    }

    /// Marks this resolver used. Returns `false` if it already was.
    fn claim(&self) -> bool {
        let first = !self.resolved.replace(true);
        if !first {
            trace!(promise = %self.promise.id(), "duplicate resolution ignored");
        }
        first
    }

    fn complete(&self, outcome: Result<Resolution<T, E>, E>) {
        match outcome {
            Ok(resolution) => self.resolve_with(resolution),
            Err(reason) => self.reject(reason),
        }
    }

    /// Fulfills the promise with a plain value.
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value));
    }

    /// Runs the resolution procedure: plain values fulfill, promises and
    /// thenables are adopted. Resolving with the promise itself, or with a
    /// promise that is already waiting on this one, rejects with
    /// [`Error::Cycle`].
    pub fn resolve_with(&self, resolution: Resolution<T, E>) {
        if self.claim() {
            self.promise.resolve_with(resolution);
        }
    }

    pub fn reject(&self, reason: E) {
        if self.claim() {
            self.promise.reject(reason);
        }
    }

    /// Whether `resolve`, `resolve_with` or `reject` has been called.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    /// The promise this resolver settles.
    pub fn promise(&self) -> &Promise<T, E> {
        &self.promise
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("resolved", &self.resolved.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{Promise, State};
    use crate::{Error, MicrotaskQueue, Resolution};
    use std::{cell::RefCell, rc::Rc};

    fn queue() -> Rc<MicrotaskQueue> {
        Rc::new(MicrotaskQueue::new())
    }

    #[test]
    fn test_first_settlement_wins() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject(Error::Thrown("late".into()));
        assert_eq!(promise.state(), State::Fulfilled(1));
        assert!(resolver.is_resolved());
    }

    #[test]
    fn test_reject_then_resolve_is_ignored() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        resolver.reject(Error::Thrown("first".into()));
        resolver.resolve(2);
        assert_eq!(promise.state(), State::Rejected(Error::Thrown("first".into())));
    }

    #[test]
    fn test_self_resolution_is_a_cycle() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        resolver.resolve_with(Resolution::Promise(promise.clone()));
        assert_eq!(promise.state(), State::Rejected(Error::Cycle(promise.id())));
    }

    #[test]
    fn test_locked_onto_pending_promise_ignores_later_calls() {
        let queue = queue();
        let (inner_resolver, inner) = Promise::<i32, Error>::pair(queue.clone());
        let (resolver, outer) = Promise::<i32, Error>::pair(queue.clone());
        resolver.resolve_with(inner.into());
        resolver.resolve(5);
        assert!(outer.is_pending());
        inner_resolver.resolve(9);
        queue.run_until_stalled();
        assert_eq!(outer.state(), State::Fulfilled(9));
    }

    #[test]
    fn test_reactions_are_released_after_settlement() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        let marker = Rc::new(());
        let held = marker.clone();
        promise.map(move |v| {
            let _ = &held;
            v
        });
        assert_eq!(Rc::strong_count(&marker), 2);
        resolver.resolve(1);
        queue.run_until_stalled();
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_unused_failure_reaction_released_on_fulfill() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        let marker = Rc::new(());
        let held = marker.clone();
        promise.or_else(move |reason| {
            let _ = &held;
            Err(reason)
        });
        assert_eq!(Rc::strong_count(&marker), 2);
        resolver.resolve(1);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_unused_success_reaction_released_on_reject() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        let marker = Rc::new(());
        let held = marker.clone();
        promise.and_then(move |v| {
            let _ = &held;
            Ok(Resolution::Value(v))
        });
        assert_eq!(Rc::strong_count(&marker), 2);
        resolver.reject(Error::Thrown("no".into()));
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_adopting_settled_promise() {
        let queue = queue();
        let (resolver, promise) = Promise::<i32, Error>::pair(queue.clone());
        resolver.resolve_with(Resolution::Promise(Promise::resolved(queue.clone(), 4)));
        assert!(promise.is_pending());
        queue.run_until_stalled();
        assert_eq!(promise.state(), State::Fulfilled(4));
    }

    #[test]
    fn test_dropping_long_pending_chain() {
        let queue = queue();
        let (resolver, root) = Promise::<i32, Error>::pair(queue.clone());
        let marker = Rc::new(());
        let mut tail = root.clone();
        for _ in 0..100_000 {
            tail = tail.map(|v| v + 1);
        }
        let held = marker.clone();
        tail.map(move |v| {
            let _ = &held;
            v
        });
        drop(tail);
        drop(root);
        drop(resolver);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_mutual_adoption_is_a_cycle() {
        let queue = queue();
        let (a_resolver, a) = Promise::<i32, Error>::pair(queue.clone());
        let (b_resolver, b) = Promise::<i32, Error>::pair(queue.clone());
        a_resolver.resolve_with(Resolution::Promise(b.clone()));
        b_resolver.resolve_with(Resolution::Promise(a.clone()));
        assert_eq!(b.state(), State::Rejected(Error::Cycle(b.id())));
        queue.run_until_stalled();
        assert_eq!(a.state(), State::Rejected(Error::Cycle(b.id())));
    }

    #[test]
    fn test_adopting_a_chain_of_waiting_promises_is_a_cycle() {
        let queue = queue();
        let (a_resolver, a) = Promise::<i32, Error>::pair(queue.clone());
        let (b_resolver, b) = Promise::<i32, Error>::pair(queue.clone());
        let (c_resolver, c) = Promise::<i32, Error>::pair(queue.clone());
        b_resolver.resolve_with(Resolution::Promise(c.clone()));
        a_resolver.resolve_with(Resolution::Promise(b.clone()));
        c_resolver.resolve_with(Resolution::Promise(a.clone()));
        assert_eq!(c.state(), State::Rejected(Error::Cycle(c.id())));
        queue.run_until_stalled();
        assert_eq!(a.state(), State::Rejected(Error::Cycle(c.id())));
        assert_eq!(b.state(), State::Rejected(Error::Cycle(c.id())));
    }

    #[test]
    fn test_try_new_error_rejects() {
        let queue = queue();
        let promise = Promise::<i32, Error>::try_new(queue.clone(), |_| {
            Err(Error::Thrown("producer".into()))
        });
        assert_eq!(promise.state(), State::Rejected(Error::Thrown("producer".into())));
    }

    #[test]
    fn test_try_new_error_after_resolve_is_ignored() {
        let queue = queue();
        let promise = Promise::<i32, Error>::try_new(queue.clone(), |resolver| {
            resolver.resolve(3);
            Err(Error::Thrown("producer".into()))
        });
        assert_eq!(promise.state(), State::Fulfilled(3));
    }

    #[test]
    fn test_ids_are_unique() {
        let queue = queue();
        let a = Promise::<(), Error>::resolved(queue.clone(), ());
        let b = a.pass_through();
        assert_ne!(a.id(), b.id());
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_settled_promise_reaction_is_deferred() {
        let queue = queue();
        let seen = Rc::new(RefCell::new(None));
        let promise = Promise::<i32, Error>::resolved(queue.clone(), 4);
        let sink = seen.clone();
        promise.and_then(move |v| {
            *sink.borrow_mut() = Some(v);
            Ok(Resolution::Value(()))
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(*seen.borrow(), None);
        queue.run_until_stalled();
        assert_eq!(*seen.borrow(), Some(4));
    }
}
