//! Single-fire deferred results.
//!
//! A [`Deferred`] starts pending and fires exactly once, with either a value
//! or a [`Failure`]. Handlers added through [`Deferred::add_callbacks`] and
//! its shorthands form a chain: each handler receives the result left by the
//! previous one and returns the result for the next. Handlers added after the
//! Deferred has fired run immediately, on the caller's stack.
//!
//! Everything here is single-threaded. A `Deferred` is a cheap `Rc` handle;
//! clones share one result and one chain.
//!
//! # Chaining
//!
//! A handler may answer with another Deferred (see [`Step::Wait`]). The outer
//! Deferred then pauses until the inner one fires and continues with the
//! inner result. The inner Deferred's result is handed off in the process:
//! callbacks added to it afterwards never run.
//!
//! # Joining
//!
//! [`gather`] waits for several Deferreds and yields their values, failing
//! on the first failure. [`settle_all`] waits for all of them and yields
//! every outcome.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;

use anyhow::anyhow;
use thiserror::Error;

/// The failure side of a Deferred result.
pub type Failure = anyhow::Error;

/// The result a Deferred carries once fired.
pub type Outcome<T> = Result<T, Failure>;

/// Firing a Deferred that has already fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deferred has already fired")]
pub struct AlreadyFired;

/// What a chained handler passes on to the next link.
pub enum Step<T> {
    /// A result available now.
    Ready(Outcome<T>),
    /// A result that arrives when this Deferred fires.
    Wait(Deferred<T>),
}

impl<T> From<Outcome<T>> for Step<T> {
    fn from(outcome: Outcome<T>) -> Self {
        Step::Ready(outcome)
    }
}

impl<T> From<Deferred<T>> for Step<T> {
    fn from(deferred: Deferred<T>) -> Self {
        Step::Wait(deferred)
    }
}

type Handler<T> = Box<dyn FnOnce(Outcome<T>) -> Step<T>>;
type Sink<T> = Box<dyn FnOnce(Outcome<T>)>;

enum Link<T> {
    /// Transforms the current result.
    Handler(Handler<T>),
    /// Takes the result away from this chain.
    Sink(Sink<T>),
}

struct Inner<T> {
    fired: bool,
    /// `None` before firing, and after the result was handed off.
    result: Option<Outcome<T>>,
    chain: VecDeque<Link<T>>,
    paused: usize,
    running: bool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(Err(failure)) = &self.result {
            tracing::error!("unhandled failure in deferred: {failure:#}");
        }
    }
}

/// A single-fire result with a chain of success/failure handlers.
pub struct Deferred<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Deferred")
                .field("fired", &inner.fired)
                .field("failed", &matches!(inner.result, Some(Err(_))))
                .field("pending_links", &inner.chain.len())
                .field("paused", &inner.paused)
                .finish(),
            Err(_) => f.write_str("Deferred { <running> }"),
        }
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Deferred<T> {
    /// A pending Deferred.
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(false, None)
    }

    /// A Deferred that has already fired with `value`.
    #[must_use]
    pub fn succeed(value: T) -> Self {
        Self::from_state(true, Some(Ok(value)))
    }

    /// A Deferred that has already fired with `failure`.
    #[must_use]
    pub fn fail(failure: impl Into<Failure>) -> Self {
        Self::from_state(true, Some(Err(failure.into())))
    }

    fn from_state(fired: bool, result: Option<Outcome<T>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                fired,
                result,
                chain: VecDeque::new(),
                paused: 0,
                running: false,
            })),
        }
    }

    /// Fire with a success value.
    pub fn callback(&self, value: T) -> Result<(), AlreadyFired> {
        self.fire(Ok(value))
    }

    /// Fire with a failure.
    pub fn errback(&self, failure: impl Into<Failure>) -> Result<(), AlreadyFired> {
        self.fire(Err(failure.into()))
    }

    /// Fire with an outcome and run every handler that is not gated by
    /// [`pause`](Self::pause).
    pub fn fire(&self, outcome: Outcome<T>) -> Result<(), AlreadyFired> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fired {
                return Err(AlreadyFired);
            }
            inner.fired = true;
            inner.result = Some(outcome);
        }
        self.run_callbacks();
        Ok(())
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.inner.borrow().fired
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.borrow().paused > 0
    }

    /// Append a success/failure handler pair.
    ///
    /// Exactly one of the two runs, chosen by the result at the time this
    /// link is reached. Returning `Err` moves the chain onto the failure path.
    pub fn add_callbacks<S, F>(&self, on_success: S, on_failure: F) -> &Self
    where
        S: FnOnce(T) -> Outcome<T> + 'static,
        F: FnOnce(Failure) -> Outcome<T> + 'static,
    {
        self.push(Link::Handler(Box::new(move |outcome| {
            Step::Ready(match outcome {
                Ok(value) => on_success(value),
                Err(failure) => on_failure(failure),
            })
        })))
    }

    /// Success handler; failures pass through untouched.
    pub fn add_callback<S>(&self, on_success: S) -> &Self
    where
        S: FnOnce(T) -> Outcome<T> + 'static,
    {
        self.add_callbacks(on_success, Err)
    }

    /// Failure handler; values pass through untouched.
    pub fn add_errback<F>(&self, on_failure: F) -> &Self
    where
        F: FnOnce(Failure) -> Outcome<T> + 'static,
    {
        self.add_callbacks(Ok, on_failure)
    }

    /// One handler for both outcomes.
    pub fn add_both<H>(&self, handler: H) -> &Self
    where
        H: FnOnce(Outcome<T>) -> Outcome<T> + 'static,
    {
        self.push(Link::Handler(Box::new(move |outcome| {
            Step::Ready(handler(outcome))
        })))
    }

    /// Handler that may suspend the chain on another Deferred.
    pub fn add_step<H>(&self, handler: H) -> &Self
    where
        H: FnOnce(Outcome<T>) -> Step<T> + 'static,
    {
        self.push(Link::Handler(Box::new(handler)))
    }

    /// Success handler that continues with the result of another Deferred.
    pub fn add_deferred_callback<S>(&self, on_success: S) -> &Self
    where
        S: FnOnce(T) -> Deferred<T> + 'static,
    {
        self.add_step(move |outcome| match outcome {
            Ok(value) => Step::Wait(on_success(value)),
            Err(failure) => Step::Ready(Err(failure)),
        })
    }

    /// Hand this chain's result to `f` and expose its output as a new
    /// Deferred, possibly of another type.
    ///
    /// This consumes the result: links added here afterwards never run.
    pub fn then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + 'static,
    {
        let next = Deferred::new();
        let target = next.clone();
        self.push(Link::Sink(Box::new(move |outcome| {
            target.hand_off(f(outcome));
        })));
        next
    }

    /// [`then`](Self::then) for the success path only.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |outcome| outcome.map(f))
    }

    /// Continue with another Deferred, possibly of another type, once this
    /// one succeeds. Failures skip `f`.
    pub fn and_then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: 'static,
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        let next = Deferred::new();
        let target = next.clone();
        self.push(Link::Sink(Box::new(move |outcome| match outcome {
            Ok(value) => {
                f(value).push(Link::Sink(Box::new(move |inner| target.hand_off(inner))));
            }
            Err(failure) => target.hand_off(Err(failure)),
        })));
        next
    }

    /// Stop running handlers until a matching [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.borrow_mut().paused += 1;
    }

    /// Undo one [`pause`](Self::pause); the chain continues once every pause
    /// has been undone.
    pub fn resume(&self) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if inner.paused == 0 {
                tracing::warn!("resume called on a deferred that is not paused");
                return;
            }
            inner.paused -= 1;
            inner.paused == 0
        };
        if ready {
            self.run_callbacks();
        }
    }

    fn push(&self, link: Link<T>) -> &Self {
        self.inner.borrow_mut().chain.push_back(link);
        self.run_callbacks();
        self
    }

    fn hand_off(&self, outcome: Outcome<T>) {
        if self.fire(outcome).is_err() {
            tracing::warn!("chained deferred fired twice; dropping the later result");
        }
    }

    /// Continuation for a chain suspended on another Deferred.
    fn resume_with(&self, outcome: Outcome<T>) {
        self.inner.borrow_mut().result = Some(outcome);
        self.resume();
    }

    fn run_callbacks(&self) {
        loop {
            let (link, current) = {
                let mut inner = self.inner.borrow_mut();
                if !inner.fired || inner.paused > 0 || inner.running || inner.chain.is_empty() {
                    return;
                }
                let Some(current) = inner.result.take() else {
                    tracing::warn!(
                        dropped = inner.chain.len(),
                        "deferred result was handed off; dropping later callbacks"
                    );
                    inner.chain.clear();
                    return;
                };
                let Some(link) = inner.chain.pop_front() else {
                    inner.result = Some(current);
                    return;
                };
                inner.running = true;
                (link, current)
            };

            let step = match link {
                Link::Handler(handler) => Some(handler(current)),
                Link::Sink(sink) => {
                    sink(current);
                    None
                }
            };

            let wait_on = {
                let mut inner = self.inner.borrow_mut();
                inner.running = false;
                match step {
                    None => None,
                    Some(Step::Ready(outcome)) => {
                        inner.result = Some(outcome);
                        None
                    }
                    Some(Step::Wait(other)) if Rc::ptr_eq(&other.inner, &self.inner) => {
                        inner.result = Some(Err(anyhow!(
                            "deferred callback returned the deferred it was chained on"
                        )));
                        None
                    }
                    Some(Step::Wait(other)) => {
                        inner.paused += 1;
                        Some(other)
                    }
                }
            };

            if let Some(other) = wait_on {
                let outer = self.clone();
                other.push(Link::Sink(Box::new(move |outcome| outer.resume_with(outcome))));
            }
        }
    }
}

/// Wait for every Deferred in `deferreds` and collect each outcome, in input
/// order.
///
/// The joined Deferred never fails. The inputs' results are handed off, so
/// callbacks added to them afterwards never run.
pub fn settle_all<T: 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<Outcome<T>>> {
    if deferreds.is_empty() {
        return Deferred::succeed(Vec::new());
    }
    let joined = Deferred::new();
    let slots: Rc<RefCell<Vec<Option<Outcome<T>>>>> =
        Rc::new(RefCell::new(deferreds.iter().map(|_| None).collect()));
    let remaining = Rc::new(Cell::new(deferreds.len()));

    for (index, deferred) in deferreds.into_iter().enumerate() {
        let slots = Rc::clone(&slots);
        let remaining = Rc::clone(&remaining);
        let target = joined.clone();
        deferred.push(Link::Sink(Box::new(move |outcome| {
            slots.borrow_mut()[index] = Some(outcome);
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let outcomes = mem::take(&mut *slots.borrow_mut());
                target.hand_off(Ok(outcomes.into_iter().flatten().collect()));
            }
        })));
    }
    joined
}

/// Wait for every Deferred in `deferreds` and collect their values, in input
/// order.
///
/// Fails as soon as any input fails; failures arriving after that are logged
/// and dropped. The inputs' results are handed off either way.
pub fn gather<T: 'static>(deferreds: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    if deferreds.is_empty() {
        return Deferred::succeed(Vec::new());
    }
    let joined = Deferred::new();
    let slots: Rc<RefCell<Vec<Option<T>>>> =
        Rc::new(RefCell::new(deferreds.iter().map(|_| None).collect()));
    let remaining = Rc::new(Cell::new(deferreds.len()));

    for (index, deferred) in deferreds.into_iter().enumerate() {
        let slots = Rc::clone(&slots);
        let remaining = Rc::clone(&remaining);
        let target = joined.clone();
        deferred.push(Link::Sink(Box::new(move |outcome| {
            remaining.set(remaining.get() - 1);
            match outcome {
                Err(failure) if target.is_fired() => {
                    tracing::debug!(index, "gathered deferred failed after the first: {failure:#}");
                }
                Err(failure) => target.hand_off(Err(failure)),
                Ok(value) => {
                    slots.borrow_mut()[index] = Some(value);
                    if remaining.get() == 0 && !target.is_fired() {
                        let values = mem::take(&mut *slots.borrow_mut());
                        target.hand_off(Ok(values.into_iter().flatten().collect()));
                    }
                }
            }
        })));
    }
    joined
}
