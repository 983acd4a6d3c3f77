//! Streaming pipes with credit-based flow control
//!
//! TigerStyle: Bounded backlog, explicit credit, no delivery after cancel.
//!
//! A pipe method receives a [`PipeOut<T>`] and pushes values into it; the
//! caller supplies a [`PipeSubscriber<T>`] and gets back a [`PipeFlow`] to
//! steer delivery. Values are buffered in a backlog until the subscriber has
//! credit:
//!
//! - prefetch `n > 0`: a window of `n` credits, refilled after each delivery
//! - prefetch `0`: the configured default window
//! - prefetch `-1` (`PIPE_PREFETCH_MANUAL`): no credit until `credit(n)`
//!
//! Delivery runs on whichever thread released the value (the producer's
//! `next`, or the flow's `credit`/`resume`), never two at once, and never
//! while the pipe state lock is held. A subscriber that panics in `next` is
//! failed with `HandlerPanicked` and receives nothing more.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tidepool_core::cancel::Cancel;
use tidepool_core::config::PipeConfig;
use tidepool_core::constants::PIPE_PREFETCH_MANUAL;
use tidepool_core::error::{Error, Result};
use tracing::{debug, trace, warn};

use crate::method::panic_message;

// =============================================================================
// Subscriber
// =============================================================================

/// Consumer side of a pipe
pub trait PipeSubscriber<T>: Send + 'static {
    /// Receive one value
    fn next(&mut self, value: T);

    /// The producer finished
    fn close(&mut self) {}

    /// The producer failed, or the pipe call was rejected
    fn fail(&mut self, error: Error) {
        debug!(error = %error, "Pipe failed");
    }

    /// Credit window: `0` for the runtime default, `-1` for manual credit
    fn prefetch(&self) -> i32 {
        0
    }
}

/// Subscriber built from a closure
pub struct FnSubscriber<T, F> {
    f: F,
    prefetch: i32,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> FnSubscriber<T, F> {
    /// Use a fixed credit window (`-1` for manual credit)
    pub fn with_prefetch(mut self, prefetch: i32) -> Self {
        self.prefetch = prefetch;
        self
    }
}

impl<T, F> PipeSubscriber<T> for FnSubscriber<T, F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    fn next(&mut self, value: T) {
        (self.f)(value)
    }

    fn prefetch(&self) -> i32 {
        self.prefetch
    }
}

/// Subscribe with a closure that receives each value
pub fn pipe_fn<T, F>(f: F) -> FnSubscriber<T, F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    FnSubscriber {
        f,
        prefetch: 0,
        _marker: std::marker::PhantomData,
    }
}

// =============================================================================
// Shared state
// =============================================================================

type Available = Arc<dyn Fn() + Send + Sync + 'static>;
type Finished = Box<dyn FnOnce() + Send + 'static>;

struct PipeState<T> {
    backlog: VecDeque<T>,
    credits: u64,
    manual: bool,
    paused: bool,
    /// A delivery is running; others leave the backlog to it
    delivering: bool,
    /// Producer outcome not yet passed to the subscriber
    end: Option<Result<()>>,
    /// Subscriber saw its last callback, or the flow was cancelled
    finished: bool,
    /// The pipe method is running; dropping the producer waits for its result
    in_call: bool,
    dropped_in_call: bool,
    on_available: Option<Available>,
    /// Runs once, when `finished` is first set
    on_finished: Option<Finished>,
}

impl<T> PipeState<T> {
    /// Mark the pipe finished, handing back the finish hook
    fn terminate(&mut self) -> Option<Finished> {
        self.backlog.clear();
        self.end = None;
        self.finished = true;
        self.on_available = None;
        self.on_finished.take()
    }
}

enum Step<T> {
    Item(T),
    End(Result<()>),
}

struct PipeShared<T> {
    state: Mutex<PipeState<T>>,
    subscriber: Mutex<Box<dyn PipeSubscriber<T>>>,
    cancel: Cancel,
    backlog_max: usize,
    /// Address of the producing service, for error reports
    source: String,
}

impl<T: Send + 'static> PipeShared<T> {
    /// Deliver whatever the credit allows
    fn pump(&self) {
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.delivering || state.finished {
                    return;
                }
                if self.cancel.is_cancelled() {
                    let hook = state.terminate();
                    drop(state);
                    run_finished(hook);
                    return;
                }

                if !state.paused && state.credits > 0 && !state.backlog.is_empty() {
                    match state.backlog.pop_front() {
                        Some(value) => {
                            state.credits -= 1;
                            state.delivering = true;
                            Step::Item(value)
                        }
                        None => return,
                    }
                } else if state.backlog.is_empty() && state.end.is_some() {
                    match state.end.take() {
                        Some(end) => {
                            state.finished = true;
                            state.delivering = true;
                            Step::End(end)
                        }
                        None => return,
                    }
                } else {
                    return;
                }
            };

            match step {
                Step::Item(value) => {
                    let delivered =
                        catch_unwind(AssertUnwindSafe(|| self.subscriber.lock().next(value)));
                    let mut state = self.state.lock();
                    state.delivering = false;
                    if let Err(payload) = delivered {
                        let hook = state.terminate();
                        drop(state);
                        self.subscriber_panicked("next", payload.as_ref());
                        run_finished(hook);
                        return;
                    }
                    if !state.manual {
                        state.credits += 1;
                    }
                }
                Step::End(end) => {
                    let delivered = catch_unwind(AssertUnwindSafe(|| {
                        let mut subscriber = self.subscriber.lock();
                        match end {
                            Ok(()) => subscriber.close(),
                            Err(e) => subscriber.fail(e),
                        }
                    }));
                    let hook = {
                        let mut state = self.state.lock();
                        state.delivering = false;
                        state.on_finished.take()
                    };
                    if let Err(payload) = delivered {
                        warn!(
                            source = %self.source,
                            message = %panic_message(payload.as_ref()),
                            "Pipe subscriber panicked in its last callback"
                        );
                    }
                    run_finished(hook);
                    trace!("Pipe finished");
                    return;
                }
            }
        }
    }

    /// Fail a subscriber whose `next` panicked; it gets no further values
    fn subscriber_panicked(&self, callback: &str, payload: &(dyn Any + Send)) {
        let error = Error::HandlerPanicked {
            address: self.source.clone(),
            method: format!("subscriber {}", callback),
            message: panic_message(payload),
        };
        warn!(source = %self.source, error = %error, "Pipe subscriber panicked");
        let failed = catch_unwind(AssertUnwindSafe(|| self.subscriber.lock().fail(error)));
        if failed.is_err() {
            debug!(source = %self.source, "Pipe subscriber panicked again in fail");
        }
    }

    fn push(&self, value: T) -> Result<()> {
        {
            let mut state = self.state.lock();
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if state.end.is_some() || state.finished {
                return Err(Error::PipeClosed);
            }
            if state.backlog.len() >= self.backlog_max {
                return Err(Error::PipeBacklogFull {
                    count: state.backlog.len(),
                    limit: self.backlog_max,
                });
            }
            state.backlog.push_back(value);
        }
        self.pump();
        Ok(())
    }

    /// Record the producer outcome; later outcomes are ignored
    fn finish(&self, end: Result<()>) {
        {
            let mut state = self.state.lock();
            if state.end.is_some() || state.finished {
                return;
            }
            state.end = Some(end);
        }
        self.pump();
    }

    fn available(&self) -> u64 {
        let state = self.state.lock();
        if state.paused {
            return 0;
        }
        state.credits.saturating_sub(state.backlog.len() as u64)
    }

    /// Tell the producer it may push again
    fn notify_available(&self) {
        let hook = {
            let state = self.state.lock();
            if state.finished || state.paused || !state.backlog.is_empty() {
                return;
            }
            state.on_available.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Flow operations a [`PipeFlow`] forwards without knowing `T`
trait FlowControl: Send + Sync {
    fn credit(&self, count: u32);
    fn pause(&self);
    fn resume(&self);
    fn cancelled(&self);
}

impl<T: Send + 'static> FlowControl for PipeShared<T> {
    fn credit(&self, count: u32) {
        self.state.lock().credits += u64::from(count);
        self.pump();
        self.notify_available();
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn resume(&self) {
        self.state.lock().paused = false;
        self.pump();
        self.notify_available();
    }

    fn cancelled(&self) {
        let hook = self.state.lock().terminate();
        run_finished(hook);
    }
}

// =============================================================================
// Producer
// =============================================================================

/// Producer side of a pipe, handed to the pipe method
///
/// Dropping it closes the pipe normally.
pub struct PipeOut<T: Send + 'static> {
    shared: Arc<PipeShared<T>>,
}

impl<T: Send + 'static> PipeOut<T> {
    /// Push a value
    ///
    /// Fails with `Cancelled` once the subscriber cancelled, `PipeClosed`
    /// after the pipe ended, and `PipeBacklogFull` when the subscriber is
    /// too far behind.
    pub fn next(&self, value: T) -> Result<()> {
        self.shared.push(value)
    }

    /// End the stream normally
    pub fn close(self) {
        self.shared.finish(Ok(()));
    }

    /// End the stream with an error
    pub fn fail(self, error: Error) {
        self.shared.finish(Err(error));
    }

    /// Values the subscriber can take right now without buffering
    pub fn credits(&self) -> u64 {
        self.shared.available()
    }

    /// Check whether the subscriber cancelled
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Run `f` whenever the subscriber grants new credit with nothing buffered
    pub fn on_available<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.state.lock().on_available = Some(Arc::new(f));
    }

    /// Run `f` once the pipe finished, was cancelled, or lost its subscriber
    pub(crate) fn on_finished<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.finished {
            drop(state);
            return f();
        }
        state.on_finished = Some(Box::new(f));
    }

    /// Runtime handle bracketing the pipe method invocation
    pub(crate) fn call_handle(&self) -> PipeCall {
        PipeCall {
            control: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for PipeOut<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.in_call {
                state.dropped_in_call = true;
                return;
            }
        }
        self.shared.finish(Ok(()));
    }
}

/// Call bracketing a [`PipeCall`] forwards without knowing `T`
trait CallControl: Send + Sync {
    fn begin(&self);
    fn end(&self, result: Result<()>);
}

impl<T: Send + 'static> CallControl for PipeShared<T> {
    fn begin(&self) {
        self.state.lock().in_call = true;
    }

    fn end(&self, result: Result<()>) {
        let dropped = {
            let mut state = self.state.lock();
            state.in_call = false;
            std::mem::take(&mut state.dropped_in_call)
        };
        match result {
            Err(e) => self.finish(Err(e)),
            Ok(()) if dropped => self.finish(Ok(())),
            // The handler kept the producer; its drop closes the pipe
            Ok(()) => {}
        }
    }
}

/// Runtime side of one pipe call
///
/// A producer dropped while the method runs does not close the pipe until
/// the method returns, so a failed method (or one never found) reaches the
/// subscriber as `fail` instead of `close`.
pub(crate) struct PipeCall {
    control: Arc<dyn CallControl>,
}

impl PipeCall {
    pub(crate) fn begin(&self) {
        self.control.begin();
    }

    pub(crate) fn end(self, result: Result<()>) {
        self.control.end(result);
    }
}

impl fmt::Debug for PipeCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeCall").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> fmt::Debug for PipeOut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PipeOut")
            .field("backlog", &state.backlog.len())
            .field("credits", &state.credits)
            .field("finished", &state.finished)
            .finish()
    }
}

// =============================================================================
// Flow handle
// =============================================================================

/// Caller-side handle steering a pipe
#[derive(Clone)]
pub struct PipeFlow {
    control: Arc<dyn FlowControl>,
    cancel: Cancel,
}

impl PipeFlow {
    /// Grant `count` more values (manual credit mode)
    pub fn credit(&self, count: u32) {
        self.control.credit(count);
    }

    /// Hold deliveries; the producer keeps buffering up to the backlog limit
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Release held deliveries
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Stop the pipe; the subscriber receives nothing more
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Check whether the pipe was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel handle shared with the producer's actor
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }
}

impl fmt::Debug for PipeFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeFlow")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn run_finished(hook: Option<Finished>) {
    if let Some(hook) = hook {
        hook();
    }
}

/// Create the two ends of a pipe fed by the service at `source`
pub(crate) fn channel<T, S>(
    subscriber: S,
    config: &PipeConfig,
    source: &str,
) -> (PipeOut<T>, PipeFlow)
where
    T: Send + 'static,
    S: PipeSubscriber<T>,
{
    let prefetch = subscriber.prefetch();
    let (credits, manual) = match prefetch {
        0 => (u64::from(config.prefetch_default), false),
        n if n > 0 => (n.unsigned_abs().into(), false),
        n => {
            debug_assert_eq!(n, PIPE_PREFETCH_MANUAL, "negative prefetch selects manual credit");
            (0, true)
        }
    };

    let cancel = Cancel::new();
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            backlog: VecDeque::new(),
            credits,
            manual,
            paused: false,
            delivering: false,
            end: None,
            finished: false,
            in_call: false,
            dropped_in_call: false,
            on_available: None,
            on_finished: None,
        }),
        subscriber: Mutex::new(Box::new(subscriber)),
        cancel: cancel.clone(),
        backlog_max: config.backlog_count_max,
        source: source.to_string(),
    });

    // Weak: the cancel handle lives inside the shared state
    let weak: Weak<PipeShared<T>> = Arc::downgrade(&shared);
    cancel.on_cancel(move || {
        if let Some(shared) = weak.upgrade() {
            shared.cancelled();
        }
    });

    let flow = PipeFlow {
        control: shared.clone(),
        cancel,
    };
    (PipeOut { shared }, flow)
}
