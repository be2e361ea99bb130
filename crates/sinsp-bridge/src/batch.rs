//! Per-session event production worker.
//!
//! The host thread inside `plugin_next`/`plugin_next_batch` publishes an
//! operation under the guard and waits on the condition variable; the session
//! worker picks it up, runs the plugin's `Next` outside the guard, stores the
//! result and flips the operation back to `Init`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::abi::ReturnCode;
use crate::error::{BridgeError, Result};
use crate::event::PluginEvent;

/// Operation currently published to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Next,
    NextBatch(usize),
    Done,
}

/// Events gathered by one batch request.
#[derive(Debug)]
pub struct BatchResult {
    pub events: Vec<PluginEvent>,
    pub rc: ReturnCode,
    /// The error that ended the batch early, if any. Set even when `rc` is
    /// SUCCESS because some events were produced first.
    pub error: Option<BridgeError>,
}

enum Outcome {
    Single(Result<PluginEvent>),
    Batch(BatchResult),
}

struct Slot {
    op: Operation,
    outcome: Option<Outcome>,
    in_flight: bool,
    started: bool,
    terminal: Option<Terminal>,
}

/// Code and message of the error that ended a session.
struct Terminal {
    rc: ReturnCode,
    message: String,
}

impl Terminal {
    fn to_error(&self) -> BridgeError {
        match self.rc {
            ReturnCode::Eof => BridgeError::Eof,
            _ => BridgeError::Plugin(anyhow::anyhow!("{}", self.message)),
        }
    }
}

/// Rendezvous state shared by one session's host calls and its worker.
pub struct BatchDispatchContext {
    slot: Mutex<Slot>,
    signal: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchDispatchContext {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                op: Operation::Init,
                outcome: None,
                in_flight: false,
                started: false,
                terminal: None,
            }),
            signal: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn operation(&self) -> Operation {
        self.slot.lock().op
    }

    pub fn is_running(&self) -> bool {
        let slot = self.slot.lock();
        slot.started && slot.op != Operation::Done
    }

    /// Spawn the session worker around `next`.
    pub fn start<F>(self: &Arc<Self>, next: F) -> Result<()>
    where
        F: FnMut() -> Result<PluginEvent> + Send + 'static,
    {
        {
            let mut slot = self.slot.lock();
            if slot.started {
                return Err(BridgeError::ProtocolViolation(
                    "dispatch worker already started",
                ));
            }
            slot.started = true;
        }

        let ctx = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("sinsp-batch-dispatch".into())
            .spawn(move || ctx.run(next));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.slot.lock().started = false;
                return Err(BridgeError::Plugin(
                    anyhow::Error::new(e).context("spawning dispatch worker"),
                ));
            }
        };

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn run<F>(&self, mut next: F)
    where
        F: FnMut() -> Result<PluginEvent>,
    {
        debug!("dispatch worker started");
        loop {
            let op = {
                let mut slot = self.slot.lock();
                while slot.op == Operation::Init {
                    self.signal.wait(&mut slot);
                }
                slot.op
            };

            let outcome = match op {
                Operation::Done => break,
                Operation::Init => continue,
                Operation::Next => Outcome::Single(call_next(&mut next)),
                Operation::NextBatch(max) => {
                    Outcome::Batch(collect_batch(max, || call_next(&mut next)))
                }
            };

            let mut slot = self.slot.lock();
            slot.terminal = terminal_of(&outcome);
            slot.outcome = Some(outcome);
            slot.op = Operation::Init;
            self.signal.notify_all();
        }
        debug!("dispatch worker stopped");
    }

    /// Ask the worker for one event and wait for it.
    pub fn request_next(&self) -> Result<PluginEvent> {
        match self.request(Operation::Next)? {
            Outcome::Single(result) => result,
            Outcome::Batch(_) => Err(BridgeError::ProtocolViolation(
                "batch result for single request",
            )),
        }
    }

    /// Ask the worker for up to `max` events and wait for them.
    pub fn request_batch(&self, max: usize) -> Result<BatchResult> {
        match self.request(Operation::NextBatch(max))? {
            Outcome::Batch(batch) => Ok(batch),
            Outcome::Single(_) => Err(BridgeError::ProtocolViolation(
                "single result for batch request",
            )),
        }
    }

    fn request(&self, op: Operation) -> Result<Outcome> {
        let mut slot = self.slot.lock();
        if !slot.started {
            return Err(BridgeError::ProtocolViolation("no dispatch worker attached"));
        }
        if slot.op == Operation::Done {
            return Err(BridgeError::ProtocolViolation("session already closed"));
        }
        if slot.in_flight || slot.op != Operation::Init {
            return Err(BridgeError::ProtocolViolation("request already in flight"));
        }
        if let Some(terminal) = &slot.terminal {
            return Err(terminal.to_error());
        }

        slot.op = op;
        slot.in_flight = true;
        self.signal.notify_all();

        while slot.op != Operation::Init || slot.outcome.is_none() {
            self.signal.wait(&mut slot);
        }
        slot.in_flight = false;
        slot.outcome
            .take()
            .ok_or(BridgeError::ProtocolViolation("missing dispatch result"))
    }

    /// Publish `Done` and join the worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut slot = self.slot.lock();
            while slot.in_flight {
                self.signal.wait(&mut slot);
            }
            slot.op = Operation::Done;
            self.signal.notify_all();
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("dispatch worker panicked");
            }
        }
    }
}

impl Default for BatchDispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

fn call_next<F>(next: &mut F) -> Result<PluginEvent>
where
    F: FnMut() -> Result<PluginEvent>,
{
    catch_unwind(AssertUnwindSafe(next)).unwrap_or_else(|_| {
        Err(BridgeError::Plugin(anyhow::anyhow!(
            "plugin panicked while producing an event"
        )))
    })
}

/// Codes after which a session produces nothing more.
fn is_terminal(rc: ReturnCode) -> bool {
    matches!(rc, ReturnCode::Failure | ReturnCode::Eof)
}

fn terminal_of(outcome: &Outcome) -> Option<Terminal> {
    let err = match outcome {
        Outcome::Single(Err(e)) => e,
        Outcome::Batch(BatchResult { error: Some(e), .. }) => e,
        _ => return None,
    };
    let rc = err.return_code();
    is_terminal(rc).then(|| Terminal {
        rc,
        message: format!("{err:#}"),
    })
}

/// Call `next` until `max` events are gathered or it reports anything but success.
///
/// A short batch is always returned as-is; this never waits for more events.
/// With at least one event the batch is SUCCESS, otherwise it carries the
/// code of the error that stopped it.
pub fn collect_batch<F>(max: usize, mut next: F) -> BatchResult
where
    F: FnMut() -> Result<PluginEvent>,
{
    let max = max.max(1);
    let mut events = Vec::new();
    let mut error = None;

    while events.len() < max {
        match next() {
            Ok(evt) => events.push(evt),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    let rc = match (&error, events.is_empty()) {
        (Some(e), true) => e.return_code(),
        _ => ReturnCode::Success,
    };

    BatchResult { events, rc, error }
}
