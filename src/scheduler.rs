//! Background sampling of periodic gauges.
//!
//! A single named thread owns the registry of periodic gauges. Registrations and the stop signal
//! reach it over a channel, so the loop is the only writer of its state. Each gauge is kept in a
//! min-heap keyed by its next due time.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::Rng;

use crate::{BackendClient, ErrorReporter, MetricsError, metric::GaugeRegistration};

const THREAD_NAME: &str = "service-metrics-gauges";

/// First samples are pulled forward by up to this fraction of the interval, so that gauges
/// registered together do not all fire on the same instant.
const MAX_JITTER_FRACTION: f64 = 0.1;

enum Command {
    Register(GaugeRegistration),
    Stop,
}

enum State {
    /// Created but not started; registrations queue in the channel.
    Idle { commands: Receiver<Command> },
    Running {
        handle: JoinHandle<()>,
        done: Receiver<()>,
    },
    Stopped,
}

/// Samples registered periodic gauges on their own intervals and forwards the values to the
/// periodic gauge backend.
pub(crate) struct PeriodicGaugeScheduler {
    sender: Sender<Command>,
    state: Mutex<State>,
    backend: Arc<dyn BackendClient>,
    reporter: Arc<dyn ErrorReporter>,
}

impl PeriodicGaugeScheduler {
    pub(crate) fn new(backend: Arc<dyn BackendClient>, reporter: Arc<dyn ErrorReporter>) -> Self {
        let (sender, commands) = crossbeam_channel::unbounded();
        Self {
            sender,
            state: Mutex::new(State::Idle { commands }),
            backend,
            reporter,
        }
    }

    /// Spawn the sampling thread. Does nothing if it is already running or has been stopped.
    pub(crate) fn start(&self) {
        let mut state = self.lock_state();
        let State::Idle { .. } = *state else {
            tracing::debug!("periodic gauge scheduler already started");
            return;
        };
        let State::Idle { commands } = std::mem::replace(&mut *state, State::Stopped) else {
            return;
        };

        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let backend = self.backend.clone();
        let reporter = self.reporter.clone();

        let spawned = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                // dropped on exit (or unwind), which disconnects `done`
                let _done = done_tx;
                SchedulerLoop::new(backend, reporter).run(&commands);
            });

        match spawned {
            Ok(handle) => {
                tracing::debug!(backend = %self.backend.kind(), "periodic gauge scheduler started");
                *state = State::Running { handle, done };
            }
            Err(e) => {
                let error = MetricsError::TransportConstructionFailed {
                    address: THREAD_NAME.to_string(),
                    source: e.into(),
                };
                tracing::warn!(%error, "periodic gauges will not be sampled");
                self.reporter
                    .report(&error, "starting the periodic gauge scheduler");
            }
        }
    }

    /// Hand a gauge to the sampling thread, replacing any earlier gauge with the same name.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::SchedulerStopped`] once [`stop`](Self::stop) has been called.
    pub(crate) fn register(&self, registration: GaugeRegistration) -> Result<(), MetricsError> {
        // holding the lock orders this send before any stop signal
        let state = self.lock_state();
        if let State::Stopped = *state {
            return Err(MetricsError::SchedulerStopped {
                metric: registration.name.to_string(),
            });
        }
        let metric = registration.name.clone();
        self.sender
            .send(Command::Register(registration))
            .map_err(|_| MetricsError::SchedulerStopped {
                metric: metric.to_string(),
            })
    }

    /// Signal the sampling thread to stop and wait up to `timeout` for it to exit.
    ///
    /// Calling this more than once is harmless. A sample already in progress is allowed to
    /// finish; no new ones start.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::ShutdownTimeout`] if the thread did not exit in time. It is then
    /// left to finish on its own.
    pub(crate) fn stop(&self, timeout: Duration) -> Result<(), MetricsError> {
        let previous = {
            let mut state = self.lock_state();
            let previous = std::mem::replace(&mut *state, State::Stopped);
            if let State::Running { .. } = previous {
                // a send error means the thread is already gone
                let _ = self.sender.send(Command::Stop);
            }
            previous
        };

        let State::Running { handle, done } = previous else {
            return Ok(());
        };

        match done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    ?timeout,
                    "periodic gauge scheduler did not stop in time, shutdown was forced"
                );
                Err(MetricsError::ShutdownTimeout {
                    component: "periodic gauge scheduler",
                    timeout,
                })
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!("periodic gauge scheduler thread panicked");
                }
                tracing::debug!("periodic gauge scheduler stopped");
                Ok(())
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.lock_state(), State::Running { .. })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PeriodicGaugeScheduler {
    fn drop(&mut self) {
        // signal without waiting; the thread exits once its current sample completes
        let state = std::mem::replace(&mut *self.lock_state(), State::Stopped);
        if let State::Running { .. } = state {
            let _ = self.sender.send(Command::Stop);
        }
    }
}

impl std::fmt::Debug for PeriodicGaugeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicGaugeScheduler")
            .field("running", &self.is_running())
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: Instant,
    generation: u64,
    name: Arc<str>,
}

struct Entry {
    registration: GaugeRegistration,
    generation: u64,
}

struct SchedulerLoop {
    backend: Arc<dyn BackendClient>,
    reporter: Arc<dyn ErrorReporter>,
    gauges: HashMap<Arc<str>, Entry>,
    queue: BinaryHeap<Reverse<Due>>,
    next_generation: u64,
}

impl SchedulerLoop {
    fn new(backend: Arc<dyn BackendClient>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            backend,
            reporter,
            gauges: HashMap::new(),
            queue: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    fn run(mut self, commands: &Receiver<Command>) {
        loop {
            if self.sample_due(commands).is_break() {
                break;
            }

            let command = match self.queue.peek() {
                Some(Reverse(due)) => {
                    commands.recv_timeout(due.at.saturating_duration_since(Instant::now()))
                }
                None => commands
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(command) => {
                    if self.apply(command).is_break() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        tracing::trace!(gauges = self.gauges.len(), "periodic gauge loop exiting");
    }

    fn apply(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Register(registration) => {
                self.register(registration);
                ControlFlow::Continue(())
            }
            Command::Stop => ControlFlow::Break(()),
        }
    }

    fn register(&mut self, registration: GaugeRegistration) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let jitter = registration
            .interval
            .mul_f64(rand::rng().random_range(0.0..MAX_JITTER_FRACTION));
        let first = Instant::now().checked_add(registration.interval.saturating_sub(jitter));

        let name = registration.name.clone();
        if self
            .gauges
            .insert(
                name.clone(),
                Entry {
                    registration,
                    generation,
                },
            )
            .is_some()
        {
            tracing::debug!(%name, "replacing periodic gauge registration");
        }

        let Some(first) = first else {
            tracing::warn!(%name, "periodic gauge interval is too large to schedule, it will never be sampled");
            return;
        };
        self.queue.push(Reverse(Due {
            at: first,
            generation,
            name,
        }));
    }

    /// Sample every gauge that was due when the pass began.
    ///
    /// Gauges that fall due while the pass runs wait for the next pass, and pending commands are
    /// checked between samples, so slow sample functions cannot hold off a stop signal.
    fn sample_due(&mut self, commands: &Receiver<Command>) -> ControlFlow<()> {
        let pass_started = Instant::now();
        while let Some(Reverse(due)) = self.queue.peek() {
            if due.at > pass_started {
                break;
            }
            match commands.try_recv() {
                Ok(command) => {
                    if self.apply(command).is_break() {
                        return ControlFlow::Break(());
                    }
                }
                Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
                Err(TryRecvError::Empty) => {}
            }
            let Some(Reverse(due)) = self.queue.pop() else {
                break;
            };

            let Some(entry) = self.gauges.get(&due.name) else {
                continue;
            };
            if entry.generation != due.generation {
                // superseded by a later registration under the same name
                continue;
            }

            sample_one(&entry.registration, &*self.backend, &*self.reporter);

            let interval = entry.registration.interval;
            let now = Instant::now();
            let next = match due.at.checked_add(interval) {
                Some(next) if next > now => Some(next),
                // skip missed ticks instead of bursting to catch up
                _ => now.checked_add(interval),
            };
            let Some(next) = next else {
                tracing::warn!(name = %due.name, "periodic gauge interval is too large to schedule again");
                continue;
            };
            self.queue.push(Reverse(Due {
                at: next,
                generation: due.generation,
                name: due.name,
            }));
        }
        ControlFlow::Continue(())
    }
}

fn sample_one(
    registration: &GaugeRegistration,
    backend: &dyn BackendClient,
    reporter: &dyn ErrorReporter,
) {
    let sampled = panic::catch_unwind(AssertUnwindSafe(|| (registration.sample_fn)()));

    let value = match sampled {
        Ok(Ok(value)) => value,
        Ok(Err(source)) => {
            let error = MetricsError::SampleFunctionFailed {
                metric: registration.name.to_string(),
                source,
            };
            tracing::warn!(%error, "skipping periodic gauge sample");
            reporter.report(&error, "sampling periodic gauge");
            return;
        }
        Err(payload) => {
            let error = MetricsError::SampleFunctionPanicked {
                metric: registration.name.to_string(),
                message: panic_message(payload.as_ref()),
            };
            tracing::warn!(%error, "skipping periodic gauge sample");
            reporter.report(&error, "sampling periodic gauge");
            return;
        }
    };

    registration.last_value.store(value);

    let emitted = panic::catch_unwind(AssertUnwindSafe(|| {
        backend.emit_gauge_sample(&registration.name, value, &registration.tags);
    }));
    if emitted.is_err() {
        tracing::error!(name = %registration.name, "backend panicked while emitting gauge sample");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
