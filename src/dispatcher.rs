//! Batch dispatcher - run many programs with bounded parallelism
//!
//! Each program gets its own task: validate, wait for an admission slot, start,
//! wait for the report, map it. Results come back in submission order no matter
//! which program finishes first.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ConcurrencyScope;
use crate::execution::{CancelToken, ExecutionEnv, ExecutionRecord};
use crate::program::ProgramRequest;
use crate::result::ProgramResult;

/// Admission and timeout limits for a dispatcher
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub max_concurrent: usize,
    pub max_timeout_secs: f64,
    pub scope: ConcurrencyScope,
}

/// Number of admitted programs, now and at the high-water mark
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by a record until its process is reaped
///
/// Field order matters: the gauge is decremented before the permit frees a
/// slot, so `InFlight::peak` never exceeds the ceiling.
struct Admission {
    _in_flight: InFlightGuard,
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct Dispatcher {
    env: ExecutionEnv,
    settings: DispatchSettings,
    /// Shared by every batch when the scope is global
    slots: Arc<Semaphore>,
    next_trace_id: AtomicU64,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(env: ExecutionEnv, settings: DispatchSettings) -> Self {
        let max_concurrent = settings.max_concurrent.max(1);
        Self {
            env,
            settings: DispatchSettings {
                max_concurrent,
                ..settings
            },
            slots: Arc::new(Semaphore::new(max_concurrent)),
            next_trace_id: AtomicU64::new(0),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run every program and return one result per input, index-aligned
    ///
    /// Returns once every program is terminal. Cancelling `cancel` stops queued
    /// programs from starting and terminates running ones; their slots still
    /// get a result.
    pub async fn run_batch(
        &self,
        cancel: &CancelToken,
        requests: Vec<ProgramRequest>,
    ) -> Vec<ProgramResult> {
        let total = requests.len();
        let slots = match self.settings.scope {
            ConcurrencyScope::Global => Arc::clone(&self.slots),
            ConcurrencyScope::PerRequest => {
                Arc::new(Semaphore::new(self.settings.max_concurrent))
            }
        };

        let mut results = vec![ProgramResult::internal("program did not complete"); total];
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let trace_id = self.next_trace_id.fetch_add(1, Ordering::Relaxed) + 1;
            let span = info_span!(
                "program",
                trace_id,
                index,
                runtime = %request.runtime
            );
            let job = Job {
                index,
                request,
                env: self.env.clone(),
                max_timeout_secs: self.settings.max_timeout_secs,
                slots: Arc::clone(&slots),
                in_flight: Arc::clone(&self.in_flight),
                cancel: cancel.clone(),
            };
            tasks.spawn(job.run().instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = result,
                // The placeholder stays in that slot
                Err(e) => error!("Program task failed: {}", e),
            }
        }

        debug!(
            "Batch of {} finished (in flight {}, peak {})",
            total,
            self.in_flight.current(),
            self.in_flight.peak()
        );
        results
    }
}

/// One program's trip through the dispatcher
struct Job {
    index: usize,
    request: ProgramRequest,
    env: ExecutionEnv,
    max_timeout_secs: f64,
    slots: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    cancel: CancelToken,
}

impl Job {
    async fn run(self) -> (usize, ProgramResult) {
        let index = self.index;
        (index, self.execute().await)
    }

    async fn execute(self) -> ProgramResult {
        let program = match self
            .request
            .validate(self.env.runtimes(), self.max_timeout_secs)
        {
            Ok(program) => program,
            Err(problems) => {
                warn!("Rejected program: {}", problems);
                return ProgramResult::rejected(&problems);
            }
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("Batch canceled before program started");
                return ProgramResult::canceled_before_start();
            }
            permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return ProgramResult::internal("admission is closed"),
            },
        };
        let admission = Admission {
            _in_flight: self.in_flight.enter(),
            _permit: permit,
        };

        let record = match ExecutionRecord::start(&self.cancel, program, &self.env, admission) {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to start program: {}", e);
                return ProgramResult::start_failed(&e);
            }
        };
        info!(
            "Running program (pid {}, timeout {}s)",
            record.pid(),
            record.program().timeout_secs()
        );

        let status = record.wait().await;
        debug_assert!(status.is_terminal());
        let report = record.report().await;
        info!(
            "Program finished: status={}, elapsed_ms={}",
            status,
            report.elapsed.as_millis()
        );
        ProgramResult::from_report(&report)
    }
}
