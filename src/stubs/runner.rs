use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::core::{
    domain::{Artifact, ExecutionLimits, ExecutionOutcome},
    traits::runner::{RunError, Runner},
};

/// Returns a fixed result after `delay` and records how many runs overlap.
#[derive(Debug)]
pub struct RunnerStub {
    result: Result<ExecutionOutcome, RunError>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RunnerStub {
    pub fn new(result: Result<ExecutionOutcome, RunError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the run is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Runner for RunnerStub {
    #[tracing::instrument(skip(self))]
    async fn run(
        &self,
        artifact: &Artifact,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}
