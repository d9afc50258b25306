// src/types.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use serde::Serialize;
use crate::drivers::{AveragedTrace, SpectrumResult};

// Session lifecycle: Unconfigured -> Configured -> Running -> Configured.
// Reconfiguration is only legal outside Running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Running,
}

// Messages the acquisition worker sends to whoever displays or stores data
#[derive(Clone, Debug)]
pub enum AcquisitionEvent {
    // running average after every repeat cycle (strictly ordered within an iteration)
    TraceUpdated(AveragedTrace),
    // final trace of an iteration, after `average_count` cycles
    IterationComplete(AveragedTrace),
    // one channel of one trace; channels of the same trace arrive in any order
    SpectrumReady {
        iteration: usize,
        averages: usize,
        spectrum: SpectrumResult,
    },
    RunFinished(RunSummary),
    RunFailed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations_completed: usize,
    pub cycles_completed: usize,
    pub cancelled: bool,
}

/// Cooperative stop request, checked between repeat cycles.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
