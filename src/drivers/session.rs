//! Acquisition session: owns one output and one input task, enforces the
//! Unconfigured -> Configured -> Running lifecycle and runs the
//! iteration/average loop.
//!
//! One repeat cycle is a transaction on both tasks: arm the input (slaved to
//! the output's sample clock), start the output, wait for both, read exactly
//! one buffer of samples per channel, then stop both whatever happened.
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use log::{debug, info, warn};
use ndarray::Array2;
use crate::config::AcquisitionConfig;
use crate::drivers::{
    AcquisitionError, AnalogInputTask, AnalogOutputTask, AveragedTrace, ClockSource,
    CompiledPulse, DaqTask, DeviceError, RunningAverage, TaskTiming,
};
use crate::types::{AcquisitionEvent, RunSummary, SessionState, StopSignal};
#[derive(Clone, Debug)]
struct Setup {
    config: AcquisitionConfig,
    sample_count: usize,
    labels: Vec<String>,
}
pub struct AcquisitionSession<O, I> {
    output: O,
    input: I,
    state: Arc<Mutex<SessionState>>,
    setup: Option<Setup>,
}
fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
fn run_error(err: DeviceError) -> AcquisitionError {
    match err {
        DeviceError::Timeout(after) => {
            AcquisitionError::AcquisitionTimeout(format!("no complete capture within {after:?}"))
        }
        other => AcquisitionError::DeviceFault(other.to_string()),
    }
}
impl<O: AnalogOutputTask, I: AnalogInputTask> AcquisitionSession<O, I> {
    pub fn new(output: O, input: I) -> Self {
        Self {
            output,
            input,
            state: Arc::new(Mutex::new(SessionState::Unconfigured)),
            setup: None,
        }
    }
    pub fn state(&self) -> SessionState {
        *lock_state(&self.state)
    }
    /// Handle for observing the state while the session itself is borrowed by a run.
    pub(crate) fn shared_state(&self) -> Arc<Mutex<SessionState>> {
        Arc::clone(&self.state)
    }
    pub fn config(&self) -> Option<&AcquisitionConfig> {
        self.setup.as_ref().map(|s| &s.config)
    }
    pub fn sample_count(&self) -> Option<usize> {
        self.setup.as_ref().map(|s| s.sample_count)
    }
    /// Bind channels and timing on both tasks and load `pulse` into the output.
    ///
    /// An invalid config is rejected before any task is touched, leaving the
    /// previous configuration in place. A device failure closes both tasks and
    /// leaves the session Unconfigured.
    pub fn configure(
        &mut self,
        config: &AcquisitionConfig,
        pulse: &CompiledPulse,
    ) -> Result<(), AcquisitionError> {
        if self.state() == SessionState::Running {
            return Err(AcquisitionError::DeviceBusy(
                "cannot reconfigure while a run is in progress".into(),
            ));
        }
        config.validate()?;
        if pulse.sample_rate_hz() != config.sample_rate_hz {
            return Err(AcquisitionError::InvalidConfig(format!(
                "pulse compiled at {} Hz but acquisition runs at {} Hz",
                pulse.sample_rate_hz(),
                config.sample_rate_hz
            )));
        }
        if pulse.waveform.channel_count() != config.output_channels.len() {
            return Err(AcquisitionError::InvalidConfig(format!(
                "pulse drives {} channel(s) but {} output channel(s) are configured",
                pulse.waveform.channel_count(),
                config.output_channels.len()
            )));
        }
        if pulse.iteration_count != config.iteration_count {
            return Err(AcquisitionError::InvalidConfig(format!(
                "pulse compiled for {} iteration(s), config asks for {}",
                pulse.iteration_count, config.iteration_count
            )));
        }
        let sample_count = pulse.sample_count();
        if sample_count == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "pulse buffer holds no samples".into(),
            ));
        }
        let input_clock = config.input_clock()?;
        {
            let mut state = lock_state(&self.state);
            if *state == SessionState::Running {
                return Err(AcquisitionError::DeviceBusy(
                    "cannot reconfigure while a run is in progress".into(),
                ));
            }
            *state = SessionState::Unconfigured;
        }
        self.setup = None;
        self.close_tasks();
        let output_timing = TaskTiming {
            sample_rate_hz: config.sample_rate_hz,
            samples_per_channel: sample_count,
            clock: ClockSource::Onboard,
        };
        let input_timing = TaskTiming {
            clock: input_clock,
            ..output_timing.clone()
        };
        let bound = self
            .output
            .configure(&config.output_channels, &output_timing)
            .and_then(|_| self.input.configure(&config.input_physical(), &input_timing))
            .and_then(|_| self.output.write(&pulse.waveform));
        if let Err(err) = bound {
            warn!("device configuration failed: {err}");
            self.close_tasks();
            return Err(AcquisitionError::DeviceConfig(err.to_string()));
        }
        info!(
            "configured {} output / {} input channel(s), {} samples at {} Hz, {} x {} cycles",
            config.output_channels.len(),
            config.input_channels.len(),
            sample_count,
            config.sample_rate_hz,
            config.iteration_count,
            config.average_count
        );
        self.setup = Some(Setup {
            config: config.clone(),
            sample_count,
            labels: config.input_labels(),
        });
        *lock_state(&self.state) = SessionState::Configured;
        Ok(())
    }
    /// Run every iteration to completion, or until `stop` is requested.
    pub fn run(
        &mut self,
        events: &Sender<AcquisitionEvent>,
        stop: &StopSignal,
    ) -> Result<RunSummary, AcquisitionError> {
        Self::claim(&self.state)?;
        self.run_claimed(events, stop)
    }
    /// Configured -> Running, atomically.
    pub(crate) fn claim(state: &Mutex<SessionState>) -> Result<(), AcquisitionError> {
        let mut state = lock_state(state);
        match *state {
            SessionState::Configured => {
                *state = SessionState::Running;
                Ok(())
            }
            SessionState::Running => Err(AcquisitionError::DeviceBusy(
                "a run is already in progress".into(),
            )),
            SessionState::Unconfigured => Err(AcquisitionError::NotConfigured),
        }
    }
    /// Body of a run whose state was already claimed.
    pub(crate) fn run_claimed(
        &mut self,
        events: &Sender<AcquisitionEvent>,
        stop: &StopSignal,
    ) -> Result<RunSummary, AcquisitionError> {
        match self.acquire(events, stop) {
            Ok(summary) => {
                *lock_state(&self.state) = SessionState::Configured;
                Ok(summary)
            }
            Err(err) => {
                warn!("acquisition aborted: {err}");
                self.setup = None;
                self.close_tasks();
                *lock_state(&self.state) = SessionState::Unconfigured;
                Err(err)
            }
        }
    }
    fn acquire(
        &mut self,
        events: &Sender<AcquisitionEvent>,
        stop: &StopSignal,
    ) -> Result<RunSummary, AcquisitionError> {
        let Some(setup) = self.setup.clone() else {
            return Err(AcquisitionError::NotConfigured);
        };
        let config = &setup.config;
        let mut summary = RunSummary::default();
        let mut average = RunningAverage::new(setup.labels.len(), setup.sample_count);
        'iterations: for iteration in 0..config.iteration_count {
            average.reset();
            let mut latest = None;
            for repeat in 0..config.average_count {
                if stop.is_requested() {
                    info!("stop requested before cycle {repeat} of iteration {iteration}");
                    summary.cancelled = true;
                    break 'iterations;
                }
                let capture = self.cycle(setup.sample_count, config.cycle_timeout)?;
                average.push(&capture)?;
                summary.cycles_completed += 1;
                let trace = AveragedTrace {
                    iteration,
                    averages: average.count(),
                    sample_rate_hz: config.sample_rate_hz,
                    channel_labels: setup.labels.clone(),
                    samples: average.mean().clone(),
                };
                debug!("iteration {iteration}: {} average(s)", trace.averages);
                events.send(AcquisitionEvent::TraceUpdated(trace.clone())).ok();
                latest = Some(trace);
            }
            if let Some(trace) = latest {
                events.send(AcquisitionEvent::IterationComplete(trace)).ok();
                summary.iterations_completed += 1;
                info!("iteration {} of {} complete", iteration + 1, config.iteration_count);
            }
        }
        Ok(summary)
    }
    /// One start/wait/read/stop transaction. Both tasks are stopped even when
    /// a step fails.
    fn cycle(&mut self, samples: usize, timeout: Duration) -> Result<Array2<f64>, AcquisitionError> {
        let capture = self.start_and_read(samples, timeout);
        let stopped_input = self.input.stop();
        let stopped_output = self.output.stop();
        let capture = capture.map_err(run_error)?;
        stopped_input.and(stopped_output).map_err(run_error)?;
        let expected = (self.setup_channels(), samples);
        // fewer rows or columns than armed means the read ended early
        if capture.nrows() < expected.0 || capture.ncols() < samples {
            return Err(AcquisitionError::AcquisitionTimeout(format!(
                "read {}x{} of {}x{samples} samples",
                capture.nrows(),
                capture.ncols(),
                expected.0
            )));
        }
        if capture.dim() != expected {
            return Err(AcquisitionError::ShapeMismatch {
                expected,
                actual: capture.dim(),
            });
        }
        Ok(capture)
    }
    fn start_and_read(&mut self, samples: usize, timeout: Duration) -> Result<Array2<f64>, DeviceError> {
        // Input first: a slaved task only sees clock edges once armed.
        self.input.start()?;
        self.output.start()?;
        self.input.wait_until_done(timeout)?;
        self.output.wait_until_done(timeout)?;
        self.input.read(samples, timeout)
    }
    fn setup_channels(&self) -> usize {
        self.setup.as_ref().map_or(0, |s| s.labels.len())
    }
    fn close_tasks(&mut self) {
        for result in [self.input.stop(), self.output.stop(), self.input.close(), self.output.close()] {
            if let Err(err) = result {
                debug!("ignoring teardown error: {err}");
            }
        }
    }
    /// Release both tasks. Not allowed during a run.
    pub fn close(&mut self) -> Result<(), AcquisitionError> {
        {
            let mut state = lock_state(&self.state);
            if *state == SessionState::Running {
                return Err(AcquisitionError::DeviceBusy(
                    "cannot close while a run is in progress".into(),
                ));
            }
            *state = SessionState::Unconfigured;
        }
        self.setup = None;
        self.close_tasks();
        Ok(())
    }
}
