// src/engine.rs
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use log::{debug, info, warn};
use crate::config::AcquisitionConfig;
use crate::drivers::fft;
use crate::drivers::{
    AcquisitionError, AcquisitionSession, AnalogInputTask, AnalogOutputTask, AveragedTrace,
    CompiledPulse,
};
use crate::types::{AcquisitionEvent, RunSummary, SessionState, StopSignal};

/// Runs an [`AcquisitionSession`] on a background worker so the caller stays
/// responsive: results come back as [`AcquisitionEvent`]s, state can be
/// polled and a run can be cancelled between cycles.
pub struct AcquisitionController<O, I> {
    session: Arc<Mutex<AcquisitionSession<O, I>>>,
    state: Arc<Mutex<SessionState>>,
    stop: StopSignal,
    worker: Option<JoinHandle<Result<RunSummary, AcquisitionError>>>,
}

impl<O, I> AcquisitionController<O, I>
where
    O: AnalogOutputTask + 'static,
    I: AnalogInputTask + 'static,
{
    pub fn new(output: O, input: I) -> Self {
        let session = AcquisitionSession::new(output, input);
        let state = session.shared_state();
        Self {
            session: Arc::new(Mutex::new(session)),
            state,
            stop: StopSignal::new(),
            worker: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    // Fails fast while a run holds the session, instead of queueing behind it.
    pub fn configure(
        &mut self,
        config: &AcquisitionConfig,
        pulse: &CompiledPulse,
    ) -> Result<(), AcquisitionError> {
        if self.is_running() {
            return Err(AcquisitionError::DeviceBusy(
                "cannot reconfigure while a run is in progress".into(),
            ));
        }
        self.lock_session().configure(config, pulse)
    }

    /// Start a run on the worker thread. Every event of the run, ending with
    /// `RunFinished` or `RunFailed`, goes to `events`.
    pub fn start(&mut self, events: Sender<AcquisitionEvent>) -> Result<(), AcquisitionError> {
        AcquisitionSession::<O, I>::claim(&self.state)?;
        // A previous worker has already left Running, so this join is short.
        if let Some(previous) = self.worker.take() {
            previous.join().ok();
        }
        self.stop.reset();
        let session = Arc::clone(&self.session);
        let stop = self.stop.clone();
        let spawned = thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                let result = session.run_claimed(&events, &stop);
                match &result {
                    Ok(summary) => {
                        info!(
                            "run finished: {} iteration(s), {} cycle(s){}",
                            summary.iterations_completed,
                            summary.cycles_completed,
                            if summary.cancelled { ", cancelled" } else { "" }
                        );
                        events.send(AcquisitionEvent::RunFinished(*summary)).ok();
                    }
                    Err(err) => {
                        events.send(AcquisitionEvent::RunFailed(err.to_string())).ok();
                    }
                }
                result
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Configured;
                Err(AcquisitionError::DeviceFault(format!(
                    "cannot spawn acquisition worker: {err}"
                )))
            }
        }
    }

    /// Ask the running worker to stop before its next cycle.
    pub fn stop(&self) {
        if self.is_running() {
            info!("stop requested");
        }
        self.stop.request();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Block until the current run ends. Returns an empty summary when no run
    /// was started.
    pub fn wait(&mut self) -> Result<RunSummary, AcquisitionError> {
        let Some(handle) = self.worker.take() else {
            return Ok(RunSummary::default());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Unconfigured;
                Err(AcquisitionError::DeviceFault("acquisition worker panicked".into()))
            }
        }
    }

    /// Cancel any run, wait for it and release both tasks.
    pub fn close(&mut self) -> Result<(), AcquisitionError> {
        self.stop();
        if let Err(err) = self.wait() {
            warn!("run ended with an error while closing: {err}");
        }
        self.lock_session().close()
    }

    fn lock_session(&self) -> MutexGuard<'_, AcquisitionSession<O, I>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O, I> Drop for AcquisitionController<O, I> {
    fn drop(&mut self) {
        self.stop.request();
        if let Some(handle) = self.worker.take() {
            handle.join().ok();
        }
    }
}

/// Transform the requested channels of `trace` on one worker each, with a
/// frequency axis from 0 to `max_frequency_hz` (normally Nyquist). Results
/// arrive as `SpectrumReady` events in completion order; unknown labels are
/// skipped with a warning.
pub fn spawn_spectra(
    trace: &AveragedTrace,
    channels: &[String],
    max_frequency_hz: f64,
    events: &Sender<AcquisitionEvent>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(channels.len());
    for label in channels {
        let Some(series) = trace.channel(label).map(|row| row.to_owned()) else {
            warn!("no channel '{label}' in trace, skipping its spectrum");
            continue;
        };
        let label = label.clone();
        let events = events.clone();
        let (iteration, averages) = (trace.iteration, trace.averages);
        let spawned = thread::Builder::new()
            .name(format!("spectrum-{label}"))
            .spawn(move || match fft::transform(series.view(), max_frequency_hz, label.as_str()) {
                Ok(spectrum) => {
                    events
                        .send(AcquisitionEvent::SpectrumReady {
                            iteration,
                            averages,
                            spectrum,
                        })
                        .ok();
                }
                Err(err) => warn!("spectrum of '{label}' failed: {err}"),
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => warn!("cannot spawn spectrum worker: {err}"),
        }
    }
    handles
}

/// Spectra of a run as it progresses: one batch per averaged trace, plus one
/// for every finished iteration. An update arriving while the previous batch
/// is still being transformed is skipped.
pub struct LiveSpectra {
    channels: Vec<String>,
    workers: Vec<JoinHandle<()>>,
    last: Option<(usize, usize)>,
}

impl LiveSpectra {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            workers: Vec::new(),
            last: None,
        }
    }

    /// Transform a running-average update unless a batch is still in flight.
    /// Returns whether a batch was started.
    pub fn update(&mut self, trace: &AveragedTrace, events: &Sender<AcquisitionEvent>) -> bool {
        self.workers.retain(|worker| !worker.is_finished());
        if !self.workers.is_empty() {
            debug!(
                "spectra busy, skipping iteration {} average {}",
                trace.iteration, trace.averages
            );
            return false;
        }
        self.spawn(trace, events)
    }

    /// Transform a finished iteration's trace unless that exact average was
    /// already sent off by [`update`](Self::update).
    pub fn complete(&mut self, trace: &AveragedTrace, events: &Sender<AcquisitionEvent>) -> bool {
        if self.last == Some((trace.iteration, trace.averages)) {
            return false;
        }
        self.spawn(trace, events)
    }

    /// Block until every batch started so far has reported.
    pub fn wait(&mut self) {
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }

    fn spawn(&mut self, trace: &AveragedTrace, events: &Sender<AcquisitionEvent>) -> bool {
        let started = spawn_spectra(trace, &self.channels, trace.nyquist_hz(), events);
        if started.is_empty() {
            return false;
        }
        self.last = Some((trace.iteration, trace.averages));
        self.workers.extend(started);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputChannel;
    use crate::drivers::{PulseCompiler, SimulatedCard, SimulatedInput, SimulatedOutput};
    use ndarray::Array2;
    use std::f64::consts::PI;
    use std::sync::mpsc::{channel, Receiver};
    use std::time::Duration;

    const RATE: u64 = 100_000;
    const PULSE: &str = "channel rf\nrf 0 200us 1\nend 2ms\n";

    fn setup(
        card: &SimulatedCard,
        iterations: usize,
        averages: usize,
    ) -> AcquisitionController<SimulatedOutput, SimulatedInput> {
        let config = AcquisitionConfig::new(
            RATE,
            iterations,
            averages,
            vec!["Dev1/ao0".into()],
            vec![InputChannel {
                label: "nsor".into(),
                physical: "Dev1/ai1".into(),
            }],
        );
        let pulse = PulseCompiler::new(RATE).unwrap().compile(PULSE, iterations).unwrap();
        let mut controller = AcquisitionController::new(card.output_task(), card.input_task());
        controller.configure(&config, &pulse).unwrap();
        controller
    }

    fn finished(rx: &Receiver<AcquisitionEvent>) -> Option<RunSummary> {
        rx.try_iter().find_map(|e| match e {
            AcquisitionEvent::RunFinished(summary) => Some(summary),
            _ => None,
        })
    }

    #[test]
    fn reconfigure_and_restart_are_refused_while_running() {
        let card = SimulatedCard::new("Dev1");
        let gate = card.pause_at_cycle(0);
        let mut controller = setup(&card, 1, 2);
        let (tx, rx) = channel();
        controller.start(tx.clone()).unwrap();
        gate.reached.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(controller.state(), SessionState::Running);
        let config = AcquisitionConfig::new(
            RATE,
            1,
            2,
            vec!["Dev1/ao0".into()],
            vec![InputChannel {
                label: "nmr".into(),
                physical: "Dev1/ai0".into(),
            }],
        );
        let pulse = PulseCompiler::new(RATE).unwrap().compile(PULSE, 1).unwrap();
        assert!(matches!(
            controller.configure(&config, &pulse),
            Err(AcquisitionError::DeviceBusy(_))
        ));
        assert!(matches!(controller.start(tx), Err(AcquisitionError::DeviceBusy(_))));
        gate.release.send(()).unwrap();
        let summary = controller.wait().unwrap();
        assert_eq!(summary.cycles_completed, 2);
        assert_eq!(controller.state(), SessionState::Configured);
        assert_eq!(finished(&rx), Some(summary));
    }

    #[test]
    fn stop_cancels_between_cycles() {
        let card = SimulatedCard::new("Dev1");
        let gate = card.pause_at_cycle(1);
        let mut controller = setup(&card, 2, 10);
        let (tx, rx) = channel();
        controller.start(tx).unwrap();
        gate.reached.recv_timeout(Duration::from_secs(5)).unwrap();
        controller.stop();
        gate.release.send(()).unwrap();
        let summary = controller.wait().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.cycles_completed, 2);
        assert_eq!(summary.iterations_completed, 0);
        assert!(card.is_idle());
        assert_eq!(controller.state(), SessionState::Configured);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, AcquisitionEvent::IterationComplete(_))));
        assert!(matches!(events.last(), Some(AcquisitionEvent::RunFinished(_))));
    }

    #[test]
    fn failed_run_reports_and_unconfigures() {
        let card = SimulatedCard::new("Dev1");
        card.inject_hang(0);
        let mut controller = setup(&card, 1, 1);
        let (tx, rx) = channel();
        controller.start(tx.clone()).unwrap();
        assert!(matches!(
            controller.wait(),
            Err(AcquisitionError::AcquisitionTimeout(_))
        ));
        assert!(matches!(
            rx.try_iter().last(),
            Some(AcquisitionEvent::RunFailed(_))
        ));
        assert_eq!(controller.state(), SessionState::Unconfigured);
        assert!(matches!(controller.start(tx), Err(AcquisitionError::NotConfigured)));
    }

    #[test]
    fn restart_after_finish_runs_again() {
        let card = SimulatedCard::new("Dev1");
        let mut controller = setup(&card, 1, 1);
        let (tx, rx) = channel();
        controller.start(tx.clone()).unwrap();
        controller.wait().unwrap();
        controller.start(tx).unwrap();
        controller.wait().unwrap();
        assert_eq!(card.cycles(), 2);
        let runs = rx
            .try_iter()
            .filter(|e| matches!(e, AcquisitionEvent::RunFinished(_)))
            .count();
        assert_eq!(runs, 2);
        controller.close().unwrap();
        assert!(card.is_closed());
    }

    #[test]
    fn spectra_are_computed_per_channel() {
        let n = 1000;
        let rate = 1000.0;
        let samples = Array2::from_shape_fn((3, n), |(ch, i)| {
            (2.0 * PI * 50.0 * (ch + 1) as f64 * i as f64 / rate).sin()
        });
        let trace = AveragedTrace {
            iteration: 0,
            averages: 4,
            sample_rate_hz: 1000,
            channel_labels: vec!["nmr".into(), "nsor".into(), "laser".into()],
            samples,
        };
        let (tx, rx) = channel();
        let handles = spawn_spectra(
            &trace,
            &["nmr".to_string(), "nsor".to_string(), "missing".to_string()],
            trace.nyquist_hz(),
            &tx,
        );
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.join().unwrap();
        }
        let mut peaks: Vec<(String, f64)> = rx
            .try_iter()
            .filter_map(|e| match e {
                AcquisitionEvent::SpectrumReady { spectrum, averages, .. } => {
                    assert_eq!(averages, 4);
                    Some((spectrum.channel.clone(), spectrum.peak_frequency_hz().unwrap()))
                }
                _ => None,
            })
            .collect();
        peaks.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].0, "nmr");
        assert!((peaks[0].1 - 50.0).abs() <= 1.0);
        assert_eq!(peaks[1].0, "nsor");
        assert!((peaks[1].1 - 100.0).abs() <= 1.0);
    }

    #[test]
    fn live_spectra_follow_updates_and_cover_every_iteration() {
        let trace = |iteration: usize, averages: usize| AveragedTrace {
            iteration,
            averages,
            sample_rate_hz: 1000,
            channel_labels: vec!["nmr".into(), "nsor".into()],
            samples: Array2::from_elem((2, 64), averages as f64),
        };
        let (tx, rx) = channel();
        let mut live = LiveSpectra::new(vec!["nmr".into(), "nsor".into()]);
        assert!(live.update(&trace(0, 1), &tx));
        live.wait();
        assert!(live.update(&trace(0, 2), &tx));
        live.wait();
        // the last update of iteration 0 already covers its final average
        assert!(!live.complete(&trace(0, 2), &tx));
        assert!(live.complete(&trace(1, 2), &tx));
        live.wait();
        let mut batches: Vec<(usize, usize)> = rx
            .try_iter()
            .filter_map(|e| match e {
                AcquisitionEvent::SpectrumReady {
                    iteration, averages, ..
                } => Some((iteration, averages)),
                _ => None,
            })
            .collect();
        batches.sort();
        assert_eq!(batches, vec![(0, 1), (0, 1), (0, 2), (0, 2), (1, 2), (1, 2)]);
    }

    #[test]
    fn live_spectra_without_known_channels_start_nothing() {
        let (tx, rx) = channel();
        let mut live = LiveSpectra::new(vec!["laser".into()]);
        let trace = AveragedTrace {
            iteration: 0,
            averages: 1,
            sample_rate_hz: 1000,
            channel_labels: vec!["nmr".into()],
            samples: Array2::zeros((1, 16)),
        };
        assert!(!live.update(&trace, &tx));
        assert!(!live.complete(&trace, &tx));
        live.wait();
        assert!(rx.try_iter().next().is_none());
    }
}
