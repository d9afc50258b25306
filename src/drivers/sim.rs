//! In-process stand-in for a multifunction DAQ card: one analog-output task
//! that masters `/<card>/ao/SampleClock` and one analog-input task that can
//! be slaved to it. Used by the command-line runner and by tests.
use std::f64::consts::PI;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use log::{debug, trace};
use ndarray::{s, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use crate::drivers::{
    AnalogInputTask, AnalogOutputTask, ClockSource, DaqTask, DeviceError, TaskTiming,
    WaveformBuffer,
};
/// Signal the simulated sample sees on every input channel: a free induction
/// decay starting at the falling edge of the first output channel, plus
/// pulse feed-through and uniform noise.
#[derive(Clone, Debug)]
pub struct SignalModel {
    pub amplitude: f64,
    /// Frequency of input channel 0; channel `i` rings at `(i + 1)` times this.
    pub frequency_hz: f64,
    pub decay_seconds: f64,
    pub feedthrough: f64,
    pub noise: f64,
}
impl Default for SignalModel {
    fn default() -> Self {
        Self {
            amplitude: 0.5,
            frequency_hz: 5_000.0,
            decay_seconds: 2e-3,
            feedthrough: 0.01,
            noise: 0.05,
        }
    }
}
/// Handle for holding a cycle in flight: the card signals `reached` once the
/// input task of that cycle starts waiting, then blocks until `release` fires
/// (or is dropped).
pub struct CycleGate {
    pub reached: Receiver<()>,
    pub release: Sender<()>,
}
struct Gate {
    cycle: usize,
    reached: Sender<()>,
    release: Receiver<()>,
}
#[derive(Default)]
struct TaskSlot {
    channels: Vec<String>,
    timing: Option<TaskTiming>,
}
struct CardState {
    name: String,
    ao_count: usize,
    ai_count: usize,
    max_rate_hz: u64,
    model: SignalModel,
    rng: StdRng,
    realtime: bool,
    output: TaskSlot,
    input: TaskSlot,
    buffer: Option<Array2<f64>>,
    output_running: bool,
    input_armed: bool,
    captured: Option<Array2<f64>>,
    cycles: usize,
    current_cycle: Option<usize>,
    short_reads: Vec<usize>,
    hangs: Vec<usize>,
    gate: Option<Gate>,
    operations: Vec<String>,
}
impl CardState {
    fn record(&mut self, op: &str) {
        trace!("{}: {op}", self.name);
        self.operations.push(op.to_string());
    }
    fn ao_clock(&self) -> ClockSource {
        ClockSource::Terminal(format!("/{}/ao/SampleClock", self.name))
    }
    fn validate_channels(&self, channels: &[String], kind: &str, count: usize) -> Result<(), DeviceError> {
        if channels.is_empty() {
            return Err(DeviceError::InvalidChannel(format!("no {kind} channel given")));
        }
        let prefix = format!("{}/{kind}", self.name);
        for (idx, channel) in channels.iter().enumerate() {
            let number = channel
                .trim_start_matches('/')
                .strip_prefix(&prefix)
                .and_then(|n| n.parse::<usize>().ok());
            match number {
                Some(n) if n < count => {}
                _ => return Err(DeviceError::InvalidChannel(channel.clone())),
            }
            if channels[..idx].contains(channel) {
                return Err(DeviceError::InvalidChannel(format!("{channel} listed twice")));
            }
        }
        Ok(())
    }
    fn validate_rate(&self, timing: &TaskTiming) -> Result<(), DeviceError> {
        if timing.sample_rate_hz == 0 || timing.sample_rate_hz > self.max_rate_hz {
            return Err(DeviceError::InvalidTiming(format!(
                "rate {} Hz outside 1..={} Hz",
                timing.sample_rate_hz, self.max_rate_hz
            )));
        }
        if timing.samples_per_channel == 0 {
            return Err(DeviceError::InvalidTiming(
                "finite task needs at least one sample".into(),
            ));
        }
        Ok(())
    }
    fn slaved_input(&self) -> bool {
        matches!(&self.input.timing, Some(t) if t.clock == self.ao_clock())
    }
    /// Produce one finite capture for the configured input channels.
    fn synthesize(&mut self) -> Option<Array2<f64>> {
        let timing = self.input.timing.clone()?;
        let cycle = self.current_cycle.unwrap_or(self.cycles);
        if self.hangs.contains(&cycle) {
            debug!("{}: cycle {cycle} produces no samples (injected hang)", self.name);
            return None;
        }
        let n = timing.samples_per_channel;
        let rate = timing.sample_rate_hz as f64;
        let drive: Vec<f64> = match &self.buffer {
            Some(buffer) => (0..n)
                .map(|i| buffer.get((0, i)).copied().unwrap_or(0.0))
                .collect(),
            None => vec![0.0; n],
        };
        let pulse_off = (1..n)
            .rev()
            .find(|&i| drive[i - 1] != 0.0 && drive[i] == 0.0);
        let model = self.model.clone();
        let rng = &mut self.rng;
        let mut capture = Array2::from_shape_fn((self.input.channels.len(), n), |(ch, i)| {
            let ringing = match pulse_off {
                Some(off) if i >= off => {
                    let dt = (i - off) as f64 / rate;
                    let frequency = model.frequency_hz * (ch + 1) as f64;
                    model.amplitude * (-dt / model.decay_seconds).exp() * (2.0 * PI * frequency * dt).sin()
                }
                _ => 0.0,
            };
            let noise = if model.noise > 0.0 {
                rng.gen_range(-model.noise..model.noise)
            } else {
                0.0
            };
            ringing + model.feedthrough * drive[i] + noise
        });
        if self.short_reads.contains(&cycle) {
            debug!("{}: cycle {cycle} drops half of its samples (injected)", self.name);
            capture = capture.slice(s![.., ..n / 2]).to_owned();
        }
        Some(capture)
    }
}
/// A virtual card named like a real device (`Dev1`), handing out one output
/// and one input task that share its state.
#[derive(Clone)]
pub struct SimulatedCard {
    state: Arc<Mutex<CardState>>,
}
impl SimulatedCard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                name: name.into(),
                ao_count: 4,
                ai_count: 8,
                max_rate_hz: 2_000_000,
                model: SignalModel::default(),
                rng: StdRng::seed_from_u64(0),
                realtime: false,
                output: TaskSlot::default(),
                input: TaskSlot::default(),
                buffer: None,
                output_running: false,
                input_armed: false,
                captured: None,
                cycles: 0,
                current_cycle: None,
                short_reads: Vec::new(),
                hangs: Vec::new(),
                gate: None,
                operations: Vec::new(),
            })),
        }
    }
    pub fn with_signal(self, model: SignalModel) -> Self {
        self.lock().model = model;
        self
    }
    pub fn with_seed(self, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        self
    }
    /// Make the output task take as long as its buffer really lasts.
    pub fn realtime(self, realtime: bool) -> Self {
        self.lock().realtime = realtime;
        self
    }
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }
    pub fn output_task(&self) -> SimulatedOutput {
        SimulatedOutput {
            state: Arc::clone(&self.state),
        }
    }
    pub fn input_task(&self) -> SimulatedInput {
        SimulatedInput {
            state: Arc::clone(&self.state),
        }
    }
    /// Cycle `cycle` (0-based count of output starts) returns half its samples.
    pub fn inject_short_read(&self, cycle: usize) {
        self.lock().short_reads.push(cycle);
    }
    /// Cycle `cycle` never completes its acquisition.
    pub fn inject_hang(&self, cycle: usize) {
        self.lock().hangs.push(cycle);
    }
    pub fn pause_at_cycle(&self, cycle: usize) -> CycleGate {
        let (reached_tx, reached_rx) = channel();
        let (release_tx, release_rx) = channel();
        self.lock().gate = Some(Gate {
            cycle,
            reached: reached_tx,
            release: release_rx,
        });
        CycleGate {
            reached: reached_rx,
            release: release_tx,
        }
    }
    /// Number of output starts so far.
    pub fn cycles(&self) -> usize {
        self.lock().cycles
    }
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }
    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }
    /// Neither task is running and no capture is pending.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.output_running && !state.input_armed && state.captured.is_none()
    }
    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.output.timing.is_none() && state.input.timing.is_none()
    }
    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
pub struct SimulatedOutput {
    state: Arc<Mutex<CardState>>,
}
impl SimulatedOutput {
    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl DaqTask for SimulatedOutput {
    fn configure(&mut self, channels: &[String], timing: &TaskTiming) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ao.configure");
        let ao_count = state.ao_count;
        state.validate_channels(channels, "ao", ao_count)?;
        state.validate_rate(timing)?;
        if timing.clock != ClockSource::Onboard {
            return Err(DeviceError::ClockConflict(format!(
                "analog output masters the card clock, cannot use {:?}",
                timing.clock
            )));
        }
        state.output = TaskSlot {
            channels: channels.to_vec(),
            timing: Some(timing.clone()),
        };
        state.buffer = None;
        Ok(())
    }
    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ao.start");
        if state.output.timing.is_none() {
            return Err(DeviceError::NotConfigured);
        }
        if state.buffer.is_none() {
            return Err(DeviceError::Driver("no output buffer written".into()));
        }
        let cycle = state.cycles;
        state.current_cycle = Some(cycle);
        state.cycles += 1;
        state.output_running = true;
        // Sample clock edges only reach a slaved input that is already armed.
        if state.input_armed && state.slaved_input() && state.captured.is_none() {
            state.captured = state.synthesize();
        }
        Ok(())
    }
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let (running, realtime, duration) = {
            let mut state = self.lock();
            state.record("ao.wait");
            let duration = state.output.timing.as_ref().map(|t| {
                Duration::from_secs_f64(t.samples_per_channel as f64 / t.sample_rate_hz as f64)
            });
            (state.output_running, state.realtime, duration)
        };
        if !running {
            return Err(DeviceError::Driver("output task is not running".into()));
        }
        if let (true, Some(duration)) = (realtime, duration) {
            if duration > timeout {
                thread::sleep(timeout);
                return Err(DeviceError::Timeout(timeout));
            }
            thread::sleep(duration);
        }
        Ok(())
    }
    fn stop(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ao.stop");
        state.output_running = false;
        Ok(())
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ao.close");
        state.output = TaskSlot::default();
        state.output_running = false;
        state.buffer = None;
        Ok(())
    }
}
impl AnalogOutputTask for SimulatedOutput {
    fn write(&mut self, buffer: &WaveformBuffer) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ao.write");
        let Some(timing) = state.output.timing.clone() else {
            return Err(DeviceError::NotConfigured);
        };
        if buffer.channel_count() != state.output.channels.len()
            || buffer.sample_count() != timing.samples_per_channel
        {
            return Err(DeviceError::Driver(format!(
                "buffer is {}x{}, task expects {}x{}",
                buffer.channel_count(),
                buffer.sample_count(),
                state.output.channels.len(),
                timing.samples_per_channel
            )));
        }
        state.buffer = Some(buffer.samples().clone());
        Ok(())
    }
}
pub struct SimulatedInput {
    state: Arc<Mutex<CardState>>,
}
impl SimulatedInput {
    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl DaqTask for SimulatedInput {
    fn configure(&mut self, channels: &[String], timing: &TaskTiming) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ai.configure");
        let ai_count = state.ai_count;
        state.validate_channels(channels, "ai", ai_count)?;
        state.validate_rate(timing)?;
        match &timing.clock {
            ClockSource::Onboard => {}
            terminal if *terminal == state.ao_clock() => {
                if let Some(master) = &state.output.timing {
                    if master.sample_rate_hz != timing.sample_rate_hz {
                        return Err(DeviceError::ClockConflict(format!(
                            "input rate {} Hz differs from the master clock's {} Hz",
                            timing.sample_rate_hz, master.sample_rate_hz
                        )));
                    }
                }
            }
            ClockSource::Terminal(other) => {
                return Err(DeviceError::ClockConflict(format!(
                    "terminal '{other}' is not routable on {}",
                    state.name
                )));
            }
        }
        state.input = TaskSlot {
            channels: channels.to_vec(),
            timing: Some(timing.clone()),
        };
        state.captured = None;
        Ok(())
    }
    fn start(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ai.start");
        if state.input.timing.is_none() {
            return Err(DeviceError::NotConfigured);
        }
        state.input_armed = true;
        state.captured = None;
        if !state.slaved_input() {
            state.current_cycle = Some(state.cycles);
            state.captured = state.synthesize();
        }
        Ok(())
    }
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let gate = {
            let mut state = self.lock();
            state.record("ai.wait");
            let due = matches!(
                (&state.gate, state.current_cycle),
                (Some(gate), Some(cycle)) if gate.cycle == cycle
            );
            if due {
                state.gate.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.reached.send(()).ok();
            gate.release.recv().ok();
        }
        let state = self.lock();
        if !state.input_armed {
            return Err(DeviceError::Driver("input task is not running".into()));
        }
        if state.captured.is_none() {
            return Err(DeviceError::Timeout(timeout));
        }
        Ok(())
    }
    fn stop(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ai.stop");
        state.input_armed = false;
        state.captured = None;
        Ok(())
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.record("ai.close");
        state.input = TaskSlot::default();
        state.input_armed = false;
        state.captured = None;
        Ok(())
    }
}
impl AnalogInputTask for SimulatedInput {
    fn read(
        &mut self,
        samples_per_channel: usize,
        timeout: Duration,
    ) -> Result<Array2<f64>, DeviceError> {
        let mut state = self.lock();
        state.record("ai.read");
        let Some(captured) = state.captured.take() else {
            return Err(DeviceError::Timeout(timeout));
        };
        let available = captured.ncols().min(samples_per_channel);
        Ok(captured.slice(s![.., ..available]).to_owned())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    fn timing(samples: usize, clock: ClockSource) -> TaskTiming {
        TaskTiming {
            sample_rate_hz: 100_000,
            samples_per_channel: samples,
            clock,
        }
    }
    fn configured(card: &SimulatedCard, samples: usize) -> (SimulatedOutput, SimulatedInput) {
        let mut ao = card.output_task();
        let mut ai = card.input_task();
        ao.configure(&["Dev1/ao0".to_string()], &timing(samples, ClockSource::Onboard))
            .unwrap();
        ai.configure(
            &["Dev1/ai0".to_string(), "Dev1/ai1".to_string()],
            &timing(samples, ClockSource::ao_sample_clock_of("Dev1/ao0").unwrap()),
        )
        .unwrap();
        let buffer = WaveformBuffer::new(vec!["pulse".into()], 100_000, Array2::ones((1, samples)))
            .unwrap();
        ao.write(&buffer).unwrap();
        (ao, ai)
    }
    #[test]
    fn slaved_input_captures_when_armed_first() {
        let card = SimulatedCard::new("Dev1");
        let (mut ao, mut ai) = configured(&card, 64);
        ai.start().unwrap();
        ao.start().unwrap();
        ai.wait_until_done(Duration::from_millis(10)).unwrap();
        ao.wait_until_done(Duration::from_millis(10)).unwrap();
        let data = ai.read(64, Duration::from_millis(10)).unwrap();
        assert_eq!(data.dim(), (2, 64));
        ai.stop().unwrap();
        ao.stop().unwrap();
        assert!(card.is_idle());
        assert_eq!(card.cycles(), 1);
    }
    #[test]
    fn slaved_input_started_late_misses_the_clock() {
        let card = SimulatedCard::new("Dev1");
        let (mut ao, mut ai) = configured(&card, 64);
        ao.start().unwrap();
        ai.start().unwrap();
        let err = ai.wait_until_done(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }
    #[test]
    fn rejects_unknown_channels_and_foreign_clocks() {
        let card = SimulatedCard::new("Dev1");
        let mut ao = card.output_task();
        let mut ai = card.input_task();
        assert!(matches!(
            ao.configure(&["Dev2/ao0".into()], &timing(8, ClockSource::Onboard)),
            Err(DeviceError::InvalidChannel(_))
        ));
        assert!(matches!(
            ao.configure(&["Dev1/ao9".to_string()], &timing(8, ClockSource::Onboard)),
            Err(DeviceError::InvalidChannel(_))
        ));
        assert!(matches!(
            ai.configure(
                &["Dev1/ai0".to_string()],
                &timing(8, ClockSource::Terminal("/Dev7/ao/SampleClock".into()))
            ),
            Err(DeviceError::ClockConflict(_))
        ));
        assert!(matches!(
            ao.configure(&["Dev1/ao0".to_string()], &timing(0, ClockSource::Onboard)),
            Err(DeviceError::InvalidTiming(_))
        ));
    }
    #[test]
    fn injected_short_read_truncates_the_capture() {
        let card = SimulatedCard::new("Dev1");
        card.inject_short_read(0);
        let (mut ao, mut ai) = configured(&card, 64);
        ai.start().unwrap();
        ao.start().unwrap();
        ai.wait_until_done(Duration::from_millis(10)).unwrap();
        assert_eq!(ai.read(64, Duration::from_millis(10)).unwrap().ncols(), 32);
    }
    #[test]
    fn capture_rings_after_the_pulse_ends() {
        let card = SimulatedCard::new("Dev1").with_signal(SignalModel {
            noise: 0.0,
            feedthrough: 0.0,
            ..SignalModel::default()
        });
        let mut ao = card.output_task();
        let mut ai = card.input_task();
        let samples = 200;
        ao.configure(&["Dev1/ao0".to_string()], &timing(samples, ClockSource::Onboard))
            .unwrap();
        ai.configure(&["Dev1/ai0".to_string()], &timing(samples, card_clock()))
            .unwrap();
        let mut drive = Array2::zeros((1, samples));
        drive.slice_mut(s![.., ..10]).fill(1.0);
        ao.write(&WaveformBuffer::new(vec!["p".into()], 100_000, drive).unwrap())
            .unwrap();
        ai.start().unwrap();
        ao.start().unwrap();
        let data = ai.read(samples, Duration::from_millis(10)).unwrap();
        assert!(data.slice(s![0, ..10]).iter().all(|&v| v == 0.0));
        assert!(data.slice(s![0, 10..]).iter().any(|&v| v.abs() > 0.1));
    }
    fn card_clock() -> ClockSource {
        ClockSource::Terminal("/Dev1/ao/SampleClock".into())
    }
}
