//! Synchronous analog I/O contract used by the acquisition session.
//!
//! A real driver (NI-DAQmx or similar) is wrapped behind these traits; the
//! crate ships only [`SimulatedCard`](crate::drivers::SimulatedCard).
use std::time::Duration;
use ndarray::Array2;
use crate::drivers::{DeviceError, WaveformBuffer};
/// Where a task takes its sample clock from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClockSource {
    /// The device's own timebase; the task is the clock master.
    Onboard,
    /// Slaved to an exported clock terminal, e.g. `/Dev1/ao/SampleClock`.
    Terminal(String),
}
impl ClockSource {
    /// Analog-output sample clock terminal of the device owning `channel`
    /// (`Dev1/ao0` -> `/Dev1/ao/SampleClock`).
    pub fn ao_sample_clock_of(channel: &str) -> Option<ClockSource> {
        let device = channel.trim_start_matches('/').split('/').next()?;
        if device.is_empty() {
            return None;
        }
        Some(ClockSource::Terminal(format!("/{device}/ao/SampleClock")))
    }
}
/// Finite sample-clock timing: exactly `samples_per_channel` samples per start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskTiming {
    pub sample_rate_hz: u64,
    pub samples_per_channel: usize,
    pub clock: ClockSource,
}
/// Lifecycle shared by output and input tasks.
pub trait DaqTask: Send {
    /// Bind physical channels and finite timing. Replaces any previous configuration.
    fn configure(&mut self, channels: &[String], timing: &TaskTiming) -> Result<(), DeviceError>;
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Block until the finite task has produced/acquired all its samples.
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), DeviceError>;
    fn stop(&mut self) -> Result<(), DeviceError>;
    /// Release the channels. A closed task can be configured again.
    fn close(&mut self) -> Result<(), DeviceError>;
}
pub trait AnalogOutputTask: DaqTask {
    /// Load the buffer that every start replays; rows follow the configured channel order.
    fn write(&mut self, buffer: &WaveformBuffer) -> Result<(), DeviceError>;
}
pub trait AnalogInputTask: DaqTask {
    /// Read up to `samples_per_channel` samples of every configured channel
    /// (channels x samples). A driver may return fewer than requested.
    fn read(
        &mut self,
        samples_per_channel: usize,
        timeout: Duration,
    ) -> Result<Array2<f64>, DeviceError>;
}
