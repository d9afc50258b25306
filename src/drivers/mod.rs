// src/drivers/mod.rs
// acquisition core: pulse compiler, device contract, session, transform
pub mod buffer;
pub mod device;
pub mod error;
pub mod fft;
pub mod plot;
pub mod pulse;
pub mod session;
pub mod sim;
// flat re-exports for callers outside `drivers`
pub use buffer::{AveragedTrace, RunningAverage, WaveformBuffer};
pub use device::{AnalogInputTask, AnalogOutputTask, ClockSource, DaqTask, TaskTiming};
pub use error::{AcquisitionError, DeviceError};
pub use fft::{transform, SpectrumResult};
pub use plot::{render_pulse_png, render_spectrum_png, render_trace_png, PlotStyle};
pub use pulse::{
    compile, sample_index, CompiledPulse, PulseCompiler, PulseSegment, PulseSequence, TailPolicy,
};
pub use session::AcquisitionSession;
pub use sim::{CycleGate, SignalModel, SimulatedCard, SimulatedInput, SimulatedOutput};
