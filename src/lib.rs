//! Acquisition core for NMR / NSOR circulation measurements: compiles pulse
//! descriptions into analog output buffers, runs synchronized output/input
//! cycles with a running average, and transforms averaged traces into
//! normalized half spectra.
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod types;

pub use config::{AcquisitionConfig, InputChannel, Parameters};
pub use engine::{spawn_spectra, AcquisitionController, LiveSpectra};
pub use recorder::TraceRecorder;
pub use types::{AcquisitionEvent, RunSummary, SessionState, StopSignal};
