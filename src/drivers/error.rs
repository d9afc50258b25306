use std::time::Duration;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("pulse description line {line}: {reason}")]
    PulseFormat { line: usize, reason: String },
    #[error("invalid acquisition config: {0}")]
    InvalidConfig(String),
    #[error("device configuration failed: {0}")]
    DeviceConfig(String),
    #[error("acquisition timed out: {0}")]
    AcquisitionTimeout(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("spectral transform needs at least 2 samples, got {0}")]
    InsufficientSamples(usize),
    #[error("session is not configured; configure it before starting a run")]
    NotConfigured,
    #[error("capture shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("device fault during acquisition: {0}")]
    DeviceFault(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error("parameter file: {0}")]
    Parameter(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
impl AcquisitionError {
    pub(crate) fn pulse(line: usize, reason: impl Into<String>) -> Self {
        AcquisitionError::PulseFormat {
            line,
            reason: reason.into(),
        }
    }
}
/// Errors reported by an analog I/O task.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid physical channel '{0}'")]
    InvalidChannel(String),
    #[error("sample clock conflict: {0}")]
    ClockConflict(String),
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    #[error("task did not complete within {0:?}")]
    Timeout(Duration),
    #[error("task is not configured")]
    NotConfigured,
    #[error("driver error: {0}")]
    Driver(String),
}
impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for AcquisitionError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        AcquisitionError::Plot(format!("{value:?}"))
    }
}
impl From<image::ImageError> for AcquisitionError {
    fn from(value: image::ImageError) -> Self {
        AcquisitionError::Plot(value.to_string())
    }
}
