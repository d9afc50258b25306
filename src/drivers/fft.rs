use std::sync::Mutex;
use once_cell::sync::Lazy;
use rustfft::{num_complex::Complex64, FftPlanner};
use ndarray::{Array1, ArrayView1};
use crate::drivers::AcquisitionError;
// Plans are cached across calls; the lock is only held while planning.
static PLANNER: Lazy<Mutex<FftPlanner<f64>>> = Lazy::new(|| Mutex::new(FftPlanner::new()));
/// Half spectrum of one channel of a trace.
#[derive(Clone, Debug)]
pub struct SpectrumResult {
    pub channel: String,
    /// Linear from 0 to the requested maximum frequency, same length as `amplitudes`.
    pub frequencies_hz: Array1<f64>,
    /// `rfft(x) * 2 / N`, DC and Nyquist bins included.
    pub amplitudes: Vec<Complex64>,
}
impl SpectrumResult {
    pub fn len(&self) -> usize {
        self.amplitudes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.amplitudes.is_empty()
    }
    pub fn magnitudes(&self) -> Vec<f64> {
        self.amplitudes.iter().map(|c| c.norm()).collect()
    }
    pub fn bin_width_hz(&self) -> f64 {
        match self.frequencies_hz.len() {
            0 | 1 => 0.0,
            n => self.frequencies_hz[n - 1] / (n - 1) as f64,
        }
    }
    /// Frequency of the largest-magnitude bin, skipping DC.
    pub fn peak_frequency_hz(&self) -> Option<f64> {
        self.amplitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(idx, _)| self.frequencies_hz[idx])
    }
}
/// Normalized real-input DFT of a captured trace.
///
/// Every bin is scaled by `2/N`, so a tone of amplitude `a` shows up as a peak
/// of height `a`. DC and Nyquist bins are scaled the same way and therefore
/// read twice their physical value; callers needing exact DC levels halve them.
pub fn transform(
    time_series: ArrayView1<'_, f64>,
    max_frequency_hz: f64,
    channel: impl Into<String>,
) -> Result<SpectrumResult, AcquisitionError> {
    let n = time_series.len();
    if n < 2 {
        return Err(AcquisitionError::InsufficientSamples(n));
    }
    let fft = {
        let mut planner = PLANNER
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        planner.plan_fft_forward(n)
    };
    let mut buffer: Vec<Complex64> = time_series
        .iter()
        .map(|&v| Complex64::new(v, 0.0))
        .collect();
    fft.process(&mut buffer);
    let bins = n / 2 + 1;
    let scale = 2.0 / n as f64;
    buffer.truncate(bins);
    buffer.iter_mut().for_each(|c| *c *= scale);
    Ok(SpectrumResult {
        channel: channel.into(),
        frequencies_hz: Array1::linspace(0.0, max_frequency_hz, bins),
        amplitudes: buffer,
    })
}
