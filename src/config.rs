//! Parameter file (flat JSON object) and the acquisition settings derived from it.
//!
//! Recognized keys: `sampling_rate`, `iteration`, `average`, `pulse_file`,
//! `file_name` and any `*_channel` key. Channel keys containing `pulse` are
//! analog outputs; every other `*_channel` key is an analog input labelled by
//! its prefix (`nsor_channel` -> `nsor`), in file order. Optional keys:
//! `clock_source`, `cycle_timeout` (seconds), `pulse_tail` (`zero`/`hold`),
//! `spectrum_channels`. Display range and cursor keys are kept but ignored.
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use crate::drivers::{AcquisitionError, ClockSource, TailPolicy};
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pulse files are looked up here, relative to the parameter file.
pub const PULSE_SEQUENCE_DIR: &str = "pulse_sequences";
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputChannel {
    pub label: String,
    pub physical: String,
}
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AcquisitionConfig {
    pub sample_rate_hz: u64,
    pub iteration_count: usize,
    pub average_count: usize,
    pub output_channels: Vec<String>,
    pub input_channels: Vec<InputChannel>,
    /// Input sample clock terminal; `None` slaves to the first output's device.
    pub clock_source: Option<String>,
    pub cycle_timeout: Duration,
    pub pulse_tail: TailPolicy,
    /// Input labels whose traces are transformed for display.
    pub spectrum_channels: Vec<String>,
}
impl AcquisitionConfig {
    pub fn new(
        sample_rate_hz: u64,
        iteration_count: usize,
        average_count: usize,
        output_channels: Vec<String>,
        input_channels: Vec<InputChannel>,
    ) -> Self {
        let spectrum_channels = input_channels
            .iter()
            .take(2)
            .map(|c| c.label.clone())
            .collect();
        Self {
            sample_rate_hz,
            iteration_count,
            average_count,
            output_channels,
            input_channels,
            clock_source: None,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            pulse_tail: TailPolicy::default(),
            spectrum_channels,
        }
    }
    /// Rejects, never clamps.
    pub fn validate(&self) -> Result<(), AcquisitionError> {
        let invalid = |msg: String| Err(AcquisitionError::InvalidConfig(msg));
        if self.sample_rate_hz == 0 {
            return invalid("sampling rate must be greater than zero".into());
        }
        if self.iteration_count == 0 {
            return invalid("iteration count must be at least 1".into());
        }
        if self.average_count == 0 {
            return invalid("average count must be at least 1".into());
        }
        if self.output_channels.is_empty() {
            return invalid("no pulse (output) channel configured".into());
        }
        if self.input_channels.is_empty() {
            return invalid("no signal (input) channel configured".into());
        }
        if self.cycle_timeout.is_zero() {
            return invalid("cycle timeout must be positive".into());
        }
        for (idx, channel) in self.input_channels.iter().enumerate() {
            if self.input_channels[..idx]
                .iter()
                .any(|c| c.label == channel.label)
            {
                return invalid(format!("input label '{}' used twice", channel.label));
            }
        }
        for label in &self.spectrum_channels {
            if !self.input_channels.iter().any(|c| &c.label == label) {
                return invalid(format!("spectrum channel '{label}' is not an input channel"));
            }
        }
        Ok(())
    }
    pub fn input_labels(&self) -> Vec<String> {
        self.input_channels.iter().map(|c| c.label.clone()).collect()
    }
    pub fn input_physical(&self) -> Vec<String> {
        self.input_channels.iter().map(|c| c.physical.clone()).collect()
    }
    /// Clock for the input task: the configured terminal, or the output device's
    /// analog-output sample clock.
    pub fn input_clock(&self) -> Result<ClockSource, AcquisitionError> {
        match self.clock_source.as_deref().map(str::trim) {
            Some(src) if src.eq_ignore_ascii_case("onboard") => Ok(ClockSource::Onboard),
            Some(src) if !src.is_empty() => Ok(ClockSource::Terminal(src.to_string())),
            _ => self
                .output_channels
                .first()
                .and_then(|channel| ClockSource::ao_sample_clock_of(channel))
                .ok_or_else(|| {
                    AcquisitionError::InvalidConfig(
                        "cannot derive the sample clock terminal from the output channel".into(),
                    )
                }),
        }
    }
    pub fn nyquist_hz(&self) -> f64 {
        self.sample_rate_hz as f64 / 2.0
    }
}
/// Flat key/value parameter store, order preserved.
#[derive(Clone, Debug, Default)]
pub struct Parameters {
    values: Map<String, Value>,
    path: Option<PathBuf>,
}
impl Parameters {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AcquisitionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut parameters = Self::from_json(&text)?;
        parameters.path = Some(path.to_path_buf());
        debug!("loaded {} parameter(s) from {}", parameters.values.len(), path.display());
        Ok(parameters)
    }
    pub fn from_json(text: &str) -> Result<Self, AcquisitionError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(values) => Ok(Self { values, path: None }),
            _ => Err(AcquisitionError::InvalidConfig(
                "parameter file must contain a JSON object".into(),
            )),
        }
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
    /// String or number value as text.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }
    /// Merge these values into the file at `path` (other keys there are kept).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AcquisitionError> {
        let path = path.as_ref();
        let mut merged = if path.exists() {
            Self::load(path)?.values
        } else {
            Map::new()
        };
        for (key, value) in &self.values {
            merged.insert(key.clone(), value.clone());
        }
        let text = serde_json::to_string_pretty(&Value::Object(merged))?;
        std::fs::write(path, text)?;
        Ok(())
    }
    pub fn acquisition_config(&self) -> Result<AcquisitionConfig, AcquisitionError> {
        let sample_rate_hz = self.positive("sampling_rate")?;
        let iteration_count = self.positive("iteration")? as usize;
        let average_count = self.positive("average")? as usize;
        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        for (key, value) in &self.values {
            let Some(label) = key.strip_suffix("_channel") else {
                continue;
            };
            let physical = match value {
                Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => {
                    return Err(AcquisitionError::InvalidConfig(format!(
                        "'{key}' must name a physical channel"
                    )))
                }
            };
            if key.contains("pulse") {
                outputs.push(physical);
            } else {
                inputs.push(InputChannel {
                    label: label.to_string(),
                    physical,
                });
            }
        }
        let mut config =
            AcquisitionConfig::new(sample_rate_hz, iteration_count, average_count, outputs, inputs);
        config.clock_source = self.text("clock_source").filter(|s| !s.is_empty());
        if self.values.contains_key("cycle_timeout") {
            let seconds = self
                .text("cycle_timeout")
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|s| s.is_finite() && *s > 0.0)
                .ok_or_else(|| {
                    AcquisitionError::InvalidConfig("cycle_timeout must be a positive number of seconds".into())
                })?;
            config.cycle_timeout = Duration::from_secs_f64(seconds);
        }
        if let Some(tail) = self.text("pulse_tail") {
            config.pulse_tail = tail.parse().map_err(AcquisitionError::InvalidConfig)?;
        }
        match self.values.get("spectrum_channels") {
            Some(Value::Array(items)) => {
                config.spectrum_channels = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
            Some(Value::String(list)) => {
                config.spectrum_channels = list.split_whitespace().map(str::to_string).collect();
            }
            _ => {}
        }
        config.validate()?;
        Ok(config)
    }
    /// `pulse_file`, resolved against `pulse_sequences/` next to the parameter file.
    pub fn pulse_path(&self) -> Result<PathBuf, AcquisitionError> {
        let name = self
            .text("pulse_file")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AcquisitionError::InvalidConfig("missing key 'pulse_file'".into()))?;
        let file = PathBuf::from(name);
        if file.is_absolute() {
            return Ok(file);
        }
        let base = self
            .path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(base.join(PULSE_SEQUENCE_DIR).join(file))
    }
    /// Where traces are saved (`file_name`), if configured.
    pub fn output_file(&self) -> Option<PathBuf> {
        self.text("file_name")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }
    fn positive(&self, key: &str) -> Result<u64, AcquisitionError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| AcquisitionError::InvalidConfig(format!("missing key '{key}'")))?;
        let parsed = match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match parsed {
            Some(v) if v > 0 => Ok(v),
            _ => Err(AcquisitionError::InvalidConfig(format!(
                "'{key}' must be a positive integer, got {value}"
            ))),
        }
    }
}
