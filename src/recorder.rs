use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use log::{debug, info};
use crate::drivers::{AcquisitionError, AveragedTrace};
use crate::types::AcquisitionEvent;

/// Writes averaged traces as CSV: a `time_s` column followed by one column
/// per input channel.
///
/// The live file (`<base>.csv`) is overwritten on every trace update so it
/// always holds the latest running average; each finished iteration is also
/// kept as `<base>_iter<k>.csv` (`k` counts from 1).
pub struct TraceRecorder {
    base: PathBuf,
}

impl TraceRecorder {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let mut base = base.into();
        if base.extension().is_some_and(|ext| ext == "csv") {
            base.set_extension("");
        }
        Self { base }
    }

    pub fn live_path(&self) -> PathBuf {
        self.base.with_extension("csv")
    }

    pub fn iteration_path(&self, iteration: usize) -> PathBuf {
        let stem = self
            .base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.base
            .with_file_name(format!("{stem}_iter{}.csv", iteration + 1))
    }

    /// Persist whatever `event` carries; other events are ignored.
    pub fn handle(&self, event: &AcquisitionEvent) -> Result<(), AcquisitionError> {
        match event {
            AcquisitionEvent::TraceUpdated(trace) => self.write_live(trace),
            AcquisitionEvent::IterationComplete(trace) => {
                self.write_live(trace)?;
                let path = self.iteration_path(trace.iteration);
                write_csv(&path, trace)?;
                info!("saved iteration {} ({} averages) to {}", trace.iteration + 1, trace.averages, path.display());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn write_live(&self, trace: &AveragedTrace) -> Result<(), AcquisitionError> {
        let path = self.live_path();
        write_csv(&path, trace)?;
        debug!("updated {} ({} averages)", path.display(), trace.averages);
        Ok(())
    }
}

fn write_csv(path: &Path, trace: &AveragedTrace) -> Result<(), AcquisitionError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    write!(w, "time_s")?;
    for label in &trace.channel_labels {
        write!(w, ",{label}")?;
    }
    writeln!(w)?;
    let time = trace.time_axis();
    for (i, t) in time.iter().enumerate() {
        write!(w, "{t}")?;
        for value in trace.samples.column(i) {
            write!(w, ",{value}")?;
        }
        writeln!(w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn trace(iteration: usize) -> AveragedTrace {
        AveragedTrace {
            iteration,
            averages: 2,
            sample_rate_hz: 4,
            channel_labels: vec!["nmr".into(), "nsor".into()],
            samples: array![[1.0, 2.0, 3.0, 4.0], [-0.5, 0.0, 0.5, 1.0]],
        }
    }

    #[test]
    fn live_file_is_overwritten_with_latest_trace() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("run.csv"));
        recorder.handle(&AcquisitionEvent::TraceUpdated(trace(0))).unwrap();
        let mut later = trace(0);
        later.samples.fill(7.0);
        recorder.handle(&AcquisitionEvent::TraceUpdated(later)).unwrap();
        let text = std::fs::read_to_string(dir.path().join("run.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "time_s,nmr,nsor");
        assert_eq!(lines[1], "0,7,7");
        assert!(lines[4].ends_with(",7,7"));
    }

    #[test]
    fn finished_iterations_are_kept_separately() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("data").join("nsor"));
        recorder.handle(&AcquisitionEvent::IterationComplete(trace(0))).unwrap();
        recorder.handle(&AcquisitionEvent::IterationComplete(trace(1))).unwrap();
        let first = dir.path().join("data").join("nsor_iter1.csv");
        let second = dir.path().join("data").join("nsor_iter2.csv");
        assert_eq!(recorder.iteration_path(1), second);
        let text = std::fs::read_to_string(first).unwrap();
        assert_eq!(text.lines().nth(2), Some("0.3333333333333333,2,0"));
        assert!(second.exists());
        assert!(dir.path().join("data").join("nsor.csv").exists());
    }

    #[test]
    fn other_events_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TraceRecorder::new(dir.path().join("quiet"));
        recorder
            .handle(&AcquisitionEvent::RunFailed("boom".into()))
            .unwrap();
        assert!(!recorder.live_path().exists());
    }
}
