//! Pulse-sequence compiler: turns a line-oriented pulse description into a
//! sample-accurate analog output buffer.
//!
//! Grammar (one statement per line, `#` starts a comment):
//!
//! ```text
//! channel <tag>                      declare an output channel (row order = declaration order)
//! <tag> <start> <duration> <level>   hold <level> volts on <tag> for <duration> from <start>
//! end <time>                         optional total length of the sequence
//! ```
//!
//! Times are decimals with an optional exponent and unit suffix (`s`, `ms`,
//! `us`/`µs`, `ns`; bare numbers are seconds). They are parsed exactly into
//! integer nanoseconds, so sample boundaries never depend on floating-point
//! drift: a time `t` lands on sample `floor(t * rate + 1/2)` (ties round half up).
use std::path::Path;
use std::str::FromStr;
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2};
use serde::Serialize;
use crate::drivers::{AcquisitionError, WaveformBuffer};
const NANOS_PER_SECOND: u128 = 1_000_000_000;
/// Upper bound on samples per channel for a single compiled buffer.
pub const MAX_SAMPLES_PER_CHANNEL: usize = 1 << 28;
/// Upper bound on samples across all channels of a compiled buffer.
pub const MAX_BUFFER_SAMPLES: usize = 1 << 28;
/// What a channel does after one of its segments ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailPolicy {
    /// Return to 0 V after every segment (and through the tail).
    #[default]
    Zero,
    /// Hold the level of the last segment through gaps and the tail.
    HoldLast,
}
impl FromStr for TailPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(TailPolicy::Zero),
            "hold" | "hold_last" | "hold-last" => Ok(TailPolicy::HoldLast),
            other => Err(format!("unknown tail policy '{other}' (expected zero or hold)")),
        }
    }
}
#[derive(Clone, Debug, PartialEq)]
pub struct PulseSegment {
    /// Row index into the declared channel list.
    pub channel: usize,
    pub start_ns: u64,
    pub duration_ns: u64,
    pub level: f64,
    /// 1-based line of the description this segment came from.
    pub line: usize,
}
impl PulseSegment {
    pub fn end_ns(&self) -> u64 {
        self.start_ns + self.duration_ns
    }
}
/// Parsed, validated pulse description. Segments are ordered by start time
/// and never overlap on the same channel.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseSequence {
    channels: Vec<String>,
    segments: Vec<PulseSegment>,
    end: Option<(u64, usize)>,
    last_line: usize,
}
impl PulseSequence {
    pub fn parse(text: &str) -> Result<Self, AcquisitionError> {
        let mut channels: Vec<String> = Vec::new();
        let mut segments: Vec<PulseSegment> = Vec::new();
        let mut end: Option<(u64, usize)> = None;
        let mut last_line = 0;
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            last_line = line;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }
            let fields: Vec<&str> = content.split_whitespace().collect();
            match fields[0] {
                "channel" => {
                    let [_, tag] = fields[..] else {
                        return Err(AcquisitionError::pulse(line, "expected `channel <tag>`"));
                    };
                    if tag == "channel" || tag == "end" {
                        return Err(AcquisitionError::pulse(
                            line,
                            format!("'{tag}' is reserved and cannot name a channel"),
                        ));
                    }
                    if channels.iter().any(|c| c == tag) {
                        return Err(AcquisitionError::pulse(
                            line,
                            format!("channel '{tag}' declared twice"),
                        ));
                    }
                    channels.push(tag.to_string());
                }
                "end" => {
                    let [_, time] = fields[..] else {
                        return Err(AcquisitionError::pulse(line, "expected `end <time>`"));
                    };
                    if let Some((_, first)) = end {
                        return Err(AcquisitionError::pulse(
                            line,
                            format!("`end` already given on line {first}"),
                        ));
                    }
                    let end_ns = parse_time_ns(time)
                        .map_err(|reason| AcquisitionError::pulse(line, format!("end: {reason}")))?;
                    end = Some((end_ns, line));
                }
                tag => {
                    let Some(channel) = channels.iter().position(|c| c == tag) else {
                        return Err(AcquisitionError::pulse(
                            line,
                            format!("unknown channel tag '{tag}'"),
                        ));
                    };
                    let [_, start, duration, level] = fields[..] else {
                        return Err(AcquisitionError::pulse(
                            line,
                            format!(
                                "expected `<tag> <start> <duration> <level>`, got {} fields",
                                fields.len()
                            ),
                        ));
                    };
                    let start_ns = parse_time_ns(start)
                        .map_err(|reason| AcquisitionError::pulse(line, format!("start: {reason}")))?;
                    let duration_ns = parse_time_ns(duration).map_err(|reason| {
                        AcquisitionError::pulse(line, format!("duration: {reason}"))
                    })?;
                    if duration_ns == 0 {
                        return Err(AcquisitionError::pulse(line, "duration must be positive"));
                    }
                    if start_ns.checked_add(duration_ns).is_none() {
                        return Err(AcquisitionError::pulse(line, "segment end is out of range"));
                    }
                    let level = parse_level(level)
                        .map_err(|reason| AcquisitionError::pulse(line, format!("level: {reason}")))?;
                    segments.push(PulseSegment {
                        channel,
                        start_ns,
                        duration_ns,
                        level,
                        line,
                    });
                }
            }
        }
        if channels.is_empty() {
            return Err(AcquisitionError::pulse(
                last_line.max(1),
                "no output channel declared (use `channel <tag>`)",
            ));
        }
        segments.sort_by_key(|seg| (seg.start_ns, seg.channel));
        let mut previous: Vec<Option<&PulseSegment>> = vec![None; channels.len()];
        for seg in &segments {
            if let Some(prev) = previous[seg.channel] {
                if seg.start_ns < prev.end_ns() {
                    let (offender, other) = if seg.line > prev.line {
                        (seg.line, prev.line)
                    } else {
                        (prev.line, seg.line)
                    };
                    return Err(AcquisitionError::pulse(
                        offender,
                        format!(
                            "segment overlaps the '{}' segment on line {other}",
                            channels[seg.channel]
                        ),
                    ));
                }
            }
            previous[seg.channel] = Some(seg);
        }
        let sequence = Self {
            channels,
            segments,
            end,
            last_line,
        };
        if let Some((end_ns, line)) = sequence.end {
            let last_segment_end = sequence.segment_extent_ns();
            if end_ns < last_segment_end {
                return Err(AcquisitionError::pulse(
                    line,
                    format!("end {end_ns} ns is before the last segment ends ({last_segment_end} ns)"),
                ));
            }
        }
        Ok(sequence)
    }
    pub fn channels(&self) -> &[String] {
        &self.channels
    }
    pub fn segments(&self) -> &[PulseSegment] {
        &self.segments
    }
    /// Total time extent: the explicit `end`, or the end of the last segment.
    pub fn total_duration_ns(&self) -> u64 {
        let extent = self.segment_extent_ns();
        self.end.map_or(extent, |(end_ns, _)| end_ns.max(extent))
    }
    fn segment_extent_ns(&self) -> u64 {
        self.segments.iter().map(PulseSegment::end_ns).max().unwrap_or(0)
    }
    /// Line that fixes the sequence length, used when reporting empty buffers.
    fn extent_line(&self) -> usize {
        if let Some((_, line)) = self.end {
            return line;
        }
        self.segments
            .iter()
            .max_by_key(|seg| (seg.end_ns(), seg.line))
            .map_or(self.last_line.max(1), |seg| seg.line)
    }
}
/// Output of [`PulseCompiler::compile`]: the buffer plus the derived time axis.
#[derive(Clone, Debug)]
pub struct CompiledPulse {
    pub waveform: WaveformBuffer,
    /// `linspace(0, sample_count / sample_rate, sample_count)` in seconds.
    pub time_axis: Array1<f64>,
    pub duration_ns: u64,
    pub iteration_count: usize,
}
impl CompiledPulse {
    pub fn sample_count(&self) -> usize {
        self.waveform.sample_count()
    }
    pub fn sample_rate_hz(&self) -> u64 {
        self.waveform.sample_rate_hz()
    }
    pub fn channel_labels(&self) -> &[String] {
        self.waveform.channel_labels()
    }
}
/// Compiles pulse descriptions at a fixed sample rate. Compilation is pure:
/// identical inputs always produce bit-identical buffers.
#[derive(Clone, Debug)]
pub struct PulseCompiler {
    sample_rate_hz: u64,
    tail: TailPolicy,
}
impl PulseCompiler {
    pub fn new(sample_rate_hz: u64) -> Result<Self, AcquisitionError> {
        if sample_rate_hz == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "sample rate must be greater than zero".into(),
            ));
        }
        Ok(Self {
            sample_rate_hz,
            tail: TailPolicy::default(),
        })
    }
    pub fn with_tail(mut self, tail: TailPolicy) -> Self {
        self.tail = tail;
        self
    }
    pub fn sample_rate_hz(&self) -> u64 {
        self.sample_rate_hz
    }
    pub fn tail(&self) -> TailPolicy {
        self.tail
    }
    pub fn compile(
        &self,
        description: &str,
        iteration_count: usize,
    ) -> Result<CompiledPulse, AcquisitionError> {
        let sequence = PulseSequence::parse(description)?;
        self.compile_sequence(&sequence, iteration_count)
    }
    pub fn compile_file(
        &self,
        path: impl AsRef<Path>,
        iteration_count: usize,
    ) -> Result<CompiledPulse, AcquisitionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!("compiling pulse file {}", path.display());
        self.compile(&text, iteration_count)
    }
    pub fn compile_sequence(
        &self,
        sequence: &PulseSequence,
        iteration_count: usize,
    ) -> Result<CompiledPulse, AcquisitionError> {
        if iteration_count == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "iteration count must be at least 1".into(),
            ));
        }
        let duration_ns = sequence.total_duration_ns();
        let sample_count = sample_index(duration_ns, self.sample_rate_hz);
        if sample_count == 0 {
            return Err(AcquisitionError::pulse(
                sequence.extent_line(),
                format!(
                    "sequence length of {duration_ns} ns yields no samples at {} Hz",
                    self.sample_rate_hz
                ),
            ));
        }
        if sample_count > MAX_SAMPLES_PER_CHANNEL {
            return Err(AcquisitionError::pulse(
                sequence.extent_line(),
                format!(
                    "sequence needs {sample_count} samples per channel, limit is {MAX_SAMPLES_PER_CHANNEL}"
                ),
            ));
        }
        let channel_count = sequence.channels.len();
        match channel_count.checked_mul(sample_count) {
            Some(total) if total <= MAX_BUFFER_SAMPLES => {}
            _ => {
                return Err(AcquisitionError::pulse(
                    sequence.extent_line(),
                    format!(
                        "{channel_count} channel(s) of {sample_count} samples exceed the buffer limit of {MAX_BUFFER_SAMPLES}"
                    ),
                ))
            }
        }
        let mut samples = Array2::<f64>::zeros((channel_count, sample_count));
        let mut held: Vec<Option<(usize, f64)>> = vec![None; sequence.channels.len()];
        for seg in &sequence.segments {
            let first = sample_index(seg.start_ns, self.sample_rate_hz);
            let last = sample_index(seg.end_ns(), self.sample_rate_hz).min(sample_count);
            if first >= last {
                warn!(
                    "segment on line {} is shorter than one sample at {} Hz and was dropped",
                    seg.line, self.sample_rate_hz
                );
                continue;
            }
            let mut row = samples.row_mut(seg.channel);
            if let (TailPolicy::HoldLast, Some((prev_end, level))) = (self.tail, held[seg.channel]) {
                row.slice_mut(s![prev_end..first]).fill(level);
            }
            row.slice_mut(s![first..last]).fill(seg.level);
            held[seg.channel] = Some((last, seg.level));
        }
        if self.tail == TailPolicy::HoldLast {
            for (channel, hold) in held.iter().enumerate() {
                if let Some((end, level)) = *hold {
                    samples.row_mut(channel).slice_mut(s![end..]).fill(level);
                }
            }
        }
        let time_axis = Array1::linspace(
            0.0,
            sample_count as f64 / self.sample_rate_hz as f64,
            sample_count,
        );
        info!(
            "compiled {} segment(s) on {} channel(s): {} samples at {} Hz ({:.6} s, tail {:?})",
            sequence.segments.len(),
            sequence.channels.len(),
            sample_count,
            self.sample_rate_hz,
            duration_ns as f64 / NANOS_PER_SECOND as f64,
            self.tail
        );
        Ok(CompiledPulse {
            waveform: WaveformBuffer::new(sequence.channels.clone(), self.sample_rate_hz, samples)?,
            time_axis,
            duration_ns,
            iteration_count,
        })
    }
}
/// Compile with the default tail policy.
pub fn compile(
    description: &str,
    sample_rate_hz: u64,
    iteration_count: usize,
) -> Result<CompiledPulse, AcquisitionError> {
    PulseCompiler::new(sample_rate_hz)?.compile(description, iteration_count)
}
/// Sample index of `time_ns` at `rate_hz`, rounding half up in exact arithmetic.
pub fn sample_index(time_ns: u64, rate_hz: u64) -> usize {
    let scaled = time_ns as u128 * rate_hz as u128;
    // the product of two u64 stays below u128::MAX - 1e9
    let index = (scaled + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
    usize::try_from(index).unwrap_or(usize::MAX)
}
/// Parse a time token (`1.5ms`, `250us`, `1e-3`, `20 ns`) into nanoseconds.
pub fn parse_time_ns(token: &str) -> Result<u64, String> {
    let (number, unit_exp) = split_unit(token);
    if number.starts_with('-') {
        return Err(format!("negative time '{token}'"));
    }
    let number = number.strip_prefix('+').unwrap_or(number);
    let (mantissa, exponent) = match number.find(['e', 'E']) {
        Some(pos) => {
            let exponent = number[pos + 1..]
                .parse::<i32>()
                .map_err(|_| format!("malformed exponent in '{token}'"))?;
            (&number[..pos], exponent)
        }
        None => (number, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return Err(format!("malformed time '{token}'"));
    }
    let digits = format!("{int_part}{frac_part}");
    let digits = digits.trim_start_matches('0');
    if digits.len() > 30 {
        return Err(format!("too many digits in '{token}'"));
    }
    let value: u128 = if digits.is_empty() {
        0
    } else {
        digits.parse().map_err(|_| format!("malformed time '{token}'"))?
    };
    let scale = exponent as i64 + unit_exp as i64 - frac_part.len() as i64;
    let nanos = if scale >= 0 {
        u32::try_from(scale)
            .ok()
            .and_then(|scale| 10u128.checked_pow(scale))
            .and_then(|factor| value.checked_mul(factor))
            .ok_or_else(|| format!("time '{token}' is out of range"))?
    } else {
        let divisor = u32::try_from(-scale).ok().and_then(|scale| 10u128.checked_pow(scale));
        match divisor {
            Some(divisor) if value % divisor == 0 => value / divisor,
            _ if value == 0 => 0,
            _ => return Err(format!("time '{token}' is finer than 1 ns")),
        }
    };
    u64::try_from(nanos).map_err(|_| format!("time '{token}' is out of range"))
}
fn split_unit(token: &str) -> (&str, i32) {
    for (suffix, unit_exp) in [("ms", 6), ("us", 3), ("µs", 3), ("ns", 0), ("s", 9)] {
        if let Some(number) = token.strip_suffix(suffix) {
            return (number, unit_exp);
        }
    }
    (token, 9)
}
fn parse_level(token: &str) -> Result<f64, String> {
    let level: f64 = token
        .parse()
        .map_err(|_| format!("malformed level '{token}'"))?;
    if !level.is_finite() {
        return Err(format!("level '{token}' is not finite"));
    }
    Ok(level)
}
#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    const SINGLE_PULSE: &str = "channel A\nA 0 1ms 1\n";
    fn line_of(err: AcquisitionError) -> usize {
        match err {
            AcquisitionError::PulseFormat { line, .. } => line,
            other => panic!("expected a pulse format error, got {other:?}"),
        }
    }
    #[test]
    fn single_millisecond_pulse_at_one_megahertz() {
        let compiled = compile(SINGLE_PULSE, 1_000_000, 1).unwrap();
        assert_eq!(compiled.sample_count(), 1000);
        assert!(compiled.waveform.channel(0).iter().all(|&v| v == 1.0));
        assert_eq!(compiled.time_axis.len(), 1000);
        assert_eq!(compiled.time_axis[0], 0.0);
        assert!((compiled.time_axis[999] - 1e-3).abs() < 1e-12);
    }
    #[test]
    fn tail_is_zero_by_default() {
        let text = "channel A\nA 0 1ms 1\nend 2ms\n";
        let compiled = compile(text, 1_000_000, 1).unwrap();
        let row = compiled.waveform.channel(0);
        assert_eq!(compiled.sample_count(), 2000);
        assert!(row.slice(s![..1000]).iter().all(|&v| v == 1.0));
        assert!(row.slice(s![1000..]).iter().all(|&v| v == 0.0));
    }
    #[test]
    fn hold_last_tail_keeps_the_final_level() {
        let text = "channel A\nA 0 1ms 1\nend 2ms\n";
        let compiled = PulseCompiler::new(1_000_000)
            .unwrap()
            .with_tail(TailPolicy::HoldLast)
            .compile(text, 1)
            .unwrap();
        assert!(compiled.waveform.channel(0).iter().all(|&v| v == 1.0));
    }
    #[test]
    fn gaps_follow_the_tail_policy() {
        let text = "channel A\nA 0 10us 2.5\nA 20us 10us -1\nend 40us\n";
        let zero = compile(text, 1_000_000, 1).unwrap();
        let row = zero.waveform.channel(0);
        assert_eq!(row[5], 2.5);
        assert_eq!(row[15], 0.0);
        assert_eq!(row[25], -1.0);
        assert_eq!(row[35], 0.0);
        let hold = PulseCompiler::new(1_000_000)
            .unwrap()
            .with_tail(TailPolicy::HoldLast)
            .compile(text, 1)
            .unwrap();
        let row = hold.waveform.channel(0);
        assert_eq!(row[15], 2.5);
        assert_eq!(row[35], -1.0);
    }
    #[test]
    fn boundaries_round_half_up() {
        // 2.5 us at 1 MHz is exactly 2.5 samples.
        let compiled = compile("channel A\nA 0 2.5us 1\n", 1_000_000, 1).unwrap();
        assert_eq!(compiled.sample_count(), 3);
        // 1.5 us start: index 2; ends at 3.5 us -> index 4.
        let compiled = compile("channel A\nA 1.5us 2us 1\nend 5us\n", 1_000_000, 1).unwrap();
        let row = compiled.waveform.channel(0);
        assert_eq!(row.to_vec(), vec![0.0, 0.0, 1.0, 1.0, 0.0]);
    }
    #[test]
    fn multiple_channels_share_one_time_axis() {
        let text = "\
# gate opens before the rf pulse
channel rf
channel gate

gate 0 5us 5     # TTL level
rf   1us 2us 0.8
end 8us
";
        let compiled = compile(text, 1_000_000, 1).unwrap();
        assert_eq!(compiled.channel_labels(), ["rf".to_string(), "gate".to_string()]);
        assert_eq!(compiled.waveform.samples().dim(), (2, 8));
        assert_eq!(
            compiled.waveform.channel(0).to_vec(),
            vec![0.0, 0.8, 0.8, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert_eq!(
            compiled.waveform.channel(1).to_vec(),
            vec![5.0, 5.0, 5.0, 5.0, 5.0, 0.0, 0.0, 0.0]
        );
    }
    #[test]
    fn unsorted_segments_are_ordered_by_start() {
        let sequence = PulseSequence::parse("channel A\nA 3us 1us 1\nA 0 1us 2\n").unwrap();
        let starts: Vec<u64> = sequence.segments().iter().map(|s| s.start_ns).collect();
        assert_eq!(starts, vec![0, 3000]);
    }
    #[test]
    fn compilation_is_deterministic() {
        let text = "channel A\nchannel B\nA 0 13us 0.3\nB 7us 3.3us 1.7\nend 31us\n";
        for rate in [1_000_000, 3_333_333, 250_000] {
            let first = compile(text, rate, 4).unwrap();
            let second = compile(text, rate, 4).unwrap();
            assert_eq!(first.sample_count(), second.sample_count());
            assert_eq!(first.waveform.samples(), second.waveform.samples());
            assert_eq!(first.time_axis, second.time_axis);
        }
    }
    #[test]
    fn sample_count_matches_rounded_duration() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let duration_ns: u64 = rng.gen_range(1_000..5_000_000);
            let rate: u64 = rng.gen_range(10_000..2_000_000);
            let text = format!("channel A\nA 0 {duration_ns}ns 1\n");
            let Ok(compiled) = compile(&text, rate, 1) else {
                continue;
            };
            let exact = duration_ns as f64 * rate as f64 / 1e9;
            let n = compiled.sample_count();
            assert!((n as f64 - exact).abs() <= 0.5 + 1e-9, "{n} vs {exact}");
            let rederived = n as f64 / rate as f64;
            assert!((rederived - duration_ns as f64 / 1e9).abs() <= 1.0 / rate as f64);
            if n > 1 {
                let last = *compiled.time_axis.last().unwrap();
                assert!((last - rederived).abs() <= 1e-12 * rederived.max(1.0));
            }
        }
    }
    #[test]
    fn time_tokens_parse_exactly() {
        assert_eq!(parse_time_ns("1ms"), Ok(1_000_000));
        assert_eq!(parse_time_ns("250us"), Ok(250_000));
        assert_eq!(parse_time_ns("250µs"), Ok(250_000));
        assert_eq!(parse_time_ns("1e-3"), Ok(1_000_000));
        assert_eq!(parse_time_ns("0.5"), Ok(500_000_000));
        assert_eq!(parse_time_ns("2.5E1ns"), Ok(25));
        assert_eq!(parse_time_ns("0"), Ok(0));
        assert!(parse_time_ns("1.5ns").is_err());
        assert!(parse_time_ns("-1ms").is_err());
        assert!(parse_time_ns("ms").is_err());
        assert!(parse_time_ns("1.2.3").is_err());
        assert!(parse_time_ns("abc").is_err());
    }
    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# header\n\n   \nchannel A # the only one\n\n# body\nA 0 1us 1\n";
        assert_eq!(compile(text, 1_000_000, 1).unwrap().sample_count(), 1);
    }
    #[test]
    fn malformed_lines_report_their_line_number() {
        let cases = [
            ("channel A\nB 0 1us 1\n", 2),
            ("channel A\nA 0 0us 1\n", 2),
            ("channel A\n\nA -1us 1us 1\n", 3),
            ("channel A\nA 0 1us one\n", 2),
            ("channel A\nA 0 1xs 1\n", 2),
            ("channel A\nA 0 1us\n", 2),
            ("channel A\nchannel A\n", 2),
            ("channel A\nA 0 1us inf\n", 2),
            ("channel A\nA 0 2us 1\nA 1us 2us 1\n", 3),
            ("channel A\nA 0 2us 1\nend 1us\n", 3),
            ("channel A\nA 0 1us 1\nend 2us\nend 3us\n", 4),
            ("frobnicate\n", 1),
        ];
        for (text, expected) in cases {
            let err = PulseSequence::parse(text).unwrap_err();
            assert_eq!(line_of(err), expected, "{text:?}");
        }
    }
    #[test]
    fn overlap_reports_the_later_line_even_when_listed_first() {
        let err = PulseSequence::parse("channel A\nA 1us 2us 1\nA 0 2us 1\n").unwrap_err();
        assert_eq!(line_of(err), 3);
    }
    #[test]
    fn empty_buffers_are_rejected() {
        let err = compile("channel A\nA 0 100ns 1\n", 1000, 1).unwrap_err();
        assert_eq!(line_of(err), 2);
        let err = compile("channel A\n", 1_000_000, 1).unwrap_err();
        assert_eq!(line_of(err), 1);
        let err = PulseSequence::parse("# nothing\n").unwrap_err();
        assert_eq!(line_of(err), 1);
    }
    #[test]
    fn sample_index_saturates_instead_of_overflowing() {
        assert_eq!(sample_index(u64::MAX, u64::MAX), usize::MAX);
        assert_eq!(sample_index(u64::MAX, 1), 18_446_744_074);
        assert_eq!(sample_index(500, 1_000_000), 1);
        assert_eq!(sample_index(499, 1_000_000), 0);
    }
    #[test]
    fn extreme_rates_are_rejected_not_panicking() {
        let text = "channel A\nA 0 1ns 1\nend 18446744073s\n";
        let err = compile(text, u64::MAX, 1).unwrap_err();
        assert_eq!(line_of(err), 3);
    }
    #[test]
    fn buffer_limit_counts_every_channel() {
        let mut text: String = (0..64).map(|i| format!("channel c{i}\n")).collect();
        // 2^23 samples per channel, within the per-channel limit
        text.push_str("c0 0 1us 1\nend 8388608us\n");
        let err = compile(&text, 1_000_000, 1).unwrap_err();
        assert_eq!(line_of(err), 66);
        let single = "channel c0\nc0 0 1us 1\nend 1000us\n";
        assert!(compile(single, 1_000_000, 1).is_ok());
    }
    #[test]
    fn samples_before_the_first_segment_are_zero_when_holding() {
        let text = "channel A\nA 10us 10us 2\nend 40us\n";
        let compiled = PulseCompiler::new(1_000_000)
            .unwrap()
            .with_tail(TailPolicy::HoldLast)
            .compile(text, 1)
            .unwrap();
        let row = compiled.waveform.channel(0);
        assert_eq!(compiled.sample_count(), 40);
        assert!(row.slice(s![..10]).iter().all(|&v| v == 0.0));
        assert!(row.slice(s![10..]).iter().all(|&v| v == 2.0));
    }
    #[test]
    fn zero_rate_and_iterations_are_config_errors() {
        assert!(matches!(
            PulseCompiler::new(0),
            Err(AcquisitionError::InvalidConfig(_))
        ));
        assert!(matches!(
            compile(SINGLE_PULSE, 1_000_000, 0),
            Err(AcquisitionError::InvalidConfig(_))
        ));
    }
    #[test]
    fn tail_policy_parses_from_config_text() {
        assert_eq!("zero".parse::<TailPolicy>(), Ok(TailPolicy::Zero));
        assert_eq!("Hold".parse::<TailPolicy>(), Ok(TailPolicy::HoldLast));
        assert!("sometimes".parse::<TailPolicy>().is_err());
    }
}
