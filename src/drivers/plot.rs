use std::io::Cursor;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use ndarray::{ArrayView1, ArrayView2};
use plotters::prelude::LineSeries;
use plotters::prelude::*;
use crate::drivers::error::AcquisitionError;
use crate::drivers::{AveragedTrace, CompiledPulse, SpectrumResult};
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}
impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            height: 400,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
        }
    }
}
/// Pulse buffer against its time axis (ms), one line per output channel.
pub fn render_pulse_png(pulse: &CompiledPulse, style: PlotStyle) -> Result<Vec<u8>, AcquisitionError> {
    let time_ms = pulse.time_axis.mapv(|t| t * 1e3);
    render_lines_png(
        "Pulse Sequence",
        time_ms.view(),
        pulse.waveform.samples().view(),
        pulse.channel_labels(),
        &style,
    )
}
/// Averaged trace against time (ms), one line per input channel.
pub fn render_trace_png(trace: &AveragedTrace, style: PlotStyle) -> Result<Vec<u8>, AcquisitionError> {
    let time_ms = trace.time_axis().mapv(|t| t * 1e3);
    let caption = format!("Iteration {} ({} averages)", trace.iteration + 1, trace.averages);
    render_lines_png(
        &caption,
        time_ms.view(),
        trace.samples.view(),
        &trace.channel_labels,
        &style,
    )
}
/// Magnitude spectra, one line per result, on a shared frequency axis (Hz).
pub fn render_spectrum_png(
    spectra: &[SpectrumResult],
    style: PlotStyle,
) -> Result<Vec<u8>, AcquisitionError> {
    if spectra.iter().all(SpectrumResult::is_empty) {
        return Err(AcquisitionError::Plot("spectrum has no bins".into()));
    }
    let x_max = spectra
        .iter()
        .filter_map(|s| s.frequencies_hz.last().copied())
        .fold(0.0f64, f64::max);
    let y_max = spectra
        .iter()
        .flat_map(|s| s.magnitudes())
        .fold(0.0f64, f64::max)
        .max(1e-6);
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption("FFT Magnitude", ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(0f64..x_max.max(1.0), 0f64..y_max * 1.05)?;
        chart
            .configure_mesh()
            .x_desc("Hz")
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
        for (idx, spectrum) in spectra.iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = spectrum
                .frequencies_hz
                .iter()
                .copied()
                .zip(spectrum.magnitudes());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(spectrum.channel.clone())
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        chart
            .configure_series_labels()
            .border_style(&WHITE.mix(0.2))
            .background_style(&style.background)
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
fn render_lines_png(
    caption: &str,
    x: ArrayView1<'_, f64>,
    rows: ArrayView2<'_, f64>,
    labels: &[String],
    style: &PlotStyle,
) -> Result<Vec<u8>, AcquisitionError> {
    if rows.is_empty() || x.len() != rows.ncols() {
        return Err(AcquisitionError::Plot(format!(
            "cannot plot {}x{} samples against {} time points",
            rows.nrows(),
            rows.ncols(),
            x.len()
        )));
    }
    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let y_min = rows.iter().copied().fold(0.0f64, f64::min);
        let y_max = rows.iter().copied().fold(0.0f64, f64::max);
        let pad = ((y_max - y_min) * 0.05).max(1e-3);
        let x_max = x[x.len() - 1];
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(caption, ("sans-serif", 20).into_font().color(&WHITE))
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(0f64..x_max.max(1e-6), (y_min - pad)..(y_max + pad))?;
        chart
            .configure_mesh()
            .x_desc("ms")
            .light_line_style(&WHITE.mix(0.1))
            .draw()?;
        for (idx, row) in rows.outer_iter().enumerate() {
            let color = style.palette[idx % style.palette.len()];
            let series = x.iter().copied().zip(row.iter().copied());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(
                    labels
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("Ch {idx}")),
                )
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
        }
        chart
            .configure_series_labels()
            .border_style(&WHITE.mix(0.2))
            .background_style(&style.background)
            .draw()?;
        root.present()?;
    }
    encode_png(&buffer, style.width, style.height)
}
fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, AcquisitionError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| AcquisitionError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    fn small() -> PlotStyle {
        PlotStyle {
            width: 320,
            height: 200,
            ..PlotStyle::default()
        }
    }
    #[test]
    fn empty_inputs_are_plot_errors() {
        let trace = AveragedTrace {
            iteration: 0,
            averages: 0,
            sample_rate_hz: 1000,
            channel_labels: vec![],
            samples: Array2::zeros((0, 0)),
        };
        assert!(matches!(
            render_trace_png(&trace, small()),
            Err(AcquisitionError::Plot(_))
        ));
        assert!(matches!(
            render_spectrum_png(&[], small()),
            Err(AcquisitionError::Plot(_))
        ));
    }
}
