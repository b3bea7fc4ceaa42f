//! Diagnostic Plots
//!
//! Writes self-contained SVG files next to each other in one output
//! directory:
//!
//! - `{name}.hist.svg`: 50-bin histogram of a list of values
//! - `{name}.grid.svg`: heatmap of a tensor, rows = all leading axes
//!   flattened, columns = last axis
//!
//! Heatmaps of large tensors are block-averaged down to at most
//! [`MAX_GRID_CELLS`] cells per side. Colors run from dark (minimum) to
//! bright (maximum) on a linear scale.

use crate::error::Result;
use crate::tensor::Tensor;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Number of histogram bins
pub const HIST_BINS: usize = 50;

/// Upper bound on heatmap rows and columns
pub const MAX_GRID_CELLS: usize = 256;

const WIDTH: f32 = 640.0;
const HEIGHT: f32 = 400.0;
const MARGIN: f32 = 48.0;

/// SVG plot writer
#[derive(Debug, Clone)]
pub struct Plotter {
    output_dir: PathBuf,
    enabled: bool,
}

impl Plotter {
    pub fn new(output_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            enabled,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Histogram of `values`; returns the written path, or `None` when disabled
    pub fn hist(&self, values: &[f32], name: &str, title: &str) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        let svg = render_hist(values, title);
        self.write(name, "hist", &svg).map(Some)
    }

    /// Heatmap of `tensor`; returns the written path, or `None` when disabled
    pub fn grid(&self, tensor: &Tensor, name: &str) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        let svg = render_grid(tensor, name);
        self.write(name, "grid", &svg).map(Some)
    }

    fn write(&self, name: &str, kind: &str, svg: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{}.{kind}.svg", file_stem(name)));
        fs::write(&path, svg)?;
        trace!(path = %path.display(), "plot written");
        Ok(path)
    }
}

/// Keep module names readable as file names
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "root".to_string()
    } else {
        stem
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Bin counts over `[min, max]`; the last bin is closed
pub fn histogram(values: &[f32], bins: usize) -> (Vec<u64>, f32, f32) {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let mut counts = vec![0u64; bins];
    if min > max {
        return (counts, 0.0, 0.0);
    }

    let width = (max - min) / bins as f32;
    for &v in values.iter().filter(|v| v.is_finite()) {
        let idx = if width > 0.0 {
            (((v - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        counts[idx] += 1;
    }
    (counts, min, max)
}

fn svg_open(out: &mut String, width: f32, height: f32) {
    let _ = writeln!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    );
    let _ = writeln!(out, r#"<rect width="100%" height="100%" fill="white"/>"#);
}

fn render_hist(values: &[f32], title: &str) -> String {
    let (counts, min, max) = histogram(values, HIST_BINS);
    let peak = counts.iter().copied().max().unwrap_or(0).max(1) as f32;

    let plot_w = WIDTH - 2.0 * MARGIN;
    let plot_h = HEIGHT - 2.0 * MARGIN;
    let bar_w = plot_w / HIST_BINS as f32;

    let mut out = String::new();
    svg_open(&mut out, WIDTH, HEIGHT);
    let _ = writeln!(
        out,
        r#"<text x="{}" y="20" font-family="monospace" font-size="11" text-anchor="middle">{}</text>"#,
        WIDTH / 2.0,
        escape(title)
    );
    for (i, &count) in counts.iter().enumerate() {
        let h = count as f32 / peak * plot_h;
        let _ = writeln!(
            out,
            r##"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="#4c72b0"><title>{}</title></rect>"##,
            MARGIN + i as f32 * bar_w,
            HEIGHT - MARGIN - h,
            (bar_w - 1.0).max(0.5),
            h,
            count
        );
    }
    let _ = writeln!(
        out,
        r#"<line x1="{m}" y1="{y}" x2="{x2}" y2="{y}" stroke="black"/>"#,
        m = MARGIN,
        y = HEIGHT - MARGIN,
        x2 = WIDTH - MARGIN
    );
    let _ = writeln!(
        out,
        r#"<text x="{}" y="{}" font-family="monospace" font-size="10">{}</text>"#,
        MARGIN,
        HEIGHT - MARGIN + 16.0,
        min
    );
    let _ = writeln!(
        out,
        r#"<text x="{}" y="{}" font-family="monospace" font-size="10" text-anchor="end">{}</text>"#,
        WIDTH - MARGIN,
        HEIGHT - MARGIN + 16.0,
        max
    );
    out.push_str("</svg>\n");
    out
}

/// View a tensor as a `[rows, cols]` matrix, block-averaged to at most
/// `max_cells` per side
pub fn downsample(tensor: &Tensor, max_cells: usize) -> (Vec<f32>, usize, usize) {
    let cols = tensor.shape.last().copied().unwrap_or(1).max(1);
    let rows = (tensor.numel() / cols).max(1);
    let out_rows = rows.min(max_cells);
    let out_cols = cols.min(max_cells);

    let mut sums = vec![0.0f64; out_rows * out_cols];
    let mut counts = vec![0u32; out_rows * out_cols];
    for (idx, &v) in tensor.data.iter().enumerate() {
        let r = idx / cols * out_rows / rows;
        let c = idx % cols * out_cols / cols;
        sums[r * out_cols + c] += v as f64;
        counts[r * out_cols + c] += 1;
    }
    let cells = sums
        .iter()
        .zip(&counts)
        .map(|(&s, &n)| if n > 0 { (s / n as f64) as f32 } else { 0.0 })
        .collect();
    (cells, out_rows, out_cols)
}

fn render_grid(tensor: &Tensor, name: &str) -> String {
    let (cells, rows, cols) = downsample(tensor, MAX_GRID_CELLS);
    let (min, max) = cells
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = if max > min { max - min } else { 1.0 };

    let cell = ((WIDTH - 2.0 * MARGIN) / cols as f32)
        .min((HEIGHT - 2.0 * MARGIN) / rows as f32)
        .max(1.0);
    let width = 2.0 * MARGIN + cell * cols as f32;
    let height = 2.0 * MARGIN + cell * rows as f32;

    let mut out = String::new();
    svg_open(&mut out, width, height);
    let _ = writeln!(
        out,
        r#"<text x="{}" y="20" font-family="monospace" font-size="11" text-anchor="middle">{} {:?}</text>"#,
        width / 2.0,
        escape(name),
        tensor.shape
    );
    for r in 0..rows {
        for c in 0..cols {
            let v = cells[r * cols + c];
            let t = if v.is_finite() { (v - min) / span } else { 0.0 };
            let _ = writeln!(
                out,
                r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"/>"#,
                MARGIN + c as f32 * cell,
                MARGIN + r as f32 * cell,
                cell,
                cell,
                color(t)
            );
        }
    }
    out.push_str("</svg>\n");
    out
}

/// Dark blue → yellow ramp for `t` in [0, 1]
fn color(t: f32) -> String {
    let t = t.clamp(0.0, 1.0);
    let r = (68.0 + t * (253.0 - 68.0)) as u8;
    let g = (1.0 + t * (231.0 - 1.0)) as u8;
    let b = (84.0 + t * (37.0 - 84.0)) as u8;
    format!("#{r:02x}{g:02x}{b:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bins() {
        let (counts, min, max) = histogram(&[0.0, 0.0, 1.0, 2.0, f32::NAN], 2);
        assert_eq!((min, max), (0.0, 2.0));
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn test_histogram_constant_values() {
        let (counts, _, _) = histogram(&[3.0; 5], 4);
        assert_eq!(counts, vec![5, 0, 0, 0]);
    }

    #[test]
    fn test_downsample_caps_size() {
        let t = Tensor::full(vec![2, 600, 300], 1.0);
        let (cells, rows, cols) = downsample(&t, MAX_GRID_CELLS);
        assert_eq!((rows, cols), (256, 256));
        assert!(cells.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_downsample_small_is_identity() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let (cells, rows, cols) = downsample(&t, MAX_GRID_CELLS);
        assert_eq!((rows, cols), (2, 3));
        assert_eq!(cells, t.data);
    }

    #[test]
    fn test_files_named_after_module() {
        let dir = tempfile::tempdir().unwrap();
        let plotter = Plotter::new(dir.path().join("plots"), true);
        let t = Tensor::new(vec![0.0, 1.0, 2.0, 3.0], vec![2, 2]);

        let grid = plotter.grid(&t, "model.decoder.layers.0.fc1").unwrap().unwrap();
        assert_eq!(grid.file_name().unwrap(), "model.decoder.layers.0.fc1.grid.svg");
        let hist = plotter.hist(&t.data, "a/b", "x < y").unwrap().unwrap();
        assert_eq!(hist.file_name().unwrap(), "a_b.hist.svg");

        let svg = fs::read_to_string(hist).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("x &lt; y"));
    }

    #[test]
    fn test_disabled_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let plotter = Plotter::new(dir.path().join("plots"), false);
        assert!(plotter.hist(&[1.0], "x", "t").unwrap().is_none());
        assert!(!dir.path().join("plots").exists());
    }
}
