use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use tracing::{info, warn};

use crate::record::{ResponseOutput, ResponseRecord};

const CELL_W: u32 = 170;
const CELL_H: u32 = 90;
const MARGIN_LEFT: u32 = 100;
const MARGIN_TOP: u32 = 56;
const MARGIN_BOTTOM: u32 = 72;
const MARGIN_RIGHT: u32 = 110;
const COLORBAR_STEPS: u32 = 64;

/// One cell of the heatmap: an alternative token and its linear probability.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapCell {
    pub token: String,
    pub probability: f64,
}

/// Heatmap matrix for one record: rows are probability rank (0 = most likely
/// alternative), columns are token positions. Ranks missing at a position are
/// blank cells, not zero probability.
#[derive(Debug, Clone)]
pub struct HeatmapGrid {
    pub title: String,
    pub selected: Vec<String>,
    pub cells: Vec<Vec<Option<HeatmapCell>>>,
}

impl HeatmapGrid {
    /// Builds the grid from a record, or `None` when the record carries no
    /// usable logprob content.
    pub fn from_record(record: &ResponseRecord) -> Option<Self> {
        let ResponseOutput::LogProbs(logprobs) = &record.output else {
            return None;
        };
        if logprobs.content.is_empty() {
            return None;
        }
        let cols = logprobs.content.len();
        let rows = logprobs
            .content
            .iter()
            .map(|position| position.top_logprobs.len())
            .max()
            .unwrap_or(0);
        if rows == 0 {
            return None;
        }

        let mut cells = vec![vec![None; cols]; rows];
        for (col, position) in logprobs.content.iter().enumerate() {
            for (row, alternative) in position.top_logprobs.iter().enumerate() {
                cells[row][col] = Some(HeatmapCell {
                    token: alternative.token.clone(),
                    probability: alternative.logprob.exp(),
                });
            }
        }
        let selected = logprobs
            .content
            .iter()
            .map(|position| visible_whitespace(&position.token))
            .collect();

        Some(Self {
            title: grid_title(record),
            selected,
            cells,
        })
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells.first().map(Vec::len).unwrap_or(0)
    }
}

fn grid_title(record: &ResponseRecord) -> String {
    let mut title = format!("{} | {}", record.prompt_id, record.model);
    if !record.variables.is_empty() {
        let pairs: Vec<String> = record
            .variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        title.push_str(" | ");
        title.push_str(&pairs.join(", "));
    }
    title
}

/// Makes whitespace characters visible in token labels.
pub fn visible_whitespace(token: &str) -> String {
    token
        .replace(' ', "·")
        .replace('\n', "↵")
        .replace('\t', "→")
}

/// Probability color on a fixed, fully saturated [0, 1] red→yellow→green
/// ramp, so heatmaps stay comparable across records and runs.
pub fn probability_color(probability: f64) -> RGBColor {
    let t = probability.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        (1.0, t * 2.0, 0.0)
    } else {
        (2.0 - t * 2.0, 1.0 - 0.2 * (t * 2.0 - 1.0), 0.0)
    };
    RGBColor((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

fn luminance(color: RGBColor) -> f64 {
    let RGBColor(r, g, b) = color;
    (0.299 * f64::from(r) + 0.587 * f64::from(g) + 0.114 * f64::from(b)) / 255.0
}

/// Renders one heatmap image per logprob-bearing record. Records without
/// logprob data are skipped with a diagnostic; multiple qualifying records get
/// distinct `_<index>` suffixes on the base output path.
pub fn render(records: &[ResponseRecord], base_output: &Path) -> Result<Vec<PathBuf>> {
    let grids: Vec<HeatmapGrid> = records
        .iter()
        .filter_map(|record| {
            let grid = HeatmapGrid::from_record(record);
            if grid.is_none() {
                warn!(prompt_id = %record.prompt_id, "Skipping record without logprob data");
            }
            grid
        })
        .collect();
    if grids.is_empty() {
        bail!("No records with logprob data found");
    }

    let many = grids.len() > 1;
    let mut written = Vec::with_capacity(grids.len());
    for (index, grid) in grids.iter().enumerate() {
        let path = suffixed(base_output, index, many);
        render_grid(grid, &path)
            .map_err(|err| anyhow!("Failed to render heatmap {}: {err}", path.display()))?;
        info!(path = %path.display(), rows = grid.rows(), cols = grid.cols(), "Saved heatmap");
        written.push(path);
    }
    Ok(written)
}

/// Appends `_<index>` before the extension when several images share one base
/// path, so none overwrite each other.
fn suffixed(base: &Path, index: usize, many: bool) -> PathBuf {
    if !many {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "heatmap".to_string());
    let extension = base
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    base.with_file_name(format!("{stem}_{index}.{extension}"))
}

fn render_grid(grid: &HeatmapGrid, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cols = grid.cols() as u32;
    let rows = grid.rows() as u32;
    let width = MARGIN_LEFT + cols * CELL_W + MARGIN_RIGHT;
    let height = MARGIN_TOP + rows * CELL_H + MARGIN_BOTTOM;

    let root = BitMapBackend::new(path, (width, height)).into_drawing_area();
    root.fill(&WHITE)?;

    let title_style = ("sans-serif", 22)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Center));
    root.draw(&Text::new(
        grid.title.clone(),
        ((width / 2) as i32, (MARGIN_TOP / 2) as i32),
        title_style,
    ))?;

    let label_style = ("sans-serif", 16)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Center));
    let rank_style = ("sans-serif", 16)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Right, VPos::Center));

    for (row_idx, row) in grid.cells.iter().enumerate() {
        let y0 = (MARGIN_TOP + row_idx as u32 * CELL_H) as i32;
        let y1 = y0 + CELL_H as i32;
        let cy = (y0 + y1) / 2;

        root.draw(&Text::new(
            format!("rank {}", row_idx + 1),
            ((MARGIN_LEFT - 10) as i32, cy),
            rank_style.clone(),
        ))?;

        for (col_idx, cell) in row.iter().enumerate() {
            let x0 = (MARGIN_LEFT + col_idx as u32 * CELL_W) as i32;
            let x1 = x0 + CELL_W as i32;
            let cx = (x0 + x1) / 2;

            if let Some(cell) = cell {
                let fill = probability_color(cell.probability);
                root.draw(&Rectangle::new([(x0, y0), (x1, y1)], fill.filled()))?;
                let text_color = if luminance(fill) > 0.45 { BLACK } else { WHITE };
                let cell_style = ("sans-serif", 17)
                    .into_font()
                    .color(&text_color)
                    .pos(Pos::new(HPos::Center, VPos::Center));
                root.draw(&Text::new(
                    visible_whitespace(&cell.token),
                    (cx, cy - 12),
                    cell_style.clone(),
                ))?;
                root.draw(&Text::new(
                    format!("{:.3}", cell.probability),
                    (cx, cy + 14),
                    cell_style,
                ))?;
            }
            root.draw(&Rectangle::new(
                [(x0, y0), (x1, y1)],
                BLACK.mix(0.4).stroke_width(1),
            ))?;
        }
    }

    for (col_idx, token) in grid.selected.iter().enumerate() {
        let cx = (MARGIN_LEFT + col_idx as u32 * CELL_W + CELL_W / 2) as i32;
        let y = (MARGIN_TOP + rows * CELL_H + 24) as i32;
        root.draw(&Text::new(token.clone(), (cx, y), label_style.clone()))?;
    }
    root.draw(&Text::new(
        "selected token at each position".to_string(),
        ((MARGIN_LEFT + cols * CELL_W / 2) as i32, (height - 20) as i32),
        label_style.clone(),
    ))?;

    draw_colorbar(&root, width, rows)?;

    root.present()?;
    Ok(())
}

/// Fixed [0, 1] reference scale along the right edge.
fn draw_colorbar(
    root: &DrawingArea<BitMapBackend<'_>, plotters::coord::Shift>,
    width: u32,
    rows: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let bar_x0 = (width - MARGIN_RIGHT + 30) as i32;
    let bar_x1 = bar_x0 + 22;
    let bar_top = MARGIN_TOP as i32;
    let bar_height = (rows * CELL_H) as i32;
    let step = bar_height as f64 / f64::from(COLORBAR_STEPS);

    for index in 0..COLORBAR_STEPS {
        let value = 1.0 - f64::from(index) / f64::from(COLORBAR_STEPS - 1);
        let y0 = bar_top + (f64::from(index) * step) as i32;
        let y1 = bar_top + (f64::from(index + 1) * step) as i32;
        root.draw(&Rectangle::new(
            [(bar_x0, y0), (bar_x1, y1)],
            probability_color(value).filled(),
        ))?;
    }

    let tick_style = ("sans-serif", 14)
        .into_font()
        .color(&BLACK)
        .pos(Pos::new(HPos::Left, VPos::Center));
    for (value, label) in [(1.0, "1.0"), (0.5, "0.5"), (0.0, "0.0")] {
        let y = bar_top + ((1.0 - value) * f64::from(bar_height)) as i32;
        root.draw(&Text::new(
            label.to_string(),
            (bar_x1 + 6, y.clamp(bar_top, bar_top + bar_height)),
            tick_style.clone(),
        ))?;
    }
    Ok(())
}
