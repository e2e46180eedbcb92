//! # Comparison Plots
//!
//! Renders a prediction raster against a reference raster around a city:
//! three PNG figures per variable (prediction, reference, and the signed
//! difference `reference - prediction`).
//!
//! Prediction and reference share one [`ColorScale`] spanning both fields so
//! their colours are directly comparable; the difference gets its own. Colour
//! bar ticks fall on multiples of ten for the pair and on six evenly spaced
//! values for the difference. Variables whose name contains the configured
//! temperature marker get `°C` tick labels.
//!
//! ## Figure layout
//!
//! ```text
//! +-----------------------------------------+
//! |                 title                   |
//! |      +----------------------+  +--+     |
//! |  lat |        field         |  |  | ticks
//! |      +----------------------+  +--+     |
//! |              longitude                  |
//! +-----------------------------------------+
//! ```

use crate::config::{PlotConfig, PlotVariable};
use crate::geocode::{GeocodeError, Geocoder};
use crate::raster::{GeoTiffRaster, RasterError};
use crate::window::{BoundingBox, WindowError, window_for_bbox};
use chrono::NaiveDateTime;
use image::{Rgba, RgbaImage, imageops};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};
use rusttype::{Font, Scale, point};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error(transparent)]
    Geocode(#[from] GeocodeError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("Failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Failed to create directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid date string '{0}', expected DD_MM_YY_HH")]
    Date(String),

    #[error("Field '{0}' has no finite values")]
    EmptyField(String),

    #[error("'{variable}': prediction window {prediction:?} and reference window {reference:?} differ in shape")]
    ShapeMismatch {
        variable: String,
        prediction: (usize, usize),
        reference: (usize, usize),
    },
}

pub type PlotResult<T> = Result<T, PlotError>;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const NAN_COLOR: Rgba<u8> = Rgba([200, 200, 200, 255]);

/// Samples of matplotlib's `plasma`, evenly spaced over [0, 1].
const PLASMA: [[u8; 3]; 9] = [
    [13, 8, 135],
    [75, 3, 161],
    [125, 3, 168],
    [168, 34, 150],
    [203, 70, 121],
    [229, 107, 93],
    [248, 148, 65],
    [253, 195, 40],
    [240, 249, 33],
];

/// Plasma colour at `t` in [0, 1]; values outside are clamped.
pub fn plasma(t: f32) -> Rgba<u8> {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let pos = t * (PLASMA.len() - 1) as f32;
    let lower = (pos.floor() as usize).min(PLASMA.len() - 2);
    let frac = pos - lower as f32;
    let (a, b) = (PLASMA[lower], PLASMA[lower + 1]);
    let mix = |i: usize| (a[i] as f32 + frac * (b[i] as f32 - a[i] as f32)).round() as u8;
    Rgba([mix(0), mix(1), mix(2), 255])
}

/// Value range mapped onto the colormap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorScale {
    pub vmin: f64,
    pub vmax: f64,
}

impl ColorScale {
    /// Range of the finite values of one field.
    pub fn of(field: &ArrayView2<f32>) -> Option<Self> {
        field
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f32, f32)>, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
            .map(|(lo, hi)| Self {
                vmin: lo as f64,
                vmax: hi as f64,
            })
    }

    /// Range over the union of two fields.
    pub fn shared(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Option<Self> {
        match (Self::of(a), Self::of(b)) {
            (Some(x), Some(y)) => Some(Self {
                vmin: x.vmin.min(y.vmin),
                vmax: x.vmax.max(y.vmax),
            }),
            (x, y) => x.or(y),
        }
    }

    /// Position of `value` in [0, 1]; a degenerate range maps to the middle.
    pub fn normalize(&self, value: f32) -> f32 {
        let span = self.vmax - self.vmin;
        if span <= 0.0 {
            return 0.5;
        }
        ((value as f64 - self.vmin) / span).clamp(0.0, 1.0) as f32
    }

    /// Multiples of ten from `ceil(vmin / 10) * 10` up to, not including, `vmax`.
    pub fn decade_ticks(&self) -> Vec<f64> {
        let start = (self.vmin / 10.0).ceil() * 10.0;
        (0..)
            .map(|k| start + 10.0 * k as f64)
            .take_while(|t| *t < self.vmax)
            .collect()
    }

    /// `count` evenly spaced values from `vmin` to `vmax` inclusive.
    pub fn even_ticks(&self, count: usize) -> Vec<f64> {
        match count {
            0 => Vec::new(),
            1 => vec![self.vmin],
            n => (0..n)
                .map(|k| self.vmin + (self.vmax - self.vmin) * k as f64 / (n - 1) as f64)
                .collect(),
        }
    }
}

pub fn is_temperature(variable: &str, marker: &str) -> bool {
    !marker.is_empty() && variable.contains(marker)
}

/// Colour bar tick labels: `°C` suffixed for temperature variables.
pub fn tick_labels(ticks: &[f64], variable: &str, marker: &str) -> Vec<String> {
    if is_temperature(variable, marker) {
        ticks.iter().map(|t| format!("{:.1}°C", t)).collect()
    } else {
        ticks.iter().map(|t| format_tick(*t)).collect()
    }
}

fn format_tick(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e9 {
        format!("{:.0}", value)
    } else {
        let text = format!("{:.2}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Round-number axis ticks inside `[min, max]`, about `target` of them.
pub fn nice_ticks(min: f64, max: f64, target: usize) -> Vec<f64> {
    if !(max > min) || target == 0 {
        return Vec::new();
    }
    let raw = (max - min) / target as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    let step = [1.0, 2.0, 2.5, 5.0, 10.0]
        .iter()
        .map(|m| m * magnitude)
        .find(|s| *s >= raw)
        .unwrap_or(10.0 * magnitude);
    let first = (min / step).ceil() * step;
    (0..)
        .map(|k| first + step * k as f64)
        .take_while(|t| *t <= max + step * 1e-9)
        .collect()
}

/// `DD_MM_YY_HH` as e.g. `11th June 2022 12:00 PM`.
pub fn format_date_label(date_str: &str) -> PlotResult<String> {
    let date = NaiveDateTime::parse_from_str(&format!("{}_00", date_str), "%d_%m_%y_%H_%M")
        .map_err(|_| PlotError::Date(date_str.to_string()))?;
    Ok(date.format("%dth %B %Y %I:%M %p").to_string())
}

/// `{dir}/{city}_{source}_{date}_{variable}.png`
pub fn output_path(dir: &Path, city: &str, source: &str, date: &str, variable: &str) -> PathBuf {
    dir.join(format!("{}_{}_{}_{}.png", city, source, date, variable))
}

/// Canvas size and the font used for all text.
pub struct FigureStyle {
    pub size: u32,
    font: Option<Font<'static>>,
}

impl FigureStyle {
    pub fn new(size: u32, font: Option<Font<'static>>) -> Self {
        Self { size, font }
    }

    /// Loads a TrueType font; figures are drawn without text if that fails.
    pub fn load(font_path: &str, size: u32) -> Self {
        let font = match fs::read(font_path) {
            Ok(bytes) => match Font::try_from_vec(bytes) {
                Some(font) => Some(font),
                None => {
                    warn!("{} is not a usable TrueType font, rendering without text", font_path);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to load font {}: {}, rendering without text", font_path, e);
                None
            }
        };
        Self::new(size, font)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    fn px(&self, at_thousand: f32) -> f32 {
        at_thousand * self.size as f32 / 1000.0
    }
}

/// Everything drawn in one figure.
pub struct FieldFigure<'a> {
    pub title: String,
    pub field: ArrayView2<'a, f32>,
    pub scale: ColorScale,
    pub ticks: Vec<f64>,
    pub tick_labels: Vec<String>,
    /// `[lon_min, lon_max, lat_min, lat_max]`
    pub extent: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Layout {
    pub plot: Rect,
    pub bar: Rect,
}

/// Plot area fitted to the geographic aspect ratio, colour bar to its right.
pub(crate) fn layout(style: &FigureStyle, extent: [f64; 4]) -> Layout {
    let (left, top) = (style.px(120.0), style.px(90.0));
    let max_w = style.size as f32 - left - style.px(170.0);
    let max_h = style.size as f32 - top - style.px(110.0);

    let aspect = ((extent[1] - extent[0]) / (extent[3] - extent[2])).abs() as f32;
    let (w, h) = if aspect.is_finite() && aspect > 0.0 {
        if max_w / max_h > aspect {
            (max_h * aspect, max_h)
        } else {
            (max_w, max_w / aspect)
        }
    } else {
        (max_w, max_h)
    };
    let (w, h) = (w.max(1.0) as u32, h.max(1.0) as u32);

    let plot = Rect::at(left as i32, top as i32).of_size(w, h);
    let bar = Rect::at(plot.right() + style.px(20.0) as i32, top as i32)
        .of_size(style.px(30.0).max(1.0) as u32, h);
    Layout { plot, bar }
}

pub fn render_field(figure: &FieldFigure, style: &FigureStyle) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(style.size, style.size, WHITE);
    let Layout { plot, bar } = layout(style, figure.extent);

    draw_field(&mut img, plot, &figure.field, &figure.scale);
    draw_hollow_rect_mut(&mut img, plot, BLACK);
    draw_colorbar(&mut img, bar);
    draw_hollow_rect_mut(&mut img, bar, BLACK);

    let tick_len = style.px(8.0);
    let [lon_min, lon_max, lat_min, lat_max] = figure.extent;
    let x_ticks: Vec<(f32, String)> = nice_ticks(lon_min, lon_max, 5)
        .into_iter()
        .map(|t| {
            let x = plot.left() as f32 + ((t - lon_min) / (lon_max - lon_min)) as f32 * plot.width() as f32;
            (x, format_tick(t))
        })
        .collect();
    let y_ticks: Vec<(f32, String)> = nice_ticks(lat_min, lat_max, 5)
        .into_iter()
        .map(|t| {
            let y = plot.top() as f32 + ((lat_max - t) / (lat_max - lat_min)) as f32 * plot.height() as f32;
            (y, format_tick(t))
        })
        .collect();
    let bar_ticks: Vec<(f32, &String)> = figure
        .ticks
        .iter()
        .zip(&figure.tick_labels)
        .filter(|(t, _)| **t >= figure.scale.vmin && **t <= figure.scale.vmax)
        .map(|(t, label)| {
            let y = bar.bottom() as f32 - figure.scale.normalize(*t as f32) * bar.height() as f32;
            (y, label)
        })
        .collect();

    let bottom = plot.bottom() as f32;
    for (x, _) in &x_ticks {
        draw_line_segment_mut(&mut img, (*x, bottom), (*x, bottom + tick_len), BLACK);
    }
    let left = plot.left() as f32;
    for (y, _) in &y_ticks {
        draw_line_segment_mut(&mut img, (left - tick_len, *y), (left, *y), BLACK);
    }
    let bar_right = bar.right() as f32;
    for (y, _) in &bar_ticks {
        draw_line_segment_mut(&mut img, (bar_right, *y), (bar_right + tick_len, *y), BLACK);
    }

    let Some(font) = style.font.as_ref() else {
        return img;
    };
    let tick_size = style.px(19.0);
    let label_size = style.px(25.0);

    let center_x = plot.left() + plot.width() as i32 / 2;
    draw_text(&mut img, font, &figure.title, center_x, style.px(30.0) as i32, label_size, Anchor::Center);

    for (x, label) in &x_ticks {
        draw_text(&mut img, font, label, *x as i32, (bottom + tick_len * 1.5) as i32, tick_size, Anchor::Center);
    }
    draw_text(
        &mut img,
        font,
        "Longitude",
        center_x,
        (bottom + tick_len * 2.0 + tick_size * 1.4) as i32,
        label_size,
        Anchor::Center,
    );

    for (y, label) in &y_ticks {
        let x = (left - tick_len * 1.5) as i32;
        draw_text(&mut img, font, label, x, (*y - tick_size / 2.0) as i32, tick_size, Anchor::Right);
    }
    draw_vertical_text(
        &mut img,
        font,
        "Latitude",
        style.px(30.0) as i32,
        plot.top() + plot.height() as i32 / 2,
        label_size,
    );

    for (y, label) in &bar_ticks {
        let x = (bar_right + tick_len * 1.5) as i32;
        draw_text(&mut img, font, label, x, (*y - tick_size / 2.0) as i32, tick_size, Anchor::Left);
    }

    img
}

/// Nearest-neighbour resampling of `field` into `area`, row 0 at the top.
fn draw_field(img: &mut RgbaImage, area: Rect, field: &ArrayView2<f32>, scale: &ColorScale) {
    let (rows, cols) = field.dim();
    if rows == 0 || cols == 0 {
        return;
    }
    let (w, h) = (area.width() as usize, area.height() as usize);
    for py in 0..h {
        let row = (py * rows / h).min(rows - 1);
        for px in 0..w {
            let col = (px * cols / w).min(cols - 1);
            let value = field[[row, col]];
            let color = if value.is_finite() {
                plasma(scale.normalize(value))
            } else {
                NAN_COLOR
            };
            let (x, y) = (area.left() + px as i32, area.top() + py as i32);
            if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

/// Vertical gradient, maximum at the top.
fn draw_colorbar(img: &mut RgbaImage, area: Rect) {
    let h = area.height().max(1);
    for py in 0..h {
        let t = 1.0 - py as f32 / (h - 1).max(1) as f32;
        let color = plasma(t);
        for px in 0..area.width() {
            let (x, y) = (area.left() + px as i32, area.top() + py as i32);
            if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
                img.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Anchor {
    Left,
    Center,
    Right,
}

fn text_width(font: &Font, scale: Scale, text: &str) -> f32 {
    font.layout(text, scale, point(0.0, 0.0))
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .fold(0.0, f32::max)
}

fn draw_text(img: &mut RgbaImage, font: &Font, text: &str, x: i32, y: i32, size: f32, anchor: Anchor) {
    let scale = Scale::uniform(size);
    let width = text_width(font, scale, text) as i32;
    let x = match anchor {
        Anchor::Left => x,
        Anchor::Center => x - width / 2,
        Anchor::Right => x - width,
    };
    draw_text_mut(img, BLACK, x, y, scale, font, text);
}

/// Text rotated a quarter turn counter-clockwise, centred on `(cx, cy)`.
fn draw_vertical_text(img: &mut RgbaImage, font: &Font, text: &str, cx: i32, cy: i32, size: f32) {
    let scale = Scale::uniform(size);
    let w = (text_width(font, scale, text).ceil() as u32).max(1);
    let h = (size * 1.3).ceil() as u32;
    let mut label = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 0]));
    draw_text_mut(&mut label, BLACK, 0, 0, scale, font, text);
    let rotated = imageops::rotate270(&label);
    imageops::overlay(img, &rotated, (cx - h as i32 / 2) as i64, (cy - w as i32 / 2) as i64);
}

fn save(img: &RgbaImage, path: &Path) -> PlotResult<()> {
    img.save(path)?;
    info!("Saved {}", path.display());
    Ok(())
}

/// Full comparison flow for every configured variable; returns the written paths.
pub async fn run_comparison(config: &PlotConfig, geocoder: &dyn Geocoder) -> PlotResult<Vec<PathBuf>> {
    let location = geocoder.locate(&config.city).await?;
    let bbox = BoundingBox::around(location.latitude, location.longitude, &config.offsets);
    info!("Latitude range: {} to {}", bbox.lat_min, bbox.lat_max);
    info!("Longitude range: {} to {}", bbox.lon_min, bbox.lon_max);

    let date_label = format_date_label(&config.date_str)?;

    let prediction = GeoTiffRaster::open(config.prediction_raster())?;
    let reference = GeoTiffRaster::open(config.reference_raster())?;
    let prediction_window = window_for_bbox(prediction.transform(), &bbox)?;
    let reference_window = window_for_bbox(reference.transform(), &bbox)?;
    info!(
        "{}: rows {} to {}, cols {} to {}",
        config.prediction_label,
        prediction_window.row_off,
        prediction_window.row_off + prediction_window.height,
        prediction_window.col_off,
        prediction_window.col_off + prediction_window.width
    );
    info!(
        "{}: rows {} to {}, cols {} to {}",
        config.reference_label,
        reference_window.row_off,
        reference_window.row_off + reference_window.height,
        reference_window.col_off,
        reference_window.col_off + reference_window.width
    );

    let plots_dir = crate::config::expand_home(&config.plots_dir);
    fs::create_dir_all(&plots_dir).map_err(|source| PlotError::Io {
        path: plots_dir.clone(),
        source,
    })?;
    let style = FigureStyle::load(&config.font_path, config.figure_size);

    let mut written = Vec::new();
    for variable in &config.variables {
        let predicted = prediction.read_window(variable.band, &prediction_window)?;
        let observed = reference.read_window(variable.band, &reference_window)?;
        written.extend(plot_variable(
            config,
            &style,
            variable,
            &predicted,
            &observed,
            bbox.extent(),
            &date_label,
            &plots_dir,
        )?);
    }
    Ok(written)
}

/// Writes the prediction, reference and difference figures of one variable.
#[allow(clippy::too_many_arguments)]
pub fn plot_variable(
    config: &PlotConfig,
    style: &FigureStyle,
    variable: &PlotVariable,
    predicted: &Array2<f32>,
    observed: &Array2<f32>,
    extent: [f64; 4],
    date_label: &str,
    plots_dir: &Path,
) -> PlotResult<Vec<PathBuf>> {
    let name = &variable.name;
    if predicted.dim() != observed.dim() {
        return Err(PlotError::ShapeMismatch {
            variable: name.clone(),
            prediction: predicted.dim(),
            reference: observed.dim(),
        });
    }

    let shared = ColorScale::shared(&predicted.view(), &observed.view())
        .ok_or_else(|| PlotError::EmptyField(name.clone()))?;
    let shared_ticks = shared.decade_ticks();
    let shared_labels = tick_labels(&shared_ticks, name, &config.temperature_marker);
    debug!("{}: shared scale {:?}, ticks {:?}", name, shared, shared_ticks);

    let difference = observed - predicted;
    let diff_scale = ColorScale::of(&difference.view()).ok_or_else(|| PlotError::EmptyField(name.clone()))?;
    let diff_ticks = diff_scale.even_ticks(6);
    let diff_labels = tick_labels(&diff_ticks, name, &config.temperature_marker);

    let panels = [
        (&config.prediction_label, &config.prediction_title, predicted.view(), shared, &shared_ticks, &shared_labels),
        (&config.reference_label, &config.reference_title, observed.view(), shared, &shared_ticks, &shared_labels),
        (&config.difference_label, &config.difference_title, difference.view(), diff_scale, &diff_ticks, &diff_labels),
    ];

    let mut written = Vec::with_capacity(panels.len());
    for (label, title, field, scale, ticks, labels) in panels {
        let figure = FieldFigure {
            title: format!("{} {} {}", name, title, date_label),
            field,
            scale,
            ticks: ticks.clone(),
            tick_labels: labels.clone(),
            extent,
        };
        let path = output_path(plots_dir, &config.city, label, &config.date_str, name);
        save(&render_field(&figure, style), &path)?;
        written.push(path);
    }
    Ok(written)
}
