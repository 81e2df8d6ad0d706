//! SVG renderings of sample images and training curves.

use std::{error::Error as StdError, path::Path};

use plotters::prelude::*;

use crate::{
    config::Normalization,
    error::{Error, Result},
    mnist::{class_name, Batch},
};

type DrawResult = std::result::Result<(), Box<dyn StdError>>;

const SAMPLE_COUNT: usize = 10;

/// Draws the first ten images of `batch` on a 3×4 grid, captioned `<text>: <class>`.
pub fn plot_samples(
    path: &Path,
    batch: &Batch,
    labels: &[u8],
    text: &str,
    (height, width): (usize, usize),
    norm: &Normalization,
) -> Result<()> {
    draw_samples(path, batch, labels, text, (height, width), norm)
        .map_err(|e| Error::Plot(format!("{}: {}", path.display(), e)))
}

fn draw_samples(
    path: &Path,
    batch: &Batch,
    labels: &[u8],
    text: &str,
    (height, width): (usize, usize),
    norm: &Normalization,
) -> DrawResult {
    let root = SVGBackend::new(path, (800, 640)).into_drawing_area();
    root.fill(&WHITE)?;

    let count = batch.len().min(labels.len()).min(SAMPLE_COUNT);

    for (idx, cell) in root.split_evenly((3, 4)).iter().enumerate().take(count) {
        let mut chart = ChartBuilder::on(cell)
            .caption(format!("{}: {}", text, class_name(labels[idx])), ("sans-serif", 14))
            .margin(8)
            .build_cartesian_2d(0..width as i32, 0..height as i32)?;

        let image = batch.images.column(idx);

        chart.draw_series(
            (0..height)
                .flat_map(|y| (0..width).map(move |x| (x, y)))
                .map(|(x, y)| {
                    let level = norm.invert(image[y * width + x]).clamp(0.0, 1.0);
                    let gray = (level * 255.0).round() as u8;
                    let top = (height - y) as i32;

                    Rectangle::new(
                        [(x as i32, top - 1), (x as i32 + 1, top)],
                        RGBColor(gray, gray, gray).filled(),
                    )
                }),
        )?;
    }

    root.present()?;

    Ok(())
}

/// Overlays the train (blue) and test (red) curves against samples seen.
pub fn plot_curves(
    path: &Path,
    train: &[(usize, f32)],
    test: &[(usize, f32)],
    y_label: &str,
) -> Result<()> {
    draw_curves(path, train, test, y_label)
        .map_err(|e| Error::Plot(format!("{}: {}", path.display(), e)))
}

fn value_range(points: impl Iterator<Item = f32>) -> (f32, f32) {
    let (lo, hi) = points
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });

    if lo > hi {
        (0.0, 1.0)
    } else if hi - lo < f32::EPSILON {
        (lo - 0.5, hi + 0.5)
    } else {
        let pad = 0.05 * (hi - lo);
        (lo - pad, hi + pad)
    }
}

fn draw_curves(path: &Path, train: &[(usize, f32)], test: &[(usize, f32)], y_label: &str) -> DrawResult {
    let x_max = train
        .iter()
        .chain(test)
        .map(|p| p.0)
        .max()
        .unwrap_or(0)
        .max(1) as f32;
    let (y_min, y_max) = value_range(train.iter().chain(test).map(|p| p.1));

    let root = SVGBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0f32..x_max, y_min..y_max)?;

    chart
        .configure_mesh()
        .x_desc("number of training examples seen")
        .y_desc(y_label)
        .draw()?;

    for (points, color, name) in [(train, BLUE, "Train"), (test, RED, "Test")] {
        chart
            .draw_series(LineSeries::new(
                points.iter().map(|&(x, y)| (x as f32, y)),
                &color,
            ))?
            .label(name)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;

    Ok(())
}
