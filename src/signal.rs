//! Slope primitives shared by detection, metrics and re-anchoring

/// Ordinary least-squares slope of `y` against `x`.
///
/// Returns `None` for fewer than two points or when all `x` coincide.
pub fn linear_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    // Centered sums; raw sums lose precision at large session offsets
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for &(x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }

    if sxx < 1e-12 {
        return None;
    }

    Some(sxy / sxx)
}

/// Slope at every sample, fitted over a centered window of `window` samples
/// clipped to the series bounds. Units are bpm per second.
pub fn smoothed_slopes(offsets: &[f64], values: &[f64], window: usize) -> Vec<f64> {
    let n = offsets.len().min(values.len());
    let half = window.max(2) / 2;
    let mut slopes = Vec::with_capacity(n);
    let mut buffer = Vec::with_capacity(half * 2 + 1);

    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half).min(n - 1);
        buffer.clear();
        buffer.extend((lo..=hi).map(|j| (offsets[j], values[j])));
        slopes.push(linear_slope(&buffer).unwrap_or(0.0));
    }

    slopes
}

/// Slope over the samples whose offsets fall in `[from, to]`
pub fn slope_between(offsets: &[f64], values: &[f64], from: f64, to: f64) -> Option<f64> {
    let points: Vec<(f64, f64)> = offsets
        .iter()
        .zip(values)
        .filter(|(&t, _)| t >= from && t <= to)
        .map(|(&t, &v)| (t, v))
        .collect();
    linear_slope(&points)
}
