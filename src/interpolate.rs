//! Linear gap filling for regular hourly series.

/// Fill interior runs of at most `limit` consecutive missing values by
/// linear interpolation between the neighbouring known values.
///
/// Runs longer than `limit` are left untouched, as are missing values before
/// the first or after the last known value. Samples are assumed to be evenly
/// spaced.
pub fn fill_gaps(series: &mut [Option<f64>], limit: usize) {
    if limit == 0 {
        return;
    }

    let mut prev_known: Option<usize> = None;

    for i in 0..series.len() {
        let Some(right) = series[i] else {
            continue;
        };

        if let Some(p) = prev_known {
            let gap = i - p - 1;
            if gap > 0 && gap <= limit {
                let left = series[p].unwrap_or(right);
                let step = (right - left) / (gap + 1) as f64;
                for (k, slot) in series[p + 1..i].iter_mut().enumerate() {
                    *slot = Some(left + step * (k + 1) as f64);
                }
            }
        }
        prev_known = Some(i);
    }
}
