//! Wind vector decomposition.
//!
//! Directions follow the meteorological convention: they record where the
//! wind blows *from*, measured clockwise from north in degrees.

/// Split a wind sample into eastward (u) and northward (v) components.
///
/// The magnitude of `(u, v)` equals `speed`. Directions do not need to be
/// normalized to `[0, 360)`.
pub fn wind_components(speed: f64, direction_deg: f64) -> (f64, f64) {
    let rad = direction_deg.to_radians();
    (-speed * rad.sin(), -speed * rad.cos())
}

/// Components for a sample whose speed or direction may be missing.
///
/// A calm sample (speed 0) is the zero vector whatever its direction, even a
/// missing one.
pub fn sample_components(speed: Option<f64>, direction_deg: Option<f64>) -> Option<(f64, f64)> {
    match (speed, direction_deg) {
        (Some(s), _) if s == 0.0 => Some((0.0, 0.0)),
        (Some(s), Some(d)) => Some(wind_components(s, d)),
        _ => None,
    }
}

/// Convert a (possibly averaged) vector back to speed and direction.
///
/// The direction is normalized to `[0, 360)`. A zero vector reports 0°.
pub fn vector_to_direction(u: f64, v: f64) -> (f64, f64) {
    let speed = u.hypot(v);
    if speed == 0.0 {
        return (0.0, 0.0);
    }
    let direction = (-u).atan2(-v).to_degrees().rem_euclid(360.0);
    (speed, direction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_north_wind_blows_south() {
        let (u, v) = wind_components(10.0, 0.0);
        assert!(close(u, 0.0, 1e-9), "u = {}", u);
        assert!(close(v, -10.0, 1e-9), "v = {}", v);
    }

    #[test]
    fn test_east_wind_blows_west() {
        let (u, v) = wind_components(5.0, 90.0);
        assert!(close(u, -5.0, 1e-9));
        assert!(close(v, 0.0, 1e-9));
    }

    #[test]
    fn test_magnitude_preserved() {
        for dir in [0.0, 17.0, 135.0, 222.5, 359.0, 725.0, -45.0] {
            let (u, v) = wind_components(7.3, dir);
            assert!(close(u.hypot(v), 7.3, 1e-9), "dir {}", dir);
        }
    }

    #[test]
    fn test_unnormalized_direction_matches_normalized() {
        let a = wind_components(4.0, 370.0);
        let b = wind_components(4.0, 10.0);
        assert!(close(a.0, b.0, 1e-9));
        assert!(close(a.1, b.1, 1e-9));
    }

    #[test]
    fn test_calm_is_zero_vector() {
        assert_eq!(sample_components(Some(0.0), Some(123.0)), Some((0.0, 0.0)));
        assert_eq!(sample_components(Some(0.0), None), Some((0.0, 0.0)));
        assert_eq!(sample_components(Some(3.0), None), None);
        assert_eq!(sample_components(None, Some(90.0)), None);
    }

    #[test]
    fn test_vector_to_direction_inverts_components() {
        for dir in [0.0, 10.0, 90.0, 180.0, 270.0, 350.0] {
            let (u, v) = wind_components(6.0, dir);
            let (speed, back) = vector_to_direction(u, v);
            assert!(close(speed, 6.0, 1e-9));
            let diff = (back - dir).rem_euclid(360.0);
            assert!(diff < 1e-6 || diff > 360.0 - 1e-6, "{} -> {}", dir, back);
        }
    }
}
