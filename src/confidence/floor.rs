/// Effective-N thresholds and the confidence cap they allow. Monotone in both columns.
pub const CONFIDENCE_FLOOR_TABLE: [(f64, f64); 7] = [
    (0.0, 0.35),
    (3.0, 0.45),
    (5.0, 0.55),
    (10.0, 0.70),
    (15.0, 0.80),
    (20.0, 0.90),
    (25.0, 1.00),
];

/// Maximum confidence permitted for a given effective sample size.
pub fn confidence_floor(effective_n: f64) -> f64 {
    if !effective_n.is_finite() || effective_n <= 0.0 {
        return CONFIDENCE_FLOOR_TABLE[0].1;
    }
    CONFIDENCE_FLOOR_TABLE
        .iter()
        .rev()
        .find(|(n_min, _)| effective_n >= *n_min)
        .map(|(_, cap)| *cap)
        .unwrap_or(CONFIDENCE_FLOOR_TABLE[0].1)
}
