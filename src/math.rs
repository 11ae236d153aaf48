use crate::ask_tell::SamplerError;

/// Copy `values` into an immutable parameter vector of dimension `dim`.
pub fn validate_position(values: &[f64], dim: usize) -> Result<Box<[f64]>, SamplerError> {
    if values.len() != dim {
        return Err(SamplerError::DimensionMismatch {
            expected: dim,
            got: values.len(),
        });
    }
    if !values.iter().all(|x| x.is_finite()) {
        return Err(SamplerError::NonFinitePosition);
    }
    Ok(values.into())
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with `ddof` delta degrees of freedom.
pub(crate) fn variance(values: &[f64], ddof: usize) -> f64 {
    let mean = mean(values);
    let sum_sq: f64 = values.iter().map(|&x| (x - mean) * (x - mean)).sum();
    sum_sq / (values.len() - ddof) as f64
}

/// Biased autocovariance at `lag`, normalised by the chain length.
pub(crate) fn autocovariance(values: &[f64], mean: f64, lag: usize) -> f64 {
    let n = values.len();
    if lag >= n {
        return 0.;
    }
    values[..n - lag]
        .iter()
        .zip(values[lag..].iter())
        .map(|(&a, &b)| (a - mean) * (b - mean))
        .sum::<f64>()
        / n as f64
}

pub(crate) fn sort_values(values: &mut [f64]) {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
}

/// Quantile of sorted values, interpolating linearly between order
/// statistics.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = (idx.ceil() as usize).min(sorted.len() - 1);
    let frac = idx - lo as f64;
    sorted[lo] * (1. - frac) + sorted[hi] * frac
}
