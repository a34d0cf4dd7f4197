//! Shared numerical helpers.

pub const EPSILON: f64 = 1e-10;

/// Response code marking a missing observation.
pub const MISSING: i32 = -1;

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Numerically stable softmax, written into `out`.
#[inline]
pub fn softmax_into(logits: &[f64], out: &mut [f64]) {
    let log_denom = logsumexp(logits);
    for (o, &z) in out.iter_mut().zip(logits) {
        *o = (z - log_denom).exp();
    }
}

/// Draw a category from (possibly unnormalized) weights with a uniform `u`.
///
/// Falls back to the last positive-weight category when rounding leaves `u`
/// above the cumulative sum.
pub fn sample_category(weights: &[f64], u: f64) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || !total.is_finite() {
        return None;
    }
    if total <= EPSILON {
        let idx = ((u * weights.len() as f64) as usize).min(weights.len() - 1);
        return Some(idx);
    }
    let mut cumsum = 0.0;
    let mut last = None;
    for (k, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        cumsum += w / total;
        last = Some(k);
        if u < cumsum {
            return Some(k);
        }
    }
    last
}
