//! Item response functions for the supported item types.
//!
//! Each item exposes category probability traces and their analytic
//! derivatives with respect to the item's parameter vector, evaluated at a
//! block of latent-trait points (one row per point).

use ndarray::{Array2, Array3, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{M2Error, Result};
use crate::utils::{sigmoid, softmax_into};

/// Closed set of item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    /// 2PL-4PL: `[a_1..a_d, d, g, u]`
    Dichotomous,
    /// Samejima graded response: `[a_1..a_d, d_1..d_{K-1}]`
    Graded,
    /// Generalized partial credit: `[a_1..a_d, ak_0..ak_{K-1}, d_0..d_{K-1}]`
    Gpcm,
    /// Nominal response, same layout as `Gpcm`
    Nominal,
    /// Nested logit: `[a_1..a_d, d, g, u, ak_1..ak_{K-1}, dk_1..dk_{K-1}]`
    NestedLogit { key: usize },
    /// Ideal point (unfolding): `[a_1..a_d, d]`
    IdealPoint,
    /// Partially compensatory: `[a_1..a_d, d_1..d_d, g, u]`
    PartiallyCompensatory,
}

impl ItemKind {
    /// Parse the item-type tag used by the Python front end.
    pub fn from_tag(tag: &str, key: Option<usize>) -> Result<Self> {
        let kind = match tag {
            "dich" | "2PL" | "3PL" | "3PLu" | "4PL" | "Rasch" => ItemKind::Dichotomous,
            "graded" | "grsm" => ItemKind::Graded,
            "gpcm" | "gpcmIRT" | "Rasch_poly" => ItemKind::Gpcm,
            "nominal" => ItemKind::Nominal,
            "nestlogit" | "2PLNRM" | "3PLNRM" | "4PLNRM" => {
                let key = key.ok_or_else(|| {
                    M2Error::Configuration(format!("item type '{tag}' requires a key category"))
                })?;
                ItemKind::NestedLogit { key }
            }
            "ideal" => ItemKind::IdealPoint,
            "partcomp" | "PC2PL" | "PC3PL" => ItemKind::PartiallyCompensatory,
            other => {
                return Err(M2Error::UnsupportedModel(format!(
                    "item type '{other}' is not supported"
                )))
            }
        };
        Ok(kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::Dichotomous => "dichotomous",
            ItemKind::Graded => "graded",
            ItemKind::Gpcm => "gpcm",
            ItemKind::Nominal => "nominal",
            ItemKind::NestedLogit { .. } => "nestlogit",
            ItemKind::IdealPoint => "ideal",
            ItemKind::PartiallyCompensatory => "partcomp",
        }
    }

    pub fn n_params(&self, n_factors: usize, n_categories: usize) -> usize {
        match self {
            ItemKind::Dichotomous => n_factors + 3,
            ItemKind::Graded => n_factors + n_categories - 1,
            ItemKind::Gpcm | ItemKind::Nominal => n_factors + 2 * n_categories,
            ItemKind::NestedLogit { .. } => n_factors + 3 + 2 * (n_categories - 1),
            ItemKind::IdealPoint => n_factors + 1,
            ItemKind::PartiallyCompensatory => 2 * n_factors + 2,
        }
    }

    /// Item types for which residual correlations (SRMSR) are defined.
    pub fn supports_srmsr(&self) -> bool {
        matches!(
            self,
            ItemKind::Dichotomous | ItemKind::Graded | ItemKind::Gpcm
        )
    }

    fn check_categories(&self, n_categories: usize) -> Result<()> {
        let ok = match self {
            ItemKind::Dichotomous | ItemKind::IdealPoint | ItemKind::PartiallyCompensatory => {
                n_categories == 2
            }
            ItemKind::Graded | ItemKind::Gpcm | ItemKind::Nominal => n_categories >= 2,
            ItemKind::NestedLogit { key } => n_categories >= 3 && *key < n_categories,
        };
        if ok {
            Ok(())
        } else {
            Err(M2Error::Configuration(format!(
                "{} item cannot have {} categories",
                self.name(),
                n_categories
            )))
        }
    }
}

/// How response categories are scored when forming moments.
///
/// The cumulative rule integrates upper-tail probabilities `P(X >= k)`; the
/// weighted rule applies an explicit score to each category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoreRule {
    Cumulative,
    Weighted(Vec<f64>),
}

impl ScoreRule {
    pub fn for_kind(kind: ItemKind, n_categories: usize) -> Self {
        match kind {
            ItemKind::Nominal => ScoreRule::Weighted((0..n_categories).map(|k| k as f64).collect()),
            ItemKind::NestedLogit { key } => {
                let mut scores = vec![0.0; n_categories];
                let mut rank = 0.0;
                for (k, s) in scores.iter_mut().enumerate() {
                    if k == key {
                        *s = (n_categories - 1) as f64;
                    } else {
                        *s = rank;
                        rank += 1.0;
                    }
                }
                ScoreRule::Weighted(scores)
            }
            _ => ScoreRule::Cumulative,
        }
    }

    #[inline]
    pub fn score(&self, category: usize) -> f64 {
        match self {
            ScoreRule::Cumulative => category as f64,
            ScoreRule::Weighted(scores) => scores[category],
        }
    }

    /// Expected score under a category probability (or derivative) vector.
    #[inline]
    pub fn expected(&self, probs: ArrayView1<f64>) -> f64 {
        match self {
            ScoreRule::Cumulative => {
                let mut tail = 0.0;
                let mut total = 0.0;
                for k in (1..probs.len()).rev() {
                    tail += probs[k];
                    total += tail;
                }
                total
            }
            ScoreRule::Weighted(scores) => scores.iter().zip(probs.iter()).map(|(s, p)| s * p).sum(),
        }
    }

    /// Expected squared score.
    #[inline]
    pub fn expected_square(&self, probs: ArrayView1<f64>) -> f64 {
        match self {
            ScoreRule::Cumulative => {
                let mut tail = 0.0;
                let mut total = 0.0;
                for k in (1..probs.len()).rev() {
                    tail += probs[k];
                    total += (2 * k - 1) as f64 * tail;
                }
                total
            }
            ScoreRule::Weighted(scores) => scores
                .iter()
                .zip(probs.iter())
                .map(|(s, p)| s * s * p)
                .sum(),
        }
    }
}

/// A single fitted item.
#[derive(Debug, Clone)]
pub struct Item {
    name: String,
    kind: ItemKind,
    n_factors: usize,
    n_categories: usize,
    params: Vec<f64>,
    free_index: Vec<Option<usize>>,
    score_rule: ScoreRule,
}

impl Item {
    /// Create an item with every parameter fixed.
    pub fn new(
        name: impl Into<String>,
        kind: ItemKind,
        n_factors: usize,
        n_categories: usize,
        params: Vec<f64>,
    ) -> Result<Self> {
        let name = name.into();
        if n_factors == 0 {
            return Err(M2Error::Configuration(format!(
                "item '{name}' must load on at least one factor"
            )));
        }
        kind.check_categories(n_categories)?;

        let expected = kind.n_params(n_factors, n_categories);
        if params.len() != expected {
            return Err(M2Error::Dimension(format!(
                "item '{}' ({}) expects {} parameters, got {}",
                name,
                kind.name(),
                expected,
                params.len()
            )));
        }
        if params.iter().any(|p| !p.is_finite()) {
            return Err(M2Error::Configuration(format!(
                "item '{name}' has non-finite parameters"
            )));
        }
        if kind == ItemKind::Graded {
            let d = &params[n_factors..];
            if d.windows(2).any(|w| w[0] <= w[1]) {
                return Err(M2Error::Configuration(format!(
                    "graded item '{name}' requires strictly decreasing intercepts"
                )));
            }
        }

        Ok(Self {
            name,
            kind,
            n_factors,
            n_categories,
            free_index: vec![None; params.len()],
            params,
            score_rule: ScoreRule::for_kind(kind, n_categories),
        })
    }

    /// Attach global free-parameter numbers. Shared numbers express equality
    /// constraints; `None` marks a fixed parameter.
    pub fn with_free_index(mut self, free_index: Vec<Option<usize>>) -> Result<Self> {
        if free_index.len() != self.params.len() {
            return Err(M2Error::Dimension(format!(
                "item '{}' has {} parameters but {} free-index entries",
                self.name,
                self.params.len(),
                free_index.len()
            )));
        }
        self.free_index = free_index;
        Ok(self)
    }

    /// Replace the scoring rule. Weighted scores need one entry per category.
    pub fn with_score_rule(mut self, score_rule: ScoreRule) -> Result<Self> {
        if let ScoreRule::Weighted(scores) = &score_rule {
            if scores.len() != self.n_categories {
                return Err(M2Error::Dimension(format!(
                    "item '{}' has {} categories but {} category scores",
                    self.name,
                    self.n_categories,
                    scores.len()
                )));
            }
        }
        self.score_rule = score_rule;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn n_factors(&self) -> usize {
        self.n_factors
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn free_index(&self) -> &[Option<usize>] {
        &self.free_index
    }

    pub fn score_rule(&self) -> &ScoreRule {
        &self.score_rule
    }

    /// `(local parameter position, global free index)` for every free parameter.
    pub fn free_parameters(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_index
            .iter()
            .enumerate()
            .filter_map(|(p, idx)| idx.map(|g| (p, g)))
    }

    /// Category probabilities, shape `(n_points, n_categories)`.
    pub fn probability_trace(&self, theta: ArrayView2<f64>) -> Array2<f64> {
        let n_points = theta.nrows();
        let k = self.n_categories;
        let mut trace = Array2::zeros((n_points, k));
        let mut probs = vec![0.0; k];
        let mut scratch = vec![0.0; k];
        for q in 0..n_points {
            self.point_probs(theta.row(q), &mut probs, &mut scratch);
            for c in 0..k {
                trace[[q, c]] = probs[c];
            }
        }
        trace
    }

    /// Derivatives of the category probabilities with respect to every item
    /// parameter, shape `(n_params, n_points, n_categories)`.
    pub fn derivative(&self, theta: ArrayView2<f64>) -> Array3<f64> {
        let n_points = theta.nrows();
        let k = self.n_categories;
        let n_params = self.params.len();
        let mut deriv = Array3::zeros((n_params, n_points, k));
        let mut probs = vec![0.0; k];
        let mut scratch = vec![0.0; k];
        let mut dp = vec![0.0; n_params * k];
        for q in 0..n_points {
            let theta_q = theta.row(q);
            self.point_probs(theta_q, &mut probs, &mut scratch);
            dp.iter_mut().for_each(|v| *v = 0.0);
            self.point_derivs(theta_q, &probs, &mut scratch, &mut dp);
            for p in 0..n_params {
                for c in 0..k {
                    deriv[[p, q, c]] = dp[p * k + c];
                }
            }
        }
        deriv
    }

    #[inline]
    fn slope_dot(&self, theta: ArrayView1<f64>) -> f64 {
        let mut z = 0.0;
        for f in 0..self.n_factors {
            z += self.params[f] * theta[f];
        }
        z
    }

    fn point_probs(&self, theta: ArrayView1<f64>, probs: &mut [f64], scratch: &mut [f64]) {
        let nf = self.n_factors;
        let k = self.n_categories;
        let par = &self.params;
        match self.kind {
            ItemKind::Dichotomous => {
                let (g, u) = (par[nf + 1], par[nf + 2]);
                let p1 = g + (u - g) * sigmoid(self.slope_dot(theta) + par[nf]);
                probs[0] = 1.0 - p1;
                probs[1] = p1;
            }
            ItemKind::Graded => {
                let az = self.slope_dot(theta);
                let mut upper = 1.0;
                for c in 0..k {
                    let next = if c + 1 < k {
                        sigmoid(az + par[nf + c])
                    } else {
                        0.0
                    };
                    probs[c] = upper - next;
                    upper = next;
                }
            }
            ItemKind::Gpcm | ItemKind::Nominal => {
                let az = self.slope_dot(theta);
                for c in 0..k {
                    scratch[c] = par[nf + c] * az + par[nf + k + c];
                }
                softmax_into(&scratch[..k], probs);
            }
            ItemKind::NestedLogit { key } => {
                let (g, u) = (par[nf + 1], par[nf + 2]);
                let p_key = g + (u - g) * sigmoid(self.slope_dot(theta) + par[nf]);
                let n_dist = k - 1;
                let t: f64 = theta.iter().take(nf).sum();
                let mut dist = vec![0.0; n_dist];
                for r in 0..n_dist {
                    scratch[r] = par[nf + 3 + r] * t + par[nf + 3 + n_dist + r];
                }
                softmax_into(&scratch[..n_dist], &mut dist);
                let mut r = 0;
                for c in 0..k {
                    if c == key {
                        probs[c] = p_key;
                    } else {
                        probs[c] = (1.0 - p_key) * dist[r];
                        r += 1;
                    }
                }
            }
            ItemKind::IdealPoint => {
                let z = self.slope_dot(theta) + par[nf];
                let p1 = (-0.5 * z * z).exp();
                probs[0] = 1.0 - p1;
                probs[1] = p1;
            }
            ItemKind::PartiallyCompensatory => {
                let (g, u) = (par[2 * nf], par[2 * nf + 1]);
                let mut prod = 1.0;
                for f in 0..nf {
                    prod *= sigmoid(par[f] * theta[f] + par[nf + f]);
                }
                let p1 = g + (u - g) * prod;
                probs[0] = 1.0 - p1;
                probs[1] = p1;
            }
        }
    }

    /// Fill `dp[p * K + c]` with dP_c / d(param p). `probs` must hold the
    /// probabilities at the same point.
    fn point_derivs(
        &self,
        theta: ArrayView1<f64>,
        probs: &[f64],
        scratch: &mut [f64],
        dp: &mut [f64],
    ) {
        let nf = self.n_factors;
        let k = self.n_categories;
        let par = &self.params;
        match self.kind {
            ItemKind::Dichotomous => {
                let (g, u) = (par[nf + 1], par[nf + 2]);
                let s = sigmoid(self.slope_dot(theta) + par[nf]);
                let w = (u - g) * s * (1.0 - s);
                let mut set = |p: usize, d1: f64| {
                    dp[p * 2] = -d1;
                    dp[p * 2 + 1] = d1;
                };
                for f in 0..nf {
                    set(f, w * theta[f]);
                }
                set(nf, w);
                set(nf + 1, 1.0 - s);
                set(nf + 2, s);
            }
            ItemKind::Graded => {
                let az = self.slope_dot(theta);
                // scratch[c] holds P*(c)(1 - P*(c)); the boundary terms are zero
                for c in 0..k {
                    scratch[c] = if c == 0 {
                        0.0
                    } else {
                        let ps = sigmoid(az + par[nf + c - 1]);
                        ps * (1.0 - ps)
                    };
                }
                for c in 0..k {
                    let w_c = scratch[c];
                    let w_next = if c + 1 < k { scratch[c + 1] } else { 0.0 };
                    for f in 0..nf {
                        dp[f * k + c] = (w_c - w_next) * theta[f];
                    }
                }
                for t in 1..k {
                    let p = nf + t - 1;
                    dp[p * k + t] = scratch[t];
                    dp[p * k + t - 1] = -scratch[t];
                }
            }
            ItemKind::Gpcm | ItemKind::Nominal => {
                let az = self.slope_dot(theta);
                let ak = &par[nf..nf + k];
                let mean_ak: f64 = (0..k).map(|c| probs[c] * ak[c]).sum();
                for c in 0..k {
                    for f in 0..nf {
                        dp[f * k + c] = probs[c] * (ak[c] - mean_ak) * theta[f];
                    }
                }
                for j in 0..k {
                    for c in 0..k {
                        let delta = if c == j { 1.0 } else { 0.0 };
                        let dz = probs[c] * (delta - probs[j]);
                        dp[(nf + j) * k + c] = dz * az;
                        dp[(nf + k + j) * k + c] = dz;
                    }
                }
            }
            ItemKind::NestedLogit { key } => {
                let (g, u) = (par[nf + 1], par[nf + 2]);
                let s = sigmoid(self.slope_dot(theta) + par[nf]);
                let p_key = probs[key];
                let n_dist = k - 1;
                let t: f64 = theta.iter().take(nf).sum();

                // distractor shares, recovered from the probabilities
                let rest = (1.0 - p_key).max(f64::MIN_POSITIVE);
                let mut r = 0;
                for c in 0..k {
                    if c != key {
                        scratch[r] = probs[c] / rest;
                        r += 1;
                    }
                }
                let dist = &scratch[..n_dist];
                let categories: Vec<usize> = (0..k).filter(|&c| c != key).collect();

                let w = (u - g) * s * (1.0 - s);
                let mut key_grad = vec![0.0; nf + 3];
                for f in 0..nf {
                    key_grad[f] = w * theta[f];
                }
                key_grad[nf] = w;
                key_grad[nf + 1] = 1.0 - s;
                key_grad[nf + 2] = s;
                for (p, &dk) in key_grad.iter().enumerate() {
                    dp[p * k + key] = dk;
                    for (r, &c) in categories.iter().enumerate() {
                        dp[p * k + c] = -dist[r] * dk;
                    }
                }

                let base_ak = nf + 3;
                let base_dk = nf + 3 + n_dist;
                for j in 0..n_dist {
                    for (r, &c) in categories.iter().enumerate() {
                        let delta = if r == j { 1.0 } else { 0.0 };
                        let dz = (1.0 - p_key) * dist[r] * (delta - dist[j]);
                        dp[(base_ak + j) * k + c] = dz * t;
                        dp[(base_dk + j) * k + c] = dz;
                    }
                }
            }
            ItemKind::IdealPoint => {
                let z = self.slope_dot(theta) + par[nf];
                let dz = -z * probs[1];
                for f in 0..=nf {
                    let d1 = if f < nf { dz * theta[f] } else { dz };
                    dp[f * 2] = -d1;
                    dp[f * 2 + 1] = d1;
                }
            }
            ItemKind::PartiallyCompensatory => {
                let (g, u) = (par[2 * nf], par[2 * nf + 1]);
                let mut prod = 1.0;
                for f in 0..nf {
                    prod *= sigmoid(par[f] * theta[f] + par[nf + f]);
                }
                let mut set = |p: usize, d1: f64| {
                    dp[p * 2] = -d1;
                    dp[p * 2 + 1] = d1;
                };
                for f in 0..nf {
                    let s_f = sigmoid(par[f] * theta[f] + par[nf + f]);
                    let common = (u - g) * prod * (1.0 - s_f);
                    set(f, common * theta[f]);
                    set(nf + f, common);
                }
                set(2 * nf, 1.0 - prod);
                set(2 * nf + 1, prod);
            }
        }
    }
}
