#![allow(dead_code)]

use mirt_m2::utils::sample_category;
use mirt_m2::{Item, ItemKind};
use ndarray::{s, Array2};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_pcg::Pcg64;

/// 2PL items with slope and intercept free, numbered from `first_index`.
pub fn two_pl_items(params: &[(f64, f64)], first_index: usize) -> Vec<Item> {
    params
        .iter()
        .enumerate()
        .map(|(i, &(a, d))| {
            let base = first_index + 2 * i;
            Item::new(format!("Item.{}", i + 1), ItemKind::Dichotomous, 1, 2, vec![a, d, 0.0, 1.0])
                .unwrap()
                .with_free_index(vec![Some(base), Some(base + 1), None, None])
                .unwrap()
        })
        .collect()
}

pub fn five_item_params() -> Vec<(f64, f64)> {
    vec![(1.2, -0.8), (0.9, 0.2), (1.6, 0.5), (1.1, -0.3), (0.7, 1.0)]
}

/// Draw standard-normal abilities and responses from the items' own traces.
pub fn simulate(items: &[Item], n: usize, seed: u64) -> (Array2<i32>, Array2<f64>) {
    let n_factors = items[0].n_factors();
    let mut rng = Pcg64::seed_from_u64(seed);
    let theta = Array2::from_shape_fn((n, n_factors), |_| rng.sample::<f64, _>(StandardNormal));

    let mut responses = Array2::zeros((n, items.len()));
    for i in 0..n {
        let point = theta.slice(s![i..i + 1, ..]);
        for (j, item) in items.iter().enumerate() {
            let trace = item.probability_trace(point);
            let weights: Vec<f64> = trace.row(0).to_vec();
            let u: f64 = rng.random();
            responses[[i, j]] = sample_category(&weights, u).unwrap() as i32;
        }
    }
    (responses, theta)
}

/// Blank out each response independently with probability `rate`.
pub fn punch_holes(responses: &mut Array2<i32>, rate: f64, seed: u64) {
    let mut rng = Pcg64::seed_from_u64(seed);
    for r in responses.iter_mut() {
        if rng.random::<f64>() < rate {
            *r = -1;
        }
    }
}
