mod common;

use approx::assert_relative_eq;
use common::{five_item_params, simulate, two_pl_items};
use mirt_m2::{
    compute_m2, compute_m2_in, FittedModel, GroupModel, Item, ItemKind, LatentDistribution,
    M2Error, M2Options,
};

fn no_null() -> M2Options {
    M2Options {
        calc_null: false,
        ..Default::default()
    }
}

#[test]
fn test_five_item_end_to_end() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 1000, 42);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 10).unwrap();

    let fit = compute_m2(&model, &M2Options::default())
        .unwrap()
        .into_fit()
        .unwrap();
    assert_eq!(fit.df, 5 + 10 - 10);
    assert_eq!(fit.n_respondents, 1000);
    assert!(fit.statistic >= 0.0);
    assert!((0.0..=1.0).contains(&fit.p_value));
    assert!(fit.rmsea >= 0.0);
    assert!(fit.rmsea_lower <= fit.rmsea && fit.rmsea <= fit.rmsea_upper);
    assert!(fit.srmsr.unwrap() < 0.1);

    let tli = fit.tli.unwrap();
    let cfi = fit.cfi.unwrap();
    assert!((0.0..=1.0).contains(&tli));
    assert!((0.0..=1.0).contains(&cfi));
}

#[test]
fn test_p_values_roughly_uniform_under_true_model() {
    let items = two_pl_items(&five_item_params(), 0);
    let reps = 30;
    let p_values: Vec<f64> = (0..reps)
        .map(|rep| {
            let (responses, _) = simulate(&items, 500, 1000 + rep);
            let model = FittedModel::new(
                responses,
                items.clone(),
                LatentDistribution::standard_normal(1),
                10,
            )
            .unwrap();
            compute_m2(&model, &no_null()).unwrap().into_fit().unwrap().p_value
        })
        .collect();

    let mean = p_values.iter().sum::<f64>() / reps as f64;
    assert!((0.25..=0.75).contains(&mean), "mean p-value {mean}");
    let below = p_values.iter().filter(|&&p| p < 0.5).count();
    assert!((5..=25).contains(&below), "{below} of {reps} below 0.5");
}

#[test]
fn test_df_for_any_free_parameter_count() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 300, 7);
    for n_fixed in 0..=3 {
        // fix the slopes of the first n_fixed items
        let constrained: Vec<Item> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                if i < n_fixed {
                    item.clone()
                        .with_free_index(vec![None, Some(2 * i + 1), None, None])
                        .unwrap()
                } else {
                    item.clone()
                }
            })
            .collect();
        let nest = 10 - n_fixed;
        let model = FittedModel::new(
            responses.clone(),
            constrained,
            LatentDistribution::standard_normal(1),
            nest,
        )
        .unwrap();
        let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
        assert_eq!(fit.df, 5 + 10 - nest);
    }
}

#[test]
fn test_jacobian_column_mismatch() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 200, 3);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 9).unwrap();
    assert!(matches!(
        compute_m2(&model, &no_null()),
        Err(M2Error::Dimension(_))
    ));
}

#[test]
fn test_multi_group_pooling() {
    let params_a = five_item_params();
    let params_b: Vec<(f64, f64)> = params_a.iter().map(|&(a, d)| (a * 0.8, d + 0.3)).collect();
    let items_a = two_pl_items(&params_a, 0);
    let items_b = two_pl_items(&params_b, 10);

    let (resp_a, _) = simulate(&items_a, 400, 11);
    let (resp_b, _) = simulate(&items_b, 600, 12);
    let responses = ndarray::concatenate![ndarray::Axis(0), resp_a, resp_b];
    let group_of: Vec<usize> = (0..1000).map(|i| usize::from(i >= 400)).collect();

    let model = FittedModel::multiple_group(
        responses,
        group_of,
        vec![
            GroupModel::new("A", items_a.clone(), LatentDistribution::standard_normal(1)),
            GroupModel::new("B", items_b, LatentDistribution::standard_normal(1)),
        ],
        20,
    )
    .unwrap();

    let pooled = compute_m2(&model, &M2Options::default())
        .unwrap()
        .into_fit()
        .unwrap();
    let groups = pooled.per_group.as_ref().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(pooled.df, 15 + 15 - 20);
    assert_eq!(groups[0].df, 5);
    assert_eq!(groups[1].n_respondents, 600);
    assert_relative_eq!(
        pooled.statistic,
        groups[0].statistic + groups[1].statistic,
        max_relative = 1e-12
    );
    assert!(pooled.srmsr.is_none());
    assert!(groups.iter().all(|g| g.srmsr.is_some()));
    assert!(pooled.tli.is_some());
    assert!(groups.iter().all(|g| g.tli.is_none()));

    // group A alone reproduces its per-group statistic
    let alone = FittedModel::new(resp_a, items_a, LatentDistribution::standard_normal(1), 10).unwrap();
    let fit_a = compute_m2(&alone, &no_null()).unwrap().into_fit().unwrap();
    assert_relative_eq!(fit_a.statistic, groups[0].statistic, max_relative = 1e-10);
}

#[test]
fn test_group_with_too_many_parameters_is_rejected() {
    // a shared slope plus three intercepts per group; group A also carries
    // three structural parameters, leaving it 6 - 7 degrees of freedom
    let build = |first: usize| -> Vec<Item> {
        (0..3)
            .map(|i| {
                Item::new(
                    format!("Item.{}", i + 1),
                    ItemKind::Dichotomous,
                    1,
                    2,
                    vec![1.1, -0.4 + 0.4 * i as f64, 0.0, 1.0],
                )
                .unwrap()
                .with_free_index(vec![Some(0), Some(first + i), None, None])
                .unwrap()
            })
            .collect()
    };
    let items_a = build(1);
    let items_b = build(4);
    let (resp_a, _) = simulate(&items_a, 300, 31);
    let (resp_b, _) = simulate(&items_b, 300, 32);
    let responses = ndarray::concatenate![ndarray::Axis(0), resp_a, resp_b];
    let group_of: Vec<usize> = (0..600).map(|i| usize::from(i >= 300)).collect();

    let groups = |structural_a: usize| {
        vec![
            GroupModel::new("A", items_a.clone(), LatentDistribution::standard_normal(1))
                .with_structural_free(structural_a),
            GroupModel::new("B", items_b.clone(), LatentDistribution::standard_normal(1)),
        ]
    };

    let model =
        FittedModel::multiple_group(responses.clone(), group_of.clone(), groups(3), 10).unwrap();
    let err = compute_m2(&model, &no_null()).unwrap_err();
    assert!(
        matches!(
            err,
            M2Error::InsufficientDegreesOfFreedom {
                moments: 6,
                parameters: 7
            }
        ),
        "{err:?}"
    );

    // without the structural parameters both groups keep positive df
    let model = FittedModel::multiple_group(responses, group_of, groups(0), 7).unwrap();
    let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    assert_eq!(fit.df, 12 - 7);
    let per_group = fit.per_group.unwrap();
    assert_eq!(per_group[0].df, 2);
    assert_eq!(per_group[1].df, 2);
}

#[test]
fn test_discrete_latent_distribution() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 800, 17);
    let latent = LatentDistribution::Discrete {
        grid: ndarray::array![[-1.5], [0.0], [1.5]],
        prior: ndarray::array![0.3, 0.4, 0.3],
    };
    let model = FittedModel::new(responses, items, latent, 10).unwrap();

    let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    assert_eq!(fit.df, 5);
    assert!(fit.statistic.is_finite() && fit.statistic >= 0.0);
    assert!((0.0..=1.0).contains(&fit.p_value));
    assert!(fit.srmsr.is_some());

    // the grid is used as given regardless of the requested point count
    let more_points = M2Options {
        quadrature_points: Some(91),
        ..no_null()
    };
    let again = compute_m2(&model, &more_points).unwrap().into_fit().unwrap();
    assert_relative_eq!(again.statistic, fit.statistic, max_relative = 1e-12);
}

#[test]
fn test_mixed_item_types() {
    let mut items = two_pl_items(&five_item_params()[..3], 0);
    items.push(
        Item::new("Item.4", ItemKind::IdealPoint, 1, 2, vec![1.0, 0.5])
            .unwrap()
            .with_free_index(vec![Some(6), Some(7)])
            .unwrap(),
    );
    items.push(
        Item::new(
            "Item.5",
            ItemKind::PartiallyCompensatory,
            1,
            2,
            vec![1.2, 0.3, 0.0, 1.0],
        )
        .unwrap()
        .with_free_index(vec![Some(8), Some(9), None, None])
        .unwrap(),
    );
    items.push(
        Item::new(
            "Item.6",
            ItemKind::NestedLogit { key: 0 },
            1,
            3,
            vec![1.1, 0.2, 0.0, 1.0, 0.0, 0.5, 0.0, -0.4],
        )
        .unwrap()
        .with_free_index(vec![Some(10), Some(11), None, None, None, None, None, Some(12)])
        .unwrap(),
    );
    let (responses, _) = simulate(&items, 1500, 23);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 13).unwrap();

    let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    assert_eq!(fit.df, 6 + 15 - 13);
    assert!(fit.statistic.is_finite() && fit.statistic >= 0.0);
    assert!(fit.rmsea_lower <= fit.rmsea && fit.rmsea <= fit.rmsea_upper);
    assert!(fit.srmsr.is_none());
}

#[test]
fn test_two_factor_graded() {
    let items: Vec<Item> = (0..8)
        .map(|i| {
            let (a1, a2) = if i < 4 { (1.3, 0.3) } else { (0.4, 1.1) };
            let a2 = if i == 0 { 0.0 } else { a2 };
            let base = 4 * i;
            let free_a2 = if i == 0 { None } else { Some(base + 1) };
            Item::new(
                format!("Item.{}", i + 1),
                ItemKind::Graded,
                2,
                3,
                vec![a1, a2, 0.8 - 0.1 * i as f64, -0.9 + 0.05 * i as f64],
            )
            .unwrap()
            .with_free_index(vec![Some(base), free_a2, Some(base + 2), Some(base + 3)])
            .unwrap()
        })
        .collect();
    let (responses, _) = simulate(&items, 800, 21);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(2), 31).unwrap();

    let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    assert_eq!(fit.df, 8 + 28 - 31);
    assert!(fit.statistic.is_finite() && fit.statistic >= 0.0);
    assert!(fit.srmsr.is_some());

    let qmc = M2Options {
        use_quasi_monte_carlo: true,
        quadrature_points: Some(2000),
        ..no_null()
    };
    let fit_qmc = compute_m2(&model, &qmc).unwrap().into_fit().unwrap();
    assert_eq!(fit_qmc.df, fit.df);
    assert!(fit_qmc.statistic.is_finite());
}

#[test]
fn test_nominal_item_omits_srmsr() {
    let mut items = two_pl_items(&five_item_params()[..4], 0);
    items.push(
        Item::new(
            "Item.5",
            ItemKind::Nominal,
            1,
            3,
            vec![1.0, 0.0, 1.0, 2.0, 0.0, 0.5, -0.2],
        )
        .unwrap()
        .with_free_index(vec![Some(8), None, None, None, None, Some(9), Some(10)])
        .unwrap(),
    );
    let (responses, _) = simulate(&items, 1000, 5);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 11).unwrap();

    let fit = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    assert_eq!(fit.df, 15 - 11);
    assert!(fit.statistic >= 0.0);
    assert!(fit.srmsr.is_none());
}

#[test]
fn test_residual_threshold_of_one_matches_unsuppressed() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 500, 8);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 10).unwrap();

    let plain = M2Options {
        return_residual_matrix: true,
        ..Default::default()
    };
    let one = M2Options {
        suppress_threshold: Some(1.0),
        ..plain.clone()
    };
    let small = M2Options {
        suppress_threshold: Some(0.02),
        ..plain.clone()
    };
    let r_plain = compute_m2(&model, &plain).unwrap();
    let r_one = compute_m2(&model, &one).unwrap();
    let r_small = compute_m2(&model, &small).unwrap();
    let (r_plain, r_one, r_small) = (
        &r_plain.residuals().unwrap()[0],
        &r_one.residuals().unwrap()[0],
        &r_small.residuals().unwrap()[0],
    );

    assert_eq!(r_plain.dim(), (5, 5));
    for ((idx, &a), &b) in r_plain.indexed_iter().zip(r_one.iter()) {
        assert_eq!(a.is_nan(), b.is_nan(), "pattern differs at {idx:?}");
        if !a.is_nan() {
            assert_eq!(a, b);
        }
        let (i, j) = idx;
        assert_eq!(a.is_nan(), i <= j);
    }
    for (&a, &s) in r_plain.iter().zip(r_small.iter()) {
        if !s.is_nan() {
            assert_eq!(a, s);
            assert!(s.abs() >= 0.02);
        }
    }
}

#[test]
fn test_explicit_pool_matches_global() {
    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 400, 9);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 10).unwrap();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

    let global = compute_m2(&model, &no_null()).unwrap().into_fit().unwrap();
    let local = compute_m2_in(&pool, &model, &no_null())
        .unwrap()
        .into_fit()
        .unwrap();
    assert_eq!(global.statistic, local.statistic);
    assert_eq!(global.df, local.df);
}

#[test]
fn test_options_from_json() {
    let options: M2Options =
        serde_json::from_str(r#"{"calc_null": false, "confidence_level": 0.95, "seed": 17}"#).unwrap();
    assert!(!options.calc_null);
    assert_eq!(options.confidence_level, 0.95);
    assert_eq!(options.seed, 17);
    assert_eq!(options.imputations, 0);
    assert!(options.quadrature_points.is_none());

    let items = two_pl_items(&five_item_params(), 0);
    let (responses, _) = simulate(&items, 300, 10);
    let model = FittedModel::new(responses, items, LatentDistribution::standard_normal(1), 10).unwrap();
    let fit = compute_m2(&model, &options).unwrap().into_fit().unwrap();
    let json = serde_json::to_value(&fit).unwrap();
    assert_eq!(json["df"], 5);
    assert!(json["tli"].is_null());
}
