// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! End-to-end properties of the Fisher accumulation and analysis chain.

use ft_curvature::{
    analyze, empirical_fim, invert, regularize, DiagonalLoading, FimAccumulator, KernelPartition,
    SpectrumProbe,
};
use ft_nn::{gaussian_blobs, BaseNet, BlobConfig, CrossEntropyLoss, Module};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Hand-computed reference: two fixed gradient vectors over a three-parameter
/// space with two diagonal blocks and one off-diagonal coupling.
#[test]
fn accumulator_matches_hand_computed_outer_products() {
    let mut accumulator = FimAccumulator::new(3).unwrap();
    accumulator.accumulate(&[1.0, 0.0, 1.0]).unwrap();
    accumulator.accumulate(&[0.0, 2.0, 0.0]).unwrap();
    let fim = accumulator.finish().unwrap();
    let h = fim.matrix();
    // (g1 g1' + g2 g2') / 2 element by element.
    let expected = [
        [0.5, 0.0, 0.5],
        [0.0, 2.0, 0.0],
        [0.5, 0.0, 0.5],
    ];
    for (i, row) in expected.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            assert_eq!(h[(i, j)], value, "H[{i}][{j}]");
        }
    }
}

fn small_fisher() -> (ft_curvature::FimMatrix, KernelPartition) {
    let mut model = BaseNet::basenet_750().unwrap();
    let mut init_rng = StdRng::seed_from_u64(40);
    model.init_gaussian(0.2, &mut init_rng).unwrap();
    let data = gaussian_blobs(&BlobConfig {
        classes: 10,
        samples_per_class: 2,
        height: 28,
        width: 28,
        noise_std: 0.1,
        seed: 5,
    })
    .unwrap();
    let loader = data.loader().batched(5);
    let mut loss = CrossEntropyLoss::new();
    let mut rng = StdRng::seed_from_u64(123);
    let fim = empirical_fim(&mut model, &mut loss, &loader, &mut rng).unwrap();
    let partition = KernelPartition::from_layout(&model.parameter_layout().unwrap()).unwrap();
    (fim, partition)
}

#[test]
fn conv_classifier_fisher_satisfies_the_structural_invariants() {
    let (fim, partition) = small_fisher();
    assert_eq!(fim.dim(), 746);
    assert_eq!(partition.parameter_dimension(), 746);
    assert_eq!(partition.covered(), 746);

    // Symmetry by construction.
    assert_eq!(fim.symmetry_gap(), 0.0);

    // Partition ranges are strictly increasing and contiguous.
    let mut cursor = 0;
    for &(start, end) in partition.ranges() {
        assert_eq!(start, cursor);
        assert!(end > start);
        cursor = end;
    }
    assert_eq!(cursor, 746);

    // Dominance ratios live in the unit interval; the kernel blocks are a
    // strict superset of the diagonal, so their mass ratio dominates.
    let report = analyze(fim.matrix(), &partition, 1e-5).unwrap();
    assert!(report.diagonal_ratio > 0.0 && report.diagonal_ratio <= 1.0);
    assert!(report.kernel_ratio > 0.0 && report.kernel_ratio <= 1.0);
    assert!(report.kernel_ratio >= report.diagonal_ratio);

    // PSD + positive loading always inverts.
    let reg = regularize(fim.matrix(), &DiagonalLoading::Tau(1e-4)).unwrap();
    let inverse = invert(&reg).unwrap();
    let product = &reg * &inverse;
    for i in 0..5 {
        assert!((product[(i, i)] - 1.0).abs() < 1e-6);
    }

    // The probe sees an effectively-real spectrum on the leading block.
    let probe = SpectrumProbe::new().with_block_size(40).with_tolerance(1e-9);
    let report = probe.probe(fim.matrix(), 1e-5).unwrap();
    assert_eq!(report.count, 40);
    assert!(report.mean.is_finite() && report.std.is_finite());
    // Every eigenvalue of a PSD matrix plus tau*I is at least tau, so the
    // mean must clear it too.
    assert!(report.mean >= 1e-5 - 1e-12);
}

#[test]
fn fisher_pass_is_bit_identical_under_a_fixed_seed() {
    let run = || {
        let mut model = BaseNet::basenet_750().unwrap();
        let mut init_rng = StdRng::seed_from_u64(40);
        model.init_gaussian(0.2, &mut init_rng).unwrap();
        let data = gaussian_blobs(&BlobConfig {
            classes: 4,
            samples_per_class: 3,
            height: 28,
            width: 28,
            noise_std: 0.1,
            seed: 6,
        })
        .unwrap();
        let loader = data.loader().batched(4);
        let mut loss = CrossEntropyLoss::new();
        let mut rng = StdRng::seed_from_u64(555);
        empirical_fim(&mut model, &mut loss, &loader, &mut rng).unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
}
