use abt_core::rng::{hashed_variant, RngHandle};
use abt_core::{ExperimentId, Variant};

#[test]
fn rng_emits_reproducible_sequence() {
    let mut rng_a = RngHandle::from_seed(1234);
    let mut rng_b = RngHandle::from_seed(1234);

    let seq_a: Vec<Variant> = (0..100).map(|_| rng_a.coin_flip()).collect();
    let seq_b: Vec<Variant> = (0..100).map(|_| rng_b.coin_flip()).collect();

    assert_eq!(seq_a, seq_b);
}

#[test]
fn coin_flip_uses_both_variants() {
    let mut rng = RngHandle::from_seed(5);
    let flips: Vec<Variant> = (0..200).map(|_| rng.coin_flip()).collect();
    assert!(flips.contains(&Variant::Control));
    assert!(flips.contains(&Variant::Treatment));
}

#[test]
fn hashed_variant_is_stable_per_visitor() {
    let experiment = ExperimentId::from_raw(11);
    for visitor in ["alice", "bob", "carol", "dave"] {
        let first = hashed_variant(0, experiment, visitor);
        for _ in 0..10 {
            assert_eq!(hashed_variant(0, experiment, visitor), first);
        }
    }
}

#[test]
fn hashed_variant_splits_population() {
    let experiment = ExperimentId::from_raw(1);
    let treatment = (0..1_000)
        .filter(|idx| hashed_variant(42, experiment, &format!("visitor-{idx}")) == Variant::Treatment)
        .count();
    assert!((400..=600).contains(&treatment), "treatment share {treatment}");
}
