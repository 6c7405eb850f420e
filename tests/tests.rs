use std::collections::BTreeSet;
use std::thread;

use approx::assert_relative_eq;
use proptest::prelude::*;

use kdsmooth::configuration::config::uniform_cube;
use kdsmooth::index::states::{open_boundaries, periodic_dist2};
use kdsmooth::{
    run_parallel, ClaimStrategy, Decomposition, ElementType, FieldBindings, FieldBuffer, FieldSlot, KdError,
    KdIndex, KdTree, Kernel, KnnHeap, NVec3, NeighborList, Property, RunConfig, SharedBuffer, SmoothingContext,
    SmoothingParams, WorkerState,
};

/// `n` points on the x axis at x = 0, 1, 2, ...
pub fn line_points(n: usize) -> Vec<NVec3> {
    (0..n).map(|i| NVec3::new(i as f64, 0.0, 0.0)).collect()
}

/// Seeded uniform cloud in the unit cube
pub fn random_points(n: usize, seed: u64) -> Vec<NVec3> {
    uniform_cube(n, seed, 1.0)
}

/// Index over `points` with unit masses
pub fn unit_mass_index(points: &[NVec3], bucket: i64) -> KdIndex {
    KdIndex::create(
        FieldBuffer::from_points(points),
        FieldBuffer::from_column(vec![1.0; points.len()]),
        bucket,
    )
    .unwrap()
}

/// Bind fresh, unpopulated smoothing-length and density outputs
pub fn bind_outputs(index: &KdIndex) -> (SharedBuffer, SharedBuffer) {
    let n = index.n_particles();
    let smooth = FieldBuffer::zeros(n, 1);
    let rho = FieldBuffer::zeros(n, 1);
    index.bind_field(FieldSlot::Smoothing, smooth.clone()).unwrap();
    index.bind_field(FieldSlot::Density, rho.clone()).unwrap();
    (smooth, rho)
}

/// Original indices of the `k` nearest points by brute force
pub fn brute_knn(points: &[NVec3], q: &NVec3, k: usize) -> Vec<(usize, f64)> {
    let mut all: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| (i, periodic_dist2(p, q, &open_boundaries())))
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    all.truncate(k);
    all
}

/// Drain every worker of `d` on the calling thread
pub fn drain_claims(d: &Decomposition) -> Vec<usize> {
    let mut claimed = Vec::new();
    for w in 0..d.workers() {
        while let Some(i) = d.claim(w) {
            claimed.push(i);
        }
    }
    claimed.sort_unstable();
    claimed
}

/// Smoothing-length and density passes with `workers` threads
pub fn run_pipeline(points: &[NVec3], bucket: i64, n_smooth: i64, workers: i64) -> (Vec<f64>, Vec<f64>) {
    let index = unit_mass_index(points, bucket);
    let (smooth, rho) = bind_outputs(&index);
    let session = index.open_session(n_smooth).unwrap();
    index.populate(&session, Property::SmoothingLength, workers).unwrap();
    index.populate(&session, Property::Density, workers).unwrap();
    index.close_session(session);
    index.destroy();
    (smooth.to_vec(), rho.to_vec())
}

// ==================================================================================
// Tree build
// ==================================================================================

#[test]
fn build_rejects_zero_bucket() {
    let positions = FieldBuffer::from_points(&line_points(5));
    let err = KdTree::build(positions, 0).unwrap_err();
    assert!(matches!(err, KdError::InvalidArgument(_)), "got {err:?}");
}

#[test]
fn build_rejects_empty_input() {
    let positions = FieldBuffer::from_points(&[]);
    let err = KdTree::build(positions, 8).unwrap_err();
    assert!(matches!(err, KdError::InvalidArgument(_)), "got {err:?}");
}

#[test]
fn build_rejects_non_f64_positions() {
    let positions = FieldBuffer::zeros_typed(ElementType::F32, 4, 3);
    let err = KdTree::build(positions, 2).unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { field: "position", .. }), "got {err:?}");

    let flat = FieldBuffer::zeros(4, 2);
    let err = KdTree::build(flat, 2).unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { .. }), "got {err:?}");
}

#[test]
fn create_rejects_negative_bucket() {
    let points = line_points(3);
    let err = KdIndex::create(
        FieldBuffer::from_points(&points),
        FieldBuffer::from_column(vec![1.0; 3]),
        -1,
    )
    .unwrap_err();
    assert!(matches!(err, KdError::InvalidArgument(_)), "got {err:?}");
}

#[test]
fn create_rejects_mass_of_wrong_length() {
    let points = line_points(3);
    let err = KdIndex::create(
        FieldBuffer::from_points(&points),
        FieldBuffer::from_column(vec![1.0; 2]),
        4,
    )
    .unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { field: "mass", .. }), "got {err:?}");
}

#[test]
fn identical_points_still_split_to_bucket_size() {
    let points = vec![NVec3::new(0.5, 0.5, 0.5); 50];
    let tree = KdTree::build(FieldBuffer::from_points(&points), 4).unwrap();
    tree.validate().unwrap();
    assert!(tree.leaf_sizes().iter().all(|&s| s <= 4));

    // every distance is zero, so ties fall back to original index
    let got: Vec<usize> = tree
        .k_nearest(&NVec3::new(0.5, 0.5, 0.5), 5)
        .unwrap()
        .iter()
        .map(|n| n.original)
        .collect();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
}

#[test]
fn build_is_reproducible() {
    let points = random_points(500, 3);
    let a = KdTree::build(FieldBuffer::from_points(&points), 7).unwrap();
    let b = KdTree::build(FieldBuffer::from_points(&points), 7).unwrap();
    assert_eq!(a.particles(), b.particles());
    assert_eq!(a.leaf_sizes(), b.leaf_sizes());
}

#[test]
fn teardown_is_idempotent() {
    let mut tree = KdTree::build(FieldBuffer::from_points(&line_points(10)), 2).unwrap();
    assert!(tree.positions().is_some());

    tree.teardown();
    assert!(tree.is_torn_down());
    assert!(tree.positions().is_none());
    assert_eq!(tree.node_count(), 0);

    tree.teardown();
    assert!(tree.is_torn_down());
    assert!(tree.k_nearest(&NVec3::zeros(), 3).unwrap().is_empty());
}

#[test]
fn destroy_releases_buffer_references() {
    let positions = FieldBuffer::from_points(&line_points(10));
    let masses = FieldBuffer::from_column(vec![1.0; 10]);
    let index = KdIndex::create(positions.clone(), masses.clone(), 2).unwrap();
    assert_eq!(std::sync::Arc::strong_count(&positions), 2);
    assert_eq!(std::sync::Arc::strong_count(&masses), 2);

    index.destroy();
    assert_eq!(std::sync::Arc::strong_count(&positions), 1);
    assert_eq!(std::sync::Arc::strong_count(&masses), 1);
}

proptest! {
    #[test]
    fn build_keeps_every_particle_once(
        coords in prop::collection::vec((0.0..1.0f64, 0.0..1.0f64, 0.0..1.0f64), 1..200),
        bucket in 1usize..20,
    ) {
        let points: Vec<NVec3> = coords.iter().map(|&(x, y, z)| NVec3::new(x, y, z)).collect();
        let tree = KdTree::build(FieldBuffer::from_points(&points), bucket).unwrap();

        let mut originals: Vec<usize> = tree.particles().iter().map(|p| p.original_index).collect();
        originals.sort_unstable();
        prop_assert_eq!(originals, (0..points.len()).collect::<Vec<_>>());

        prop_assert!(tree.leaf_sizes().iter().all(|&s| s >= 1 && s <= bucket));
        prop_assert_eq!(tree.leaf_sizes().iter().sum::<usize>(), points.len());
        prop_assert!(tree.validate().is_ok());

        let root = tree.root().unwrap();
        prop_assert!(points.iter().all(|p| root.bbox.contains(p)));
    }
}

// ==================================================================================
// Neighbour queries
// ==================================================================================

#[test]
fn knn_on_a_line_orders_by_distance_then_index() {
    let tree = KdTree::build(FieldBuffer::from_points(&line_points(5)), 1).unwrap();
    let got = tree.k_nearest(&NVec3::new(2.0, 0.0, 0.0), 5).unwrap();

    let originals: Vec<usize> = got.iter().map(|n| n.original).collect();
    let dist2: Vec<f64> = got.iter().map(|n| n.dist2).collect();
    assert_eq!(originals, vec![2, 1, 3, 0, 4]);
    assert_eq!(dist2, vec![0.0, 1.0, 1.0, 4.0, 4.0]);
}

#[test]
fn knn_from_a_gap_returns_both_equidistant_neighbours() {
    // x = 0, 1, 3, 4 queried from the empty slot at x = 2
    let points: Vec<NVec3> = [0.0, 1.0, 3.0, 4.0].iter().map(|&x| NVec3::new(x, 0.0, 0.0)).collect();
    let tree = KdTree::build(FieldBuffer::from_points(&points), 1).unwrap();

    let got: Vec<usize> = tree
        .k_nearest(&NVec3::new(2.0, 0.0, 0.0), 2)
        .unwrap()
        .iter()
        .map(|n| n.original)
        .collect();
    assert_eq!(got, vec![1, 2]);
}

#[test]
fn knn_returns_at_most_active_count() {
    let tree = KdTree::build(FieldBuffer::from_points(&line_points(5)), 2).unwrap();
    assert_eq!(tree.k_nearest(&NVec3::zeros(), 10).unwrap().len(), 5);
    assert!(tree.k_nearest(&NVec3::zeros(), 0).unwrap().is_empty());
}

#[test]
fn inactive_particles_are_never_returned() {
    let mask = [true, false, true, true, true];
    let tree = KdTree::build_masked(FieldBuffer::from_points(&line_points(5)), 1, Some(&mask)).unwrap();
    assert_eq!(tree.len(), 5);
    assert_eq!(tree.n_active(), 4);

    let knn: Vec<usize> = tree
        .k_nearest(&NVec3::new(1.0, 0.0, 0.0), 2)
        .unwrap()
        .iter()
        .map(|n| n.original)
        .collect();
    assert_eq!(knn, vec![0, 2]);

    let ball = tree.ball(&NVec3::new(1.0, 0.0, 0.0), 100.0).unwrap();
    assert_eq!(ball.len(), 4);
    assert!(ball.iter().all(|n| n.original != 1));
}

#[test]
fn periodic_knn_wraps_around_the_box() {
    let points = vec![
        NVec3::new(0.05, 0.5, 0.5),
        NVec3::new(0.5, 0.5, 0.5),
        NVec3::new(0.95, 0.5, 0.5),
    ];
    let tree = KdTree::build(FieldBuffer::from_points(&points), 1).unwrap();
    let mut heap = KnnHeap::new(2);
    let mut out = NeighborList::growable();

    let open = open_boundaries();
    tree.k_nearest_into(&points[0], 2, &open, &mut heap, &mut out).unwrap();
    let originals: Vec<usize> = out.indices.iter().map(|&i| tree.original_index(i).unwrap()).collect();
    assert_eq!(originals, vec![0, 1]);

    let period = NVec3::new(1.0, 1.0, 1.0);
    tree.k_nearest_into(&points[0], 2, &period, &mut heap, &mut out).unwrap();
    let originals: Vec<usize> = out.indices.iter().map(|&i| tree.original_index(i).unwrap()).collect();
    assert_eq!(originals, vec![0, 2]);
    assert_relative_eq!(out.dist2[1], 0.01, max_relative = 1e-9);

    let n = tree.ball_into(&points[0], 0.02, &period, &mut out).unwrap();
    assert_eq!(n, 2);
}

#[test]
fn periodic_queries_accept_points_outside_the_box() {
    let period = NVec3::new(1.0, 1.0, 1.0);
    for seed in 0..5 {
        // spread over several periods on every axis
        let points: Vec<NVec3> = uniform_cube(200, seed, 6.0)
            .iter()
            .map(|p| p - NVec3::repeat(3.0))
            .collect();
        let tree = KdTree::build(FieldBuffer::from_points(&points), 4).unwrap();
        let mut heap = KnnHeap::new(12);
        let mut out = NeighborList::growable();

        for q in [NVec3::new(0.02, 0.5, 0.97), NVec3::new(-2.4, 1.7, 0.1)] {
            tree.k_nearest_into(&q, 12, &period, &mut heap, &mut out).unwrap();
            let got: Vec<usize> = out.indices.iter().map(|&i| tree.original_index(i).unwrap()).collect();

            let mut all: Vec<(usize, f64)> = points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, periodic_dist2(p, &q, &period)))
                .collect();
            all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            let want: Vec<usize> = all.iter().take(12).map(|&(i, _)| i).collect();
            assert_eq!(got, want, "seed {seed}, query {q:?}");

            let n = tree.ball_into(&q, 0.01, &period, &mut out).unwrap();
            let brute = points.iter().filter(|p| periodic_dist2(p, &q, &period) <= 0.01).count();
            assert_eq!(n, brute, "seed {seed}, query {q:?}");
        }
    }
}

#[test]
fn bounded_ball_reports_true_count_and_retries() {
    let tree = KdTree::build(FieldBuffer::from_points(&line_points(5)), 2).unwrap();
    let mut out = NeighborList::bounded(2);

    let err = tree
        .ball_into(&NVec3::new(2.0, 0.0, 0.0), 100.0, &open_boundaries(), &mut out)
        .unwrap_err();
    assert_eq!(err, KdError::CapacityExceeded { capacity: 2, required: 5 });
    assert!(err.is_recoverable());

    out.set_limit(Some(5));
    let n = tree
        .ball_into(&NVec3::new(2.0, 0.0, 0.0), 100.0, &open_boundaries(), &mut out)
        .unwrap();
    assert_eq!(n, 5);
}

#[test]
fn ball_boundary_is_inclusive() {
    let tree = KdTree::build(FieldBuffer::from_points(&line_points(5)), 1).unwrap();
    let got = tree.ball(&NVec3::new(2.0, 0.0, 0.0), 1.0).unwrap();
    let originals: BTreeSet<usize> = got.iter().map(|n| n.original).collect();
    assert_eq!(originals, BTreeSet::from([1, 2, 3]));
}

proptest! {
    #[test]
    fn knn_matches_brute_force(seed in 0u64..1000, k in 1usize..40, bucket in 1usize..12) {
        let points = random_points(150, seed);
        let tree = KdTree::build(FieldBuffer::from_points(&points), bucket).unwrap();
        let q = NVec3::new(0.3, 0.6, 0.5);

        let got: Vec<usize> = tree.k_nearest(&q, k).unwrap().iter().map(|n| n.original).collect();
        let want: Vec<usize> = brute_knn(&points, &q, k).iter().map(|&(i, _)| i).collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn ball_count_never_shrinks_with_radius(
        seed in 0u64..1000,
        r_small in 0.0..0.5f64,
        grow in 0.0..0.5f64,
    ) {
        let points = random_points(120, seed);
        let tree = KdTree::build(FieldBuffer::from_points(&points), 6).unwrap();
        let q = NVec3::new(0.5, 0.5, 0.5);

        let r2_small = r_small * r_small;
        let r2_large = (r_small + grow) * (r_small + grow);
        let small = tree.ball(&q, r2_small).unwrap().len();
        let large = tree.ball(&q, r2_large).unwrap().len();
        prop_assert!(small <= large);

        let brute = points.iter().filter(|p| periodic_dist2(p, &q, &open_boundaries()) <= r2_large).count();
        prop_assert_eq!(large, brute);
    }
}

// ==================================================================================
// Field bindings
// ==================================================================================

#[test]
fn bind_field_validates_type_and_length() {
    let index = unit_mass_index(&line_points(5), 2);

    let err = index.bind_field(FieldSlot::Density, FieldBuffer::zeros(4, 1)).unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { field: "rho", .. }), "got {err:?}");

    let err = index
        .bind_field(FieldSlot::Smoothing, FieldBuffer::zeros_typed(ElementType::F32, 5, 1))
        .unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { field: "smooth", .. }), "got {err:?}");

    let err = index.bind_field(FieldSlot::Smoothing, FieldBuffer::zeros(5, 3)).unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { .. }), "got {err:?}");

    // vector quantities are fine
    index.bind_field(FieldSlot::Quantity, FieldBuffer::zeros(5, 3)).unwrap();
}

#[test]
fn rebinding_replaces_previous_buffer() {
    let index = unit_mass_index(&line_points(5), 2);
    assert!(index.get_field(FieldSlot::Density).is_none());

    let first = FieldBuffer::zeros(5, 1);
    let second = FieldBuffer::zeros(5, 1);
    assert!(index.bind_field(FieldSlot::Density, first.clone()).unwrap().is_none());
    let replaced = index.bind_field(FieldSlot::Density, second.clone()).unwrap().unwrap();
    assert!(std::sync::Arc::ptr_eq(&replaced, &first));
    assert!(std::sync::Arc::ptr_eq(&index.get_field(FieldSlot::Density).unwrap(), &second));

    assert!(index.unbind_field(FieldSlot::Density).is_some());
    assert!(index.get_field(FieldSlot::Density).is_none());
}

#[test]
fn slot_and_property_ids_are_checked() {
    let index = unit_mass_index(&line_points(5), 2);
    index.bind_field_id(0, FieldBuffer::zeros(5, 1)).unwrap();
    assert!(index.get_field(FieldSlot::Smoothing).is_some());

    assert!(matches!(
        index.bind_field_id(5, FieldBuffer::zeros(5, 1)),
        Err(KdError::InvalidArgument(_))
    ));
    assert!(matches!(Property::from_id(0), Err(KdError::InvalidArgument(_))));
    assert_eq!(Property::from_id(2).unwrap(), Property::Density);
}

// ==================================================================================
// Query sessions
// ==================================================================================

#[test]
fn session_steps_every_particle_once() {
    let index = unit_mass_index(&line_points(5), 1);
    let mut session = index.open_session(3).unwrap();

    let mut seen = BTreeSet::new();
    while let Some(step) = index.step_session(&mut session).unwrap() {
        assert_eq!(step.neighbors.len(), 3);
        assert!(step.neighbors.contains(&step.original_index));
        match step.original_index {
            0 | 4 => assert_eq!(step.smoothing_length, 2.0),
            _ => assert_eq!(step.smoothing_length, 1.0),
        }
        assert!(seen.insert(step.original_index));
    }
    assert_eq!(seen, (0..5).collect::<BTreeSet<_>>());
    assert!(session.completed_sweep());

    // Done is sticky until rewind
    assert!(index.step_session(&mut session).unwrap().is_none());
}

#[test]
fn rewind_restarts_the_sweep() {
    let index = unit_mass_index(&random_points(40, 1), 4);
    let mut session = index.open_session(8).unwrap();

    let mut first = Vec::new();
    while let Some(step) = index.step_session(&mut session).unwrap() {
        first.push(step);
    }
    index.rewind_session(&mut session);
    let mut second = Vec::new();
    while let Some(step) = index.step_session(&mut session).unwrap() {
        second.push(step);
    }
    assert_eq!(first.len(), 40);
    assert_eq!(first, second);
}

#[test]
fn finished_session_refuses_to_step() {
    let tree = std::sync::Arc::new(KdTree::build(FieldBuffer::from_points(&line_points(5)), 2).unwrap());
    let mut session = SmoothingContext::new(tree, SmoothingParams::new(2)).unwrap();
    assert!(session.step().unwrap().is_some());

    session.finish();
    assert!(session.is_finished());
    assert!(matches!(session.step(), Err(KdError::InvalidArgument(_))));

    session.rewind();
    assert!(session.step().unwrap().is_some());
}

#[test]
fn session_rejects_bad_parameters() {
    let index = unit_mass_index(&line_points(5), 2);
    assert!(matches!(index.open_session(0), Err(KdError::InvalidArgument(_))));
    assert!(matches!(index.open_session(-3), Err(KdError::InvalidArgument(_))));

    let bad_period = SmoothingParams::new(2).with_period(NVec3::new(1.0, 0.0, 1.0));
    assert!(matches!(index.open_session_with(bad_period), Err(KdError::InvalidArgument(_))));
}

#[test]
fn session_from_another_index_is_rejected() {
    let a = unit_mass_index(&line_points(5), 2);
    let b = unit_mass_index(&line_points(5), 2);
    bind_outputs(&a);
    let mut session = b.open_session(2).unwrap();

    assert!(matches!(a.step_session(&mut session), Err(KdError::InvalidArgument(_))));
    assert!(matches!(
        a.compute_property(&session, Property::SmoothingLength, 0),
        Err(KdError::InvalidArgument(_))
    ));
}

#[test]
fn thread_local_copy_has_its_own_cursor() {
    let tree = std::sync::Arc::new(KdTree::build(FieldBuffer::from_points(&line_points(6)), 2).unwrap());
    let mut parent = SmoothingContext::new(tree, SmoothingParams::new(2)).unwrap();
    parent.step().unwrap();
    parent.step().unwrap();

    let mut copy = parent.thread_local_copy(None, 0);
    let mut count = 0;
    while copy.step().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 6);
    assert!(parent.step().unwrap().is_some());
}

#[test]
fn bounded_session_ball_fails_but_gather_grows() {
    let tree = std::sync::Arc::new(KdTree::build(FieldBuffer::from_points(&line_points(10)), 2).unwrap());
    let params = SmoothingParams::new(1).with_ball_capacity(1);
    let mut session = SmoothingContext::new(tree, params).unwrap();
    let q = NVec3::new(5.0, 0.0, 0.0);

    let err = session.ball(&q, 4.0).unwrap_err();
    assert_eq!(err, KdError::CapacityExceeded { capacity: 1, required: 5 });

    assert_eq!(session.gather(&q, 4.0).unwrap().len(), 5);
}

// ==================================================================================
// Decomposition
// ==================================================================================

#[test]
fn decompose_validates_arguments() {
    let index = unit_mass_index(&line_points(5), 2);
    assert_eq!(
        index.decompose(2).unwrap_err(),
        KdError::UnboundField(FieldSlot::Smoothing)
    );

    bind_outputs(&index);
    assert!(matches!(index.decompose(-1), Err(KdError::InvalidArgument(_))));
    assert!(index.decompose(0).unwrap().is_none());
    assert_eq!(index.decompose(3).unwrap().unwrap().workers(), 3);
}

#[test]
fn zero_workers_means_one_unsplit_worker() {
    let tree = KdTree::build(FieldBuffer::from_points(&line_points(5)), 2).unwrap();
    let d = Decomposition::new(&tree, 0, ClaimStrategy::Contiguous);
    assert_eq!(d.requested(), 0);
    assert_eq!(d.workers(), 1);
    assert_eq!(d.assignment(0).unwrap().len(), 5);
    assert!(d.check_worker(1).is_err());
}

#[test]
fn masked_particles_are_never_claimed() {
    let mask = [true, false, true, false, true, true];
    let tree = KdTree::build_masked(FieldBuffer::from_points(&line_points(6)), 2, Some(&mask)).unwrap();
    let d = Decomposition::new(&tree, 2, ClaimStrategy::Interleaved);

    let claimed: BTreeSet<usize> = drain_claims(&d)
        .into_iter()
        .map(|i| tree.original_index(i).unwrap())
        .collect();
    assert_eq!(claimed, BTreeSet::from([0, 2, 4, 5]));
}

#[test]
fn claims_cover_everything_across_threads() {
    let tree = KdTree::build(FieldBuffer::from_points(&random_points(1000, 9)), 8).unwrap();

    for strategy in [ClaimStrategy::Shared, ClaimStrategy::Contiguous, ClaimStrategy::Interleaved] {
        let d = Decomposition::new(&tree, 4, strategy);
        let mut claimed: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..d.workers())
                .map(|w| {
                    let d = &d;
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        while let Some(i) = d.claim(w) {
                            mine.push(i);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        claimed.sort_unstable();
        assert_eq!(claimed, (0..1000).collect::<Vec<_>>(), "{strategy:?}");
    }
}

proptest! {
    #[test]
    fn claims_cover_everything_for_any_worker_count(
        n in 1usize..60,
        workers_frac in 0.0..=1.0f64,
        strategy in prop_oneof![
            Just(ClaimStrategy::Shared),
            Just(ClaimStrategy::Contiguous),
            Just(ClaimStrategy::Interleaved),
        ],
    ) {
        let workers = (workers_frac * n as f64).round() as usize;
        let tree = KdTree::build(FieldBuffer::from_points(&line_points(n)), 3).unwrap();
        let d = Decomposition::new(&tree, workers, strategy);
        prop_assert_eq!(drain_claims(&d), (0..n).collect::<Vec<_>>());
    }
}

// ==================================================================================
// Pipeline
// ==================================================================================

#[test]
fn density_requires_smoothing_length() {
    let index = unit_mass_index(&random_points(50, 2), 8);
    let rho = FieldBuffer::zeros(50, 1);
    index.bind_field(FieldSlot::Density, rho.clone()).unwrap();
    let session = index.open_session(8).unwrap();

    let err = index.populate(&session, Property::Density, 2).unwrap_err();
    assert_eq!(err, KdError::UnboundField(FieldSlot::Smoothing));

    index.bind_field(FieldSlot::Smoothing, FieldBuffer::zeros(50, 1)).unwrap();
    let err = index.populate(&session, Property::Density, 2).unwrap_err();
    assert_eq!(err, KdError::UnmetDependency(FieldSlot::Smoothing));
    let err = index.compute_property(&session, Property::Density, 0).unwrap_err();
    assert_eq!(err, KdError::UnmetDependency(FieldSlot::Smoothing));

    // nothing was written
    assert!(rho.to_vec().iter().all(|&v| v == 0.0));
    assert!(!rho.is_populated());
}

#[test]
fn output_must_be_bound() {
    let index = unit_mass_index(&random_points(20, 2), 8);
    index.bind_field(FieldSlot::Smoothing, FieldBuffer::zeros(20, 1)).unwrap();
    let session = index.open_session(4).unwrap();
    index.populate(&session, Property::SmoothingLength, 1).unwrap();

    let err = index.populate(&session, Property::Density, 1).unwrap_err();
    assert_eq!(err, KdError::UnboundField(FieldSlot::Density));
}

#[test]
fn smoothing_length_matches_brute_force() {
    let points = random_points(200, 11);
    let (smooth, _) = run_pipeline(&points, 8, 16, 3);

    for (i, p) in points.iter().enumerate() {
        let kth = brute_knn(&points, p, 16).last().unwrap().1;
        assert_relative_eq!(smooth[i], kth.sqrt(), max_relative = 1e-12);
    }
}

#[test]
fn host_driven_session_matches_pipeline() {
    let points = random_points(120, 5);
    let index = unit_mass_index(&points, 6);
    let (smooth, _) = bind_outputs(&index);
    let mut session = index.open_session(10).unwrap();
    index.populate(&session, Property::SmoothingLength, 4).unwrap();

    let mut host = vec![0.0; points.len()];
    while let Some(step) = index.step_session(&mut session).unwrap() {
        host[step.original_index] = step.smoothing_length;
    }
    assert_eq!(host, smooth.to_vec());
}

#[test]
fn compute_property_per_worker_on_host_threads() {
    let points = random_points(300, 4);
    let index = unit_mass_index(&points, 8);
    let (smooth, rho) = bind_outputs(&index);
    let session = index.open_session(16).unwrap();

    for property in [Property::SmoothingLength, Property::Density] {
        let d = index.decompose(4).unwrap().unwrap();
        let reports = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|w| {
                    let (index, session) = (&index, &session);
                    s.spawn(move || index.compute_property(session, property, w).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });
        assert_eq!(reports.iter().map(|r| r.processed).sum::<usize>(), 300);
        assert!(reports.iter().all(|r| r.state == WorkerState::Exhausted));
        assert_eq!(d.len(), 300);
    }

    assert!(smooth.is_populated());
    assert!(rho.is_populated());
    assert!(rho.to_vec().iter().all(|&v| v.is_finite() && v > 0.0));

    // the decomposition above is spent; a worker on it finds nothing left
    let spent = index.compute_property(&session, Property::Density, 0).unwrap();
    assert_eq!(spent.processed, 0);
}

#[test]
fn compute_property_without_decomposition_runs_one_worker() {
    let index = unit_mass_index(&random_points(60, 8), 8);
    let (smooth, _) = bind_outputs(&index);
    let session = index.open_session(8).unwrap();

    index.decompose(0).unwrap();
    let report = index.compute_property_id(&session, 1, 0).unwrap();
    assert_eq!(report.processed, 60);
    assert!(smooth.is_populated());

    assert!(matches!(
        index.compute_property(&session, Property::Density, 1),
        Err(KdError::InvalidArgument(_))
    ));
    assert!(matches!(
        index.compute_property(&session, Property::Density, -1),
        Err(KdError::InvalidArgument(_))
    ));
}

#[test]
fn density_is_identical_for_one_and_four_workers() {
    let points = random_points(400, 21);
    let (smooth, _) = run_pipeline(&points, 8, 32, 1);

    let density_with = |workers: i64| {
        let index = unit_mass_index(&points, 8);
        index.bind_field(FieldSlot::Smoothing, FieldBuffer::from_column(smooth.clone())).unwrap();
        let rho = FieldBuffer::zeros(points.len(), 1);
        index.bind_field(FieldSlot::Density, rho.clone()).unwrap();
        let session = index.open_session(32).unwrap();
        index.populate(&session, Property::Density, workers).unwrap();
        rho.to_vec()
    };

    assert_eq!(density_with(1), density_with(4));
}

#[test]
fn bounded_gather_scratch_gives_the_same_density() {
    let points = random_points(150, 13);
    let (_, reference) = run_pipeline(&points, 8, 16, 2);

    let index = unit_mass_index(&points, 8);
    let (_, rho) = bind_outputs(&index);
    let session = index
        .open_session_with(SmoothingParams::new(16).with_ball_capacity(1))
        .unwrap();
    index.populate(&session, Property::SmoothingLength, 2).unwrap();
    index.populate(&session, Property::Density, 2).unwrap();
    assert_eq!(rho.to_vec(), reference);
}

#[test]
fn end_to_end_uniform_cloud() {
    let points = random_points(100, 42);
    let (smooth_a, rho_a) = run_pipeline(&points, 8, 32, 4);
    let (smooth_b, rho_b) = run_pipeline(&points, 8, 32, 4);

    assert!(smooth_a.iter().all(|&h| h.is_finite() && h > 0.0));
    assert!(rho_a.iter().all(|&r| r.is_finite() && r > 0.0));
    assert_eq!(smooth_a, smooth_b);
    assert_eq!(rho_a, rho_b);
}

#[test]
fn periodic_density_is_translation_invariant() {
    let points = random_points(200, 17);
    let shifted: Vec<NVec3> = points
        .iter()
        .map(|p| p.map(|c| (c + 0.37).rem_euclid(1.0)))
        .collect();

    let density = |pts: &[NVec3]| {
        let index = unit_mass_index(pts, 8);
        let (_, rho) = bind_outputs(&index);
        let params = SmoothingParams::new(16).with_period(NVec3::new(1.0, 1.0, 1.0));
        let session = index.open_session_with(params).unwrap();
        index.populate(&session, Property::SmoothingLength, 2).unwrap();
        index.populate(&session, Property::Density, 2).unwrap();
        rho.to_vec()
    };

    for (a, b) in density(&points).iter().zip(density(&shifted)) {
        assert_relative_eq!(*a, b, max_relative = 1e-9);
    }
}

#[test]
fn quantity_mean_and_dispersion_scale_with_the_field() {
    let points = random_points(150, 23);
    let n = points.len();
    let index = unit_mass_index(&points, 8);
    bind_outputs(&index);
    let session = index.open_session(24).unwrap();

    // quantity passes need a populated density first
    index.bind_field(FieldSlot::Quantity, FieldBuffer::from_column(vec![1.0; n])).unwrap();
    index.bind_field(FieldSlot::QuantitySmoothed, FieldBuffer::zeros(n, 1)).unwrap();
    index.populate(&session, Property::SmoothingLength, 2).unwrap();
    let err = index.populate(&session, Property::QuantityMean, 2).unwrap_err();
    assert_eq!(err, KdError::UnmetDependency(FieldSlot::Density));
    index.populate(&session, Property::Density, 2).unwrap();

    // column 1 is five times column 0
    let qty: Vec<f64> = points.iter().flat_map(|p| [p.x, 5.0 * p.x]).collect();
    index.bind_field(FieldSlot::Quantity, FieldBuffer::from_values(n, 2, qty).unwrap()).unwrap();

    let err = index.populate(&session, Property::QuantityMean, 2).unwrap_err();
    assert!(matches!(err, KdError::TypeMismatch { field: "qty_sm", .. }), "got {err:?}");

    let mean = FieldBuffer::zeros(n, 2);
    index.bind_field(FieldSlot::QuantitySmoothed, mean.clone()).unwrap();
    index.populate(&session, Property::QuantityMean, 3).unwrap();
    for i in 0..n {
        assert!(mean.get2(i, 0).is_finite());
        assert_relative_eq!(mean.get2(i, 1), 5.0 * mean.get2(i, 0), max_relative = 1e-12);
    }

    let single: Vec<f64> = points.iter().map(|p| p.x).collect();
    let scaled: Vec<f64> = points.iter().map(|p| 5.0 * p.x).collect();
    let dispersion_of = |values: Vec<f64>| {
        index.bind_field(FieldSlot::Quantity, FieldBuffer::from_column(values)).unwrap();
        let out = FieldBuffer::zeros(n, 1);
        index.bind_field(FieldSlot::QuantitySmoothed, out.clone()).unwrap();
        index.populate(&session, Property::QuantityDispersion, 2).unwrap();
        out.to_vec()
    };
    let base = dispersion_of(single);
    let five = dispersion_of(scaled);
    for (a, b) in base.iter().zip(&five) {
        assert!(*a >= 0.0 && a.is_finite());
        assert_relative_eq!(*b, 5.0 * a, max_relative = 1e-9, epsilon = 1e-12);
    }
}

#[test]
fn rerunning_one_worker_does_not_mark_output_populated() {
    let index = unit_mass_index(&random_points(40, 6), 4).with_claim_strategy(ClaimStrategy::Contiguous);
    let (smooth, _) = bind_outputs(&index);
    let session = index.open_session(8).unwrap();

    index.decompose(2).unwrap();
    let first = index.compute_property(&session, Property::SmoothingLength, 0).unwrap();
    let again = index.compute_property(&session, Property::SmoothingLength, 0).unwrap();
    assert_eq!(first.processed, 20);
    assert_eq!(again.processed, 0);
    assert!(!smooth.is_populated());

    // worker 1's block is still zero, so density must not run
    let err = index.populate(&session, Property::Density, 1).unwrap_err();
    assert_eq!(err, KdError::UnmetDependency(FieldSlot::Smoothing));

    let rest = index.compute_property(&session, Property::SmoothingLength, 1).unwrap();
    assert_eq!(rest.processed, 20);
    assert!(smooth.is_populated());
    assert!(smooth.to_vec().iter().all(|&h| h > 0.0));

    // a spent decomposition never marks a freshly bound output
    let fresh = FieldBuffer::zeros(40, 1);
    index.bind_field(FieldSlot::Smoothing, fresh.clone()).unwrap();
    let spent = index.compute_property(&session, Property::SmoothingLength, 0).unwrap();
    assert_eq!(spent.processed, 0);
    assert!(!fresh.is_populated());
}

#[test]
fn failed_worker_fails_the_run_and_leaves_output_unpopulated() {
    let small = KdTree::build(FieldBuffer::from_points(&line_points(20)), 4).unwrap();
    let large = KdTree::build(FieldBuffer::from_points(&line_points(40)), 4).unwrap();
    let session = SmoothingContext::new(std::sync::Arc::new(small), SmoothingParams::new(3)).unwrap();

    let smooth = FieldBuffer::zeros(20, 1);
    let mut bindings = FieldBindings::new(20);
    bindings.bind(FieldSlot::Smoothing, smooth.clone()).unwrap();

    // worker 1 claims physical slots 20..40, which the session's tree lacks
    let decomposition = std::sync::Arc::new(Decomposition::new(&large, 2, ClaimStrategy::Contiguous));
    let err = run_parallel(&session, &bindings, decomposition.clone(), Property::SmoothingLength).unwrap_err();
    assert!(matches!(err, KdError::InternalInvariant(_)), "got {err:?}");
    assert!(!smooth.is_populated());
    assert!(decomposition.completed() < decomposition.len());
}

#[test]
fn single_neighbour_smoothing_gives_zero_density() {
    let index = unit_mass_index(&random_points(30, 9), 4);
    let (smooth, rho) = bind_outputs(&index);
    let session = index.open_session(1).unwrap();

    index.populate(&session, Property::SmoothingLength, 2).unwrap();
    index.populate(&session, Property::Density, 2).unwrap();
    assert!(smooth.to_vec().iter().all(|&h| h == 0.0));
    assert!(rho.to_vec().iter().all(|&r| r == 0.0));
    assert!(rho.is_populated());
}

// ==================================================================================
// Kernels
// ==================================================================================

#[test]
fn kernels_vanish_outside_support() {
    for kernel in [Kernel::CubicSpline, Kernel::WendlandC2] {
        assert_eq!(kernel.weight(2.0, 1.0), 0.0);
        assert_eq!(kernel.weight(3.5, 1.0), 0.0);
        assert_eq!(kernel.weight(0.5, 0.0), 0.0);
        assert!(kernel.weight(1.999, 1.0) >= 0.0);
        assert!(kernel.weight(0.0, 1.0) > kernel.weight(1.0, 1.0));
    }
}

#[test]
fn kernels_are_normalised() {
    let h = 0.7;
    let steps = 200_000;
    for kernel in [Kernel::CubicSpline, Kernel::WendlandC2] {
        let rmax = kernel.support() * h;
        let dr = rmax / steps as f64;
        let integral: f64 = (0..steps)
            .map(|i| {
                let r = (i as f64 + 0.5) * dr;
                4.0 * std::f64::consts::PI * r * r * kernel.weight(r, h) * dr
            })
            .sum();
        assert_relative_eq!(integral, 1.0, max_relative = 1e-6);
    }
}

// ==================================================================================
// Configuration
// ==================================================================================

#[test]
fn run_config_maps_to_parameters() {
    let yaml = r#"
tree:
  bucket_size: 8
smoothing:
  n_smooth: 32
  kernel: "wendland_c2"
  period: [1.0, 2.0, 3.0]
  workers: 4
  strategy: "interleaved"
particles:
  uniform:
    count: 64
    seed: 5
    box_size: 2.0
    mass: 0.5
"#;
    let cfg: RunConfig = serde_yaml::from_str(yaml).unwrap();
    let params = cfg.smoothing.to_params().unwrap();
    assert_eq!(params.n_smooth, 32);
    assert_eq!(params.kernel, Kernel::WendlandC2);
    assert_eq!(params.period, NVec3::new(1.0, 2.0, 3.0));
    assert_eq!(params.ball_factor, kdsmooth::DEFAULT_BALL_FACTOR);
    assert_eq!(cfg.smoothing.strategy, ClaimStrategy::Interleaved);

    let (points, masses) = cfg.particles.generate().unwrap();
    assert_eq!(points.len(), 64);
    assert!(masses.iter().all(|&m| m == 0.5));
    assert!(points.iter().all(|p| p.iter().all(|&c| (0.0..2.0).contains(&c))));
}

#[test]
fn run_config_defaults_and_explicit_particles() {
    let yaml = r#"
tree:
  bucket_size: 2
smoothing:
  n_smooth: 2
particles:
  explicit:
    - { x: [0.0, 0.0, 0.0], m: 1.0 }
    - { x: [1.0, 0.0], m: 1.0 }
"#;
    let cfg: RunConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(cfg.smoothing.workers, 1);
    assert_eq!(cfg.smoothing.strategy, ClaimStrategy::Shared);

    let params = cfg.smoothing.to_params().unwrap();
    assert_eq!(params.kernel, Kernel::CubicSpline);
    assert!(!params.is_periodic());

    assert!(matches!(cfg.particles.generate(), Err(KdError::InvalidArgument(_))));
}
