use crate::comm::{Communicator, SingleProcess, ThreadGroup};
use crate::config::{rank_file_name, IncrementalSvdConfig, UpdateMethod};
use crate::diagnostics::SampleClass;
use crate::incremental_svd::{IncrementalSvd, IntervalState, SampleOutcome};
use crate::linalg_backends::{BackendSVD, LinAlgBackendProvider};
use crate::matrix::Matrix;
use crate::ThreadSafeStdError;

use approx::assert_abs_diff_eq;
use ndarray::{concatenate, Array1, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

const BOTH_METHODS: [UpdateMethod; 2] = [UpdateMethod::FastUpdate, UpdateMethod::Standard];

fn svd_with(config: IncrementalSvdConfig) -> IncrementalSvd {
    IncrementalSvd::new(config, Arc::new(SingleProcess)).unwrap()
}

fn config(dim: usize, linearity_tol: f64, method: UpdateMethod) -> IncrementalSvdConfig {
    IncrementalSvdConfig {
        linearity_tol,
        update_method: method,
        ..IncrementalSvdConfig::with_dim(dim)
    }
}

/// Samples `modes * c + noise` with a fixed random `dim x rank` mode matrix.
fn low_rank_samples(dim: usize, rank: usize, num_samples: usize, noise: f64, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let modes = Array2::from_shape_fn((dim, rank), |_| normal.sample(&mut rng));
    (0..num_samples)
        .map(|_| {
            let coefficients = Array1::from_shape_fn(rank, |_| normal.sample(&mut rng));
            let mut x = modes.dot(&coefficients);
            x.mapv_inplace(|v| v + noise * normal.sample(&mut rng));
            x.to_vec()
        })
        .collect()
}

fn sample_matrix(samples: &[Vec<f64>]) -> Array2<f64> {
    let dim = samples[0].len();
    Array2::from_shape_fn((dim, samples.len()), |(i, j)| samples[j][i])
}

fn projector(basis: &Matrix) -> Array2<f64> {
    basis.as_array().dot(&basis.as_array().t())
}

fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    (a - b).iter().fold(0.0, |m, &x| m.max(x.abs()))
}

#[test]
fn test_identical_directions_stay_rank_one() {
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(3, 0.5, method));
        let outcomes: Vec<_> = [1.0, 2.0, 3.0]
            .iter()
            .enumerate()
            .map(|(t, &c)| svd.take_sample(&[c, 2.0 * c, 2.0 * c], t as f64).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                SampleOutcome::InitialSvd,
                SampleOutcome::LinearlyDependent { folded: true },
                SampleOutcome::LinearlyDependent { folded: true },
            ]
        );
        assert_eq!(svd.rank(), 1);
        assert_eq!(svd.num_samples(), 3);
        // Folding a dependent sample of norm n into S = s gives sqrt(s^2 + n^2).
        assert_abs_diff_eq!(svd.get_singular_values()[0], 126.0f64.sqrt(), epsilon = 1e-12);
        let basis = svd.compute_basis();
        assert_abs_diff_eq!(basis.item(0, 0).abs(), 1.0 / 3.0, epsilon = 1e-14);
        assert_abs_diff_eq!(basis.item(1, 0).abs(), 2.0 / 3.0, epsilon = 1e-14);
    }
}

#[test]
fn test_orthogonal_unit_samples_give_full_orthogonal_basis() {
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(2, 1e-6, method));
        assert_eq!(svd.take_sample(&[1.0, 0.0], 0.0).unwrap(), SampleOutcome::InitialSvd);
        assert_eq!(svd.take_sample(&[0.0, 1.0], 0.0).unwrap(), SampleOutcome::NewBasisVector);
        assert_eq!(svd.rank(), 2);
        assert_eq!(svd.state(), IntervalState::Accumulating { rank: 2 });
        let s = svd.get_singular_values();
        assert_abs_diff_eq!(s[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(s[1], 1.0, epsilon = 1e-14);
        // A square orthogonal U: U U^T = I.
        let p = projector(svd.compute_basis());
        assert!(max_abs_diff(&p, &Array2::eye(2)) < 1e-14);
    }
}

#[test]
fn test_full_interval_signals_boundary_without_consuming_sample() {
    for method in BOTH_METHODS {
        let mut svd = svd_with(IncrementalSvdConfig {
            samples_per_time_interval: 2,
            ..config(3, 1e-6, method)
        });
        svd.take_sample(&[1.0, 0.0, 0.0], 0.0).unwrap();
        svd.take_sample(&[0.0, 1.0, 0.0], 1.0).unwrap();
        assert!(svd.is_new_time_interval());
        assert_eq!(svd.take_sample(&[0.0, 0.0, 1.0], 2.0).unwrap(), SampleOutcome::IntervalBoundary);
        assert_eq!(svd.rank(), 2);
        assert_eq!(svd.num_samples(), 2);
        assert_eq!(svd.state(), IntervalState::IntervalBoundary { rank: 2 });

        // Still refused until the caller starts a new interval.
        assert_eq!(svd.take_sample(&[0.0, 0.0, 1.0], 2.0).unwrap(), SampleOutcome::IntervalBoundary);
        assert_eq!(svd.compute_basis().num_columns(), 2);

        svd.start_new_interval();
        assert_eq!(svd.rank(), 0);
        assert_eq!(svd.take_sample(&[0.0, 0.0, 1.0], 2.0).unwrap(), SampleOutcome::InitialSvd);
        assert_eq!(svd.num_basis_time_intervals(), 2);
        assert_eq!(svd.time_interval_start_times(), &[0.0, 2.0]);
        assert_eq!(svd.basis_interval_start_time(1), 2.0);
        assert_eq!(svd.rank(), 1);
    }
}

#[test]
fn test_dependent_samples_do_not_hit_the_rank_cap() {
    let mut svd = svd_with(IncrementalSvdConfig {
        samples_per_time_interval: 1,
        ..config(2, 1e-6, UpdateMethod::FastUpdate)
    });
    svd.take_sample(&[1.0, 1.0], 0.0).unwrap();
    assert_eq!(
        svd.take_sample(&[2.0, 2.0], 1.0).unwrap(),
        SampleOutcome::LinearlyDependent { folded: true }
    );
    assert_eq!(svd.take_sample(&[1.0, -1.0], 2.0).unwrap(), SampleOutcome::IntervalBoundary);
}

#[test]
fn test_basis_stays_orthonormal_after_every_sample() {
    let samples = low_rank_samples(60, 8, 40, 1e-4, 7);
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(60, 1e-3, method));
        for (t, sample) in samples.iter().enumerate() {
            svd.take_sample(sample, t as f64).unwrap();
            let error = svd.compute_basis().orthogonality_error(&SingleProcess);
            assert!(error < 1e-10, "{}: orthogonality error {:e} after sample {}", svd.strategy_name(), error, t);
        }
    }
}

#[test]
fn test_compute_basis_is_idempotent() {
    let samples = low_rank_samples(20, 4, 10, 1e-2, 11);
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(20, 1e-6, method));
        for (t, sample) in samples.iter().enumerate() {
            svd.take_sample(sample, t as f64).unwrap();
        }
        let first = svd.compute_basis().clone();
        let second = svd.get_basis().clone();
        assert_eq!(first, second);
    }
}

#[test]
fn test_dependent_count_is_monotone_in_tolerance() {
    // Three orthogonal directions, then nine samples in their span with a
    // small component along a fresh coordinate each.
    let dim = 20;
    let mut samples = Vec::new();
    for i in 0..3 {
        let mut x = vec![0.0; dim];
        x[i] = 1.0 + i as f64;
        samples.push(x);
    }
    for i in 0..9 {
        let mut x = vec![0.0; dim];
        x[0] = 1.0;
        x[1] = -0.5 + 0.1 * i as f64;
        x[2] = 0.25;
        x[3 + i] = 1e-3;
        samples.push(x);
    }

    let mut previous = 0;
    for tol in [1e-6, 1e-2, 0.5] {
        let mut svd = svd_with(IncrementalSvdConfig {
            debug_algorithm: true,
            ..config(dim, tol, UpdateMethod::FastUpdate)
        });
        for (t, sample) in samples.iter().enumerate() {
            svd.take_sample(sample, t as f64).unwrap();
        }
        let dependent = svd
            .diagnostics()
            .iter()
            .filter(|d| d.class == SampleClass::Dependent)
            .count();
        assert!(dependent >= previous, "tol {}: {} dependent < {}", tol, dependent, previous);
        previous = dependent;
        if tol == 1e-6 {
            assert_eq!(dependent, 0);
            assert_eq!(svd.rank(), 12);
        } else {
            assert_eq!(dependent, 9);
            assert_eq!(svd.rank(), 3);
        }
    }
}

#[test]
fn test_dependent_samples_are_reconstructed_within_tolerance() {
    let samples = low_rank_samples(30, 3, 25, 1e-5, 3);
    let tol = 1e-3;
    let mut svd = svd_with(IncrementalSvdConfig {
        debug_algorithm: true,
        ..config(30, tol, UpdateMethod::FastUpdate)
    });
    for (t, sample) in samples.iter().enumerate() {
        // Measure the reconstruction against the basis before the update.
        let before = if svd.state() == IntervalState::Uninitialized {
            None
        } else {
            let basis = svd.compute_basis().as_array().clone();
            let x = Array1::from(sample.clone());
            let residual = &x - &basis.dot(&basis.t().dot(&x));
            Some(residual.dot(&residual).sqrt() / x.dot(&x).sqrt())
        };
        let outcome = svd.take_sample(sample, t as f64).unwrap();
        if outcome == (SampleOutcome::LinearlyDependent { folded: true }) {
            let ratio = before.unwrap();
            assert!(ratio < tol, "dependent sample {} has reconstruction ratio {:e}", t, ratio);
        }
    }
    assert_eq!(svd.rank(), 3);
    for d in svd.diagnostics() {
        if d.class == SampleClass::Dependent {
            assert!(d.residual_ratio < tol);
        }
        if let Some(error) = d.small_svd_relative_error {
            assert!(error < 1e-12);
        }
    }
}

#[test]
fn test_rank_never_exceeds_cap_or_independent_count() {
    let samples = low_rank_samples(15, 15, 12, 0.0, 5);
    let mut svd = svd_with(IncrementalSvdConfig {
        samples_per_time_interval: 5,
        debug_algorithm: true,
        ..config(15, 1e-8, UpdateMethod::FastUpdate)
    });
    let mut independent = 0;
    for (t, sample) in samples.iter().enumerate() {
        match svd.take_sample(sample, t as f64).unwrap() {
            SampleOutcome::InitialSvd | SampleOutcome::NewBasisVector => independent += 1,
            SampleOutcome::IntervalBoundary => break,
            SampleOutcome::LinearlyDependent { .. } => {}
        }
        assert!(svd.rank() <= 5);
        assert!(svd.rank() <= independent);
    }
    assert_eq!(svd.rank(), 5);
}

#[test]
fn test_singular_values_match_batch_svd() -> Result<(), ThreadSafeStdError> {
    let samples = low_rank_samples(40, 15, 15, 1e-3, 21);
    let batch = LinAlgBackendProvider::<f64>::new()
        .svd(&sample_matrix(&samples))?;
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(40, 1e-8, method));
        for (t, sample) in samples.iter().enumerate() {
            svd.take_sample(sample, t as f64)?;
        }
        let s = svd.get_singular_values();
        assert_eq!(s.len(), 15);
        for (incremental, exact) in s.iter().zip(batch.s.iter()) {
            assert_abs_diff_eq!(*incremental, *exact, epsilon = 1e-9 * batch.s[0]);
        }
    }
    Ok(())
}

#[test]
fn test_exactly_low_rank_data_folds_to_batch_spectrum() {
    let samples = low_rank_samples(25, 3, 20, 0.0, 8);
    let batch = LinAlgBackendProvider::<f64>::new()
        .svd(&sample_matrix(&samples))
        .unwrap();
    let mut svd = svd_with(config(25, 1e-8, UpdateMethod::FastUpdate));
    for (t, sample) in samples.iter().enumerate() {
        svd.take_sample(sample, t as f64).unwrap();
    }
    assert_eq!(svd.rank(), 3);
    for i in 0..3 {
        assert_abs_diff_eq!(svd.get_singular_values()[i], batch.s[i], epsilon = 1e-8 * batch.s[0]);
    }
    // Every sample lies in the span of the basis.
    let basis = svd.compute_basis().as_array().clone();
    let x = sample_matrix(&samples);
    let residual = &x - &basis.dot(&basis.t().dot(&x));
    assert!(residual.iter().all(|r| r.abs() < 1e-9));
}

#[test]
fn test_fast_and_standard_updates_agree() {
    let samples = low_rank_samples(30, 6, 20, 1e-3, 13);
    let mut results = Vec::new();
    for method in BOTH_METHODS {
        let mut svd = svd_with(config(30, 1e-2, method));
        let outcomes: Vec<_> = samples
            .iter()
            .enumerate()
            .map(|(t, sample)| svd.take_sample(sample, t as f64).unwrap())
            .collect();
        let p = projector(svd.compute_basis());
        results.push((outcomes, svd.get_singular_values(), p));
    }
    let (fast, standard) = (&results[0], &results[1]);
    assert_eq!(fast.0, standard.0);
    for (a, b) in fast.1.iter().zip(standard.1.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-10 * fast.1[0]);
    }
    assert!(max_abs_diff(&fast.2, &standard.2) < 1e-8);
}

#[test]
fn test_skipped_dependent_samples_leave_state_untouched() {
    for method in BOTH_METHODS {
        let mut svd = svd_with(IncrementalSvdConfig {
            skip_linearly_dependent: true,
            ..config(2, 1e-6, method)
        });
        svd.take_sample(&[3.0, 4.0], 0.0).unwrap();
        let basis = svd.compute_basis().clone();
        assert_eq!(
            svd.take_sample(&[6.0, 8.0], 1.0).unwrap(),
            SampleOutcome::LinearlyDependent { folded: false }
        );
        assert_eq!(svd.get_singular_values().to_vec(), vec![5.0]);
        assert_eq!(svd.num_samples(), 1);
        assert_eq!(svd.compute_basis(), &basis);
    }
}

#[test]
fn test_zero_sample_mid_interval_is_dependent() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    svd.take_sample(&[0.0, 2.0], 0.0).unwrap();
    assert_eq!(
        svd.take_sample(&[0.0, 0.0], 1.0).unwrap(),
        SampleOutcome::LinearlyDependent { folded: true }
    );
    assert_eq!(svd.rank(), 1);
    assert_abs_diff_eq!(svd.get_singular_values()[0], 2.0, epsilon = 1e-15);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    for bad in [
        IncrementalSvdConfig::with_dim(0),
        IncrementalSvdConfig {
            linearity_tol: 0.0,
            ..IncrementalSvdConfig::with_dim(2)
        },
        IncrementalSvdConfig {
            samples_per_time_interval: 0,
            ..IncrementalSvdConfig::with_dim(2)
        },
    ] {
        assert!(IncrementalSvd::new(bad, Arc::new(SingleProcess)).is_err());
    }
}

#[test]
#[should_panic(expected = "must be non-zero")]
fn test_zero_first_sample_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    let _ = svd.take_sample(&[0.0, 0.0], 0.0);
}

#[test]
#[should_panic(expected = "non-negative")]
fn test_negative_time_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    let _ = svd.take_sample(&[1.0, 0.0], -1.0);
}

#[test]
#[should_panic(expected = "non-decreasing")]
fn test_decreasing_time_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    svd.take_sample(&[1.0, 0.0], 2.0).unwrap();
    let _ = svd.take_sample(&[0.0, 1.0], 1.0);
}

#[test]
#[should_panic(expected = "this rank owns")]
fn test_wrong_sample_length_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    let _ = svd.take_sample(&[1.0, 0.0, 0.0], 0.0);
}

#[test]
#[should_panic(expected = "in progress")]
fn test_second_initial_svd_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    svd.build_initial_svd(&[1.0, 0.0], 0.0);
    svd.build_initial_svd(&[0.0, 1.0], 1.0);
}

#[test]
#[should_panic(expected = "No basis exists")]
fn test_basis_before_first_sample_panics() {
    let mut svd = svd_with(config(2, 1e-6, UpdateMethod::FastUpdate));
    svd.compute_basis();
}

#[test]
fn test_thread_group_matches_single_process() {
    let block_sizes = [8usize, 12, 10];
    let global_dim: usize = block_sizes.iter().sum();
    let samples = low_rank_samples(global_dim, 5, 18, 1e-4, 17);

    for method in BOTH_METHODS {
        let mut reference = svd_with(config(global_dim, 1e-3, method));
        let reference_outcomes: Vec<_> = samples
            .iter()
            .enumerate()
            .map(|(t, sample)| reference.take_sample(sample, t as f64).unwrap())
            .collect();
        let reference_s = reference.get_singular_values();
        let reference_p = projector(reference.compute_basis());

        let handles = ThreadGroup::new(block_sizes.len());
        let per_rank: Vec<(Vec<SampleOutcome>, Array1<f64>, Array2<f64>)> = std::thread::scope(|scope| {
            let joins: Vec<_> = handles
                .into_iter()
                .map(|comm| {
                    let samples = &samples;
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let offset: usize = block_sizes[..rank].iter().sum();
                        let rows = offset..offset + block_sizes[rank];
                        let mut svd = IncrementalSvd::new(config(block_sizes[rank], 1e-3, method), Arc::new(comm)).unwrap();
                        assert_eq!(svd.global_dim(), global_dim);
                        let outcomes: Vec<_> = samples
                            .iter()
                            .enumerate()
                            .map(|(t, sample)| svd.take_sample(&sample[rows.clone()], t as f64).unwrap())
                            .collect();
                        let s = svd.get_singular_values();
                        let block = svd.compute_basis().as_array().clone();
                        (outcomes, s, block)
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        for (outcomes, s, _) in &per_rank {
            assert_eq!(outcomes, &reference_outcomes);
            // Replicated state is bit-identical on every rank.
            assert_eq!(s, &per_rank[0].1);
        }
        for (a, b) in per_rank[0].1.iter().zip(reference_s.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10 * reference_s[0]);
        }
        let blocks: Vec<_> = per_rank.iter().map(|(_, _, block)| block.view()).collect();
        let stacked = concatenate(Axis(0), &blocks).unwrap();
        let p = stacked.dot(&stacked.t());
        assert!(max_abs_diff(&p, &reference_p) < 1e-8);
    }
}

#[test]
fn test_save_and_restore_resume_the_interval() -> Result<(), ThreadSafeStdError> {
    let dir = tempfile::tempdir()?;
    let samples = low_rank_samples(12, 4, 10, 1e-3, 2);
    for method in BOTH_METHODS {
        let base = dir.path().join(format!("state_{:?}", method));
        let saving = IncrementalSvdConfig {
            save_state: true,
            state_file_base: base.clone(),
            ..config(12, 1e-6, method)
        };

        let (s_before, basis_before) = {
            let mut svd = svd_with(saving.clone());
            for (t, sample) in samples[..6].iter().enumerate() {
                svd.take_sample(sample, t as f64)?;
            }
            (svd.get_singular_values(), svd.compute_basis().clone())
        };
        assert!(rank_file_name(&base, 0).exists());

        let mut restored = svd_with(IncrementalSvdConfig {
            save_state: false,
            restore_state: true,
            ..saving.clone()
        });
        assert_eq!(restored.num_basis_time_intervals(), 1);
        assert_eq!(restored.rank(), basis_before.num_columns());
        assert_eq!(restored.num_samples(), 6);
        assert_eq!(restored.get_singular_values(), s_before);
        assert!(max_abs_diff(restored.compute_basis().as_array(), basis_before.as_array()) < 1e-14);

        for (t, sample) in samples[6..].iter().enumerate() {
            restored.take_sample(sample, (t + 6) as f64)?;
        }
        assert!(restored.compute_basis().orthogonality_error(&SingleProcess) < 1e-10);
    }
    Ok(())
}

#[test]
fn test_restore_rejects_other_update_method() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("state");
    {
        let mut svd = svd_with(IncrementalSvdConfig {
            save_state: true,
            state_file_base: base.clone(),
            ..config(2, 1e-6, UpdateMethod::Standard)
        });
        svd.take_sample(&[1.0, 0.0], 0.0).unwrap();
    }
    let result = IncrementalSvd::new(
        IncrementalSvdConfig {
            restore_state: true,
            state_file_base: base,
            ..config(2, 1e-6, UpdateMethod::FastUpdate)
        },
        Arc::new(SingleProcess),
    );
    assert!(result.is_err());
}

#[test]
fn test_missing_state_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let svd = svd_with(IncrementalSvdConfig {
        restore_state: true,
        state_file_base: dir.path().join("absent"),
        ..config(2, 1e-6, UpdateMethod::FastUpdate)
    });
    assert_eq!(svd.state(), IntervalState::Uninitialized);
    assert_eq!(svd.num_basis_time_intervals(), 0);
}

#[test]
fn test_state_with_several_intervals_is_not_saved() {
    let dir = tempfile::tempdir().unwrap();
    let mut svd = svd_with(IncrementalSvdConfig {
        samples_per_time_interval: 1,
        state_file_base: dir.path().join("state"),
        ..config(2, 1e-6, UpdateMethod::FastUpdate)
    });
    assert!(!svd.save_state().unwrap());
    svd.take_sample(&[1.0, 0.0], 0.0).unwrap();
    assert!(svd.save_state().unwrap());
    assert_eq!(svd.take_sample(&[0.0, 1.0], 1.0).unwrap(), SampleOutcome::IntervalBoundary);
    svd.start_new_interval();
    svd.take_sample(&[0.0, 1.0], 1.0).unwrap();
    assert!(!svd.save_state().unwrap());
}

#[test]
#[should_panic(expected = "non-decreasing")]
fn test_restored_state_remembers_the_last_sample_time() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("state");
    {
        let mut svd = svd_with(IncrementalSvdConfig {
            save_state: true,
            state_file_base: base.clone(),
            ..config(2, 1e-6, UpdateMethod::FastUpdate)
        });
        svd.take_sample(&[1.0, 0.0], 1.0).unwrap();
        svd.take_sample(&[0.0, 1.0], 5.0).unwrap();
    }
    let mut restored = svd_with(IncrementalSvdConfig {
        restore_state: true,
        state_file_base: base,
        ..config(2, 1e-6, UpdateMethod::FastUpdate)
    });
    assert_eq!(restored.time_interval_start_times(), &[1.0]);
    // After the interval start but before the last saved sample.
    let _ = restored.take_sample(&[1.0, 1.0], 3.0);
}

/// `U^T U` of the strategy's current basis, formed through `project` and
/// `expand` so a pending rotation is not absorbed.
fn unmaterialized_gram(svd: &IncrementalSvd) -> Array2<f64> {
    let k = svd.rank();
    let strategy = svd.strategy();
    let mut gram = Array2::zeros((k, k));
    for i in 0..k {
        let mut unit = Array1::zeros(k);
        unit[i] = 1.0;
        let column = strategy.expand(&crate::vector::Vector::from_array(unit, false));
        let projected = strategy.project(&column, &SingleProcess);
        gram.column_mut(i).assign(projected.as_array());
    }
    gram
}

#[test]
fn test_long_fold_chain_keeps_pending_basis_orthonormal() {
    let samples = low_rank_samples(40, 5, 200, 1e-9, 23);
    let mut svd = svd_with(IncrementalSvdConfig {
        samples_per_time_interval: 200,
        ..config(40, 1e-6, UpdateMethod::FastUpdate)
    });
    for (t, sample) in samples.iter().enumerate() {
        svd.take_sample(sample, t as f64).unwrap();
    }
    assert_eq!(svd.rank(), 5);
    assert_eq!(svd.num_samples(), 200);

    let gram = unmaterialized_gram(&svd);
    let error = max_abs_diff(&gram, &Array2::eye(5));
    assert!(error < 1e-10, "pending basis orthogonality error {:e}", error);
    assert!(svd.compute_basis().orthogonality_error(&SingleProcess) < 1e-10);
}

/// Single-rank communicator that records the length of every reduction.
#[derive(Debug, Default)]
struct RecordingComm {
    lengths: std::sync::Mutex<Vec<usize>>,
}

impl RecordingComm {
    fn take(&self) -> Vec<usize> {
        std::mem::take(&mut *self.lengths.lock().unwrap())
    }
}

impl Communicator for RecordingComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, values: &mut [f64]) {
        self.lengths.lock().unwrap().push(values.len());
    }

    fn all_reduce_max(&self, values: &mut [f64]) {
        self.lengths.lock().unwrap().push(values.len());
    }
}

#[test]
fn test_fast_update_reductions_stay_linear_in_rank() {
    let comm = Arc::new(RecordingComm::default());
    let mut svd = IncrementalSvd::new(config(50, 1e-6, UpdateMethod::FastUpdate), comm.clone()).unwrap();
    comm.take();
    let samples = low_rank_samples(50, 8, 30, 1e-10, 31);
    let mut largest = 0;
    for (t, sample) in samples.iter().enumerate() {
        let k = svd.rank();
        svd.take_sample(sample, t as f64).unwrap();
        let lengths = comm.take();
        assert!(
            lengths.iter().all(|&n| n <= k.max(1)),
            "sample {} at rank {} issued reductions {:?}",
            t,
            k,
            lengths
        );
        largest = largest.max(lengths.iter().copied().max().unwrap_or(0));
    }
    assert_eq!(svd.rank(), 8);
    assert_eq!(largest, 8);
}
