//! Continuous-time exponential moving average over per-bin vectors.
use super::containers::RunningRepresentation;
use crate::error::{Error, Result};

/// Folds time-stamped observations into a running vector.
///
/// Without a prior the first observation is taken as-is. Each later observation at `t` moves
/// the running value towards it by `1 - exp(-(t - t_prev) / time_constant)`; observations not
/// strictly newer than the running timestamp are skipped. Returns `None` only when there is
/// neither a prior nor any observation.
pub fn fuse(
    vectors: &[Vec<f64>],
    timestamps: &[f64],
    prior: Option<&RunningRepresentation>,
    time_constant: f64,
) -> Result<Option<RunningRepresentation>> {
    if !time_constant.is_finite() || time_constant <= 0.0 {
        return Err(Error::InvalidConfig(format!("time_constant must be positive, got {time_constant}")));
    }
    if vectors.len() != timestamps.len() {
        return Err(Error::LengthMismatch { vectors: vectors.len(), timestamps: timestamps.len() });
    }
    if let Some(&bad) = prior
        .map(|p| &p.timestamp)
        .into_iter()
        .chain(timestamps)
        .find(|t| !t.is_finite())
    {
        return Err(Error::NonFiniteTimestamp(bad));
    }

    let dimension = prior.map(|p| p.vector.len()).or_else(|| vectors.first().map(Vec::len));
    if let Some(expected) = dimension {
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(Error::DimensionMismatch { expected, got: bad.len() });
        }
    }

    let mut running = prior.cloned();
    let mut skipped = 0usize;

    for (observation, &t) in vectors.iter().zip(timestamps) {
        match running.as_mut() {
            None => {
                running = Some(RunningRepresentation { timestamp: t, vector: observation.clone() });
            }
            Some(state) if t <= state.timestamp => skipped += 1,
            Some(state) => {
                let alpha = 1.0 - (-(t - state.timestamp) / time_constant).exp();
                for (r, o) in state.vector.iter_mut().zip(observation) {
                    *r += alpha * (o - *r);
                }
                state.timestamp = t;
            }
        }
    }

    if skipped > 0 {
        log::debug!("Ignored {skipped} observations that were not newer than the running state");
    }

    Ok(running)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(timestamp: f64, vector: &[f64]) -> RunningRepresentation {
        RunningRepresentation { timestamp, vector: vector.to_vec() }
    }

    #[test]
    fn first_observation_is_taken_verbatim() {
        let fused = fuse(&[vec![1.0, -2.0]], &[10.0], None, 60.0).unwrap().unwrap();
        assert_eq!(fused, state(10.0, &[1.0, -2.0]));
    }

    #[test]
    fn repeated_timestamp_is_a_no_op() {
        let first = fuse(&[vec![1.0, 2.0]], &[10.0], None, 60.0).unwrap().unwrap();
        let again = fuse(&[vec![9.0, 9.0]], &[10.0], Some(&first), 60.0).unwrap().unwrap();
        assert_eq!(again, first);

        let older = fuse(&[vec![9.0, 9.0]], &[5.0], Some(&first), 60.0).unwrap().unwrap();
        assert_eq!(older, first);
    }

    #[test]
    fn no_observations_keep_the_prior() {
        let prior = state(5.0, &[1.0, 2.0, 3.0]);
        assert_eq!(fuse(&[], &[], Some(&prior), 60.0).unwrap(), Some(prior));
        assert_eq!(fuse(&[], &[], None, 60.0).unwrap(), None);
    }

    #[test]
    fn update_uses_elapsed_time() {
        let prior = state(0.0, &[0.0]);
        let fused = fuse(&[vec![1.0]], &[10.0], Some(&prior), 10.0).unwrap().unwrap();
        let alpha = 1.0 - (-1.0f64).exp();
        assert!((fused.vector[0] - alpha).abs() < 1e-12);
        assert_eq!(fused.timestamp, 10.0);
    }

    #[test]
    fn converges_towards_a_constant() {
        let target = vec![4.0, -1.0];
        let mut running = state(0.0, &[-10.0, 7.0]);
        let mut last_distance = f64::INFINITY;

        for step in 1..50 {
            running = fuse(&[target.clone()], &[step as f64 * 3.0], Some(&running), 20.0)
                .unwrap()
                .unwrap();
            let distance: f64 = running.vector.iter().zip(&target).map(|(r, t)| (r - t).abs()).sum();
            assert!(distance < last_distance);
            last_distance = distance;
        }
        assert!(last_distance < 0.05);
    }

    #[test]
    fn is_pure() {
        let prior = state(1.0, &[0.5, 0.5]);
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let a = fuse(&vectors, &[2.0, 3.0], Some(&prior), 5.0).unwrap();
        let b = fuse(&vectors, &[2.0, 3.0], Some(&prior), 5.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_contract_violations() {
        assert!(matches!(fuse(&[], &[], None, 0.0), Err(Error::InvalidConfig(_))));
        assert!(matches!(fuse(&[], &[], None, f64::NAN), Err(Error::InvalidConfig(_))));
        assert!(matches!(fuse(&[vec![1.0]], &[], None, 1.0), Err(Error::LengthMismatch { .. })));
        assert!(matches!(
            fuse(&[vec![1.0]], &[1.0], Some(&state(0.0, &[1.0, 2.0])), 1.0),
            Err(Error::DimensionMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn rejects_non_finite_timestamps() {
        let vectors = [vec![1.0], vec![2.0], vec![3.0]];
        assert!(matches!(fuse(&vectors, &[f64::NAN, 5.0, 6.0], None, 10.0), Err(Error::NonFiniteTimestamp(_))));
        assert!(matches!(
            fuse(&vectors, &[1.0, f64::INFINITY, 6.0], None, 10.0),
            Err(Error::NonFiniteTimestamp(t)) if t == f64::INFINITY
        ));
        assert!(matches!(
            fuse(&[vec![1.0]], &[1.0], Some(&state(f64::NEG_INFINITY, &[0.0])), 10.0),
            Err(Error::NonFiniteTimestamp(_))
        ));
    }
}
