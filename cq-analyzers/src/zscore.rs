//! Robust z-score signal detector over a numeric sequence, used to find
//! peaks in the per-frame temporal-outlier metric.

/// Computes the signal sequence for `samples`.
///
/// The first `lag` samples seed the rolling filter; signalling starts at
/// index `lag + 1`, so `signals[lag]` is always zero. Sequences no longer
/// than `lag` produce an all-zero signal.
pub fn z_score(samples: &[f64], lag: usize, threshold: f64, influence: f64) -> Vec<i8> {
    let n = samples.len();
    let mut signals = vec![0i8; n];
    if lag < 2 || n <= lag {
        return signals;
    }

    let mut filtered = vec![0f64; n];
    filtered[..lag].copy_from_slice(&samples[..lag]);

    let mut avg_filter = vec![0f64; n];
    let mut std_filter = vec![0f64; n];
    (avg_filter[lag], std_filter[lag]) = mean_std(&samples[..lag]);

    for i in (lag + 1)..n {
        if (samples[i] - avg_filter[i - 1]).abs() > threshold * std_filter[i - 1] {
            signals[i] = if samples[i] > avg_filter[i - 1] { 1 } else { -1 };
            filtered[i] = influence * samples[i] + (1.0 - influence) * filtered[i - 1];
        } else {
            signals[i] = 0;
            filtered[i] = samples[i];
        }
        (avg_filter[i], std_filter[i]) = mean_std(&filtered[i - lag..i]);
    }

    signals
}

/// Number of maximal runs of non-zero signals.
pub fn count_peaks(signals: &[i8]) -> u64 {
    let mut peaks = 0;
    let mut in_peak = false;
    for &signal in signals {
        if signal != 0 {
            if !in_peak {
                peaks += 1;
                in_peak = true;
            }
        } else {
            in_peak = false;
        }
    }
    peaks
}

/// Mean and sample standard deviation (n−1 divisor).
fn mean_std(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples
        .iter()
        .map(|sample| (sample - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_input_produces_no_signals() {
        let samples = vec![3.5; 50];
        let signals = z_score(&samples, 10, 3.5, 0.5);
        assert!(signals.iter().all(|&s| s == 0));
    }

    #[test]
    fn signals_stay_in_range() {
        let samples: Vec<f64> = (0..200)
            .map(|i| if i % 37 == 0 { 500.0 } else { (i % 7) as f64 })
            .collect();
        for signal in z_score(&samples, 20, 10.0, 0.5) {
            assert!((-1..=1).contains(&signal));
        }
    }

    #[test]
    fn signal_at_lag_index_is_never_set() {
        let mut samples = vec![0.0; 10];
        samples.extend([100.0, 100.0]);
        let signals = z_score(&samples, 10, 3.5, 0.5);
        assert_eq!(signals[10], 0);
        assert_eq!(signals[11], 1);
    }

    #[test]
    fn short_input_produces_all_zero_signals() {
        let samples = vec![1.0, 50.0, 2.0];
        assert_eq!(z_score(&samples, 10, 3.5, 0.5), vec![0, 0, 0]);
    }

    #[test]
    fn single_spike_is_one_peak() {
        let mut samples = vec![0.0; 30];
        samples.extend([0.0, 0.0, 100.0, 0.0, 0.0, 0.0]);
        let signals = z_score(&samples, 10, 3.5, 0.5);
        assert_eq!(count_peaks(&signals), 1);
    }

    #[test]
    fn negative_deviation_signals_minus_one() {
        let mut samples = vec![10.0; 30];
        samples.push(-100.0);
        let signals = z_score(&samples, 10, 3.5, 0.5);
        assert_eq!(signals[30], -1);
    }

    #[test]
    fn count_peaks_counts_runs_not_samples() {
        assert_eq!(count_peaks(&[0, 1, 1, -1, 0, 0, 1, 0, -1, -1]), 3);
        assert_eq!(count_peaks(&[]), 0);
        assert_eq!(count_peaks(&[0, 0, 0]), 0);
    }
}
