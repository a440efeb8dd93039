//! The peak detector. A deterministic, pure function over a single
//! spectrum buffer — no I/O, no shared state — so it is exercised directly
//! by property tests.

use crate::model::{CandidatePeak, Polarisation, SpectrumSample};

/// Window half-width for the local-maximum sweep (±10 samples, i.e. a
/// 20-sample window).
const SWEEP_HALF_WINDOW: usize = 10;
const SWEEP_SKIP: usize = 10;
const MAX_CANDIDATES: usize = 512;

const MIN_SYMBOL_RATE: u32 = 2_000_000;
const MAX_SYMBOL_RATE: u32 = 45_000_000;
/// Encodes the ~0.25 rolloff assumption: symbol_rate ≈ bandwidth / 1.25.
const SYMBOL_RATE_FROM_BANDWIDTH_NUM: u64 = 800;

#[derive(Clone, Copy)]
struct RawPeak {
    index: usize,
    level_cdb: i32,
}

/// Runs the full peak-detection algorithm: local-maximum sweep, valley-based
/// merge, symbol-rate-from-bandwidth estimate. `threshold_cdb` and
/// `valley_floor_cdb` are configurable rather than hardcoded (defaults
/// 1000 / 400, i.e. 10 dB / 4 dB in hundredths of a dB).
pub fn detect_peaks(
    buffer: &[SpectrumSample],
    pol: Polarisation,
    threshold_cdb: i32,
    valley_floor_cdb: i32,
) -> Vec<CandidatePeak> {
    if buffer.len() < 100 {
        return Vec::new();
    }

    let min_level = buffer.iter().map(|s| s.level_cdb).min().unwrap();
    let max_level = buffer.iter().map(|s| s.level_cdb).max().unwrap();
    if max_level - min_level < threshold_cdb {
        return Vec::new();
    }
    let threshold = min_level + threshold_cdb;

    let raw = local_maximum_sweep(buffer, threshold);
    let merged = valley_merge(buffer, raw, valley_floor_cdb);

    merged
        .into_iter()
        .filter_map(|p| build_candidate(buffer, &p, pol, min_level))
        .collect()
}

fn local_maximum_sweep(buffer: &[SpectrumSample], threshold: i32) -> Vec<RawPeak> {
    let mut out = Vec::new();
    let n = buffer.len();
    let mut i = 0;
    while i < n {
        let level = buffer[i].level_cdb;
        if level > threshold {
            let lo = i.saturating_sub(SWEEP_HALF_WINDOW);
            let hi = (i + SWEEP_HALF_WINDOW).min(n - 1);
            let is_max = (lo..=hi).all(|j| buffer[j].level_cdb <= level);
            if is_max {
                out.push(RawPeak { index: i, level_cdb: level });
                if out.len() >= MAX_CANDIDATES {
                    break;
                }
                i += SWEEP_SKIP;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Merges adjacent candidates separated by a shallow valley, keeping the
/// stronger of the pair. Ordered left-to-right and idempotent: a second
/// pass over an already-merged list changes nothing, since every surviving
/// gap already has depth >= `valley_floor_cdb`.
fn valley_merge(buffer: &[SpectrumSample], raw: Vec<RawPeak>, valley_floor_cdb: i32) -> Vec<RawPeak> {
    let mut kept: Vec<RawPeak> = Vec::new();

    for peak in raw {
        match kept.last() {
            None => kept.push(peak),
            Some(prev) => {
                let valley_min = buffer[prev.index + 1..peak.index]
                    .iter()
                    .map(|s| s.level_cdb)
                    .min()
                    .unwrap_or(prev.level_cdb.min(peak.level_cdb));
                let depth = prev.level_cdb.min(peak.level_cdb) - valley_min;
                if depth >= valley_floor_cdb {
                    kept.push(peak);
                } else if peak.level_cdb > prev.level_cdb {
                    *kept.last_mut().unwrap() = peak;
                }
                // else: peak is weaker than prev, drop it (merge by keeping prev)
            }
        }
    }

    kept
}

fn build_candidate(
    buffer: &[SpectrumSample],
    peak: &RawPeak,
    pol: Polarisation,
    min_level: i32,
) -> Option<CandidatePeak> {
    let edge_level = peak.level_cdb - 600; // -6 dB in hundredths of a dB

    let left = (0..peak.index)
        .rev()
        .find(|&j| buffer[j].level_cdb < edge_level)
        .unwrap_or(0);
    let right = (peak.index + 1..buffer.len())
        .find(|&j| buffer[j].level_cdb < edge_level)
        .unwrap_or(buffer.len() - 1);

    let bandwidth_khz = buffer[right].freq_khz.saturating_sub(buffer[left].freq_khz) as u64;
    let symbol_rate = ((bandwidth_khz * SYMBOL_RATE_FROM_BANDWIDTH_NUM) as u32)
        .clamp(MIN_SYMBOL_RATE, MAX_SYMBOL_RATE);

    let centre_freq = (buffer[left].freq_khz + buffer[right].freq_khz) / 2;
    let snr = peak.level_cdb - min_level;

    Some(CandidatePeak::new(centre_freq, symbol_rate, pol, peak.level_cdb, snr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(freq_khz: u32, level_cdb: i32) -> SpectrumSample {
        SpectrumSample { freq_khz, level_cdb }
    }

    /// A triangular bump on a flat floor yields exactly one peak, centred.
    #[test]
    fn single_triangular_bump() {
        let n = 2048usize;
        let mut buf = Vec::with_capacity(n);
        for i in 0..n {
            let freq = 10_700_000 + i as u32; // 1 kHz/sample
            let dist = (i as i64 - 1024).unsigned_abs() as i32;
            // Piecewise-linear bump: -4000 at the centre, -4600 (the -6dB
            // point) right at the nominal 8000 kHz-wide edge, -7000 floor
            // beyond that.
            let level = if dist <= 4000 {
                -4000 - (dist * 600 / 4000)
            } else if dist <= 8000 {
                -4600 - ((dist - 4000) * 2400 / 4000)
            } else {
                -7000
            };
            buf.push(sample(freq, level));
        }

        let peaks = detect_peaks(&buf, Polarisation::H, 1000, 400);
        assert_eq!(peaks.len(), 1);
        let p = &peaks[0];
        assert!((p.frequency_khz as i64 - (10_700_000 + 1024)).unsigned_abs() <= 1);
        assert!(p.symbol_rate >= 5_000_000 && p.symbol_rate <= 7_000_000);
        assert_eq!(p.snr_cdb, 3000);
    }

    #[test]
    fn requires_at_least_100_samples() {
        let buf: Vec<_> = (0..50).map(|i| sample(i, -5000)).collect();
        assert!(detect_peaks(&buf, Polarisation::H, 1000, 400).is_empty());
    }

    #[test]
    fn flat_spectrum_yields_no_peaks() {
        let buf: Vec<_> = (0..500).map(|i| sample(i, -5000)).collect();
        assert!(detect_peaks(&buf, Polarisation::H, 1000, 400).is_empty());
    }

    /// Running the valley-merge step twice yields the same result.
    #[test]
    fn valley_merge_is_idempotent() {
        let buf: Vec<_> = (0..300)
            .map(|i| {
                let level = match i {
                    40 => -3000,
                    80 => -3200,
                    200 => -3500,
                    _ => -7000,
                };
                sample(i, level)
            })
            .collect();

        let raw = local_maximum_sweep(&buf, -6000);
        let once = valley_merge(&buf, raw, 400);
        let twice = valley_merge(&buf, once.clone(), 400);
        let indices = |v: &[RawPeak]| v.iter().map(|p| p.index).collect::<Vec<_>>();
        assert_eq!(indices(&once), indices(&twice));
    }

    use proptest::prelude::*;

    proptest! {
        /// Every detected peak clears the threshold above the buffer floor,
        /// and its estimated symbol rate stays within the driver's
        /// supported range.
        #[test]
        fn detected_peaks_respect_level_and_rate_invariants(
            levels in proptest::collection::vec(-9000i32..=-3000, 200..400),
        ) {
            let buf: Vec<SpectrumSample> = levels
                .into_iter()
                .enumerate()
                .map(|(i, level_cdb)| sample(10_700_000 + i as u32, level_cdb))
                .collect();
            let min_level = buf.iter().map(|s| s.level_cdb).min().unwrap();

            let peaks = detect_peaks(&buf, Polarisation::H, 1000, 400);
            for p in &peaks {
                prop_assert!(p.level_cdb >= min_level + 1000);
                prop_assert!(p.symbol_rate >= MIN_SYMBOL_RATE && p.symbol_rate <= MAX_SYMBOL_RATE);
            }
        }

        /// Between any two kept peaks, every intervening sample stays above
        /// `min(peak levels) - 400` — otherwise the valley-merge step would
        /// have merged them.
        #[test]
        fn kept_peaks_have_deep_enough_valleys(
            levels in proptest::collection::vec(-9000i32..=-3000, 200..400),
        ) {
            let buf: Vec<SpectrumSample> = levels
                .into_iter()
                .enumerate()
                .map(|(i, level_cdb)| sample(10_700_000 + i as u32, level_cdb))
                .collect();
            let min_level = buf.iter().map(|s| s.level_cdb).min().unwrap();
            if buf.iter().map(|s| s.level_cdb).max().unwrap() - min_level < 1000 {
                return Ok(());
            }
            let raw = local_maximum_sweep(&buf, min_level + 1000);
            let merged = valley_merge(&buf, raw, 400);

            for pair in merged.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let floor = a.level_cdb.min(b.level_cdb) - 400;
                for s in &buf[a.index + 1..b.index] {
                    prop_assert!(s.level_cdb >= floor);
                }
            }
        }
    }
}
