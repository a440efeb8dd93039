//! The spectrum acquirer. Two strategies — direct and Unicable-sliced —
//! each producing a [`SpectrumBuffer`] plus zero or more hardware-detected
//! candidates.

use {
    crate::{
        adapter::{DiseqcCache, FrontendAdapter},
        fe::{sys::*, FeSpectrumCandidate, FeSpectrumScan},
        model::{to_driver, to_transponder, Band, CandidatePeak, Polarisation, SpectrumBuffer, SpectrumSample},
        satconf::SatConfig,
    },
    anyhow::Result,
    std::time::Duration,
};

const DIRECT_READY_RETRIES: u32 = 10;
/// 60 s total readiness budget split across `DIRECT_READY_RETRIES` polls.
const DIRECT_READY_POLL: Duration = Duration::from_secs(6);

const UNICABLE_SLICE_WIDTH_KHZ_DEFAULT: u32 = 50_000;
const UNICABLE_SLICE_HALF_WINDOW_KHZ: u32 = 25_000;
const UNICABLE_READY_TIMEOUT: Duration = Duration::from_secs(10);
const UNICABLE_DEFAULT_RESOLUTION_KHZ: u32 = 100;

const UNICABLE_DEDUP_WINDOW_KHZ: u32 = 2_000;

const MAX_SPECTRUM_SAMPLES: usize = 8192;
const MAX_HW_CANDIDATES: usize = 512;

/// One (polarisation, band) acquisition task, intersected with the user's
/// selection.
pub fn band_plan(pols: &[Polarisation]) -> Vec<(Polarisation, Band)> {
    let mut plan = Vec::with_capacity(pols.len() * 2);
    for &pol in pols {
        plan.push((pol, Band::Low));
        plan.push((pol, Band::High));
    }
    plan
}

pub struct AcquireResult {
    pub buffer: SpectrumBuffer,
    pub candidates: Vec<CandidatePeak>,
}

/// Drives one (pol, band) acquisition task, selecting the direct or
/// Unicable strategy from whether `satconf` carries a gateway.
pub fn acquire_slot(
    adapter: &FrontendAdapter,
    satconf: &SatConfig,
    cache: &mut DiseqcCache,
    pol: Polarisation,
    band: Band,
    start_freq_khz: u32,
    end_freq_khz: u32,
    transform_size: u32,
    resolution_khz: u32,
    mut should_stop: impl FnMut() -> bool,
) -> Result<AcquireResult> {
    if satconf.is_unicable() {
        acquire_unicable(
            adapter,
            satconf,
            pol,
            band,
            start_freq_khz,
            end_freq_khz,
            transform_size,
            resolution_khz,
            &mut should_stop,
        )
    } else {
        acquire_direct(
            adapter,
            satconf,
            cache,
            pol,
            band,
            start_freq_khz,
            end_freq_khz,
            transform_size,
            resolution_khz,
        )
    }
}

fn run_spectrum_scan(
    adapter: &FrontendAdapter,
    driver_low_khz: u32,
    driver_high_khz: u32,
    transform_size: u32,
    resolution_khz: u32,
) -> Result<(Vec<u32>, Vec<i32>, Vec<FeSpectrumCandidate>)> {
    let mut freq = vec![0u32; MAX_SPECTRUM_SAMPLES];
    let mut rf_level = vec![0i32; MAX_SPECTRUM_SAMPLES];
    let mut candidates = vec![FeSpectrumCandidate::default(); MAX_HW_CANDIDATES];

    let mut req = FeSpectrumScan::new(
        driver_low_khz,
        driver_high_khz,
        transform_size,
        resolution_khz * 1000,
        &mut freq,
        &mut rf_level,
        &mut candidates,
    );
    adapter.get_spectrum_scan(&mut req)?;
    let num_freq = req.num_freq as usize;
    let num_candidates = req.num_candidates as usize;

    freq.truncate(num_freq);
    rf_level.truncate(num_freq);
    candidates.truncate(num_candidates);
    Ok((freq, rf_level, candidates))
}

/// Direct acquisition: sequences the satellite-configuration chain once,
/// then sweeps the whole requested span in one spectrum-scan ioctl.
fn acquire_direct(
    adapter: &FrontendAdapter,
    satconf: &SatConfig,
    cache: &mut DiseqcCache,
    pol: Polarisation,
    band: Band,
    start_freq_khz: u32,
    end_freq_khz: u32,
    transform_size: u32,
    resolution_khz: u32,
) -> Result<AcquireResult> {
    adapter.send_satconf_chain(satconf, pol, band, cache)?;

    let driver_low = to_driver(start_freq_khz, band);
    let driver_high = to_driver(end_freq_khz, band);
    adapter.set_properties(&[dtv_property!(DTV_DELIVERY_SYSTEM(fe_delivery_system::SYS_DVBS2))])?;

    let mut ready = false;
    for _ in 0..DIRECT_READY_RETRIES {
        let status = adapter.await_event(DIRECT_READY_POLL)?;
        if status.contains(fe_status::FE_HAS_SIGNAL) {
            ready = true;
            break;
        }
    }
    if !ready {
        anyhow::bail!("FE: direct acquisition never signalled readiness");
    }

    let (freq, rf_level, hw_candidates) =
        run_spectrum_scan(adapter, driver_low, driver_high, transform_size, resolution_khz)?;

    let samples = freq
        .into_iter()
        .zip(rf_level)
        .map(|(f, l)| SpectrumSample {
            freq_khz: to_transponder(f, band),
            level_cdb: l / 10,
        })
        .collect();

    let candidates = hw_candidates
        .into_iter()
        .map(|c| {
            CandidatePeak::new(
                to_transponder(c.frequency, band),
                c.symbol_rate,
                pol,
                c.signal_level / 10,
                0,
            )
        })
        .collect();

    Ok(AcquireResult {
        buffer: SpectrumBuffer { pol, band, samples },
        candidates,
    })
}

/// Unicable acquisition. Slices the requested band into overlapping
/// 50 MHz-wide windows (tunable via `satconf.unicable.slice_width_khz`); the
/// final slice intentionally re-centres at `band_end - 25 MHz` when the step
/// doesn't divide evenly — left as-is rather than shortened, since dedup
/// cleans up the resulting overlap.
fn acquire_unicable(
    adapter: &FrontendAdapter,
    satconf: &SatConfig,
    pol: Polarisation,
    band: Band,
    start_freq_khz: u32,
    end_freq_khz: u32,
    transform_size: u32,
    resolution_khz: u32,
    should_stop: &mut impl FnMut() -> bool,
) -> Result<AcquireResult> {
    let unicable = satconf
        .unicable
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("FE: acquire_unicable called without a Unicable gateway"))?;
    let slice_width = if unicable.slice_width_khz > 0 {
        unicable.slice_width_khz
    } else {
        UNICABLE_SLICE_WIDTH_KHZ_DEFAULT
    };
    let resolution_khz = if resolution_khz > 0 {
        resolution_khz
    } else {
        UNICABLE_DEFAULT_RESOLUTION_KHZ
    };

    let mut samples = Vec::new();
    let mut raw_candidates: Vec<CandidatePeak> = Vec::new();

    let mut centre = start_freq_khz + slice_width / 2;
    loop {
        if should_stop() {
            break;
        }

        let slice_centre = if centre + slice_width / 2 > end_freq_khz {
            end_freq_khz.saturating_sub(slice_width / 2)
        } else {
            centre
        };

        adapter.send_unicable_odu(satconf, slice_centre)?;

        let scr_if_khz = unicable.scr_freq_khz;
        adapter.set_properties(&[dtv_property!(DTV_DELIVERY_SYSTEM(fe_delivery_system::SYS_DVBS2))])?;

        let status = adapter.await_event(UNICABLE_READY_TIMEOUT)?;
        if status.contains(fe_status::FE_HAS_SIGNAL) {
            let window_low = scr_if_khz.saturating_sub(UNICABLE_SLICE_HALF_WINDOW_KHZ);
            let window_high = scr_if_khz + UNICABLE_SLICE_HALF_WINDOW_KHZ;
            let (freq, rf_level, hw_candidates) =
                run_spectrum_scan(adapter, window_low, window_high, transform_size, resolution_khz)?;

            for (f, l) in freq.into_iter().zip(rf_level) {
                let offset = f as i64 - scr_if_khz as i64;
                let transponder = (slice_centre as i64 + offset) as u32;
                samples.push(SpectrumSample {
                    freq_khz: transponder,
                    level_cdb: l / 10,
                });
            }

            for c in hw_candidates {
                let offset = c.frequency as i64 - scr_if_khz as i64;
                let transponder = (slice_centre as i64 + offset) as u32;
                raw_candidates.push(CandidatePeak::new(transponder, c.symbol_rate, pol, c.signal_level / 10, 0));
            }
        }

        if slice_centre + slice_width / 2 >= end_freq_khz {
            break;
        }
        centre += slice_width;
    }

    samples.sort_by_key(|s| s.freq_khz);
    let candidates = dedup_candidates(raw_candidates);

    Ok(AcquireResult {
        buffer: SpectrumBuffer { pol, band, samples },
        candidates,
    })
}

/// Deduplicates hardware candidates within a ±2 MHz window, keeping the
/// strongest.
fn dedup_candidates(mut candidates: Vec<CandidatePeak>) -> Vec<CandidatePeak> {
    candidates.sort_by_key(|c| c.frequency_khz);
    let mut out: Vec<CandidatePeak> = Vec::new();
    for c in candidates {
        match out.last_mut() {
            Some(prev) if c.frequency_khz.abs_diff(prev.frequency_khz) < UNICABLE_DEDUP_WINDOW_KHZ => {
                if c.level_cdb > prev.level_cdb {
                    *prev = c;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(freq_khz: u32, level_cdb: i32) -> CandidatePeak {
        CandidatePeak::new(freq_khz, 27_500_000, Polarisation::H, level_cdb, 0)
    }

    #[test]
    fn dedup_keeps_strongest_within_window() {
        let input = vec![
            candidate(11_012_000, -4000),
            candidate(11_012_500, -3900),
            candidate(11_013_800, -4100),
        ];
        let out = dedup_candidates(input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frequency_khz, 11_012_500);
    }

    #[test]
    fn band_plan_covers_selected_polarisations_and_both_bands() {
        let plan = band_plan(&[Polarisation::H]);
        assert_eq!(plan, vec![(Polarisation::H, Band::Low), (Polarisation::H, Band::High)]);

        let plan = band_plan(&[Polarisation::H, Polarisation::V]);
        assert_eq!(plan.len(), 4);
    }

    use proptest::prelude::*;

    proptest! {
        /// After dedup, no two surviving candidates are within 2 000 kHz of
        /// each other.
        #[test]
        fn dedup_output_has_no_close_pairs(
            freqs in proptest::collection::vec(10_700_000u32..12_750_000, 1..40),
            levels in proptest::collection::vec(-6000i32..-3000, 40),
        ) {
            let input: Vec<CandidatePeak> = freqs
                .iter()
                .zip(levels.iter())
                .map(|(&f, &l)| candidate(f, l))
                .collect();

            let out = dedup_candidates(input);
            for pair in out.windows(2) {
                prop_assert!(pair[1].frequency_khz.abs_diff(pair[0].frequency_khz) >= UNICABLE_DEDUP_WINDOW_KHZ);
            }
        }
    }
}
