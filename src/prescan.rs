//! The prescan engine — blind-tunes a single candidate, reads back the full
//! parameter set, classifies its stream format, and enumerates its
//! multistream ISI set.

use {
    crate::{
        adapter::{DiseqcCache, FrontendAdapter},
        fe::sys::*,
        model::{
            band_for_freq, decode_isi_bitset, decode_pls_code, decode_pls_mode, decode_stream_id,
            default_pls_search_list, to_driver, CandidatePeak, LockedParameters, Polarisation,
        },
        satconf::SatConfig,
    },
    anyhow::{Context, Result},
    std::time::Duration,
};

const SEARCH_RANGE_FLOOR_HZ: u32 = 8_000_000;
const DEFAULT_SYMBOL_RATE: u32 = 22_000_000;
const LOCK_TIMEOUT: Duration = Duration::from_secs(12);

pub struct PrescanRequest {
    pub frequency_khz: u32,
    pub polarisation: Polarisation,
    /// Estimated symbol rate from a prior peak detection, if any (22 Msym/s
    /// default if no estimate).
    pub symbol_rate_estimate: Option<u32>,
}

pub struct PrescanOutcome {
    pub locked: bool,
    pub parameters: Option<LockedParameters>,
}

/// Runs one blind-tune cycle for `req`. Does not touch any other session
/// state; the caller is responsible for merging the result into the
/// matching candidate.
pub fn prescan(
    adapter: &FrontendAdapter,
    satconf: &SatConfig,
    cache: &mut DiseqcCache,
    req: &PrescanRequest,
) -> Result<PrescanOutcome> {
    let band = band_for_freq(req.frequency_khz);

    let driver_target = if satconf.is_unicable() {
        let unicable = satconf
            .unicable
            .as_ref()
            .context("FE: satconf claims Unicable but has no gateway configured")?;
        adapter.send_unicable_odu(satconf, req.frequency_khz)?;
        unicable.scr_freq_khz
    } else {
        adapter.send_satconf_chain(satconf, req.polarisation, band, cache)?;
        to_driver(req.frequency_khz, band)
    };

    let symbol_rate = req.symbol_rate_estimate.unwrap_or(DEFAULT_SYMBOL_RATE);
    let search_range = (symbol_rate / 2).max(SEARCH_RANGE_FLOOR_HZ);

    let mut pls_list = [0u32; 8];
    let search = default_pls_search_list();
    pls_list[..search.len()].copy_from_slice(&search);

    // Submitted as a single ordered property-set transaction.
    adapter.set_properties(&[
        dtv_property!(DTV_CLEAR(())),
        dtv_property!(DTV_ALGORITHM(fe_algorithm::ALGORITHM_BLIND)),
        dtv_property!(DTV_DELIVERY_SYSTEM(fe_delivery_system::SYS_UNDEFINED)),
        dtv_property!(DTV_SEARCH_RANGE(search_range)),
        dtv_property!(DTV_SYMBOL_RATE(symbol_rate)),
        dtv_property!(DTV_FREQUENCY(driver_target)),
        dtv_property!(DTV_STREAM_ID(u32::MAX)),
        dtv_property!(DTV_PLS_SEARCH_LIST(pls_list)),
        dtv_property!(DTV_TUNE(())),
    ])?;

    let locked = await_lock(adapter)?;
    if !locked {
        adapter.clear()?;
        return Ok(PrescanOutcome { locked: false, parameters: None });
    }

    let parameters = read_back(adapter, req, satconf)?;
    adapter.clear()?;
    Ok(PrescanOutcome { locked: true, parameters: Some(parameters) })
}

/// Only a status mask with both carrier-lock and sync counts as locked;
/// carrier-lock alone is a false positive.
fn await_lock(adapter: &FrontendAdapter) -> Result<bool> {
    let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let status = adapter.await_event(remaining)?;
        if status.contains(fe_status::FE_HAS_CARRIER | fe_status::FE_HAS_SYNC) {
            return Ok(true);
        }
        if status.contains(fe_status::FE_TIMEDOUT) {
            return Ok(false);
        }
    }
}

fn read_back(adapter: &FrontendAdapter, req: &PrescanRequest, satconf: &SatConfig) -> Result<LockedParameters> {
    let (freq, symbol_rate, modulation, fec, delsys, stream_id_raw, rolloff, pilot, matype, isi_bytes) =
        crate::get_dtv_properties!(
            adapter,
            DTV_FREQUENCY,
            DTV_SYMBOL_RATE,
            DTV_MODULATION,
            DTV_INNER_FEC,
            DTV_DELIVERY_SYSTEM,
            DTV_STREAM_ID,
            DTV_ROLLOFF,
            DTV_PILOT,
            DTV_MATYPE,
            DTV_ISI_LIST
        )
        .context("FE: prescan readback")?;

    // For Unicable, the returned frequency is the SCR IF; report the
    // original candidate frequency instead.
    let frequency_khz = if satconf.is_unicable() { req.frequency_khz } else { freq };

    let stream_id = decode_stream_id(stream_id_raw);
    let pls_mode = decode_pls_mode(matype);
    let pls_code = if pls_mode.is_some() { Some(decode_pls_code(matype)) } else { None };

    let ts_gs = (matype & 0xC0) >> 6;
    let is_gse = stream_id >= 0 && matype != 0 && ts_gs != 0b11;

    let isi_list = decode_isi_bitset(&isi_bytes);
    let multistream = isi_list.len() > 1;

    Ok(LockedParameters {
        frequency_khz,
        symbol_rate,
        delivery_system: delsys.into(),
        modulation: modulation.into(),
        fec: fec.into(),
        rolloff: rolloff.into(),
        pilot: pilot.into(),
        stream_id,
        pls_mode,
        pls_code,
        is_gse,
        isi_list,
        multistream,
    })
}

/// Multistream candidates are materialised as one candidate per ISI sharing
/// the other tuning parameters. The base candidate's own ISI
/// (`locked.stream_id`) is kept, the rest are cloned with `stream_id`
/// overridden.
pub fn materialise_multistream_candidates(base: &CandidatePeak, locked: &LockedParameters) -> Vec<CandidatePeak> {
    if !locked.multistream {
        return vec![base.clone()];
    }

    locked
        .isi_list
        .iter()
        .map(|&isi| {
            let mut c = base.clone();
            if let Some(mut params) = c.locked.clone() {
                params.stream_id = isi as i32;
                c.locked = Some(params);
            }
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlsMode;

    #[test]
    fn multistream_candidate_materialisation_produces_one_per_isi() {
        let locked = LockedParameters {
            frequency_khz: 11_623_000,
            symbol_rate: 27_500_000,
            delivery_system: crate::model::fe_delivery_system_serde::Wrap(fe_delivery_system::SYS_DVBS2),
            modulation: crate::model::fe_modulation_serde::Wrap(fe_modulation::PSK_8),
            fec: crate::model::fe_code_rate_serde::Wrap(fe_code_rate::FEC_3_4),
            rolloff: crate::model::fe_rolloff_serde::Wrap(fe_rolloff::ROLLOFF_35),
            pilot: crate::model::fe_pilot_serde::Wrap(fe_pilot::PILOT_AUTO),
            stream_id: 0,
            pls_mode: Some(PlsMode::Root),
            pls_code: Some(1),
            is_gse: false,
            isi_list: vec![0, 1, 2],
            multistream: true,
        };
        let mut base = CandidatePeak::new(11_623_000, 27_500_000, Polarisation::H, -4500, 1200);
        base.locked = Some(locked.clone());

        let candidates = materialise_multistream_candidates(&base, &locked);
        assert_eq!(candidates.len(), 3);
        let stream_ids: Vec<i32> = candidates.iter().map(|c| c.locked.as_ref().unwrap().stream_id).collect();
        assert_eq!(stream_ids, vec![0, 1, 2]);
        assert!(candidates.iter().all(|c| c.frequency_khz == 11_623_000 && c.symbol_rate == 27_500_000));
    }
}
