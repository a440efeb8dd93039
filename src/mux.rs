//! The mux materialiser, plus the overlap math shared with the session
//! manager's worker and `peaks` reporter.

use {
    crate::{
        fe::sys::{fe_code_rate, fe_delivery_system, fe_modulation, fe_pilot, fe_rolloff},
        model::{
            fe_code_rate_serde, fe_delivery_system_serde, fe_modulation_serde, fe_pilot_serde, fe_rolloff_serde,
            CandidatePeak, NetworkId, PeakStatus, PlsMode, Polarisation,
        },
    },
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// Opaque, serialisable reference to a materialised mux. Never dereferenced
/// directly — always re-resolved through [`NetworkRegistry::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuxRef(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanResult {
    Pending,
    Ok,
    Failed,
}

/// The fields that define a mux's tuning identity for exact-match
/// deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxKey {
    pub frequency_khz: u32,
    pub polarisation: Polarisation,
    pub symbol_rate: u32,
    pub delivery_system: fe_delivery_system_serde::Wrap,
    pub modulation: fe_modulation_serde::Wrap,
    pub fec: fe_code_rate_serde::Wrap,
    pub rolloff: fe_rolloff_serde::Wrap,
    pub pilot: fe_pilot_serde::Wrap,
    pub stream_id: i32,
    pub pls_mode: Option<PlsMode>,
    pub pls_code: Option<u32>,
}

impl PartialEq for fe_delivery_system_serde::Wrap {
    fn eq(&self, other: &Self) -> bool {
        self.0 as u32 == other.0 as u32
    }
}
impl PartialEq for fe_modulation_serde::Wrap {
    fn eq(&self, other: &Self) -> bool {
        self.0 as u32 == other.0 as u32
    }
}
impl PartialEq for fe_code_rate_serde::Wrap {
    fn eq(&self, other: &Self) -> bool {
        self.0 as u32 == other.0 as u32
    }
}
impl PartialEq for fe_rolloff_serde::Wrap {
    fn eq(&self, other: &Self) -> bool {
        self.0 as u32 == other.0 as u32
    }
}
impl PartialEq for fe_pilot_serde::Wrap {
    fn eq(&self, other: &Self) -> bool {
        self.0 as u32 == other.0 as u32
    }
}

#[derive(Debug, Clone)]
pub struct MuxSummary {
    pub mux_ref: MuxRef,
    pub frequency_khz: u32,
    pub polarisation: Polarisation,
    pub symbol_rate: u32,
    pub rolloff: f64,
    pub scan_result: ScanResult,
}

/// Back-references from session to external objects are represented as
/// opaque handles resolved via lookup. Injected into the session manager;
/// the in-memory implementation below stands in for the upstream network
/// database in tests.
pub trait NetworkRegistry: Send + Sync {
    fn find_exact(&self, network: &NetworkId, key: &MuxKey) -> Option<MuxRef>;
    fn find_overlapping(&self, network: &NetworkId, polarisation: Polarisation) -> Vec<MuxSummary>;
    fn create(&self, network: &NetworkId, key: MuxKey, is_gse: bool) -> MuxRef;
    fn lookup(&self, mux: MuxRef) -> Option<MuxSummary>;
}

struct StoredMux {
    network: NetworkId,
    key: MuxKey,
    is_gse: bool,
    scan_result: ScanResult,
}

#[derive(Default)]
pub struct InMemoryNetworkRegistry {
    muxes: Mutex<HashMap<u64, StoredMux>>,
    next_id: Mutex<u64>,
}

impl InMemoryNetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/seeding helper: inserts a pre-existing mux directly, bypassing
    /// `create`'s dedup check.
    pub fn seed(&self, network: &NetworkId, key: MuxKey, scan_result: ScanResult) -> MuxRef {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.muxes.lock().insert(
            id,
            StoredMux { network: network.clone(), key, is_gse: false, scan_result },
        );
        MuxRef(id)
    }
}

impl NetworkRegistry for InMemoryNetworkRegistry {
    fn find_exact(&self, network: &NetworkId, key: &MuxKey) -> Option<MuxRef> {
        self.muxes
            .lock()
            .iter()
            .find(|(_, m)| &m.network == network && &m.key == key)
            .map(|(id, _)| MuxRef(*id))
    }

    fn find_overlapping(&self, network: &NetworkId, polarisation: Polarisation) -> Vec<MuxSummary> {
        self.muxes
            .lock()
            .iter()
            .filter(|(_, m)| &m.network == network && m.key.polarisation == polarisation)
            .map(|(id, m)| MuxSummary {
                mux_ref: MuxRef(*id),
                frequency_khz: m.key.frequency_khz,
                polarisation: m.key.polarisation,
                symbol_rate: m.key.symbol_rate,
                rolloff: rolloff_to_ratio(m.key.rolloff.0),
                scan_result: m.scan_result,
            })
            .collect()
    }

    fn create(&self, network: &NetworkId, key: MuxKey, is_gse: bool) -> MuxRef {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.muxes.lock().insert(
            id,
            StoredMux { network: network.clone(), key, is_gse, scan_result: ScanResult::Pending },
        );
        MuxRef(id)
    }

    fn lookup(&self, mux: MuxRef) -> Option<MuxSummary> {
        self.muxes.lock().get(&mux.0).map(|m| MuxSummary {
            mux_ref: mux,
            frequency_khz: m.key.frequency_khz,
            polarisation: m.key.polarisation,
            symbol_rate: m.key.symbol_rate,
            rolloff: rolloff_to_ratio(m.key.rolloff.0),
            scan_result: m.scan_result,
        })
    }
}

const DEFAULT_ROLLOFF: f64 = 0.35;

fn rolloff_to_ratio(rolloff: fe_rolloff) -> f64 {
    match rolloff {
        fe_rolloff::ROLLOFF_35 => 0.35,
        fe_rolloff::ROLLOFF_25 => 0.25,
        fe_rolloff::ROLLOFF_20 => 0.20,
        fe_rolloff::ROLLOFF_15 => 0.15,
        fe_rolloff::ROLLOFF_10 => 0.10,
        fe_rolloff::ROLLOFF_5 => 0.05,
        fe_rolloff::ROLLOFF_AUTO => DEFAULT_ROLLOFF,
    }
}

/// The mux overlap test: `|fp - fm| <= srm * (1 + rolloff) / 2`.
pub fn overlaps(candidate_freq_khz: u32, mux: &MuxSummary) -> bool {
    let half_envelope = (mux.symbol_rate as f64 / 1000.0) * (1.0 + mux.rolloff) / 2.0;
    (candidate_freq_khz as f64 - mux.frequency_khz as f64).abs() <= half_envelope
}

/// The looser tolerance the `peaks` reporter uses: `max(srm/2000kHz, 1000kHz)`.
pub fn report_tolerance_khz(symbol_rate: u32) -> f64 {
    (symbol_rate as f64 / 2000.0).max(1000.0)
}

pub fn overlaps_loosely(candidate_freq_khz: u32, mux: &MuxSummary) -> bool {
    (candidate_freq_khz as f64 - mux.frequency_khz as f64).abs() <= report_tolerance_khz(mux.symbol_rate)
}

/// Frequency-tolerance table for mux-create deduplication.
pub fn create_tolerance_khz(symbol_rate: u32) -> u32 {
    if symbol_rate < 5_000_000 {
        1_000
    } else if symbol_rate < 30_000_000 {
        5_000
    } else {
        10_000
    }
}

/// Classifies a freshly-inserted candidate against the network's existing
/// muxes. `Some(mux)` with `scan_result == Ok` means auto-skip; `Some(mux)`
/// with `scan_result == Failed` means retry (surfaced but not skipped);
/// `None` means the candidate is novel. A candidate can overlap more than
/// one stored mux (e.g. a `failed` entry left behind next to a freshly
/// re-scanned `ok` one); an `ok` overlap always wins over a non-`ok` one
/// regardless of which was stored first.
pub fn find_covering_mux(candidate: &CandidatePeak, muxes: &[MuxSummary]) -> Option<MuxSummary> {
    let mut fallback: Option<&MuxSummary> = None;
    for m in muxes {
        if !overlaps(candidate.frequency_khz, m) {
            continue;
        }
        if m.scan_result == ScanResult::Ok {
            return Some(m.clone());
        }
        if fallback.is_none() {
            fallback = Some(m);
        }
    }
    fallback.cloned()
}

/// Builds the tuning record for a selected candidate, from either its
/// locked prescan parameters or the documented defaults, and materialises
/// it through `registry` (skipping if an exact-match mux already exists).
/// Returns `true` if a new mux was created.
pub fn create_mux(registry: &dyn NetworkRegistry, network: &NetworkId, candidate: &CandidatePeak) -> bool {
    let (key, is_gse) = match &candidate.locked {
        Some(locked) => (
            MuxKey {
                frequency_khz: locked.frequency_khz,
                polarisation: candidate.polarisation,
                symbol_rate: locked.symbol_rate,
                delivery_system: locked.delivery_system,
                modulation: locked.modulation,
                fec: locked.fec,
                rolloff: locked.rolloff,
                pilot: locked.pilot,
                stream_id: locked.stream_id,
                pls_mode: locked.pls_mode,
                pls_code: locked.pls_code,
            },
            locked.is_gse,
        ),
        None => (default_tuning_key(candidate), false),
    };

    if registry.find_exact(network, &key).is_some() {
        return false;
    }
    registry.create(network, key, is_gse);
    true
}

/// Default tuning record: {DVB-S2, AUTO, AUTO, AUTO, AUTO, no-filter, PLS ROOT:1}.
fn default_tuning_key(candidate: &CandidatePeak) -> MuxKey {
    MuxKey {
        frequency_khz: candidate.frequency_khz,
        polarisation: candidate.polarisation,
        symbol_rate: candidate.symbol_rate,
        delivery_system: fe_delivery_system_serde::Wrap(fe_delivery_system::SYS_DVBS2),
        modulation: fe_modulation_serde::Wrap(fe_modulation::QAM_AUTO),
        fec: fe_code_rate_serde::Wrap(fe_code_rate::FEC_AUTO),
        rolloff: fe_rolloff_serde::Wrap(fe_rolloff::ROLLOFF_AUTO),
        pilot: fe_pilot_serde::Wrap(fe_pilot::PILOT_AUTO),
        stream_id: -1,
        pls_mode: Some(PlsMode::Root),
        pls_code: Some(1),
    }
}

/// External-facing status, distinct from [`PeakStatus`]: this is what a
/// `peaks` caller actually sees, after folding in a live overlap lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Pending,
    Retry,
    Scanning,
    Locked,
    Failed,
    Existing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakReport {
    pub frequency_khz: u32,
    pub symbol_rate: u32,
    pub level_cdb: i32,
    pub snr_cdb: i32,
    pub polarisation: Polarisation,
    pub status: ReportStatus,
    pub existing: bool,
    pub has_failed_mux: bool,
    pub locked: Option<crate::model::LockedParameters>,
    /// The mux this candidate was matched against, and its verified tuning
    /// frequency/symbol rate, whenever a covering mux exists — regardless
    /// of whether that match caused an auto-skip.
    pub mux_ref: Option<MuxRef>,
    pub verified_freq: Option<u32>,
    pub verified_sr: Option<u32>,
}

/// Derives the external status from the candidate's internal lifecycle
/// plus a fresh overlap lookup, without mutating the candidate itself. The
/// candidate's own `mux_ref`/`verified_freq`/`verified_sr` (set when the
/// worker or `peaks` auto-skipped it) take precedence; a fresh overlap
/// match fills them in otherwise, so an `existing` report always carries
/// the mux it matched even before the candidate itself was revisited.
pub fn build_report(candidate: &CandidatePeak, muxes: &[MuxSummary]) -> PeakReport {
    let overlap = muxes.iter().find(|m| overlaps_loosely(candidate.frequency_khz, m));
    let has_failed_mux = matches!(overlap.map(|m| m.scan_result), Some(ScanResult::Failed));

    let status = match candidate.status {
        PeakStatus::Skipped => ReportStatus::Existing,
        PeakStatus::Pending if has_failed_mux => ReportStatus::Retry,
        PeakStatus::Pending => ReportStatus::Pending,
        PeakStatus::Scanning => ReportStatus::Scanning,
        PeakStatus::Locked => ReportStatus::Locked,
        PeakStatus::Failed => ReportStatus::Failed,
    };

    PeakReport {
        frequency_khz: candidate.frequency_khz,
        symbol_rate: candidate.symbol_rate,
        level_cdb: candidate.level_cdb,
        snr_cdb: candidate.snr_cdb,
        polarisation: candidate.polarisation,
        status,
        existing: matches!(status, ReportStatus::Existing),
        has_failed_mux,
        locked: candidate.locked.clone(),
        mux_ref: candidate.mux_ref.or_else(|| overlap.map(|m| m.mux_ref)),
        verified_freq: candidate.verified_freq.or_else(|| overlap.map(|m| m.frequency_khz)),
        verified_sr: candidate.verified_sr.or_else(|| overlap.map(|m| m.symbol_rate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(freq_khz: u32, sr: u32, rolloff: f64, scan_result: ScanResult) -> MuxSummary {
        MuxSummary {
            mux_ref: MuxRef(1),
            frequency_khz: freq_khz,
            polarisation: Polarisation::H,
            symbol_rate: sr,
            rolloff,
            scan_result,
        }
    }

    #[test]
    fn pending_peak_skipped_by_covering_ok_mux() {
        let mux = summary(10_930_250, 27_500_000, 0.35, ScanResult::Ok);
        assert!(overlaps(10_930_000, &mux));

        let candidate = CandidatePeak::new(10_930_000, 27_500_000, Polarisation::H, -4000, 1000);
        let covering = find_covering_mux(&candidate, &[mux]);
        assert!(covering.is_some());
        assert_eq!(covering.unwrap().frequency_khz, 10_930_250);
    }

    #[test]
    fn find_covering_mux_prefers_ok_over_earlier_failed_overlap() {
        let failed = summary(10_930_000, 27_500_000, 0.35, ScanResult::Failed);
        let ok = summary(10_930_300, 27_500_000, 0.35, ScanResult::Ok);
        let candidate = CandidatePeak::new(10_930_150, 27_500_000, Polarisation::H, -4000, 1000);

        let covering = find_covering_mux(&candidate, &[failed, ok]).expect("candidate overlaps both");
        assert_eq!(covering.scan_result, ScanResult::Ok);
    }

    #[test]
    fn find_covering_mux_falls_back_to_failed_when_no_ok_overlap() {
        let failed = summary(10_930_000, 27_500_000, 0.35, ScanResult::Failed);
        let candidate = CandidatePeak::new(10_930_100, 27_500_000, Polarisation::H, -4000, 1000);

        let covering = find_covering_mux(&candidate, &[failed]).expect("candidate overlaps the failed mux");
        assert_eq!(covering.scan_result, ScanResult::Failed);
    }

    #[test]
    fn overlap_respects_polarisation_and_envelope() {
        let mux = summary(10_930_250, 27_500_000, 0.35, ScanResult::Ok);
        // half envelope = 27500 * 1.35 / 2 = 18,562.5 kHz
        assert!(overlaps(10_930_250 - 18_562, &mux));
        assert!(!overlaps(10_930_250 - 18_563, &mux));
    }

    #[test]
    fn create_tolerance_table() {
        assert_eq!(create_tolerance_khz(4_999_999), 1_000);
        assert_eq!(create_tolerance_khz(5_000_000), 5_000);
        assert_eq!(create_tolerance_khz(29_999_999), 5_000);
        assert_eq!(create_tolerance_khz(30_000_000), 10_000);
    }

    #[test]
    fn create_mux_skips_exact_duplicate() {
        let registry = InMemoryNetworkRegistry::new();
        let network: NetworkId = "net-1".to_string();
        let candidate = CandidatePeak::new(11_623_000, 27_500_000, Polarisation::H, -4500, 1200);

        assert!(create_mux(&registry, &network, &candidate));
        assert!(!create_mux(&registry, &network, &candidate));
    }

    /// Three ISI candidates at the same frequency/SR but distinct
    /// stream_id produce three distinct muxes.
    #[test]
    fn multistream_candidates_create_distinct_muxes() {
        let registry = InMemoryNetworkRegistry::new();
        let network: NetworkId = "net-1".to_string();

        let mut created = 0;
        for isi in 0..3 {
            let mut c = CandidatePeak::new(11_623_000, 27_500_000, Polarisation::H, -4500, 1200);
            c.locked = Some(crate::model::LockedParameters {
                frequency_khz: 11_623_000,
                symbol_rate: 27_500_000,
                delivery_system: fe_delivery_system_serde::Wrap(fe_delivery_system::SYS_DVBS2),
                modulation: fe_modulation_serde::Wrap(fe_modulation::PSK_8),
                fec: fe_code_rate_serde::Wrap(fe_code_rate::FEC_3_4),
                rolloff: fe_rolloff_serde::Wrap(fe_rolloff::ROLLOFF_35),
                pilot: fe_pilot_serde::Wrap(fe_pilot::PILOT_AUTO),
                stream_id: isi,
                pls_mode: Some(PlsMode::Root),
                pls_code: Some(1),
                is_gse: false,
                isi_list: vec![0, 1, 2],
                multistream: true,
            });
            if create_mux(&registry, &network, &c) {
                created += 1;
            }
        }
        assert_eq!(created, 3);
    }
}
