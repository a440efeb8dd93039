//! The session manager. Owns one scan: parameters, worker thread, progress,
//! cancellation, per-(pol,band) spectrum buffers, candidate list, status.
//! The registry is an explicit value (`SessionManager`) injected wherever
//! the eight operations are needed, rather than a process-wide singleton.

use {
    crate::{
        acquire::{self, AcquireResult},
        adapter::{DiseqcCache, FrontendAdapter},
        error::{ScanError, ScanResult},
        fe::{sys::fe_caps, FeDevice},
        model::{
            Band, CandidatePeak, FrontendId, PeakDetectMode, PeakStatus, Polarisation, PolarisationSelect,
            SatConfId, ScanOptions, SessionHandle, SessionState, SpectrumBuffer, StatusSnapshot, BAND_SPLIT_KHZ,
        },
        mux::{self, NetworkRegistry, PeakReport},
        notify::{BlindscanEvent, EventSink},
        peak,
        prescan::{self, PrescanOutcome, PrescanRequest},
        satconf::{LnbType, SatConfig},
    },
    chrono::Utc,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
    },
};

/// The frontend inventory is looked up by identifier, never held as an
/// owning pointer. The session borrows the returned `Arc<FeDevice>` for the
/// lifetime of one worker run; `release` never closes the descriptor.
pub trait FrontendRegistry: Send + Sync {
    fn get(&self, id: &FrontendId) -> Option<Arc<FeDevice>>;
}

pub trait SatConfRegistry: Send + Sync {
    fn get(&self, id: &SatConfId) -> Option<SatConfig>;
}

#[derive(Default)]
pub struct InMemoryFrontendRegistry {
    devices: Mutex<HashMap<FrontendId, Arc<FeDevice>>>,
}

impl InMemoryFrontendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: FrontendId, device: Arc<FeDevice>) {
        self.devices.lock().insert(id, device);
    }
}

impl FrontendRegistry for InMemoryFrontendRegistry {
    fn get(&self, id: &FrontendId) -> Option<Arc<FeDevice>> {
        self.devices.lock().get(id).cloned()
    }
}

#[derive(Default)]
pub struct InMemorySatConfRegistry {
    entries: Mutex<HashMap<SatConfId, SatConfig>>,
}

impl InMemorySatConfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SatConfId, conf: SatConfig) {
        self.entries.lock().insert(id, conf);
    }
}

impl SatConfRegistry for InMemorySatConfRegistry {
    fn get(&self, id: &SatConfId) -> Option<SatConfig> {
        self.entries.lock().get(id).cloned()
    }
}

fn default_satconf() -> SatConfig {
    SatConfig { lnb_type: LnbType::Universal, switches: Vec::new(), rotor: None, unicable: None }
}

struct SessionInner {
    state: SessionState,
    progress: u8,
    message: String,
    spectrum: HashMap<(Polarisation, Band), SpectrumBuffer>,
    candidates: Vec<CandidatePeak>,
    muxes_created: u32,
    muxes_locked: u32,
}

pub struct Session {
    handle: SessionHandle,
    options: ScanOptions,
    inner: Mutex<SessionInner>,
    stop_requested: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    started_at: chrono::DateTime<Utc>,
}

/// Owns every active session behind one registry lock; the per-session
/// `Mutex<SessionInner>` protects only the mutable fields the worker
/// writes.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionHandle, Arc<Session>>>,
    frontends: Arc<dyn FrontendRegistry>,
    satconfs: Arc<dyn SatConfRegistry>,
    networks: Arc<dyn NetworkRegistry>,
    notify: Arc<dyn EventSink>,
}

impl SessionManager {
    pub fn new(
        frontends: Arc<dyn FrontendRegistry>,
        satconfs: Arc<dyn SatConfRegistry>,
        networks: Arc<dyn NetworkRegistry>,
        notify: Arc<dyn EventSink>,
    ) -> Self {
        SessionManager { sessions: Mutex::new(HashMap::new()), frontends, satconfs, networks, notify }
    }

    fn get_session(&self, handle: SessionHandle) -> ScanResult<Arc<Session>> {
        self.sessions.lock().get(&handle).cloned().ok_or(ScanError::NotFound(handle))
    }

    /// Validates the request synchronously, then spawns the worker.
    /// Registry misses (unknown frontend/satconf) and missing spectrum-scan
    /// capability surface as a session-level `error` once the worker runs,
    /// not as a synchronous failure here, since they require a registry
    /// lookup the worker alone is positioned to make consistently with
    /// mid-scan invalidation.
    pub fn start(&self, options: ScanOptions) -> ScanResult<SessionHandle> {
        if options.frontend.is_empty() {
            return Err(ScanError::BadInput("frontend".into()));
        }
        if options.network.is_empty() {
            return Err(ScanError::BadInput("network".into()));
        }
        if options.end_freq_khz < options.start_freq_khz {
            return Err(ScanError::BadInput("end_freq_khz < start_freq_khz".into()));
        }

        let handle = SessionHandle::new_random();
        let session = Arc::new(Session {
            handle,
            options: options.clone(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                progress: 0,
                message: String::new(),
                spectrum: HashMap::new(),
                candidates: Vec::new(),
                muxes_created: 0,
                muxes_locked: 0,
            }),
            stop_requested: AtomicBool::new(false),
            worker: Mutex::new(None),
            started_at: Utc::now(),
        });

        self.sessions.lock().insert(handle, session.clone());

        let frontends = self.frontends.clone();
        let satconfs = self.satconfs.clone();
        let networks = self.networks.clone();
        let notify = self.notify.clone();
        let worker_session = session.clone();

        let join = thread::spawn(move || run_worker(worker_session, frontends, satconfs, networks, notify));
        *session.worker.lock() = Some(join);

        Ok(handle)
    }

    pub fn status(&self, handle: SessionHandle) -> ScanResult<StatusSnapshot> {
        let session = self.get_session(handle)?;
        let inner = session.inner.lock();
        Ok(StatusSnapshot {
            state: inner.state,
            progress: inner.progress,
            message: inner.message.clone(),
            peak_count: inner.candidates.len() as u32,
            muxes_created: inner.muxes_created,
            muxes_locked: inner.muxes_locked,
            duration_ms: session_duration_ms(&session),
        })
    }

    pub fn spectrum(&self, handle: SessionHandle, pol: Polarisation, band: Band) -> ScanResult<Option<SpectrumBuffer>> {
        let session = self.get_session(handle)?;
        let inner = session.inner.lock();
        Ok(inner.spectrum.get(&(pol, band)).cloned())
    }

    /// May flip a still-`pending` candidate to `skipped` if a mux created
    /// since the last call now covers it; pending peaks that later coincide
    /// with a freshly-created mux are silently re-labelled existing.
    pub fn peaks(&self, handle: SessionHandle) -> ScanResult<Vec<PeakReport>> {
        let session = self.get_session(handle)?;
        let mut inner = session.inner.lock();

        for candidate in inner.candidates.iter_mut() {
            if candidate.status == PeakStatus::Pending {
                let muxes = self.networks.find_overlapping(&session.options.network, candidate.polarisation);
                if let Some(m) = mux::find_covering_mux(candidate, &muxes) {
                    if m.scan_result == crate::mux::ScanResult::Ok {
                        candidate.status = PeakStatus::Skipped;
                        candidate.mux_ref = Some(m.mux_ref);
                        candidate.verified_freq = Some(m.frequency_khz);
                        candidate.verified_sr = Some(m.symbol_rate);
                    }
                }
            }
        }

        Ok(inner
            .candidates
            .iter()
            .map(|c| {
                let muxes = self.networks.find_overlapping(&session.options.network, c.polarisation);
                mux::build_report(c, &muxes)
            })
            .collect())
    }

    /// Mutates the matching candidate in place; leaves every other
    /// candidate untouched.
    pub fn prescan(&self, handle: SessionHandle, frequency_khz: u32, pol: Polarisation) -> ScanResult<PrescanOutcome> {
        let session = self.get_session(handle)?;
        let frontend = self.resolve_frontend(&session.options.frontend)?;
        let satconf = self.resolve_satconf(session.options.satconf.as_ref())?;

        let symbol_rate_estimate = {
            let inner = session.inner.lock();
            inner
                .candidates
                .iter()
                .find(|c| c.frequency_khz == frequency_khz && c.polarisation == pol)
                .map(|c| c.symbol_rate)
        };

        let adapter = FrontendAdapter::new(&frontend);
        let mut cache = DiseqcCache::default();
        let req = PrescanRequest { frequency_khz, polarisation: pol, symbol_rate_estimate };
        let outcome = prescan::prescan(&adapter, &satconf, &mut cache, &req)?;

        let mut inner = session.inner.lock();
        if let Some(candidate) = inner.candidates.iter_mut().find(|c| c.frequency_khz == frequency_khz && c.polarisation == pol) {
            if outcome.locked {
                candidate.status = PeakStatus::Locked;
                candidate.locked = outcome.parameters.clone();
                inner.muxes_locked += 1;
            } else {
                candidate.status = PeakStatus::Failed;
            }
        }

        Ok(outcome)
    }

    /// Materialises a mux per selected (frequency, polarisation) identifier
    /// — multistream candidates expand to one mux per ISI.
    pub fn create(&self, handle: SessionHandle, selected: &[(u32, Polarisation)]) -> ScanResult<u32> {
        let session = self.get_session(handle)?;
        let mut inner = session.inner.lock();

        let mut created = 0u32;
        for &(freq, pol) in selected {
            let candidate = match inner.candidates.iter().find(|c| c.frequency_khz == freq && c.polarisation == pol) {
                Some(c) => c.clone(),
                None => continue,
            };

            let variants = match &candidate.locked {
                Some(locked) => prescan::materialise_multistream_candidates(&candidate, locked),
                None => vec![candidate],
            };

            for variant in &variants {
                if mux::create_mux(self.networks.as_ref(), &session.options.network, variant) {
                    created += 1;
                }
            }
        }

        inner.muxes_created += created;
        Ok(created)
    }

    pub fn cancel(&self, handle: SessionHandle) -> ScanResult<()> {
        let session = self.get_session(handle)?;
        session.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The only legal way to reclaim a session; double-release is a no-op.
    pub fn release(&self, handle: SessionHandle) -> ScanResult<()> {
        let session = self.sessions.lock().remove(&handle);
        if let Some(session) = session {
            session.stop_requested.store(true, Ordering::SeqCst);
            if let Some(join) = session.worker.lock().take() {
                let _ = join.join();
            }
        }
        Ok(())
    }

    /// Sets stop-flags on every session and joins all workers before
    /// freeing.
    pub fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().keys().copied().collect();
        for handle in handles {
            let _ = self.release(handle);
        }
    }

    fn resolve_frontend(&self, id: &FrontendId) -> ScanResult<Arc<FeDevice>> {
        let device = self.frontends.get(id).ok_or(ScanError::ResourceUnavailable)?;
        if !device.get_caps().contains(fe_caps::FE_CAN_SPECTRUM_SCAN) {
            return Err(ScanError::UnsupportedDriver(id.clone()));
        }
        Ok(device)
    }

    fn resolve_satconf(&self, id: Option<&SatConfId>) -> ScanResult<SatConfig> {
        match id {
            Some(id) => self.satconfs.get(id).ok_or(ScanError::ResourceUnavailable),
            None => Ok(default_satconf()),
        }
    }
}

fn session_duration_ms(session: &Session) -> u64 {
    (Utc::now() - session.started_at).num_milliseconds().max(0) as u64
}

fn set_state(session: &Session, state: SessionState) {
    session.inner.lock().state = state;
}

fn emit_terminal(session: &Session, notify: &Arc<dyn EventSink>, state: SessionState) {
    let peaks = {
        let mut inner = session.inner.lock();
        inner.state = state;
        if state == SessionState::Complete {
            inner.progress = 100;
        }
        inner.candidates.len() as u32
    };
    notify.emit(BlindscanEvent {
        uuid: session.handle,
        state,
        peaks,
        duration_ms: session_duration_ms(session),
    });
}

fn fail(session: &Session, notify: &Arc<dyn EventSink>, message: &str) {
    {
        let mut inner = session.inner.lock();
        inner.message = message.to_string();
    }
    emit_terminal(session, notify, SessionState::Error);
}

/// Builds the scan plan (polarisations × bands), clipped to the bands that
/// actually intersect `[start_freq_khz, end_freq_khz]` — this is what makes
/// a low-band-only span generate exactly one slot per selected
/// polarisation instead of one per band.
fn scan_plan(pols: &[Polarisation], start_freq_khz: u32, end_freq_khz: u32) -> Vec<(Polarisation, Band)> {
    if start_freq_khz >= end_freq_khz {
        return Vec::new();
    }
    let mut plan = acquire::band_plan(pols);
    plan.retain(|&(_, band)| match band {
        Band::Low => start_freq_khz < BAND_SPLIT_KHZ,
        Band::High => end_freq_khz > BAND_SPLIT_KHZ,
    });
    plan
}

/// Clips the user's requested range to the portion of it that `band` can
/// actually cover.
fn slot_range(band: Band, start_freq_khz: u32, end_freq_khz: u32) -> (u32, u32) {
    match band {
        Band::Low => (start_freq_khz, end_freq_khz.min(BAND_SPLIT_KHZ)),
        Band::High => (start_freq_khz.max(BAND_SPLIT_KHZ), end_freq_khz),
    }
}

/// One successfully-acquired slot, carried from the acquisition pass into
/// the detect/insert pass below.
struct AcquiredSlot {
    pol: Polarisation,
    band: Band,
    candidates: Vec<CandidatePeak>,
}

/// The worker thread body. Runs until completion, cancellation, or an
/// unrecoverable precondition failure.
///
/// Progress is reported in two passes over the plan so it never steps
/// backward: the acquisition pass fills `[0, 50]` as each slot's spectrum
/// is swept, and the detect/insert pass — which classifies candidates
/// against existing muxes and can only start once every slot the first
/// pass reached has a buffer in hand — fills `[50, 100]` afterward.
/// Interleaving the two per slot (acquire slot 0, process slot 0, acquire
/// slot 1, ...) would let a later slot's acquisition report a lower
/// percentage than an earlier slot's processing already had.
fn run_worker(
    session: Arc<Session>,
    frontends: Arc<dyn FrontendRegistry>,
    satconfs: Arc<dyn SatConfRegistry>,
    networks: Arc<dyn NetworkRegistry>,
    notify: Arc<dyn EventSink>,
) {
    set_state(&session, SessionState::Acquiring);

    let frontend = match frontends.get(&session.options.frontend) {
        Some(fe) => fe,
        None => return fail(&session, &notify, "frontend not found"),
    };
    if !frontend.get_caps().contains(fe_caps::FE_CAN_SPECTRUM_SCAN) {
        return fail(&session, &notify, "frontend lacks spectrum-scan capability");
    }
    let satconf = match session.options.satconf.as_ref() {
        Some(id) => match satconfs.get(id) {
            Some(c) => c,
            None => return fail(&session, &notify, "satconf not found"),
        },
        None => default_satconf(),
    };

    let adapter = FrontendAdapter::new(&frontend);
    let mut cache = DiseqcCache::default();
    cache.invalidate();

    let plan = scan_plan(
        &session.options.polarisation.polarisations(),
        session.options.start_freq_khz,
        session.options.end_freq_khz,
    );
    if plan.is_empty() {
        return emit_terminal(&session, &notify, SessionState::Complete);
    }

    let n = plan.len() as u32;
    let mut acquired: Vec<AcquiredSlot> = Vec::new();

    for (i, &(pol, band)) in plan.iter().enumerate() {
        if session.stop_requested.load(Ordering::SeqCst) {
            return emit_terminal(&session, &notify, SessionState::Cancelled);
        }

        {
            let mut inner = session.inner.lock();
            inner.state = SessionState::Acquiring;
            inner.progress = ((i as u32 * 50) / n) as u8;
            inner.message = format!("acquiring {:?} {:?} band", pol, band);
        }

        let (slot_start, slot_end) = slot_range(band, session.options.start_freq_khz, session.options.end_freq_khz);
        if slot_start >= slot_end {
            continue;
        }

        let stop_flag = &session.stop_requested;
        let result = acquire::acquire_slot(
            &adapter,
            &satconf,
            &mut cache,
            pol,
            band,
            slot_start,
            slot_end,
            session.options.transform_size,
            session.options.resolution_khz,
            || stop_flag.load(Ordering::SeqCst),
        );

        let AcquireResult { buffer, mut candidates } = match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("blindscan: slot ({:?},{:?}) abandoned: {:#}", pol, band, e);
                continue;
            }
        };

        let need_software = match session.options.peak_mode {
            PeakDetectMode::SoftwareOnly => true,
            PeakDetectMode::HardwareOnly => false,
            PeakDetectMode::Auto => candidates.is_empty(),
        };
        if need_software {
            candidates = peak::detect_peaks(
                &buffer.samples,
                pol,
                session.options.peak_threshold_cdb,
                session.options.peak_valley_floor_cdb,
            );
        }

        {
            let mut inner = session.inner.lock();
            inner.spectrum.insert((pol, band), buffer);
        }
        acquired.push(AcquiredSlot { pol, band, candidates });
    }

    {
        let mut inner = session.inner.lock();
        inner.progress = 50;
    }

    if acquired.is_empty() {
        return emit_terminal(&session, &notify, SessionState::Complete);
    }

    let total_slots = acquired.len() as u32;
    for (j, slot) in acquired.into_iter().enumerate() {
        if session.stop_requested.load(Ordering::SeqCst) {
            return emit_terminal(&session, &notify, SessionState::Cancelled);
        }

        let mut inner = session.inner.lock();
        inner.state = SessionState::Scanning;
        inner.message = format!("processing {:?} {:?} band", slot.pol, slot.band);
        for mut candidate in slot.candidates {
            let existing = networks.find_overlapping(&session.options.network, candidate.polarisation);
            if let Some(covering) = mux::find_covering_mux(&candidate, &existing) {
                if covering.scan_result == crate::mux::ScanResult::Ok {
                    candidate.status = PeakStatus::Skipped;
                    candidate.mux_ref = Some(covering.mux_ref);
                    candidate.verified_freq = Some(covering.frequency_khz);
                    candidate.verified_sr = Some(covering.symbol_rate);
                }
            }
            inner.candidates.push(candidate);
        }
        inner.progress = (50 + (j as u32 + 1) * 50 / total_slots).min(99) as u8;
    }

    emit_terminal(&session, &notify, SessionState::Complete);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_yields_no_slots() {
        assert!(scan_plan(&[Polarisation::H], 11_000_000, 11_000_000).is_empty());
    }

    #[test]
    fn low_band_only_span_yields_one_slot_per_polarisation() {
        let plan = scan_plan(&[Polarisation::H, Polarisation::V], 10_700_000, 11_700_000);
        assert_eq!(plan, vec![(Polarisation::H, Band::Low), (Polarisation::V, Band::Low)]);
    }

    #[test]
    fn full_span_yields_both_bands() {
        let plan = scan_plan(&[Polarisation::H], 10_700_000, 12_750_000);
        assert_eq!(plan, vec![(Polarisation::H, Band::Low), (Polarisation::H, Band::High)]);
    }

    #[test]
    fn slot_range_clips_to_band() {
        assert_eq!(slot_range(Band::Low, 10_700_000, 12_750_000), (10_700_000, BAND_SPLIT_KHZ));
        assert_eq!(slot_range(Band::High, 10_700_000, 12_750_000), (BAND_SPLIT_KHZ, 12_750_000));
    }

    /// Mirrors `run_worker`'s two progress formulas directly: the
    /// acquisition pass over `n` slots followed by the detect/insert pass
    /// over the same `n` slots must never report a lower percentage than
    /// the step before it.
    #[test]
    fn worker_progress_sequence_is_non_decreasing() {
        for n in 1u32..=6 {
            let mut sequence = vec![0u8];
            for i in 0..n {
                sequence.push(((i * 50) / n) as u8);
            }
            sequence.push(50);
            for j in 0..n {
                sequence.push((50 + (j + 1) * 50 / n).min(99) as u8);
            }
            sequence.push(100);

            for pair in sequence.windows(2) {
                assert!(pair[1] >= pair[0], "progress dropped for n={}: {:?}", n, sequence);
            }
        }
    }

    #[test]
    fn registries_round_trip() {
        let satconfs = InMemorySatConfRegistry::new();
        assert!(satconfs.get(&"missing".to_string()).is_none());
        satconfs.insert("sc-1".to_string(), default_satconf());
        assert!(satconfs.get(&"sc-1".to_string()).is_some());

        let frontends = InMemoryFrontendRegistry::new();
        assert!(frontends.get(&"missing".to_string()).is_none());
    }

    #[test]
    fn unknown_session_operations_are_not_found() {
        let manager = SessionManager::new(
            Arc::new(InMemoryFrontendRegistry::new()),
            Arc::new(InMemorySatConfRegistry::new()),
            Arc::new(crate::mux::InMemoryNetworkRegistry::new()),
            Arc::new(crate::notify::NullSink),
        );
        let bogus = SessionHandle::new_random();
        assert!(matches!(manager.status(bogus), Err(ScanError::NotFound(_))));
        assert!(matches!(manager.cancel(bogus), Err(ScanError::NotFound(_))));
        assert!(matches!(manager.release(bogus), Ok(())));
    }

    #[test]
    fn start_rejects_bad_input() {
        let manager = SessionManager::new(
            Arc::new(InMemoryFrontendRegistry::new()),
            Arc::new(InMemorySatConfRegistry::new()),
            Arc::new(crate::mux::InMemoryNetworkRegistry::new()),
            Arc::new(crate::notify::NullSink),
        );
        let options = ScanOptions { frontend: String::new(), ..ScanOptions::default() };
        assert!(matches!(manager.start(options), Err(ScanError::BadInput(_))));
    }
}
