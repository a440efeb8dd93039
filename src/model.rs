//! Shared data model: the session's identity, parameters, state and
//! results.

use {
    crate::fe::sys::{fe_code_rate, fe_delivery_system, fe_modulation, fe_pilot, fe_rolloff},
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::fmt,
};

pub type FrontendId = String;
pub type SatConfId = String;
pub type NetworkId = String;

/// 16-byte random session identity, hex-rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(#[serde(with = "hex_bytes")] [u8; 16]);

impl SessionHandle {
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        SessionHandle(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(SessionHandle(bytes))
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        s.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        super::SessionHandle::parse_hex(&s)
            .map(|h| h.0)
            .ok_or_else(|| serde::de::Error::custom("invalid session handle"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarisation {
    H,
    V,
}

impl Polarisation {
    pub fn from_letter(s: &str) -> Option<Self> {
        match s {
            "H" | "h" => Some(Polarisation::H),
            "V" | "v" => Some(Polarisation::V),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolarisationSelect {
    H,
    V,
    Both,
}

impl PolarisationSelect {
    pub fn from_letter(s: &str) -> Option<Self> {
        match s {
            "H" | "h" => Some(PolarisationSelect::H),
            "V" | "v" => Some(PolarisationSelect::V),
            "B" | "b" => Some(PolarisationSelect::Both),
            _ => None,
        }
    }

    pub fn polarisations(self) -> Vec<Polarisation> {
        match self {
            PolarisationSelect::H => vec![Polarisation::H],
            PolarisationSelect::V => vec![Polarisation::V],
            PolarisationSelect::Both => vec![Polarisation::H, Polarisation::V],
        }
    }
}

/// The two Universal-LNB RF windows, switched by the 22 kHz tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Band {
    Low = 0,
    High = 1,
}

pub const LOW_BAND_LO_KHZ: u32 = 9_750_000;
pub const HIGH_BAND_LO_KHZ: u32 = 10_600_000;
pub const BAND_SPLIT_KHZ: u32 = 11_700_000;

pub fn band_for_freq(transponder_khz: u32) -> Band {
    if transponder_khz >= BAND_SPLIT_KHZ {
        Band::High
    } else {
        Band::Low
    }
}

pub fn lo_for_band(band: Band) -> u32 {
    match band {
        Band::Low => LOW_BAND_LO_KHZ,
        Band::High => HIGH_BAND_LO_KHZ,
    }
}

/// Converts a transponder (downlink) frequency to the driver-visible IF.
pub fn to_driver(transponder_khz: u32, band: Band) -> u32 {
    transponder_khz - lo_for_band(band)
}

/// Inverse of [`to_driver`].
pub fn to_transponder(driver_khz: u32, band: Band) -> u32 {
    driver_khz + lo_for_band(band)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakDetectMode {
    Auto,
    HardwareOnly,
    SoftwareOnly,
}

impl PeakDetectMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PeakDetectMode::Auto),
            1 => Some(PeakDetectMode::HardwareOnly),
            2 => Some(PeakDetectMode::SoftwareOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Acquiring,
    Scanning,
    Complete,
    Cancelled,
    Error,
}

/// Internal candidate lifecycle. The external peak-report status (which
/// additionally distinguishes `retry`/`existing`) is derived from this plus
/// a live network-registry lookup — see `mux::PeakReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakStatus {
    Pending,
    Scanning,
    Locked,
    Failed,
    Skipped,
}

/// Physical-Layer Scrambling mode, bits 26-27 of MATYPE/PLS search entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlsMode {
    Root = 0,
    Gold = 1,
    Combo = 2,
}

impl PlsMode {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0x3 {
            0 => Some(PlsMode::Root),
            1 => Some(PlsMode::Gold),
            2 => Some(PlsMode::Combo),
            _ => None,
        }
    }
}

/// Encodes a PLS search-list entry as a 32-bit value: mode in bits 26-27,
/// code in bits 8-25.
pub fn encode_pls(mode: PlsMode, code: u32) -> u32 {
    ((mode as u32) << 26) | ((code & 0x3_FFFF) << 8)
}

pub fn decode_pls_mode(matype_or_pls: u32) -> Option<PlsMode> {
    PlsMode::from_bits(matype_or_pls >> 26)
}

pub fn decode_pls_code(matype_or_pls: u32) -> u32 {
    (matype_or_pls >> 8) & 0x3_FFFF
}

/// The fixed PLS search list the prescan engine feeds the driver before
/// tuning.
pub fn default_pls_search_list() -> [u32; 6] {
    [
        encode_pls(PlsMode::Root, 0),
        encode_pls(PlsMode::Root, 1),
        encode_pls(PlsMode::Root, 8),
        encode_pls(PlsMode::Root, 16416),
        encode_pls(PlsMode::Gold, 0),
        encode_pls(PlsMode::Gold, 8192),
    ]
}

/// Decodes the driver's `STREAM_ID` read-back quirk: 511 is "no filter"
/// (-1), 256..=510 is `raw - 256` (an ISI), and 0..=255 passes through.
pub fn decode_stream_id(raw: u32) -> i32 {
    match raw {
        511 => -1,
        256..=510 => (raw - 256) as i32,
        other => other as i32,
    }
}

/// Walks an up-to-32-byte ISI bitset LSB-first per byte, emitting the
/// sorted list of set stream ids.
pub fn decode_isi_bitset(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (byte_idx, &b) in bytes.iter().enumerate() {
        for bit in 0..8 {
            if b & (1 << bit) != 0 {
                let isi = byte_idx * 8 + bit;
                if isi < 256 {
                    out.push(isi as u8);
                }
            }
        }
    }
    out
}

/// Inverse of [`decode_isi_bitset`].
pub fn encode_isi_bitset(isi_list: &[u8]) -> [u8; 32] {
    let mut buf = [0u8; 32];
    for &isi in isi_list {
        buf[isi as usize / 8] |= 1 << (isi as usize % 8);
    }
    buf
}

/// One sample of an acquired spectrum: transponder frequency in kHz,
/// level in hundredths of a dB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumSample {
    pub freq_khz: u32,
    pub level_cdb: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumBuffer {
    pub pol: Polarisation,
    pub band: Band,
    pub samples: Vec<SpectrumSample>,
}

/// Parameters read back after a successful blind tune.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedParameters {
    pub frequency_khz: u32,
    pub symbol_rate: u32,
    pub delivery_system: fe_delivery_system_serde::Wrap,
    pub modulation: fe_modulation_serde::Wrap,
    pub fec: fe_code_rate_serde::Wrap,
    pub rolloff: fe_rolloff_serde::Wrap,
    pub pilot: fe_pilot_serde::Wrap,
    pub stream_id: i32,
    pub pls_mode: Option<PlsMode>,
    pub pls_code: Option<u32>,
    pub is_gse: bool,
    pub isi_list: Vec<u8>,
    pub multistream: bool,
}

macro_rules! serde_wrapper {
    ($modname:ident, $ty:ty) => {
        pub mod $modname {
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            #[derive(Debug, Clone, Copy)]
            pub struct Wrap(pub $ty);

            impl Serialize for Wrap {
                fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                    s.serialize_u32(self.0 as u32)
                }
            }

            impl<'de> Deserialize<'de> for Wrap {
                fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                    let v = u32::deserialize(d)?;
                    <$ty>::from_repr(v)
                        .map(Wrap)
                        .ok_or_else(|| serde::de::Error::custom("invalid enum repr"))
                }
            }

            impl From<$ty> for Wrap {
                fn from(v: $ty) -> Self {
                    Wrap(v)
                }
            }
        }
    };
}

serde_wrapper!(fe_delivery_system_serde, fe_delivery_system);
serde_wrapper!(fe_modulation_serde, fe_modulation);
serde_wrapper!(fe_code_rate_serde, fe_code_rate);
serde_wrapper!(fe_rolloff_serde, fe_rolloff);
serde_wrapper!(fe_pilot_serde, fe_pilot);

/// A candidate peak, owned exclusively by its session. Never handed out by
/// reference — queries produce immutable snapshots (`CandidatePeak` is
/// `Clone`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePeak {
    pub frequency_khz: u32,
    pub symbol_rate: u32,
    pub polarisation: Polarisation,
    pub level_cdb: i32,
    pub snr_cdb: i32,
    pub status: PeakStatus,
    pub locked: Option<LockedParameters>,
    /// Opaque back-reference to a materialised mux, resolved by identifier
    /// rather than held live. One-way: the mux never points back to the
    /// candidate, and a stale reference (the mux deleted externally) must
    /// not be dereferenced — callers re-resolve through the registry.
    pub mux_ref: Option<crate::mux::MuxRef>,
    /// The covering mux's own frequency/symbol rate, filled in alongside
    /// `mux_ref` when this candidate is auto-skipped against an existing
    /// `ok` mux.
    pub verified_freq: Option<u32>,
    pub verified_sr: Option<u32>,
}

impl CandidatePeak {
    pub fn new(frequency_khz: u32, symbol_rate: u32, polarisation: Polarisation, level_cdb: i32, snr_cdb: i32) -> Self {
        CandidatePeak {
            frequency_khz,
            symbol_rate,
            polarisation,
            level_cdb,
            snr_cdb,
            status: PeakStatus::Pending,
            locked: None,
            mux_ref: None,
            verified_freq: None,
            verified_sr: None,
        }
    }
}

/// Tunable knobs for a scan. `peak_threshold_cdb`/`peak_valley_floor_cdb`
/// expose the peak-detector thresholds here instead of compiling them in,
/// so a host can tune them per-LNB/per-dish without a crate change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub start_freq_khz: u32,
    pub end_freq_khz: u32,
    pub polarisation: PolarisationSelect,
    pub transform_size: u32,
    pub resolution_khz: u32,
    pub peak_mode: PeakDetectMode,
    pub frontend: FrontendId,
    pub satconf: Option<SatConfId>,
    pub network: NetworkId,
    pub peak_threshold_cdb: i32,
    pub peak_valley_floor_cdb: i32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            start_freq_khz: 0,
            end_freq_khz: 0,
            polarisation: PolarisationSelect::Both,
            transform_size: 512,
            resolution_khz: 0,
            peak_mode: PeakDetectMode::Auto,
            frontend: String::new(),
            satconf: None,
            network: String::new(),
            peak_threshold_cdb: 1000,
            peak_valley_floor_cdb: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub progress: u8,
    pub message: String,
    pub peak_count: u32,
    pub muxes_created: u32,
    pub muxes_locked: u32,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn band_for_freq_threshold() {
        assert_eq!(band_for_freq(BAND_SPLIT_KHZ - 1), Band::Low);
        assert_eq!(band_for_freq(BAND_SPLIT_KHZ), Band::High);
    }

    #[test]
    fn stream_id_decode_law() {
        assert_eq!(decode_stream_id(511), -1);
        for k in 256..=510u32 {
            assert_eq!(decode_stream_id(k), (k - 256) as i32);
        }
        for k in 0..=255u32 {
            assert_eq!(decode_stream_id(k), k as i32);
        }
    }

    proptest! {
        /// `to_transponder(to_driver(f, band), band) = f` for any band and offset.
        #[test]
        fn to_driver_to_transponder_round_trips(
            band in prop_oneof![Just(Band::Low), Just(Band::High)],
            offset in 0u32..2_000_000,
        ) {
            let lo = lo_for_band(band);
            let f = lo + offset;
            prop_assert_eq!(to_transponder(to_driver(f, band), band), f);
        }

        /// `band_for_freq(f) = High ⇔ f >= 11_700_000`.
        #[test]
        fn band_for_freq_matches_split(freq_khz in 9_000_000u32..13_000_000) {
            let expect_high = freq_khz >= BAND_SPLIT_KHZ;
            prop_assert_eq!(band_for_freq(freq_khz) == Band::High, expect_high);
        }

        /// `isi_bitset_encode(decode(b)) = b` restricted to the 32-byte (256
        /// stream id) domain the driver actually reports.
        #[test]
        fn isi_bitset_round_trips(bytes in proptest::collection::vec(any::<u8>(), 32)) {
            let decoded = decode_isi_bitset(&bytes);
            let encoded = encode_isi_bitset(&decoded);
            prop_assert_eq!(encoded.to_vec(), bytes);
        }

        /// Decoded ISI lists are always sorted, in-range, and de-duplicated
        /// (falls out of the LSB-first bit scan, but worth pinning).
        #[test]
        fn isi_bitset_decode_is_sorted_and_unique(bytes in proptest::collection::vec(any::<u8>(), 32)) {
            let decoded = decode_isi_bitset(&bytes);
            let mut sorted = decoded.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(decoded, sorted);
        }

        /// PLS mode/code round-trip through the bit-packed encoding.
        #[test]
        fn pls_encode_decode_round_trips(
            mode in prop_oneof![Just(PlsMode::Root), Just(PlsMode::Gold), Just(PlsMode::Combo)],
            code in 0u32..0x3_FFFF,
        ) {
            let encoded = encode_pls(mode, code);
            prop_assert_eq!(decode_pls_mode(encoded), Some(mode));
            prop_assert_eq!(decode_pls_code(encoded), code);
        }
    }
}
