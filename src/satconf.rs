//! The satellite-configuration chain: LNB, DiSEqC switches, rotor and
//! Unicable gateway. Explicitly a pre-existing external component — this
//! module gives the core something concrete to parameterise and sequence
//! through, without claiming wire-level DiSEqC/EN50494 correctness beyond
//! ordering and per-device delay.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnbType {
    Universal,
    Single,
    Circular,
}

#[derive(Debug, Clone)]
pub struct DiseqcSwitch {
    pub committed_input: u8,
    pub uncommitted_input: Option<u8>,
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct RotorConfig {
    pub usals: bool,
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct UnicableConfig {
    pub scr_index: u8,
    pub scr_freq_khz: u32,
    /// Slice width used by the acquirer when covering a band through this
    /// gateway, default 50 MHz.
    pub slice_width_khz: u32,
}

impl Default for UnicableConfig {
    fn default() -> Self {
        UnicableConfig {
            scr_index: 0,
            scr_freq_khz: 0,
            slice_width_khz: 50_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SatConfig {
    pub lnb_type: LnbType,
    pub switches: Vec<DiseqcSwitch>,
    pub rotor: Option<RotorConfig>,
    pub unicable: Option<UnicableConfig>,
}

impl SatConfig {
    pub fn is_unicable(&self) -> bool {
        self.unicable.is_some()
    }
}

/// Encodes an EN50494-style "ODU channel change" command selecting `scr`'s
/// output at `target_if_khz` sourced from `transponder_khz`. Sequencing
/// order and delay are what this crate actually relies on; the wire bytes
/// are illustrative, not validated against a real Unicable gateway.
pub fn unicable_odu_command(unicable: &UnicableConfig, transponder_khz: u32) -> [u8; 4] {
    let fmhz = transponder_khz as i64 / 1000;
    let scr_mhz = unicable.scr_freq_khz as i64 / 1000;
    let t = (((fmhz - 100 + 2 * scr_mhz) / 4) as i64).clamp(0, 0x3FF) as u16;

    [
        0x70,
        0x00 | (unicable.scr_index << 5) | ((t >> 8) as u8 & 0x03),
        (t & 0xFF) as u8,
        0x00,
    ]
}
