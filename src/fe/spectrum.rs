use {
    super::{sys::*, FeDevice},
    anyhow::{Context, Result},
    nix::ioctl_readwrite,
    std::os::unix::io::AsRawFd,
};

/// A single hardware-detected carrier candidate, as returned inline with a
/// spectrum acquisition by drivers that support it.
///
/// Frequency and symbol rate are in the driver's native units (kHz and
/// symbols/s respectively); the acquirer is responsible for converting the
/// frequency to a transponder frequency when the acquisition was IF-relative
/// (Unicable).
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct FeSpectrumCandidate {
    pub frequency: u32,
    pub symbol_rate: u32,
    /// Signal level in thousandths of a dB, as returned by the driver.
    pub signal_level: i32,
}

impl Default for FeSpectrumCandidate {
    #[inline]
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// Caller-allocated parameter block for the `FE_GET_SPECTRUM_SCAN` vendor
/// ioctl.
///
/// Unlike the fixed 56-byte `DtvPropertyRequest` payloads, a spectrum
/// acquisition can return tens of thousands of samples, so the driver is
/// handed raw pointers to caller buffers plus their capacities instead of a
/// `DTV_PROPERTY` entry. The kernel/driver fills `freq`/`rf_level` up to
/// `num_freq` entries and `candidates` up to `num_candidates`, never
/// exceeding the caller-supplied capacities; buffers must stay valid and
/// unmoved for the duration of the call.
#[repr(C)]
pub struct FeSpectrumScan {
    pub scan_range_low: u32,
    pub scan_range_high: u32,
    pub fft_size: u32,
    pub resolution_hz: u32,

    pub freq: *mut u32,
    pub rf_level: *mut i32,
    pub max_len: u32,
    pub num_freq: u32,

    pub candidates: *mut FeSpectrumCandidate,
    pub max_candidates: u32,
    pub num_candidates: u32,
}

impl FeSpectrumScan {
    pub fn new(
        scan_range_low: u32,
        scan_range_high: u32,
        fft_size: u32,
        resolution_hz: u32,
        freq: &mut [u32],
        rf_level: &mut [i32],
        candidates: &mut [FeSpectrumCandidate],
    ) -> Self {
        debug_assert_eq!(freq.len(), rf_level.len());
        FeSpectrumScan {
            scan_range_low,
            scan_range_high,
            fft_size,
            resolution_hz,
            freq: freq.as_mut_ptr(),
            rf_level: rf_level.as_mut_ptr(),
            max_len: freq.len() as u32,
            num_freq: 0,
            candidates: candidates.as_mut_ptr(),
            max_candidates: candidates.len() as u32,
            num_candidates: 0,
        }
    }
}

impl FeDevice {
    /// Runs a driver-level spectrum acquisition over `req.scan_range_low
    /// ..= req.scan_range_high` and fills the caller buffers referenced by
    /// `req` with samples and (if the driver supports it) hardware-detected
    /// candidate peaks.
    pub fn get_spectrum_scan(&self, req: &mut FeSpectrumScan) -> Result<()> {
        // FE_GET_SPECTRUM_SCAN (vendor extension, not part of the stock
        // DVB-API v5 property set)
        ioctl_readwrite!(
            #[inline]
            ioctl_call,
            b'o',
            100,
            FeSpectrumScan
        );
        unsafe { ioctl_call(self.as_raw_fd(), req as *mut _) }
            .context("FE: spectrum scan")?;

        Ok(())
    }
}
