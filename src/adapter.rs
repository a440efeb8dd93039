//! The frontend driver adapter. Funnels every driver concern (event waiting,
//! pacing, DiSEqC/Unicable sequencing) through one collaborator sitting on
//! top of `FeDevice`, so the acquirer and prescan engine can be tested
//! against a stub frontend.

use {
    crate::{
        fe::{sys::*, FeDevice},
        model::{Band, Polarisation},
        satconf::{unicable_odu_command, SatConfig},
    },
    anyhow::{Context, Result},
    std::{thread, time::Duration},
};

const VOLTAGE_DELAY: Duration = Duration::from_millis(15);
const TONE_DELAY: Duration = Duration::from_millis(20);

/// Remembers the last (polarisation, band) the adapter tuned, so repeated
/// requests for the same slot skip resequencing DiSEqC traffic. The session
/// manager must call [`DiseqcCache::invalidate`] at the start of every scan
/// to force fresh traffic.
#[derive(Debug, Default)]
pub struct DiseqcCache {
    pol: Option<Polarisation>,
    band: Option<Band>,
}

impl DiseqcCache {
    pub fn invalidate(&mut self) {
        self.pol = None;
        self.band = None;
    }

    fn matches(&self, pol: Polarisation, band: Band) -> bool {
        self.pol == Some(pol) && self.band == Some(band)
    }

    fn record(&mut self, pol: Polarisation, band: Band) {
        self.pol = Some(pol);
        self.band = Some(band);
    }
}

pub struct FrontendAdapter<'a> {
    fe: &'a FeDevice,
}

impl<'a> FrontendAdapter<'a> {
    pub fn new(fe: &'a FeDevice) -> Self {
        FrontendAdapter { fe }
    }

    pub fn clear(&self) -> Result<()> {
        self.fe.clear()
    }

    pub fn set_properties(&self, props: &[DtvProperty]) -> Result<()> {
        self.fe.set_properties(props)
    }

    pub fn get_properties(&self, props: &mut [DtvProperty]) -> Result<()> {
        self.fe.get_properties(props)
    }

    pub fn get_spectrum_scan(&self, req: &mut crate::fe::FeSpectrumScan) -> Result<()> {
        self.fe.get_spectrum_scan(req)
    }

    pub fn set_voltage(&self, pol: Polarisation) -> Result<()> {
        let v = match pol {
            Polarisation::V => SEC_VOLTAGE_13,
            Polarisation::H => SEC_VOLTAGE_18,
        };
        self.fe.set_voltage(v as u32)?;
        thread::sleep(VOLTAGE_DELAY);
        Ok(())
    }

    pub fn set_tone(&self, band: Band) -> Result<()> {
        let tone = match band {
            Band::Low => SEC_TONE_OFF,
            Band::High => SEC_TONE_ON,
        };
        self.fe.set_tone(tone as u32)?;
        thread::sleep(TONE_DELAY);
        Ok(())
    }

    /// Waits up to `timeout` for a carrier-lock/sync/error status bitmask
    /// to appear on the readiness descriptor.
    pub fn await_event(&self, timeout: Duration) -> Result<fe_status> {
        self.fe
            .poll_readable(timeout)
            .context("FE: await event")?;
        self.fe.read_status()
    }

    /// Invokes the satellite-configuration chain for `(pol, band)`: voltage,
    /// tone, then each configured DiSEqC device in order, skipping the
    /// resequencing entirely if `cache` already reflects this slot.
    pub fn send_satconf_chain(
        &self,
        conf: &SatConfig,
        pol: Polarisation,
        band: Band,
        cache: &mut DiseqcCache,
    ) -> Result<()> {
        if cache.matches(pol, band) {
            return Ok(());
        }

        self.set_voltage(pol)?;
        self.set_tone(band)?;

        for sw in &conf.switches {
            let mut cmd = vec![0xE0, 0x10, 0x38];
            let mut data = 0xF0u8;
            if let Some(input) = sw.uncommitted_input {
                data |= input & 0x0F;
            } else {
                data |= sw.committed_input & 0x0F;
            }
            cmd.push(data);
            self.fe.diseqc_master_cmd(&cmd)?;
            thread::sleep(sw.settle);
        }

        if let Some(rotor) = &conf.rotor {
            // Positioning itself is the satellite-configuration element's
            // concern; the core only honours its settle time.
            thread::sleep(rotor.settle);
        }

        cache.record(pol, band);
        Ok(())
    }

    /// Sends a Unicable ODU channel-change command selecting `transponder_khz`
    /// through the configured gateway. Must be strictly serialised with the
    /// subsequent tune on whatever bus the satellite configuration shares
    /// with other sessions; this adapter does not itself provide that
    /// serialisation primitive.
    pub fn send_unicable_odu(&self, conf: &SatConfig, transponder_khz: u32) -> Result<()> {
        let unicable = conf
            .unicable
            .as_ref()
            .context("FE: satconf has no Unicable gateway")?;
        let cmd = unicable_odu_command(unicable, transponder_khz);
        self.fe.diseqc_master_cmd(&cmd)?;
        Ok(())
    }
}
