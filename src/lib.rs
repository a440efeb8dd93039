#[macro_use]
extern crate anyhow;

pub mod acquire;
pub mod adapter;
pub mod error;
pub mod fe;
pub mod model;
pub mod mux;
pub mod notify;
pub mod peak;
pub mod prescan;
pub mod satconf;
pub mod session;

pub use {
    error::{ScanError, ScanResult},
    fe::{FeDevice, FeStatus},
    model::{
        Band, CandidatePeak, LockedParameters, PeakDetectMode, PeakStatus, Polarisation, PolarisationSelect,
        ScanOptions, SessionHandle, SessionState, SpectrumBuffer, StatusSnapshot,
    },
    session::SessionManager,
};
