//! Channel types shared between the scale link task and the rest of the firmware.

use crate::state::LinkStatus;
use crate::types::WeightSample;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};

/// Commands the link task accepts from other tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleCommand {
    Tare,
    StartTimer,
    StopTimer,
    ResetTimer,
    /// Raise weight logging to info level while a shot is running
    SetBrewing(bool),
}

impl ScaleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleCommand::Tare => "tare",
            ScaleCommand::StartTimer => "start timer",
            ScaleCommand::StopTimer => "stop timer",
            ScaleCommand::ResetTimer => "reset timer",
            ScaleCommand::SetBrewing(_) => "set brewing",
        }
    }
}

// Status channel for connection state
pub type StatusChannel = Channel<CriticalSectionRawMutex, LinkStatus, 2>;
pub type ScaleDataChannel = Channel<CriticalSectionRawMutex, WeightSample, 10>;
pub type ScaleCommandChannel = Channel<CriticalSectionRawMutex, ScaleCommand, 5>;
