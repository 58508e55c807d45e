// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// A canonical VM power state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PowerState {
    /// Running.
    Enabled,
    /// Powered off.
    Disabled,
    /// Paused in memory.
    Paused,
    /// Saved to disk.
    Suspended,
    /// Powering on.
    Starting,
    /// Taking a checkpoint.
    Snapshotting,
    /// Saving state to disk.
    Saving,
    /// Powering off.
    Stopping,
    /// Pausing.
    Pausing,
    /// Resuming from pause.
    Resuming,
    /// A state code with no canonical name.
    Other(u16),
}

impl PowerState {
    /// Maps a Hyper-V `Msvm_ComputerSystem.EnabledState` code.
    pub fn from_enabled_state(code: u16) -> Self {
        match code {
            2 => Self::Enabled,
            3 => Self::Disabled,
            32768 => Self::Paused,
            32769 => Self::Suspended,
            32770 => Self::Starting,
            32771 => Self::Snapshotting,
            32773 => Self::Saving,
            32774 => Self::Stopping,
            32776 => Self::Pausing,
            32777 => Self::Resuming,
            code => Self::Other(code),
        }
    }
}
