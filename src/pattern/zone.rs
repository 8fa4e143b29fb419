//! Zone addressing.
//!
//! A zone is the physical half of the bilateral pair (left or right wrist),
//! orthogonal to the protocol role. Segments carry one column per zone; the
//! playback engine picks the column for the local device.

use crate::role::Role;

/// Physical half of the bilateral pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Zone {
    Left,
    Right,
}

impl Zone {
    /// Default zone for a role: the server takes the right side. A
    /// standalone or undetermined device also drives left, matching the
    /// single-device experience.
    pub fn for_role(role: Role) -> Zone {
        match role {
            Role::Server => Zone::Right,
            _ => Zone::Left,
        }
    }
}

/// How the local zone is determined.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZoneMode {
    /// Derived from the negotiated role.
    Auto,
    /// Pinned by the user.
    Manual,
}

/// Runtime zone configuration.
///
/// Mode changes take effect at the next playback tick; past ticks are never
/// re-addressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    mode: ZoneMode,
    manual: Zone,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            mode: ZoneMode::Auto,
            manual: Zone::Left,
        }
    }
}

impl ZoneConfig {
    /// Creates a manual configuration pinned to `zone`.
    pub const fn manual(zone: Zone) -> Self {
        ZoneConfig {
            mode: ZoneMode::Manual,
            manual: zone,
        }
    }

    pub fn mode(&self) -> ZoneMode {
        self.mode
    }

    /// Switches to automatic (role-derived) addressing.
    pub fn set_auto(&mut self) {
        self.mode = ZoneMode::Auto;
    }

    /// Pins the zone manually.
    pub fn set_manual(&mut self, zone: Zone) {
        self.mode = ZoneMode::Manual;
        self.manual = zone;
    }

    /// Resolves the effective zone for the given role.
    pub fn zone(&self, role: Role) -> Zone {
        match self.mode {
            ZoneMode::Auto => Zone::for_role(role),
            ZoneMode::Manual => self.manual,
        }
    }
}
