// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the firmware upgrade orchestrator, its management
//! controller, and callers of either.
//!
//! Nothing in this crate performs I/O; see `fwmgr-orchestrator` for that.

mod record;
pub mod wire;

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use strum_macros::Display;
use strum_macros::EnumString;
use strum_macros::IntoStaticStr;

pub use record::UpgradeBatch;
pub use record::UpgradeOutcome;
pub use record::UpgradeRecord;
pub use record::WireBatch;
pub use strum::ParseError;

/// A field-upgradable component of the chassis.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ComponentKind {
    Bmc,
    Bios,
    Cpld,
    Fpga,
}

impl ComponentKind {
    pub const ALL: [Self; 4] = [Self::Bmc, Self::Bios, Self::Cpld, Self::Fpga];

    /// Whether this component has a redundant master/slave flash pair.
    pub fn has_flash_slots(self) -> bool {
        matches!(self, Self::Bmc | Self::Bios)
    }
}

/// One of the two redundant flash banks backing the BMC or BIOS.
///
/// A component only ever runs from exactly one bank, so there is no "both".
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FlashSlot {
    Master,
    Slave,
}

impl FlashSlot {
    pub fn opposite(self) -> Self {
        match self {
            Self::Master => Self::Slave,
            Self::Slave => Self::Master,
        }
    }
}

/// Caller-supplied install intent for a slotted component.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FlashMode {
    Master,
    Slave,
    Both,
    /// Install into whichever slot is *not* currently running.
    #[strum(to_string = "pingpong", serialize = "ping-pong")]
    PingPong,
}

impl FlashMode {
    /// The fixed slot this mode names, if it names exactly one.
    pub fn fixed_slot(self) -> Option<FlashSlot> {
        match self {
            Self::Master => Some(FlashSlot::Master),
            Self::Slave => Some(FlashSlot::Slave),
            Self::Both | Self::PingPong => None,
        }
    }
}

impl From<FlashSlot> for FlashMode {
    fn from(slot: FlashSlot) -> Self {
        match slot {
            FlashSlot::Master => Self::Master,
            FlashSlot::Slave => Self::Slave,
        }
    }
}

/// Name of a programmable logic device on a particular SKU (e.g.
/// `BASE_CPLD`, `TOP_LC_CPLD`).
///
/// The set of valid names is per-SKU configuration, so this is an open
/// identifier rather than an enum. Names are normalized to upper case.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CpldSubtype(String);

impl CpldSubtype {
    /// Pseudo-subtype marking an item of a CPLD batch as the batch's refresh
    /// image rather than an image to install.
    pub const REFRESH_IMAGE: &'static str = "REFRESH_CPLD";

    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_refresh_image(&self) -> bool {
        self.0 == Self::REFRESH_IMAGE
    }
}

impl From<String> for CpldSubtype {
    fn from(name: String) -> Self {
        Self::new(&name)
    }
}

impl From<CpldSubtype> for String {
    fn from(subtype: CpldSubtype) -> Self {
        subtype.0
    }
}

impl fmt::Debug for CpldSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpldSubtype({})", self.0)
    }
}

impl fmt::Display for CpldSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
