// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-SKU static configuration: which CPLDs exist and how the controller
//! names them, which components need a refresh (and power cycle) before a
//! new image takes effect, how to re-enumerate the FPGA, and where the host
//! can read firmware versions locally.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use fwmgr_messages::CpldSubtype;
use serde::Deserialize;
use serde::Serialize;
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use strum_macros::Display;
use strum_macros::EnumString;
use strum_macros::IntoStaticStr;
use thiserror::Error;

/// Controller-side name of a CPLD, used when building install commands.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CpldTag {
    TopLc,
    #[strum(to_string = "bottom_lc", serialize = "bot_lc")]
    BottomLc,
    Fan,
    Cpu,
    Base,
    Combo,
    Switch,
    /// A subtype with no controller-side counterpart on this SKU.
    #[serde(other)]
    Unknown,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct RefreshPolicy {
    #[serde(default)]
    pub requires_refresh: bool,
    #[serde(default)]
    pub requires_power_cycle: bool,
}

/// The sequence that makes the host re-read FPGA configuration after
/// programming: unload driver, remove the PCI device, pulse the reset
/// register, settle, rescan the parent bus, reload driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpgaConfig {
    pub program_tool: String,
    pub driver: String,
    pub device_remove: Utf8PathBuf,
    pub reset_register: Utf8PathBuf,
    pub reset_value: String,
    pub parent_rescan: Utf8PathBuf,
    pub settle_ms: u64,
}

impl FpgaConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    fn for_platform(platform: &str) -> Self {
        Self {
            program_tool: "fpga_prog".to_string(),
            driver: "switchboard_fpga".to_string(),
            device_remove: Utf8PathBuf::from(
                "/sys/devices/pci0000:00/0000:00:1c.0/0000:09:00.0/remove",
            ),
            reset_register: Utf8PathBuf::from(format!(
                "/sys/devices/platform/{platform}.cpldb/setreg"
            )),
            reset_value: "0xa10a 0".to_string(),
            parent_rescan: Utf8PathBuf::from(
                "/sys/devices/pci0000:00/0000:00:1c.0/rescan",
            ),
            settle_ms: 10_000,
        }
    }
}

/// How a version register encodes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFormat {
    /// `0xMm`: one hex digit each of major and minor.
    Nibbles,
    /// `0xMMMMmmmm`: sixteen bits each of major and minor.
    HalfWords,
}

/// A version register behind a `getreg` attribute: writing the register
/// address selects it, reading back returns its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSource {
    pub name: String,
    pub path: Utf8PathBuf,
    pub register: String,
    pub format: RegisterFormat,
}

/// Versions the host reads itself rather than asking the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSources {
    /// Ask `dmidecode` for the BIOS version.
    #[serde(default)]
    pub bios: bool,
    /// ONIE `machine.conf`, holding an `onie_version=` line.
    #[serde(default)]
    pub onie_config: Option<Utf8PathBuf>,
    #[serde(default)]
    pub registers: Vec<RegisterSource>,
}

impl VersionSources {
    fn for_platform(platform: &str) -> Self {
        let cpldb = Utf8PathBuf::from(format!(
            "/sys/devices/platform/{platform}.cpldb/getreg"
        ));
        let switchboard = |device: &str| {
            Utf8PathBuf::from(format!(
                "/sys/devices/platform/{platform}.switchboard/{device}/getreg"
            ))
        };

        let mut registers = vec![
            RegisterSource {
                name: "FPGA".to_string(),
                path: switchboard("FPGA"),
                register: "0x00".to_string(),
                format: RegisterFormat::HalfWords,
            },
            RegisterSource {
                name: "CPLD_B".to_string(),
                path: cpldb.clone(),
                register: "0xA100".to_string(),
                format: RegisterFormat::Nibbles,
            },
            RegisterSource {
                name: "CPLD_C".to_string(),
                path: cpldb,
                register: "0xA1E0".to_string(),
                format: RegisterFormat::Nibbles,
            },
        ];
        for n in 1..=4 {
            registers.push(RegisterSource {
                name: format!("CPLD_{n}"),
                path: switchboard(&format!("CPLD{n}")),
                register: "0x00".to_string(),
                format: RegisterFormat::Nibbles,
            });
        }

        Self {
            bios: true,
            onie_config: Some(Utf8PathBuf::from("/host/machine.conf")),
            registers,
        }
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigLoadError {
    #[error("failed to read SKU config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse SKU config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("no built-in configuration for SKU {0:?}")]
    UnknownSku(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuConfig {
    pub name: String,
    /// CPLD subtype name to controller tag.
    #[serde(default)]
    pub cpld: BTreeMap<CpldSubtype, CpldTag>,
    /// Component or subtype name (e.g. `BASE_CPLD`, `FPGA`) to its refresh
    /// requirements. Names are matched case-insensitively.
    #[serde(default)]
    pub refresh: BTreeMap<String, RefreshPolicy>,
    pub fpga: FpgaConfig,
    #[serde(default)]
    pub versions: VersionSources,
}

impl SkuConfig {
    pub const BUILTIN: [&'static str; 3] =
        ["as23-128h", "as13-32h", "as13-48f8h"];

    pub fn builtin(name: &str) -> Result<Self, ConfigLoadError> {
        let config = match name {
            "as23-128h" => Self {
                name: name.to_string(),
                cpld: cpld_table(&[
                    ("TOP_LC_CPLD", CpldTag::TopLc),
                    ("BOT_LC_CPLD", CpldTag::BottomLc),
                    ("FAN_CPLD", CpldTag::Fan),
                    ("CPU_CPLD", CpldTag::Cpu),
                    ("BASE_CPLD", CpldTag::Base),
                    ("COMBO_CPLD", CpldTag::Combo),
                    ("SW_CPLD1", CpldTag::Switch),
                    ("SW_CPLD2", CpldTag::Switch),
                ]),
                refresh: refresh_table(&[
                    ("FAN_CPLD", true, false),
                    ("BASE_CPLD", true, true),
                    ("CPU_CPLD", true, true),
                    ("FPGA", false, true),
                    ("BIOS", false, true),
                ]),
                fpga: FpgaConfig::for_platform("AS23128h"),
                versions: VersionSources::for_platform("AS23128h"),
            },
            "as13-32h" | "as13-48f8h" => {
                let platform =
                    if name == "as13-32h" { "AS1332h" } else { "AS1348f8h" };
                Self {
                    name: name.to_string(),
                    cpld: cpld_table(&[
                        ("TOP_LC_CPLD", CpldTag::TopLc),
                        ("BOT_LC_CPLD", CpldTag::BottomLc),
                        ("FAN_CPLD", CpldTag::Fan),
                        ("CPU_CPLD", CpldTag::Cpu),
                        ("BASE_CPLD", CpldTag::Base),
                        ("COMBO_CPLD", CpldTag::Combo),
                        ("SW_CPLD", CpldTag::Switch),
                    ]),
                    refresh: refresh_table(&[
                        ("COMBO_CPLD", true, false),
                        ("BASE_CPLD", true, true),
                        ("CPU_CPLD", true, true),
                        ("FPGA", false, true),
                    ]),
                    fpga: FpgaConfig::for_platform(platform),
                    versions: VersionSources::for_platform(platform),
                }
            }
            _ => return Err(ConfigLoadError::UnknownSku(name.to_string())),
        };
        Ok(config)
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigLoadError::Io { path: path.to_owned(), err }
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|err| {
            ConfigLoadError::Parse { path: path.to_owned(), err }
        })?;
        config.refresh = config
            .refresh
            .into_iter()
            .map(|(name, policy)| (name.to_ascii_uppercase(), policy))
            .collect();
        Ok(config)
    }

    /// Controller tag for `subtype`, or [`CpldTag::Unknown`] if this SKU has
    /// no such CPLD.
    pub fn cpld_tag(&self, subtype: &CpldSubtype) -> CpldTag {
        self.cpld.get(subtype).copied().unwrap_or(CpldTag::Unknown)
    }

    /// Inverse of [`SkuConfig::cpld_tag`]. When several subtypes share a tag
    /// the first in name order wins.
    pub fn subtype_for_tag(&self, tag: CpldTag) -> Option<&CpldSubtype> {
        self.cpld.iter().find(|(_, t)| **t == tag).map(|(s, _)| s)
    }

    pub fn refresh_policy(&self, name: &str) -> RefreshPolicy {
        self.refresh
            .get(&name.trim().to_ascii_uppercase())
            .copied()
            .unwrap_or_default()
    }
}

fn cpld_table(entries: &[(&str, CpldTag)]) -> BTreeMap<CpldSubtype, CpldTag> {
    entries.iter().map(|(name, tag)| (CpldSubtype::new(name), *tag)).collect()
}

fn refresh_table(
    entries: &[(&str, bool, bool)],
) -> BTreeMap<String, RefreshPolicy> {
    entries
        .iter()
        .map(|(name, requires_refresh, requires_power_cycle)| {
            (
                name.to_string(),
                RefreshPolicy {
                    requires_refresh: *requires_refresh,
                    requires_power_cycle: *requires_power_cycle,
                },
            )
        })
        .collect()
}
