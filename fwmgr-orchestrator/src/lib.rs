// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware upgrade orchestration for the redundant, field-upgradable
//! components of a switch chassis (BMC, BIOS, CPLDs and FPGA).
//!
//! The primary entry point is [`Orchestrator`]. It drives a
//! [`ControllerTransport`] (staging images onto the management controller
//! and issuing commands to it) and a [`HostPlatform`] (local programming
//! tools and sysfs), using the tables of a [`SkuConfig`].

mod orchestrator;
mod request;

pub mod credential;
pub mod error;
pub mod host;
pub mod readiness;
pub mod rest;
pub mod result_log;
pub mod sku;
pub mod slot;
pub mod transport;

#[cfg(test)]
mod fake;

pub use credential::CredentialSource;
pub use credential::ObfuscatedPasswordFile;
pub use host::HostPlatform;
pub use host::SystemHost;
pub use orchestrator::Orchestrator;
pub use readiness::wait_until_ready;
pub use readiness::ReadinessConfig;
pub use request::CpldItem;
pub use request::UpgradeReport;
pub use request::UpgradeRequest;
pub use rest::RestTransport;
pub use rest::TransportConfig;
pub use result_log::LastResult;
pub use result_log::ResultLog;
pub use sku::SkuConfig;
pub use transport::ControllerCommand;
pub use transport::ControllerResponse;
pub use transport::ControllerTransport;

pub use fwmgr_messages as messages;

/// Default location of the local upgrade result log.
pub const DEFAULT_RESULT_LOG: &str = "/var/log/fw_upgrade.log";

/// Default location of the obfuscated controller password.
pub const DEFAULT_PASSWORD_FILE: &str = "/usr/local/etc/bmcpwd";
