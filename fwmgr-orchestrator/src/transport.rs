// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command/response channel to the management controller.

use crate::error::TransportError;
use crate::sku::CpldTag;
use async_trait::async_trait;
use camino::Utf8Path;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::FlashSlot;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where an image landed after staging, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedImage {
    pub remote_path: String,
}

impl fmt::Display for StagedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.remote_path)
    }
}

/// What an install command writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstallTarget {
    Bmc(FlashSlot),
    Bios(FlashSlot),
    Cpld(CpldTag),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ControllerCommand {
    Install {
        target: InstallTarget,
        image: StagedImage,
    },
    /// Activate previously installed images. `names` and `images` are
    /// parallel; `power_cycle` asks the controller to power cycle the host
    /// afterwards.
    Refresh {
        names: Vec<String>,
        images: Vec<String>,
        power_cycle: bool,
    },
    SetNextBoot {
        kind: ComponentKind,
        slot: FlashSlot,
    },
    Reboot,
    QueryRunningSlot(ComponentKind),
    QueryNextBoot(ComponentKind),
    QueryInfo,
    QueryVersions,
    QueryUpgradeLog,
}

impl ControllerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Refresh { .. } => "refresh",
            Self::SetNextBoot { .. } => "set-next-boot",
            Self::Reboot => "reboot",
            Self::QueryRunningSlot(_) => "query-running-slot",
            Self::QueryNextBoot(_) => "query-next-boot",
            Self::QueryInfo => "query-info",
            Self::QueryVersions => "query-versions",
            Self::QueryUpgradeLog => "query-upgrade-log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerResponse {
    pub success: bool,
    pub payload: serde_json::Value,
}

impl ControllerResponse {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self { success: true, payload }
    }

    pub fn rejected(payload: serde_json::Value) -> Self {
        Self { success: false, payload }
    }
}

/// Transport to the management controller.
///
/// Every call is bounded by a timeout chosen by the implementation. A
/// timeout surfaces as an `Err`, which callers treat the same as an
/// unsuccessful response.
#[async_trait]
pub trait ControllerTransport: Send + Sync {
    /// Copy a local image into controller-local storage.
    async fn stage(
        &self,
        local: &Utf8Path,
    ) -> Result<StagedImage, TransportError>;

    async fn invoke(
        &self,
        command: &ControllerCommand,
    ) -> Result<ControllerResponse, TransportError>;
}

#[async_trait]
impl<T: ControllerTransport + ?Sized> ControllerTransport for Arc<T> {
    async fn stage(
        &self,
        local: &Utf8Path,
    ) -> Result<StagedImage, TransportError> {
        (**self).stage(local).await
    }

    async fn invoke(
        &self,
        command: &ControllerCommand,
    ) -> Result<ControllerResponse, TransportError> {
        (**self).invoke(command).await
    }
}
