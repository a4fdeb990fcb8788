// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::credential::CredentialSource;
use crate::error::QueryError;
use crate::error::RequestError;
use crate::error::ResultLogError;
use crate::error::StepError;
use crate::host::HostPlatform;
use crate::request::UpgradeReport;
use crate::request::UpgradeRequest;
use crate::result_log;
use crate::result_log::LastResult;
use crate::result_log::ResultLog;
use crate::sku::SkuConfig;
use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use crate::transport::StagedImage;
use camino::Utf8Path;
use fwmgr_messages::wire::split_list;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::FlashSlot;
use fwmgr_messages::UpgradeBatch;
use fwmgr_messages::UpgradeOutcome;
use fwmgr_messages::UpgradeRecord;
use serde_json::Value;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

mod bios;
mod bmc;
mod cpld;
mod fpga;
mod versions;

/// Controller-side stand-in path for a refresh entry with no image.
const NO_IMAGE_PLACEHOLDER: &str = "/tmp/none";

/// Drives firmware upgrades for one chassis.
///
/// The orchestrator performs one controller request at a time and holds no
/// lock of its own: concurrent upgrades of the same chassis must be
/// serialized by the caller.
pub struct Orchestrator<T, H> {
    transport: T,
    host: H,
    credentials: Arc<dyn CredentialSource>,
    sku: SkuConfig,
    results: ResultLog,
    log: Logger,
}

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    pub fn new(
        transport: T,
        host: H,
        credentials: Arc<dyn CredentialSource>,
        sku: SkuConfig,
        results: ResultLog,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("sku" => sku.name.clone()));
        Self { transport, host, credentials, sku, results, log }
    }

    pub fn sku(&self) -> &SkuConfig {
        &self.sku
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Install and activate firmware.
    ///
    /// Returns `Err` only for requests rejected before any I/O; every later
    /// failure is recorded in the result log and reflected in the report.
    pub async fn upgrade(
        &self,
        request: UpgradeRequest,
    ) -> Result<UpgradeReport, RequestError> {
        let kind = request.kind();
        self.require_credential(kind)?;
        let (batch, log) = self.start_batch(kind, "upgrade");

        let (records, batch_ok) = match request {
            UpgradeRequest::Bmc { image, mode } => {
                let result = self.upgrade_bmc(&log, &image, mode).await;
                let extra = Some(mode.to_string());
                let record = self.record(&log, kind, &image, extra, result);
                (vec![record], true)
            }
            UpgradeRequest::Bios { image, slot } => {
                let result = self.upgrade_bios(&log, &image, slot).await;
                let extra = Some(slot.to_string());
                let record = self.record(&log, kind, &image, extra, result);
                (vec![record], true)
            }
            UpgradeRequest::Cpld { items, refresh_image } => {
                self.upgrade_cpld(&log, &items, refresh_image.as_deref(), true)
                    .await
            }
            UpgradeRequest::Fpga { image } => {
                let result = self.upgrade_fpga(&log, &image, true).await;
                (vec![self.record(&log, kind, &image, None, result)], true)
            }
        };

        Ok(self.finish(&log, batch, kind, records, batch_ok).await)
    }

    /// Install firmware without activating it: no CPLD refresh, no FPGA
    /// re-enumeration. Only CPLD and FPGA can be programmed this way.
    pub async fn program(
        &self,
        request: UpgradeRequest,
    ) -> Result<UpgradeReport, RequestError> {
        let kind = request.kind();
        self.require_credential(kind)?;

        match request {
            UpgradeRequest::Cpld { items, .. } => {
                let (batch, log) = self.start_batch(kind, "program");
                let (records, batch_ok) =
                    self.upgrade_cpld(&log, &items, None, false).await;
                Ok(self.finish(&log, batch, kind, records, batch_ok).await)
            }
            UpgradeRequest::Fpga { image } => {
                let (batch, log) = self.start_batch(kind, "program");
                let result = self.upgrade_fpga(&log, &image, false).await;
                let records =
                    vec![self.record(&log, kind, &image, None, result)];
                Ok(self.finish(&log, batch, kind, records, true).await)
            }
            UpgradeRequest::Bmc { .. } | UpgradeRequest::Bios { .. } => {
                Err(RequestError::UnsupportedKind {
                    operation: "program",
                    kind,
                })
            }
        }
    }

    /// Activate previously programmed firmware.
    ///
    /// `fpga` names (which may include `BIOS`) never carry an image. `cpld`
    /// names are paired in order with the `:`-joined `images`, where `none`
    /// stands for "no image"; without `images` no CPLD entry carries one. If
    /// any named component needs a power cycle the controller is asked to
    /// perform one.
    pub async fn refresh(
        &self,
        fpga: &[String],
        cpld: &[String],
        images: Option<&str>,
    ) -> Result<UpgradeOutcome, RequestError> {
        let names = fpga
            .iter()
            .chain(cpld)
            .map(|name| name.trim().to_ascii_uppercase())
            .collect::<Vec<_>>();
        if names.is_empty() {
            return Err(RequestError::NothingToRefresh);
        }
        let images = match images {
            Some(images) => split_list(images),
            None => vec!["none".to_string(); cpld.len()],
        };
        if images.len() != cpld.len() {
            return Err(RequestError::InvalidSubtype {
                paths: images.len(),
                subtypes: cpld.len(),
            });
        }
        let needs_staging =
            images.iter().any(|i| !i.eq_ignore_ascii_case("none"));
        if needs_staging && self.credentials.password().is_none() {
            return Err(RequestError::CredentialMissing);
        }

        let log = self.log.new(o!("operation" => "refresh"));
        let power_cycle = names
            .iter()
            .any(|name| self.sku.refresh_policy(name).requires_power_cycle);
        info!(
            log, "refreshing firmware";
            "names" => ?names,
            "power_cycle" => power_cycle,
        );

        let result = self
            .refresh_inner(&log, fpga.len(), names, images, power_cycle)
            .await;
        match result {
            Ok(()) => Ok(UpgradeOutcome::Done),
            Err(err) => {
                error!(log, "refresh failed"; &err);
                Ok(UpgradeOutcome::Failed)
            }
        }
    }

    async fn refresh_inner(
        &self,
        log: &Logger,
        placeholders: usize,
        names: Vec<String>,
        images: Vec<String>,
        power_cycle: bool,
    ) -> Result<(), StepError> {
        let mut paths = vec![NO_IMAGE_PLACEHOLDER.to_string(); placeholders];
        for image in &images {
            if image.eq_ignore_ascii_case("none") {
                paths.push(NO_IMAGE_PLACEHOLDER.to_string());
                continue;
            }
            let image = Utf8Path::new(image);
            ensure_image(image).await?;
            paths.push(self.stage(log, image).await?.remote_path);
        }

        self.invoke_ok(&ControllerCommand::Refresh {
            names,
            images: paths,
            power_cycle,
        })
        .await?;
        Ok(())
    }

    /// The slot `kind` is currently running from.
    pub async fn running_slot(
        &self,
        kind: ComponentKind,
    ) -> Result<FlashSlot, QueryError> {
        require_slotted(kind, "running-slot")?;
        Ok(self.query_slot(ControllerCommand::QueryRunningSlot(kind)).await?)
    }

    pub async fn next_boot_slot(
        &self,
        kind: ComponentKind,
    ) -> Result<FlashSlot, QueryError> {
        require_slotted(kind, "next-boot-slot")?;
        Ok(self.query_slot(ControllerCommand::QueryNextBoot(kind)).await?)
    }

    pub async fn set_next_boot_slot(
        &self,
        kind: ComponentKind,
        slot: FlashSlot,
    ) -> Result<(), QueryError> {
        require_slotted(kind, "set-next-boot-slot")?;
        info!(
            self.log, "setting next boot slot";
            "kind" => %kind,
            "slot" => %slot,
        );
        self.invoke_ok(&ControllerCommand::SetNextBoot { kind, slot }).await?;
        Ok(())
    }

    /// Records and outcome of the most recent upgrade.
    ///
    /// A CPLD batch (or an empty local log) is reconciled against the
    /// controller's own history, which may include activity this host did
    /// not initiate. If the controller cannot be asked, the local record is
    /// returned as is.
    pub async fn last_upgrade_result(
        &self,
    ) -> Result<LastResult, ResultLogError> {
        let local = self.results.last_batch().await?;
        if matches!(
            local.records.kind(),
            Some(kind) if kind != ComponentKind::Cpld
        ) {
            return Ok(local);
        }

        match self.invoke_ok(&ControllerCommand::QueryUpgradeLog).await {
            Ok(payload) => {
                let controller = result_log::parse_controller_log(
                    &payload,
                    ComponentKind::Cpld,
                    &self.sku,
                );
                Ok(result_log::reconcile(&local, &controller))
            }
            Err(err) => {
                warn!(
                    self.log,
                    "could not read controller upgrade log; \
                     reporting local result";
                    &err,
                );
                Ok(local)
            }
        }
    }

    fn require_credential(
        &self,
        kind: ComponentKind,
    ) -> Result<(), RequestError> {
        // The FPGA is programmed locally and never touches the controller.
        if kind != ComponentKind::Fpga && self.credentials.password().is_none()
        {
            return Err(RequestError::CredentialMissing);
        }
        Ok(())
    }

    fn start_batch(
        &self,
        kind: ComponentKind,
        operation: &'static str,
    ) -> (Uuid, Logger) {
        let batch = Uuid::new_v4();
        let log = self.log.new(o!(
            "kind" => kind.to_string(),
            "batch" => batch.to_string(),
        ));
        info!(log, "starting {}", operation);
        (batch, log)
    }

    /// Fold the result of an item into its record, logging any failure.
    fn record(
        &self,
        log: &Logger,
        kind: ComponentKind,
        image: &Utf8Path,
        extra: Option<String>,
        result: Result<(), StepError>,
    ) -> UpgradeRecord {
        let outcome = match result {
            Ok(()) => UpgradeOutcome::Done,
            Err(err) => {
                error!(log, "upgrade failed"; "path" => %image, &err);
                UpgradeOutcome::Failed
            }
        };
        UpgradeRecord::new(kind, image.as_str(), extra, outcome)
    }

    async fn finish(
        &self,
        log: &Logger,
        batch: Uuid,
        kind: ComponentKind,
        records: Vec<UpgradeRecord>,
        batch_ok: bool,
    ) -> UpgradeReport {
        let records = UpgradeBatch(records);
        let outcome =
            if batch_ok { records.outcome() } else { UpgradeOutcome::Failed };

        for record in records.records() {
            if let Err(err) = self.results.append(batch, record, outcome).await
            {
                error!(log, "failed to record upgrade result"; &err);
            }
        }
        info!(log, "finished"; "outcome" => %outcome);
        UpgradeReport { batch, kind, records, outcome }
    }

    async fn stage(
        &self,
        log: &Logger,
        image: &Utf8Path,
    ) -> Result<StagedImage, StepError> {
        debug!(log, "staging image"; "path" => %image);
        let staged = self.transport.stage(image).await.map_err(|err| {
            StepError::UploadFailed { path: image.to_owned(), err }
        })?;
        debug!(log, "staged image"; "remote_path" => %staged);
        Ok(staged)
    }

    /// Send `command`, treating anything but a successful response as a
    /// failure, and return the response payload.
    async fn invoke_ok(
        &self,
        command: &ControllerCommand,
    ) -> Result<Value, StepError> {
        let name = command.name();
        match self.transport.invoke(command).await {
            Ok(response) if response.success => Ok(response.payload),
            Ok(response) => Err(StepError::ControllerRejected {
                command: name,
                detail: response.payload.to_string(),
            }),
            Err(err) => {
                Err(StepError::ControllerUnreachable { command: name, err })
            }
        }
    }

    async fn query_slot(
        &self,
        command: ControllerCommand,
    ) -> Result<FlashSlot, StepError> {
        let name = command.name();
        let payload = self.invoke_ok(&command).await?;
        payload
            .get("Flash")
            .and_then(Value::as_str)
            .and_then(|flash| FlashSlot::from_str(flash).ok())
            .ok_or_else(|| StepError::UnexpectedPayload {
                command: name,
                detail: payload.to_string(),
            })
    }
}

fn require_slotted(
    kind: ComponentKind,
    operation: &'static str,
) -> Result<(), RequestError> {
    if kind.has_flash_slots() {
        Ok(())
    } else {
        Err(RequestError::UnsupportedKind { operation, kind })
    }
}

async fn ensure_image(image: &Utf8Path) -> Result<(), StepError> {
    match tokio::fs::metadata(image).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(StepError::ImageNotFound(image.to_owned())),
    }
}
