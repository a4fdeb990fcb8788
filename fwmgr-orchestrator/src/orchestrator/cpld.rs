// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::ensure_image;
use super::Orchestrator;
use crate::error::StepError;
use crate::host::HostPlatform;
use crate::request::CpldItem;
use crate::sku::CpldTag;
use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use crate::transport::InstallTarget;
use camino::Utf8Path;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::CpldSubtype;
use fwmgr_messages::UpgradeOutcome;
use fwmgr_messages::UpgradeRecord;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;

/// Install attempts per CPLD item, including the first.
const CPLD_INSTALL_ATTEMPTS: usize = 3;

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    /// Install each item independently, then (if `activate`) refresh the
    /// installed subtypes that need it.
    ///
    /// Returns one record per item, and whether the batch-level refresh step
    /// succeeded (or was not needed).
    pub(super) async fn upgrade_cpld(
        &self,
        log: &Logger,
        items: &[CpldItem],
        refresh_image: Option<&Utf8Path>,
        activate: bool,
    ) -> (Vec<UpgradeRecord>, bool) {
        let mut records = Vec::with_capacity(items.len());
        let mut installed = Vec::new();
        for item in items {
            let log = log.new(o!("subtype" => item.subtype.to_string()));
            let result = self.install_cpld(&log, item).await;
            let record = self.record(
                &log,
                ComponentKind::Cpld,
                &item.image,
                Some(item.subtype.to_string()),
                result,
            );
            if record.outcome == UpgradeOutcome::Done
                && !installed.contains(&&item.subtype)
            {
                installed.push(&item.subtype);
            }
            records.push(record);
        }

        if !activate {
            return (records, true);
        }

        let needs_refresh = installed
            .into_iter()
            .filter(|s| self.sku.refresh_policy(s.as_str()).requires_refresh)
            .collect::<Vec<_>>();
        if needs_refresh.is_empty() {
            return (records, true);
        }

        match self.refresh_cpld(log, &needs_refresh, refresh_image).await {
            Ok(()) => (records, true),
            Err(err) => {
                // Already-written flash is not rolled back.
                error!(log, "CPLD refresh failed"; &err);
                (records, false)
            }
        }
    }

    async fn install_cpld(
        &self,
        log: &Logger,
        item: &CpldItem,
    ) -> Result<(), StepError> {
        let tag = self.sku.cpld_tag(&item.subtype);
        if tag == CpldTag::Unknown {
            return Err(StepError::UnmappedSubtype(item.subtype.clone()));
        }
        ensure_image(&item.image).await?;
        let staged = self.stage(log, &item.image).await?;

        let command = ControllerCommand::Install {
            target: InstallTarget::Cpld(tag),
            image: staged,
        };
        for attempt in 1..=CPLD_INSTALL_ATTEMPTS {
            info!(log, "installing CPLD image"; "attempt" => attempt);
            match self.invoke_ok(&command).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(
                        log, "CPLD install attempt failed";
                        "attempt" => attempt,
                        &err,
                    );
                }
            }
        }

        Err(StepError::AttemptsExhausted {
            command: command.name(),
            attempts: CPLD_INSTALL_ATTEMPTS,
        })
    }

    async fn refresh_cpld(
        &self,
        log: &Logger,
        subtypes: &[&CpldSubtype],
        refresh_image: Option<&Utf8Path>,
    ) -> Result<(), StepError> {
        let names =
            subtypes.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let Some(image) = refresh_image else {
            return Err(StepError::MissingRefreshImage {
                subtypes: names.join(", "),
            });
        };
        ensure_image(image).await?;
        let staged = self.stage(log, image).await?;

        let power_cycle = subtypes
            .iter()
            .any(|s| self.sku.refresh_policy(s.as_str()).requires_power_cycle);
        info!(
            log, "refreshing CPLDs";
            "subtypes" => ?names,
            "power_cycle" => power_cycle,
        );
        let images = vec![staged.remote_path; names.len()];
        self.invoke_ok(&ControllerCommand::Refresh {
            names,
            images,
            power_cycle,
        })
        .await?;
        Ok(())
    }
}
