// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::ensure_image;
use super::Orchestrator;
use crate::error::StepError;
use crate::host::HostPlatform;
use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use crate::transport::InstallTarget;
use camino::Utf8Path;
use fwmgr_messages::FlashSlot;
use slog::info;
use slog::o;
use slog::Logger;

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    /// BIOS takes effect on the next host boot; there is no refresh step.
    pub(super) async fn upgrade_bios(
        &self,
        log: &Logger,
        image: &Utf8Path,
        slot: FlashSlot,
    ) -> Result<(), StepError> {
        let log = log.new(o!("slot" => slot.to_string()));
        ensure_image(image).await?;
        let staged = self.stage(&log, image).await?;
        info!(log, "installing BIOS image");
        self.invoke_ok(&ControllerCommand::Install {
            target: InstallTarget::Bios(slot),
            image: staged,
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::orchestrator::tests::Harness;
    use crate::request::UpgradeRequest;
    use fwmgr_messages::FlashSlot;
    use fwmgr_messages::UpgradeOutcome;

    #[tokio::test]
    async fn bios_installs_without_refresh_or_reboot() {
        let h = Harness::new("as13-32h");
        let image = h.images.create("bios.bin");

        let report = h
            .orchestrator
            .upgrade(UpgradeRequest::Bios { image, slot: FlashSlot::Master })
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(
            report.records.records()[0].extra.as_deref(),
            Some("master")
        );
        assert_eq!(h.controller.invocations("install"), 1);
        assert_eq!(h.controller.invocations("refresh"), 0);
        assert_eq!(h.controller.invocations("reboot"), 0);
    }

    #[tokio::test]
    async fn rejected_install_fails() {
        let h = Harness::new("as13-32h");
        let image = h.images.create("bios.bin");
        h.controller.script_failures("install", 1);

        let report = h
            .orchestrator
            .upgrade(UpgradeRequest::Bios { image, slot: FlashSlot::Slave })
            .await
            .unwrap();
        assert_eq!(report.outcome, UpgradeOutcome::Failed);
        // No retry for BIOS.
        assert_eq!(h.controller.invocations("install"), 1);
    }
}
