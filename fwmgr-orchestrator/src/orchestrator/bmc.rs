// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::ensure_image;
use super::Orchestrator;
use crate::error::StepError;
use crate::host::HostPlatform;
use crate::slot;
use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use crate::transport::InstallTarget;
use camino::Utf8Path;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::FlashMode;
use slog::info;
use slog::o;
use slog::Logger;

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    /// Stage, install into each resolved slot (stopping at the first
    /// failure), point the next boot at the new image for ping-pong, and
    /// reboot the controller.
    ///
    /// Completion means the reboot was accepted; waiting for the controller
    /// to come back is up to the caller.
    pub(super) async fn upgrade_bmc(
        &self,
        log: &Logger,
        image: &Utf8Path,
        mode: FlashMode,
    ) -> Result<(), StepError> {
        ensure_image(image).await?;

        let targets = match slot::fixed_targets(mode) {
            Some(targets) => targets,
            None => {
                let running = self
                    .query_slot(ControllerCommand::QueryRunningSlot(
                        ComponentKind::Bmc,
                    ))
                    .await?;
                info!(log, "BMC running slot"; "slot" => %running);
                slot::resolve(running, mode)
            }
        };
        info!(
            log, "resolved BMC target slots";
            "mode" => %mode,
            "targets" => ?targets,
        );

        let staged = self.stage(log, image).await?;

        for &target in &targets {
            let log = log.new(o!("slot" => target.to_string()));
            info!(log, "installing BMC image");
            self.invoke_ok(&ControllerCommand::Install {
                target: InstallTarget::Bmc(target),
                image: staged.clone(),
            })
            .await?;
            info!(log, "installed BMC image");
        }

        // A plain reboot comes back on whichever slot was configured before.
        if let (FlashMode::PingPong, [target]) = (mode, targets.as_slice()) {
            info!(log, "setting next boot slot"; "slot" => %target);
            self.invoke_ok(&ControllerCommand::SetNextBoot {
                kind: ComponentKind::Bmc,
                slot: *target,
            })
            .await?;
        }

        info!(log, "rebooting BMC");
        self.invoke_ok(&ControllerCommand::Reboot).await?;
        Ok(())
    }
}
