// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::ensure_image;
use super::Orchestrator;
use crate::error::StepError;
use crate::host::HostPlatform;
use crate::transport::ControllerTransport;
use camino::Utf8Path;
use slog::debug;
use slog::info;
use slog::Logger;

impl<T, H> Orchestrator<T, H>
where
    T: ControllerTransport,
    H: HostPlatform,
{
    /// Program the FPGA with the local tool, then (if `activate`) make the
    /// host re-enumerate it so the new image is loaded. Nothing is staged on
    /// the controller and nothing is retried.
    pub(super) async fn upgrade_fpga(
        &self,
        log: &Logger,
        image: &Utf8Path,
        activate: bool,
    ) -> Result<(), StepError> {
        ensure_image(image).await?;

        let tool = &self.sku.fpga.program_tool;
        info!(log, "programming FPGA"; "tool" => tool, "path" => %image);
        let status =
            self.host.run(tool, &[image.as_str()]).await.map_err(|err| {
                StepError::DeviceProgramSpawn { tool: tool.clone(), err }
            })?;
        if status != 0 {
            return Err(StepError::DeviceProgramFailed {
                tool: tool.clone(),
                status,
            });
        }

        if activate {
            self.rescan_fpga(log).await?;
        }
        Ok(())
    }

    async fn rescan_fpga(&self, log: &Logger) -> Result<(), StepError> {
        let fpga = &self.sku.fpga;
        info!(log, "re-enumerating FPGA");

        self.rescan_run(log, "unload-driver", &["-r", fpga.driver.as_str()])
            .await?;
        self.rescan_write(log, "remove-device", &fpga.device_remove, "1")
            .await?;
        self.rescan_write(
            log,
            "reset-register",
            &fpga.reset_register,
            &fpga.reset_value,
        )
        .await?;
        debug!(log, "waiting for FPGA to settle"; "delay" => ?fpga.settle());
        self.host.sleep(fpga.settle()).await;
        self.rescan_write(log, "rescan-bus", &fpga.parent_rescan, "1").await?;
        self.rescan_run(log, "load-driver", &[fpga.driver.as_str()]).await?;
        Ok(())
    }

    async fn rescan_run(
        &self,
        log: &Logger,
        step: &'static str,
        args: &[&str],
    ) -> Result<(), StepError> {
        debug!(log, "rescan step"; "step" => step, "args" => ?args);
        match self.host.run("modprobe", args).await {
            Ok(0) => Ok(()),
            Ok(status) => Err(StepError::RescanFailed {
                step,
                detail: format!("modprobe exited with status {status}"),
            }),
            Err(err) => Err(StepError::RescanFailed {
                step,
                detail: format!("failed to run modprobe: {err}"),
            }),
        }
    }

    async fn rescan_write(
        &self,
        log: &Logger,
        step: &'static str,
        path: &Utf8Path,
        value: &str,
    ) -> Result<(), StepError> {
        debug!(log, "rescan step"; "step" => step, "path" => %path);
        self.host.write_attr(path, value).await.map_err(|err| {
            StepError::RescanFailed {
                step,
                detail: format!("failed to write {value:?} to {path}: {err}"),
            }
        })
    }
}
