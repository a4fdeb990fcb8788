// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for the controller to come back after a reboot.
//!
//! An upgrade is complete once the reboot command is accepted; callers
//! decide whether to wait.

use crate::transport::ControllerCommand;
use crate::transport::ControllerTransport;
use slog::debug;
use slog::info;
use slog::Logger;
use slog_error_chain::SlogInlineError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Delay before the first poll, giving the controller time to actually
    /// go down.
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, SlogInlineError)]
pub enum ReadinessError {
    #[error("controller not ready after {waited:?}")]
    TimedOut { waited: Duration },
}

/// Poll the controller until one info query succeeds, returning how long
/// that took.
pub async fn wait_until_ready<T: ControllerTransport + ?Sized>(
    transport: &T,
    config: &ReadinessConfig,
    log: &Logger,
) -> Result<Duration, ReadinessError> {
    let start = Instant::now();
    let deadline = start + config.max_wait;

    tokio::time::sleep(config.initial_delay.min(config.max_wait)).await;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match transport.invoke(&ControllerCommand::QueryInfo).await {
            Ok(response) if response.success => {
                let elapsed = start.elapsed();
                info!(
                    log, "controller ready";
                    "attempts" => attempt,
                    "elapsed" => ?elapsed,
                );
                return Ok(elapsed);
            }
            Ok(_) => {
                debug!(log, "controller not ready"; "attempt" => attempt);
            }
            Err(err) => {
                debug!(
                    log, "controller not ready";
                    "attempt" => attempt,
                    &err,
                );
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessError::TimedOut { waited: start.elapsed() });
        }
        tokio::time::sleep(config.poll_interval.min(deadline - now)).await;
    }
}
