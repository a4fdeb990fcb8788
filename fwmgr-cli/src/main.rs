// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;
use fwmgr_messages::ComponentKind;
use fwmgr_messages::FlashSlot;
use fwmgr_messages::UpgradeOutcome;
use fwmgr_orchestrator::credential;
use fwmgr_orchestrator::rest;
use fwmgr_orchestrator::wait_until_ready;
use fwmgr_orchestrator::ObfuscatedPasswordFile;
use fwmgr_orchestrator::Orchestrator;
use fwmgr_orchestrator::ReadinessConfig;
use fwmgr_orchestrator::RestTransport;
use fwmgr_orchestrator::ResultLog;
use fwmgr_orchestrator::SkuConfig;
use fwmgr_orchestrator::SystemHost;
use fwmgr_orchestrator::TransportConfig;
use fwmgr_orchestrator::UpgradeReport;
use fwmgr_orchestrator::UpgradeRequest;
use serde_json::json;
use slog::error;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

mod lock;

use lock::OperationLock;

/// Command line program that upgrades the BMC, BIOS, CPLD and FPGA firmware
/// of a switch through its management controller.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<Utf8PathBuf>,

    /// Emit parseable JSON on stdout instead of human-readable lines.
    #[clap(
        long,
        value_names = ["pretty"],
        value_parser = json_pretty_from_str,
    )]
    json: Option<Option<JsonPretty>>,

    /// Built-in SKU table to use.
    #[clap(long, env = "FWMGR_SKU", default_value = "as23-128h")]
    sku: String,

    /// Load the SKU table from a TOML file instead of using a built-in one.
    #[clap(long)]
    sku_config: Option<Utf8PathBuf>,

    /// Base URI of the management controller's REST API.
    #[clap(long, default_value = rest::DEFAULT_BASE_URI)]
    controller_uri: String,

    /// `scp` destination (`user@host:dir`) images are staged to.
    #[clap(long, default_value = rest::DEFAULT_SCP_TARGET)]
    scp_target: String,

    /// Obfuscated controller password file.
    #[clap(long, default_value = fwmgr_orchestrator::DEFAULT_PASSWORD_FILE)]
    password_file: Utf8PathBuf,

    /// Local upgrade result log.
    #[clap(long, default_value = fwmgr_orchestrator::DEFAULT_RESULT_LOG)]
    result_log: Utf8PathBuf,

    /// Lock file serializing mutating operations.
    #[clap(long, default_value = "/var/run/fwmgr.lock")]
    lock_file: Utf8PathBuf,

    /// Timeout for controller queries.
    #[clap(
        long,
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    request_timeout: Duration,

    /// Timeout for controller install and refresh requests.
    #[clap(
        long,
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    install_timeout: Duration,

    /// Timeout for each attempt to stage an image.
    #[clap(
        long,
        default_value = "2m",
        value_parser = humantime::parse_duration,
    )]
    stage_timeout: Duration,

    /// Maximum number of attempts to stage an image.
    #[clap(long, default_value = "3")]
    stage_attempts: usize,

    #[clap(subcommand)]
    command: Command,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonPretty;

fn json_pretty_from_str(s: &str) -> Result<JsonPretty> {
    if s == "pretty" {
        Ok(JsonPretty)
    } else {
        bail!("expected \"pretty\"")
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Install and activate firmware.
    Upgrade {
        /// One of bmc, bios, cpld, fpga.
        kind: ComponentKind,
        /// Image path, or `:`-separated image paths for CPLD.
        paths: String,
        /// Flash mode (master, slave, both, pingpong) for BMC and BIOS, or
        /// the `:`-separated subtype list for CPLD.
        extra: Option<String>,
        /// CPLD refresh image, if not given as a REFRESH_CPLD item.
        #[clap(long)]
        refresh_image: Option<Utf8PathBuf>,
        /// After a successful BMC upgrade, wait for the controller to come
        /// back.
        #[clap(long)]
        wait_ready: bool,
        /// Longest to wait with `--wait-ready`.
        #[clap(
            long,
            default_value = "5m",
            value_parser = humantime::parse_duration,
        )]
        max_wait: Duration,
    },

    /// Install CPLD or FPGA firmware without activating it.
    Program {
        kind: ComponentKind,
        paths: String,
        extra: Option<String>,
    },

    /// Activate previously programmed firmware, power cycling if needed.
    Refresh {
        /// FPGA (or BIOS) names to refresh.
        #[clap(long, value_delimiter = ',')]
        fpga: Vec<String>,
        /// CPLD subtypes to refresh.
        #[clap(long, value_delimiter = ',')]
        cpld: Vec<String>,
        /// `:`-separated refresh images paired with `--cpld`; `none` for no
        /// image.
        #[clap(long)]
        images: Option<String>,
    },

    /// Show which flash slot the BMC or BIOS is running from.
    RunningSlot { kind: ComponentKind },

    /// Show, or with `--set` change, the BMC or BIOS next boot slot.
    NextBoot {
        kind: ComponentKind,
        #[clap(long)]
        set: Option<FlashSlot>,
    },

    /// Show the result of the most recent upgrade.
    LastResult,

    /// Show firmware versions reported by the controller.
    Versions,

    /// Wait for the controller to answer.
    WaitReady {
        #[clap(
            long,
            default_value = "5m",
            value_parser = humantime::parse_duration,
        )]
        max_wait: Duration,
        #[clap(
            long,
            default_value = "5s",
            value_parser = humantime::parse_duration,
        )]
        poll_interval: Duration,
    },

    /// Print the obfuscated form of a password, for provisioning the
    /// password file. Reads the password from stdin if not given.
    EncodePassword { password: Option<String> },
}

impl Command {
    fn is_mutating(&self) -> bool {
        match self {
            Command::Upgrade { .. }
            | Command::Program { .. }
            | Command::Refresh { .. } => true,
            Command::NextBoot { set, .. } => set.is_some(),
            Command::RunningSlot { .. }
            | Command::LastResult
            | Command::Versions
            | Command::WaitReady { .. }
            | Command::EncodePassword { .. } => false,
        }
    }
}

fn build_logger(
    level: Level,
    path: Option<&Utf8Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path)
            .with_context(|| format!("failed to create logfile {path}"))?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "fwmgr")), guard))
}

type FwOrchestrator = Orchestrator<RestTransport, SystemHost>;

fn build_orchestrator(args: &Args, log: &Logger) -> Result<FwOrchestrator> {
    let sku = match &args.sku_config {
        Some(path) => SkuConfig::from_file(path)?,
        None => SkuConfig::builtin(&args.sku)?,
    };
    let credentials =
        Arc::new(ObfuscatedPasswordFile::new(args.password_file.clone()));
    let transport = RestTransport::new(
        TransportConfig {
            base_uri: args.controller_uri.clone(),
            scp_target: args.scp_target.clone(),
            request_timeout: args.request_timeout,
            install_timeout: args.install_timeout,
            stage_timeout: args.stage_timeout,
            stage_attempts: args.stage_attempts,
            ..TransportConfig::default()
        },
        credentials.clone(),
        log,
    )
    .context("failed to set up controller transport")?;

    Ok(Orchestrator::new(
        transport,
        SystemHost,
        credentials,
        sku,
        ResultLog::new(args.result_log.clone(), log),
        log,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    let result = async {
        let _lock = if args.command.is_mutating() {
            Some(OperationLock::acquire(&args.lock_file)?)
        } else {
            None
        };
        let orchestrator = build_orchestrator(&args, &log)?;
        let json = args.json.is_some();
        run_command(&orchestrator, args.command.clone(), json, &log).await
    }
    .await;

    let did_fail = match result {
        Ok((output, ok)) => {
            match output {
                Output::Json(value) => write_json(args.json, &value)?,
                Output::Lines(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                }
            }
            !ok
        }
        Err(err) => {
            if args.json.is_some() {
                let value = json!({ "error": format!("{err:#}") });
                write_json(args.json, &value)?;
            } else {
                println!("Error: {err:#}");
            }
            true
        }
    };

    // Flush any buffered log messages before exiting.
    drop(log_guard);
    if did_fail {
        std::process::exit(1);
    }

    Ok(())
}

fn write_json(
    json: Option<Option<JsonPretty>>,
    value: &serde_json::Value,
) -> Result<()> {
    match json {
        Some(Some(JsonPretty)) => {
            serde_json::to_writer_pretty(io::stdout().lock(), value)
                .context("failed to write to stdout")?;
        }
        _ => {
            serde_json::to_writer(io::stdout().lock(), value)
                .context("failed to write to stdout")?;
        }
    }
    println!();
    Ok(())
}

enum Output {
    Json(serde_json::Value),
    Lines(Vec<String>),
}

/// Run one command, returning its output and whether the operation itself
/// succeeded.
async fn run_command(
    orchestrator: &FwOrchestrator,
    command: Command,
    json: bool,
    log: &Logger,
) -> Result<(Output, bool)> {
    match command {
        Command::Upgrade {
            kind,
            paths,
            extra,
            refresh_image,
            wait_ready,
            max_wait,
        } => {
            let mut request =
                UpgradeRequest::parse(kind, &paths, extra.as_deref())?;
            if let Some(image) = refresh_image {
                request = request.with_refresh_image(image);
            }
            let report = orchestrator.upgrade(request).await?;
            let ok = report.succeeded();
            let output = report_output(&report, json)?;

            if !(wait_ready && kind == ComponentKind::Bmc && ok) {
                return Ok((output, ok));
            }

            // The upgrade itself is done; a controller that does not come
            // back is reported alongside it.
            let config =
                ReadinessConfig { max_wait, ..ReadinessConfig::default() };
            let readiness =
                match wait_until_ready(orchestrator.transport(), &config, log)
                    .await
                {
                    Ok(elapsed) => {
                        info!(
                            log, "BMC back after upgrade";
                            "elapsed" => ?elapsed,
                        );
                        Ok(elapsed)
                    }
                    Err(err) => {
                        error!(
                            log, "BMC did not come back after upgrade";
                            &err,
                        );
                        Err(err.to_string())
                    }
                };
            let ready = readiness.is_ok();
            Ok((with_readiness(output, &readiness), ready))
        }
        Command::Program { kind, paths, extra } => {
            let request =
                UpgradeRequest::parse(kind, &paths, extra.as_deref())?;
            let report = orchestrator.program(request).await?;
            let ok = report.succeeded();
            Ok((report_output(&report, json)?, ok))
        }
        Command::Refresh { fpga, cpld, images } => {
            let outcome =
                orchestrator.refresh(&fpga, &cpld, images.as_deref()).await?;
            let output = if json {
                Output::Json(json!({ "outcome": outcome }))
            } else {
                Output::Lines(vec![format!("refresh: {outcome}")])
            };
            Ok((output, outcome == UpgradeOutcome::Done))
        }
        Command::RunningSlot { kind } => {
            let slot = orchestrator.running_slot(kind).await?;
            let output = if json {
                Output::Json(json!({ "kind": kind, "slot": slot }))
            } else {
                Output::Lines(vec![format!("{kind} running from {slot}")])
            };
            Ok((output, true))
        }
        Command::NextBoot { kind, set: Some(slot) } => {
            orchestrator.set_next_boot_slot(kind, slot).await?;
            let output = if json {
                Output::Json(json!({ "kind": kind, "next_boot": slot }))
            } else {
                Output::Lines(vec![format!("{kind} will boot from {slot}")])
            };
            Ok((output, true))
        }
        Command::NextBoot { kind, set: None } => {
            let slot = orchestrator.next_boot_slot(kind).await?;
            let output = if json {
                Output::Json(json!({ "kind": kind, "next_boot": slot }))
            } else {
                Output::Lines(vec![format!("{kind} will boot from {slot}")])
            };
            Ok((output, true))
        }
        Command::LastResult => {
            let last = orchestrator.last_upgrade_result().await?;
            let output = if json {
                Output::Json(serde_json::to_value(&last)?)
            } else if last.records.is_empty() {
                Output::Lines(vec!["no upgrade recorded".to_string()])
            } else {
                let mut lines: Vec<String> = last
                    .records
                    .records()
                    .iter()
                    .map(|r| {
                        format!(
                            "{} {} {} {}",
                            r.kind,
                            r.image_path,
                            r.extra.as_deref().unwrap_or("-"),
                            r.outcome,
                        )
                    })
                    .collect();
                lines.push(format!("batch {}", last.outcome));
                Output::Lines(lines)
            };
            Ok((output, true))
        }
        Command::Versions => {
            let versions = orchestrator.firmware_versions().await?;
            let output = if json {
                Output::Json(serde_json::to_value(&versions)?)
            } else {
                Output::Lines(
                    versions
                        .iter()
                        .map(|(name, version)| format!("{name}: {version}"))
                        .collect(),
                )
            };
            Ok((output, true))
        }
        Command::WaitReady { max_wait, poll_interval } => {
            let config = ReadinessConfig {
                initial_delay: Duration::ZERO,
                poll_interval,
                max_wait,
            };
            let elapsed =
                wait_until_ready(orchestrator.transport(), &config, log)
                    .await?;
            let output = if json {
                let elapsed_ms = elapsed.as_millis() as u64;
                Output::Json(json!({ "elapsed_ms": elapsed_ms }))
            } else {
                Output::Lines(vec![format!(
                    "controller ready after {}",
                    humantime::format_duration(elapsed)
                )])
            };
            Ok((output, true))
        }
        Command::EncodePassword { password } => {
            let password = match password {
                Some(password) => password,
                None => {
                    let mut line = String::new();
                    io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .context("failed to read password from stdin")?;
                    line.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            let encoded = credential::encode(&password);
            let output = if json {
                Output::Json(json!({ "encoded": encoded }))
            } else {
                Output::Lines(vec![encoded])
            };
            Ok((output, true))
        }
    }
}

fn with_readiness(
    output: Output,
    readiness: &Result<Duration, String>,
) -> Output {
    match output {
        Output::Json(mut value) => {
            let ready = match readiness {
                Ok(elapsed) => {
                    json!({ "elapsed_ms": elapsed.as_millis() as u64 })
                }
                Err(err) => json!({ "error": err }),
            };
            if let Some(report) = value.as_object_mut() {
                report.insert("ready".to_string(), ready);
            }
            Output::Json(value)
        }
        Output::Lines(mut lines) => {
            lines.push(match readiness {
                Ok(elapsed) => format!(
                    "controller ready after {}",
                    humantime::format_duration(*elapsed)
                ),
                Err(err) => format!("controller not ready: {err}"),
            });
            Output::Lines(lines)
        }
    }
}

fn report_output(report: &UpgradeReport, json: bool) -> Result<Output> {
    if json {
        return Ok(Output::Json(serde_json::to_value(report)?));
    }

    let mut lines = report
        .records
        .records()
        .iter()
        .map(|r| {
            format!(
                "{} {}: {}",
                r.extra.as_deref().unwrap_or(r.kind.into()),
                r.image_path,
                r.outcome
            )
        })
        .collect::<Vec<_>>();
    lines.push(format!(
        "{} upgrade {}: {}",
        report.kind, report.batch, report.outcome
    ));
    Ok(Output::Lines(lines))
}
