// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`ControllerTransport`] over the management controller's REST API, with
//! images staged by `scp`.

use crate::credential::CredentialSource;
use crate::error::TransportError;
use crate::sku::CpldTag;
use crate::transport::ControllerCommand;
use crate::transport::ControllerResponse;
use crate::transport::ControllerTransport;
use crate::transport::InstallTarget;
use crate::transport::StagedImage;
use async_trait::async_trait;
use camino::Utf8Path;
use fwmgr_messages::ComponentKind;
use reqwest::Method;
use serde_json::json;
use serde_json::Value;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_BASE_URI: &str = "http://240.1.1.1:8080/api";
pub const DEFAULT_SCP_TARGET: &str = "root@240.1.1.1:/tmp/";

/// `sshpass` reads the password from `$SSHPASS` with `-e`, keeping it off the
/// command line.
pub const DEFAULT_STAGE_COMMAND: [&str; 7] = [
    "sshpass",
    "-e",
    "scp",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_uri: String,
    /// `scp` destination, `user@host:dir`.
    pub scp_target: String,
    /// Timeout for queries and other short requests.
    pub request_timeout: Duration,
    /// Timeout for install and refresh requests, which block until the
    /// controller has finished writing flash.
    pub install_timeout: Duration,
    /// Timeout for a single staging attempt.
    pub stage_timeout: Duration,
    pub stage_attempts: usize,
    /// Program and leading arguments used to copy an image; the local path
    /// and `scp_target` are appended. The password is passed in `$SSHPASS`.
    pub stage_command: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_uri: DEFAULT_BASE_URI.to_string(),
            scp_target: DEFAULT_SCP_TARGET.to_string(),
            request_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(300),
            stage_timeout: Duration::from_secs(120),
            stage_attempts: 3,
            stage_command: DEFAULT_STAGE_COMMAND
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Route {
    method: Method,
    path: &'static str,
    body: Option<Value>,
    timeout: Duration,
    /// False for requests (reboot) after which the controller may drop the
    /// connection without answering.
    response_required: bool,
}

pub struct RestTransport {
    config: TransportConfig,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    log: Logger,
}

impl RestTransport {
    pub fn new(
        config: TransportConfig,
        credentials: Arc<dyn CredentialSource>,
        log: &Logger,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build().map_err(|err| {
            TransportError::Http { uri: config.base_uri.clone(), err }
        })?;
        let log = log.new(slog::o!("controller" => config.base_uri.clone()));
        Ok(Self { config, client, credentials, log })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn remote_path(&self, file_name: &str) -> String {
        let dir = self
            .config
            .scp_target
            .rsplit_once(':')
            .map(|(_, dir)| dir)
            .unwrap_or("");
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{dir}/{file_name}")
        }
    }

    fn route(
        &self,
        command: &ControllerCommand,
    ) -> Result<Route, TransportError> {
        let query = |path: &'static str| Route {
            method: Method::GET,
            path,
            body: None,
            timeout: self.config.request_timeout,
            response_required: true,
        };
        let post =
            |path: &'static str, body: Value, timeout: Duration| Route {
                method: Method::POST,
                path,
                body: Some(body),
                timeout,
                response_required: true,
            };
        let unsupported =
            || TransportError::Unsupported(format!("{command:?}"));

        let route = match command {
            ControllerCommand::Install { target, image } => {
                let body = match target {
                    InstallTarget::Bmc(slot) => json!({
                        "Name": "bmc",
                        "Path": image.remote_path,
                        "Flash": slot,
                    }),
                    InstallTarget::Bios(slot) => json!({
                        "Name": "bios",
                        "Path": image.remote_path,
                        "Flash": slot,
                    }),
                    InstallTarget::Cpld(CpldTag::Unknown) => {
                        return Err(unsupported())
                    }
                    InstallTarget::Cpld(tag) => json!({
                        "Name": "cpld",
                        "Path": image.remote_path,
                        "Type": tag,
                    }),
                };
                post("firmware/upgrade", body, self.config.install_timeout)
            }
            ControllerCommand::Refresh { names, images, power_cycle } => post(
                "firmware/refresh",
                json!({
                    "Names": names,
                    "Paths": images,
                    "PowerCycle": power_cycle,
                }),
                self.config.install_timeout,
            ),
            ControllerCommand::SetNextBoot { kind, slot } => {
                let path = match kind {
                    ComponentKind::Bmc => "bmc/nextboot",
                    ComponentKind::Bios => "firmware/biosnextboot",
                    _ => return Err(unsupported()),
                };
                post(
                    path,
                    json!({ "Flash": slot }),
                    self.config.request_timeout,
                )
            }
            ControllerCommand::Reboot => Route {
                response_required: false,
                ..post("bmc/reboot", json!({}), self.config.request_timeout)
            },
            ControllerCommand::QueryRunningSlot(kind) => match kind {
                ComponentKind::Bmc => query("bmc/info"),
                ComponentKind::Bios => query("misc/biosbootstatus"),
                _ => return Err(unsupported()),
            },
            ControllerCommand::QueryNextBoot(kind) => match kind {
                ComponentKind::Bmc => query("bmc/nextboot"),
                ComponentKind::Bios => query("firmware/biosnextboot"),
                _ => return Err(unsupported()),
            },
            ControllerCommand::QueryInfo => query("bmc/info"),
            ControllerCommand::QueryVersions => query("misc/cpldversion"),
            ControllerCommand::QueryUpgradeLog => query("firmware/upgrade"),
        };
        Ok(route)
    }

    async fn send(
        &self,
        route: Route,
    ) -> Result<ControllerResponse, TransportError> {
        let uri = format!(
            "{}/{}",
            self.config.base_uri.trim_end_matches('/'),
            route.path
        );
        debug!(
            self.log, "sending controller request";
            "method" => %route.method,
            "uri" => &uri,
        );

        let mut request =
            self.client.request(route.method, &uri).timeout(route.timeout);
        if let Some(body) = &route.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(TransportError::Timeout {
                    what: uri,
                    after: route.timeout,
                });
            }
            // The controller may drop the connection as it goes down for a
            // reboot; a failure to connect at all means the request was not
            // delivered.
            Err(err) if !route.response_required && !err.is_connect() => {
                debug!(
                    self.log,
                    "connection dropped after fire-and-forget request";
                    "uri" => &uri,
                    "err" => %err,
                );
                return Ok(ControllerResponse::ok(Value::Null));
            }
            Err(err) => return Err(TransportError::Http { uri, err }),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                uri,
                status: status.as_u16(),
            });
        }
        if !route.response_required {
            return Ok(ControllerResponse::ok(Value::Null));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| TransportError::Decode { uri, err })?;
        Ok(interpret(body))
    }
}

/// Unwrap the controller's response envelope.
///
/// Current firmware answers `{"status": "OK", "data": ...}`; older firmware
/// answers `{"result": "success ..."}` with any data alongside.
pub(crate) fn interpret(body: Value) -> ControllerResponse {
    if let Some(status) = body.get("status").and_then(Value::as_str) {
        if status.eq_ignore_ascii_case("OK") {
            let data = body.get("data").cloned().unwrap_or(Value::Null);
            return ControllerResponse::ok(data);
        }
        return ControllerResponse::rejected(body);
    }

    let legacy_ok = body
        .get("result")
        .and_then(Value::as_str)
        .map(|result| result.contains("success"))
        .unwrap_or(false);
    if legacy_ok {
        ControllerResponse::ok(body)
    } else {
        ControllerResponse::rejected(body)
    }
}

#[async_trait]
impl ControllerTransport for RestTransport {
    async fn stage(
        &self,
        local: &Utf8Path,
    ) -> Result<StagedImage, TransportError> {
        let file_name = local
            .file_name()
            .ok_or_else(|| TransportError::InvalidImagePath(local.to_owned()))?;
        let password = self
            .credentials
            .password()
            .ok_or(TransportError::CredentialMissing)?;
        let Some((program, args)) = self.config.stage_command.split_first()
        else {
            return Err(TransportError::Unsupported(
                "empty staging command".to_string(),
            ));
        };
        let staged = StagedImage { remote_path: self.remote_path(file_name) };

        for attempt in 1..=self.config.stage_attempts {
            debug!(
                self.log, "staging image";
                "path" => %local,
                "attempt" => attempt,
            );

            let mut cmd = Command::new(program);
            cmd.args(args)
                .arg(local.as_str())
                .arg(&self.config.scp_target)
                .env("SSHPASS", &password)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            match tokio::time::timeout(self.config.stage_timeout, cmd.status())
                .await
            {
                Ok(Ok(status)) if status.success() => return Ok(staged),
                Ok(Ok(status)) => {
                    warn!(
                        self.log, "image staging failed";
                        "path" => %local,
                        "attempt" => attempt,
                        "status" => ?status.code(),
                    );
                }
                Ok(Err(err)) => {
                    return Err(TransportError::Spawn {
                        program: program.clone(),
                        err,
                    });
                }
                Err(_) => {
                    warn!(
                        self.log, "image staging timed out";
                        "path" => %local,
                        "attempt" => attempt,
                        "timeout" => ?self.config.stage_timeout,
                    );
                }
            }
        }

        Err(TransportError::StageExhausted {
            path: local.to_owned(),
            attempts: self.config.stage_attempts,
        })
    }

    async fn invoke(
        &self,
        command: &ControllerCommand,
    ) -> Result<ControllerResponse, TransportError> {
        let route = self.route(command)?;
        self.send(route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;
    use fwmgr_messages::FlashSlot;
    use slog::o;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;

    fn transport(credential: Option<String>) -> RestTransport {
        transport_with(TransportConfig::default(), credential)
    }

    fn transport_with(
        config: TransportConfig,
        credential: Option<String>,
    ) -> RestTransport {
        let log = Logger::root(slog::Discard, o!());
        RestTransport::new(config, Arc::new(credential), &log).unwrap()
    }

    /// A transport whose `scp` is replaced by `sh -c script`; every run
    /// appends a line to `runs`.
    fn staging_transport(
        dir: &Utf8TempDir,
        script: &str,
        stage_timeout: Duration,
    ) -> (RestTransport, Utf8PathBuf) {
        let runs = dir.path().join("runs");
        let script = format!("echo run >> '{runs}'; {script}");
        let config = TransportConfig {
            stage_timeout,
            stage_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script,
                "stage".to_string(),
            ],
            ..TransportConfig::default()
        };
        (transport_with(config, Some("0penBmc".to_string())), runs)
    }

    fn run_count(runs: &Utf8Path) -> usize {
        std::fs::read_to_string(runs).map(|s| s.lines().count()).unwrap_or(0)
    }

    /// Serve `accept` on a local port, returning the base URI to reach it.
    async fn serve<F, Fut>(accept: F) -> String
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(accept(stream));
            }
        });
        format!("http://{addr}/api")
    }

    fn quick(base_uri: String) -> RestTransport {
        transport_with(
            TransportConfig {
                base_uri,
                request_timeout: Duration::from_millis(200),
                ..TransportConfig::default()
            },
            None,
        )
    }

    #[test]
    fn envelope_interpretation() {
        let ok = interpret(json!({"status": "OK", "data": {"Flash": "slave"}}));
        assert!(ok.success);
        assert_eq!(ok.payload, json!({"Flash": "slave"}));

        let rejected = interpret(json!({"status": "FAILED", "data": {}}));
        assert!(!rejected.success);

        let legacy = interpret(json!({"result": "success: flashed"}));
        assert!(legacy.success);

        assert!(!interpret(json!({"result": "failed"})).success);
        assert!(!interpret(json!("garbage")).success);
    }

    #[test]
    fn staged_path_lands_in_scp_directory() {
        let t = transport(None);
        assert_eq!(t.remote_path("bmc.ima"), "/tmp/bmc.ima");
    }

    #[test]
    fn routes_follow_component_kind() {
        let t = transport(None);
        let image = StagedImage { remote_path: "/tmp/fw.bin".to_string() };

        let route = t
            .route(&ControllerCommand::Install {
                target: InstallTarget::Bmc(FlashSlot::Slave),
                image: image.clone(),
            })
            .unwrap();
        assert_eq!(route.path, "firmware/upgrade");
        assert_eq!(
            route.body,
            Some(json!({
                "Name": "bmc",
                "Path": "/tmp/fw.bin",
                "Flash": "slave",
            }))
        );
        assert_eq!(route.timeout, Duration::from_secs(300));

        let route = t
            .route(&ControllerCommand::Install {
                target: InstallTarget::Cpld(CpldTag::TopLc),
                image: image.clone(),
            })
            .unwrap();
        assert_eq!(route.body.unwrap()["Type"], "top_lc");

        assert!(t
            .route(&ControllerCommand::Install {
                target: InstallTarget::Cpld(CpldTag::Unknown),
                image,
            })
            .is_err());

        let route = t
            .route(&ControllerCommand::SetNextBoot {
                kind: ComponentKind::Bios,
                slot: FlashSlot::Master,
            })
            .unwrap();
        assert_eq!(route.path, "firmware/biosnextboot");

        assert!(
            !t.route(&ControllerCommand::Reboot).unwrap().response_required
        );
        assert!(t
            .route(&ControllerCommand::QueryRunningSlot(ComponentKind::Cpld))
            .is_err());
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        // Accept the connection but never answer.
        let uri = serve(|stream| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        })
        .await;
        let t = quick(uri);

        let err = t.invoke(&ControllerCommand::QueryInfo).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err:?}");

        // A reboot that is never acknowledged is not a successful reboot.
        let err = t.invoke(&ControllerCommand::Reboot).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn reboot_survives_dropped_connection() {
        // Read the request, then hang up without answering, as a controller
        // going down for reboot does.
        let uri = serve(|mut stream| async move {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            drop(stream);
        })
        .await;
        let t = quick(uri);

        let response = t.invoke(&ControllerCommand::Reboot).await.unwrap();
        assert!(response.success);
        assert!(t.invoke(&ControllerCommand::QueryInfo).await.is_err());
    }

    #[tokio::test]
    async fn reboot_to_unreachable_controller_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let t = quick(format!("http://{addr}/api"));

        let err = t.invoke(&ControllerCommand::Reboot).await.unwrap_err();
        assert!(matches!(err, TransportError::Http { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn answered_query_is_interpreted() {
        let uri = serve(|mut stream| async move {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let body = r#"{"status":"OK","data":{"Flash":"slave"}}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        })
        .await;
        let t = quick(uri);

        let response = t
            .invoke(&ControllerCommand::QueryRunningSlot(ComponentKind::Bmc))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.payload, json!({"Flash": "slave"}));
    }

    #[tokio::test]
    async fn staging_retries_until_success() {
        let dir = Utf8TempDir::new().unwrap();
        let (t, runs) = staging_transport(
            &dir,
            &format!("[ $(wc -l < '{}') -ge 3 ]", dir.path().join("runs")),
            Duration::from_secs(10),
        );

        let staged = t.stage(Utf8Path::new("/fw/bmc.ima")).await.unwrap();
        assert_eq!(staged.remote_path, "/tmp/bmc.ima");
        assert_eq!(run_count(&runs), 3);
    }

    #[tokio::test]
    async fn staging_gives_up_after_configured_attempts() {
        let dir = Utf8TempDir::new().unwrap();
        let (t, runs) =
            staging_transport(&dir, "exit 1", Duration::from_secs(10));

        let err = t.stage(Utf8Path::new("/fw/bmc.ima")).await.unwrap_err();
        assert!(
            matches!(err, TransportError::StageExhausted { attempts: 3, .. }),
            "{err:?}"
        );
        assert_eq!(run_count(&runs), 3);
    }

    #[tokio::test]
    async fn staging_attempts_are_bounded_by_timeout() {
        let dir = Utf8TempDir::new().unwrap();
        let (t, runs) =
            staging_transport(&dir, "sleep 30", Duration::from_millis(200));

        let start = std::time::Instant::now();
        let err = t.stage(Utf8Path::new("/fw/bmc.ima")).await.unwrap_err();
        assert!(matches!(err, TransportError::StageExhausted { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(run_count(&runs), 3);
    }

    #[tokio::test]
    async fn staging_passes_password_in_environment() {
        let dir = Utf8TempDir::new().unwrap();
        let seen = dir.path().join("seen");
        let (t, _) = staging_transport(
            &dir,
            &format!("echo \"$SSHPASS $1 $2\" > '{seen}'"),
            Duration::from_secs(10),
        );

        t.stage(Utf8Path::new("/fw/bios.bin")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&seen).unwrap(),
            format!("0penBmc /fw/bios.bin {DEFAULT_SCP_TARGET}\n")
        );
    }

    #[tokio::test]
    async fn staging_requires_credential() {
        let t = transport(None);
        let err = t.stage(Utf8Path::new("/tmp/fw.bin")).await.unwrap_err();
        assert!(matches!(err, TransportError::CredentialMissing));
    }
}
