//! `ServiceControlPlane` implemented on the `docker compose` CLI.
//!
//! Every operation is one compose invocation run from the project
//! directory. Standard input, when given, is written concurrently with
//! reading the output so large dumps cannot deadlock on a full pipe.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use deckhand_core::config::ProjectConfig;

use crate::error::{ControlError, ControlResult};
use crate::plane::{ScaleOptions, ServiceControlPlane, ServiceState};

#[derive(Debug, Clone)]
pub struct ComposeControlPlane {
    program: String,
    base_args: Vec<String>,
    project_dir: PathBuf,
}

impl ComposeControlPlane {
    pub fn new(program: &str, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.to_string(),
            base_args: vec!["compose".to_string()],
            project_dir: project_dir.into(),
        }
    }

    pub fn from_config(config: &ProjectConfig) -> Self {
        let mut plane = Self::new(&config.compose_program, config.dir.clone());
        if let Some(file) = &config.compose_file {
            plane.base_args.extend(["-f".to_string(), file.clone()]);
        }
        if let Some(name) = &config.project_name {
            plane.base_args.extend(["-p".to_string(), name.clone()]);
        }
        plane
    }

    fn describe(&self, args: &[String]) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.base_args.iter().cloned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    async fn run(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> ControlResult<Vec<u8>> {
        let command = self.describe(&args);
        debug!(%command, "running compose");

        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(&args)
            .current_dir(&self.project_dir)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ControlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let writer = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (writer, stdin) {
                pipe.write_all(&input).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|source| ControlError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ControlError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // A successful command that closed stdin early did not need the rest.
        if let Err(e) = fed {
            debug!(error = %e, %command, "stdin closed early");
        }
        Ok(output.stdout)
    }
}

fn owned(services: &[String]) -> impl Iterator<Item = String> + '_ {
    services.iter().cloned()
}

impl ServiceControlPlane for ComposeControlPlane {
    async fn start(&self, services: &[String]) -> ControlResult<()> {
        let mut args = vec!["up".to_string(), "-d".to_string()];
        args.extend(owned(services));
        self.run(args, None).await.map(drop)
    }

    async fn stop(&self, services: &[String]) -> ControlResult<()> {
        let mut args = vec!["stop".to_string()];
        args.extend(owned(services));
        self.run(args, None).await.map(drop)
    }

    async fn scale(&self, service: &str, replicas: u32, options: ScaleOptions) -> ControlResult<()> {
        let mut args = vec!["up".to_string(), "-d".to_string()];
        if options.no_deps {
            args.push("--no-deps".to_string());
        }
        args.push(if options.recreate_existing {
            "--force-recreate".to_string()
        } else {
            "--no-recreate".to_string()
        });
        args.push("--scale".to_string());
        args.push(format!("{service}={replicas}"));
        args.push(service.to_string());
        self.run(args, None).await.map(drop)
    }

    async fn exec(
        &self,
        service: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> ControlResult<Vec<u8>> {
        let mut args = vec!["exec".to_string(), "-T".to_string(), service.to_string()];
        args.extend(owned(command));
        self.run(args, stdin).await
    }

    async fn status(&self) -> ControlResult<Vec<ServiceState>> {
        let args = ["ps", "--all", "--format", "json"].map(String::from).to_vec();
        let out = self.run(args, None).await?;
        parse_ps_output(&String::from_utf8_lossy(&out))
    }

    async fn build(&self, services: &[String]) -> ControlResult<()> {
        let mut args = vec!["build".to_string()];
        args.extend(owned(services));
        self.run(args, None).await.map(drop)
    }
}

/// One container line of `compose ps --format json`.
#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
}

/// Aggregate `compose ps` output into per-service state.
///
/// Older compose releases print one JSON array, newer ones one object per
/// line; both are accepted.
pub fn parse_ps_output(text: &str) -> ControlResult<Vec<ServiceState>> {
    let trimmed = text.trim();
    let entries: Vec<PsEntry> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| ControlError::Status(e.to_string()))?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| ControlError::Status(e.to_string())))
            .collect::<ControlResult<_>>()?
    };

    let mut services: BTreeMap<String, ServiceState> = BTreeMap::new();
    for entry in entries {
        let state = services
            .entry(entry.service.clone())
            .or_insert_with(|| ServiceState {
                name: entry.service.clone(),
                running_replicas: 0,
                total_replicas: 0,
                healthy: None,
            });
        state.total_replicas += 1;
        if entry.state == "running" {
            state.running_replicas += 1;
            if !entry.health.is_empty() {
                let ok = entry.health == "healthy";
                state.healthy = Some(state.healthy.unwrap_or(true) && ok);
            }
        }
    }
    Ok(services.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ndjson_output() {
        let out = r#"{"Name":"app-web-1","Service":"web","State":"running","Health":"healthy"}
{"Name":"app-web-2","Service":"web","State":"running","Health":"starting"}
{"Name":"app-db-1","Service":"db","State":"running","Health":""}
{"Name":"app-flower-1","Service":"flower","State":"exited","Health":""}
"#;
        let states = parse_ps_output(out).unwrap();
        assert_eq!(states.len(), 3);

        let web = states.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.running_replicas, 2);
        assert_eq!(web.healthy, Some(false));

        let db = states.iter().find(|s| s.name == "db").unwrap();
        assert_eq!(db.healthy, None);

        let flower = states.iter().find(|s| s.name == "flower").unwrap();
        assert!(!flower.is_running());
        assert_eq!(flower.total_replicas, 1);
    }

    #[test]
    fn parses_array_output() {
        let out = r#"[{"Service":"web","State":"running","Health":"healthy"},{"Service":"redis","State":"running"}]"#;
        let states = parse_ps_output(out).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].name, "web");
        assert_eq!(states[1].healthy, Some(true));
    }

    #[test]
    fn empty_output_means_no_services() {
        assert!(parse_ps_output("  \n").unwrap().is_empty());
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(matches!(parse_ps_output("not json"), Err(ControlError::Status(_))));
    }

    #[test]
    fn from_config_adds_file_and_project() {
        let config = ProjectConfig {
            dir: PathBuf::from("/srv/app"),
            compose_program: "docker".to_string(),
            compose_file: Some("compose.prod.yml".to_string()),
            project_name: Some("shop".to_string()),
        };
        let plane = ComposeControlPlane::from_config(&config);
        assert_eq!(
            plane.describe(&["ps".to_string()]),
            "docker compose -f compose.prod.yml -p shop ps"
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let plane = ComposeControlPlane::new("deckhand-no-such-program", ".");
        let err = plane.status().await.unwrap_err();
        assert!(matches!(err, ControlError::Spawn { .. }));
    }
}
