// Local Runner
// Invokes the container engine as an external process and streams its
// output through the prefixed log multiplexer

use crate::definition::Step;
use crate::logger::PrefixedWriter;
use crate::runner::{Runner, RunnerError, RunnerResult};

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Runner backed by a `docker`-compatible executable on `$PATH`.
pub struct LocalRunner {
    engine: PathBuf,
    project: String,
}

impl LocalRunner {
    /// Probe for a container engine and bind it to a project name.
    ///
    /// With `force_wharfer` only `wharfer` is considered; otherwise
    /// `docker` wins over `wharfer` when both resolve.
    pub fn new(project: &str, force_wharfer: bool) -> RunnerResult<Self> {
        let engine = resolve_engine(force_wharfer)?;
        tracing::debug!(engine = %engine.display(), "container engine selected");
        Ok(Self {
            engine,
            project: project.to_string(),
        })
    }

    pub fn engine(&self) -> &Path {
        &self.engine
    }

    /// Stream a container's logs to the step's log targets. Not part of
    /// the scheduler's capability seam.
    pub async fn container_logs(&self, step: &Step, follow: bool) -> RunnerResult<i32> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("-f".to_string());
        }
        args.push(step.container_name(&self.project));
        self.run_streamed(&args, step).await
    }

    fn display_command(&self, args: &[String]) -> String {
        let engine = self
            .engine
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.engine.display().to_string());
        format!("{} {}", engine, args.join(" "))
    }

    /// Spawn the engine and tee stdout/stderr line-by-line through the
    /// step's prefixed writers. Returns the process exit code.
    async fn run_streamed(&self, args: &[String], step: &Step) -> RunnerResult<i32> {
        let command_line = self.display_command(args);
        tracing::debug!(command = %command_line, "running engine command");

        let mut command = Command::new(&self.engine);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let prefix = step.prefix();
        let stdout_writer = PrefixedWriter::new(prefix.clone(), step.meta.stdout.open()?);
        let stderr_writer = PrefixedWriter::new(prefix, step.meta.stderr.open()?);

        let stdout_task = tokio::spawn(stream_lines(stdout, stdout_writer));
        let stderr_task = tokio::spawn(stream_lines(stderr, stderr_writer));

        let status = child.wait().await?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        Ok(status.code().unwrap_or(-1))
    }

    /// Run the engine to completion and capture its output instead of
    /// streaming it.
    async fn run_captured(&self, args: &[&str]) -> RunnerResult<(bool, String, String)> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let command_line = self.display_command(&args);
        let output = Command::new(&self.engine)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: command_line,
                source,
            })?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn run_args(&self, step: &Step, network: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            step.container_name(&self.project),
            "--network".to_string(),
            network.to_string(),
        ];
        if step.detach {
            args.push("-d".to_string());
        }
        for port in &step.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for volume in &step.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for entry in step.environment.iter() {
            args.push("-e".to_string());
            args.push(entry.clone());
        }

        // The engine's --entrypoint takes a single binary; trailing
        // entrypoint elements become leading command arguments.
        let mut command: Vec<String> = Vec::new();
        if let Some((binary, rest)) = step.entrypoint.split_first() {
            args.push("--entrypoint".to_string());
            args.push(binary.clone());
            command.extend(rest.iter().cloned());
        }
        command.extend(step.command.iter().cloned());

        args.push(step.image.clone());
        args.extend(command);
        args
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn build_image(&self, step: &Step, force_pull: bool) -> RunnerResult<()> {
        let info = step.build_info.clone().unwrap_or_default();
        let mut args = vec!["build".to_string(), "-t".to_string(), step.image.clone()];
        if force_pull {
            args.push("--pull".to_string());
        }
        if let Some(dockerfile) = &info.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.clone());
        }
        for (key, value) in info.args.iter() {
            args.push("--build-arg".to_string());
            match value {
                Some(value) => args.push(format!("{}={}", key, value)),
                None => args.push(key.clone()),
            }
        }
        args.push(info.context.clone().unwrap_or_else(|| ".".to_string()));

        let code = self.run_streamed(&args, step).await?;
        if code != 0 {
            return Err(RunnerError::CommandFailed {
                command: self.display_command(&args),
                code,
            });
        }
        Ok(())
    }

    async fn pull_image(&self, step: &Step) -> RunnerResult<()> {
        let args = vec!["pull".to_string(), step.image.clone()];
        let code = self.run_streamed(&args, step).await?;
        if code != 0 {
            return Err(RunnerError::CommandFailed {
                command: self.display_command(&args),
                code,
            });
        }
        Ok(())
    }

    async fn image_exists(&self, step: &Step) -> RunnerResult<bool> {
        let (success, stdout, _) = self.run_captured(&["images", "-q", &step.image]).await?;
        Ok(success && !stdout.trim().is_empty())
    }

    async fn kill_container(&self, step: &Step) -> RunnerResult<usize> {
        let name = step.container_name(&self.project);
        let (success, _, stderr) = self.run_captured(&["kill", &name]).await?;
        if success {
            Ok(1)
        } else {
            // nothing running under that name
            tracing::debug!(container = %name, stderr = %stderr.trim(), "kill skipped");
            Ok(0)
        }
    }

    async fn remove_container(&self, step: &Step) -> RunnerResult<()> {
        let name = step.container_name(&self.project);
        let (success, _, stderr) = self.run_captured(&["rm", &name]).await?;
        if !success {
            tracing::debug!(container = %name, stderr = %stderr.trim(), "rm skipped");
        }
        Ok(())
    }

    async fn run_container(&self, step: &Step, network: &str) -> RunnerResult<i32> {
        let args = self.run_args(step, network);
        if step.detach {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let (success, stdout, stderr) = self.run_captured(&arg_refs).await?;
            if !success {
                let mut writer =
                    PrefixedWriter::new(step.prefix(), step.meta.stderr.open()?);
                let _ = writer.write_all(stderr.as_bytes());
                let _ = writer.flush();
                return Err(RunnerError::CommandFailed {
                    command: self.display_command(&args),
                    code: 1,
                });
            }
            tracing::debug!(step = %step.name, id = %stdout.trim(), "service started");
            return Ok(0);
        }
        self.run_streamed(&args, step).await
    }

    async fn create_network(&self, network: &str) -> RunnerResult<()> {
        let (success, _, stderr) = self
            .run_captured(&["network", "create", network])
            .await?;
        if success || stderr.contains("already exists") {
            return Ok(());
        }
        Err(RunnerError::CommandFailed {
            command: format!("network create {}", network),
            code: 1,
        })
    }

    async fn remove_network(&self, network: &str) -> RunnerResult<()> {
        let (success, _, stderr) = self.run_captured(&["network", "rm", network]).await?;
        if !success {
            tracing::debug!(network = %network, stderr = %stderr.trim(), "network rm skipped");
        }
        Ok(())
    }
}

fn resolve_engine(force_wharfer: bool) -> RunnerResult<PathBuf> {
    if force_wharfer {
        return which::which("wharfer")
            .map_err(|_| RunnerError::EngineNotFound("wharfer not found on PATH".to_string()));
    }
    which::which("docker")
        .or_else(|_| which::which("wharfer"))
        .map_err(|_| {
            RunnerError::EngineNotFound("neither docker nor wharfer found on PATH".to_string())
        })
}

async fn stream_lines<R>(reader: R, mut writer: PrefixedWriter)
where
    R: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if writer.write_line(&line).is_err() {
            break;
        }
    }
    let _ = writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::{StringMapOrStringSlice, StringOrStringSlice};

    fn runner_for_tests() -> LocalRunner {
        LocalRunner {
            engine: PathBuf::from("/usr/bin/docker"),
            project: "test".to_string(),
        }
    }

    #[test]
    fn test_run_args_for_step() {
        let step = Step {
            name: "migrate".to_string(),
            image: "migrator".to_string(),
            ports: vec!["8080:80".to_string()],
            volumes: vec!["./data:/data".to_string()],
            environment: StringMapOrStringSlice(vec!["MODE=fast".to_string()]),
            command: StringOrStringSlice(vec!["--retries".to_string(), "3".to_string()]),
            ..Step::default()
        };

        let args = runner_for_tests().run_args(&step, "test");
        assert_eq!(
            args,
            vec![
                "run",
                "--name",
                "test_migrate",
                "--network",
                "test",
                "-p",
                "8080:80",
                "-v",
                "./data:/data",
                "-e",
                "MODE=fast",
                "migrator",
                "--retries",
                "3",
            ]
        );
    }

    #[test]
    fn test_run_args_detach_and_entrypoint() {
        let step = Step {
            name: "db".to_string(),
            image: "postgres".to_string(),
            detach: true,
            entrypoint: StringOrStringSlice(vec![
                "sh".to_string(),
                "-c".to_string(),
            ]),
            command: StringOrStringSlice(vec!["postgres".to_string()]),
            ..Step::default()
        };

        let args = runner_for_tests().run_args(&step, "test");
        assert_eq!(
            args,
            vec![
                "run",
                "--name",
                "test_db",
                "--network",
                "test",
                "-d",
                "--entrypoint",
                "sh",
                "postgres",
                "-c",
                "postgres",
            ]
        );
    }

    #[test]
    fn test_display_command_uses_engine_basename() {
        let runner = runner_for_tests();
        let display = runner.display_command(&["pull".to_string(), "alpine".to_string()]);
        assert_eq!(display, "docker pull alpine");
    }
}
