//! Supervision of the toolkit's web UI server.
//!
//! The server is launched with the harness environment plus any Hugging Face token,
//! its output is forwarded to the log, and the output volume is committed on a fixed
//! interval so jobs started from the UI are persisted. A final commit always runs
//! once the server is gone.

use std::{collections::BTreeMap, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    config::HarnessConfig,
    process::{self, CommandSpec, OutputLine, ProcessError, Stream},
    store::{CommitOutcome, OutputStore, StoreError},
};

/// How often to check whether the server has exited.
const EXIT_POLL: Duration = Duration::from_secs(1);
/// Time the server gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
/// Time allowed for draining output after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables the UI and its training subprocesses read the token from.
const HF_TOKEN_VARS: [&str; 3] = ["HF_TOKEN", "HUGGINGFACE_HUB_TOKEN", "HF_API_TOKEN"];

/// Summary of a web UI session.
#[derive(Debug)]
pub struct WebUiReport {
    /// Exit code of the server, if it exited normally.
    pub exit_code: Option<i32>,
    /// Whether the session ended because of Ctrl-C.
    pub interrupted: bool,
    /// Periodic commits that recorded changes.
    pub commits: usize,
    pub final_commit: CommitOutcome,
}

/// Build the server environment: harness env plus the token under every name.
#[must_use]
pub fn server_env(
    base: &BTreeMap<String, String>,
    hf_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    if let Some(token) = hf_token {
        for var in HF_TOKEN_VARS {
            env.insert(var.to_string(), token.to_string());
        }
    }
    env
}

fn log_line(out: &OutputLine) {
    match out.stream {
        Stream::Stdout => tracing::info!("[WebUI] {}", out.line),
        Stream::Stderr => tracing::warn!("[WebUI ERROR] {}", out.line),
    }
}

fn periodic_commit<S: OutputStore>(store: &S, commits: &mut usize) {
    match store.commit() {
        Ok(CommitOutcome::Committed { .. }) => *commits += 1,
        Ok(CommitOutcome::Unchanged) => {}
        Err(e) => tracing::warn!("Periodic volume commit failed: {}", e),
    }
}

/// Run the web UI server until it exits or Ctrl-C is pressed.
pub async fn serve<S: OutputStore>(
    config: &HarnessConfig,
    store: &S,
) -> Result<WebUiReport, WebUiError> {
    let settings = &config.webui;

    let hf_token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
    if hf_token.is_some() {
        tracing::info!("Hugging Face token found, forwarding to the UI");
    } else {
        tracing::warn!("No HF_TOKEN found");
    }

    store.ensure_mount()?;

    let spec = CommandSpec {
        program: settings.program.clone(),
        args: settings.args.clone(),
        dir: Some(config.webui_dir()),
        env: server_env(&config.env, hf_token.as_deref()),
    };
    let url = format!("http://localhost:{}", settings.port);

    let mut server = process::spawn("webui", &spec, None)?;
    tracing::info!("Starting UI server (PID {}): {}", server.pid(), spec.display());
    tracing::info!("Training outputs will be saved to: {}", store.mount_dir().display());
    tracing::info!("Waiting for server to start...");

    let announce = tokio::time::sleep(Duration::from_secs(settings.startup_wait_secs));
    tokio::pin!(announce);

    let period = Duration::from_secs(settings.commit_interval_secs.max(1));
    let mut commit_tick = tokio::time::interval_at(Instant::now() + period, period);
    commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut exit_poll = tokio::time::interval(EXIT_POLL);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut announced = false;
    let mut output_open = true;
    let mut interrupted = false;
    let mut kill_at: Option<Instant> = None;
    let mut commits = 0;

    loop {
        tokio::select! {
            line = server.next_line(), if output_open => match line {
                Some(line) => log_line(&line),
                None => output_open = false,
            },
            () = &mut announce, if !announced => {
                announced = true;
                tracing::info!("Web UI should now be accessible at: {}", url);
            }
            _ = commit_tick.tick() => periodic_commit(store, &mut commits),
            res = &mut ctrl_c, if !interrupted => {
                if let Err(e) = res {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Shutting down web UI...");
                interrupted = true;
                server.terminate();
                kill_at = Some(Instant::now() + TERMINATE_GRACE);
            }
            _ = exit_poll.tick() => {
                if server.try_wait()?.is_some() {
                    break;
                }
                if kill_at.is_some_and(|t| Instant::now() >= t) {
                    tracing::warn!("Web UI did not exit after SIGTERM, killing");
                    server.kill();
                    kill_at = None;
                }
            }
        }
    }

    let exit_code = match tokio::time::timeout(DRAIN_TIMEOUT, server.finish(log_line)).await {
        Ok(report) => report?.status.code(),
        Err(_) => {
            tracing::warn!("Timed out draining web UI output");
            None
        }
    };
    tracing::info!("Web UI exited with code {:?}", exit_code);

    let final_commit = store.commit()?;
    tracing::info!("Final volume commit completed");

    Ok(WebUiReport {
        exit_code,
        interrupted,
        commits,
        final_commit,
    })
}

/// Errors that can occur while supervising the web UI.
#[derive(Debug, thiserror::Error)]
pub enum WebUiError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
