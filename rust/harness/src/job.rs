//! Training jobs and the factory that builds them from config references.
//!
//! A config reference is either a path to a YAML/JSON job config, or a bare name
//! looked up in the config directory (`person_v1` -> `config/person_v1.yaml`).
//! The toolkit job runs the external training toolkit on the resolved config.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{
    config::{HarnessConfig, ToolkitSettings},
    process::{self, CommandSpec, ProcessError, Stream},
};

/// Tag replaced by the job name anywhere in a config.
pub const NAME_TAG: &str = "[name]";

/// Extensions tried, in order, when resolving a bare config name.
const CONFIG_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Job types the toolkit knows how to run.
const JOB_KINDS: [&str; 5] = ["extension", "train", "extract", "generate", "mod"];

/// Builds runnable jobs from config references.
pub trait JobFactory {
    type Job: Job;

    /// Resolve `config_ref` into a job, replacing the config's name with
    /// `name_override` when given.
    fn get_job(&self, config_ref: &str, name_override: Option<&str>)
    -> Result<Self::Job, JobError>;
}

/// A single training run.
#[allow(async_fn_in_trait)]
pub trait Job {
    fn name(&self) -> &str;

    /// Point the job's outputs at `folder`. Must be called before `run`.
    fn set_training_folder(&mut self, folder: &Path) -> Result<(), JobError>;

    async fn run(&mut self) -> Result<(), JobError>;

    /// Release anything held by the job. Never fails.
    fn cleanup(&mut self);
}

/// Find the config file for a reference.
pub fn resolve_config_path(config_ref: &str, config_dir: &Path) -> Result<PathBuf, JobError> {
    let direct = Path::new(config_ref);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }

    std::iter::once(config_dir.join(config_ref))
        .chain(
            CONFIG_EXTENSIONS
                .iter()
                .map(|ext| config_dir.join(format!("{config_ref}.{ext}"))),
        )
        .find(|p| p.is_file())
        .ok_or_else(|| JobError::NotFound(config_ref.to_string()))
}

/// Parse a config file as JSON or YAML depending on its extension.
pub fn load_config_file(path: &Path) -> Result<Value, JobError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| JobError::Read(path.to_path_buf(), e))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content)
            .map_err(|e| JobError::Parse(path.to_path_buf(), e.to_string()))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| JobError::Parse(path.to_path_buf(), e.to_string()))
    }
}

/// Replace every occurrence of [`NAME_TAG`] in string values.
fn replace_name_tag(value: &mut Value, name: &str) {
    match value {
        Value::String(s) if s.contains(NAME_TAG) => *s = s.replace(NAME_TAG, name),
        Value::Array(items) => items.iter_mut().for_each(|v| replace_name_tag(v, name)),
        Value::Object(map) => map.values_mut().for_each(|v| replace_name_tag(v, name)),
        _ => {}
    }
}

/// A job config after name substitution and validation.
#[derive(Debug, Clone)]
pub struct JobDocument {
    pub name: String,
    pub kind: String,
    pub source: PathBuf,
    /// Full config, passed to the toolkit unchanged apart from the name and training folder.
    pub value: Value,
}

impl JobDocument {
    /// Validate a parsed config and apply the name.
    pub fn new(
        source: &Path,
        mut value: Value,
        name_override: Option<&str>,
    ) -> Result<Self, JobError> {
        let invalid = |msg: &str| JobError::Invalid(source.to_path_buf(), msg.to_string());

        let kind = value
            .get("job")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("`job` is required"))?
            .to_string();
        if !JOB_KINDS.contains(&kind.as_str()) {
            return Err(invalid(&format!("unknown job type `{kind}`")));
        }

        let config = value
            .get_mut("config")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| invalid("`config` table is required"))?;

        if let Some(name) = name_override {
            config.insert("name".to_string(), Value::String(name.to_string()));
        }
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| invalid("`config.name` is required"))?
            .to_string();

        let has_process = config
            .get("process")
            .and_then(Value::as_array)
            .is_some_and(|p| p.first().is_some_and(Value::is_object));
        if !has_process {
            return Err(invalid("`config.process` must be a non-empty list of tables"));
        }

        replace_name_tag(&mut value, &name);

        Ok(Self {
            name,
            kind,
            source: source.to_path_buf(),
            value,
        })
    }

    fn first_process_mut(&mut self) -> Option<&mut serde_json::Map<String, Value>> {
        self.value
            .get_mut("config")?
            .get_mut("process")?
            .get_mut(0)?
            .as_object_mut()
    }

    /// Output folder of the first process, if set.
    #[must_use]
    pub fn training_folder(&self) -> Option<&str> {
        self.value
            .get("config")?
            .get("process")?
            .get(0)?
            .get("training_folder")?
            .as_str()
    }

    pub fn set_training_folder(&mut self, folder: &Path) -> Result<(), JobError> {
        let source = self.source.clone();
        let process = self.first_process_mut().ok_or_else(|| {
            JobError::Invalid(source, "`config.process` must be a non-empty list of tables".into())
        })?;
        process.insert(
            "training_folder".to_string(),
            Value::String(folder.display().to_string()),
        );
        Ok(())
    }
}

/// Builds [`ToolkitJob`]s from the harness configuration.
#[derive(Debug, Clone)]
pub struct ToolkitJobFactory {
    config_dir: PathBuf,
    toolkit: ToolkitSettings,
    env: BTreeMap<String, String>,
}

impl ToolkitJobFactory {
    #[must_use]
    pub fn new(
        config_dir: impl Into<PathBuf>,
        toolkit: ToolkitSettings,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            toolkit,
            env,
        }
    }

    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.harness.config_dir.clone(),
            config.toolkit.clone(),
            config.env.clone(),
        )
    }
}

impl JobFactory for ToolkitJobFactory {
    type Job = ToolkitJob;

    fn get_job(
        &self,
        config_ref: &str,
        name_override: Option<&str>,
    ) -> Result<ToolkitJob, JobError> {
        let path = resolve_config_path(config_ref, &self.config_dir)?;
        tracing::debug!("Resolved {} to {}", config_ref, path.display());

        let value = load_config_file(&path)?;
        let document = JobDocument::new(&path, value, name_override)?;

        Ok(ToolkitJob {
            document,
            toolkit: self.toolkit.clone(),
            env: self.env.clone(),
            resolved: None,
        })
    }
}

/// A job run by launching the external training toolkit.
#[derive(Debug)]
pub struct ToolkitJob {
    document: JobDocument,
    toolkit: ToolkitSettings,
    env: BTreeMap<String, String>,
    /// Resolved config handed to the toolkit; deleted on cleanup.
    resolved: Option<NamedTempFile>,
}

impl ToolkitJob {
    #[must_use]
    pub fn document(&self) -> &JobDocument {
        &self.document
    }

    /// Write the resolved config to a temporary JSON file.
    fn write_resolved(&self) -> Result<NamedTempFile, JobError> {
        let io_err = |e: std::io::Error| JobError::Io(self.document.name.clone(), e);

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", self.document.name))
            .suffix(".json")
            .tempfile()
            .map_err(io_err)?;
        serde_json::to_writer_pretty(file.as_file_mut(), &self.document.value)
            .map_err(|e| io_err(e.into()))?;
        file.as_file_mut().flush().map_err(io_err)?;
        Ok(file)
    }

    /// Log file for the toolkit's output, next to the job's outputs.
    fn log_path(&self) -> Option<PathBuf> {
        let folder = Path::new(self.document.training_folder()?);
        let dir = folder.join("logs");
        std::fs::create_dir_all(&dir).ok()?;
        Some(dir.join(format!("{}.log", self.document.name)))
    }

    fn command(&self, config_file: &Path) -> CommandSpec {
        let mut args = self.toolkit.args.clone();
        args.push(config_file.display().to_string());
        CommandSpec {
            program: self.toolkit.program.clone(),
            args,
            dir: Some(self.toolkit.dir.clone()),
            env: self.env.clone(),
        }
    }
}

impl Job for ToolkitJob {
    fn name(&self) -> &str {
        &self.document.name
    }

    fn set_training_folder(&mut self, folder: &Path) -> Result<(), JobError> {
        self.document.set_training_folder(folder)
    }

    async fn run(&mut self) -> Result<(), JobError> {
        let file = self.write_resolved()?;
        let spec = self.command(file.path());
        self.resolved = Some(file);

        let name = self.document.name.clone();
        let log_path = self.log_path();
        let child = process::spawn(&name, &spec, log_path.as_deref())?;

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{name:15}: starting (PID {})", child.pid()));
        pb.enable_steady_tick(Duration::from_millis(100));

        let report = child
            .finish(|out| {
                match out.stream {
                    Stream::Stdout => tracing::info!("[{}] {}", name, out.line),
                    Stream::Stderr => tracing::debug!("[{} stderr] {}", name, out.line),
                }
                let short: String = out.line.chars().take(60).collect();
                pb.set_message(format!("{name:15}: {short}"));
            })
            .await?;

        if report.status.success() {
            pb.finish_with_message(format!("{name:15}: completed"));
            Ok(())
        } else {
            pb.finish_with_message(format!("{name:15}: failed"));
            for line in &report.stderr_tail {
                tracing::debug!("[{} stderr tail] {}", name, line);
            }
            Err(JobError::Failed {
                name,
                code: report.status.code(),
                message: report.describe(),
            })
        }
    }

    fn cleanup(&mut self) {
        if let Some(file) = self.resolved.take()
            && let Err(e) = file.close()
        {
            tracing::warn!("Failed to remove resolved config for {}: {}", self.document.name, e);
        }
    }
}

/// Errors that can occur resolving or running a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("config not found: {0}")]
    NotFound(String),
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, String),
    #[error("invalid config {0}: {1}")]
    Invalid(PathBuf, String),
    #[error("failed to prepare job {0}: {1}")]
    Io(String, std::io::Error),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("job {name} failed ({code:?}): {message}")]
    Failed {
        name: String,
        code: Option<i32>,
        message: String,
    },
}
