//! Sequential job execution with optional recovery from failures.
//!
//! Jobs run one at a time in input order, since each one claims the GPU for its
//! whole duration. Every job ends in an explicit [`JobOutcome`]. Without recovery the
//! first failure ends the invocation; with recovery it is counted and the queue moves
//! on. Failed jobs are never retried. A summary is printed exactly once either way.

use std::{fmt, io::Write};

use crate::{
    job::{Job, JobError, JobFactory},
    store::{OutputStore, StoreError},
};

const SEPARATOR: &str = "========================================";

/// Where in a job's lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The config reference could not be turned into a job.
    Resolve,
    /// Pointing the job at the output store failed.
    Prepare,
    /// The job itself failed.
    Run,
    /// The output store could not be committed.
    Commit,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "resolve",
            Self::Prepare => "prepare",
            Self::Run => "run",
            Self::Commit => "commit",
        })
    }
}

/// Any error that fails a single job.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Record of a failed job, kept after the run for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub config_ref: String,
    pub stage: FailureStage,
    pub message: String,
}

/// Result of processing one config reference.
#[derive(Debug)]
pub enum JobOutcome {
    Completed { name: String },
    Failed { stage: FailureStage, error: StepError },
}

impl JobOutcome {
    fn failed(stage: FailureStage, error: impl Into<StepError>) -> Self {
        Self::Failed {
            stage,
            error: error.into(),
        }
    }
}

/// Counts of completed and failed jobs for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTally {
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    /// One entry per failed job, in order.
    pub failures: Vec<JobFailure>,
}

impl RunTally {
    /// Number of config references processed so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.jobs_completed + self.jobs_failed
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Format the end-of-run summary. Zero counts are omitted.
#[must_use]
pub fn format_summary(jobs_completed: usize, jobs_failed: usize) -> String {
    let mut lines = vec![String::new(), SEPARATOR.to_string(), "Result:".to_string()];
    if jobs_completed > 0 {
        lines.push(format!(
            " - {jobs_completed} completed job{}",
            plural(jobs_completed)
        ));
    }
    if jobs_failed > 0 {
        lines.push(format!(" - {jobs_failed} failure{}", plural(jobs_failed)));
    }
    lines.push(SEPARATOR.to_string());
    lines.join("\n")
}

/// Runs jobs built by a [`JobFactory`] one after another, committing the
/// [`OutputStore`] after each success. Progress and the summary go to `out`.
pub struct JobRunner<F, S, W> {
    factory: F,
    store: S,
    out: W,
}

impl<F, S, W> JobRunner<F, S, W>
where
    F: JobFactory,
    S: OutputStore,
    W: Write,
{
    #[must_use]
    pub fn new(factory: F, store: S, out: W) -> Self {
        Self {
            factory,
            store,
            out,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn say(&mut self, line: &str) {
        // Best effort: a closed stdout must not fail the jobs
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }

    fn print_summary(&mut self, tally: &RunTally) {
        let summary = format_summary(tally.jobs_completed, tally.jobs_failed);
        self.say(&summary);
    }

    /// Run every config reference in order.
    ///
    /// With `recover` false, the first failure prints the summary and returns
    /// [`RunError::Aborted`] carrying the original error; later references are never
    /// touched. With `recover` true, failures are counted and skipped.
    pub async fn run_all<I>(
        &mut self,
        config_refs: I,
        recover: bool,
        name_override: Option<&str>,
    ) -> Result<RunTally, RunError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        I::IntoIter: ExactSizeIterator,
    {
        let refs = config_refs.into_iter();
        let total = refs.len();
        let mut tally = RunTally::default();

        self.say(&format!("Running {total} job{}", plural(total)));

        for config_ref in refs {
            let config_ref = config_ref.as_ref();

            match self.run_one(config_ref, name_override).await {
                JobOutcome::Completed { name } => {
                    tally.jobs_completed += 1;
                    tracing::info!(
                        "{} completed ({}/{})",
                        name,
                        tally.processed(),
                        total
                    );
                }
                JobOutcome::Failed { stage, error } => {
                    tally.jobs_failed += 1;
                    tracing::error!("{} failed during {}: {}", config_ref, stage, error);
                    self.say(&format!("Error running job: {error}"));

                    tally.failures.push(JobFailure {
                        config_ref: config_ref.to_string(),
                        stage,
                        message: error.to_string(),
                    });

                    if !recover {
                        self.print_summary(&tally);
                        return Err(RunError::Aborted {
                            config_ref: config_ref.to_string(),
                            tally,
                            source: error,
                        });
                    }
                }
            }
        }

        self.print_summary(&tally);
        Ok(tally)
    }

    /// Resolve, run, commit and clean up a single job.
    async fn run_one(&mut self, config_ref: &str, name_override: Option<&str>) -> JobOutcome {
        let mut job = match self.factory.get_job(config_ref, name_override) {
            Ok(job) => job,
            Err(e) => return JobOutcome::failed(FailureStage::Resolve, e),
        };

        tracing::info!("Starting {} ({})", job.name(), config_ref);
        let outcome = self.drive(&mut job).await;
        job.cleanup();
        outcome
    }

    async fn drive(&mut self, job: &mut F::Job) -> JobOutcome {
        let mount = self.store.mount_dir().to_path_buf();

        if let Err(e) = job.set_training_folder(&mount) {
            return JobOutcome::failed(FailureStage::Prepare, e);
        }
        if let Err(e) = self.store.ensure_mount() {
            return JobOutcome::failed(FailureStage::Prepare, e);
        }
        self.say(&format!(
            "Training outputs will be saved to: {}",
            mount.display()
        ));

        if let Err(e) = job.run().await {
            return JobOutcome::failed(FailureStage::Run, e);
        }

        match self.store.commit() {
            Ok(outcome) => tracing::debug!("Commit after {}: {:?}", job.name(), outcome),
            Err(e) => return JobOutcome::failed(FailureStage::Commit, e),
        }

        JobOutcome::Completed {
            name: job.name().to_string(),
        }
    }
}

/// Errors returned by [`JobRunner::run_all`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A job failed without recovery enabled; remaining jobs were not run.
    #[error("job {config_ref} failed: {source}")]
    Aborted {
        config_ref: String,
        tally: RunTally,
        #[source]
        source: StepError,
    },
}

impl RunError {
    /// Tally at the point the run stopped.
    #[must_use]
    pub fn tally(&self) -> &RunTally {
        match self {
            Self::Aborted { tally, .. } => tally,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_single_completed() {
        let summary = format_summary(1, 0);
        assert!(summary.contains(" - 1 completed job\n"));
        assert!(!summary.contains("failure"));
    }

    #[test]
    fn test_summary_failures_only() {
        let summary = format_summary(0, 2);
        assert!(summary.contains(" - 2 failures"));
        assert!(!summary.contains("completed"));
    }

    #[test]
    fn test_summary_both() {
        let summary = format_summary(3, 1);
        assert_eq!(
            summary,
            "\n========================================\nResult:\n - 3 completed jobs\n - 1 failure\n========================================"
        );
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(
            format_summary(0, 0),
            "\n========================================\nResult:\n========================================"
        );
    }

    #[test]
    fn test_failure_stage_display() {
        assert_eq!(FailureStage::Resolve.to_string(), "resolve");
        assert_eq!(FailureStage::Commit.to_string(), "commit");
    }
}
