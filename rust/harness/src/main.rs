//! Training Job Harness CLI
//!
//! Runs toolkit training jobs sequentially against the output volume, or launches
//! the toolkit's web UI.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use toolkit_harness::{
    config::{self, HarnessConfig},
    job::{Job, JobFactory, ToolkitJobFactory},
    runner::JobRunner,
    store::{OutputStore, Volume},
    webui,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "toolkit-harness", about = "Training Job Harness")]
struct Cli {
    /// Path to harness.toml config file
    #[arg(short, long, default_value = "harness.toml", global = true)]
    config: String,

    /// Optional environment file (eg: HF_TOKEN), loaded before the config
    #[arg(long, default_value = ".env", global = true)]
    env_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run training jobs sequentially
    Run {
        /// Name of config file (eg: person_v1 for config/person_v1.yaml), or full
        /// path if it is not in the config folder. Multiple configs run in order.
        #[arg(required = true, num_args = 1.., value_delimiter = ',')]
        configs: Vec<String>,

        /// Continue running additional jobs even if a job fails
        #[arg(short, long)]
        recover: bool,

        /// Name to replace [name] tag in config file, useful for shared config file
        #[arg(short, long)]
        name: Option<String>,

        /// Resolve configs and print the jobs without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Launch the web UI server instead of training
    Webui,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber the job spinner
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();
    config::load_env_file(&cli.env_file)?;
    let config = HarnessConfig::load_or_default(&cli.config)?;
    let volume = Volume::new(&config.harness.mount_dir);

    match cli.command {
        Commands::Run {
            configs,
            recover,
            name,
            dry_run,
        } => {
            let factory = ToolkitJobFactory::from_config(&config);

            if dry_run {
                println!("=== Dry Run ===");
                let mut resolved = 0;
                for config_ref in &configs {
                    match factory.get_job(config_ref, name.as_deref()) {
                        Ok(mut job) => {
                            job.set_training_folder(volume.mount_dir())?;
                            let doc = job.document();
                            println!(
                                "  - {config_ref}: {} [{}] from {} -> {}",
                                job.name(),
                                doc.kind,
                                doc.source.display(),
                                doc.training_folder().unwrap_or_default()
                            );
                            resolved += 1;
                        }
                        Err(e) => println!("  - {config_ref}: {e}"),
                    }
                }
                println!();
                println!("Resolved {resolved}/{} configs", configs.len());
                return Ok(if resolved == configs.len() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }

            let mut runner = JobRunner::new(factory, volume, std::io::stdout());
            if let Err(e) = runner.run_all(&configs, recover, name.as_deref()).await {
                eprintln!("ERROR: {e}");
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Webui => {
            let report = webui::serve(&config, &volume).await?;
            if report.interrupted {
                println!("Web UI stopped.");
            }
            println!(
                "Web UI exited ({:?}), {} periodic commit(s)",
                report.exit_code, report.commits
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
