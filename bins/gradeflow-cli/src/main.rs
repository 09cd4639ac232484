mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use gradeflow_common::{Config, SubmissionTarget, Visibility};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradeflow-cli")]
#[command(about = "Gradeflow CLI - Re-trigger grading jobs and inspect archival locks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VisibilityArg {
    Public,
    Private,
    Both,
}

impl VisibilityArg {
    fn expand(self) -> Vec<Visibility> {
        match self {
            VisibilityArg::Public => vec![Visibility::Public],
            VisibilityArg::Private => vec![Visibility::Private],
            VisibilityArg::Both => Visibility::all_variants().to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Publish grading jobs for an uploaded submission
    Enqueue {
        #[arg(long)]
        course: i64,

        #[arg(long)]
        task: i64,

        #[arg(long)]
        submission: i64,

        #[arg(long)]
        grade: i64,

        /// Docker image that runs the tests
        #[arg(long)]
        image: String,

        /// Bearer token the worker presents to the API
        #[arg(long, env = "GRADEFLOW_TOKEN", hide_env_values = true)]
        token: String,

        /// Base URL of the grading API
        #[arg(long, env = "API_URL")]
        api_url: String,

        #[arg(long, value_enum, default_value = "both")]
        visibility: VisibilityArg,

        /// Print the messages instead of publishing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the SHA-256 of a file
    Checksum {
        path: PathBuf,
    },

    /// List archival lock markers
    Locks,

    /// Remove a sheet lock, or a collection lock together with its sheet lock
    Unlock {
        #[arg(long)]
        sheet: i64,

        #[arg(long, requires_all = ["task", "group"])]
        course: Option<i64>,

        #[arg(long, requires_all = ["course", "group"])]
        task: Option<i64>,

        #[arg(long, requires_all = ["course", "task"])]
        group: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load();
    let store = config.paths.file_store();

    match cli.command {
        Commands::Enqueue {
            course,
            task,
            submission,
            grade,
            image,
            token,
            api_url,
            visibility,
            dry_run,
        } => {
            let target = SubmissionTarget {
                api_url,
                course_id: course,
                task_id: task,
                submission_id: submission,
                grade_id: grade,
            };
            commands::enqueue(
                &config.broker,
                &store,
                &target,
                &visibility.expand(),
                &token,
                &image,
                dry_run,
            )
            .await?;
        }
        Commands::Checksum { path } => {
            commands::checksum(&path)?;
        }
        Commands::Locks => {
            commands::list_locks(&store)?;
        }
        Commands::Unlock {
            sheet,
            course,
            task,
            group,
        } => {
            let collection = match (course, task, group) {
                (Some(course), Some(task), Some(group)) => Some((course, task, group)),
                _ => None,
            };
            commands::unlock(&store, sheet, collection)?;
        }
    }

    Ok(())
}
