mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use exam_common::types::Language;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "exam-cli")]
#[command(about = "Exam CLI - Manage judge templates and grading", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured execution templates
    ListLanguages,

    /// Build judge images from judge_images/<lang>/Dockerfile
    BuildImages {
        /// Only build this language
        #[arg(short, long)]
        name: Option<Language>,

        /// Rebuild even if the image already exists
        #[arg(long, default_value = "false")]
        force: bool,

        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Check that every configured image is present
    CheckImages,

    /// Close every attempt past its deadline and enqueue grading
    Sweep,

    /// Enqueue grading for closed attempts that have no score
    RequeueUngraded,

    /// Grade one closed attempt in-process
    Grade {
        #[arg(short, long)]
        attempt: Uuid,
    },

    /// Judge a local source file against inline test cases
    Judge {
        #[arg(short, long)]
        language: Language,

        #[arg(short, long)]
        file: PathBuf,

        /// Test case as INPUT=>EXPECTED (`\n` is a newline); repeatable
        #[arg(short, long = "case", required = true)]
        cases: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ListLanguages => commands::list_languages()?,
        Commands::BuildImages { name, force, no_cache } => {
            commands::build_images(name, force, no_cache).await?;
        }
        Commands::CheckImages => commands::check_images().await?,
        Commands::Sweep => commands::sweep().await?,
        Commands::RequeueUngraded => commands::requeue_ungraded().await?,
        Commands::Grade { attempt } => commands::grade(attempt).await?,
        Commands::Judge { language, file, cases } => {
            commands::judge_file(language, &file, &cases).await?;
        }
    }

    Ok(())
}
