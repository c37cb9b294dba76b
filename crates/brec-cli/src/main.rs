use std::path::PathBuf;

use anyhow::Result;
use brec_reconcile::{PipelineScope, ReconcileConfig, RunSummary, Stage};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "brec-cli")]
#[command(about = "Brand to holding reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify, discover, then review.
    Run(PathArgs),
    Verify(PathArgs),
    Discover(PathArgs),
    Review(PathArgs),
    /// Print an index of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct PathArgs {
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    workspace: Option<PathBuf>,
}

impl PathArgs {
    fn config(self) -> ReconcileConfig {
        let mut config = ReconcileConfig::from_env();
        if let Some(workspace) = self.workspace {
            config.workspace_root = workspace;
        }
        if let Some(input) = self.input {
            config.input_path = input;
        }
        if let Some(output) = self.output {
            config.output_path = output;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (args, scope) = match cli.command.unwrap_or(Commands::Run(PathArgs::default())) {
        Commands::Run(args) => (args, PipelineScope::Full),
        Commands::Verify(args) => (args, PipelineScope::Only(Stage::Verify)),
        Commands::Discover(args) => (args, PipelineScope::Only(Stage::Discover)),
        Commands::Review(args) => (args, PipelineScope::Only(Stage::Review)),
        Commands::Report { runs, workspace } => {
            let workspace =
                workspace.or_else(|| std::env::var("BREC_WORKSPACE").ok().map(PathBuf::from));
            println!("{}", brec_reconcile::report_recent_runs_markdown(runs, workspace)?);
            return Ok(());
        }
    };

    let summary = brec_reconcile::run_pipeline(args.config(), scope).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let admitted: usize = summary.stages.iter().map(|s| s.admitted.len()).sum();
    let failed: usize = summary.stages.iter().map(|s| s.failed_holdings.len()).sum();
    println!(
        "run complete: run_id={} records={} new_brands={} failed_holdings={} near_duplicates={} output={} reports={}",
        summary.run_id,
        summary.records,
        admitted,
        failed,
        summary.near_duplicates.len(),
        summary.output_path,
        summary.reports_dir
    );
}
