//! Command-line interface

pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::catalog::CatalogArgs;
use commands::plan::PlanArgs;
use commands::run::RunArgs;

#[derive(Parser, Debug)]
#[command(name = "relmig")]
#[command(about = "Dependency-aware relational data migration with integrity reconciliation", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Migrate every catalog table from the export directory into the target
    Run(RunArgs),
    /// Print the load order without writing anything
    Plan(PlanArgs),
    /// Derive a catalog from the target's live schema
    Catalog(CatalogArgs),
}

/// Execute a parsed command line, returning the process exit code
pub async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => commands::run::handle_run_command(args).await,
        Commands::Plan(args) => commands::plan::handle_plan_command(args).await,
        Commands::Catalog(args) => commands::catalog::handle_catalog_command(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "relmig",
            "-vv",
            "run",
            "--target",
            "sqlite://t.db",
            "--workers",
            "2",
            "--policy",
            "drop",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.common.target.as_deref(), Some("sqlite://t.db"));
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.policy, Some(crate::catalog::OrphanPolicy::Drop));
    }

    #[test]
    fn test_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["relmig", "run", "--policy", "guess"]).is_err());
    }
}
