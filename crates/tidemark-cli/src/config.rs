//! Command-line arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidemark_core::{EngineConfig, Environment};

/// Default directory for the local sled store.
pub const DEFAULT_DATA_PATH: &str = "./tidemark-data";

/// Default number of history records listed.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Tidemark migration engine.
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the local data directory.
    #[arg(short, long, global = true, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// Region recorded in migrations and history.
    #[arg(long, global = true, default_value = "local")]
    pub region: String,

    /// Override the concurrency ceiling (default depends on the environment).
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a spec without touching the store.
    Validate {
        /// Path to the spec JSON file.
        spec: PathBuf,
        /// Target environment.
        #[arg(short, long, default_value = "development")]
        env: Environment,
    },
    /// Show the plan for a spec without executing it.
    Plan {
        spec: PathBuf,
        #[arg(short, long, default_value = "development")]
        env: Environment,
    },
    /// Execute a spec against the local store.
    Apply {
        spec: PathBuf,
        #[arg(short, long, default_value = "development")]
        env: Environment,
    },
    /// Show the archived record of one migration.
    Status {
        /// Migration id.
        id: String,
    },
    /// List archived migrations, most recent first.
    History {
        #[arg(short, long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
        /// Only show migrations for this environment.
        #[arg(short, long)]
        env: Option<Environment>,
    },
    /// Archive migrations interrupted by a crash as failed.
    Recover,
}

impl Command {
    /// Environment the command targets, if any.
    pub fn environment(&self) -> Option<Environment> {
        match self {
            Command::Validate { env, .. } | Command::Plan { env, .. } | Command::Apply { env, .. } => {
                Some(*env)
            }
            Command::History { env, .. } => *env,
            Command::Status { .. } | Command::Recover => None,
        }
    }
}

impl Args {
    /// Build the engine configuration for this invocation.
    pub fn into_config(&self) -> EngineConfig {
        let environment = self.command.environment().unwrap_or_default();
        let mut config = EngineConfig::for_environment(environment).with_region(self.region.clone());
        if let Some(max) = self.max_concurrent {
            config = config.with_max_concurrent_migrations(max);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply() {
        let args = Args::parse_from([
            "tidemark",
            "apply",
            "spec.json",
            "--env",
            "prod",
            "--region",
            "eu-west-1",
        ]);
        assert_eq!(
            args.command,
            Command::Apply {
                spec: PathBuf::from("spec.json"),
                env: Environment::Production,
            }
        );
        assert_eq!(args.data_path, PathBuf::from(DEFAULT_DATA_PATH));

        let config = args.into_config();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.max_concurrent_migrations, 1);
    }

    #[test]
    fn test_max_concurrent_override() {
        let args = Args::parse_from(["tidemark", "--max-concurrent", "3", "history", "-l", "5"]);
        assert_eq!(
            args.command,
            Command::History {
                limit: 5,
                env: None,
            }
        );
        assert_eq!(args.into_config().max_concurrent_migrations, 3);
    }

    #[test]
    fn test_rejects_unknown_environment() {
        assert!(Args::try_parse_from(["tidemark", "plan", "s.json", "--env", "moon"]).is_err());
    }
}
