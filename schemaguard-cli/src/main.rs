//! Schemaguard command-line tool
//!
//! Runs migrations against a database directly, checks manifests and
//! schemas, manages agent API keys and drives a remote deployment agent.
//! Exit codes: 0 success, 1 pending work or drift, 2 incompatible or error,
//! 3 authentication failure.

mod client;
mod local;
mod remote;

use clap::{Parser, Subcommand};
use client::ClientError;
use schemaguard::migration::exit_code;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "schemaguard")]
#[command(about = "Schema migrations, drift detection and remote deployments for PostgreSQL")]
#[command(version)]
pub struct Cli {
    /// Database connection URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Migration registry directory
    #[arg(long, global = true, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the migration registry against a database
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },

    /// Inspect manifest directories
    Manifest {
        #[command(subcommand)]
        command: ManifestCommand,
    },

    /// Capture and compare live schemas
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },

    /// Run the deployment agent
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// Manage agent API keys in the metadata database
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },

    /// Call a remote deployment agent
    Remote {
        /// Agent base URL [env: SCHEMAGUARD_AGENT_URL]
        #[arg(long)]
        agent_url: Option<String>,

        /// Client id [env: SCHEMAGUARD_CLIENT_ID]
        #[arg(long)]
        client_id: Option<String>,

        /// API key [env: SCHEMAGUARD_API_KEY]
        #[arg(long)]
        api_key: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        #[command(subcommand)]
        command: RemoteCommand,
    },
}

#[derive(Subcommand)]
pub enum MigrateCommand {
    /// Show applied and pending migrations
    Status,

    /// Apply pending migrations
    Up {
        /// Stop after this version
        #[arg(long)]
        target: Option<String>,

        /// Runtime version to check compatibility bounds against
        #[arg(long)]
        runtime_version: Option<String>,

        /// Apply even when the runtime is outside a migration's bounds
        #[arg(long)]
        force: bool,

        /// Show what would be executed without running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back every migration above a version
    Down {
        /// Version to roll back to (it stays applied)
        #[arg(long)]
        to: String,

        /// Show what would be rolled back
        #[arg(long)]
        dry_run: bool,
    },

    /// Health probe: exit 0 up to date, 1 pending, 2 incompatible runtime
    Check {
        #[arg(long)]
        runtime_version: String,
    },

    /// Compatibility of the applied migrations with a runtime version
    Compat {
        #[arg(long)]
        runtime_version: String,
    },

    /// Validate registry files and the checksums of applied migrations
    Validate,

    /// Create a new registry entry
    New {
        /// Semantic version of the new migration (e.g. 1.2.0)
        version: String,
        /// Migration name (e.g. "add_orders_table")
        name: String,
    },
}

#[derive(Subcommand)]
pub enum ManifestCommand {
    /// Parse and validate a manifest directory
    Validate { path: PathBuf },

    /// Print a manifest summary
    Show {
        path: PathBuf,
        /// Print the whole manifest as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SchemaCommand {
    /// Snapshot the live schema as JSON
    Capture {
        #[arg(long, default_value = "public")]
        schema: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Compare the live schema with the schema a manifest produces
    Compare {
        manifest: PathBuf,
        #[arg(long, default_value = "public")]
        schema: String,
    },
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Serve the agent until stopped
    Serve {
        /// Configuration file
        #[arg(long, default_value = schemaguard::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Issue a key for a client; the secret is printed once
    Create {
        client_id: String,
        #[arg(long)]
        description: Option<String>,
        /// Expire the key after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,
        #[arg(long = "permission")]
        permissions: Vec<String>,
    },

    /// Deactivate a client's key
    Revoke { client_id: String },

    /// List issued keys
    List,
}

#[derive(Subcommand)]
pub enum RemoteCommand {
    /// Check the agent is reachable and the key is accepted
    Ping,

    /// Compare a registered database with a manifest
    Compare {
        database: String,
        manifest: PathBuf,
        /// Also compare seed table row counts
        #[arg(long)]
        data: bool,
    },

    /// Reverse-engineer a registered database into a manifest directory
    Download {
        database: String,
        output: PathBuf,
        /// Export table rows as seed data
        #[arg(long)]
        data: bool,
        #[arg(long)]
        environment: Option<String>,
    },

    /// Deploy a manifest to a registered database
    Deploy {
        database: String,
        manifest: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        runtime_version: Option<String>,
    },

    /// Register, optionally create, deploy and seed a database
    Bootstrap {
        database: String,
        connection_string: String,
        manifest: PathBuf,
        #[arg(long)]
        create_database: bool,
        #[arg(long)]
        environment: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Show a database's deployments, most recent first
    History {
        database: String,
        #[arg(long, default_value = "20")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
}

/// `--database-url`, then `SCHEMAGUARD_DATABASE_URL`, then `DATABASE_URL`.
pub fn resolve_database_url(flag: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Option<String> {
    flag.map(str::to_string)
        .or_else(|| env("SCHEMAGUARD_DATABASE_URL"))
        .or_else(|| env("DATABASE_URL"))
        .filter(|url| !url.trim().is_empty())
}

impl Cli {
    fn database_url(&self) -> anyhow::Result<String> {
        resolve_database_url(self.database_url.as_deref(), |name| std::env::var(name).ok()).ok_or_else(|| {
            anyhow::anyhow!(
                "Database URL not provided. Use --database-url or set SCHEMAGUARD_DATABASE_URL or DATABASE_URL environment variable."
            )
        })
    }
}

/// Exit code for an error that ended the command.
fn failure_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<ClientError>() {
        Some(e) if e.is_unauthorized() => exit_code::AUTHENTICATION,
        _ => exit_code::INCOMPATIBLE,
    }
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Commands::Migrate { command } => local::migrate(cli, command),
        Commands::Manifest { command } => local::manifest(command),
        Commands::Schema { command } => local::schema(cli, command),
        Commands::Agent { command } => local::agent(command),
        Commands::Keys { command } => local::keys(cli, command),
        Commands::Remote {
            agent_url,
            client_id,
            api_key,
            timeout,
            command,
        } => {
            let client = remote::connect(agent_url.as_deref(), client_id.as_deref(), api_key.as_deref(), *timeout)?;
            remote::run(&client, command)
        }
    }
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            process::exit(failure_code(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_database_url_precedence() {
        let env = |name: &str| match name {
            "SCHEMAGUARD_DATABASE_URL" => Some("postgresql://sg@a/db".to_string()),
            "DATABASE_URL" => Some("postgresql://app@b/db".to_string()),
            _ => None,
        };
        assert_eq!(
            resolve_database_url(Some("postgresql://flag@c/db"), env).as_deref(),
            Some("postgresql://flag@c/db")
        );
        assert_eq!(resolve_database_url(None, env).as_deref(), Some("postgresql://sg@a/db"));
        assert_eq!(
            resolve_database_url(None, |name: &str| (name == "DATABASE_URL").then(|| "postgresql://app@b/db".to_string()))
                .as_deref(),
            Some("postgresql://app@b/db")
        );
        assert_eq!(resolve_database_url(None, |_: &str| None), None);
    }

    #[test]
    fn test_remote_deploy_arguments() {
        let cli = Cli::try_parse_from([
            "schemaguard",
            "remote",
            "--client-id",
            "ci",
            "deploy",
            "orders",
            "./manifest",
            "--dry-run",
            "--runtime-version",
            "2.1.0",
        ])
        .unwrap();
        match cli.command {
            Commands::Remote {
                client_id,
                command: RemoteCommand::Deploy { database, dry_run, runtime_version, .. },
                ..
            } => {
                assert_eq!(client_id.as_deref(), Some("ci"));
                assert_eq!(database, "orders");
                assert!(dry_run);
                assert_eq!(runtime_version.as_deref(), Some("2.1.0"));
            }
            _ => panic!("parsed the wrong command"),
        }
    }

    #[test]
    fn test_authentication_failures_exit_with_three() {
        let err = anyhow::Error::new(ClientError::Unauthorized("Invalid API key".into()));
        assert_eq!(failure_code(&err), exit_code::AUTHENTICATION);
        assert_eq!(failure_code(&anyhow::anyhow!("boom")), exit_code::INCOMPATIBLE);
    }
}
