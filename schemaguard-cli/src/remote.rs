//! `schemaguard remote ...`

use crate::client::{AgentClient, DEFAULT_AGENT_URL};
use crate::RemoteCommand;
use anyhow::Context;
use colored::Colorize;
use schemaguard::agent::protocol::{
    BootstrapRequest, CompareRequest, DeployRequest, DeployResponse, DownloadRequest, HistoryRequest,
};
use schemaguard::manifest;
use schemaguard::metadb::DeploymentStatus;
use schemaguard::migration::{exit_code, MigrationVersion, RecordStatus};
use std::path::Path;
use std::time::Duration;

fn setting(flag: Option<&str>, env: &str) -> Option<String> {
    flag.map(str::to_string)
        .or_else(|| std::env::var(env).ok())
        .filter(|v| !v.trim().is_empty())
}

pub fn connect(
    agent_url: Option<&str>,
    client_id: Option<&str>,
    api_key: Option<&str>,
    timeout_secs: u64,
) -> anyhow::Result<AgentClient> {
    let url = setting(agent_url, "SCHEMAGUARD_AGENT_URL").unwrap_or_else(|| DEFAULT_AGENT_URL.to_string());
    let client_id = setting(client_id, "SCHEMAGUARD_CLIENT_ID")
        .context("Client id not provided. Use --client-id or set SCHEMAGUARD_CLIENT_ID")?;
    let api_key = setting(api_key, "SCHEMAGUARD_API_KEY")
        .context("API key not provided. Use --api-key or set SCHEMAGUARD_API_KEY")?;
    Ok(AgentClient::new(&url, client_id, api_key, Duration::from_secs(timeout_secs)))
}

fn load_manifest(path: &Path) -> anyhow::Result<schemaguard::Manifest> {
    let manifest = manifest::parse(path).with_context(|| format!("Failed to read manifest {}", path.display()))?;
    manifest.validate()?;
    Ok(manifest)
}

fn print_deployment(response: &DeployResponse) {
    println!("Deployment {} ({})", response.deployment_id, response.status);
    for result in &response.results {
        let marker = match result.status {
            RecordStatus::Failed => "✗".red(),
            RecordStatus::Applied => "✓".green(),
            _ => "•".cyan(),
        };
        println!("  {} {} {} ({})", marker, result.version, result.name, result.status);
    }
    for warning in &response.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    for error in &response.errors {
        println!("  {} {}", "✗".red(), error);
    }
    println!("Finished in {}ms", response.execution_time_ms);
}

fn deployment_code(response: &DeployResponse) -> i32 {
    match response.status {
        DeploymentStatus::Failed => exit_code::INCOMPATIBLE,
        _ => exit_code::OK,
    }
}

pub fn run(client: &AgentClient, command: &RemoteCommand) -> anyhow::Result<i32> {
    match command {
        RemoteCommand::Ping => {
            let pong = client.ping()?;
            println!("✅ Agent {} is {}", pong.agent_version, pong.status);
            Ok(exit_code::OK)
        }

        RemoteCommand::Compare { database, manifest, data } => {
            let response = client.compare(&CompareRequest {
                database: database.clone(),
                manifest: load_manifest(manifest)?,
                include_data_diff: *data,
            })?;
            if response.is_identical
                && response.pending_migrations.is_empty()
                && response.checksum_mismatches.is_empty()
            {
                println!("✅ {} matches the manifest", database);
                return Ok(exit_code::OK);
            }
            println!("{} {} differs from the manifest", "⚠".yellow(), database);
            for line in &response.comparison.differences {
                println!("  • {}", line);
            }
            for drift in &response.comparison.drift {
                println!("  • {}", drift);
            }
            for version in &response.pending_migrations {
                println!("  ⏳ {} pending", version);
            }
            for mismatch in &response.checksum_mismatches {
                println!("  {} {} checksum changed since it was applied", "✗".red(), mismatch.version);
            }
            for diff in &response.data_differences {
                println!(
                    "  • {} ({}): {} rows, seed has {}",
                    diff.table, diff.environment, diff.actual_rows, diff.expected_rows
                );
            }
            Ok(exit_code::PENDING)
        }

        RemoteCommand::Download {
            database,
            output,
            data,
            environment,
        } => {
            let response = client.download(&DownloadRequest {
                database: database.clone(),
                include_data: *data,
                environment: environment.clone(),
            })?;
            manifest::write(&response.manifest, output)?;
            println!(
                "✅ Wrote {} objects from {} to {} (checksum {})",
                response.objects_count,
                database,
                output.display(),
                response.checksum
            );
            Ok(exit_code::OK)
        }

        RemoteCommand::Deploy {
            database,
            manifest,
            dry_run,
            target,
            force,
            runtime_version,
        } => {
            let response = client.deploy(&DeployRequest {
                database: database.clone(),
                manifest: load_manifest(manifest)?,
                dry_run: *dry_run,
                target_version: target.as_deref().map(MigrationVersion::parse).transpose()?,
                force: *force,
                runtime_version: runtime_version.clone(),
            })?;
            print_deployment(&response);
            Ok(deployment_code(&response))
        }

        RemoteCommand::Bootstrap {
            database,
            connection_string,
            manifest,
            create_database,
            environment,
            description,
            dry_run,
        } => {
            let response = client.bootstrap(&BootstrapRequest {
                database: database.clone(),
                connection_string: connection_string.clone(),
                manifest: load_manifest(manifest)?,
                create_database: *create_database,
                environment: environment.clone(),
                description: description.clone(),
                dry_run: *dry_run,
            })?;
            if response.registered {
                println!("✅ Registered {} ({})", database, response.database_id);
            }
            if response.created_database {
                println!("✅ Created database");
            }
            print_deployment(&response.deployment);
            if response.seeds_applied > 0 {
                println!("✅ Applied {} seed statements", response.seeds_applied);
            }
            Ok(deployment_code(&response.deployment))
        }

        RemoteCommand::History {
            database,
            limit,
            offset,
        } => {
            let page = client.history(&HistoryRequest {
                database: database.clone(),
                limit: *limit,
                offset: *offset,
            })?;
            println!("\n📜 Deployments of {} ({} total)\n", database, page.total_count);
            for entry in &page.deployments {
                let deployment = &entry.deployment;
                let when = deployment
                    .applied_at
                    .unwrap_or(deployment.created_at)
                    .format("%Y-%m-%d %H:%M:%S");
                println!(
                    "  {} {} {} by {} ({} migrations, {}ms)",
                    when,
                    deployment.version,
                    deployment.status,
                    deployment.applied_by.as_deref().unwrap_or("unknown"),
                    entry.migrations.len(),
                    deployment.execution_time_ms
                );
                if let Some(error) = &deployment.error_message {
                    println!("      {}", error.red());
                }
            }
            if page.has_more {
                println!("\n  ... more with --offset {}", offset + page.deployments.len() as i64);
            }
            Ok(exit_code::OK)
        }
    }
}
