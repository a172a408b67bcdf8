//! IdMigrate command-line tool.
//!
//! Migrates users, roles, permissions, and organizations from an Auth0
//! tenant (API or export file) into a Descope project. Provides `run`,
//! `init`, and `validate` subcommands; every run writes an append-only
//! per-run log file enumerating each failure and merge decision.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use idmigrate_core::config::AppConfig;
use idmigrate_core::destination::{Destination, DescopeClient, DryRunDestination};
use idmigrate_core::engine::{CancelToken, MigrationEngine, MigrationOptions};
use idmigrate_core::report::MigrationReport;
use idmigrate_core::retry::{RetryPolicy, TokioSleeper};
use idmigrate_core::source::Auth0Client;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// IdMigrate command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "idmigrate",
    version,
    about = "Migrate Auth0 users, roles, permissions, and organizations to Descope"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./idmigrate.toml")]
    config: PathBuf,

    /// Enable verbose console output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the migration.
    Run {
        /// Load users from this export file instead of the Auth0 API.
        #[arg(long, value_name = "file-path")]
        from_json: Option<PathBuf>,

        /// Merge password hashes from this export file.
        #[arg(long, value_name = "file-path")]
        with_passwords: Option<PathBuf>,

        /// Execute the full pipeline without writing to Descope.
        #[arg(long)]
        dry_run: bool,

        /// Records per batch call (overrides the config file).
        #[arg(long, value_name = "n")]
        batch_size: Option<usize>,

        /// Skip roles and permissions migration.
        #[arg(long)]
        skip_roles: bool,

        /// Skip organizations/tenants migration.
        #[arg(long)]
        skip_orgs: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./idmigrate.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Run {
            from_json,
            with_passwords,
            dry_run,
            batch_size,
            skip_roles,
            skip_orgs,
        } => {
            let options = MigrationOptions {
                users_file: from_json,
                passwords_file: with_passwords,
                skip_roles,
                skip_orgs,
            };
            cmd_run(&cli.config, options, dry_run, batch_size, cli.verbose).await
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: &PathBuf,
    options: MigrationOptions,
    dry_run: bool,
    batch_size_override: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let mut config =
        AppConfig::load_from_file(config_path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    if let Some(batch_size) = batch_size_override {
        anyhow::ensure!(batch_size >= 1, "--batch-size must be >= 1");
        config.migration.batch_size = batch_size;
        println!("Using batch size: {}", batch_size);
    }
    config.validate().context("configuration validation failed")?;

    let report = MigrationReport::new(dry_run);
    let _log_guard = init_logging(&config, &report.run_id, verbose)?;

    tracing::info!(
        run_id = %report.run_id,
        dry_run,
        batch_size = config.migration.batch_size,
        "starting migration run"
    );

    // The Auth0 API is needed unless users come from a file AND both
    // API-backed stages are skipped.
    let needs_source =
        options.users_file.is_none() || !options.skip_roles || !options.skip_orgs;
    let auth0 = if needs_source {
        let token = config
            .auth0
            .token
            .clone()
            .with_context(|| format!("{} is not set", config.auth0.token_env))?;
        Some(Auth0Client::new(
            &config.auth0.domain,
            token,
            config.auth0.page_size,
        ))
    } else {
        None
    };

    // Operator interrupt: finish the in-flight call, then stop.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupt received; finishing the in-flight call before stopping...");
                cancel.cancel();
            }
        });
    }

    let report = if dry_run {
        let dest = DryRunDestination::new();
        let report = execute(&config, auth0.as_ref(), &dest, options, report, cancel).await?;
        print_dry_run_detail(&dest, verbose);
        report
    } else {
        let management_key = config
            .descope
            .management_key
            .clone()
            .with_context(|| format!("{} is not set", config.descope.management_key_env))?;
        let dest = DescopeClient::new(
            config.descope.api_url.as_str(),
            config.descope.project_id.as_str(),
            management_key,
        );
        execute(&config, auth0.as_ref(), &dest, options, report, cancel).await?
    };

    print_summary(&report);
    Ok(())
}

/// Drive the engine through its stages with console progress.
async fn execute<D: Destination>(
    config: &AppConfig,
    auth0: Option<&Auth0Client>,
    dest: &D,
    options: MigrationOptions,
    mut report: MigrationReport,
    cancel: CancelToken,
) -> Result<MigrationReport> {
    let engine = MigrationEngine::new(
        auth0,
        dest,
        config.migration.batch_size,
        RetryPolicy::from_config(&config.migration),
        TokioSleeper,
        options,
        cancel,
    );

    let spinner = stage_spinner("Loading source data...");
    let data = match engine.load(&mut report).await {
        Ok(data) => data,
        Err(e) => {
            spinner.finish_and_clear();
            return Err(anyhow::Error::new(e).context("failed to load source data"));
        }
    };
    spinner.finish_with_message(format!(
        "Loaded {} users, {} roles, {} organizations",
        data.users.len(),
        data.roles.len(),
        data.organizations.len()
    ));

    let spinner = stage_spinner("Migrating...");
    let result = engine.execute(&data, &mut report).await;
    spinner.finish_and_clear();

    match result {
        Ok(_) => {}
        Err(idmigrate_core::errors::MigrationError::Cancelled) => {
            println!(
                "{}",
                style("Run cancelled; partial results are accounted below.").yellow()
            );
        }
        Err(e) => return Err(anyhow::Error::new(e).context("migration failed")),
    }
    Ok(report)
}

fn stage_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .expect("valid progress template"),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Console layer plus the append-only per-run log file. The returned guard
/// must stay alive until exit so buffered log lines get flushed.
fn init_logging(
    config: &AppConfig,
    run_id: &str,
    verbose: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.logging.dir).context("failed to create log directory")?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let file_name = format!("migration_{}_{}.log", timestamp, run_id);
    let file_appender = tracing_appender::rolling::never(&config.logging.dir, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let console_filter =
        EnvFilter::try_new(&console_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time()
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(EnvFilter::new("info")),
        )
        .init();

    println!(
        "Logging to {}",
        config.logging.dir.join(&file_name).display()
    );
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_summary(report: &MigrationReport) {
    println!();
    if report.dry_run {
        println!(
            "{}",
            style("=== Migration Summary (dry run: would-create totals) ===").bold()
        );
    } else {
        println!("{}", style("=== Migration Summary ===").bold());
    }

    let mut table = Table::new();
    table.set_header(["Kind", "Attempted", "Created", "Merged", "Failed"]);
    for (label, c) in [
        ("Users", &report.users),
        ("Roles", &report.roles),
        ("Tenants", &report.tenants),
        ("Permissions", &report.permissions),
    ] {
        table.add_row([
            label.to_string(),
            c.attempted.to_string(),
            c.created.to_string(),
            c.merged.to_string(),
            c.failed.to_string(),
        ]);
    }
    println!("{table}");

    let mut edges = Table::new();
    edges.set_header(["Association", "Attempted", "Succeeded", "Skipped", "Failed"]);
    for (label, e) in [
        ("Role assignments", &report.role_assignments),
        ("Tenant memberships", &report.tenant_memberships),
        ("Permission attachments", &report.permission_attachments),
    ] {
        edges.add_row([
            label.to_string(),
            e.attempted.to_string(),
            e.succeeded.to_string(),
            e.skipped.to_string(),
            e.failed.to_string(),
        ]);
    }
    println!("{edges}");

    if report.malformed_skipped > 0 {
        println!(
            "Malformed export records skipped: {}",
            report.malformed_skipped
        );
    }
    if report.passwordless > 0 {
        println!(
            "Users migrated without a password (unsupported hash): {}",
            report.passwordless
        );
    }
    if report.unmatched_passwords > 0 {
        println!("Password records with no matching user: {}", report.unmatched_passwords);
    }

    if report.failures.is_empty() {
        println!("{}", style("No failures.").green());
    } else {
        println!(
            "{}",
            style(format!("{} failure(s); see the run log for details:", report.failures.len()))
                .red()
        );
        for failure in report.failures.iter().take(10) {
            println!("  [{}] {}: {}", failure.kind, failure.source_id, failure.reason);
        }
        if report.failures.len() > 10 {
            println!("  ... and {} more", report.failures.len() - 10);
        }
    }
}

fn print_dry_run_detail(dest: &DryRunDestination, verbose: bool) {
    println!(
        "Would migrate {} users, {} roles ({} permissions), {} tenants",
        dest.would_create_users(),
        dest.would_create_roles(),
        dest.would_create_permissions(),
        dest.would_create_tenants()
    );
    println!(
        "Would create {} role assignments and {} tenant memberships",
        dest.would_assign_roles(),
        dest.would_add_memberships()
    );
    if verbose {
        for login in dest.user_logins() {
            println!("\tUser: {}", login);
        }
        for role in dest.role_names() {
            println!("\tRole: {}", role);
        }
        for tenant in dest.tenant_names() {
            println!("\tTenant: {}", tenant);
        }
    }
}

// ---------------------------------------------------------------------------
// Init / validate
// ---------------------------------------------------------------------------

fn cmd_init(output: &PathBuf) -> Result<()> {
    let default_config = r#"# IdMigrate Configuration
# See documentation for all available options.

[auth0]
# Full management domain of the tenant being migrated.
domain = "your-tenant.us.auth0.com"
token_env = "AUTH0_TOKEN"
page_size = 20

[descope]
api_url = "https://api.descope.com"
project_id = "your-project-id"
management_key_env = "DESCOPE_MANAGEMENT_KEY"

[migration]
batch_size = 50
max_attempts = 5
backoff_base_ms = 1000
backoff_cap_ms = 60000

[logging]
dir = "logs"
level = "info"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your Auth0 and Descope details");
    println!("  2. Set the referenced environment variables (AUTH0_TOKEN, DESCOPE_MANAGEMENT_KEY)");
    println!(
        "  3. Validate with: idmigrate validate --config {}",
        output.display()
    );
    println!(
        "  4. Preview with: idmigrate run --dry-run --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let mut config = config;
    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Auth0 domain    : {}", config.auth0.domain);
    println!(
        "  Auth0 token     : {}",
        if config.auth0.token.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Descope project : {}", config.descope.project_id);
    println!(
        "  Management key  : {}",
        if config.descope.management_key.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  Batch size      : {}", config.migration.batch_size);
    println!("  Max attempts    : {}", config.migration.max_attempts);
    println!("  Log directory   : {}", config.logging.dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}
