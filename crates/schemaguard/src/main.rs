//! schemaguard CLI
//!
//! Command-line tool for planning and applying gated schema migrations
//! on tenant databases.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use schemaguard::prelude::*;
use schemaguard_core::diff::diff_schema;
use schemaguard_core::patch::render_report;
use schemaguard_core::snapshot::DbSnapshot;
use schemaguard_core::ssot::parse_ssot;

/// Gated, audited schema drift migrations.
#[derive(Parser)]
#[command(name = "schemaguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Tenant being migrated.
    #[arg(short, long, env = "SCHEMAGUARD_TENANT_ID")]
    tenant: Option<String>,

    /// Control database holding the audit trail.
    #[arg(long, env = "CONTROL_DATABASE_URL", hide_env_values = true)]
    control_database_url: Option<String>,

    /// Privileged connection string of the tenant database.
    #[arg(long, env = "TENANT_DATABASE_URL", hide_env_values = true)]
    tenant_database_url: Option<String>,

    /// SSOT setup script.
    #[arg(short, long, env = "SCHEMAGUARD_SSOT")]
    ssot: Option<PathBuf>,

    /// Table whose changes always need review (repeatable).
    #[arg(long = "locked-table", env = "SCHEMAGUARD_LOCKED_TABLES", value_delimiter = ',')]
    locked_tables: Vec<String>,

    /// Role granted EXECUTE on the privileged procedures.
    #[arg(long, env = "SCHEMAGUARD_SERVICE_ROLE", default_value = "service_role")]
    service_role: String,

    /// Log statements instead of executing them.
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the SQL that installs the privileged procedures.
    BootstrapSql,

    /// Diff the SSOT against a snapshot file, without any database.
    Diff {
        /// Introspection document (JSON).
        #[arg(long)]
        snapshot_file: PathBuf,

        /// Print the diff as JSON instead of Markdown.
        #[arg(long)]
        json: bool,
    },

    /// Plan against the live tenant schema and store the plan.
    Plan {
        /// Run preflight queries right away.
        #[arg(long)]
        preflight: bool,

        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the preflight queries of a stored plan.
    Preflight {
        /// Plan id.
        plan_id: Uuid,
    },

    /// Apply the SAFE statements of a stored plan.
    ApplySafe {
        /// Plan id.
        plan_id: Uuid,

        /// Approving operator.
        #[arg(long)]
        approver: String,
    },

    /// Apply the reviewed CAUTION and DESTRUCTIVE statements of a plan.
    ApplyDestructive {
        /// Plan id.
        plan_id: Uuid,

        /// Approving operator.
        #[arg(long)]
        approver: String,

        /// Must be exactly "ALLOW DESTRUCTIVE CHANGES".
        #[arg(long)]
        confirm: String,
    },

    /// Show the tenant's audit trail.
    History {
        /// Maximum number of records.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Create the audit table on the control database.
    InitAudit,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            tenant_id: self.tenant.clone(),
            control_database_url: self.control_database_url.clone(),
            tenant_database_url: self.tenant_database_url.clone(),
            ssot_path: self.ssot.clone(),
            locked_tables: self.locked_tables.clone(),
            service_role: self.service_role.clone(),
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = cli.settings();
    tracing::debug!(?settings, "Settings");

    if let Err(err) = run(cli.command, &settings).await {
        if let Some(MigrateError::NotBootstrapped {
            remediation_sql, ..
        }) = err.downcast_ref::<MigrateError>()
        {
            eprintln!("The tenant database is missing the schemaguard procedures.");
            eprintln!("Run the following SQL as a superuser, then retry:\n");
            println!("{remediation_sql}");
        }
        return Err(err);
    }
    Ok(())
}

async fn run(command: Commands, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Commands::BootstrapSql => {
            println!("{}", bootstrap_sql(&settings.service_role));
        }

        Commands::Diff {
            snapshot_file,
            json,
        } => {
            let ssot = tokio::fs::read_to_string(settings.require_ssot_path()?).await?;
            let snapshot: serde_json::Value =
                serde_json::from_str(&tokio::fs::read_to_string(&snapshot_file).await?)?;
            let expected = parse_ssot(&ssot)?;
            let diff = diff_schema(
                &expected,
                &DbSnapshot::from_json(&snapshot)?,
                &settings.diff_policy(),
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&diff)?);
            } else {
                print!("{}", render_report(&diff));
            }
        }

        Commands::InitAudit => {
            let pool = settings.connect_control().await?;
            info!("Creating audit table...");
            PgAuditStore::new(pool.clone()).init().await?;
            pool.close().await;
            info!("Audit table created successfully.");
        }

        command => {
            let tenant_id = settings.require_tenant_id()?.to_string();
            let ssot = SsotFile::new(settings.require_ssot_path()?);
            let audit = PgAuditStore::new(settings.connect_control().await?);
            let backend = Arc::new(PgBackend::new(
                settings.connect_tenant().await?,
                settings.service_role.clone(),
            ));
            let executor = Executor::new(backend.clone()).dry_run(settings.dry_run);
            if settings.dry_run {
                info!("Dry run mode - SQL will be logged but not executed.");
            }
            let service = MigrationService::new(
                tenant_id,
                Arc::new(ssot),
                executor,
                Planner::new(settings.diff_policy()),
                Arc::new(audit),
            );

            let result = run_tenant(command, &service).await;
            backend.close().await;
            result?;
        }
    }

    Ok(())
}

async fn run_tenant(command: Commands, service: &MigrationService) -> anyhow::Result<()> {
    match command {
        Commands::Plan { preflight, json } => {
            let report = service.create_plan(preflight).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_plan(&report);
            }
        }

        Commands::Preflight { plan_id } => {
            let results = service.run_preflight(plan_id).await?;
            print_query_outcomes(&results);
        }

        Commands::ApplySafe { plan_id, approver } => {
            let report = service.apply_safe(plan_id, &approver).await?;
            print_apply(&report);
        }

        Commands::ApplyDestructive {
            plan_id,
            approver,
            confirm,
        } => {
            let report = service
                .apply_destructive(plan_id, &approver, &confirm)
                .await?;
            print_apply(&report);
        }

        Commands::History { limit } => {
            let records = service.history(limit).await?;
            if records.is_empty() {
                info!("No plans recorded for tenant {}.", service.tenant_id());
            } else {
                println!("\nPlans for tenant {}:", service.tenant_id());
                println!("{:-<60}", "");
                for record in &records {
                    println!(
                        " {} {:<8} {} safe={} caution={} destructive={}{}",
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        record.status.as_str(),
                        record.id,
                        record.summary_counts.safe,
                        record.summary_counts.caution,
                        record.summary_counts.destructive,
                        record
                            .approver_id
                            .as_deref()
                            .map(|a| format!(" by {a}"))
                            .unwrap_or_default(),
                    );
                }
                println!();
            }
        }

        Commands::BootstrapSql | Commands::Diff { .. } | Commands::InitAudit => {
            unreachable!("handled without a tenant connection")
        }
    }
    Ok(())
}

fn print_plan(report: &PlanReport) {
    let plan = &report.plan;
    let counts = plan.summary_counts();
    println!("Plan {}", plan.plan_id());
    println!("  SSOT hash:     {}", plan.ssot_version_hash());
    println!("  Snapshot hash: {}", plan.db_snapshot_hash_before());
    println!(
        "  Changes:       {} SAFE, {} CAUTION, {} DESTRUCTIVE",
        counts.safe, counts.caution, counts.destructive
    );
    if plan.is_empty() {
        println!("\nNo drift detected.");
        return;
    }

    println!();
    for change in plan.changes() {
        println!(" [{:<11}] {}", change.risk_level.label(), change.title);
    }

    let artifacts = plan.artifacts();
    if !artifacts.patch_sql_safe.is_empty() {
        println!("\n-- SAFE patch\n{}", artifacts.patch_sql_safe);
    }
    if !artifacts.manual_sql.is_empty() {
        println!("\n-- Manual review\n{}", artifacts.manual_sql);
    }
    if !artifacts.manual_steps.is_empty() {
        println!("\n{}", artifacts.manual_steps);
    }
    if let Some(results) = &report.preflight_results {
        println!();
        print_query_outcomes(results);
    }
}

fn print_query_outcomes(results: &[QueryOutcome]) {
    if results.is_empty() {
        println!("No preflight queries.");
        return;
    }
    for outcome in results {
        if outcome.ok {
            let rows = serde_json::to_string(&outcome.rows).unwrap_or_default();
            println!(" [ok]   {}\n        {rows}", outcome.query);
        } else {
            let message = outcome
                .error
                .as_ref()
                .map_or("unknown error", |e| e.message.as_str());
            println!(" [fail] {}\n        {message}", outcome.query);
        }
    }
}

fn print_apply(report: &ApplyReport) {
    let mode = if report.dry_run { " (dry run)" } else { "" };
    println!("Plan {} {}{mode}", report.plan_id, report.status);
    for outcome in &report.results {
        match &outcome.error {
            None => println!(" [ok]   {}", outcome.statement),
            Some(error) => println!(
                " [fail] {}\n        {}{}",
                outcome.statement,
                error.message,
                error
                    .code
                    .as_deref()
                    .map(|c| format!(" (SQLSTATE {c})"))
                    .unwrap_or_default()
            ),
        }
    }
    if let Some(hash) = &report.snapshot_hash_after {
        println!("  Snapshot hash after: {hash}");
    }
    if report.failures() > 0 {
        println!("{} of {} statements failed.", report.failures(), report.results.len());
    }
}
