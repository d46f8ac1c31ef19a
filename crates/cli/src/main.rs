//! changekit command-line tool.
//!
//! Thin front end over `changekit-core`: stores snapshots, logs changes,
//! creates and advances branches, lists merge intents, and records or
//! inspects conflicts. Also generates and validates configuration files.

mod style;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use changekit_core::config::KernelConfig;
use changekit_core::conflict::Divergence;
use changekit_core::db::Database;
use changekit_core::{DatabaseError, NewChange};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// changekit command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "changekit",
    version,
    about = "Record entity changes, branch them, and track conflicts"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `<config dir>/changekit/config.toml` when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./changekit.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Store snapshots.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Append changes to the log.
    Change {
        #[command(subcommand)]
        action: ChangeAction,
    },

    /// Manage branches and their pointer tables.
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// List branches pending merge into a target branch.
    Intents {
        /// Target branch ID.
        target: String,
    },

    /// Record and inspect change conflicts.
    Conflicts {
        #[command(subcommand)]
        action: ConflictsAction,
    },

    /// Compare two branches and report the entities they disagree on.
    Detect {
        /// Source branch ID.
        source: String,
        /// Target branch ID.
        target: String,
        /// Record every divergence as a conflict.
        #[arg(long)]
        record: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotAction {
    /// Store a JSON document and print its content id.
    Put {
        /// JSON content.
        json: String,
    },
}

#[derive(Subcommand, Debug)]
enum ChangeAction {
    /// Record a change.
    Add {
        #[arg(long)]
        file: String,
        #[arg(long)]
        entity: String,
        /// Schema or kind of the entity.
        #[arg(long = "type")]
        change_type: String,
        /// Producer of the change.
        #[arg(long)]
        plugin: String,
        /// Snapshot ID (use `no-content` for deletions).
        #[arg(long)]
        snapshot: String,
        /// Actor to record as the author.
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BranchAction {
    /// Create a branch, optionally forked from a parent.
    Create {
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List all branches.
    List,
    /// Show the pointer table of a branch.
    Pointers {
        /// Branch ID.
        id: String,
    },
    /// Apply changes to a branch, in order, all or nothing.
    Apply {
        /// Branch ID.
        branch: String,
        /// Change IDs.
        #[arg(required = true)]
        changes: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConflictsAction {
    /// Create or grow the conflict identified by a key.
    Create {
        key: String,
        /// Conflicting change IDs.
        #[arg(required = true)]
        changes: Vec<String>,
    },
    /// List all conflicts.
    List,
    /// Show details of a specific conflict.
    Show {
        /// Conflict ID.
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if e
                .downcast_ref::<DatabaseError>()
                .is_some_and(DatabaseError::is_retryable)
            {
                eprintln!("{}", style::warn("the database was busy; retry the command"));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("warn"));
        return cmd_init(output);
    }

    let config_path = cli.config.clone().or_else(default_config_path);
    let mut config = load_config(cli.config.as_deref(), config_path.as_deref())?;
    if let Some(path) = cli.database {
        config.database.path = path;
    }
    init_logging(
        cli.log_level
            .as_deref()
            .unwrap_or(config.logging.level.as_str()),
    );

    if let Commands::Validate = cli.command {
        return cmd_validate(config_path.as_deref(), &config);
    }

    let db = open_database(&config)?;
    match cli.command {
        Commands::Snapshot { action } => cmd_snapshot(&db, action),
        Commands::Change { action } => cmd_change(&db, action),
        Commands::Branch { action } => cmd_branch(&db, action),
        Commands::Intents { target } => cmd_intents(&db, &target),
        Commands::Conflicts { action } => cmd_conflicts(&db, action),
        Commands::Detect {
            source,
            target,
            record,
        } => cmd_detect(&db, &source, &target, record),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("changekit").join("config.toml"))
}

/// An explicit `--config` must exist; the default location is optional.
fn load_config(explicit: Option<&Path>, resolved: Option<&Path>) -> Result<KernelConfig> {
    let path = match (explicit, resolved) {
        (Some(path), _) => path,
        (None, Some(path)) if path.exists() => path,
        _ => return Ok(KernelConfig::default()),
    };
    KernelConfig::load_and_validate(path).context("failed to load configuration file")
}

fn open_database(config: &KernelConfig) -> Result<Database> {
    let db = Database::open(&config.database).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    tracing::debug!(path = %config.database.path.display(), "database ready");
    Ok(db)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_db = KernelConfig::default().database.path;
    let default_config = format!(
        r#"# changekit configuration

[database]
path = "{}"
busy_timeout_ms = 5000
wal = true

[logging]
level = "info"
"#,
        default_db.display()
    );

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!(
        "  Validate with: changekit validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(path: Option<&Path>, config: &KernelConfig) -> Result<()> {
    match path {
        Some(p) if p.exists() => println!("Validating configuration: {}", p.display()),
        _ => println!("No configuration file found; checking built-in defaults"),
    }
    println!();

    config.validate().context("configuration validation failed")?;
    println!("  [OK] All fields are valid");

    println!();
    println!("{}", style::header("Configuration summary:"));
    println!("  Database path : {}", config.database.path.display());
    println!("  Busy timeout  : {}ms", config.database.busy_timeout_ms);
    println!("  WAL           : {}", config.database.wal);
    println!("  Log level     : {}", config.logging.level);

    Ok(())
}

fn cmd_snapshot(db: &Database, action: SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::Put { json } => {
            let value: serde_json::Value =
                serde_json::from_str(&json).context("snapshot content is not valid JSON")?;
            let snapshot = db
                .create_snapshot(&value)
                .context("failed to store snapshot")?;
            println!("{}", snapshot.id);
            Ok(())
        }
    }
}

fn cmd_change(db: &Database, action: ChangeAction) -> Result<()> {
    match action {
        ChangeAction::Add {
            file,
            entity,
            change_type,
            plugin,
            snapshot,
            actor,
        } => {
            let new = NewChange::new(file, entity, change_type, plugin, snapshot);
            let change = db
                .insert_change(&new, actor.as_deref())
                .context("failed to record change")?;
            println!("{}", change.id);
            Ok(())
        }
    }
}

fn cmd_branch(db: &Database, action: BranchAction) -> Result<()> {
    match action {
        BranchAction::Create { parent, name } => {
            let branch = db
                .create_branch(parent.as_deref(), name.as_deref())
                .context("failed to create branch")?;
            println!("{}", branch.id);
            Ok(())
        }

        BranchAction::List => {
            let branches = db.list_branches().context("failed to list branches")?;
            if branches.is_empty() {
                println!("No branches found.");
                return Ok(());
            }

            let mut table = new_table(&["ID", "Name", "Created"]);
            for b in &branches {
                table.add_row(vec![
                    Cell::new(&b.id),
                    Cell::new(b.name.as_deref().unwrap_or("-")),
                    Cell::new(&b.created_at),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        BranchAction::Pointers { id } => {
            let pointers = db.list_pointers(&id).context("failed to list pointers")?;
            if pointers.is_empty() {
                println!("Branch {} has no pointers.", id);
                return Ok(());
            }

            let mut table = new_table(&["File", "Entity", "Type", "Change"]);
            for p in &pointers {
                table.add_row(vec![
                    Cell::new(&p.change_file_id),
                    Cell::new(&p.change_entity_id),
                    Cell::new(&p.change_type),
                    Cell::new(&p.change_id),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        BranchAction::Apply { branch, changes } => {
            let pointers = db
                .apply_changes(&branch, &changes)
                .context("failed to apply changes")?;
            println!(
                "{}",
                style::success(&format!(
                    "{} change(s) applied to {}",
                    pointers.len(),
                    branch
                ))
            );
            Ok(())
        }
    }
}

fn cmd_intents(db: &Database, target: &str) -> Result<()> {
    let intents = db
        .list_intents(target)
        .context("failed to list merge intents")?;
    if intents.is_empty() {
        println!("No branches pending merge into {}.", target);
        return Ok(());
    }
    for intent in &intents {
        println!("{} -> {}", intent.source_branch_id, intent.target_branch_id);
    }
    Ok(())
}

fn cmd_conflicts(db: &Database, action: ConflictsAction) -> Result<()> {
    match action {
        ConflictsAction::Create { key, changes } => {
            let ids: BTreeSet<String> = changes.into_iter().collect();
            let conflict = db
                .create_change_conflict(&key, &ids)
                .context("failed to record conflict")?;
            println!("{}", conflict.id);
            Ok(())
        }

        ConflictsAction::List => {
            let conflicts = db.list_conflicts().context("failed to list conflicts")?;
            if conflicts.is_empty() {
                println!("No conflicts found.");
                return Ok(());
            }

            let mut table = new_table(&["ID", "Key", "Changes", "Created"]);
            for c in &conflicts {
                let elements = db
                    .list_conflict_elements(&c.id)
                    .context("failed to list conflict elements")?;
                table.add_row(vec![
                    Cell::new(&c.id),
                    Cell::new(&c.key),
                    Cell::new(elements.len()),
                    Cell::new(&c.created_at),
                ]);
            }
            println!("{table}");
            println!("{}", style::dim(&format!("{} conflict(s)", conflicts.len())));
            Ok(())
        }

        ConflictsAction::Show { id } => {
            let conflict = db.get_conflict(&id).context("failed to load conflict")?;
            let elements = db
                .list_conflict_elements(&conflict.id)
                .context("failed to list conflict elements")?;

            println!("{}", style::header(&format!("Conflict: {}", conflict.id)));
            println!();
            println!("  Key        : {}", conflict.key);
            println!("  Created at : {}", conflict.created_at);
            println!("  Changes    :");
            for change_id in &elements {
                match db.get_change(change_id) {
                    Ok(change) => println!(
                        "    {}  {}/{} ({})",
                        change.id, change.file_id, change.entity_id, change.snapshot_id
                    ),
                    Err(_) => println!("    {}", change_id),
                }
            }
            Ok(())
        }
    }
}

fn cmd_detect(db: &Database, source: &str, target: &str, record: bool) -> Result<()> {
    if !record {
        let divergences = db
            .detect_divergence(source, target)
            .context("failed to compare branches")?;
        let rows: Vec<_> = divergences.iter().map(|d| (d, None::<&str>)).collect();
        print_divergences(&rows);
        return Ok(());
    }

    // One pass: what is printed is exactly what was recorded.
    let recorded = db
        .record_divergences(source, target)
        .context("failed to record divergences")?;
    let rows: Vec<_> = recorded
        .iter()
        .map(|r| (&r.divergence, Some(r.conflict.id.as_str())))
        .collect();
    print_divergences(&rows);
    if !recorded.is_empty() {
        println!(
            "{}",
            style::success(&format!("{} conflict(s) recorded", recorded.len()))
        );
    }
    Ok(())
}

fn print_divergences(rows: &[(&Divergence, Option<&str>)]) {
    if rows.is_empty() {
        println!("{}", style::success("No divergences."));
        return;
    }

    let mut table = new_table(&["File", "Entity", "Kind", "Source", "Target", "Conflict"]);
    for (d, conflict_id) in rows {
        table.add_row(vec![
            Cell::new(&d.file_id),
            Cell::new(&d.entity_id),
            Cell::new(d.kind),
            Cell::new(&d.source_change_id),
            Cell::new(&d.target_change_id),
            Cell::new(conflict_id.unwrap_or("-")),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.to_vec());
    table
}
