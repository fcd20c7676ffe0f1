//! vaultline CLI - operator interface to a secret store.
//!
//! The ledger backend is resolved by name through the storage registry;
//! `sqlite` (the default) keeps the ledger at `--db`.
//!
//! Root keys are sealed by a local KMS whose master key is derived from a
//! passphrase. The KMS manifest (salt, KDF parameters, verification blob)
//! lives next to the database as `<db>.kms.json`.

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use vaultline_common::{
    Actor, CommitId, EnvironmentId, FolderPath, FolderRef, OrgId, ProjectId, SecretRef,
    SensitiveBytes, VersionId,
};
use vaultline_crypto::KdfParams;
use vaultline_keys::LocalKmsManifest;
use vaultline_storage::{create_default_registry, LedgerStore};
use vaultline_vault::{DiffOptions, MutationOutcome, SecretStore, StoreConfig};

#[derive(Parser)]
#[command(name = "vaultline")]
#[command(about = "vaultline - Versioned multi-tenant secret store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the ledger database.
    #[arg(long, env = "VAULTLINE_DB", global = true)]
    db: Option<PathBuf>,

    /// Ledger backend (sqlite or memory).
    #[arg(long, env = "VAULTLINE_BACKEND", default_value = "sqlite", global = true)]
    backend: String,

    /// Optional JSON store configuration.
    #[arg(long, env = "VAULTLINE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Actor recorded on every mutation.
    #[arg(long, env = "VAULTLINE_ACTOR", default_value = "user:cli", global = true)]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

/// Locates a folder.
#[derive(Args, Clone)]
struct FolderArgs {
    /// Project id.
    #[arg(short, long)]
    project: String,

    /// Environment id.
    #[arg(short, long, default_value = "dev")]
    env: String,

    /// Folder path within the environment.
    #[arg(short, long, default_value = "/")]
    folder: String,
}

impl FolderArgs {
    fn folder_ref(&self) -> Result<FolderRef> {
        Ok(FolderRef::new(
            ProjectId::new(&self.project).context("Invalid project id")?,
            EnvironmentId::new(&self.env).context("Invalid environment id")?,
            FolderPath::parse(&self.folder).context("Invalid folder path")?,
        ))
    }

    fn secret_ref(&self, key: &str) -> Result<SecretRef> {
        self.folder_ref()?
            .secret(key)
            .context("Invalid secret key name")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the key manifest and database.
    Init {
        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "moderate")]
        strength: String,
    },

    /// Organization management.
    Org {
        #[command(subcommand)]
        command: OrgCommands,
    },

    /// Project management.
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Create or update a secret. Reads the value from stdin when omitted.
    Set {
        #[command(flatten)]
        folder: FolderArgs,

        /// Secret key name.
        key: String,

        /// Secret value.
        value: Option<String>,
    },

    /// Print a secret's value.
    Get {
        #[command(flatten)]
        folder: FolderArgs,

        /// Secret key name.
        key: String,

        /// Read the value as of this commit.
        #[arg(long, conflicts_with = "version")]
        at: Option<String>,

        /// Read this specific version.
        #[arg(long)]
        version: Option<String>,
    },

    /// Delete a secret. History is kept.
    Rm {
        #[command(flatten)]
        folder: FolderArgs,

        /// Secret key name.
        key: String,
    },

    /// List live secrets in a folder.
    Ls {
        #[command(flatten)]
        folder: FolderArgs,
    },

    /// Show a secret's version history.
    History {
        #[command(flatten)]
        folder: FolderArgs,

        /// Secret key name.
        key: String,
    },

    /// Restore a secret's content from an earlier version.
    Rollback {
        #[command(flatten)]
        folder: FolderArgs,

        /// Secret key name.
        key: String,

        /// Version to restore.
        version: String,
    },

    /// List a folder's commits.
    Commits {
        #[command(flatten)]
        folder: FolderArgs,
    },

    /// Compare the folder state at two commits.
    Diff {
        from: String,
        to: String,

        /// Hide modifications whose content did not change.
        #[arg(long)]
        suppress_unchanged: bool,
    },

    /// Undo a commit by restoring the secrets it touched.
    Revert { commit: String },

    /// Rotate an organization's root key.
    RotateRoot {
        org: String,

        /// Also delete retired root keys past their grace window.
        #[arg(long)]
        purge: bool,
    },

    /// Rotate a project's data key and re-encrypt its secrets.
    RotateDek {
        project: String,

        /// Only report rotation progress.
        #[arg(long)]
        status: bool,

        /// Continue an interrupted rotation without starting a new key.
        #[arg(long, conflicts_with = "status")]
        resume: bool,
    },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum OrgCommands {
    /// Provision an organization root key.
    Init { org: String },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Register a project under an organization.
    Init { org: String, project: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: failed to install logger: {}", e);
    }

    if let Err(err) = run(cli).await {
        debug!(error = ?err, "Command failed");
        eprintln!("Error: {}", render_error(&err));
        std::process::exit(1);
    }
}

/// Render an error chain for the terminal. Store errors are shown through
/// their public message, which omits key ids and backend details.
fn render_error(err: &anyhow::Error) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<vaultline_common::Error>() {
            parts.push(store_err.public_message());
            break;
        }
        parts.push(cause.to_string());
    }
    parts.join(": ")
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "vaultline",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let db = database_path(cli.db.as_deref())?;
    if let Commands::Init { strength } = &cli.command {
        return cmd_init(&cli.backend, &db, strength).await;
    }

    let store = open_store(&cli.backend, &db, cli.config.as_deref()).await?;
    let actor = Actor::new(&cli.actor).context("Invalid actor")?;

    match cli.command {
        Commands::Org {
            command: OrgCommands::Init { org },
        } => cmd_org_init(&store, &org).await,

        Commands::Project {
            command: ProjectCommands::Init { org, project },
        } => cmd_project_init(&store, &org, &project).await,

        Commands::Set { folder, key, value } => {
            cmd_set(&store, &actor, &folder, &key, value).await
        }

        Commands::Get {
            folder,
            key,
            at,
            version,
        } => cmd_get(&store, &folder, &key, at.as_deref(), version.as_deref()).await,

        Commands::Rm { folder, key } => cmd_rm(&store, &actor, &folder, &key).await,

        Commands::Ls { folder } => cmd_ls(&store, &folder).await,

        Commands::History { folder, key } => cmd_history(&store, &folder, &key).await,

        Commands::Rollback {
            folder,
            key,
            version,
        } => cmd_rollback(&store, &actor, &folder, &key, &version).await,

        Commands::Commits { folder } => cmd_commits(&store, &folder).await,

        Commands::Diff {
            from,
            to,
            suppress_unchanged,
        } => cmd_diff(&store, &from, &to, suppress_unchanged).await,

        Commands::Revert { commit } => cmd_revert(&store, &actor, &commit).await,

        Commands::RotateRoot { org, purge } => cmd_rotate_root(&store, &org, purge).await,

        Commands::RotateDek {
            project,
            status,
            resume,
        } => cmd_rotate_dek(&store, &project, status, resume).await,

        Commands::Init { .. } | Commands::Completions { .. } => Ok(()),
    }
}

fn database_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let base = dirs::data_dir().context("Could not determine data directory; pass --db")?;
    Ok(base.join("vaultline").join("ledger.db"))
}

fn manifest_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_os_string();
    name.push(".kms.json");
    PathBuf::from(name)
}

/// Read the master passphrase from the environment or prompt for it.
fn passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var("VAULTLINE_MASTER_PASSPHRASE") {
        return Ok(Zeroizing::new(value));
    }
    let value = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(Zeroizing::new(value))
}

fn open_ledger(backend: &str, db: &Path) -> Result<Arc<dyn LedgerStore>> {
    let registry = create_default_registry().context("Failed to set up storage backends")?;
    registry
        .resolve(backend, serde_json::json!({ "path": db.to_string_lossy() }))
        .with_context(|| format!("Failed to open {} ledger", backend))
}

async fn open_store(backend: &str, db: &Path, config: Option<&Path>) -> Result<SecretStore> {
    let manifest_path = manifest_path(db);
    let manifest_json = tokio::fs::read_to_string(&manifest_path)
        .await
        .with_context(|| {
            format!(
                "No key manifest at {}; run `vaultline init` first",
                manifest_path.display()
            )
        })?;
    let manifest = LocalKmsManifest::from_json(&manifest_json).context("Corrupt key manifest")?;

    let passphrase = passphrase("Master passphrase: ")?;
    let kms = manifest
        .unlock(passphrase.as_bytes())
        .context("Failed to unlock key manifest")?;

    let config = match config {
        Some(path) => StoreConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    let ledger = open_ledger(backend, db)?;
    SecretStore::builder(ledger, Arc::new(kms))
        .with_config(config)
        .build()
        .context("Failed to build store")
}

/// Print the non-applied outcomes; returns the applied value if any.
fn applied<T>(outcome: MutationOutcome<T>) -> Result<Option<T>> {
    match outcome {
        MutationOutcome::Applied(value) => Ok(Some(value)),
        MutationOutcome::PendingApproval { request_id } => {
            println!("Pending approval (request {})", request_id);
            Ok(None)
        }
        MutationOutcome::Denied { policy, reason } => {
            anyhow::bail!("Denied by policy {}: {}", policy, reason)
        }
    }
}

/// Create the key manifest and an empty database.
async fn cmd_init(backend: &str, db: &Path, strength: &str) -> Result<()> {
    let kdf_params = match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        _ => {
            anyhow::bail!("Invalid strength. Use: interactive, moderate, or sensitive");
        }
    };

    let manifest_path = manifest_path(db);
    if manifest_path.exists() {
        anyhow::bail!("Key manifest already exists at {}", manifest_path.display());
    }

    let passphrase = passphrase("New master passphrase: ")?;
    if std::env::var("VAULTLINE_MASTER_PASSPHRASE").is_err() {
        let confirm = Zeroizing::new(
            rpassword::prompt_password("Confirm master passphrase: ")
                .context("Failed to read passphrase")?,
        );
        if *passphrase != *confirm {
            anyhow::bail!("Passphrases do not match");
        }
    }
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase cannot be empty");
    }

    if let Some(parent) = db.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create database directory")?;
    }
    let (manifest, _kms) = LocalKmsManifest::create(passphrase.as_bytes(), kdf_params)
        .context("Failed to create key manifest")?;
    tokio::fs::write(&manifest_path, manifest.to_json()?)
        .await
        .context("Failed to write key manifest")?;
    open_ledger(backend, db)?;

    info!(db = %db.display(), "Store initialized");
    println!("Store initialized");
    println!("  Database: {}", db.display());
    println!("  Key manifest: {}", manifest_path.display());
    Ok(())
}

async fn cmd_org_init(store: &SecretStore, org: &str) -> Result<()> {
    let org = OrgId::new(org).context("Invalid organization id")?;
    let root_key = store
        .provision_org(&org)
        .await
        .context("Failed to provision organization")?;
    println!("Organization {} provisioned (root key {})", org, root_key);
    Ok(())
}

async fn cmd_project_init(store: &SecretStore, org: &str, project: &str) -> Result<()> {
    let org = OrgId::new(org).context("Invalid organization id")?;
    let project = ProjectId::new(project).context("Invalid project id")?;
    let keyring = store
        .register_project(&org, &project)
        .await
        .context("Failed to register project")?;
    println!(
        "Project {} registered under {} (data key {})",
        project, org, keyring.current_dek
    );
    Ok(())
}

async fn cmd_set(
    store: &SecretStore,
    actor: &Actor,
    folder: &FolderArgs,
    key: &str,
    value: Option<String>,
) -> Result<()> {
    let secret = folder.secret_ref(key)?;
    let value = match value {
        Some(value) => Zeroizing::new(value),
        None => {
            let mut buf = Zeroizing::new(String::new());
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read value from stdin")?;
            Zeroizing::new(buf.trim_end_matches(['\r', '\n']).to_string())
        }
    };
    let value = SensitiveBytes::new(value.as_bytes().to_vec());

    let outcome = match store.update(&secret, value.clone(), actor).await {
        Err(vaultline_common::Error::NotFound(_)) => store.create(&secret, value, actor).await,
        other => other,
    }
    .with_context(|| format!("Failed to write {}", secret))?;

    if let Some(receipt) = applied(outcome)? {
        println!(
            "{} -> version {} (seq {}, commit {})",
            secret, receipt.version, receipt.seq, receipt.commit
        );
    }
    Ok(())
}

async fn cmd_get(
    store: &SecretStore,
    folder: &FolderArgs,
    key: &str,
    at: Option<&str>,
    version: Option<&str>,
) -> Result<()> {
    let secret = folder.secret_ref(key)?;
    let value = match (at, version) {
        (Some(commit), _) => {
            let commit: CommitId = commit.parse().context("Invalid commit id")?;
            store.read_at(&secret, &commit).await
        }
        (None, Some(version)) => {
            let version: VersionId = version.parse().context("Invalid version id")?;
            store.read_version(&secret, &version).await
        }
        (None, None) => store.read(&secret).await,
    }
    .with_context(|| format!("Failed to read {}", secret))?;

    println!("{}", String::from_utf8_lossy(value.as_bytes()));
    Ok(())
}

async fn cmd_rm(store: &SecretStore, actor: &Actor, folder: &FolderArgs, key: &str) -> Result<()> {
    let secret = folder.secret_ref(key)?;
    let outcome = store
        .delete(&secret, actor)
        .await
        .with_context(|| format!("Failed to delete {}", secret))?;
    if let Some(receipt) = applied(outcome)? {
        println!("{} deleted (commit {})", secret, receipt.commit);
    }
    Ok(())
}

async fn cmd_ls(store: &SecretStore, folder: &FolderArgs) -> Result<()> {
    let folder = folder.folder_ref()?;
    let secrets = store
        .list_secrets(&folder)
        .await
        .context("Failed to list secrets")?;

    if secrets.is_empty() {
        println!("Folder is empty.");
    } else {
        println!("Secrets in {}:", folder);
        for entry in secrets {
            println!(
                "  {}  (seq {}, updated {})",
                entry.name,
                entry.seq,
                entry.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn cmd_history(store: &SecretStore, folder: &FolderArgs, key: &str) -> Result<()> {
    let secret = folder.secret_ref(key)?;
    let history = store
        .history(&secret)
        .await
        .with_context(|| format!("Failed to read history of {}", secret))?;

    println!("History of {}:", secret);
    for entry in history {
        let origin = serde_json::to_string(&entry.origin)?;
        println!(
            "  #{:<4} {}  {}  {}{}  {}",
            entry.seq,
            entry.version,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.actor,
            if entry.tombstone { "  [deleted]" } else { "" },
            origin
        );
    }
    Ok(())
}

async fn cmd_rollback(
    store: &SecretStore,
    actor: &Actor,
    folder: &FolderArgs,
    key: &str,
    version: &str,
) -> Result<()> {
    let secret = folder.secret_ref(key)?;
    let target: VersionId = version.parse().context("Invalid version id")?;
    let outcome = store
        .rollback(&secret, &target, actor)
        .await
        .with_context(|| format!("Failed to roll back {}", secret))?;
    if let Some(receipt) = applied(outcome)? {
        println!(
            "{} rolled back to {} as version {} (seq {})",
            secret, target, receipt.version, receipt.seq
        );
    }
    Ok(())
}

async fn cmd_commits(store: &SecretStore, folder: &FolderArgs) -> Result<()> {
    let folder = folder.folder_ref()?;
    let commits = store
        .list_commits(&folder)
        .await
        .context("Failed to list commits")?;

    if commits.is_empty() {
        println!("No commits in {}.", folder);
        return Ok(());
    }
    println!("Commits in {}:", folder);
    for commit in commits {
        println!(
            "  #{:<4} {}  {}  {}  {} change(s){}",
            commit.seq,
            commit.id,
            commit.created_at.format("%Y-%m-%d %H:%M:%S"),
            commit.actor,
            commit.members.len(),
            commit
                .message
                .as_deref()
                .map(|m| format!("  \"{}\"", m))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_diff(store: &SecretStore, from: &str, to: &str, suppress_unchanged: bool) -> Result<()> {
    let from: CommitId = from.parse().context("Invalid commit id")?;
    let to: CommitId = to.parse().context("Invalid commit id")?;
    let entries = store
        .compare_folder_states(&from, &to, DiffOptions { suppress_unchanged })
        .await
        .context("Failed to compare commits")?;

    if entries.is_empty() {
        println!("No changes.");
    }
    for entry in entries {
        let kind = serde_json::to_value(entry.kind)?;
        println!(
            "  {:<10} {}",
            kind.as_str().unwrap_or("?"),
            entry
                .name
                .unwrap_or_else(|| format!("<secret {}>", entry.secret))
        );
    }
    Ok(())
}

async fn cmd_revert(store: &SecretStore, actor: &Actor, commit: &str) -> Result<()> {
    let commit: CommitId = commit.parse().context("Invalid commit id")?;
    let outcome = store
        .revert_commit(&commit, actor)
        .await
        .with_context(|| format!("Failed to revert {}", commit))?;
    if let Some(receipt) = applied(outcome)? {
        println!(
            "Reverted {} as commit {} ({} secret(s))",
            commit,
            receipt.commit,
            receipt.writes.len()
        );
    }
    Ok(())
}

async fn cmd_rotate_root(store: &SecretStore, org: &str, purge: bool) -> Result<()> {
    let org = OrgId::new(org).context("Invalid organization id")?;
    let root_key = store
        .rotate_root_key(&org)
        .await
        .context("Failed to rotate root key")?;
    println!("Root key rotated for {} (new key {})", org, root_key);

    if purge {
        let purged = store
            .purge_retired_root_keys(&org)
            .await
            .context("Failed to purge retired root keys")?;
        println!("Purged {} retired root key(s)", purged.len());
    }
    Ok(())
}

async fn cmd_rotate_dek(store: &SecretStore, project: &str, status: bool, resume: bool) -> Result<()> {
    let project = ProjectId::new(project).context("Invalid project id")?;
    let progress = if status {
        store.data_key_rotation_progress(&project).await
    } else if resume {
        store.resume_data_key_rotation(&project).await
    } else {
        store.rotate_data_key(&project).await
    }
    .context("Data key rotation failed")?;

    println!("Data key rotation for {}:", project);
    println!("  Current key: {}", progress.current_dek);
    println!("  Rotated: {}/{}", progress.rotated, progress.total);
    if !progress.unreadable.is_empty() {
        println!("  Unreadable: {}", progress.unreadable.len());
        for secret in &progress.unreadable {
            println!("    {}", secret);
        }
    }
    if !progress.is_complete() && !progress.is_exhausted() {
        println!("  Remaining: {} (run with --resume)", progress.remaining);
    }
    Ok(())
}
