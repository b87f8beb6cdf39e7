use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lockbox_core::api::{HttpRemote, Remote};
use lockbox_core::config::Config;
use lockbox_core::crypto::{self, StaticSecret};
use lockbox_core::engine::{self, SyncOutcome, SyncPrompt};
use lockbox_core::envelope::{self, UpdateOutcome};
use lockbox_core::error::{Error, ErrorCode};
use lockbox_core::keys::{self, KeyInfo};
use lockbox_core::otc::{self, Otc};
use lockbox_core::session::{self, AuthInfo, PasswordPrompt};
use lockbox_core::syncstore::SyncStore;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "End-to-end-encrypted file mailbox", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set up lockbox under a new or existing account
    Setup,

    /// Generate a one-time-code to set up lockbox on another machine
    Otc,

    /// Add a local file to your lockbox and keep it synchronized
    Add {
        /// Local file to add
        local: PathBuf,

        /// Remote name (defaults to the local file name)
        #[arg(long)]
        remote: Option<String>,
    },

    /// Clone a remote file onto this machine
    Clone {
        /// Remote file, '@someuser/somefile' for files owned by others
        remote: String,

        /// Local name for the clone (defaults to the remote file name)
        #[arg(long)]
        local: Option<PathBuf>,
    },

    /// Push local changes in a file to its remote
    Update {
        /// Local file to push
        file: PathBuf,
    },

    /// Synchronize clones in a directory (or one file) with their remotes
    Sync {
        /// Path to synchronize
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Share a file you own with other users
    Share {
        /// Remote file name
        file: String,

        /// Recipient usernames
        #[arg(required = true)]
        recipients: Vec<String>,
    },

    /// List the files in your lockbox
    Files,

    /// Show details about one remote file
    Info {
        /// Remote file, '@someuser/somefile' for files owned by others
        remote: String,
    },

    /// Delete a remote file without touching local clones
    Delete {
        /// Remote file name
        remote: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::open()?;
    let remote = HttpRemote::from_env()?;

    match cli.command {
        Commands::Setup => cmd_setup(&config, &remote),
        Commands::Otc => cmd_otc(&config, &remote),
        Commands::Add { local, remote: name } => cmd_add(&config, &remote, &local, name),
        Commands::Clone { remote: spec, local } => cmd_clone(&config, &remote, &spec, local),
        Commands::Update { file } => cmd_update(&config, &remote, &file),
        Commands::Sync { path } => cmd_sync(&config, &remote, &path),
        Commands::Share { file, recipients } => cmd_share(&config, &remote, &file, &recipients),
        Commands::Files => cmd_files(&config, &remote),
        Commands::Info { remote: spec } => cmd_info(&config, &remote, &spec),
        Commands::Delete { remote: name } => cmd_delete(&config, &remote, &name),
    }
}

// ── Prompting ───────────────────────────────────────────────────────────────

struct StdinPassword;

impl PasswordPrompt for StdinPassword {
    fn read_password(&mut self) -> lockbox_core::Result<Zeroizing<String>> {
        let password = rpassword::prompt_password("Password: ").map_err(Error::Io)?;
        Ok(Zeroizing::new(password))
    }
}

struct ConfirmOverwrite;

impl SyncPrompt for ConfirmOverwrite {
    fn confirm_overwrite(&mut self, local: &Path, remote_name: &str) -> bool {
        confirm(&format!(
            "Local file '{}' has edits. Overwrite them with '{}'?",
            local.display(),
            remote_name
        ))
        .unwrap_or(false)
    }
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{question} [y/N] "))?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

// ── Shared command plumbing ─────────────────────────────────────────────────

fn load_auth(config: &Config, remote: &dyn Remote) -> Result<AuthInfo> {
    let key_info = config.key_info()?.context(
        "it looks like lockbox has not been set up on this machine; run `lockbox setup` first",
    )?;
    let saved = config.session();
    Ok(session::login(
        config,
        remote,
        key_info,
        None,
        saved,
        Box::new(StdinPassword),
    )?)
}

/// '@someuser/somefile' → (owner, name); a bare name has no explicit owner.
fn parse_remote_name(spec: &str) -> Result<(Option<String>, String)> {
    if let Some(rest) = spec.strip_prefix('@') {
        let (owner, name) = rest
            .split_once('/')
            .context("remote files owned by others are written '@someuser/somefile'")?;
        if !keys::valid_username(owner) || name.is_empty() || name.contains('/') {
            bail!("invalid remote file name '{spec}'");
        }
        Ok((Some(owner.to_string()), name.to_string()))
    } else {
        Ok((None, spec.to_string()))
    }
}

fn render_remote_name(owner: &str, name: &str) -> String {
    format!("@{owner}/{name}")
}

// ── Commands ────────────────────────────────────────────────────────────────

fn cmd_setup(config: &Config, remote: &dyn Remote) -> Result<()> {
    if config.key_info()?.is_some() {
        bail!(
            "lockbox is already set up on this machine; to reconfigure, delete {} first \
             (this deletes your private key — consider moving the folder instead)",
            config.root().display()
        );
    }

    println!("\nWelcome to Lockbox, your command-line mailbox for storing and sharing files.\n");
    if confirm("Do you have an existing Lockbox account?")? {
        link_existing_account(config, remote)
    } else {
        register_new_account(config, remote)
    }
}

fn register_new_account(config: &Config, remote: &dyn Remote) -> Result<()> {
    let username = prompt_line("Username: ")?;
    if !keys::valid_username(&username) {
        bail!("usernames are lowercase letters and digits only");
    }

    let password = rpassword::prompt_password("Password: ")?;
    if password.len() < 8 {
        bail!("please pick a password of at least 8 characters");
    }
    let password_confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != password_confirm {
        bail!("passwords do not match; please run `lockbox setup` again");
    }

    let (key_info, private_key) = keys::register(remote, &username, Some(&password))?;
    config.set_key_info(&key_info)?;

    let session = session::establish_session(remote, &username, &private_key)?;
    config.set_session(&session)?;

    println!("\nYou're registered on Lockbox! Run `lockbox --help` to see available commands.");
    Ok(())
}

fn link_existing_account(config: &Config, remote: &dyn Remote) -> Result<()> {
    let username = prompt_line("Username: ")?;
    if let Err(e) = remote.user_info(&username) {
        match e.into_error(&username) {
            Error::UserNotFound(_) => {
                bail!("that username does not exist; did you mean to set up a new account?")
            }
            other => return Err(other.into()),
        }
    }

    println!(
        "\nOn a machine that already has lockbox configured, run `lockbox otc` to generate a \
         one-time-code — a short phrase of words. Enter that code below."
    );

    // The code is single-use, so every retry asks for a fresh one.
    let mut tries = 3;
    let (key_info, private_key) = loop {
        match attempt_link(remote, &username) {
            Ok(recovered) => break recovered,
            Err(e) if e.downcast_ref::<Error>().is_some_and(|e| matches!(e, Error::RecoveryNotReady)) => {
                bail!("no one-time-code has been generated for this account; run `lockbox otc` on a configured machine first");
            }
            Err(_) => {
                tries -= 1;
                if tries == 0 {
                    bail!("your one-time-code/password combination is invalid; could not log in");
                }
                println!("Your one-time-code/password combination is invalid. Please try again.\n");
            }
        }
    };

    config.set_key_info(&key_info)?;
    let session = session::establish_session(remote, &username, &private_key)?;
    config.set_session(&session)?;

    println!("\nYou've successfully logged in as '{username}' on this machine.");
    Ok(())
}

fn attempt_link(remote: &dyn Remote, username: &str) -> Result<(KeyInfo, StaticSecret)> {
    let phrase = prompt_line("Code (case-insensitive): ")?;
    let otc = Otc::parse_words(&phrase)?;
    let recovery = otc::fetch_recovery(remote, username, Some(&otc.to_hex()))?;
    Ok(recovery.decrypt(&otc.words(), None, &mut StdinPassword)?)
}

fn cmd_otc(config: &Config, remote: &dyn Remote) -> Result<()> {
    let mut auth = load_auth(config, remote)?;
    let otc = Otc::generate();
    otc::backup(remote, &mut auth, &otc.words())?;

    println!("Your one-time-code is:\n\n    {}\n", otc.words());
    println!("Enter this code on the machine you want to set up a new lockbox client on.");
    Ok(())
}

fn cmd_add(
    config: &Config,
    remote: &dyn Remote,
    local: &Path,
    remote_name: Option<String>,
) -> Result<()> {
    if !local.is_file() {
        bail!("local file '{}' does not exist", local.display());
    }
    let name = match remote_name {
        Some(name) => name,
        None => local
            .file_name()
            .context("local path has no file name")?
            .to_string_lossy()
            .into_owned(),
    };

    let mut auth = load_auth(config, remote)?;
    let store = SyncStore::open(config)?;

    if let Some(record) = store.lookup(local)? {
        // A dead binding self-heals; a live one is a user error.
        match auth.call(remote, |r, s| r.file_info_by_id(s, &record.file_id))? {
            Ok(info) => bail!(
                "local file '{}' is already synchronized with '{}'",
                local.display(),
                render_remote_name(&info.owner, &info.name)
            ),
            Err(e) if e.is(ErrorCode::FileNotFound) => {
                store.delete_by_remote(&record.file_id)?;
            }
            Err(e) => return Err(e.into_error(&record.file_id).into()),
        }
    }

    let content = std::fs::read(local)?;
    let hash = crypto::content_hash(&content);
    let file_id = envelope::upload(remote, &mut auth, &content, &name, false)?;
    store.create(&file_id, &hash, local)?;

    println!(
        "Local file '{}' has been added to your lockbox as '{}'.",
        local.display(),
        render_remote_name(auth.username(), &name)
    );
    Ok(())
}

fn cmd_clone(
    config: &Config,
    remote: &dyn Remote,
    spec: &str,
    local: Option<PathBuf>,
) -> Result<()> {
    let (owner, name) = parse_remote_name(spec)?;
    let local = local.unwrap_or_else(|| PathBuf::from(&name));
    if local.exists() {
        bail!(
            "a local file at '{}' already exists; use `--local` to pick a different name",
            local.display()
        );
    }

    let mut auth = load_auth(config, remote)?;
    let store = SyncStore::open(config)?;

    let info = match auth.call(remote, |r, s| r.file_info(s, &name, owner.as_deref()))? {
        Ok(info) => info,
        Err(e) => match e.into_error(&name) {
            Error::FileNotFound(_) => bail!("remote file '{spec}' does not exist"),
            Error::UserNotFound(_) => bail!("user '@{}' does not exist", owner.unwrap_or_default()),
            Error::FilenameNotSpecific(_) => bail!(
                "there are multiple remote files named '{name}'; use the '@someuser/somefile' form"
            ),
            other => return Err(other.into()),
        },
    };
    let rendered = render_remote_name(&info.owner, &info.name);

    // If a clone of this remote's current content already exists locally,
    // duplicate its binding instead of downloading the same bytes again.
    if let Some(record) = store.lookup_by_remote(&info.file_id)? {
        if record.last_hash == info.hash {
            store.copy(record.sync_id, &local)?;
            println!("Remote file '{rendered}' has been cloned as '{}'.", local.display());
            return Ok(());
        }
    }

    let content = envelope::download(remote, &mut auth, &info.name, &info.owner)?;
    std::fs::write(&local, &content)?;
    store.create(&info.file_id, &crypto::content_hash(&content), &local)?;

    println!("Remote file '{rendered}' has been cloned as '{}'.", local.display());
    Ok(())
}

fn cmd_update(config: &Config, remote: &dyn Remote, file: &Path) -> Result<()> {
    if !file.is_file() {
        bail!("local file '{}' does not exist", file.display());
    }
    let mut auth = load_auth(config, remote)?;
    let store = SyncStore::open(config)?;
    let record = store
        .lookup(file)?
        .with_context(|| format!("local file '{}' is not synchronized with any remote", file.display()))?;

    let content = std::fs::read(file)?;
    match envelope::update(remote, &mut auth, &record.file_id, &content) {
        Ok(UpdateOutcome::Unchanged) => {
            println!(
                "Local file '{}' has not changed; nothing was sent to the server.",
                file.display()
            );
        }
        Ok(UpdateOutcome::Updated { info }) => {
            store.update(file, &crypto::content_hash(&content))?;
            println!(
                "Remote file '{}' has been updated with local changes.",
                render_remote_name(&info.owner, &info.name)
            );
        }
        Err(Error::FileNotFound(_)) => bail!(
            "the remote for local file '{}' has been deleted; it can no longer be updated",
            file.display()
        ),
        Err(Error::AccessDenied) => {
            bail!("only the file owner can update this remote")
        }
        Err(Error::FileNotReady(name)) => {
            bail!("remote file '{name}' is being modified elsewhere; try again later")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn cmd_sync(config: &Config, remote: &dyn Remote, path: &Path) -> Result<()> {
    let mut auth = load_auth(config, remote)?;
    let store = SyncStore::open(config)?;

    let report = engine::sync_path(remote, &mut auth, &store, path, &mut ConfirmOverwrite)?;
    if report.entries.is_empty() {
        println!("No clones found. Nothing to synchronize.");
        return Ok(());
    }

    for (file, outcome) in &report.entries {
        let file = file.display();
        match outcome {
            SyncOutcome::Pulled => println!("Local file '{file}' synchronized with its remote."),
            SyncOutcome::Unchanged => {
                println!("Skipping '{file}': no local or remote changes.")
            }
            SyncOutcome::LocalEditsKept => println!("Keeping local edits in '{file}'."),
            SyncOutcome::RemoteDeleted => println!(
                "The remote for '{file}' has been deleted; it can no longer be synchronized."
            ),
            SyncOutcome::NotReady => println!(
                "Skipping '{file}': its remote is being modified elsewhere; try again later."
            ),
            SyncOutcome::Failed(e) => println!("Skipping '{file}': {e}"),
        }
    }
    println!("\nSync finished: {} files modified.", report.modified_count());
    Ok(())
}

fn cmd_share(config: &Config, remote: &dyn Remote, file: &str, recipients: &[String]) -> Result<()> {
    let recipients: Vec<String> = recipients
        .iter()
        .map(|r| r.strip_prefix('@').unwrap_or(r).to_string())
        .collect();
    for recipient in &recipients {
        if !keys::valid_username(recipient) {
            bail!("invalid recipient username '{recipient}'");
        }
    }

    let mut auth = load_auth(config, remote)?;
    envelope::share(remote, &mut auth, file, &recipients)?;

    println!(
        "Remote file '{}' is now shared with {}.",
        render_remote_name(auth.username(), file),
        recipients
            .iter()
            .map(|r| format!("@{r}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn cmd_files(config: &Config, remote: &dyn Remote) -> Result<()> {
    let mut auth = load_auth(config, remote)?;
    let username = auth.username().to_string();
    let files = auth.request(remote, &username, |r, s| r.files_info(s))?;
    if files.is_empty() {
        println!("Your lockbox is empty. Add a file with `lockbox add <file>`.");
        return Ok(());
    }

    println!("{:<40} {:>10}  {:<16} {}", "Remote Filename", "Size", "Last Modified", "Shared With");
    for info in files {
        let name = if info.owner == username {
            info.name.clone()
        } else {
            render_remote_name(&info.owner, &info.name)
        };
        let mut shared: Vec<String> = Vec::new();
        if info.shared_with.contains(&username) && info.owner != username {
            shared.push("me".to_string());
        }
        for user in &info.shared_with {
            if user != &info.owner && user != &username {
                shared.push(format!("@{user}"));
            }
        }
        println!(
            "{:<40} {:>10}  {:<16} {}",
            name,
            human_size(info.bytes),
            human_age(info.last_modified),
            shared.join(", ")
        );
    }
    Ok(())
}

fn cmd_info(config: &Config, remote: &dyn Remote, spec: &str) -> Result<()> {
    let (owner, name) = parse_remote_name(spec)?;
    let mut auth = load_auth(config, remote)?;

    let info = match auth.call(remote, |r, s| r.file_info(s, &name, owner.as_deref()))? {
        Ok(info) => info,
        Err(e) => match e.into_error(&name) {
            Error::FileNotFound(_) => bail!("remote file '{spec}' does not exist"),
            Error::FilenameNotSpecific(_) => bail!(
                "there are multiple remote files named '{name}'; use the '@someuser/somefile' form"
            ),
            other => return Err(other.into()),
        },
    };

    println!("{:<16}{}", "Remote file:", render_remote_name(&info.owner, &info.name));
    println!("{:<16}{}", "Size:", human_size(info.bytes));
    println!("{:<16}{}", "Last modified:", human_age(info.last_modified));
    let shared: Vec<String> = info
        .shared_with
        .iter()
        .filter(|user| *user != &info.owner)
        .map(|user| format!("@{user}"))
        .collect();
    println!(
        "{:<16}{}",
        "Shared with:",
        if shared.is_empty() {
            "nobody".to_string()
        } else {
            shared.join(", ")
        }
    );

    let store = SyncStore::open(config)?;
    match store.lookup_by_remote(&info.file_id)? {
        Some(record) if record.last_hash == info.hash => {
            println!("{:<16}{}", "Local clone:", "up to date")
        }
        Some(_) => println!("{:<16}{}", "Local clone:", "behind the remote"),
        None => println!("{:<16}{}", "Local clone:", "none on this machine"),
    }
    Ok(())
}

fn cmd_delete(config: &Config, remote: &dyn Remote, name: &str) -> Result<()> {
    let mut auth = load_auth(config, remote)?;
    let owner = auth.username().to_string();
    let info = match auth.call(remote, |r, s| r.file_info(s, name, Some(&owner)))? {
        Ok(info) => info,
        Err(e) => match e.into_error(name) {
            Error::FileNotFound(_) => bail!(
                "remote file '{}' does not exist",
                render_remote_name(&owner, name)
            ),
            other => return Err(other.into()),
        },
    };

    auth.request(remote, name, |r, s| r.delete(s, &info.file_id))?;
    let store = SyncStore::open(config)?;
    store.delete_by_remote(&info.file_id)?;

    println!(
        "Remote file '{}' has been deleted. No local clones have been changed.",
        render_remote_name(&owner, name)
    );
    Ok(())
}

// ── Rendering helpers ───────────────────────────────────────────────────────

fn human_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else if bytes < GIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    }
}

fn human_age(last_modified_ms: i64) -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let elapsed = now_ms.saturating_sub(last_modified_ms);
    let minute = 60 * 1000;
    let hour = 60 * minute;
    let day = 24 * hour;
    if elapsed < minute {
        "Just now".to_string()
    } else if elapsed < hour {
        format!("{} minutes ago", elapsed / minute)
    } else if elapsed < day {
        format!("{} hours ago", elapsed / hour)
    } else {
        format!("{} days ago", elapsed / day)
    }
}
