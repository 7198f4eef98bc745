//! CLI entry point for the remote-ops toolkit
//!
//! Thin plumbing only: argument parsing, TOML config loading for `sync`,
//! SSH-config alias resolution, and mapping each [`RemoteError`] kind to a
//! one-line stderr message and exit code. All business logic lives in
//! `remote_ops::{proxy, transfer, sync}`.

use clap::{Parser, Subcommand};
use remote_ops::config::{parse_size, AuthMethod, ConnectionParams, ProxyConfig, ProxyMode, SshConfigLoader, TransferConfig};
use remote_ops::error::{RemoteError, Result};
use remote_ops::proxy::ProxyService;
use remote_ops::state::FileStateStore;
use remote_ops::sync::{BlockGroup, FileSync, GlobalEnv, ScriptExec, SyncService};
use remote_ops::transfer::{RemoteAuth, TransferService};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote", about = "SSH reverse proxy tunnels, resumable transfer, and declarative sync")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reverse proxy tunnel lifecycle
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Run a declarative sync pass from a TOML config
    Sync {
        /// Path to the TOML sync config
        config: PathBuf,
        /// Host alias to resolve via ~/.ssh/config
        #[arg(long = "ssh-config")]
        ssh_config: Option<String>,
        /// Run init-mode items even if this isn't detected as a first connect
        #[arg(long = "force-init")]
        force_init: bool,
    },
    /// Resumable chunked file transfer
    Transfer {
        src: String,
        dst: String,
        #[arg(long, conflicts_with = "no_resume")]
        resume: bool,
        #[arg(long = "no-resume")]
        no_resume: bool,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value_t = 4)]
        parallel: usize,
        #[arg(long)]
        aria2: bool,
        #[arg(long, default_value_t = 1)]
        split: usize,
        #[arg(long, default_value = "4MB")]
        chunk: String,
        #[arg(short = 'P', long = "port", default_value_t = 22)]
        port: u16,
        #[arg(short = 'p', long = "preserve")]
        preserve_perms: bool,
        #[arg(short = 'v', long)]
        verbose: bool,
        #[arg(short = 'q', long)]
        quiet: bool,
        #[arg(short = 'C', long = "compress")]
        compress: bool,
        #[arg(short = 'l', long = "limit-rate")]
        limit_rate: Option<String>,
        #[arg(long, env = "REMOTE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyAction {
    /// Start a named tunnel
    Start {
        name: String,
        #[arg(long = "local-port")]
        local_port: u16,
        #[arg(long = "remote-port")]
        remote_port: u16,
        #[arg(long = "mode", value_enum, default_value = "socks5")]
        mode: ProxyModeArg,
        #[arg(long = "local-host", default_value = "localhost")]
        local_host: String,
        #[arg(long)]
        builtin: bool,
        #[arg(long)]
        foreground: bool,
        host: String,
        user: String,
        #[arg(short = 'P', long = "port", default_value_t = 22)]
        port: u16,
        #[arg(long, env = "REMOTE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Stop one instance, or every instance if none is named
    Stop { name: Option<String> },
    /// Show one instance's status, or every instance's if none is named
    Status { name: Option<String> },
    /// List every currently-running instance
    List,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProxyModeArg {
    Http,
    Socks5,
}

impl From<ProxyModeArg> for ProxyMode {
    fn from(value: ProxyModeArg) -> Self {
        match value {
            ProxyModeArg::Http => ProxyMode::Http,
            ProxyModeArg::Socks5 => ProxyMode::Socks5,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    if let Err(e) = run(args) {
        eprintln!("error ({}): {}", e.kind(), e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Proxy { action } => run_proxy(action),
        Command::Sync { config, ssh_config, force_init } => run_sync(&config, ssh_config.as_deref(), force_init),
        Command::Transfer {
            src,
            dst,
            resume,
            no_resume,
            force,
            parallel,
            aria2,
            split,
            chunk,
            port,
            preserve_perms,
            verbose,
            quiet,
            compress,
            limit_rate,
            password,
            key,
        } => run_transfer(TransferArgs {
            src,
            dst,
            resume: !no_resume || resume,
            force,
            parallel,
            aria2,
            split,
            chunk,
            port,
            preserve_perms,
            verbose,
            quiet,
            compress,
            limit_rate,
            password,
            key,
        }),
    }
}

fn resolve_connection(host: &str, user: &str, port: u16, password: Option<String>, key: Option<PathBuf>) -> ConnectionParams {
    let mut conn = ConnectionParams::new(host, user).with_port(port);
    if let Some(key_path) = key {
        conn = conn.with_key(key_path);
    }
    if let Some(password) = password {
        conn = conn.with_password(password);
    }
    if conn.key_path.is_none() && conn.password.is_none() {
        conn.auth_method = AuthMethod::Key;
        conn = conn.with_key(default_key_path());
    }
    conn
}

fn default_key_path() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".ssh").join("id_rsa")
}

fn run_proxy(action: ProxyAction) -> Result<()> {
    let store = FileStateStore::default_store();

    match action {
        ProxyAction::Start {
            name,
            local_port,
            remote_port,
            mode,
            local_host,
            builtin,
            foreground,
            host,
            user,
            port,
            password,
            key,
        } => {
            let conn = resolve_connection(&host, &user, port, password, key);
            let config = ProxyConfig {
                local_port,
                remote_port,
                mode: mode.into(),
                local_host,
                use_builtin: builtin,
            };
            let service = ProxyService::with_store(name.clone(), store);
            let pid = service.start(config, conn, &host, !foreground)?;
            if !foreground {
                println!("started '{}' (pid {})", name, pid);
            }
            Ok(())
        }
        ProxyAction::Stop { name } => {
            match name {
                Some(name) => {
                    ProxyService::with_store(name.clone(), store).stop()?;
                    println!("stopped '{}'", name);
                }
                None => {
                    for name in ProxyService::list(&store) {
                        ProxyService::with_store(name.clone(), FileStateStore::default_store()).stop()?;
                        println!("stopped '{}'", name);
                    }
                }
            }
            Ok(())
        }
        ProxyAction::Status { name } => {
            match name {
                Some(name) => match ProxyService::with_store(name.clone(), store).status() {
                    Some(state) => print_proxy_state(&state),
                    None => println!("'{}' is not running", name),
                },
                None => {
                    for state in ProxyService::all_status(&store) {
                        print_proxy_state(&state);
                    }
                }
            }
            Ok(())
        }
        ProxyAction::List => {
            for name in ProxyService::list(&store) {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn print_proxy_state(state: &remote_ops::config::ProxyState) {
    println!(
        "{}: pid={} mode={:?} local={}:{} remote_port={} builtin={} host={}",
        state.name,
        state.pid,
        state.config.mode,
        state.config.local_host,
        state.config.local_port,
        state.config.remote_port,
        state.config.use_builtin,
        state.ssh_host
    );
}

struct TransferArgs {
    src: String,
    dst: String,
    resume: bool,
    force: bool,
    parallel: usize,
    aria2: bool,
    split: usize,
    chunk: String,
    port: u16,
    preserve_perms: bool,
    verbose: bool,
    quiet: bool,
    compress: bool,
    limit_rate: Option<String>,
    password: Option<String>,
    key: Option<PathBuf>,
}

fn run_transfer(args: TransferArgs) -> Result<()> {
    if args.verbose {
        tracing::info!(src = %args.src, dst = %args.dst, "starting transfer");
    }

    let chunk_bytes = parse_size(&args.chunk).map_err(RemoteError::ConfigError)?;
    let limit_rate = args.limit_rate.map(|r| parse_size(&r)).transpose().map_err(RemoteError::ConfigError)?;

    let config = TransferConfig {
        resume: args.resume,
        force: args.force,
        parallel: args.parallel,
        aria2: args.aria2,
        split: args.split,
        chunk: chunk_bytes,
        limit_rate,
        ssh_port: args.port,
        compress: Some(args.compress),
        preserve_perms: Some(args.preserve_perms),
        ..TransferConfig::default()
    };

    let auth = RemoteAuth {
        password: args.password,
        key_path: args.key.or_else(|| Some(default_key_path())),
        timeout: 10,
    };

    let service = TransferService::with_default_store();
    let print_progress = |done: u64, total: u64| {
        if total > 0 {
            eprint!("\r{:.1}%", (done as f64 / total as f64) * 100.0);
        }
    };
    let progress: Option<remote_ops::transfer::ProgressCallback> = if args.quiet { None } else { Some(&print_progress) };

    let (transferred, total) = service.transfer(&args.src, &args.dst, &config, &auth, progress)?;

    if !args.quiet {
        println!();
        println!("transferred {}/{} bytes", transferred, total);
    }

    Ok(())
}

/// TOML shape for the `sync` command's config file. Parsing this file is
/// CLI plumbing, not core business logic — [`remote_ops::sync`] only deals
/// in already-parsed [`FileSync`]/[`BlockGroup`]/[`ScriptExec`] values.
#[derive(Debug, Deserialize)]
struct SyncConfigFile {
    host: String,
    user: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    password: Option<String>,
    key: Option<PathBuf>,
    #[serde(default)]
    global_env: Option<GlobalEnv>,
    #[serde(default)]
    files: Vec<FileSync>,
    #[serde(default)]
    blocks: Vec<BlockGroup>,
    #[serde(default)]
    scripts: Vec<ScriptExec>,
}

fn default_ssh_port() -> u16 {
    22
}

fn run_sync(config_path: &Path, ssh_config_alias: Option<&str>, force_init: bool) -> Result<()> {
    let contents = std::fs::read_to_string(config_path).map_err(|e| RemoteError::io(config_path, e))?;
    let parsed: SyncConfigFile = toml::from_str(&contents).map_err(|e| RemoteError::ConfigError(e.to_string()))?;

    let mut conn = resolve_connection(&parsed.host, &parsed.user, parsed.port, parsed.password, parsed.key);

    if let Some(alias) = ssh_config_alias {
        if let Ok(loader) = SshConfigLoader::load_default() {
            if let Some(host_entry) = loader.get(alias) {
                if let Some(host_name) = &host_entry.host_name {
                    conn.host = host_name.clone();
                }
                if let Some(user) = &host_entry.user {
                    conn.user = user.clone();
                }
                if let Some(port) = host_entry.port {
                    conn.port = port;
                }
                if let Some(identity_file) = &host_entry.identity_file {
                    conn = conn.with_key(identity_file.clone());
                }
            }
        }
    }

    let global_env = parsed.global_env.unwrap_or_default();
    let service = SyncService::new(conn.port);
    let used_key_fallback = service.sync(&conn, &parsed.files, &parsed.blocks, &parsed.scripts, &global_env, force_init)?;

    if used_key_fallback {
        tracing::warn!("key auth failed, fell back to password");
    }

    println!("sync complete");
    Ok(())
}
