use std::fs::{self, File};
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chunkvault::archive::{enumerate, ArchiveDriver};
use chunkvault::config::{Config, ConfigError};
use chunkvault::control::{self, ControlError, MdFetchDriver, MdPushDriver};
use chunkvault::extract::{self, ExtractDriver};
use chunkvault::manifest::{
    self, ManifestError, ManifestWriter, ARCHIVE_TYPE_REGULAR, MD_CRYPTO, MD_MLB_ALLFILES,
};
use chunkvault::pattern::{MatchMode, Matcher, PatternError};
use chunkvault::pipeline::{Engine, EngineError, EngineOpts};
use chunkvault::session::{Session, SessionError};

#[derive(Parser)]
#[command(name = "cvt", version, about = "Content-addressed deduplicating backup client")]
struct Cli {
    /// Configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raise verbosity; stack for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive directory trees into a new manifest
    Archive {
        /// Manifest name to create (under md_dir unless a path)
        #[arg(short = 'f', long)]
        manifest: String,
        /// Basis manifest for a differential archive
        #[arg(short, long)]
        basis: Option<String>,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Extract files from a manifest chain
    Extract {
        manifest: String,
        /// Destination directory
        #[arg(short = 'C', long, default_value = ".")]
        dest: PathBuf,
        /// Pattern interpretation: literal, glob, regex
        #[arg(short, long, default_value = "glob")]
        match_mode: String,
        /// Continue past per-file integrity failures
        #[arg(long)]
        keep_going: bool,
        patterns: Vec<String>,
    },
    /// List the contents of a manifest chain
    List {
        manifest: String,
        #[arg(short, long, default_value = "glob")]
        match_mode: String,
        patterns: Vec<String>,
    },
    /// List manifest objects stored on the server
    MdList {
        #[arg(short, long, default_value = "glob")]
        match_mode: String,
        patterns: Vec<String>,
    },
    /// Delete a manifest object on the server
    MdDelete { name: String },
    /// Store a local manifest on the server under its name
    MdPush { manifest: String },
    /// Fetch a manifest object from the server
    MdFetch {
        name: String,
        /// Local destination (defaults to md_dir/<name>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ── Error funnel with exit codes ─────────────────────────────────────────────

enum CliError {
    Config(ConfigError),
    Manifest(ManifestError),
    Pattern(PatternError),
    Engine(EngineError),
    Control(ControlError),
    Session(SessionError),
    Transport(io::Error),
    Io(io::Error),
    /// Files abandoned under --keep-going.
    Integrity(u64),
}

impl CliError {
    fn code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Manifest(_) | CliError::Pattern(_)
            | CliError::Io(_) => 1,
            CliError::Engine(e) => e.exit_code(),
            CliError::Control(ControlError::Session(_)) => 2,
            CliError::Control(_) => 1,
            CliError::Session(_) | CliError::Transport(_) => 2,
            CliError::Integrity(_) => 3,
        }
    }

    fn message(&self) -> String {
        match self {
            CliError::Config(e)    => e.to_string(),
            CliError::Manifest(e)  => e.to_string(),
            CliError::Pattern(e)   => e.to_string(),
            CliError::Engine(e)    => e.to_string(),
            CliError::Control(e)   => e.to_string(),
            CliError::Session(e)   => e.to_string(),
            CliError::Transport(e) => format!("cannot reach server: {e}"),
            CliError::Io(e)        => e.to_string(),
            CliError::Integrity(n) => format!("{n} file(s) failed integrity checks"),
        }
    }
}

impl From<ConfigError> for CliError   { fn from(e: ConfigError)   -> Self { CliError::Config(e) } }
impl From<ManifestError> for CliError { fn from(e: ManifestError) -> Self { CliError::Manifest(e) } }
impl From<PatternError> for CliError  { fn from(e: PatternError)  -> Self { CliError::Pattern(e) } }
impl From<EngineError> for CliError   { fn from(e: EngineError)   -> Self { CliError::Engine(e) } }
impl From<ControlError> for CliError  { fn from(e: ControlError)  -> Self { CliError::Control(e) } }
impl From<SessionError> for CliError  { fn from(e: SessionError)  -> Self { CliError::Session(e) } }
impl From<io::Error> for CliError     { fn from(e: io::Error)     -> Self { CliError::Io(e) } }

// ── Helpers ──────────────────────────────────────────────────────────────────

fn md_path(cfg: &Config, name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        cfg.md_dir.join(name)
    }
}

/// The transport itself is an external concern (a TLS terminator or
/// tunnel in production); the session only needs ordered bytes.
fn connect(cfg: &Config) -> Result<TcpStream, CliError> {
    if cfg.host.is_empty() {
        return Err(CliError::Config(ConfigError::BadValue {
            key:    "host",
            reason: "not set".into(),
        }));
    }
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .map_err(CliError::Transport)?;
    stream.set_nodelay(true).map_err(CliError::Transport)?;
    stream
        .set_read_timeout(Some(Duration::from_secs(60)))
        .map_err(CliError::Transport)?;
    Ok(stream)
}

fn open_session(cfg: &Config) -> Result<Session<TcpStream>, CliError> {
    let mut session = Session::new(connect(cfg)?);
    if let Some(pw) = cfg.account_password()? {
        session.login(&pw)?;
    }
    Ok(session)
}

fn engine_opts(cfg: &Config, keep_going: bool) -> Result<EngineOpts, CliError> {
    Ok(EngineOpts {
        chunk_size:  cfg.chunk_size,
        queue_depth: cfg.queue_depth,
        comp:        cfg.comp_family(),
        keys:        cfg.keys()?,
        keep_going,
    })
}

fn matcher(mode: &str, patterns: &[String]) -> Result<Matcher, CliError> {
    let mode = MatchMode::from_name(mode).ok_or(CliError::Config(ConfigError::BadValue {
        key:    "match_mode",
        reason: format!("unknown mode '{mode}'"),
    }))?;
    Ok(Matcher::compile(mode, patterns)?)
}

// ── Subcommand bodies ────────────────────────────────────────────────────────

fn cmd_archive(
    cfg:      &Config,
    name:     &str,
    basis:    Option<&str>,
    paths:    &[String],
) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();

    let (level, prev_time) = match basis {
        Some(b) => {
            let bpath = md_path(cfg, b).to_string_lossy().into_owned();
            let (lvl, created) =
                manifest::basis_setup(&bpath, paths, &cwd, cfg.max_differentials)?;
            if lvl == 0 {
                eprintln!("differential limit reached, taking a full archive");
                (0, None)
            } else {
                (lvl, Some(created))
            }
        }
        None => (0, None),
    };

    let files = enumerate(paths, prev_time, cfg.multilevel_allfiles)?;

    let crypto = cfg.crypto_secret.is_some();
    let flags = (if crypto { MD_CRYPTO } else { 0 })
        | (if cfg.multilevel_allfiles { MD_MLB_ALLFILES } else { 0 });

    if !cfg.md_dir.as_os_str().is_empty() {
        fs::create_dir_all(&cfg.md_dir)?;
    }
    let out = md_path(cfg, name);
    let writer = ManifestWriter::create(
        &out,
        ARCHIVE_TYPE_REGULAR,
        if level > 0 { basis } else { None },
        level,
        cfg.chunk_size as i32,
        flags,
        &cwd,
        paths,
    )?;

    let session = open_session(cfg)?;
    let mut eng = Engine::new(session, engine_opts(cfg, false)?);
    let mut driver = ArchiveDriver::new(writer, files);

    match eng.run(&mut driver) {
        Ok(()) => {
            println!(
                "archived {} file(s), {} chunk(s), {} dedup hit(s) -> {}",
                eng.stats.files,
                eng.stats.chunks,
                eng.stats.dedup_hits,
                out.display()
            );
            Ok(())
        }
        Err(e) => {
            driver.abort();
            Err(e.into())
        }
    }
}

fn cmd_extract(
    cfg:        &Config,
    name:       &str,
    dest:       &Path,
    mode:       &str,
    keep_going: bool,
    patterns:   &[String],
) -> Result<(), CliError> {
    let mpath = md_path(cfg, name).to_string_lossy().into_owned();
    let mut driver = ExtractDriver::new(&mpath, dest, matcher(mode, patterns)?)?;

    let session = open_session(cfg)?;
    let mut eng = Engine::new(session, engine_opts(cfg, keep_going)?);
    if let Err(e) = eng.run(&mut driver) {
        driver.discard_partial();
        return Err(e.into());
    }

    if eng.stats.integrity_failures > 0 {
        return Err(CliError::Integrity(eng.stats.integrity_failures));
    }
    println!("extracted {} file(s) to {}", eng.stats.files, dest.display());
    Ok(())
}

fn cmd_md_push(cfg: &Config, name: &str) -> Result<(), CliError> {
    let path = md_path(cfg, name);
    let object = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());

    let mut session = open_session(cfg)?;
    control::md_open(&mut session, &object, true)?;

    let driver_file = File::open(&path)?;
    let mut eng = Engine::new(session, engine_opts(cfg, false)?);
    let mut driver = MdPushDriver::new(&object, driver_file)?;
    eng.run(&mut driver)?;

    let mut session = eng.into_session();
    control::md_close(&mut session)?;
    println!("pushed {object}");
    Ok(())
}

fn cmd_md_fetch(cfg: &Config, name: &str, output: Option<&Path>) -> Result<(), CliError> {
    let out_path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| md_path(cfg, name));
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut session = open_session(cfg)?;
    control::md_open(&mut session, name, false)?;

    let mut eng = Engine::new(session, engine_opts(cfg, false)?);
    let mut driver = MdFetchDriver::new(name, File::create(&out_path)?);
    eng.run(&mut driver)?;

    let mut session = eng.into_session();
    control::md_close(&mut session)?;
    println!("fetched {name} -> {}", out_path.display());
    Ok(())
}

// ── Entry ────────────────────────────────────────────────────────────────────

fn run(cli: Cli) -> Result<(), CliError> {
    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let level = match cli.verbose.max(cfg.verbose) {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Commands::Archive { manifest, basis, paths } => {
            cmd_archive(&cfg, manifest, basis.as_deref(), paths)
        }
        Commands::Extract { manifest, dest, match_mode, keep_going, patterns } => {
            cmd_extract(&cfg, manifest, dest, match_mode, *keep_going, patterns)
        }
        Commands::List { manifest, match_mode, patterns } => {
            let mpath = md_path(&cfg, manifest).to_string_lossy().into_owned();
            let m = matcher(match_mode, patterns)?;
            extract::list(&mpath, &m, cli.verbose.max(cfg.verbose) + 1)?;
            Ok(())
        }
        Commands::MdList { match_mode, patterns } => {
            let m = matcher(match_mode, patterns)?;
            let mut session = open_session(&cfg)?;
            // Patterns are applied here, after the full list returns.
            for name in control::md_list(&mut session)? {
                if m.matches(&name) {
                    println!("{name}");
                }
            }
            Ok(())
        }
        Commands::MdDelete { name } => {
            let mut session = open_session(&cfg)?;
            for deleted in control::md_delete(&mut session, name)? {
                println!("{deleted} deleted");
            }
            Ok(())
        }
        Commands::MdPush { manifest } => cmd_md_push(&cfg, manifest),
        Commands::MdFetch { name, output } => cmd_md_fetch(&cfg, name, output.as_deref()),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("cvt: {}", e.message());
        process::exit(e.code());
    }
}
