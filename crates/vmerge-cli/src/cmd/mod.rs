pub mod history;
pub mod init;
pub mod key;
pub mod merge;
pub mod queue;
pub mod recover;
pub mod resolve;
pub mod scan;
pub mod vendor;

use crate::output::OutputMode;
use anyhow::{Context as _, Result};
use rusqlite::Connection;
use std::fmt;
use std::path::{Path, PathBuf};
use vmerge_core::auth::AuthToken;
use vmerge_core::config::{EngineConfig, discover_config, load_config};
use vmerge_core::db;
use vmerge_core::model::merge::FieldOverride;
use vmerge_core::model::vendor::VendorField;
use vmerge_core::{ErrorCode, MergeOrchestrator};

/// Setup failures that carry an engine error code.
#[derive(Debug)]
pub enum SetupError {
    NotInitialized(PathBuf),
    MissingActor,
    Config(String),
}

impl SetupError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized(_) => ErrorCode::NotInitialized,
            Self::MissingActor => ErrorCode::InvalidInput,
            Self::Config(_) => ErrorCode::ConfigParseError,
        }
    }

    pub const fn hint(&self) -> Option<&'static str> {
        match self {
            Self::MissingActor => Some("Pass --actor or set VMERGE_ACTOR."),
            _ => self.code().hint(),
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized(path) => write!(f, "no vendor store at {}", path.display()),
            Self::MissingActor => f.write_str("this command changes state and needs an actor"),
            Self::Config(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for SetupError {}

/// Everything a subcommand needs from the global flags.
pub struct Context {
    pub db: PathBuf,
    pub config: EngineConfig,
    pub actor: Option<String>,
    pub output: OutputMode,
}

impl Context {
    /// Build the context, loading `--config` or discovering one next to the store.
    pub fn new(
        db: PathBuf,
        config_path: Option<&Path>,
        actor: Option<String>,
        output: OutputMode,
    ) -> Result<Self> {
        let loaded = match config_path {
            Some(path) => load_config(path),
            None => discover_config(store_dir(&db)),
        };
        let config = loaded.map_err(|err| SetupError::Config(format!("{err:#}")))?;
        Ok(Self {
            db,
            config,
            actor: actor.filter(|a| !a.trim().is_empty()),
            output,
        })
    }

    /// Open the existing store; `vmerge init` is the only command that creates one.
    pub fn open(&self) -> Result<Connection> {
        db::try_open_store(&self.db)
            .with_context(|| format!("open store {}", self.db.display()))?
            .ok_or_else(|| SetupError::NotInitialized(self.db.clone()).into())
    }

    pub fn actor(&self) -> Result<&str> {
        self.actor
            .as_deref()
            .ok_or_else(|| SetupError::MissingActor.into())
    }

    pub fn token(&self) -> Result<AuthToken> {
        Ok(AuthToken::new(self.actor()?))
    }

    pub fn orchestrator(&self) -> MergeOrchestrator {
        MergeOrchestrator::from_config(self.config.clone())
    }
}

/// Directory that holds the store file and its `vmerge.toml`.
pub fn store_dir(db: &Path) -> &Path {
    match db.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Parse `field=value` into a survivorship override. An empty value clears the field.
pub fn parse_override(raw: &str) -> Result<FieldOverride, String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got '{raw}'"))?;
    let field: VendorField = field.trim().parse().map_err(|err| format!("{err}"))?;
    let value = value.trim();
    Ok(FieldOverride {
        field,
        value: (!value.is_empty()).then(|| value.to_owned()),
        note: None,
    })
}
