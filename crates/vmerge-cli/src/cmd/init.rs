use crate::cmd::{Context, store_dir};
use crate::output::{pretty_kv, render};
use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use vmerge_core::config::{CONFIG_FILE_NAME, render_config};
use vmerge_core::db;

#[derive(Args, Debug, Default)]
pub struct InitArgs {
    /// Actor allowed to execute merges (repeatable). Written to vmerge.toml.
    #[arg(long = "merge-actor", value_name = "ACTOR")]
    pub merge_actors: Vec<String>,

    /// Overwrite an existing vmerge.toml.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct InitReport {
    store: PathBuf,
    config: PathBuf,
    config_written: bool,
    merge_actors: Vec<String>,
}

/// Create or migrate the store and write a starter `vmerge.toml` beside it.
///
/// Re-running is safe: the schema migrates in place and an existing config is
/// kept unless `--force` is given.
pub fn run_init(args: &InitArgs, ctx: &Context) -> Result<()> {
    if let Some(parent) = ctx.db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    db::open_store(&ctx.db).with_context(|| format!("initialize {}", ctx.db.display()))?;

    let config_path = store_dir(&ctx.db).join(CONFIG_FILE_NAME);
    let mut config = ctx.config.clone();
    for actor in &args.merge_actors {
        if !config.authorization.merge_actors.contains(actor) {
            config.authorization.merge_actors.push(actor.clone());
        }
    }

    let config_written = args.force || !config_path.exists();
    if config_written {
        std::fs::write(&config_path, render_config(&config)?)
            .with_context(|| format!("write {}", config_path.display()))?;
        tracing::info!(path = %config_path.display(), "wrote engine config");
    } else if !args.merge_actors.is_empty() {
        tracing::warn!(
            path = %config_path.display(),
            "config exists; --merge-actor ignored without --force"
        );
    }

    let report = InitReport {
        store: ctx.db.clone(),
        config: config_path,
        config_written,
        merge_actors: config.authorization.merge_actors,
    };
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "store", r.store.display().to_string())?;
        let state = if r.config_written { "written" } else { "kept" };
        pretty_kv(w, "config", format!("{} ({state})", r.config.display()))?;
        pretty_kv(w, "merge actors", r.merge_actors.join(", "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputMode;
    use vmerge_core::config::load_config;

    #[test]
    fn init_creates_store_and_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested/vmerge.sqlite3");
        let ctx = Context::new(db_path.clone(), None, None, OutputMode::Json).expect("ctx");
        let args = InitArgs {
            merge_actors: vec!["steward".into()],
            force: false,
        };
        run_init(&args, &ctx).expect("init");

        assert!(db_path.exists());
        let config = load_config(&dir.path().join("nested").join(CONFIG_FILE_NAME)).expect("config");
        assert_eq!(config.authorization.merge_actors, vec!["steward"]);
    }

    #[test]
    fn init_keeps_existing_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, "[queue]\nsla_days = 3\n").expect("seed config");
        let ctx = Context::new(dir.path().join("v.sqlite3"), None, None, OutputMode::Json)
            .expect("ctx");
        run_init(&InitArgs::default(), &ctx).expect("init");
        run_init(&InitArgs::default(), &ctx).expect("second init");

        let content = std::fs::read_to_string(&config_path).expect("read");
        assert_eq!(content, "[queue]\nsla_days = 3\n");
    }
}
