use crate::cmd::Context;
use crate::output::{or_dash, pretty_kv, pretty_section, render, timestamp};
use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use vmerge_core::model::VendorId;
use vmerge_core::model::vendor::{
    KeyClaim, LifecycleState, NewVendor, VendorFieldUpdate, VendorIdentity, VendorKey,
};
use vmerge_core::resolver::Resolver;
use vmerge_core::store;

#[derive(Subcommand, Debug)]
pub enum VendorCommand {
    /// Register a vendor as first seen in a source system.
    Add(AddArgs),
    /// Show a vendor with its keys, claims, and canonical survivor.
    Show(ShowArgs),
    /// Edit fields of a canonical vendor.
    Edit(EditArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Registered legal name.
    pub legal_name: String,

    /// System the record came from (e.g. peoplesoft, zycus).
    #[arg(long)]
    pub source: String,

    #[arg(long = "source-record")]
    pub source_record_id: Option<String>,

    #[arg(long = "display-name")]
    pub display_name: Option<String>,

    #[arg(long, default_value = "draft", value_parser = parse_lifecycle)]
    pub lifecycle: LifecycleState,

    #[arg(long = "risk-tier")]
    pub risk_tier: Option<String>,

    #[arg(long = "owner-org")]
    pub owner_org_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Vendor ID (`v-12` or `12`).
    pub vendor_id: VendorId,
}

/// `--clear-*` flags remove optional values; the others replace them.
#[derive(Args, Debug)]
pub struct EditArgs {
    pub vendor_id: VendorId,

    #[arg(long = "legal-name")]
    pub legal_name: Option<String>,

    #[arg(long = "display-name", conflicts_with = "clear_display_name")]
    pub display_name: Option<String>,

    #[arg(long = "clear-display-name")]
    pub clear_display_name: bool,

    #[arg(long, value_parser = parse_lifecycle)]
    pub lifecycle: Option<LifecycleState>,

    #[arg(long = "risk-tier", conflicts_with = "clear_risk_tier")]
    pub risk_tier: Option<String>,

    #[arg(long = "clear-risk-tier")]
    pub clear_risk_tier: bool,

    #[arg(long = "owner-org", conflicts_with = "clear_owner_org")]
    pub owner_org_id: Option<String>,

    #[arg(long = "clear-owner-org")]
    pub clear_owner_org: bool,
}

fn parse_lifecycle(raw: &str) -> Result<LifecycleState, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

fn replace_or_clear(value: Option<&String>, clear: bool) -> Option<Option<String>> {
    if clear {
        Some(None)
    } else {
        value.map(|v| Some(v.clone()))
    }
}

impl EditArgs {
    fn update(&self) -> VendorFieldUpdate {
        VendorFieldUpdate {
            legal_name: self.legal_name.clone(),
            display_name: replace_or_clear(self.display_name.as_ref(), self.clear_display_name),
            lifecycle_state: self.lifecycle,
            risk_tier: replace_or_clear(self.risk_tier.as_ref(), self.clear_risk_tier),
            owner_org_id: replace_or_clear(self.owner_org_id.as_ref(), self.clear_owner_org),
        }
    }
}

#[derive(Debug, Serialize)]
struct VendorView {
    vendor: VendorIdentity,
    canonical_vendor_id: VendorId,
    keys: Vec<VendorKey>,
    claims: Vec<KeyClaim>,
}

pub fn run_vendor(command: &VendorCommand, ctx: &Context) -> Result<()> {
    match command {
        VendorCommand::Add(args) => run_add(args, ctx),
        VendorCommand::Show(args) => run_show(args, ctx),
        VendorCommand::Edit(args) => run_edit(args, ctx),
    }
}

fn run_add(args: &AddArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let vendor = store::insert_vendor(
        &conn,
        &NewVendor {
            legal_name: args.legal_name.clone(),
            display_name: args.display_name.clone(),
            lifecycle_state: args.lifecycle,
            risk_tier: args.risk_tier.clone(),
            owner_org_id: args.owner_org_id.clone(),
            source_system: args.source.clone(),
            source_record_id: args.source_record_id.clone(),
        },
    )
    .context("add vendor")?;
    tracing::info!(vendor_id = %vendor.vendor_id, source = %vendor.source_system, "vendor added");
    render(ctx.output, &vendor, |v, w| write_identity(w, v))
}

fn run_show(args: &ShowArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let vendor = store::require_vendor(&conn, args.vendor_id)?;
    let canonical_vendor_id = Resolver::from_config(&conn, &ctx.config.resolver)
        .resolve(args.vendor_id)
        .with_context(|| format!("resolve {}", args.vendor_id))?;
    let view = VendorView {
        keys: store::keys_for(&conn, args.vendor_id)?,
        claims: store::claims_for(&conn, args.vendor_id)?,
        vendor,
        canonical_vendor_id,
    };
    render(ctx.output, &view, |v, w| {
        write_identity(w, &v.vendor)?;
        if v.canonical_vendor_id != v.vendor.vendor_id {
            pretty_kv(w, "canonical", v.canonical_vendor_id.to_string())?;
        }
        if !v.keys.is_empty() {
            writeln!(w)?;
            pretty_section(w, "Keys")?;
            for key in &v.keys {
                write_key(w, key)?;
            }
        }
        if !v.claims.is_empty() {
            writeln!(w)?;
            pretty_section(w, "Claims")?;
            for claim in &v.claims {
                writeln!(
                    w,
                    "#{:<5} {}:{} [{}]",
                    claim.claim_id, claim.source_system, claim.source_key, claim.verification_status
                )?;
            }
        }
        Ok(())
    })
}

fn run_edit(args: &EditArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let vendor = store::update_vendor_fields(&conn, args.vendor_id, &args.update())
        .with_context(|| format!("edit {}", args.vendor_id))?;
    tracing::info!(vendor_id = %vendor.vendor_id, "vendor edited");
    render(ctx.output, &vendor, |v, w| write_identity(w, v))
}

pub(crate) fn write_identity(w: &mut dyn Write, v: &VendorIdentity) -> io::Result<()> {
    pretty_kv(w, "vendor", v.vendor_id.to_string())?;
    pretty_kv(w, "legal name", &v.legal_name)?;
    pretty_kv(w, "display name", or_dash(v.display_name.as_deref()))?;
    pretty_kv(w, "lifecycle", v.lifecycle_state.as_str())?;
    pretty_kv(w, "risk tier", or_dash(v.risk_tier.as_deref()))?;
    pretty_kv(w, "owner org", or_dash(v.owner_org_id.as_deref()))?;
    pretty_kv(
        w,
        "source",
        format!("{} {}", v.source_system, or_dash(v.source_record_id.as_deref())),
    )?;
    if let Some(into) = v.merged_into_vendor_id {
        pretty_kv(w, "merged into", into.to_string())?;
        if let Some(at) = v.merged_at_us {
            pretty_kv(w, "merged at", timestamp(at))?;
        }
        pretty_kv(w, "merged by", or_dash(v.merged_by.as_deref()))?;
    }
    pretty_kv(w, "updated", timestamp(v.updated_at_us))
}

pub(crate) fn write_key(w: &mut dyn Write, key: &VendorKey) -> io::Result<()> {
    let origin = if key.original_vendor_id == key.vendor_id {
        String::new()
    } else {
        format!(" (from {})", key.original_vendor_id)
    };
    let primary = if key.is_primary_source { " primary" } else { "" };
    writeln!(
        w,
        "{}:{} [{}{primary}]{origin}",
        key.source_system, key.source_key, key.verification_status
    )
}
