use crate::cmd::Context;
use crate::output::render;
use anyhow::{Result, bail};
use clap::Args;
use serde::Serialize;
use std::io::Write as _;
use vmerge_core::model::VendorId;
use vmerge_core::model::vendor::KeyRef;
use vmerge_core::resolver::Resolver;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Vendor IDs to resolve, old or current.
    #[arg(required_unless_present = "key")]
    pub vendor_ids: Vec<VendorId>,

    /// Resolve the owner of an external key instead.
    #[arg(
        long,
        num_args = 2,
        value_names = ["SYSTEM", "KEY"],
        conflicts_with = "vendor_ids"
    )]
    pub key: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct Resolution {
    vendor_id: VendorId,
    canonical_vendor_id: VendorId,
}

#[derive(Debug, Serialize)]
struct KeyResolution {
    source_system: String,
    source_key: String,
    canonical_vendor_id: VendorId,
}

/// Print the canonical survivor for each id, or for a key's owner.
pub fn run_resolve(args: &ResolveArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let mut resolver = Resolver::from_config(&conn, &ctx.config.resolver);

    if let Some(parts) = &args.key {
        let [system, key] = parts.as_slice() else {
            bail!("--key takes SYSTEM and KEY");
        };
        let key_ref = KeyRef::new(system, key);
        let Some(canonical_vendor_id) = resolver.resolve_key(&key_ref)? else {
            bail!("key {key_ref} is not mapped to any vendor");
        };
        let view = KeyResolution {
            source_system: key_ref.source_system,
            source_key: key_ref.source_key,
            canonical_vendor_id,
        };
        return render(ctx.output, &view, |r, w| {
            writeln!(w, "{}:{} -> {}", r.source_system, r.source_key, r.canonical_vendor_id)
        });
    }

    let canonical = resolver.resolve_many(&args.vendor_ids)?;
    let resolutions: Vec<Resolution> = args
        .vendor_ids
        .iter()
        .zip(canonical)
        .map(|(vendor_id, canonical_vendor_id)| Resolution {
            vendor_id: *vendor_id,
            canonical_vendor_id,
        })
        .collect();
    render(ctx.output, &resolutions, |list, w| {
        for r in list {
            writeln!(w, "{} -> {}", r.vendor_id, r.canonical_vendor_id)?;
        }
        Ok(())
    })
}
