//! `lodestar ca` subcommands: bootstrap a CA and issue the lighthouse.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use lodestar_common::persist::write_secret_file;
use lodestar_core::ca::{create_authority, CaBlueprint, CertificateAuthority};
use lodestar_core::config::LodestarConfig;
use lodestar_core::render::ConfigRole;
use lodestar_crypto::nebula::Network;

const LIGHTHOUSE_GROUP: &str = "lighthouse";

pub fn create(
    name: &str,
    days: u32,
    networks: &[Network],
    groups: &[String],
    out_dir: &Path,
    force: bool,
) -> anyhow::Result<()> {
    let cert_path = out_dir.join("ca.crt");
    let key_path = out_dir.join("ca.key");
    refuse_overwrite(&[&cert_path, &key_path], force)?;

    let blueprint = CaBlueprint {
        name: name.to_string(),
        duration: chrono::Duration::days(i64::from(days)),
        networks: networks.to_vec(),
        groups: groups.to_vec(),
    };
    let (cert_pem, key_pem) = create_authority(&blueprint, Utc::now())?;

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create {}", out_dir.display()))?;
    std::fs::write(&cert_path, &cert_pem)
        .with_context(|| format!("write {}", cert_path.display()))?;
    write_secret_file(&key_path, &key_pem)
        .with_context(|| format!("write {}", key_path.display()))?;

    tracing::info!(name, days, cert = %cert_path.display(), "CA created");
    println!("CA certificate: {}", cert_path.display());
    println!("CA key:         {}", key_path.display());
    Ok(())
}

/// Sign the lighthouse's own certificate at its configured overlay address
/// and write a lighthouse-role config next to it.
pub fn lighthouse(
    config: &LodestarConfig,
    name: &str,
    out_dir: &Path,
    force: bool,
) -> anyhow::Result<()> {
    config.validate()?;
    let cert_path = out_dir.join("host.crt");
    let key_path = out_dir.join("host.key");
    let config_path = out_dir.join("config.yml");
    refuse_overwrite(&[&cert_path, &key_path, &config_path], force)?;

    let ca = CertificateAuthority::load(
        &config.ca.cert_path,
        &config.ca.key_path,
        config.authority_settings(),
    )?;
    let issued = ca.issue(
        name,
        config.lighthouse.internal_ip,
        &[LIGHTHOUSE_GROUP.to_string()],
        Utc::now(),
    )?;
    let rendered = ca.render_config(
        &issued.certificate_pem,
        &issued.private_key_pem,
        ConfigRole::Lighthouse,
    );

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create {}", out_dir.display()))?;
    std::fs::write(&cert_path, &issued.certificate_pem)
        .with_context(|| format!("write {}", cert_path.display()))?;
    write_secret_file(&key_path, &issued.private_key_pem)
        .with_context(|| format!("write {}", key_path.display()))?;
    // The config embeds the private key.
    write_secret_file(&config_path, &rendered)
        .with_context(|| format!("write {}", config_path.display()))?;

    tracing::info!(
        name,
        ip = %config.lighthouse.internal_ip,
        serial = %issued.serial,
        expires_at = %issued.expires_at,
        "Lighthouse certificate issued"
    );
    println!("Lighthouse config: {}", config_path.display());
    Ok(())
}

fn refuse_overwrite(paths: &[&Path], force: bool) -> anyhow::Result<()> {
    if force {
        return Ok(());
    }
    if let Some(existing) = paths.iter().find(|p| p.exists()) {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            existing.display()
        );
    }
    Ok(())
}
