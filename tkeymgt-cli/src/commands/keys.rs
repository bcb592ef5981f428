//! Offline signing and key export.

use {
    super::default_sig_path,
    crate::Cli,
    anyhow::{Context, Result},
    console::style,
    std::{fs, path::Path},
    tkeymgt::{
        sigfile,
        signature::{self, Seed},
    },
};

fn read_seed(path: &Path) -> Result<Seed> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed {}", path.display()))?;
    signature::parse_seed(&text).with_context(|| format!("Invalid seed file {}", path.display()))
}

/// Sign command implementation.
pub(crate) fn cmd_sign(cli: &Cli, message: &Path, seed: &Path, out: Option<&Path>) -> Result<()> {
    let seed = read_seed(seed)?;
    let image = sigfile::read_image_file(message)
        .with_context(|| format!("Failed to read {}", message.display()))?;

    let sig = signature::sign(&seed, &image);
    let out = out.map_or_else(|| default_sig_path(message), Path::to_path_buf);
    let comment = format!("verify with key {}", hex::encode(sig.key_index));
    sigfile::write_signature_file(&out, &sig, &comment)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    if !cli.quiet {
        eprintln!("{} Wrote signature to {}", style("✓").green(), out.display());
    }
    Ok(())
}

/// Export-pubkey command implementation.
pub(crate) fn cmd_export_pubkey(cli: &Cli, seed: &Path, out: &Path) -> Result<()> {
    let key = signature::public_key_from_seed(&read_seed(seed)?);
    let comment = format!("tkey-mgt public key {}", hex::encode(key.key_index));
    sigfile::write_public_key_file(out, &key, &comment)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    if !cli.quiet {
        eprintln!("{} Wrote public key to {}", style("✓").green(), out.display());
    }
    Ok(())
}
