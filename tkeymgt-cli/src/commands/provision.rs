//! Commands that talk to the device.

use {
    super::{confirm_destructive, default_sig_path},
    crate::{Cli, CliError, config::Config, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::debug,
    std::path::Path,
    tkeymgt::{
        FirmwareResetType, Locator, NativeConnector, ProvisionEvent, Provisioner, ResetDirective,
        VerifierDestination, Workflow, sigfile,
    },
};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Transfer progress bar for `workflow`. Hidden when quiet, when not on a
/// terminal, and for workflows that send no app bytes.
fn progress_bar(workflow: Workflow, quiet: bool) -> ProgressBar {
    let transfers = matches!(workflow, Workflow::Install | Workflow::Boot);
    if !transfers || quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Provisioner for the configured device, reporting to the terminal.
fn provisioner(cli: &Cli, config: &Config, pb: &ProgressBar) -> Provisioner<NativeConnector> {
    let port = cli.port.clone().or_else(|| config.device.port.clone());
    if !cli.quiet {
        eprintln!(
            "{} Using {}",
            style("🔌").cyan(),
            port.as_deref().unwrap_or("auto-detected TKey")
        );
    }

    let quiet = cli.quiet;
    let pb = pb.clone();
    Provisioner::new(
        NativeConnector::default(),
        Locator::from_option(port),
        config.provision_config(cli.no_expect_close),
    )
    .with_observer(move |event| match event {
        ProvisionEvent::State(state) => debug!("Workflow state: {state:?}"),
        ProvisionEvent::ConfirmationRequired { budget, .. } => {
            if !quiet {
                pb.suspend(|| {
                    eprintln!(
                        "{} Touch the TKey to confirm (waiting up to {}s)",
                        style("👆").yellow(),
                        budget.as_secs()
                    );
                });
            }
        },
        ProvisionEvent::Progress { sent, total } => {
            pb.set_length(*total as u64);
            pb.set_position(*sent as u64);
        },
    })
}

fn done(cli: &Cli, message: &str) {
    if !cli.quiet {
        eprintln!("\n{} {message}", style("🎉").green().bold());
    }
}

/// Install command implementation.
pub(crate) fn cmd_install(
    cli: &Cli,
    config: &Config,
    app: &Path,
    sig: Option<&Path>,
) -> Result<()> {
    let sig_path = sig.map_or_else(|| default_sig_path(app), Path::to_path_buf);

    let image = sigfile::read_image_file(app)
        .with_context(|| format!("Failed to read app {}", app.display()))?;
    let signature = sigfile::read_signature_file(&sig_path)
        .with_context(|| format!("Failed to read signature {}", sig_path.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Installing {} ({} bytes)",
            style("📦").cyan(),
            app.display(),
            image.len()
        );
    }

    let pb = progress_bar(Workflow::Install, cli.quiet);
    let result = provisioner(cli, config, &pb).install(&image, &signature);
    pb.finish_and_clear();
    result?;

    done(cli, "App installed");
    Ok(())
}

/// Boot command implementation.
pub(crate) fn cmd_boot(
    cli: &Cli,
    config: &Config,
    app: &Path,
    sig: Option<&Path>,
    public_key: Option<&Path>,
    verifier: Option<&Path>,
) -> Result<()> {
    let sig_path = sig.map_or_else(|| default_sig_path(app), Path::to_path_buf);
    let verifier_path = verifier
        .map(Path::to_path_buf)
        .or_else(|| config.boot.verifier.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "boot needs the verifier app: pass --verifier or set boot.verifier in tkey-mgt.toml"
                    .to_string(),
            )
        })?;

    let image = sigfile::read_image_file(app)
        .with_context(|| format!("Failed to read app {}", app.display()))?;
    let signature = sigfile::read_signature_file(&sig_path)
        .with_context(|| format!("Failed to read signature {}", sig_path.display()))?;
    let verifier_image = sigfile::read_image_file(&verifier_path)
        .with_context(|| format!("Failed to read verifier {}", verifier_path.display()))?;
    let key = public_key
        .map(|path| {
            sigfile::read_public_key_file(path)
                .with_context(|| format!("Failed to read public key {}", path.display()))
        })
        .transpose()?;

    if !cli.quiet {
        eprintln!(
            "{} Booting {} through {}",
            style("📦").cyan(),
            app.display(),
            verifier_path.display()
        );
    }

    let pb = progress_bar(Workflow::Boot, cli.quiet);
    let result =
        provisioner(cli, config, &pb).boot(&image, &signature, &verifier_image, key.as_ref());
    pb.finish_and_clear();
    result?;

    done(cli, "Signature verified, app started");
    Ok(())
}

/// Erase-areas command implementation.
pub(crate) fn cmd_erase_areas(cli: &Cli, config: &Config, yes: bool) -> Result<()> {
    confirm_destructive(cli, yes, "Erase all storage areas on the TKey?")?;

    let pb = progress_bar(Workflow::EraseAll, cli.quiet);
    provisioner(cli, config, &pb).erase_all()?;

    done(cli, "Storage areas erased");
    Ok(())
}

/// Install-pubkey command implementation.
pub(crate) fn cmd_install_pubkey(
    cli: &Cli,
    config: &Config,
    public_key: &Path,
    yes: bool,
) -> Result<()> {
    let key = sigfile::read_public_key_file(public_key)
        .with_context(|| format!("Failed to read public key {}", public_key.display()))?;
    confirm_destructive(
        cli,
        yes,
        "Replace the public key the verifier trusts? Apps signed for the old key stop booting.",
    )?;

    let pb = progress_bar(Workflow::RotatePublicKey, cli.quiet);
    provisioner(cli, config, &pb).rotate_public_key(&key)?;

    done(cli, "Public key installed");
    Ok(())
}

/// Reset command implementation.
pub(crate) fn cmd_reset(
    cli: &Cli,
    config: &Config,
    fw_reset_type: u8,
    verifier_reset_dst: u8,
    await_close: bool,
) -> Result<()> {
    let directive = ResetDirective::new(
        FirmwareResetType::try_from(fw_reset_type).map_err(|e| CliError::Usage(e.to_string()))?,
        VerifierDestination::try_from(verifier_reset_dst)
            .map_err(|e| CliError::Usage(e.to_string()))?,
    );

    let pb = progress_bar(Workflow::Reset, cli.quiet);
    provisioner(cli, config, &pb).reset(directive, await_close)?;

    done(cli, "Reset sent");
    Ok(())
}
