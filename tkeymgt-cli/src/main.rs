//! tkey-mgt - provision, verify and boot signed apps on Tillitis TKey devices.
//!
//! ## Features
//!
//! - Install a signed app into the TKey's flash
//! - Boot an app through the on-device verifier
//! - Rotate the verifier's trusted public key
//! - Erase the device's storage areas
//! - Sign apps and export public keys from a seed file
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    tkeymgt::WorkflowError,
};

mod commands;
mod config;

use {
    commands::{
        completions::cmd_completions,
        keys::{cmd_export_pubkey, cmd_sign},
        ports::cmd_list_ports,
        provision::{cmd_boot, cmd_erase_areas, cmd_install, cmd_install_pubkey, cmd_reset},
    },
    config::Config,
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing input that clap could not catch.
    #[error("{0}")]
    Usage(String),
    /// The user declined or interrupted a prompt.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

/// tkey-mgt - Provision, verify and boot signed apps on Tillitis TKey devices.
///
/// Environment variables:
///   TKEY_MGT_PORT              - Serial port (auto-detected if not set)
///   TKEY_MGT_NO_EXPECT_CLOSE   - Do not wait for the port to close after a reset
///   TKEY_MGT_CONFIG            - Configuration file
///   TKEY_MGT_VERIFIER          - Verifier app binary used by `boot`
///   TKEY_MGT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "tkey-mgt")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port of the TKey (auto-detected if not specified).
    #[arg(short, long, global = true, env = "TKEY_MGT_PORT")]
    pub port: Option<String>,

    /// Do not wait for the port to close after a reset; sleep instead.
    #[arg(long, global = true, env = "TKEY_MGT_NO_EXPECT_CLOSE")]
    pub no_expect_close: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "TKEY_MGT_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "TKEY_MGT_NON_INTERACTIVE")]
    pub non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Install a signed app into flash.
    Install {
        /// App binary.
        #[arg(long, value_name = "PATH")]
        app: PathBuf,

        /// Signature file (defaults to APP.sig).
        #[arg(long, value_name = "PATH")]
        sig: Option<PathBuf>,
    },

    /// Load the verifier, have it check a signed app, and start the app.
    Boot {
        /// App binary.
        #[arg(long, value_name = "PATH")]
        app: PathBuf,

        /// Signature file (defaults to APP.sig).
        #[arg(long, value_name = "PATH")]
        sig: Option<PathBuf>,

        /// Public key to verify with instead of the one installed on the device.
        #[arg(long = "pub", value_name = "PATH")]
        public_key: Option<PathBuf>,

        /// Verifier app binary.
        #[arg(long, value_name = "PATH", env = "TKEY_MGT_VERIFIER")]
        verifier: Option<PathBuf>,
    },

    /// Erase all storage areas on the device.
    EraseAreas {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Replace the verifier's trusted public key.
    InstallPubkey {
        /// Public key file.
        #[arg(long = "pub", value_name = "PATH")]
        public_key: PathBuf,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Send a raw reset directive.
    Reset {
        /// Firmware reset type (0-6).
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=6))]
        fw_reset_type: u8,

        /// Verifier destination after reset (0 = app slot 1, 1 = command mode).
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
        verifier_reset_dst: u8,

        /// Wait for the port to close.
        #[arg(long)]
        await_close: bool,
    },

    /// Sign an app binary with a seed file.
    Sign {
        /// File to sign.
        #[arg(long, value_name = "PATH")]
        message: PathBuf,

        /// Hex-encoded Ed25519 seed.
        #[arg(long, value_name = "PATH")]
        seed: PathBuf,

        /// Output signature file (defaults to MESSAGE.sig).
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Write the public key belonging to a seed file.
    ExportPubkey {
        /// Hex-encoded Ed25519 seed.
        #[arg(long, value_name = "PATH")]
        seed: PathBuf,

        /// Output public key file.
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
    },

    /// List attached TKeys.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Include serial ports that are not TKeys.
        #[arg(long)]
        all: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "tkey-mgt v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Install { app, sig } => cmd_install(cli, config, app, sig.as_deref()),
        Commands::Boot {
            app,
            sig,
            public_key,
            verifier,
        } => cmd_boot(
            cli,
            config,
            app,
            sig.as_deref(),
            public_key.as_deref(),
            verifier.as_deref(),
        ),
        Commands::EraseAreas { yes } => cmd_erase_areas(cli, config, *yes),
        Commands::InstallPubkey { public_key, yes } => {
            cmd_install_pubkey(cli, config, public_key, *yes)
        },
        Commands::Reset {
            fw_reset_type,
            verifier_reset_dst,
            await_close,
        } => cmd_reset(cli, config, *fw_reset_type, *verifier_reset_dst, *await_close),
        Commands::Sign { message, seed, out } => cmd_sign(cli, message, seed, out.as_deref()),
        Commands::ExportPubkey { seed, out } => cmd_export_pubkey(cli, seed, out),
        Commands::ListPorts { json, all } => cmd_list_ports(*json, *all),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Print a failed run to stderr.
fn report(err: &anyhow::Error) {
    eprintln!("{} {err:#}", style("Error:").red().bold());

    if let Some(workflow_err) = err.downcast_ref::<WorkflowError>() {
        if workflow_err.is_device_absent() {
            eprintln!(
                "  {} Is the TKey plugged in? Use {} to pick a port.",
                style("hint:").yellow(),
                style("--port").cyan()
            );
        } else if workflow_err.is_device_rejection() {
            eprintln!(
                "  {} The device refused the operation. Unplug it and start again.",
                style("hint:").yellow()
            );
        }
    }
}
