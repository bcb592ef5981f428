//! Command implementations.
//!
//! Each group of subcommands lives in its own module.

pub(crate) mod completions;
pub(crate) mod keys;
pub(crate) mod ports;
pub(crate) mod provision;

use {
    crate::{Cli, CliError},
    anyhow::Result,
    dialoguer::{Confirm, Error as DialoguerError, theme::ColorfulTheme},
    std::{
        io::IsTerminal,
        path::{Path, PathBuf},
    },
};

/// Ask before a destructive operation. `yes` skips the prompt; without a
/// terminal, or in non-interactive mode, `yes` is required.
pub(crate) fn confirm_destructive(cli: &Cli, yes: bool, prompt: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if cli.non_interactive || !interactive {
        let message = format!("{prompt} Pass --yes to confirm without a prompt.");
        return Err(CliError::Usage(message).into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("Aborted".to_string()).into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Aborted".to_string()).into()
            } else {
                CliError::Usage(format!("Prompt failed: {io_err}")).into()
            }
        },
    }
}

/// `path` with `.sig` appended to its file name.
pub(crate) fn default_sig_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sig");
    PathBuf::from(name)
}
