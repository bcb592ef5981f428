//! Shell completion generation.

use {
    crate::Cli,
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    std::io,
};

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
