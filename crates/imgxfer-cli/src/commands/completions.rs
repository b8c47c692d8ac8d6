//! Shell completions generation.

use std::io;

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use super::{Cli, ShellType};

impl From<ShellType> for Shell {
    fn from(shell: ShellType) -> Self {
        match shell {
            ShellType::Bash => Self::Bash,
            ShellType::Zsh => Self::Zsh,
            ShellType::Fish => Self::Fish,
            ShellType::PowerShell => Self::PowerShell,
            ShellType::Elvish => Self::Elvish,
        }
    }
}

/// Generate completions and print to stdout.
pub fn run(shell: ShellType) {
    let mut cmd = Cli::command();
    generate(Shell::from(shell), &mut cmd, "imgxfer", &mut io::stdout());
}
