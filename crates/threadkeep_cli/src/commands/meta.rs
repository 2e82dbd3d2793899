//! Shell completions and man pages.

use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;

use crate::Cli;

const BIN_NAME: &str = "threadkeep";

fn completion_script(shell: clap_complete::Shell) -> Vec<u8> {
    let mut out = Vec::new();
    clap_complete::generate(shell, &mut Cli::command(), BIN_NAME, &mut out);
    out
}

fn render_man_page() -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    clap_mangen::Man::new(Cli::command()).render(&mut out)?;
    Ok(out)
}

pub(crate) fn handle_completions(
    shell: clap_complete::Shell,
) -> Result<(), Box<dyn std::error::Error>> {
    std::io::stdout().write_all(&completion_script(shell))?;
    Ok(())
}

/// Print the main man page, or write one page per subcommand into `output`.
pub(crate) fn handle_man(output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = output else {
        std::io::stdout().write_all(&render_man_page()?)?;
        return Ok(());
    };

    std::fs::create_dir_all(&dir)?;
    clap_mangen::generate_to(Cli::command(), &dir)?;
    println!("Generated man pages in: {}", dir.display());
    Ok(())
}
