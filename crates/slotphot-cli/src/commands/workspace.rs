use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use slotphot_core::workspace::buffer::inspect;
use slotphot_core::workspace::Workspace;

#[derive(Args)]
pub struct WorkspaceArgs {
    /// Results folder of a pipeline run
    #[arg(default_value = "results")]
    pub results: PathBuf,
}

fn list_folder(folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Ok(());
    }
    let workspace = Workspace::new(folder)?;
    let names = workspace.list()?;
    if names.is_empty() {
        return Ok(());
    }
    println!("{}", folder.display());
    for name in names {
        let path = workspace.buffer_path(&name);
        let (dtype, shape) =
            inspect(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        println!("  {:<16}{:<6}{:?}", name, dtype, shape);
    }
    Ok(())
}

pub fn run(args: &WorkspaceArgs) -> Result<()> {
    let folders = [
        args.results.join("detection").join("sample"),
        args.results.join("detection").join("modelling"),
        args.results.join("modelling"),
    ];
    for folder in &folders {
        list_folder(folder)?;
    }
    Ok(())
}
