//! # Command line interface
//!
//! Thin wrapper over [`crate::bootloader`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::bootloader::{self, Bootloader, BootloaderError, Options, Role, Uboot, UbootKind};

/// Inspect and modify the U-Boot boot environment
#[derive(Debug, Parser)]
#[clap(name = "bootenv", version)]
pub struct Opt {
    /// Directory all bootloader paths are relative to
    #[clap(long, default_value = "/")]
    root: Utf8PathBuf,

    /// Bootloader flavor; detected if unset
    #[clap(long, value_enum)]
    variant: Option<UbootKind>,

    /// Boot stage to operate on
    #[clap(long, value_enum)]
    role: Option<Role>,

    /// The bootloader partition is not mounted at /boot
    #[clap(long)]
    no_slash_boot: bool,

    /// TOML file with a [bootloader] table; flags take precedence
    #[clap(long)]
    options_file: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print variables as NAME=VALUE; unset ones have an empty value
    Get {
        #[clap(required = true)]
        names: Vec<String>,
    },
    /// Set variables; an empty value unsets
    Set {
        #[clap(required = true, value_parser = parse_assignment)]
        values: Vec<(String, String)>,
    },
    /// Install the bootloader configuration shipped by a gadget
    Install {
        /// Directory containing the gadget's <bootloader>.conf
        #[clap(long)]
        gadget_dir: Utf8PathBuf,
    },
    /// Print whether the environment file exists
    Present,
    /// Print the path of the environment file
    Path,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected NAME=VALUE, got {s:?}")),
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<BootloaderError>() == Some(&BootloaderError::NotFound)
}

impl Opt {
    fn options(&self) -> Result<Options> {
        let mut opts = match self.options_file.as_deref() {
            Some(p) => Options::load(p)?,
            None => Options::default(),
        };
        if let Some(role) = self.role {
            opts.role = role;
        }
        if self.no_slash_boot {
            opts.no_slash_boot = true;
        }
        tracing::debug!("Using {opts:?}");
        Ok(opts)
    }

    fn bootloader(&self, opts: &Options) -> Result<Uboot> {
        match self.variant {
            Some(kind) => Ok(Uboot::new(kind, &self.root, Some(opts))),
            None => bootloader::find(&self.root, Some(opts)),
        }
    }
}

fn run_to(opt: Opt, out: &mut impl Write) -> Result<()> {
    let opts = opt.options()?;
    match &opt.cmd {
        Command::Get { names } => {
            let bl = opt.bootloader(&opts)?;
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let vars = bl.get_boot_vars(&names)?;
            for name in names {
                writeln!(out, "{name}={}", vars[name])?;
            }
        }
        Command::Set { values } => {
            let bl = opt.bootloader(&opts)?;
            let values: HashMap<String, String> = values.iter().cloned().collect();
            bl.set_boot_vars(&values)?;
        }
        Command::Install { gadget_dir } => {
            let mut bl = match opt.variant {
                Some(kind) => Uboot::new(kind, &opt.root, Some(&opts)),
                None => bootloader::for_gadget(gadget_dir, &opt.root, Some(&opts))?,
            };
            bl.install_boot_config(gadget_dir, Some(&opts))
                .with_context(|| format!("Installing {}", bl.name()))?;
        }
        Command::Present => {
            let present = match opt.bootloader(&opts) {
                Ok(bl) => bl.present()?,
                Err(e) if is_not_found(&e) => false,
                Err(e) => return Err(e),
            };
            writeln!(out, "{present}")?;
        }
        Command::Path => {
            let bl = opt.bootloader(&opts)?;
            writeln!(out, "{}", bl.environment_file())?;
        }
    }
    Ok(())
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    run_to(opt, &mut std::io::stdout().lock())
}
