//! # Bootloader abstraction
//!
//! A [`Bootloader`] knows where its configuration lives below a root
//! directory, how to install it from a gadget, and how to read and write
//! the variables it uses to pick what to boot.

mod assets;
mod options;
mod uboot;

use std::collections::HashMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

pub use assets::{DirArchive, KernelArchive, KernelRevision, KERNEL_ASSETS};
pub use options::{Options, Role};
pub use uboot::{Uboot, UbootKind, ENV_SIZE};

/// Errors callers may want to act on.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BootloaderError {
    /// A gadget shipped a populated environment for a recovery system.
    #[error("non-empty recovery environment file not supported")]
    NonEmptyRecoveryEnvUnsupported,
    /// None of the known bootloaders matched.
    #[error("cannot determine bootloader")]
    NotFound,
}

/// Operations common to all bootloaders.
pub trait Bootloader: std::fmt::Debug {
    /// The name of the bootloader.
    fn name(&self) -> &'static str;

    /// Install the bootloader configuration shipped in `gadget_dir`.
    fn install_boot_config(&mut self, gadget_dir: &Utf8Path, opts: Option<&Options>)
        -> Result<()>;

    /// Whether the bootloader configuration exists.
    fn present(&self) -> Result<bool>;

    /// Set the given variables, writing only if something changed.
    fn set_boot_vars(&self, values: &HashMap<String, String>) -> Result<()>;

    /// Look up the given variables; unset ones map to the empty string.
    fn get_boot_vars(&self, names: &[&str]) -> Result<HashMap<String, String>>;

    /// Copy the kernel assets of `revision` into the boot directory.
    fn extract_kernel_assets(&self, revision: &KernelRevision, archive: &dyn KernelArchive)
        -> Result<()>;

    /// Remove the kernel assets of `revision` from the boot directory.
    fn remove_kernel_assets(&self, revision: &KernelRevision) -> Result<()>;
}

/// Bootloaders that load the recovery kernel from assets extracted next to
/// the recovery system.
pub trait ExtractedRecoveryKernelImageBootloader: Bootloader {
    /// Copy the kernel assets into `<root>/<recovery_system_dir>/kernel`.
    fn extract_recovery_kernel_assets(
        &self,
        recovery_system_dir: &str,
        revision: &KernelRevision,
        archive: &dyn KernelArchive,
    ) -> Result<()>;
}

/// Copy a gadget supplied configuration file into place.
#[context("Installing {gadget_file} to {system_file}")]
pub(crate) fn generic_install_boot_config(
    gadget_file: &Utf8Path,
    system_file: &Utf8Path,
) -> Result<()> {
    if let Some(parent) = system_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    bootenv_utils::copy_file_overwrite(gadget_file, system_file)
}

/// Find the bootloader a gadget ships a configuration file for.
#[context("Finding bootloader for gadget {gadget_dir}")]
pub fn for_gadget(
    gadget_dir: &Utf8Path,
    rootdir: impl Into<Utf8PathBuf>,
    opts: Option<&Options>,
) -> Result<Uboot> {
    for kind in UbootKind::ALL {
        let conf = gadget_dir.join(format!("{}.conf", kind.name()));
        if bootenv_utils::file_exists(&conf) {
            tracing::debug!("Found {conf}");
            return Ok(Uboot::new(kind, rootdir, opts));
        }
    }
    Err(BootloaderError::NotFound.into())
}

/// Find the bootloader whose configuration is present below `rootdir`.
#[context("Finding bootloader in {rootdir}")]
pub fn find(rootdir: &Utf8Path, opts: Option<&Options>) -> Result<Uboot> {
    for kind in UbootKind::ALL {
        let bl = Uboot::new(kind, rootdir, opts);
        if bl.present()? {
            tracing::debug!("Found {} at {}", bl.name(), bl.environment_file());
            return Ok(bl);
        }
    }
    Err(BootloaderError::NotFound.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(
        Bootloader,
        ExtractedRecoveryKernelImageBootloader,
        KernelArchive
    );

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, p)
    }

    #[test]
    fn test_for_gadget() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let gadget = d.join("gadget");
        std::fs::create_dir(&gadget)?;

        let e = for_gadget(&gadget, &d, None).unwrap_err();
        assert_eq!(
            e.downcast_ref::<BootloaderError>(),
            Some(&BootloaderError::NotFound)
        );

        std::fs::write(gadget.join("uboot-nr.conf"), "")?;
        let bl = for_gadget(&gadget, &d, None)?;
        assert_eq!(bl.name(), "uboot-nr");

        // The redundant flavor wins if both are shipped
        std::fs::write(gadget.join("uboot.conf"), "")?;
        let opts = Options {
            role: Role::RunMode,
            no_slash_boot: false,
        };
        let bl = for_gadget(&gadget, &d, Some(&opts))?;
        assert_eq!(bl.name(), "uboot");
        assert_eq!(bl.environment_file(), d.join("boot/uboot/boot.sel"));
        Ok(())
    }

    #[test]
    fn test_find() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let e = find(&d, None).unwrap_err();
        assert_eq!(
            e.downcast_ref::<BootloaderError>(),
            Some(&BootloaderError::NotFound)
        );

        let env = d.join("boot/uboot-nr/uboot.env");
        std::fs::create_dir_all(env.parent().unwrap())?;
        std::fs::write(&env, "")?;
        let bl = find(&d, None)?;
        assert_eq!(bl.name(), "uboot-nr");

        // Different options, different location
        let opts = Options {
            role: Role::RunMode,
            no_slash_boot: false,
        };
        assert!(find(&d, Some(&opts)).is_err());
        Ok(())
    }

    #[test]
    fn test_generic_install() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let src = d.join("uboot.conf");
        std::fs::write(&src, "gadget contents")?;
        let dst = d.join("root/boot/uboot/uboot.env");
        generic_install_boot_config(&src, &dst)?;
        assert_eq!(std::fs::read_to_string(&dst)?, "gadget contents");
        Ok(())
    }
}
