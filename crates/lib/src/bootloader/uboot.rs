//! # U-Boot
//!
//! U-Boot reads its variables from an environment file on the boot
//! partition. Two flavors exist: a redundant environment holding two
//! copies of the variables (`uboot`) and a single-copy one (`uboot-nr`).
//! Both share the same path policy and differ only in their directory
//! names and in how the environment file is opened and created.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bootenv_envstore::{Env, OpenFlags};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use super::assets::{
    extract_kernel_assets_to_boot_dir, remove_kernel_assets_from_boot_dir, KernelArchive,
    KernelRevision, KERNEL_ASSETS,
};
use super::options::{Options, Role};
use super::{
    generic_install_boot_config, Bootloader, BootloaderError,
    ExtractedRecoveryKernelImageBootloader,
};

/// Size of a freshly created environment.
pub const ENV_SIZE: usize = 4096;
/// The environment file name used by default.
const UBOOT_ENV: &str = "uboot.env";
/// The environment file name used when a role is set.
const BOOT_SEL: &str = "boot.sel";

/// The literal paths of one U-Boot flavor.
#[derive(Debug)]
pub(crate) struct VariantPaths {
    name: &'static str,
    default_basedir: &'static str,
    /// Used when the bootloader partition is accessed directly rather
    /// than through `/boot`.
    partition_basedir: &'static str,
}

const REDUNDANT_PATHS: VariantPaths = VariantPaths {
    name: "uboot",
    default_basedir: "/boot/uboot/",
    partition_basedir: "/uboot/ubuntu/",
};

const NO_REDUND_PATHS: VariantPaths = VariantPaths {
    name: "uboot-nr",
    default_basedir: "/boot/uboot-nr/",
    partition_basedir: "/uboot-nr/ubuntu/",
};

/// Which flavor of U-Boot environment is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UbootKind {
    /// Two copies of the environment in one file.
    #[value(name = "uboot")]
    Redundant,
    /// A single copy.
    #[value(name = "uboot-nr")]
    NoRedund,
}

impl UbootKind {
    /// All flavors, in lookup order.
    pub const ALL: [UbootKind; 2] = [UbootKind::Redundant, UbootKind::NoRedund];

    fn paths(self) -> &'static VariantPaths {
        match self {
            UbootKind::Redundant => &REDUNDANT_PATHS,
            UbootKind::NoRedund => &NO_REDUND_PATHS,
        }
    }

    /// The bootloader name, also the stem of its gadget config file.
    pub fn name(self) -> &'static str {
        self.paths().name
    }

    fn into_variant(self, rootdir: Utf8PathBuf) -> Box<dyn UbootVariant> {
        let base = PathBase::new(rootdir);
        match self {
            UbootKind::Redundant => Box::new(RedundantEnv { base }),
            UbootKind::NoRedund => Box::new(NoRedundEnv { base }),
        }
    }
}

/// Where the environment lives below the root directory.
#[derive(Debug, Default)]
pub(crate) struct PathBase {
    rootdir: Utf8PathBuf,
    basedir: String,
    env_file_name: String,
}

impl PathBase {
    fn new(rootdir: Utf8PathBuf) -> Self {
        Self {
            rootdir,
            ..Default::default()
        }
    }

    /// The directory holding the environment file.
    ///
    /// # Panics
    ///
    /// If the root directory is unset.
    pub(crate) fn directory(&self) -> Utf8PathBuf {
        if self.rootdir.as_str().is_empty() {
            panic!("internal error: unset rootdir");
        }
        self.rootdir.join(self.basedir.trim_matches('/'))
    }

    pub(crate) fn environment_file(&self) -> Utf8PathBuf {
        self.directory().join(&self.env_file_name)
    }

    pub(crate) fn root_directory(&self) -> &Utf8Path {
        &self.rootdir
    }
    /// Whether a basedir and file name have been applied.
    fn is_configured(&self) -> bool {
        !self.env_file_name.is_empty()
    }
}

/// The operations that differ between the U-Boot flavors.
pub(crate) trait UbootVariant: std::fmt::Debug {
    fn paths(&self) -> &'static VariantPaths;
    fn base(&self) -> &PathBase;
    fn base_mut(&mut self) -> &mut PathBase;
    fn create_store(&self, path: &Utf8Path, size: usize) -> Result<Env>;
    fn open_store(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Env>;

    fn name(&self) -> &'static str {
        self.paths().name
    }

    fn set_defaults(&mut self) {
        let paths = self.paths();
        let base = self.base_mut();
        base.basedir = paths.default_basedir.to_owned();
        base.env_file_name = UBOOT_ENV.to_owned();
    }

    fn process_options(&mut self, opts: Option<&Options>) {
        let Some(opts) = opts else {
            return;
        };
        let paths = self.paths();
        let base = self.base_mut();
        match (opts.role, opts.no_slash_boot) {
            // The partition is accessed directly, which also always means
            // the boot.sel file rather than a full environment.
            (Role::Recovery, _) | (_, true) => {
                base.basedir = paths.partition_basedir.to_owned();
                base.env_file_name = BOOT_SEL.to_owned();
            }
            (Role::RunMode, false) => {
                base.env_file_name = BOOT_SEL.to_owned();
            }
            (Role::None, false) => {}
        }
        tracing::trace!(
            "{}: using {} in {}",
            paths.name,
            base.env_file_name,
            base.basedir
        );
    }
}

#[derive(Debug)]
struct RedundantEnv {
    base: PathBase,
}

impl UbootVariant for RedundantEnv {
    fn paths(&self) -> &'static VariantPaths {
        &REDUNDANT_PATHS
    }

    fn base(&self) -> &PathBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PathBase {
        &mut self.base
    }

    fn create_store(&self, path: &Utf8Path, size: usize) -> Result<Env> {
        Env::create(path, size)
    }

    fn open_store(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Env> {
        Env::open_with_flags(path, flags)
    }
}

#[derive(Debug)]
struct NoRedundEnv {
    base: PathBase,
}

impl UbootVariant for NoRedundEnv {
    fn paths(&self) -> &'static VariantPaths {
        &NO_REDUND_PATHS
    }

    fn base(&self) -> &PathBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PathBase {
        &mut self.base
    }

    fn create_store(&self, path: &Utf8Path, size: usize) -> Result<Env> {
        Env::create_with_flags(path, size, OpenFlags::NO_REDUND)
    }

    fn open_store(&self, path: &Utf8Path, flags: OpenFlags) -> Result<Env> {
        Env::open_with_flags(path, flags | OpenFlags::NO_REDUND)
    }
}

/// A U-Boot bootloader rooted at some directory.
#[derive(Debug)]
pub struct Uboot {
    variant: Box<dyn UbootVariant>,
}

impl Uboot {
    /// Create a bootloader of the given flavor below `rootdir`.
    pub fn new(
        kind: UbootKind,
        rootdir: impl Into<Utf8PathBuf>,
        opts: Option<&Options>,
    ) -> Self {
        let mut variant = kind.into_variant(rootdir.into());
        variant.set_defaults();
        variant.process_options(opts);
        Self { variant }
    }

    /// Create a bootloader without any paths set up yet. Only
    /// [`Bootloader::install_boot_config`] is meaningful on it; it applies
    /// the defaults and then, for an empty gadget config, the options
    /// passed to it.
    pub fn new_unconfigured(kind: UbootKind, rootdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            variant: kind.into_variant(rootdir.into()),
        }
    }

    /// The directory holding the environment file.
    pub fn directory(&self) -> Utf8PathBuf {
        self.variant.base().directory()
    }

    /// The full path to the environment file.
    pub fn environment_file(&self) -> Utf8PathBuf {
        self.variant.base().environment_file()
    }

    /// The root directory everything is relative to.
    pub fn root_directory(&self) -> &Utf8Path {
        self.variant.base().root_directory()
    }

    /// Open the environment, tolerating a corrupted redundant copy.
    fn open_env(&self) -> Result<Env> {
        self.variant
            .open_store(&self.environment_file(), OpenFlags::BEST_EFFORT)
    }
}

impl Bootloader for Uboot {
    fn name(&self) -> &'static str {
        self.variant.name()
    }

    fn install_boot_config(&mut self, gadget_dir: &Utf8Path, opts: Option<&Options>) -> Result<()> {
        let gadget_file = gadget_dir.join(format!("{}.conf", self.name()));
        let st = std::fs::metadata(&gadget_file)
            .with_context(|| format!("Querying {gadget_file}"))?;
        if st.len() == 0 {
            // Some gadgets boot through a boot script which breaks if it
            // finds a populated environment, so an empty config means we
            // create our own empty environment instead of copying anything.
            if !self.variant.base().is_configured() {
                self.variant.set_defaults();
            }
            self.variant.process_options(opts);
            let env_file = self.environment_file();
            let dir = self.directory();
            std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
            let mut env = self.variant.create_store(&env_file, ENV_SIZE)?;
            env.save()?;
            tracing::debug!("Initialized empty environment {env_file}");
            return Ok(());
        }

        // We may not have been constructed through new()
        self.variant.set_defaults();

        if opts.is_some_and(|o| o.role == Role::Recovery) {
            return Err(BootloaderError::NonEmptyRecoveryEnvUnsupported.into());
        }

        generic_install_boot_config(&gadget_file, &self.environment_file())
    }

    fn present(&self) -> Result<bool> {
        Ok(bootenv_utils::file_exists(&self.environment_file()))
    }

    #[context("Setting boot variables")]
    fn set_boot_vars(&self, values: &HashMap<String, String>) -> Result<()> {
        let mut env = self.open_env()?;
        let mut dirty = false;
        for (k, v) in values {
            if env.get(k) == v {
                continue;
            }
            env.set(k, v)?;
            dirty = true;
        }
        if dirty {
            env.save()?;
        } else {
            tracing::debug!("Boot variables unchanged, not writing");
        }
        Ok(())
    }

    #[context("Reading boot variables")]
    fn get_boot_vars(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let env = self.open_env()?;
        Ok(names
            .iter()
            .map(|&name| (name.to_owned(), env.get(name).to_owned()))
            .collect())
    }

    fn extract_kernel_assets(
        &self,
        revision: &KernelRevision,
        archive: &dyn KernelArchive,
    ) -> Result<()> {
        let dst = self.directory().join(revision.filename());
        extract_kernel_assets_to_boot_dir(&dst, archive, KERNEL_ASSETS)
    }

    fn remove_kernel_assets(&self, revision: &KernelRevision) -> Result<()> {
        remove_kernel_assets_from_boot_dir(&self.directory(), revision)
    }
}

impl ExtractedRecoveryKernelImageBootloader for Uboot {
    fn extract_recovery_kernel_assets(
        &self,
        recovery_system_dir: &str,
        _revision: &KernelRevision,
        archive: &dyn KernelArchive,
    ) -> Result<()> {
        if recovery_system_dir.is_empty() {
            anyhow::bail!("internal error: recoverySystemDir unset");
        }
        let dst = self
            .root_directory()
            .join(recovery_system_dir.trim_start_matches('/'))
            .join("kernel");
        extract_kernel_assets_to_boot_dir(&dst, archive, KERNEL_ASSETS)
    }
}
