//! Kernel assets the bootloader loads directly from its own partition.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// The files copied out of a kernel for U-Boot; `dtbs/*` is a glob.
pub const KERNEL_ASSETS: &[&str] = &["kernel.img", "initrd.img", "dtbs/*"];

/// Identifies one revision of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRevision {
    /// Name of the kernel, e.g. `pi-kernel`.
    pub name: String,
    /// Revision, e.g. `42` or `x1`.
    pub revision: String,
}

impl KernelRevision {
    /// Create a new revision reference.
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
        }
    }

    /// The per-revision directory name assets are extracted into.
    pub fn filename(&self) -> String {
        format!("{}_{}.snap", self.name, self.revision)
    }
}

/// Source of kernel assets.
pub trait KernelArchive: std::fmt::Debug {
    /// Copy every entry matching `pattern` (relative to the archive root,
    /// possibly a glob) into `dst`, keeping its relative path; matched
    /// directories are copied with their contents. A plain
    /// name that matches nothing is an error, a glob may match nothing.
    fn unpack(&self, pattern: &str, dst: &Utf8Path) -> Result<()>;
}

/// A kernel that is already unpacked into a directory.
#[derive(Debug)]
pub struct DirArchive {
    root: Utf8PathBuf,
}

impl DirArchive {
    /// Use the directory `root` as archive.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl KernelArchive for DirArchive {
    #[context("Unpacking {pattern} from {}", self.root)]
    fn unpack(&self, pattern: &str, dst: &Utf8Path) -> Result<()> {
        let is_glob = pattern.contains(['*', '?', '[']);
        let full = format!("{}/{pattern}", glob::Pattern::escape(self.root.as_str()));
        let mut found = 0usize;
        for entry in glob::glob(&full)? {
            let src = Utf8PathBuf::try_from(entry?)?;
            let rel = src.strip_prefix(&self.root)?;
            let target = dst.join(rel);
            if src.is_dir() {
                found += bootenv_utils::copy_dir_all(&src, &target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
            }
            bootenv_utils::copy_file_overwrite(&src, &target)?;
            found += 1;
        }
        if found == 0 && !is_glob {
            anyhow::bail!("{pattern} not found");
        }
        tracing::trace!("Unpacked {found} files for {pattern}");
        Ok(())
    }
}

/// Copy `assets` out of `archive` into `dst`, creating it as needed.
#[context("Extracting kernel assets to {dst}")]
pub(crate) fn extract_kernel_assets_to_boot_dir(
    dst: &Utf8Path,
    archive: &dyn KernelArchive,
    assets: &[&str],
) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for asset in assets {
        archive.unpack(asset, dst)?;
    }
    Ok(())
}

/// Remove the assets of `revision` from `boot_dir`.
pub(crate) fn remove_kernel_assets_from_boot_dir(
    boot_dir: &Utf8Path,
    revision: &KernelRevision,
) -> Result<()> {
    let dir = boot_dir.join(revision.filename());
    if !bootenv_utils::remove_dir_all_optional(&dir)? {
        tracing::debug!("{dir} does not exist");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, p)
    }

    #[test]
    fn test_filename() {
        assert_eq!(
            KernelRevision::new("pi-kernel", "42").filename(),
            "pi-kernel_42.snap"
        );
    }

    #[test]
    fn test_extract_and_remove() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let kernel = d.join("kernel");
        std::fs::create_dir_all(kernel.join("dtbs/overlays"))?;
        std::fs::write(kernel.join("kernel.img"), "kernel")?;
        std::fs::write(kernel.join("initrd.img"), "initrd")?;
        std::fs::write(kernel.join("dtbs/foo.dtb"), "foo")?;
        std::fs::write(kernel.join("dtbs/bar.dtb"), "bar")?;
        std::fs::write(kernel.join("dtbs/overlays/vc4-kms-v3d.dtbo"), "overlay")?;
        std::fs::write(kernel.join("vmlinuz"), "not an asset")?;

        let boot = d.join("boot");
        let rev = KernelRevision::new("pi-kernel", "1");
        let dst = boot.join(rev.filename());
        extract_kernel_assets_to_boot_dir(&dst, &DirArchive::new(&kernel), KERNEL_ASSETS)?;
        assert_eq!(std::fs::read_to_string(dst.join("kernel.img"))?, "kernel");
        assert_eq!(std::fs::read_to_string(dst.join("initrd.img"))?, "initrd");
        assert_eq!(std::fs::read_to_string(dst.join("dtbs/foo.dtb"))?, "foo");
        assert_eq!(std::fs::read_to_string(dst.join("dtbs/bar.dtb"))?, "bar");
        assert!(!dst.join("vmlinuz").exists());
        assert_eq!(
            std::fs::read_to_string(dst.join("dtbs/overlays/vc4-kms-v3d.dtbo"))?,
            "overlay"
        );

        remove_kernel_assets_from_boot_dir(&boot, &rev)?;
        assert!(!dst.exists());
        // Removing twice is fine
        remove_kernel_assets_from_boot_dir(&boot, &rev)?;
        Ok(())
    }

    #[test]
    fn test_extract_no_dtbs() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let kernel = d.join("kernel");
        std::fs::create_dir_all(&kernel)?;
        std::fs::write(kernel.join("kernel.img"), "kernel")?;
        std::fs::write(kernel.join("initrd.img"), "initrd")?;
        let dst = d.join("dst");
        extract_kernel_assets_to_boot_dir(&dst, &DirArchive::new(&kernel), KERNEL_ASSETS)?;
        assert!(dst.join("kernel.img").exists());
        assert!(!dst.join("dtbs").exists());
        Ok(())
    }

    #[test]
    fn test_extract_missing_kernel() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let kernel = d.join("kernel");
        std::fs::create_dir_all(&kernel)?;
        std::fs::write(kernel.join("initrd.img"), "initrd")?;
        let e = extract_kernel_assets_to_boot_dir(
            &d.join("dst"),
            &DirArchive::new(&kernel),
            KERNEL_ASSETS,
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("kernel.img not found"));
        Ok(())
    }
}
