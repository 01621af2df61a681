use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

/// Returns true if `path` exists. Any error from the underlying
/// check (e.g. permission denied on a parent directory) reads as
/// "does not exist".
pub fn file_exists(path: &Utf8Path) -> bool {
    path.try_exists().unwrap_or(false)
}

/// Copy `src` to `dst`, replacing any existing file at `dst`.
/// The parent directory of `dst` must already exist.
#[context("Copying {src} to {dst}")]
pub fn copy_file_overwrite(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let n = std::fs::copy(src, dst).context("copy")?;
    tracing::trace!("Copied {n} bytes to {dst}");
    Ok(())
}

/// Recursively copy the directory `src` to `dst`, replacing existing
/// files. Returns the number of files copied.
#[context("Copying directory {src} to {dst}")]
pub fn copy_dir_all(src: &Utf8Path, dst: &Utf8Path) -> Result<usize> {
    std::fs::create_dir_all(dst).with_context(|| format!("Creating {dst}"))?;
    let mut n = 0;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            n += copy_dir_all(entry.path(), &target)?;
        } else {
            copy_file_overwrite(entry.path(), &target)?;
            n += 1;
        }
    }
    Ok(n)
}

/// Recursively remove `path`; a missing path is not an error.
#[context("Removing {path}")]
pub fn remove_dir_all_optional(path: &Utf8Path) -> Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        (td, p)
    }

    #[test]
    fn test_file_exists() {
        let (_td, d) = utf8_tempdir();
        let p = d.join("foo");
        assert!(!file_exists(&p));
        std::fs::write(&p, "x").unwrap();
        assert!(file_exists(&p));
        // Below a regular file is ENOTDIR, not an error for us
        assert!(!file_exists(&p.join("bar")));
    }

    #[test]
    fn test_copy_overwrite() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let src = d.join("src");
        let dst = d.join("dst");
        std::fs::write(&src, "new contents")?;
        std::fs::write(&dst, "some much longer old contents")?;
        copy_file_overwrite(&src, &dst)?;
        assert_eq!(std::fs::read_to_string(&dst)?, "new contents");

        let missing = d.join("missing");
        let e = copy_file_overwrite(&missing, &dst).unwrap_err();
        assert!(format!("{e:#}").contains("Copying"));
        assert_eq!(std::fs::read_to_string(&dst)?, "new contents");
        Ok(())
    }

    #[test]
    fn test_copy_dir_all() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let src = d.join("src");
        std::fs::create_dir_all(src.join("sub/empty"))?;
        std::fs::write(src.join("top"), "top")?;
        std::fs::write(src.join("sub/nested"), "nested")?;
        let dst = d.join("dst");
        std::fs::create_dir_all(&dst)?;
        std::fs::write(dst.join("top"), "old")?;
        assert_eq!(copy_dir_all(&src, &dst)?, 2);
        assert_eq!(std::fs::read_to_string(dst.join("top"))?, "top");
        assert_eq!(std::fs::read_to_string(dst.join("sub/nested"))?, "nested");
        assert!(dst.join("sub/empty").is_dir());
        Ok(())
    }

    #[test]
    fn test_remove_dir_all_optional() -> Result<()> {
        let (_td, d) = utf8_tempdir();
        let sub = d.join("a/b/c");
        std::fs::create_dir_all(&sub)?;
        std::fs::write(sub.join("f"), "x")?;
        assert!(remove_dir_all_optional(&d.join("a"))?);
        assert!(!d.join("a").exists());
        assert!(!remove_dir_all_optional(&d.join("a"))?);
        Ok(())
    }
}
