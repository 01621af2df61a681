//! # U-Boot environment files
//!
//! An environment is a flat `key=value` table that U-Boot reads at boot.
//! On disk each copy is a fixed-size block:
//!
//! ```text
//! | crc32 (LE) | [flags] | key=value\0 ... key=value\0 \0 | zero padding |
//! ```
//!
//! The CRC covers everything after the header. The flags byte is only
//! present for redundant environments, where the file holds two such
//! copies back to back and the flags byte is a generation counter used to
//! pick the most recent valid copy. A save always goes to the copy that
//! is *not* currently active, so an interrupted write leaves the previous
//! copy readable.

use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;

use anyhow::{Context, Result};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

/// Size of the CRC32 at the start of every copy.
const CRC_SIZE: usize = 4;

bitflags! {
    /// Flags controlling how an environment is opened or created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Tolerate one corrupted copy of a redundant environment and
        /// skip entries that cannot be parsed.
        const BEST_EFFORT = 1 << 0;
        /// The environment is a single copy without a flags byte.
        const NO_REDUND = 1 << 1;
    }
}

/// Ways in which an environment file can be malformed.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A copy is too short to even hold its header.
    #[error("environment copy of {0} bytes is smaller than its header")]
    TooSmall(usize),
    /// The stored checksum does not match the data.
    #[error("bad CRC {0:#010x} != {1:#010x}")]
    BadCrc(u32, u32),
    /// An entry is not of the form `key=value`.
    #[error("cannot parse {0:?} as key=value pair")]
    Parse(String),
    /// A redundant environment must consist of two equally sized copies.
    #[error("redundant environment has odd length {0}")]
    OddLength(usize),
    /// Every copy of the environment is corrupted.
    #[error("no valid environment copy")]
    NoValidCopy,
    /// A name containing `=` or NUL, an empty name, or a value containing
    /// NUL cannot be stored.
    #[error("invalid variable {0:?}")]
    InvalidVariable(String),
    /// The variables do not fit into the environment.
    #[error("environment needs {0} bytes, only {1} available")]
    TooBig(usize, usize),
}

fn header_size(redundant: bool) -> usize {
    CRC_SIZE + usize::from(redundant)
}

/// Generation counters wrap around; `a` is newer if it is at most half
/// the counter space ahead of `b`.
fn is_newer(a: u8, b: u8) -> bool {
    (a.wrapping_sub(b) as i8) > 0
}

#[derive(Debug)]
struct EnvCopy {
    generation: u8,
    data: BTreeMap<String, String>,
}

fn parse_entries(payload: &[u8], best_effort: bool) -> Result<BTreeMap<String, String>, Error> {
    let mut out = BTreeMap::new();
    for entry in payload.split(|&b| b == 0) {
        // Erased flash reads back as 0xff
        if entry.is_empty() || entry[0] == 0xff {
            continue;
        }
        let kv = std::str::from_utf8(entry)
            .ok()
            .and_then(|s| s.split_once('='))
            .filter(|(k, _)| !k.is_empty());
        match kv {
            Some((k, v)) => {
                out.insert(k.to_owned(), v.to_owned());
            }
            None if best_effort => {
                tracing::debug!(
                    "Skipping unparsable entry {:?}",
                    String::from_utf8_lossy(entry)
                );
            }
            None => return Err(Error::Parse(String::from_utf8_lossy(entry).into_owned())),
        }
    }
    Ok(out)
}

fn parse_copy(buf: &[u8], redundant: bool, best_effort: bool) -> Result<EnvCopy, Error> {
    let hdr = header_size(redundant);
    if buf.len() < hdr {
        return Err(Error::TooSmall(buf.len()));
    }
    let (header, payload) = buf.split_at(hdr);
    let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let actual = crc32fast::hash(payload);
    if stored != actual {
        return Err(Error::BadCrc(stored, actual));
    }
    let generation = if redundant { header[CRC_SIZE] } else { 0 };
    // A double NUL terminates the variables; the rest is padding.
    let end = payload
        .windows(2)
        .position(|w| w == [0, 0])
        .unwrap_or(payload.len());
    let data = parse_entries(&payload[..end], best_effort)?;
    Ok(EnvCopy { generation, data })
}

/// An open U-Boot environment.
#[derive(Debug)]
pub struct Env {
    path: Utf8PathBuf,
    /// Size of a single copy, header included.
    size: usize,
    redundant: bool,
    /// Slot of the most recently saved copy; `None` for a newly
    /// created environment that was never saved.
    active: Option<usize>,
    generation: u8,
    data: BTreeMap<String, String>,
}

impl Env {
    /// Create a new, empty redundant environment whose copies are `size`
    /// bytes each. Nothing is written until [`Env::save`], which replaces
    /// any existing file.
    pub fn create(path: &Utf8Path, size: usize) -> Result<Self> {
        Self::create_with_flags(path, size, OpenFlags::empty())
    }

    /// Like [`Env::create`]; `OpenFlags::NO_REDUND` creates a single-copy
    /// environment.
    #[context("Creating environment {path}")]
    pub fn create_with_flags(path: &Utf8Path, size: usize, flags: OpenFlags) -> Result<Self> {
        let redundant = !flags.contains(OpenFlags::NO_REDUND);
        if size <= header_size(redundant) {
            return Err(Error::TooSmall(size).into());
        }
        Ok(Self {
            path: path.to_owned(),
            size,
            redundant,
            active: None,
            generation: 0,
            data: BTreeMap::new(),
        })
    }

    /// Open an existing redundant environment, failing on any corruption.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        Self::open_with_flags(path, OpenFlags::empty())
    }

    /// Open an existing environment.
    #[context("Opening environment {path}")]
    pub fn open_with_flags(path: &Utf8Path, flags: OpenFlags) -> Result<Self> {
        let buf = std::fs::read(path)?;
        let best_effort = flags.contains(OpenFlags::BEST_EFFORT);

        if flags.contains(OpenFlags::NO_REDUND) {
            let copy = parse_copy(&buf, false, best_effort)?;
            return Ok(Self {
                path: path.to_owned(),
                size: buf.len(),
                redundant: false,
                active: Some(0),
                generation: 0,
                data: copy.data,
            });
        }

        if buf.len() % 2 != 0 {
            return Err(Error::OddLength(buf.len()).into());
        }
        let size = buf.len() / 2;
        if size < header_size(true) {
            return Err(Error::TooSmall(size).into());
        }

        let mut newest: Option<(usize, EnvCopy)> = None;
        for (slot, chunk) in buf.chunks_exact(size).enumerate() {
            let copy = match parse_copy(chunk, true, best_effort) {
                Ok(c) => c,
                Err(e) if best_effort => {
                    tracing::warn!("Ignoring corrupted copy {slot} of {path}: {e}");
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("Copy {slot}")),
            };
            newest = match newest {
                Some((s, cur)) if !is_newer(copy.generation, cur.generation) => Some((s, cur)),
                _ => Some((slot, copy)),
            };
        }
        let (slot, copy) = newest.ok_or(Error::NoValidCopy)?;
        tracing::debug!(
            "Using copy {slot} (generation {}) of {path}",
            copy.generation
        );
        Ok(Self {
            path: path.to_owned(),
            size,
            redundant: true,
            active: Some(slot),
            generation: copy.generation,
            data: copy.data,
        })
    }

    /// The value of `key`, or the empty string if it is unset.
    pub fn get(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Set `key` to `value`; an empty value removes the variable, as in
    /// U-Boot's `setenv`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if key.is_empty() || key.contains(['=', '\0']) || value.contains('\0') {
            return Err(Error::InvalidVariable(key.to_owned()));
        }
        if value.is_empty() {
            self.data.remove(key);
        } else {
            self.data.insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    /// Iterate over all variables, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Size of a single copy in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this environment keeps two copies.
    pub fn is_redundant(&self) -> bool {
        self.redundant
    }

    /// Generation counter of the active copy. Incremented by every save
    /// of a redundant environment; always zero otherwise.
    pub fn generation(&self) -> u8 {
        self.generation
    }

    /// Write the environment back to disk.
    pub fn save(&mut self) -> Result<()> {
        self.write()
            .with_context(|| format!("Saving environment {}", self.path))
    }

    fn serialize(&self, generation: u8) -> Result<Vec<u8>, Error> {
        let hdr = header_size(self.redundant);
        let mut buf = vec![0u8; hdr];
        for (k, v) in &self.data {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        buf.push(0);
        if buf.len() > self.size {
            return Err(Error::TooBig(buf.len(), self.size));
        }
        buf.resize(self.size, 0);
        let crc = crc32fast::hash(&buf[hdr..]);
        buf[..CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        if self.redundant {
            buf[CRC_SIZE] = generation;
        }
        Ok(buf)
    }

    fn write(&mut self) -> Result<()> {
        let generation = if self.redundant {
            self.generation.wrapping_add(1)
        } else {
            0
        };
        let copy = self.serialize(generation)?;
        match (self.redundant, self.active) {
            (true, Some(active)) => {
                let slot = 1 - active;
                let f = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&self.path)?;
                f.write_all_at(&copy, (slot * self.size) as u64)?;
                f.sync_data()?;
                tracing::debug!("Wrote generation {generation} to copy {slot} of {}", self.path);
                self.active = Some(slot);
            }
            (true, None) => {
                // First save of a new environment: initialize both copies,
                // the second one a generation behind.
                let mut older = copy.clone();
                older[CRC_SIZE] = self.generation;
                let mut image = copy;
                image.extend_from_slice(&older);
                self.replace_contents(&image)?;
                self.active = Some(0);
            }
            (false, _) => {
                self.replace_contents(&copy)?;
                self.active = Some(0);
            }
        }
        self.generation = generation;
        Ok(())
    }

    fn replace_contents(&self, buf: &[u8]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid environment path {}", self.path))?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        dir.atomic_write(name, buf)?;
        tracing::debug!("Replaced {}", self.path);
        Ok(())
    }
}
