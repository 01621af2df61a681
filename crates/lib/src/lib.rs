//! # Boot environment management
//!
//! This crate locates, installs and edits the environment U-Boot reads
//! its variables from, and manages the kernel assets U-Boot loads
//! directly from the boot partition.

pub mod bootloader;
pub mod cli;
