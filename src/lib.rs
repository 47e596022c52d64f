//! Hardlink-based retention vault and sweep/drain daemon for shared POSIX
//! filesystems.
//!
//! A *vault* is a `.vault` directory at the root of a homogroupic subtree
//! (see [`vault::Vault::locate`]), holding hardlinks into branches
//! (`keep`, `archive`, `stash`, `staged`, `limbo`) that a user or the
//! [`sweeper`] moves files through over time. The [`key`] module is the
//! bijection between an inode/path pair and its on-disk hardlink name.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod consensus;
pub mod drainer;
pub mod error;
pub mod identity;
pub mod key;
pub mod mail;
pub mod notifier;
pub mod persistence;
pub mod sweeper;
pub mod vault;
pub mod walker;
