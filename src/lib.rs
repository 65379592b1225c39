//! # nfsvol
//!
//! `nfsvol` is a Docker volume plugin that attaches NFS exports to containers.
//! Each named volume is mounted once under a mount root, no matter how many
//! containers use it, and unmounted when the last one lets go. The volume
//! table is persisted next to the mounts so a restarted plugin picks up
//! where it left off.
//!
//! External commands (`mount`, `umount`, `mountpoint`) run through
//! [`invoker`], which kills the whole process group when an operation times
//! out or is cancelled.
pub mod cmd;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod invoker;
pub mod logging;
pub mod mountchecker;
pub mod mounter;
pub mod path;
pub mod signal;
pub mod syncmap;
pub mod volume;
