//! Mounting module.
//!
//! This module provides:
//! - The LIFO stack of performed mounts (`stack`)
//! - The ordered mount/bind sequence and forced unmount (`helper`)
//! - The `MountEngine` state machine (`engine`)

pub mod engine;
pub mod helper;
pub mod stack;

pub use engine::{MountArgs, MountEngine, MountOutcome, MountState, MountStatus, Pkcs11State};
pub use helper::MountHelper;
pub use stack::{MountPoint, MountStack};
