//! Container lifecycle for the burrow runtime.
//!
//! - [`launcher`] starts containers and sequences their root filesystem,
//!   resource limits and network attachment around the new process.
//! - [`init`] is the in-namespace half that execs the user command.
//! - [`state`] persists [`container::ContainerRecord`]s.
//! - [`engine`] adds the management actions used after launch.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod control;
pub mod engine;
pub mod exec;
pub mod init;
pub mod launcher;
pub mod logs;
pub mod process;
pub mod state;
