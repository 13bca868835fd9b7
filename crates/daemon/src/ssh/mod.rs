// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Maccaronia Tunnel Contributors

//! SSH tunnel supervision.
//!
//! The transport itself is the system `ssh` client. This module builds its
//! arguments, launches it behind the [`ProcessLauncher`] seam, owns the
//! local listener that applications connect to, and reports unexpected
//! process exits.

pub mod command;
pub mod credentials;
pub mod process;
pub mod supervisor;

pub use command::{Forwarding, SshCommand};
pub use process::{ProcessLauncher, SystemLauncher, TunnelProcess};
pub use supervisor::{
    SshSupervisor, SupervisorError, SupervisorEvent, SupervisorSettings, SupervisorState,
    TunnelLiveness,
};
