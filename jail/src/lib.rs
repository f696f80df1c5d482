//! The jail: stages a disposable sandbox directory, lowers privileges,
//! drives the sandbox crate's subprocess runner (directly or through a
//! proxy helper), and performs adversary-aware cleanup once the child has
//! exited.
//!
//! This crate is the public surface a host application depends on;
//! `sandbox` and `jail-proxy` are its implementation layers.
//!

#[macro_use]
extern crate error_chain;
extern crate log;

mod config;
mod error;
mod languages;
mod orchestrator;

pub use config::{CommandSpec, ConfigProvider, LimitsOverride, StaticConfig};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use languages::{json_safe, LanguageBinding, PlainBinding, PythonBinding};
pub use orchestrator::{EvaluateExtras, Jail, JobRequest, JobResult};

pub use sandbox::{Limits, Proxy};
