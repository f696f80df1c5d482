//! The configuration surface: the pull interface the orchestrator consults
//! for command specs and limits, plus a YAML-backed implementation built at
//! startup.
//!

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use sandbox::{Limits, Proxy};

use crate::languages::{LanguageBinding, PlainBinding, PythonBinding};
use crate::Result;

/// A registered command the orchestrator may be asked to run.
#[derive(Clone)]
pub struct CommandSpec {
    /// Logical name, e.g. `"python"`. Unique within a registry.
    pub name: String,

    /// Absolute path to the interpreter or binary.
    pub bin_path: PathBuf,

    /// Sandbox user to run as, via `sudo -u`. `None` runs directly as the
    /// calling user.
    pub user: Option<String>,

    /// Fixed argv fragments placed before the caller-supplied argv.
    pub extra_argv: Vec<String>,

    /// The language capability attached to this command, if any.
    /// `evaluate` is available on a command iff this is `Some` and its
    /// `driver_template` returns `Some`.
    pub binding: Option<Arc<dyn LanguageBinding>>,
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("bin_path", &self.bin_path)
            .field("user", &self.user)
            .field("extra_argv", &self.extra_argv)
            .field("binding", &self.binding.is_some())
            .finish()
    }
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, bin_path: impl Into<PathBuf>) -> CommandSpec {
        CommandSpec {
            name: name.into(),
            bin_path: bin_path.into(),
            user: None,
            extra_argv: Vec::new(),
            binding: None,
        }
    }

    /// The built-in binding matching `name`, mirroring `jail.py`'s
    /// `default_language = languages.other` and
    /// `known_commands = {'python': languages.python2}` defaults (updated to
    /// Python 3).
    fn default_binding_for(name: &str) -> Arc<dyn LanguageBinding> {
        match name {
            "python" | "python3" => Arc::new(PythonBinding),
            _ => Arc::new(PlainBinding),
        }
    }
}

/// A partial patch over `Limits`: every field is optional, and only present
/// fields override the base snapshot when merged.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct LimitsOverride {
    pub cpu: Option<u64>,
    pub realtime: Option<u64>,
    pub vmem: Option<u64>,
    pub fsize: Option<u64>,
    pub nproc: Option<u64>,
    pub proxy: Option<bool>,
}

impl LimitsOverride {
    /// Merge this override on top of `base`, returning the resulting
    /// `Limits`. `PROXY` is deliberately excluded: callers must strip it out
    /// of per-context overrides before calling this (see
    /// `StaticConfig::get_overrides`), since `Limits.PROXY` may never be
    /// overridden per context.
    fn apply(&self, base: Limits) -> Limits {
        Limits {
            cpu: self.cpu.unwrap_or(base.cpu),
            realtime: self.realtime.unwrap_or(base.realtime),
            vmem: self.vmem.unwrap_or(base.vmem),
            fsize: self.fsize.unwrap_or(base.fsize),
            nproc: self.nproc.unwrap_or(base.nproc),
            proxy: base.proxy,
        }
    }

    /// Drop the `proxy` field, logging a warning once per call site that
    /// attempted to set it. Per-context overrides of `PROXY` are silently
    /// ignored other than this warning.
    fn without_proxy_override(mut self, context_key: &str) -> LimitsOverride {
        if self.proxy.take().is_some() {
            log::warn!("ignoring PROXY override for context {:?}: PROXY is global-only", context_key);
        }
        self
    }
}

/// Pull interface the orchestrator consults for configuration. Implementors
/// are expected to hold read-mostly, initialized-at-startup state.
pub trait ConfigProvider: Send + Sync {
    /// Look up a registered command by name.
    fn get_command(&self, name: &str) -> Option<CommandSpec>;

    /// The process-wide default limits.
    fn get_default_limits(&self) -> Limits;

    /// The partial override registered for `context_key`, or the empty
    /// override if none is registered.
    fn get_overrides(&self, context_key: &str) -> LimitsOverride;

    /// The default limits merged with the override for `context_key`.
    fn effective_limits(&self, context_key: &str) -> Limits {
        self.get_overrides(context_key).apply(self.get_default_limits())
    }
}

/// Raw shape of the YAML configuration document.
#[derive(Debug, Deserialize)]
struct RawConfig {
    commands: Vec<RawCommand>,
    default_limits: RawLimits,
    #[serde(default)]
    overrides: HashMap<String, LimitsOverride>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    name: String,
    bin_path: PathBuf,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    extra_argv: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    #[serde(default)]
    cpu: u64,
    #[serde(default)]
    realtime: u64,
    #[serde(default)]
    vmem: u64,
    #[serde(default)]
    fsize: u64,
    #[serde(default)]
    nproc: u64,
    #[serde(default)]
    proxy: Option<bool>,
}

impl From<RawLimits> for Limits {
    fn from(raw: RawLimits) -> Limits {
        Limits {
            cpu: raw.cpu,
            realtime: raw.realtime,
            vmem: raw.vmem,
            fsize: raw.fsize,
            nproc: raw.nproc,
            proxy: match raw.proxy {
                Some(true) => Proxy::On,
                Some(false) => Proxy::Off,
                None => Proxy::Inherit,
            },
        }
    }
}

/// A read-mostly configuration provider built from a YAML document at
/// startup. Every call clones out of an immutable in-memory snapshot; there
/// is no locking because nothing here is mutated after construction.
pub struct StaticConfig {
    commands: HashMap<String, CommandSpec>,
    default_limits: Limits,
    overrides: HashMap<String, LimitsOverride>,
}

impl StaticConfig {
    /// Parse `yaml` into a `StaticConfig`.
    pub fn from_yaml(yaml: &str) -> Result<StaticConfig> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;

        let commands = raw
            .commands
            .into_iter()
            .map(|c| {
                let binding = Some(CommandSpec::default_binding_for(&c.name));
                (
                    c.name.clone(),
                    CommandSpec { name: c.name, bin_path: c.bin_path, user: c.user, extra_argv: c.extra_argv, binding },
                )
            })
            .collect();

        Ok(StaticConfig {
            commands,
            default_limits: raw.default_limits.into(),
            overrides: raw.overrides,
        })
    }
}

impl ConfigProvider for StaticConfig {
    fn get_command(&self, name: &str) -> Option<CommandSpec> {
        self.commands.get(name).cloned()
    }

    fn get_default_limits(&self) -> Limits {
        self.default_limits
    }

    fn get_overrides(&self, context_key: &str) -> LimitsOverride {
        self.overrides
            .get(context_key)
            .copied()
            .unwrap_or_default()
            .without_proxy_override(context_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
        commands:
            - name: python
              bin_path: /usr/bin/python3
              user: sandbox
              extra_argv: ["-E", "-s"]
        default_limits:
            cpu: 1
            realtime: 5
            vmem: 536870912
            fsize: 0
            nproc: 15
            proxy: false
        overrides:
            course-42:
                cpu: 2
                proxy: true
    "#;

    #[test]
    fn deserializes_commands_and_limits() {
        let config = StaticConfig::from_yaml(YAML).unwrap();

        let python = config.get_command("python").unwrap();
        assert_eq!(PathBuf::from("/usr/bin/python3"), python.bin_path);
        assert_eq!(Some("sandbox".to_owned()), python.user);
        assert_eq!(vec!["-E", "-s"], python.extra_argv);

        assert!(config.get_command("ruby").is_none());

        let defaults = config.get_default_limits();
        assert_eq!(1, defaults.cpu);
        assert_eq!(15, defaults.nproc);
        assert_eq!(Proxy::Off, defaults.proxy);
    }

    #[test]
    fn proxy_override_is_ignored() {
        let config = StaticConfig::from_yaml(YAML).unwrap();

        let effective = config.effective_limits("course-42");
        assert_eq!(2, effective.cpu);
        assert_eq!(config.get_default_limits().proxy, effective.proxy);
    }

    #[test]
    fn missing_context_falls_back_to_defaults() {
        let config = StaticConfig::from_yaml(YAML).unwrap();
        let effective = config.effective_limits("unknown-context");
        assert_eq!(config.get_default_limits().cpu, effective.cpu);
    }
}
