//! Property Configuration
//!
//! Two layers:
//!
//! ```text
//!   *.properties ──parse──▶ Config (raw key → value, ordered)
//!                              │  get_bool / get_int / get_list ...
//!                              ▼
//!                          CoreConfig (typed, serde)  ──▶ VmConfig, SearchConfig, TraceConfig
//! ```
//!
//! # Property syntax
//!
//! ```text
//! # comment
//! key = value
//! key += more          appended with ','
//! other = ${key}/x     expanded on lookup
//! long = a,\
//!        b             trailing '\' continues the line
//! ```
//!
//! # Design Notes
//!
//! - Values are stored raw and expanded lazily, so a property may refer to
//!   a key defined further down the file.
//! - An undefined `${key}` is kept verbatim.
//! - `CoreConfig::from_config` resolves every key once and validates the
//!   policy class names, so a bad configuration fails before the search.

use crate::domain::choice::RandomizationPolicy;
use crate::domain::error::ConfigError;
use crate::domain::heap::AllocationStrategy;
use crate::domain::scheduler::{Scheduler, SchedulerConfig};
use crate::domain::vm::VmConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Raw property store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered `key = value` store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    props: IndexMap<String, String>,
}

impl Config {
    /// Empty configuration (every getter returns its default)
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a property file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::new();
        config.load_str(&text)?;
        debug!(path = %path.display(), keys = config.len(), "config loaded");
        Ok(config)
    }

    /// Merge property text into this store. Later definitions win.
    pub fn load_str(&mut self, text: &str) -> Result<(), ConfigError> {
        for (line_no, line) in logical_lines(text) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let malformed = || ConfigError::MalformedLine {
                line: line_no,
                text: line.to_string(),
            };
            let eq = line.find('=').ok_or_else(malformed)?;
            let (lhs, value) = (&line[..eq], line[eq + 1..].trim());
            let (key, append) = match lhs.strip_suffix('+') {
                Some(key) => (key.trim(), true),
                None => (lhs.trim(), false),
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(malformed());
            }
            if append {
                self.append(key, value);
            } else {
                self.set(key, value);
            }
        }
        Ok(())
    }

    /// Set (or replace) a raw value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    /// Append to a list value
    pub fn append(&mut self, key: &str, value: &str) {
        match self.props.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                existing.push(',');
                existing.push_str(value);
            }
            _ => self.set(key, value),
        }
    }

    /// Key is defined
    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Number of defined keys
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// No keys defined
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Defined keys in definition order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    /// Expanded value of `key`
    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let mut stack = Vec::new();
        self.lookup(key, &mut stack)
    }

    fn lookup(&self, key: &str, stack: &mut Vec<String>) -> Result<Option<String>, ConfigError> {
        let Some(raw) = self.props.get(key) else {
            return Ok(None);
        };
        if stack.iter().any(|k| k == key) {
            return Err(ConfigError::RecursiveExpansion(key.to_string()));
        }
        stack.push(key.to_string());
        let expanded = self.expand(raw, stack)?;
        stack.pop();
        Ok(Some(expanded))
    }

    fn expand(&self, raw: &str, stack: &mut Vec<String>) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let name = &after[..end];
            match self.lookup(name, stack)? {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..start + 3 + end]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Boolean value, `default` if unset
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(v) = self.get(key)? else {
            return Ok(default);
        };
        let lowered = v.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(invalid(key, "boolean", v)),
        }
    }

    /// Signed integer value, `default` if unset
    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        self.get(key)?
            .map_or(Ok(default), |v| v.trim().parse().map_err(|_| invalid(key, "integer", v)))
    }

    /// Unsigned integer value, `default` if unset
    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        self.get_opt_u64(key).map(|v| v.unwrap_or(default))
    }

    /// Unsigned integer value; unset, empty, negative or `-1` means unbounded
    pub fn get_opt_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        let Some(v) = self.get(key)? else {
            return Ok(None);
        };
        let trimmed = v.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match trimmed.parse::<i64>() {
            Ok(n) if n < 0 => Ok(None),
            Ok(n) => Ok(Some(n.unsigned_abs())),
            Err(_) => trimmed
                .parse::<u64>()
                .map(Some)
                .map_err(|_| invalid(key, "unsigned integer", v)),
        }
    }

    /// String value, `default` if unset
    pub fn get_string(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.get(key)?.map_or_else(|| default.to_string(), |v| v.trim().to_string()))
    }

    /// `,`/`;` separated list, empty if unset
    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        Ok(self
            .get(key)?
            .map(|v| {
                v.split([',', ';'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = Self::new();
        config.load_str(s)?;
        Ok(config)
    }
}

fn invalid(key: &str, expected: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        expected,
        value,
    }
}

/// Join `\`-continued lines, keeping the number of the first physical line
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (idx, raw) in text.lines().enumerate() {
        let (line, continued) = match raw.trim_end().strip_suffix('\\') {
            Some(head) => (head, true),
            None => (raw, false),
        };
        let entry = match pending.take() {
            Some((first, mut acc)) => {
                acc.push_str(line.trim_start());
                (first, acc)
            }
            None => (idx + 1, line.to_string()),
        };
        if continued {
            pending = Some(entry);
        } else {
            out.push(entry);
        }
    }
    out.extend(pending);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `search.*` keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum path depth, unbounded if `None`
    pub depth_limit: Option<u64>,
    /// Keep searching after the first finding
    pub multiple_errors: bool,
}

/// `trace.*` keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Where to store the error trace
    pub file: Option<PathBuf>,
    /// Append the generator description to every line
    pub verbose: bool,
}

/// Everything the core reads from the property store, resolved once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Application name written into trace headers
    pub target: String,
    /// VM settings
    pub vm: VmConfig,
    /// Search driver settings
    pub search: SearchConfig,
    /// Error trace output
    pub trace: TraceConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            target: "app".to_string(),
            vm: VmConfig::default(),
            search: SearchConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Resolve every known key of `config`
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut vm = VmConfig::default();

        let sync = &mut vm.scheduler.sync;
        sync.break_single_choice = config.get_bool("cg.break_single_choice", sync.break_single_choice)?;
        sync.break_lock_release = config.get_bool("cg.break_lock_release", sync.break_lock_release)?;
        sync.break_notify = config.get_bool("cg.break_notify", sync.break_notify)?;
        sync.break_notifyall = config.get_bool("cg.break_notifyall", sync.break_notify)?;
        sync.break_sleep = config.get_bool("cg.break_sleep", sync.break_sleep)?;
        sync.break_yield = config.get_bool("cg.break_yield", sync.break_yield)?;
        sync.break_priority = config.get_bool("cg.break_priority", sync.break_priority)?;

        let transition = &mut vm.transition;
        if let Some(v) = config.get("cg.randomize_choices")? {
            transition.randomize_choices = RandomizationPolicy::parse(&v)
                .ok_or_else(|| invalid("cg.randomize_choices", "NONE|FIXED_SEED|VAR_SEED", v))?;
        }
        transition.seed = config.get_u64("cg.seed", transition.seed)?;
        transition.gc = config.get_bool("vm.gc", transition.gc)?;
        transition.max_alloc_gc = config.get_opt_u64("vm.max_alloc_gc")?;
        transition.extend_transitions = config.get_list("vm.extend_transitions")?;

        let scheduler: &mut SchedulerConfig = &mut vm.scheduler;
        scheduler.sync_class = config.get_string("vm.scheduler.sync.class", &scheduler.sync_class)?;
        scheduler.sharedness_class =
            config.get_string("vm.scheduler.sharedness.class", &scheduler.sharedness_class)?;

        let shared = &mut scheduler.sharedness;
        shared.skip_finals = config.get_bool("vm.shared.skip_finals", shared.skip_finals)?;
        shared.skip_constructed_finals =
            config.get_bool("vm.shared.skip_constructed_finals", shared.skip_constructed_finals)?;
        shared.skip_static_finals = config.get_bool("vm.shared.skip_static_finals", shared.skip_static_finals)?;
        shared.skip_inits = config.get_bool("vm.shared.skip_inits", shared.skip_inits)?;
        shared.break_on_exposure = config.get_bool("vm.shared.break_on_exposure", shared.break_on_exposure)?;
        shared.sync_detection = config.get_bool("vm.shared.sync_detection", shared.sync_detection)?;
        let por_threshold = get_u32(config, "vm.por.sync_detection.threshold", shared.lock_threshold)?;
        shared.lock_threshold = get_u32(config, "vm.shared.lockthreshold", por_threshold)?;
        shared.pindown = config.get_bool("vm.por.sync_detection.pindown", shared.pindown)?;
        shared.aggressive = config.get_bool("vm.por.sync_detection.agressive", shared.aggressive)?;
        shared.never_break_types = config.get_list("vm.shared.never_break_types")?;
        shared.always_break_types = config.get_list("vm.shared.always_break_types")?;
        shared.never_break_fields = config.get_list("vm.shared.never_break_fields")?;
        shared.always_break_fields = config.get_list("vm.shared.always_break_fields")?;
        shared.never_break_methods = config.get_list("vm.shared.never_break_methods")?;

        vm.reuse_tid = config.get_bool("vm.reuse_tid", vm.reuse_tid)?;
        if let Some(v) = config.get("vm.heap.allocation")? {
            vm.allocation = AllocationStrategy::parse(&v).ok_or_else(|| invalid("vm.heap.allocation", "hashed|precise", v))?;
        }

        let resolved = Self {
            target: config.get_string("target", &defaults.target)?,
            vm,
            search: SearchConfig {
                depth_limit: config.get_opt_u64("search.depth_limit")?,
                multiple_errors: config.get_bool("search.multiple_errors", false)?,
            },
            trace: TraceConfig {
                file: config.get("trace.file")?.map(|f| PathBuf::from(f.trim())).filter(|p| !p.as_os_str().is_empty()),
                verbose: config.get_bool("trace.verbose", false)?,
            },
        };
        resolved.validate()?;
        Ok(resolved)
    }

    /// Load and resolve a property file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_config(&Config::from_file(path)?)
    }

    /// Check that the selected policy classes exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        Scheduler::from_config(&self.vm.scheduler).map(drop)
    }

    /// Pretty JSON dump
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn get_u32(config: &Config, key: &str, default: u32) -> Result<u32, ConfigError> {
    let v = config.get_u64(key, u64::from(default))?;
    u32::try_from(v).map_err(|_| invalid(key, "32-bit unsigned integer", v.to_string()))
}
