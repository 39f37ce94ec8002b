//! `WSN_*` environment overrides applied on top of the config file.

use super::Config;
use crate::config::tasks::{check_task_timer, TaskName};
use crate::error::SyncError;

pub const ENV_PREFIX: &str = "WSN_";
const CRON_PREFIX: &str = "WSN_CRON_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    String,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::String => "string",
        })
    }
}

type Apply = fn(&mut Config, &str) -> Result<(), String>;

/// One overridable option
pub struct EnvOption {
    pub key: &'static str,
    pub env: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    apply: Apply,
}

impl std::fmt::Debug for EnvOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvOption")
            .field("key", &self.key)
            .field("env", &self.env)
            .field("kind", &self.kind)
            .finish()
    }
}

static OPTIONS: &[EnvOption] = &[
    EnvOption {
        key: "dry_run",
        env: "WSN_DRY_RUN",
        description: "Plan changes without sending them",
        kind: ValueKind::Bool,
        apply: |c, v| parse_bool(v).map(|b| c.dry_run = b),
    },
    EnvOption {
        key: "api.key",
        env: "WSN_API_KEY",
        description: "API key for the control surface",
        kind: ValueKind::String,
        apply: |c, v| {
            c.api.key = non_empty(v).map(str::to_string);
            Ok(())
        },
    },
    EnvOption {
        key: "api.secure",
        env: "WSN_SECURE_API_ENDPOINTS",
        description: "Require the API key on every endpoint",
        kind: ValueKind::Bool,
        apply: |c, v| parse_bool(v).map(|b| c.api.secure = b),
    },
    EnvOption {
        key: "trust.proxy",
        env: "WSN_TRUST_PROXY",
        description: "Trust the client address forwarded by a proxy",
        kind: ValueKind::Bool,
        apply: |c, v| parse_bool(v).map(|b| c.trust.proxy = b),
    },
    EnvOption {
        key: "trust.header",
        env: "WSN_TRUST_HEADER",
        description: "Header carrying the forwarded client address",
        kind: ValueKind::String,
        apply: |c, v| {
            let header = non_empty(v).ok_or("header name is empty")?;
            reqwest::header::HeaderName::from_bytes(header.as_bytes())
                .map_err(|e| e.to_string())?;
            c.trust.header = header.to_string();
            Ok(())
        },
    },
    EnvOption {
        key: "library.segment",
        env: "WSN_LIBRARY_SEGMENT",
        description: "Items requested per library page",
        kind: ValueKind::Int,
        apply: |c, v| {
            let segment = parse_int(v)?;
            if segment == 0 {
                return Err("must be at least 1".to_string());
            }
            c.library.segment = segment as usize;
            Ok(())
        },
    },
    EnvOption {
        key: "export.threshold",
        env: "WSN_EXPORT_THRESHOLD",
        description: "Diff count that switches export to a full resync (0 disables)",
        kind: ValueKind::Int,
        apply: |c, v| parse_int(v).map(|n| c.export.threshold = n as usize),
    },
    EnvOption {
        key: "export.not_found",
        env: "WSN_EXPORT_NOT_FOUND",
        description: "Seconds a missing backend record is kept before pruning",
        kind: ValueKind::Int,
        apply: |c, v| parse_int(v).map(|n| c.export.not_found = n),
    },
    EnvOption {
        key: "events.listeners_cache",
        env: "WSN_EVENTS_LISTENERS_CACHE",
        description: "Seconds event listener lookups are cached",
        kind: ValueKind::Int,
        apply: |c, v| parse_int(v).map(|n| c.events.listeners_cache = n),
    },
    EnvOption {
        key: "push.enabled",
        env: "WSN_PUSH_ENABLED",
        description: "Accept push notifications from backends",
        kind: ValueKind::Bool,
        apply: |c, v| parse_bool(v).map(|b| c.push.enabled = b),
    },
    EnvOption {
        key: "sync.progress",
        env: "WSN_SYNC_PROGRESS",
        description: "Synchronize playback progress",
        kind: ValueKind::Bool,
        apply: |c, v| parse_bool(v).map(|b| c.sync.progress = b),
    },
    EnvOption {
        key: "sync.policy",
        env: "WSN_SYNC_POLICY",
        description: "Conflict policy: most_recent or watched_wins",
        kind: ValueKind::String,
        apply: |c, v| {
            c.sync.policy = v.parse().map_err(|e: anyhow::Error| e.to_string())?;
            Ok(())
        },
    },
    EnvOption {
        key: "dispatch.concurrency",
        env: "WSN_DISPATCH_CONCURRENCY",
        description: "Maximum in-flight backend requests",
        kind: ValueKind::Int,
        apply: |c, v| {
            let n = parse_int(v)?;
            if n == 0 {
                return Err("must be at least 1".to_string());
            }
            c.dispatch.concurrency = n as usize;
            Ok(())
        },
    },
    EnvOption {
        key: "dispatch.timeout",
        env: "WSN_DISPATCH_TIMEOUT",
        description: "Seconds before outstanding requests are cancelled (0 disables)",
        kind: ValueKind::Int,
        apply: |c, v| parse_int(v).map(|n| c.dispatch.timeout = n),
    },
    EnvOption {
        key: "logs.level",
        env: "WSN_LOGGER_LEVEL",
        description: "Log level filter",
        kind: ValueKind::String,
        apply: |c, v| {
            let level = v.trim().to_lowercase();
            match level.as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => {
                    c.logs.level = level;
                    Ok(())
                }
                _ => Err(format!("unknown level '{}'", v)),
            }
        },
    },
];

/// The declarative option table.
pub fn options() -> &'static [EnvOption] {
    OPTIONS
}

fn non_empty(v: &str) -> Option<&str> {
    let v = v.trim();
    (!v.is_empty()).then_some(v)
}

fn parse_bool(v: &str) -> Result<bool, String> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", v)),
    }
}

fn parse_int(v: &str) -> Result<u64, String> {
    v.trim()
        .parse::<u64>()
        .map_err(|_| format!("'{}' is not a non-negative integer", v))
}

/// Apply every recognized `WSN_*` variable from `vars` to `config`.
///
/// Each bad value is returned as an error and leaves its key untouched; the
/// other keys still apply.
pub fn apply_env<I, K, V>(config: &mut Config, vars: I) -> Vec<SyncError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut errors = Vec::new();

    for (name, value) in vars {
        let (name, value) = (name.as_ref(), value.as_ref());
        if !name.starts_with(ENV_PREFIX) {
            continue;
        }

        if let Some(rest) = name.strip_prefix(CRON_PREFIX) {
            if let Err(e) = apply_task(config, rest, value) {
                errors.push(e);
            }
            continue;
        }

        match OPTIONS.iter().find(|o| o.env == name) {
            Some(option) => {
                if let Err(message) = (option.apply)(config, value) {
                    errors.push(SyncError::config(option.key, message));
                }
            }
            None => tracing::debug!(env = name, "Ignoring unknown environment option"),
        }
    }

    errors
}

/// `WSN_CRON_<TASK>`, `WSN_CRON_<TASK>_AT`, `WSN_CRON_<TASK>_ARGS`
fn apply_task(config: &mut Config, rest: &str, value: &str) -> Result<(), SyncError> {
    let (task, field) = if let Some(task) = rest.strip_suffix("_AT") {
        (task, "timer")
    } else if let Some(task) = rest.strip_suffix("_ARGS") {
        (task, "args")
    } else {
        (rest, "enabled")
    };

    let name: TaskName = task
        .parse()
        .map_err(|_| SyncError::config(format!("tasks.{}", task.to_lowercase()), "unknown task"))?;
    if name.is_hidden() {
        return Err(SyncError::config(format!("tasks.{}", name), "task is not configurable"));
    }

    let key = format!("tasks.{}.{}", name, field);
    let entry = config.tasks.entry(name).or_default();
    match field {
        "timer" => entry.timer = Some(check_task_timer(name, value)?),
        "args" => entry.args = Some(value.trim().to_string()),
        _ => entry.enabled = Some(parse_bool(value).map_err(|m| SyncError::config(key, m))?),
    }
    Ok(())
}
