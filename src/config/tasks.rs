//! Scheduled task surface. Tasks are executed by an external scheduler;
//! this module only owns their names, defaults and timer validation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::SyncError;

pub const DEFAULT_ARGS: &str = "-v";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskName {
    Import,
    Export,
    Sync,
    Backup,
    Prune,
    Indexes,
    Dispatch,
}

impl TaskName {
    pub const ALL: [TaskName; 7] = [
        TaskName::Import,
        TaskName::Export,
        TaskName::Sync,
        TaskName::Backup,
        TaskName::Prune,
        TaskName::Indexes,
        TaskName::Dispatch,
    ];

    pub fn default_timer(&self) -> &'static str {
        match self {
            TaskName::Import => "0 */1 * * *",
            TaskName::Export => "30 */1 * * *",
            TaskName::Sync => "9 */3 * * *",
            TaskName::Backup => "0 6 */3 * *",
            TaskName::Prune => "0 */12 * * *",
            TaskName::Indexes => "0 3 * * 3",
            TaskName::Dispatch => "* * * * *",
        }
    }

    pub fn default_enabled(&self) -> bool {
        !matches!(self, TaskName::Import | TaskName::Export | TaskName::Sync)
    }

    /// Hidden tasks always run with their defaults.
    pub fn is_hidden(&self) -> bool {
        matches!(self, TaskName::Dispatch)
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskName::Import => "Import play state from backends",
            TaskName::Export => "Export play state to backends",
            TaskName::Sync => "Import then export in one run",
            TaskName::Backup => "Write per-backend play state backups",
            TaskName::Prune => "Remove stale backend records",
            TaskName::Indexes => "Rebuild indexes and compact the state database",
            TaskName::Dispatch => "Dispatch queued requests",
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskName::Import => "import",
            TaskName::Export => "export",
            TaskName::Sync => "sync",
            TaskName::Backup => "backup",
            TaskName::Prune => "prune",
            TaskName::Indexes => "indexes",
            TaskName::Dispatch => "dispatch",
        };
        f.pad(name)
    }
}

impl FromStr for TaskName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskName::ALL
            .into_iter()
            .find(|t| t.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("Unknown task: {}", s))
    }
}

/// User overrides for one task; unset fields keep the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

/// A task with every field resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: TaskName,
    pub enabled: bool,
    pub timer: String,
    pub args: String,
    pub hidden: bool,
}

impl TaskConfig {
    pub fn defaults(name: TaskName) -> Self {
        Self {
            name,
            enabled: name.default_enabled(),
            timer: name.default_timer().to_string(),
            args: DEFAULT_ARGS.to_string(),
            hidden: name.is_hidden(),
        }
    }

    /// Apply `overrides`. An invalid timer keeps the default timer but the
    /// enabled flag is still honored.
    pub fn resolve(name: TaskName, overrides: Option<&TaskOverride>) -> Self {
        let mut task = Self::defaults(name);
        let Some(overrides) = overrides.filter(|_| !name.is_hidden()) else {
            return task;
        };

        if let Some(enabled) = overrides.enabled {
            task.enabled = enabled;
        }
        if let Some(args) = &overrides.args {
            task.args = args.clone();
        }
        // Invalid timers are reported by Config::validate.
        if let Some(timer) = overrides
            .timer
            .as_deref()
            .and_then(|t| check_task_timer(name, t).ok())
        {
            task.timer = timer;
        }
        task
    }
}

/// Normalize a task timer: strip surrounding double quotes and whitespace,
/// then validate it.
pub fn check_task_timer(name: TaskName, timer: &str) -> Result<String, SyncError> {
    let timer = timer.trim().trim_matches('"').trim();
    if validate_cron(timer) {
        Ok(timer.to_string())
    } else {
        Err(SyncError::config(
            format!("tasks.{}.timer", name),
            format!("'{}' is not a valid cron expression", timer),
        ))
    }
}

/// True if `expr` is a 5-field cron expression with an upcoming run.
pub fn validate_cron(expr: &str) -> bool {
    schedule(expr).is_some_and(|schedule| schedule.upcoming(Utc).next().is_some())
}

/// Parse a standard 5-field expression (minute hour day month weekday,
/// Sunday is 0 or 7).
pub fn schedule(expr: &str) -> Option<cron::Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return None;
    };
    // The cron crate wants a leading seconds field and counts weekdays 1-7
    // from Sunday.
    let weekday = posix_weekdays(weekday)?;
    cron::Schedule::from_str(&format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)).ok()
}

/// Rewrite a numeric weekday field into the cron crate's numbering.
/// Named days pass through unchanged.
fn posix_weekdays(field: &str) -> Option<String> {
    if field == "*" || field.chars().any(|c| c.is_ascii_alphabetic() || c == '?') {
        return Some(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<u8>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((a, b)) => (a.parse::<u8>().ok()?, b.parse::<u8>().ok()?),
            None => {
                let day = range.parse::<u8>().ok()?;
                (day, if item.contains('/') { 7 } else { day })
            }
        };
        if start > end || end > 7 {
            return None;
        }
        days.extend((start..=end).step_by(usize::from(step)).map(|d| d % 7 + 1));
    }

    Some(days.iter().map(u8::to_string).collect::<Vec<_>>().join(","))
}
