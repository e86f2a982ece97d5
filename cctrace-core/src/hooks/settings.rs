//! User-hook discovery from the host's settings files.
//!
//! Three files are consulted, in precedence order: user-global
//! (`~/.claude/settings.json`), project (`<cwd>/.claude/settings.json`),
//! project-local (`<cwd>/.claude/settings.local.json`). A missing file is
//! fine; a malformed one is a loud configuration error — swallowing it
//! silently would make user misconfiguration undebuggable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use super::event::HookEvent;
use crate::error::{CcTraceError, CoreResult};

/// Binary name of the orchestrator itself; commands that reference it are
/// skipped so registering cctrace in the same settings files cannot recurse.
pub const ORCHESTRATOR_BIN: &str = "cctrace-hook";

#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    #[serde(default)]
    hooks: HashMap<String, Vec<MatcherGroup>>,
}

#[derive(Debug, Deserialize)]
struct MatcherGroup {
    #[serde(default)]
    matcher: Option<String>,
    #[serde(default)]
    hooks: Vec<HookEntry>,
}

#[derive(Debug, Deserialize)]
struct HookEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    command: Option<String>,
}

/// The three candidate settings paths for a given home and project dir.
pub fn settings_paths(home: &Path, cwd: &Path) -> [PathBuf; 3] {
    [
        home.join(".claude").join("settings.json"),
        cwd.join(".claude").join("settings.json"),
        cwd.join(".claude").join("settings.local.json"),
    ]
}

/// Discover the user hook commands to run for an event, deduplicated across
/// files in precedence order, with the cycle guard applied.
pub fn discover_commands(event: &HookEvent, home: &Path, cwd: &Path) -> CoreResult<Vec<String>> {
    let mut commands: Vec<String> = Vec::new();
    for path in settings_paths(home, cwd) {
        let Some(file) = load_settings(&path)? else {
            continue;
        };
        let Some(groups) = file.hooks.get(event.event_name()) else {
            continue;
        };
        for group in groups {
            if event.is_tool_scoped() && !matcher_matches(group.matcher.as_deref(), event, &path)? {
                continue;
            }
            for entry in &group.hooks {
                if entry.kind.as_deref().unwrap_or("command") != "command" {
                    continue;
                }
                let Some(command) = entry.command.as_deref() else {
                    continue;
                };
                if command.contains(ORCHESTRATOR_BIN) {
                    continue;
                }
                if !commands.iter().any(|c| c == command) {
                    commands.push(command.to_string());
                }
            }
        }
    }
    Ok(commands)
}

fn load_settings(path: &Path) -> CoreResult<Option<SettingsFile>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CcTraceError::Io(e)),
    };
    let file: SettingsFile = serde_json::from_str(&content).map_err(|e| {
        CcTraceError::Config(format!("malformed settings file {}: {e}", path.display()))
    })?;
    Ok(Some(file))
}

fn matcher_matches(
    matcher: Option<&str>,
    event: &HookEvent,
    path: &Path,
) -> CoreResult<bool> {
    let Some(pattern) = matcher.filter(|m| !m.is_empty()) else {
        return Ok(true); // empty or absent matcher matches every tool
    };
    let regex = Regex::new(pattern).map_err(|e| {
        CcTraceError::Config(format!(
            "invalid hook matcher '{pattern}' in {}: {e}",
            path.display()
        ))
    })?;
    Ok(regex.is_match(event.tool_name.as_deref().unwrap_or("")))
}
