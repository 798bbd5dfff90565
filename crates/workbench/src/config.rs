use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::{Rule, RuleSet};
use crate::error::{Result, WorkbenchError};

pub(crate) const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 600;
pub(crate) const DEFAULT_SERVE_TIMEOUT_SECS: u64 = 60;
pub(crate) const DEFAULT_AUTO_SAVE_SECS: u64 = 30;
/// Upper bound for every `*_secs` setting: one day.
pub(crate) const MAX_SECS: u64 = 24 * 60 * 60;

/// Session settings. Every field has a default, so an empty document is a
/// valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbenchConfig {
    pub boot_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub serve_timeout_secs: u64,
    pub auto_save_secs: u64,
    /// Program followed by its arguments.
    pub install_command: Vec<String>,
    pub serve_command: Vec<String>,
    pub serve_rules: RuleConfig,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT_SECS,
            install_timeout_secs: DEFAULT_INSTALL_TIMEOUT_SECS,
            serve_timeout_secs: DEFAULT_SERVE_TIMEOUT_SECS,
            auto_save_secs: DEFAULT_AUTO_SAVE_SECS,
            install_command: vec!["npm".into(), "install".into()],
            serve_command: vec!["npm".into(), "run".into(), "dev".into()],
            serve_rules: RuleConfig::default(),
        }
    }
}

/// Serve output rules. Patterns are regular expressions matched against one
/// line of output; a line that also matches one of `except` is ignored by
/// that rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub failure: Vec<RuleEntry>,
    pub success: Vec<RuleEntry>,
}

/// One output rule. `pattern` and `except` are regexes tested against a
/// single line of output, so a pattern spanning a line break never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

impl RuleEntry {
    fn literal(text: &str) -> Self {
        Self {
            pattern: regex::escape(text),
            except: Vec::new(),
        }
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            failure: vec![
                RuleEntry::literal("ERR_MODULE_NOT_FOUND"),
                RuleEntry::literal("Failed to compile"),
                RuleEntry::literal("EADDRINUSE"),
                RuleEntry {
                    pattern: regex::escape("Error:"),
                    except: vec![regex::escape("TS Error")],
                },
            ],
            success: vec![
                RuleEntry::literal("ready"),
                RuleEntry::literal("started server"),
                RuleEntry::literal("localhost:3000"),
                RuleEntry::literal("http://localhost"),
            ],
        }
    }
}

impl RuleConfig {
    /// Compile into a rule set; failure rules keep priority over success.
    pub fn build(&self) -> Result<RuleSet> {
        let compile = |entry: &RuleEntry, failure: bool| -> Result<Rule> {
            let rule = if failure {
                Rule::failure(&entry.pattern)
            } else {
                Rule::success(&entry.pattern)
            };
            entry
                .except
                .iter()
                .try_fold(rule?, |rule, except| rule.except(except))
        };

        let mut rules = RuleSet::new();
        for entry in &self.failure {
            rules.push(compile(entry, true)?);
        }
        for entry in &self.success {
            rules.push(compile(entry, false)?);
        }
        Ok(rules)
    }
}

impl WorkbenchConfig {
    pub fn validate(&self) -> Result<()> {
        for (label, secs) in [
            ("boot_timeout_secs", self.boot_timeout_secs),
            ("install_timeout_secs", self.install_timeout_secs),
            ("serve_timeout_secs", self.serve_timeout_secs),
            ("auto_save_secs", self.auto_save_secs),
        ] {
            if secs == 0 {
                return Err(WorkbenchError::Config(format!("{label} must be positive")));
            }
            if secs > MAX_SECS {
                return Err(WorkbenchError::Config(format!(
                    "{label} must be at most {MAX_SECS}"
                )));
            }
        }
        for (label, command) in [
            ("install_command", &self.install_command),
            ("serve_command", &self.serve_command),
        ] {
            if command.first().is_none_or(|program| program.is_empty()) {
                return Err(WorkbenchError::Config(format!("{label} is empty")));
            }
        }
        self.serve_rules.build()?;
        Ok(())
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn serve_timeout(&self) -> Duration {
        Duration::from_secs(self.serve_timeout_secs)
    }

    pub fn auto_save_period(&self) -> Duration {
        Duration::from_secs(self.auto_save_secs)
    }
}
