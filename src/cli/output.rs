//! Output formatting for CLI commands.
//!
//! Text output uses coloured tables; JSON output is meant for scripts and
//! keeps field names stable.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, StackSpec, ValidationResult};
use crate::executor::{ApplyResult, NodeStatus};
use crate::planner::{ChangeAction, ChangeSummary, Plan};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    elapsed: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Serialize)]
struct PlanJson<'a> {
    fingerprint: &'a str,
    created_at: String,
    changes: Vec<ChangeSummary>,
}

#[derive(Serialize)]
struct StateJson<'a> {
    lock: Option<&'a LockInfo>,
    records: &'a StateSnapshot,
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    project: &'a str,
    environment: &'a str,
    resources: usize,
    errors: Vec<String>,
    warnings: &'a [String],
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan. No-op changes are listed only when `show_all` is set.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, show_all: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson {
                fingerprint: &plan.fingerprint,
                created_at: plan.created_at.to_rfc3339(),
                changes: plan.summary(),
            }),
            OutputFormat::Text => Self::format_plan_text(plan, show_all),
        }
    }

    fn format_plan_text(plan: &Plan, show_all: bool) -> String {
        if plan.is_empty() && !show_all {
            return format!(
                "{} No changes required - infrastructure matches the stack.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(
            output,
            "\nExecution Plan\n   Fingerprint: {}\n\n",
            ConfigHasher::new().short_hash(&plan.fingerprint)
        );

        let rows: Vec<ChangeRow> = plan
            .changes
            .iter()
            .filter(|c| show_all || c.action != ChangeAction::NoOp)
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_action(c.action),
                resource: c.id.clone(),
                resource_type: c.resource_type().to_string(),
                reason: Self::truncate(&c.reason, 60),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(ChangeAction::Create).to_string().green(),
            plan.count(ChangeAction::Update).to_string().yellow(),
            plan.count(ChangeAction::Replace).to_string().magenta(),
            plan.count(ChangeAction::Delete).to_string().red()
        );

        output
    }

    /// Formats the result of an apply.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => Self::format_apply_text(result),
        }
    }

    fn format_apply_text(result: &ApplyResult) -> String {
        let mut output = String::new();

        let rows: Vec<OutcomeRow> = result
            .outcomes
            .iter()
            .filter(|o| o.action != ChangeAction::NoOp || o.status != NodeStatus::Succeeded)
            .map(|o| OutcomeRow {
                resource: o.id.clone(),
                action: Self::format_action(o.action),
                status: Self::format_status(o.status),
                attempts: o.attempts,
                elapsed: format!("{}ms", o.elapsed_ms),
                error: o.error.as_deref().map(|e| Self::truncate(e, 60)).unwrap_or_default(),
            })
            .collect();

        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if result.succeeded() {
            format!("{} Apply complete", "✓".green())
        } else if result.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply finished with errors", "✗".red())
        };

        let _ = write!(
            output,
            "\n{headline}: {} succeeded, {} failed, {} skipped in {}ms ({} state change(s) committed)\n",
            result.count(NodeStatus::Succeeded),
            result.count(NodeStatus::Failed),
            result.count(NodeStatus::Skipped),
            result.elapsed_ms,
            result.deltas.len()
        );

        if let Some(fatal) = &result.fatal_error {
            let _ = writeln!(output, "\n{} State store failure: {fatal}", "✗".red());
        }

        output
    }

    /// Formats the recorded state and the current lock, if any.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson {
                lock,
                records: snapshot,
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {} resource(s)", snapshot.len());
                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Locked by {} ({}), expires {}",
                            lock.holder,
                            lock.lock_id,
                            lock.expires_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                    None => output.push_str("   Unlocked\n"),
                }

                if !snapshot.is_empty() {
                    let hasher = ConfigHasher::new();
                    let rows: Vec<RecordRow> = snapshot
                        .iter()
                        .map(|(id, record)| RecordRow {
                            resource: id.clone(),
                            resource_type: record.resource_type.clone(),
                            provider_id: Self::truncate(&record.provider_id, 30),
                            hash: hasher.short_hash(&record.last_applied_hash),
                            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats a validation report.
    #[must_use]
    pub fn format_validation(&self, stack: &StackSpec, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                project: &stack.project.name,
                environment: &stack.project.environment,
                resources: stack.resources.len(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: &result.warnings,
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Stack is valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Stack is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(output, "   ({} warning(s), use --warnings to show)", result.warning_count());
                }

                let _ = writeln!(output, "\nStack summary:");
                let _ = writeln!(output, "   Project: {}", stack.project.name);
                let _ = writeln!(output, "   Environment: {}", stack.project.environment);
                let _ = writeln!(output, "   Resources: {}", stack.resources.len());
                let _ = writeln!(output, "   Types with capabilities: {}", stack.types.len());
                output
            }
        }
    }

    /// Formats a lock that was just acquired.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "{} State locked: {} (holder {}, {}s remaining)\n",
                "✓".green(),
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn format_message(&self, success: bool, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": if success { "success" } else { "error" },
                "message": message,
            })),
            OutputFormat::Text if success => format!("{} {message}\n", "✓".green()),
            OutputFormat::Text => format!("{} {message}\n", "✗".red()),
        }
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction) -> String {
        let label = format!("{}{action}", action.symbol());
        match action {
            ChangeAction::Create => label.green().to_string(),
            ChangeAction::Update => label.yellow().to_string(),
            ChangeAction::Replace => label.magenta().to_string(),
            ChangeAction::Delete => label.red().to_string(),
            ChangeAction::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        let label = status.to_string();
        match status {
            NodeStatus::Succeeded => label.green().to_string(),
            NodeStatus::Failed => label.red().to_string(),
            NodeStatus::Skipped => label.yellow().to_string(),
            NodeStatus::Pending | NodeStatus::InProgress => label.dimmed().to_string(),
        }
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
