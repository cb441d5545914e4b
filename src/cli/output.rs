//! Output formatting for CLI commands.
//!
//! Every formatter returns a string in the selected [`OutputFormat`]. Values
//! of attributes marked sensitive are replaced before anything is rendered,
//! in text and JSON alike.

use colored::Colorize;
use serde_json::Value;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackConfig, ValidationResult};
use crate::engine::DriftReport;
use crate::graph::ResourceGraph;
use crate::planner::{
    ApplyReport, AttributeChange, ChangeAction, ChangeOutcome, Plan, PlannedValue,
};
use crate::state::{LockInfo, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Placeholder shown instead of a secret value.
const REDACTED: &str = "(sensitive)";

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct PlanChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
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
    #[tabled(rename = "Outcome")]
    outcome: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Depends On")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true if output is JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        let plan = redact_plan(plan);
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(&plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        let mut output = String::new();

        if !plan.drift.is_empty() {
            let _ = writeln!(
                output,
                "{} Refresh found {} drifted resources:",
                "⚠".yellow(),
                plan.drift.len()
            );
            for drifted in &plan.drift {
                let note = if drifted.missing { "missing" } else { "changed" };
                let _ = writeln!(output, "   - {} ({note})", drifted.id);
            }
            output.push('\n');
        }

        if !plan.has_changes() {
            let _ = writeln!(
                output,
                "{} No changes required - state matches the configuration.",
                "✓".green()
            );
            return output;
        }

        let _ = write!(output, "\n📋 Plan\n");
        let _ = write!(
            output,
            "   Config hash: {}  State serial: {}\n\n",
            short(&plan.config_hash),
            plan.state_serial
        );

        let rows: Vec<PlanChangeRow> = plan
            .changes
            .iter()
            .enumerate()
            .filter(|(_, c)| detailed || c.action != ChangeAction::NoOp)
            .map(|(i, c)| PlanChangeRow {
                index: i + 1,
                action: Self::format_action(c.action),
                resource: c.id.to_string(),
                reason: Self::truncate(&c.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in plan.changes.iter().filter(|c| !c.diff.is_empty()) {
                let _ = write!(
                    output,
                    "\n  {} {}\n",
                    Self::action_symbol(change.action),
                    change.id.to_string().bold()
                );
                for attribute in &change.diff {
                    let _ = writeln!(output, "      {}", Self::format_attribute(attribute));
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete.\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        let mut report = report.clone();
        report.records = report.records.iter().map(redact_record).collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&report).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };
                let mut output = format!("{status}\n\n");

                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|r| r.action != ChangeAction::NoOp)
                    .map(|r| OutcomeRow {
                        resource: r.id.to_string(),
                        action: Self::format_action(r.action),
                        outcome: Self::format_outcome(&r.outcome),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = writeln!(output, "\n   Applied:   {}", report.applied());
                let _ = writeln!(output, "   Unchanged: {}", report.unchanged());
                let _ = writeln!(output, "   Failed:    {}", report.failed());
                let _ = writeln!(output, "   Blocked:   {}", report.blocked());
                let _ = writeln!(output, "   Cancelled: {}", report.cancelled());
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        let mut report = report.clone();
        for drifted in &mut report.drifted {
            drifted.changes.iter_mut().for_each(redact_change);
        }

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_clean() {
                    return format!(
                        "{} No drift detected across {} resources.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for drifted in &report.drifted {
                    if drifted.missing {
                        let _ = writeln!(
                            output,
                            "   - {} ({}) no longer exists",
                            drifted.id, drifted.provider_id
                        );
                        continue;
                    }
                    let _ = writeln!(output, "   - {} ({})", drifted.id, drifted.provider_id);
                    for change in &drifted.changes {
                        let _ = writeln!(output, "       {}", Self::format_attribute(change));
                    }
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted. Run 'cirrus apply --refresh' to correct them.\n",
                    report.drifted.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats a state summary.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => {
                let mut state = state.clone();
                for record in state.records.values_mut() {
                    *record = redact_record(record);
                }
                serde_json::to_string_pretty(&state).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\n💾 State: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.records.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {:?} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {}", error.red());
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded resources.
    #[must_use]
    pub fn format_records(&self, records: &[StateRecord]) -> String {
        match self.format {
            OutputFormat::Json => {
                let records: Vec<StateRecord> = records.iter().map(redact_record).collect();
                serde_json::to_string_pretty(&records).unwrap_or_default()
            }
            OutputFormat::Text => {
                if records.is_empty() {
                    return "No resources in state.\n".to_string();
                }
                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|r| RecordRow {
                        resource: r.id.to_string(),
                        provider_id: Self::truncate(&r.provider_id, 24),
                        dependencies: r
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "order": graph
                        .topological_order()
                        .map(|spec| spec.id().to_string())
                        .collect::<Vec<_>>(),
                    "edges": graph
                        .edges()
                        .into_iter()
                        .map(|(from, to)| serde_json::json!({
                            "dependency": from.to_string(),
                            "dependent": to.to_string(),
                        }))
                        .collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                if graph.is_empty() {
                    return "No resources declared.\n".to_string();
                }
                let mut output = String::new();
                for (i, spec) in graph.topological_order().enumerate() {
                    let id = spec.id();
                    let _ = writeln!(output, "{:>3}. {}", i + 1, id.to_string().bold());
                    for dependency in graph.dependencies(&id) {
                        let _ = writeln!(output, "       <- {dependency}");
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "project": config.project.name,
                    "environment": config.project.environment,
                    "resources": config.resources.len(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   State backend: {:?}", config.state.backend);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Delete => "-delete".red().to_string(),
            ChangeAction::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn action_symbol(action: ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+".green().to_string(),
            ChangeAction::Update => "~".yellow().to_string(),
            ChangeAction::Delete => "-".red().to_string(),
            ChangeAction::NoOp => " ".to_string(),
        }
    }

    fn format_outcome(outcome: &ChangeOutcome) -> String {
        match outcome {
            ChangeOutcome::Applied { .. } => "applied".green().to_string(),
            ChangeOutcome::Unchanged => "unchanged".dimmed().to_string(),
            ChangeOutcome::Failed { error } => {
                format!("{} {}", "failed:".red(), Self::truncate(error, 60))
            }
            ChangeOutcome::Blocked { by } => format!("{} {by}", "blocked by".yellow()),
            ChangeOutcome::Cancelled => "cancelled".yellow().to_string(),
        }
    }

    /// Renders one attribute change as `key: old -> new`.
    fn format_attribute(change: &AttributeChange) -> String {
        let new = match &change.new {
            PlannedValue::KnownAfterApply => change.new.to_string().dimmed().to_string(),
            other => other.to_string(),
        };
        match &change.old {
            None => format!("{} {}: {new}", "+".green(), change.key),
            Some(old) if change.is_removed() => format!("{} {}: {old}", "-".red(), change.key),
            Some(old) => format!("{} {}: {old} -> {new}", "~".yellow(), change.key),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn redacted() -> Value {
    Value::String(REDACTED.to_string())
}

fn redact_change(change: &mut AttributeChange) {
    if !change.sensitive {
        return;
    }
    if change.old.is_some() {
        change.old = Some(redacted());
    }
    if matches!(change.new, PlannedValue::Known(_)) {
        change.new = PlannedValue::Known(redacted());
    }
}

fn redact_plan(plan: &Plan) -> Plan {
    let mut plan = plan.clone();
    for change in &mut plan.changes {
        change.diff.iter_mut().for_each(redact_change);
        if let Some(spec) = &mut change.spec {
            for key in &spec.sensitive {
                if let Some(value) = spec.attributes.get_mut(key) {
                    *value = redacted();
                }
            }
        }
    }
    for drifted in &mut plan.drift {
        drifted.changes.iter_mut().for_each(redact_change);
    }
    plan
}

fn redact_record(record: &StateRecord) -> StateRecord {
    let mut record = record.clone();
    for key in &record.sensitive {
        if let Some(value) = record.attributes.get_mut(key) {
            *value = redacted();
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Attributes, ResourceId, ResourceSpec};
    use crate::planner::PlannedChange;
    use crate::state::StateOperation;
    use serde_json::json;

    fn plan_with_secret() -> Plan {
        let mut spec = ResourceSpec::new("aws", "db_instance", "main")
            .with_attribute("engine", "postgres")
            .with_attribute("password", "hunter2");
        spec.sensitive.insert("password".to_string());

        let mut plan = Plan::new(StateOperation::Apply, "0123456789abcdef", "lineage", 3);
        plan.changes.push(PlannedChange {
            id: spec.id(),
            action: ChangeAction::Update,
            diff: vec![
                AttributeChange {
                    key: "engine".to_string(),
                    old: Some(json!("mysql")),
                    new: PlannedValue::Known(json!("postgres")),
                    sensitive: false,
                },
                AttributeChange {
                    key: "password".to_string(),
                    old: Some(json!("letmein")),
                    new: PlannedValue::Known(json!("hunter2")),
                    sensitive: true,
                },
            ],
            spec: Some(spec),
            prior_provider_id: Some("db-1".to_string()),
            prior_fingerprint: Some("fp".to_string()),
            depends_on: Vec::new(),
            reason: "2 attributes changed".to_string(),
        });
        plan
    }

    #[test]
    fn test_plan_text_hides_secrets() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let output = formatter.format_plan(&plan_with_secret(), true);

        assert!(output.contains("aws.db_instance.main"));
        assert!(output.contains("postgres"));
        assert!(output.contains(REDACTED));
        assert!(!output.contains("hunter2"));
        assert!(!output.contains("letmein"));
    }

    #[test]
    fn test_plan_json_hides_secrets() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let output = formatter.format_plan(&plan_with_secret(), false);

        let parsed: Plan = serde_json::from_str(&output).unwrap();
        let spec = parsed.changes[0].spec.as_ref().unwrap();
        assert_eq!(spec.attributes["password"], json!(REDACTED));
        assert_eq!(spec.attributes["engine"], json!("postgres"));
        assert!(!output.contains("hunter2"));
    }

    #[test]
    fn test_copied_secret_is_hidden() {
        let mut web = ResourceSpec::new("aws", "instance", "web")
            .with_attribute("ami", "ami-1")
            .with_attribute("admin_password", "hunter2");
        web.sensitive.insert("admin_password".to_string());
        let reader = ResourceSpec::new("aws", "s3_bucket", "logs")
            .with_attribute("token", "pw=${aws.instance.web.admin_password}");

        let mut snapshot = crate::state::StateSnapshot::new("p", "dev");
        snapshot.records.insert(
            web.id(),
            StateRecord::new(web.id(), "i-1", web.attributes.clone(), Attributes::new(), Vec::new())
                .with_sensitive(web.sensitive.clone()),
        );
        let graph = crate::graph::ResourceGraph::build(&[web, reader]).unwrap();
        let plan = crate::planner::DiffEngine::new()
            .compute_plan(&graph, &snapshot, None, "hash")
            .unwrap();

        for format in [OutputFormat::Text, OutputFormat::Json] {
            let output = OutputFormatter::new(format).format_plan(&plan, true);
            assert!(output.contains("aws.s3_bucket.logs"));
            assert!(!output.contains("hunter2"));
        }
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let plan = Plan::new(StateOperation::Apply, "hash", "lineage", 0);
        assert!(formatter.format_plan(&plan, false).contains("No changes required"));
    }

    #[test]
    fn test_records_redacted_in_json() {
        let record = StateRecord::new(
            ResourceId::new("aws", "db_instance", "main"),
            "db-1",
            [
                ("engine".to_string(), json!("postgres")),
                ("password".to_string(), json!("hunter2")),
            ]
            .into_iter()
            .collect(),
            Attributes::new(),
            Vec::new(),
        )
        .with_sensitive(["password".to_string()].into_iter().collect());

        let formatter = OutputFormatter::new(OutputFormat::Json);
        let output = formatter.format_records(&[record]);
        assert!(output.contains(REDACTED));
        assert!(!output.contains("hunter2"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
