//! Terminal output formatting.

use std::collections::BTreeMap;

use colored::{ColoredString, Colorize};

use regen_core::model::change::ChangeRecord;
use regen_core::model::run::{Run, RunStatus};
use regen_core::{DirtySet, NodeKind};
use regen_graph::dirty::PartialDirty;
use regen_graph::{ImpactReport, RegenerationPlan};

pub fn rule(width: usize) {
    println!("{}", "─".repeat(width));
}

fn kind_colored(kind: NodeKind) -> ColoredString {
    let label = kind.label();
    match kind {
        NodeKind::BoundedContext => label.magenta(),
        NodeKind::Aggregate | NodeKind::Entity | NodeKind::ValueObject => label.cyan(),
        NodeKind::Field => label.blue(),
        NodeKind::Command => label.yellow(),
        NodeKind::Event => label.green(),
        NodeKind::Policy => label.red(),
        _ => label.normal(),
    }
}

pub fn status_colored(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Queued => status.as_str().dimmed(),
        RunStatus::Running => status.as_str().yellow(),
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
    }
}

fn print_grouped(groups: &BTreeMap<NodeKind, Vec<String>>, indent: &str) {
    for (kind, ids) in groups {
        println!("{}[{}] {}", indent, kind_colored(*kind), ids.join(", "));
    }
}

pub fn print_impact(report: &ImpactReport) {
    let roots: Vec<String> = report.roots.iter().map(ToString::to_string).collect();
    println!(
        "{} {} (max hops {})",
        "Impact of".bold(),
        roots.join(", ").yellow(),
        report.max_hops
    );
    rule(50);

    if report.is_empty() {
        println!("{}", "Nothing downstream.".dimmed());
        return;
    }

    print_grouped(&report.impacted, "  ");
    if !report.affected_aggregates.is_empty() {
        println!(
            "  {} {}",
            "affected aggregates:".dimmed(),
            report.affected_aggregates.join(", ")
        );
    }
    println!("\n{} node(s) impacted.", report.total().to_string().bold());
}

pub fn print_dirty(set: &DirtySet) {
    if set.is_empty() {
        println!("{}", "No dirty nodes.".dimmed());
        return;
    }

    println!("{:<40} {:<22} {}", "Node", "Marked", "Reason");
    rule(90);
    for entry in &set.entries {
        println!(
            "{:<40} {:<22} {}",
            entry.node.to_string(),
            entry.at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.reason.dimmed()
        );
    }
    println!();
    println!("{} dirty node(s)", set.len());
}

pub fn print_partial(partial: &[PartialDirty]) {
    if partial.is_empty() {
        println!("{}", "Dirty flags are consistent.".green());
        return;
    }
    for p in partial {
        println!(
            "  {} {} has only {}",
            "!".red().bold(),
            p.node,
            p.present.join(", ")
        );
    }
}

pub fn print_plan(plan: &RegenerationPlan) {
    if plan.is_empty() {
        println!("{}", "Nothing to regenerate.".dimmed());
        return;
    }
    for (i, phase) in plan.phases.iter().enumerate() {
        println!("{}. {}", i + 1, phase.phase.as_str().bold());
        print_grouped(&phase.nodes, "     ");
    }
}

pub fn print_runs(runs: &[Run]) {
    if runs.is_empty() {
        println!("{}", "No runs found.".dimmed());
        return;
    }

    println!(
        "{:<38} {:<11} {:<10} {:<20} {}",
        "ID", "Phase", "Status", "Started", "Agent"
    );
    rule(95);
    for run in runs {
        let started = run
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<11} {:<10} {:<20} {}",
            run.id,
            run.phase.as_str(),
            status_colored(run.status),
            started,
            run.agent.dimmed()
        );
    }
}

pub fn print_run(run: &Run, touched: &[String]) {
    println!("{} {}", run.id.cyan().bold(), format!("({})", run.phase.as_str()).dimmed());
    println!("{}: {}", "Status".bold(), status_colored(run.status));
    println!("{}: {}", "Agent".bold(), run.agent);
    if let Some(started) = run.started_at {
        println!("{}: {}", "Started".bold(), started.to_rfc3339());
    }
    if let Some(ended) = run.ended_at {
        println!("{}: {}", "Ended".bold(), ended.to_rfc3339());
    }
    if let Some(kind) = &run.failure_kind {
        println!(
            "{}: {} {}",
            "Failure".bold(),
            kind.red(),
            run.failure_message.as_deref().unwrap_or_default()
        );
    }
    if !run.unapplied.is_empty() {
        println!("\n{}", "Unapplied".bold());
        for op in &run.unapplied {
            println!("  {} {}", "•".dimmed(), op);
        }
    }
    if !touched.is_empty() {
        println!("\n{} ({})", "Touched".bold(), touched.len());
        for node in touched {
            println!("  {} {}", "•".dimmed(), node);
        }
    }
}

pub fn print_changes(changes: &[ChangeRecord]) {
    if changes.is_empty() {
        println!("{}", "No changes recorded.".dimmed());
        return;
    }
    for change in changes {
        let before = change.before_hash.as_deref().map(short).unwrap_or("(new)");
        println!(
            "{} {} {} {}  {}",
            change.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            before,
            "→".dimmed(),
            short(&change.after_hash),
            change.reason
        );
    }
}

/// First 12 characters of a hash.
fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
