//! Read-only commands: status, journal and drift.

use anyhow::Result;
use colored::Colorize;
use orchestrator::{DriftReport, DriftStatus, Error, Operation, OperationResult, Stack};
use serde_json::json;
use std::process::ExitCode;

use crate::cli::{DriftArgs, JournalArgs, StatusArgs};
use crate::commands::{local_time, short_id};
use crate::session::Session;
use crate::ui;

pub fn status(session: &Session, args: &StatusArgs) -> Result<ExitCode> {
    match &args.stack {
        Some(id) => stack_status(session, id, args.json)?,
        None => list_stacks(session, args.json)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn list_stacks(session: &Session, json: bool) -> Result<()> {
    let mut stacks = Vec::new();
    for id in session.engine.stacks()? {
        if let Some(stack) = session.engine.stack(&id)? {
            stacks.push(stack);
        }
    }

    if json {
        let rows: Vec<_> = stacks
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "status": s.status.as_str(),
                    "resources": s.resources.len(),
                    "version": s.version,
                    "updatedAt": s.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if stacks.is_empty() {
        ui::info("No stacks yet; create one with `strata apply <stack> --template <file>`");
        return Ok(());
    }

    ui::header("Stacks");
    for stack in &stacks {
        println!(
            "  {:<24} {:<22} {:>3} resource(s)  v{}  {}",
            stack.id.bold(),
            ui::status_label(stack.status),
            stack.resources.len(),
            stack.version,
            local_time(&stack.updated_at, "%Y-%m-%d %H:%M:%S").dimmed()
        );
    }
    Ok(())
}

fn stack_status(session: &Session, id: &str, json: bool) -> Result<()> {
    let stack = session
        .engine
        .stack(id)?
        .ok_or_else(|| Error::StackNotFound(id.to_string()))?;
    let pending = session.engine.change_sets(id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stack)?);
        return Ok(());
    }

    show_stack(&stack);

    if !pending.is_empty() {
        ui::section("Pending change sets");
        for change_set in &pending {
            println!(
                "  {}  {}  {} operation(s)",
                change_set.id,
                local_time(&change_set.created_at, "%Y-%m-%d %H:%M:%S").dimmed(),
                change_set.operations.len()
            );
        }
    }

    if stack.status.is_in_progress() || stack.snapshot.is_some() {
        println!();
        ui::warn(&format!("A run did not finish; use `strata recover {id}`"));
    }
    Ok(())
}

fn show_stack(stack: &Stack) {
    ui::header(&stack.id);
    ui::kv("Status", &ui::status_label(stack.status).to_string());
    if let Some(reason) = &stack.status_reason {
        ui::kv("Reason", reason);
    }
    ui::kv("Version", &stack.version.to_string());
    ui::kv("Updated", &local_time(&stack.updated_at, "%Y-%m-%d %H:%M:%S %Z"));
    if let Some(run) = &stack.last_run {
        ui::kv("Last run", run);
    }

    ui::section("Resources");
    if stack.resources.is_empty() {
        ui::dim("(none)");
    }
    for record in stack.resources.values() {
        println!(
            "  {:<24} {:<20} {:<12} {}",
            record.logical_id.bold(),
            record.resource_type,
            record.status.to_string(),
            record.physical_id.as_deref().unwrap_or("-").dimmed()
        );
    }

    if !stack.outputs.is_empty() {
        ui::section("Outputs");
        for (name, value) in &stack.outputs {
            let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            ui::kv(name, &shown);
        }
    }
}

pub fn journal(session: &Session, args: &JournalArgs) -> Result<ExitCode> {
    let entries: Vec<Operation> = session
        .engine
        .journal(&args.stack)?
        .into_iter()
        .filter(|op| args.run.as_deref().is_none_or(|run| op.run_id.starts_with(run)))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }

    if entries.is_empty() {
        ui::info(&format!("No journal entries for {}", args.stack));
        return Ok(ExitCode::SUCCESS);
    }

    ui::header(&format!("Journal for {}", args.stack));
    for op in &entries {
        println!(
            "  {:>5} {} {} {:<9} {:>2} {:<7} {:<24} {}",
            op.sequence,
            local_time(&op.timestamp, "%H:%M:%S").dimmed(),
            short_id(&op.run_id).dimmed(),
            op.phase.to_string(),
            op.batch,
            op.kind.to_string(),
            op.logical_id,
            result_label(&op.result)
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn result_label(result: &OperationResult) -> String {
    match result {
        OperationResult::Pending => "pending".yellow().to_string(),
        OperationResult::Succeeded => "ok".green().to_string(),
        OperationResult::Failed { reason } => format!("{} {}", "failed".red(), reason.dimmed()),
    }
}

pub fn drift(session: &Session, args: &DriftArgs) -> Result<ExitCode> {
    let report = session.engine.detect_drift(&args.stack)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        show_drift(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn show_drift(report: &DriftReport) {
    ui::header(&format!("Drift for {}", report.stack_id));

    for item in &report.drifted {
        match &item.status {
            DriftStatus::Deleted => {
                println!("  {} {} {}", "✗".red(), item.logical_id.bold(), "deleted outside strata".red());
            }
            DriftStatus::Modified { differences } => {
                println!("  {} {} {}", "~".yellow(), item.logical_id.bold(), "modified".yellow());
                for diff in differences {
                    println!(
                        "      {}: {} -> {}",
                        diff.key,
                        display_optional(diff.expected.as_ref()).dimmed(),
                        display_optional(diff.actual.as_ref())
                    );
                }
            }
        }
    }
    for id in &report.in_sync {
        println!("  {} {}", "✓".green(), id);
    }
    for warning in &report.warnings {
        ui::warn(warning);
    }

    println!();
    if report.has_drift() {
        ui::warn(&format!("{} resource(s) drifted", report.drifted.len()));
    } else {
        ui::success("No drift detected");
    }
}

fn display_optional(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| "(absent)".to_string(), ToString::to_string)
}
