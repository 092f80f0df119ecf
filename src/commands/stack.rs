//! Commands that change stacks.

use anyhow::{Result, bail};
use colored::Colorize;
use orchestrator::{
    CancelToken, ChangeSet, DiffSummary, Error, ProposedAction, ProviderKind, RunReport, Stack, group_by_type,
};
use std::process::ExitCode;

use crate::Context;
use crate::cli::{ApplyArgs, DestroyArgs, PlanArgs, RecoverArgs};
use crate::commands::{exit_for, short_id};
use crate::progress::TerminalProgress;
use crate::session::Session;
use crate::{template, ui};

pub fn plan(ctx: &Context, session: &Session, args: &PlanArgs) -> Result<ExitCode> {
    let template = template::load(&args.template)?;
    let change_set = session.engine.plan(&args.stack, &template)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&change_set)?);
    } else {
        show_change_set(ctx, &change_set);
        if !change_set.is_empty() {
            println!();
            ui::info(&format!(
                "Apply with: strata apply {} --change-set {}",
                change_set.stack_id, change_set.id
            ));
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn apply(ctx: &Context, session: &mut Session, args: &ApplyArgs) -> Result<ExitCode> {
    let (change_set, planned_here) = match (&args.template, &args.change_set) {
        (Some(path), _) => {
            let template = template::load(path)?;
            (session.engine.plan(&args.stack, &template)?, true)
        }
        (None, Some(id)) => {
            let change_set = session
                .engine
                .change_set(id)?
                .ok_or_else(|| Error::ChangeSetNotFound(id.clone()))?;
            if change_set.stack_id != args.stack {
                bail!("Change set {id} belongs to stack {}, not {}", change_set.stack_id, args.stack);
            }
            (change_set, false)
        }
        (None, None) => bail!("Pass --template or --change-set"),
    };

    let stack = session.engine.stack(&args.stack)?;
    show_change_set(ctx, &change_set);

    if change_set.is_empty() && stack.is_some() {
        session.engine.discard(&change_set.id)?;
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    if !ui::confirm(&format!("Apply these changes to {}?", args.stack), args.yes)? {
        if planned_here {
            session.engine.discard(&change_set.id)?;
        }
        ui::warn("Aborted; nothing was changed");
        return Ok(ExitCode::SUCCESS);
    }

    if involves_custom(&change_set, stack.as_ref()) {
        session.listen_for_callbacks()?;
    }

    let mut progress = TerminalProgress::new(ctx.quiet);
    let report = session.engine.apply(&change_set.id, &CancelToken::new(), &mut progress)?;
    show_report(session, &report)?;
    Ok(exit_for(&report))
}

pub fn destroy(ctx: &Context, session: &mut Session, args: &DestroyArgs) -> Result<ExitCode> {
    let stack = session
        .engine
        .stack(&args.stack)?
        .ok_or_else(|| Error::StackNotFound(args.stack.clone()))?;

    ui::header(&format!("Destroy {}", stack.id));
    if stack.resources.is_empty() {
        ui::dim("(no resources)");
    }
    for record in stack.resources.values() {
        println!(
            "  {} {} {}",
            ui::action_symbol(ProposedAction::Delete),
            record.logical_id.bold(),
            record.resource_type.dimmed()
        );
    }
    println!();
    if !ui::confirm(
        &format!("Delete {} resource(s) and the stack?", stack.resources.len()),
        args.yes,
    )? {
        ui::warn("Aborted; nothing was changed");
        return Ok(ExitCode::SUCCESS);
    }

    if stack.has_custom_resources() {
        session.listen_for_callbacks()?;
    }

    let mut progress = TerminalProgress::new(ctx.quiet);
    let report = session.engine.destroy(&args.stack, &CancelToken::new(), &mut progress)?;
    show_report(session, &report)?;
    Ok(exit_for(&report))
}

pub fn recover(ctx: &Context, session: &mut Session, args: &RecoverArgs) -> Result<ExitCode> {
    let stack = session
        .engine
        .stack(&args.stack)?
        .ok_or_else(|| Error::StackNotFound(args.stack.clone()))?;

    ui::header(&format!("Recover {}", stack.id));
    ui::kv("Status", &ui::status_label(stack.status).to_string());
    if let Some(reason) = &stack.status_reason {
        ui::kv("Reason", reason);
    }
    if let Some(run) = &stack.last_run {
        ui::kv("Last run", run);
    }
    println!();

    if !ui::confirm("Reconcile the last run with the providers and finish it?", args.yes)? {
        ui::warn("Aborted; nothing was changed");
        return Ok(ExitCode::SUCCESS);
    }

    let involves_custom = stack.has_custom_resources()
        || stack
            .snapshot
            .as_ref()
            .is_some_and(|s| s.resources.values().any(|r| r.provider == ProviderKind::Custom));
    if involves_custom {
        session.listen_for_callbacks()?;
    }

    let mut progress = TerminalProgress::new(ctx.quiet);
    let report = session.engine.recover(&args.stack, &mut progress)?;
    show_report(session, &report)?;
    Ok(exit_for(&report))
}

pub fn discard(session: &Session, change_set: &str) -> Result<ExitCode> {
    session.engine.discard(change_set)?;
    ui::success(&format!("Discarded change set {change_set}"));
    Ok(ExitCode::SUCCESS)
}

pub fn unlock(session: &Session, stack: &str, yes: bool) -> Result<ExitCode> {
    let Some(holder) = session.store().lease_holder(stack)? else {
        ui::info(&format!("Stack {stack} is not locked"));
        return Ok(ExitCode::SUCCESS);
    };
    ui::warn(&format!(
        "Stack {stack} is locked by {holder}. Only unlock it if that process is gone."
    ));
    if !ui::confirm("Break the lock?", yes)? {
        return Ok(ExitCode::SUCCESS);
    }
    session.store().break_lease(stack)?;
    ui::success(&format!("Unlocked {stack}; run `strata recover {stack}` if a run was interrupted"));
    Ok(ExitCode::SUCCESS)
}

fn involves_custom(change_set: &ChangeSet, stack: Option<&Stack>) -> bool {
    change_set
        .template
        .resources
        .iter()
        .any(|r| r.provider_kind() == ProviderKind::Custom)
        || stack.is_some_and(Stack::has_custom_resources)
}

fn show_change_set(ctx: &Context, change_set: &ChangeSet) {
    ui::header(&format!("Change set {} for {}", short_id(&change_set.id), change_set.stack_id));

    if change_set.is_empty() {
        ui::success("No changes; the stack matches the template");
        return;
    }

    for op in &change_set.operations {
        println!(
            "  {} {} {} {}",
            ui::action_symbol(op.action),
            op.logical_id.bold(),
            op.resource_type.dimmed(),
            format!("({})", op.reason).dimmed()
        );
        if let (Some(previous), Some(target)) = (&op.previous, &op.target) {
            ui::show_property_diff(&previous.resolved(), &target.resolved());
        }
    }

    let summary = DiffSummary::from_change_set(change_set);
    ui::section("Summary");
    ui::kv("Create", &summary.additions.to_string());
    ui::kv("Update", &summary.modifications.to_string());
    ui::kv("Replace", &summary.replacements.to_string());
    ui::kv("Delete", &summary.removals.to_string());

    if ctx.verbose > 0 {
        let mut groups: Vec<_> = group_by_type(change_set).into_iter().collect();
        groups.sort();
        ui::section("By type");
        for (resource_type, ids) in groups {
            ui::kv(&resource_type, &ids.join(", "));
        }
    }
}

fn show_report(session: &Session, report: &RunReport) -> Result<()> {
    println!();
    if report.is_success() {
        ui::success(&format!("{} is {}", report.stack_id, ui::status_label(report.status)));
    } else {
        ui::error(&format!("{} is {}", report.stack_id, ui::status_label(report.status)));
    }

    let s = &report.summary;
    if s.total_changes() > 0 || s.failed > 0 {
        ui::kv(
            "Changes",
            &format!(
                "{} created, {} updated, {} replaced, {} deleted, {} failed",
                s.created, s.updated, s.replaced, s.deleted, s.failed
            ),
        );
    }
    if let Some(failure) = &report.failure {
        let timed_out = if failure.timed_out { " (timed out)" } else { "" };
        ui::kv("Failed", &format!("{}: {}{timed_out}", failure.logical_id, failure.reason));
    }
    if !report.rolled_back.is_empty() {
        ui::kv("Rolled back", &report.rolled_back.join(", "));
    }
    if !report.unrecoverable.is_empty() {
        ui::warn(&format!(
            "Deleted before the failure and not restorable: {}",
            report.unrecoverable.join(", ")
        ));
    }

    if report.is_success()
        && let Some(stack) = session.engine.stack(&report.stack_id)?
        && !stack.outputs.is_empty()
    {
        ui::section("Outputs");
        for (name, value) in &stack.outputs {
            ui::kv(name, &display_value(value));
        }
    }
    ui::dim(&format!("run {}", report.run_id));
    Ok(())
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
