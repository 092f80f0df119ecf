//! Terminal progress for engine runs.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use orchestrator::{OperationKind, OperationResult, Phase, ProgressCallback};

/// Progress bar over the resources a run touches.
///
/// Failures and rollback are printed above the bar so they stay visible
/// after it finishes.
pub struct TerminalProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet { ProgressBar::hidden() } else { ProgressBar::new(0) };
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar, quiet }
    }

    fn println(&self, line: String) {
        if !self.quiet {
            self.bar.println(line);
        }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_run_start(&mut self, stack_id: &str, _run_id: &str, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_message(stack_id.to_string());
    }

    fn on_batch_start(&mut self, phase: Phase, batch: usize, logical_ids: &[String]) {
        log::info!("{phase} batch {batch}: {}", logical_ids.join(", "));
        if phase != Phase::Forward {
            self.bar.set_message(format!("{phase}"));
        }
    }

    fn on_resource_start(&mut self, logical_id: &str, kind: OperationKind) {
        self.bar.set_message(format!("{kind} {logical_id}"));
    }

    fn on_resource_complete(&mut self, logical_id: &str, kind: OperationKind, result: &OperationResult) {
        match result {
            OperationResult::Succeeded => {
                self.println(format!("  {} {kind} {logical_id}", "✓".green()));
            }
            OperationResult::Failed { reason } => {
                self.println(format!("  {} {kind} {logical_id}: {reason}", "✗".red()));
            }
            OperationResult::Pending => {}
        }
        self.bar.inc(1);
    }

    fn on_rollback_start(&mut self, reason: &str) {
        self.println(format!("  {} rolling back: {reason}", "⚠".yellow()));
    }

    fn on_run_complete(&mut self) {
        self.bar.finish_and_clear();
    }
}
