use anyhow::{Result, bail};
use colored::{ColoredString, Colorize};
use orchestrator::{Properties, ProposedAction, StackStatus};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

pub fn status_label(status: StackStatus) -> ColoredString {
    let name = status.as_str();
    match status {
        StackStatus::CreateComplete | StackStatus::UpdateComplete | StackStatus::DeleteComplete => name.green(),
        StackStatus::RollbackComplete => name.yellow(),
        StackStatus::RollbackFailed | StackStatus::Failed => name.red().bold(),
        _ => name.cyan(),
    }
}

pub fn action_symbol(action: ProposedAction) -> ColoredString {
    match action {
        ProposedAction::Create => "+".green().bold(),
        ProposedAction::Update => "~".yellow().bold(),
        ProposedAction::Replace => "±".magenta().bold(),
        ProposedAction::Delete => "-".red().bold(),
    }
}

/// Render the line diff between two property bags as pretty JSON
pub fn property_diff_lines(old: &Properties, new: &Properties) -> Vec<(char, String)> {
    let old_text = serde_json::to_string_pretty(old).unwrap_or_default();
    let new_text = serde_json::to_string_pretty(new).unwrap_or_default();

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    diff.iter_all_changes()
        .filter_map(|change| {
            let line = change.to_string_lossy().trim_end().to_string();
            match change.tag() {
                similar::ChangeTag::Delete => Some(('-', line)),
                similar::ChangeTag::Insert => Some(('+', line)),
                similar::ChangeTag::Equal => None,
            }
        })
        .collect()
}

/// Show a property diff indented under a change set entry
pub fn show_property_diff(old: &Properties, new: &Properties) {
    let lines = property_diff_lines(old, new);
    if lines.is_empty() {
        println!("      {}", "(properties unchanged)".dimmed());
        return;
    }
    for (tag, line) in lines {
        match tag {
            '-' => println!("      {}", format!("- {line}").red()),
            _ => println!("      {}", format!("+ {line}").green()),
        }
    }
}

/// Ask before doing something destructive. `--yes` skips the prompt; a
/// non-interactive terminal without `--yes` refuses.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if !console::user_attended() {
        bail!("Refusing to prompt on a non-interactive terminal; pass --yes to proceed");
    }
    Ok(dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_property_diff_only_changed_lines() {
        let old = props(json!({"path": "/tmp/a", "mode": "0644"}));
        let new = props(json!({"path": "/tmp/a", "mode": "0600"}));
        let lines = property_diff_lines(&old, &new);
        assert_eq!(
            lines,
            vec![
                ('-', r#"  "mode": "0644","#.to_string()),
                ('+', r#"  "mode": "0600","#.to_string()),
            ]
        );
    }

    #[test]
    fn test_property_diff_identical() {
        let old = props(json!({"path": "/tmp/a"}));
        assert!(property_diff_lines(&old, &old.clone()).is_empty());
    }

    #[test]
    fn test_confirm_assume_yes() {
        assert!(confirm("Destroy?", true).unwrap());
    }
}
