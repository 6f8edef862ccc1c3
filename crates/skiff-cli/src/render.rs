//! Console rendering of run progress, operation results and errors.

use colored::Colorize;
use skiff_core::escape::{decode_escape, unified_diff};
use skiff_core::state::StateValue;
use skiff_ops::{OperationResult, Reporter};

/// Shrinks a string to the given width, ellipsizing the tail.
fn ellipsis(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
        out.push('…');
        out
    } else {
        s.to_owned()
    }
}

/// Renders operation output to the terminal the way an operator wants
/// to read it: an early status line that is overwritten with the
/// final colored verdict, change summaries, and optional content
/// diffs.
pub struct ConsoleReporter {
    /// Verbosity level from `-v`.
    pub verbose: u8,
    /// Whether to print per-operation change summaries.
    pub show_changes: bool,
    /// Whether to print content diffs.
    pub show_diffs: bool,
    /// Whether this is a dry run (annotates every title).
    pub dry_run: bool,
    indentation: usize,
}

impl ConsoleReporter {
    /// Creates a reporter with the given display options.
    pub fn new(verbose: u8, show_changes: bool, show_diffs: bool, dry_run: bool) -> Self {
        ConsoleReporter {
            verbose,
            show_changes,
            show_diffs,
            dry_run,
            indentation: 0,
        }
    }

    fn prefix(&self) -> String {
        "  ".repeat(self.indentation)
    }

    /// Prints an indented line.
    pub fn line(&self, text: &str) {
        println!("{}{}", self.prefix(), text);
    }

    /// Announces the host a deploy is about to run on.
    pub fn host(&self, name: &str) {
        println!("{} {}", "host".blue().bold(), name);
    }

    fn title(&self, kind: &str, description: &str, label: Option<&str>) -> String {
        let mut title = String::new();
        if self.dry_run {
            title.push_str(&format!("{} ", "(dry)".dimmed()));
        }
        title.push_str(description);
        if let Some(label) = label {
            title.push_str(&format!(" {}", format!("({label})").dimmed()));
        }
        let _ = kind;
        title
    }

    fn state_infos(&self, result: &OperationResult) -> Vec<String> {
        let mut infos = Vec::new();
        for (key, final_value) in &result.final_state {
            if final_value.is_nil() {
                continue;
            }
            let initial_value = result.initial.get(key).unwrap_or(&StateValue::Nil);
            let (mut key_str, mut initial_str, mut final_str) = (
                key.clone(),
                initial_value.to_string(),
                final_value.to_string(),
            );
            if self.verbose == 0 {
                key_str = ellipsis(&key_str, 12);
                initial_str = ellipsis(&initial_str, 9);
                final_str = ellipsis(&final_str, if initial_value.is_nil() { 21 } else { 9 });
            }

            if initial_value == final_value {
                if self.verbose >= 1 {
                    infos.push(format!("{key_str}: {initial_str}").dimmed().to_string());
                }
            } else if initial_value.is_nil() {
                infos.push(format!(
                    "{}{}",
                    format!("{key_str}: ").yellow(),
                    final_str.green()
                ));
            } else {
                infos.push(format!(
                    "{}{} {} {}",
                    format!("{key_str}: ").yellow(),
                    initial_str.red(),
                    "→".yellow(),
                    final_str.green()
                ));
            }
        }
        infos
    }
}

impl Reporter for ConsoleReporter {
    fn script_start(&mut self, path: &str, label: Option<&str>) {
        match label {
            Some(label) => self.line(&format!(
                "{} {} {}",
                "script".yellow().bold(),
                path,
                format!("({label})").dimmed()
            )),
            None => self.line(&format!("{} {}", "script".yellow().bold(), path)),
        }
    }

    fn operation_early(&mut self, kind: &str, description: &str, label: Option<&str>, nested: bool) {
        use std::io::Write;
        let title = self.title(kind, description, label);
        print!("{}{} {}", self.prefix(), kind.yellow().bold(), title);
        if nested {
            println!();
        }
        let _ = std::io::stdout().flush();
    }

    fn operation_result(&mut self, result: &OperationResult) {
        let kind_colored = if result.success {
            if result.changed {
                result.kind.green().bold()
            } else {
                result.kind.bold()
            }
        } else {
            result.kind.red().bold()
        };

        // Overwrite the early status line (nested operations already
        // moved past it).
        if !result.nested {
            print!("\r");
        }
        println!(
            "{}{} {}",
            self.prefix(),
            kind_colored,
            self.title(&result.kind, &result.description, result.label.as_deref())
        );

        if !result.success {
            if let Some(message) = &result.failure_message {
                self.line(&format!(" {} {}", "└".dimmed(), message.red()));
            }
            return;
        }

        if !self.show_changes || result.nested {
            return;
        }

        let infos = self.state_infos(result);
        let n_diffs = if self.show_diffs { result.diffs.len() } else { 0 };
        let box_char = if n_diffs == 0 { "└" } else { "├" };
        if !infos.is_empty() {
            self.line(&format!(
                " {} {}",
                box_char.dimmed(),
                infos.join(&format!("{} ", ",".dimmed()))
            ));
        }

        if self.show_diffs {
            let mut lines = Vec::new();
            for diff in &result.diffs {
                for (i, line) in unified_diff(&diff.path, diff.old.as_deref(), diff.new.as_deref())
                    .into_iter()
                    .enumerate()
                {
                    let colored_line = if i < 3 {
                        line.yellow().to_string()
                    } else {
                        match line.chars().next() {
                            Some('+') => line.green().to_string(),
                            Some('-') => line.red().to_string(),
                            Some('@') => line.blue().to_string(),
                            _ => line.dimmed().to_string(),
                        }
                    };
                    lines.push(colored_line);
                }
            }
            if !lines.is_empty() {
                let last = lines.len() - 1;
                for (i, line) in lines.into_iter().enumerate() {
                    let bar = if i == last { "└" } else { "│" };
                    self.line(&format!("{} {}", bar.dimmed(), line));
                }
            }
        }
    }

    fn command_failure_dump(
        &mut self,
        command: &[String],
        stdout: &[u8],
        stderr: &[u8],
        returncode: i32,
    ) {
        let cols: usize = 80;
        let bar = |msg: String| {
            let len = msg.chars().count();
            eprintln!("────────[ {msg} ]{}", "─".repeat(cols.saturating_sub(len + 12)));
        };
        bar(format!(
            "{} {command:?} {} with code {returncode}",
            "command".red().bold(),
            "failed".red().bold()
        ));
        bar(format!("{} (special characters escaped)", "stdout".red().bold()));
        eprintln!("{}", decode_escape(stdout));
        bar(format!("{} (special characters escaped)", "stderr".red().bold()));
        eprintln!("{}", decode_escape(stderr));
    }

    fn indent(&mut self) {
        self.indentation += 1;
    }

    fn dedent(&mut self) {
        self.indentation = self.indentation.saturating_sub(1);
    }
}

/// Prints a top-level error: the script stack first when one is
/// attached (unless debugging), then the error chain.
pub fn print_error(error: &anyhow::Error, debug: bool) {
    if !debug {
        if let Some(stack) = error.downcast_ref::<crate::script::ScriptStackError>() {
            eprintln!("{}", stack.render_stack());
            eprintln!("{} {}", "error:".red().bold(), stack.message());
            return;
        }
        eprintln!("{} {error}", "error:".red().bold());
        return;
    }
    eprintln!("{} {error:?}", "error:".red().bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ellipsis() {
        assert_eq!(ellipsis("short", 12), "short");
        assert_eq!(ellipsis("exactly-12ch", 12), "exactly-12ch");
        assert_eq!(ellipsis("much-too-long-for-this", 12), "much-too-lo…");
    }
}
