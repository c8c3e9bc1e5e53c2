use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use safeup_core::PreflightReport;
use safeup_flex::FlexObject;
use safeup_upgrade::{ProgressEvent, ProgressSink, ProgressStage, SwapRecovery};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(allow_rich: bool, stdout_is_terminal: bool) -> OutputStyle {
    if allow_rich && stdout_is_terminal {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "err" => "[ERR]",
                _ => "[..]",
            };
            format!("{badge} {message}")
        }
    }
}

pub(crate) fn print_status(style: OutputStyle, status: &str, message: &str) {
    println!("{}", render_status_line(style, status, message));
}

pub(crate) fn print_section(style: OutputStyle, title: &str) {
    if style == OutputStyle::Rich {
        println!("{}", colorize(section_style(), &format!("== {title} ==")));
    }
}

pub(crate) fn format_preflight_lines(report: &PreflightReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if !report.has_issues() {
        lines.push(render_status_line(style, "ok", "no preflight issues found"));
        return lines;
    }

    for (slug, pending) in &report.plugins_pending {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "pending {} update: {slug} {} -> {}",
                pending.kind.singular(),
                pending.current.as_deref().unwrap_or("?"),
                pending.available.as_deref().unwrap_or("?")
            ),
        ));
    }
    for (slug, conflict) in &report.dependency_conflicts {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "dependency conflict: {slug} requires {} ({})",
                conflict.requires,
                conflict.declaration.display()
            ),
        ));
    }
    for (slug, usages) in &report.deprecated_api_usages {
        for usage in usages {
            lines.push(render_status_line(
                style,
                "warn",
                &format!(
                    "deprecated API call: {slug} uses {} ({})",
                    usage.method,
                    usage.file.display()
                ),
            ));
        }
    }
    for warning in &report.warnings {
        lines.push(render_status_line(style, "warn", warning));
    }
    lines
}

pub(crate) fn format_recovery_line(outcome: &SwapRecovery, style: OutputStyle) -> String {
    match outcome {
        SwapRecovery::Clean => render_status_line(style, "ok", "no interrupted swap found"),
        SwapRecovery::Completed(marker) => render_status_line(
            style,
            "warn",
            &format!(
                "completed interrupted {:?} swap for {}",
                marker.operation, marker.manifest_id
            )
            .to_lowercase(),
        ),
        SwapRecovery::Reversed(marker) => render_status_line(
            style,
            "warn",
            &format!(
                "reversed interrupted {:?} swap for {}",
                marker.operation, marker.manifest_id
            )
            .to_lowercase(),
        ),
    }
}

pub(crate) fn render_object(object: &FlexObject) -> serde_json::Value {
    serde_json::json!({
        "key": object.key(),
        "storage_key": object.storage_key(),
        "flex_key": object.flex_key(),
        "exists": object.exists(),
        "data": object.data(),
    })
}

/// Spinner fed by service progress events. Draws on stderr so stdout stays
/// scriptable; nothing is drawn until the first event arrives.
pub(crate) struct TerminalProgress {
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Option<Instant>,
}

impl TerminalProgress {
    pub(crate) fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            progress_bar: None,
            started_at: None,
        }
    }

    fn bar(&mut self) -> &ProgressBar {
        let label = &self.label;
        self.started_at.get_or_insert_with(Instant::now);
        self.progress_bar.get_or_insert_with(|| {
            let progress_bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {prefix:<10} [{bar:20.cyan/blue}] {pos:>3}% {wide_msg}",
            ) {
                progress_bar.set_style(style.tick_chars("|/-\\ ").progress_chars("=>-"));
            }
            progress_bar.set_prefix(label.clone());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            progress_bar
        })
    }

    fn finish(&mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        let elapsed = self
            .started_at
            .take()
            .map(|started_at| started_at.elapsed())
            .unwrap_or_default();
        eprintln!(
            "{} complete in {}",
            colorize(progress_label_style(), &self.label),
            format_elapsed(elapsed)
        );
    }
}

impl ProgressSink for TerminalProgress {
    fn report(&mut self, event: &ProgressEvent) {
        if event.stage == ProgressStage::Complete {
            self.finish();
            return;
        }
        let progress_bar = self.bar();
        if let Some(percent) = event.percent {
            progress_bar.set_position(u64::from(percent.min(100)));
        }
        progress_bar.set_message(format!("{}: {}", event.stage, event.message));
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
