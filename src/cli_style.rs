/*!
 * Strand CLI Style System
 *
 * Themed text, status lines and summary tables for the `strand` binary.
 */

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use console::{style, StyledObject};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::runtime::{RuntimeStats, ShutdownReport};

// ============================================================================
// THEME COLORS
// ============================================================================

/// Brand colors for consistent styling
pub struct Theme;

impl Theme {
    /// Primary accent color (cyan)
    pub fn primary<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan()
    }

    pub fn success<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).green()
    }

    pub fn warning<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).yellow()
    }

    pub fn error<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).red()
    }

    /// Muted/secondary text (dim)
    pub fn muted<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).dim()
    }

    /// Header style (bold cyan)
    pub fn header<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan().bold()
    }
}

// ============================================================================
// ICONS
// ============================================================================

pub struct Icons;

impl Icons {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "⚠";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW_RIGHT: &'static str = "→";
}

/// Draw a section header with a line
pub fn section_header(title: &str) {
    let line_len = 50 - title.len().min(40);
    println!(
        "\n{} {}",
        Theme::header(title),
        Theme::muted("─".repeat(line_len))
    );
}

// ============================================================================
// TABLES
// ============================================================================

/// Create a minimal table (no outer borders)
pub fn create_minimal_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Create a key-value table for stats
pub fn stats_table(items: &[(&str, String)]) -> Table {
    let mut table = create_minimal_table();

    for (key, value) in items {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value)
                .fg(Color::White)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table
}

/// Rows describing a finished run
pub fn run_summary_rows(
    stats: &RuntimeStats,
    discarded: usize,
    elapsed: Duration,
) -> Vec<(&'static str, String)> {
    vec![
        ("Elapsed", format_duration(elapsed.as_secs_f64())),
        ("Completed", stats.executor.completed.to_string()),
        ("Failed", stats.executor.failed.to_string()),
        ("Rejected by breaker", stats.executor.rejected_by_breaker.to_string()),
        ("Rate limited", stats.executor.rate_limited.to_string()),
        ("Requeued", stats.executor.requeued.to_string()),
        ("Unknown operation", stats.executor.unknown_operation.to_string()),
        ("Discarded at shutdown", discarded.to_string()),
        ("Breaker", stats.breaker_state.to_string()),
        (
            "Cache",
            format!(
                "{} hits, {} misses, {} entries",
                stats.cache.hits, stats.cache.misses, stats.cache.entries
            ),
        ),
        (
            "Pool",
            format!(
                "{} created, {} reused, {} discarded",
                stats.pool.created, stats.pool.reused, stats.pool.discarded
            ),
        ),
        (
            "Batches",
            format!(
                "{} flushed ({} items), {} failed ({} items)",
                stats.batch.flushes,
                stats.batch.items_flushed,
                stats.batch.failed_flushes,
                stats.batch.items_failed
            ),
        ),
    ]
}

/// Print the summary of a finished run, followed by event counts
pub fn print_run_summary(
    report: &ShutdownReport,
    events: &BTreeMap<&'static str, u64>,
    elapsed: Duration,
) {
    section_header("Run Summary");
    let rows = run_summary_rows(&report.stats, report.discarded_tasks, elapsed);
    println!("{}", stats_table(&rows));

    if !events.is_empty() {
        section_header("Events");
        let rows: Vec<(&str, String)> = events
            .iter()
            .map(|(kind, count)| (*kind, count.to_string()))
            .collect();
        println!("{}", stats_table(&rows));
    }
}

// ============================================================================
// FORMATTING
// ============================================================================

/// Format seconds as a short human readable duration
pub fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let rem = secs % 60.0;
        format!("{}m {:.0}s", mins, rem)
    } else {
        let hours = (secs / 3600.0).floor();
        let mins = ((secs % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours, mins)
    }
}

/// Print a styled error message with optional suggestion
pub fn print_error(message: &str, suggestion: Option<&str>) {
    eprintln!(
        "\n{} {}",
        Theme::error(format!("{} Error:", Icons::ERROR)),
        message
    );

    if let Some(hint) = suggestion {
        eprintln!(
            "  {} {}",
            Theme::muted(Icons::ARROW_RIGHT),
            Theme::muted(hint)
        );
    }
    eprintln!();
}

pub fn print_warning(message: &str) {
    eprintln!(
        "{} {}",
        Theme::warning(Icons::WARNING.to_string()),
        Theme::warning(message)
    );
}

pub fn print_success(message: &str) {
    println!(
        "{} {}",
        Theme::success(Icons::SUCCESS.to_string()),
        Theme::success(message)
    );
}

pub fn print_info(message: &str) {
    println!("{} {}", Theme::primary(Icons::INFO.to_string()), message);
}
