//! Report Module
//!
//! End-of-batch summary printed to stdout.

use crate::batch::BatchResult;
use console::style;
use std::time::Duration;

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Percentage saved relative to the input. Negative when the output grew.
pub fn size_reduction_percent(input_bytes: u64, output_bytes: u64) -> f64 {
    if input_bytes > 0 {
        (1.0 - output_bytes as f64 / input_bytes as f64) * 100.0
    } else {
        0.0
    }
}

pub fn print_summary_report(
    result: &BatchResult,
    duration: Duration,
    input_bytes: u64,
    output_bytes: u64,
    operation_name: &str,
) {
    let reduction = size_reduction_percent(input_bytes, output_bytes);
    let rule = "═".repeat(60);

    println!();
    println!("{}", style(&rule).cyan());
    println!("  {}", style(format!("{} Summary Report", operation_name)).cyan().bold());
    println!("{}", style(&rule).cyan());
    println!("  Files Processed:  {:>12}", result.total);
    println!("  Succeeded:        {:>12}", style(result.succeeded).green());
    println!("  Failed:           {:>12}", style(result.failed).red());
    println!("  Skipped:          {:>12}", result.skipped);
    println!("  Cancelled:        {:>12}", style(result.cancelled).yellow());
    println!("  Success Rate:     {:>11.1}%", result.success_rate());
    println!("{}", style("─".repeat(60)).dim());
    println!("  Input Size:       {:>12}", format_bytes(input_bytes));
    println!("  Output Size:      {:>12}", format_bytes(output_bytes));
    let reduction_str = format!("{:>11.1}%", reduction);
    if reduction >= 0.0 {
        println!("  Size Reduction:   {}", style(reduction_str).green().bold());
    } else {
        println!("  Size Reduction:   {}", style(reduction_str).red());
    }
    println!("{}", style("─".repeat(60)).dim());
    println!("  Total Time:       {:>12}", format_duration(duration));
    if result.total > 0 {
        let avg_time = duration.as_secs_f64() / result.total as f64;
        println!("  Avg Time/File:    {:>11.2}s", avg_time);
    }
    println!("{}", style(&rule).cyan());

    if !result.errors.is_empty() {
        println!();
        println!("{}", style("Errors encountered:").red().bold());
        for (path, error) in &result.errors {
            println!("   {} -> {}", path.display(), error);
        }
    }
}
