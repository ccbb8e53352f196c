//! Console output helpers.
//!
//! Provides consistent ✓/⚠/✗ formatting for operator-facing progress.

use colored::Colorize;

/// Print the banner.
pub fn print_banner(cluster_name: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!(
        "{} {}",
        "Talos cluster bootstrap".cyan().bold(),
        format!("({cluster_name})").bright_black()
    );
    println!("{}", "═".repeat(70).bright_black());
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "─".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "─".repeat(70).bright_black());
}

/// Print a progress step with step number.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!();
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print an in-progress marker.
pub fn print_progress(message: &str) {
    println!("  {} {}", "→".cyan(), message);
}

/// Print a skipped step.
pub fn print_skipped(message: &str) {
    println!("{} {}", "⏭".bright_black(), message.bright_black());
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print a list item.
pub fn print_list_item(item: &str) {
    println!("  {} {item}", "•".bright_black());
}

/// Print a block of raw diagnostic output, indented.
pub fn print_diagnostic(title: &str, body: &str) {
    println!("  {}", title.bold());
    for line in body.lines() {
        println!("    {}", line.bright_black());
    }
}
