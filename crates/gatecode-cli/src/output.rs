//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use gatecode_core::{CodeRecord, CodeStats, ImportSummary, VerifyOutcome};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a single code
    pub fn print_code(&self, record: &CodeRecord) {
        match self.format {
            OutputFormat::Human => {
                println!("Code:      {}", record.code);
                println!("ID:        {}", record.id);
                println!("Status:    {}", status_label(record));
                println!("Generated: {}", short_time(&record.generated_at));
                if let Some(ref used_at) = record.used_at {
                    println!("Used:      {}", short_time(used_at));
                }
            }
            OutputFormat::Json => self.json(record),
            OutputFormat::Quiet => println!("{}", record.code),
        }
    }

    /// Print a list of codes
    pub fn print_codes(&self, records: &[CodeRecord]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No codes found.");
                    return;
                }
                for record in records {
                    println!(
                        "{:<12} | {:<6} | {} | {}",
                        truncate(&record.code, 12),
                        status_label(record),
                        short_time(&record.generated_at),
                        record.id
                    );
                }
                let stats = CodeStats::from_records(records);
                println!(
                    "\n{} code(s), {} unused, {} used",
                    stats.total, stats.unused, stats.used
                );
            }
            OutputFormat::Json => self.json(records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.code);
                }
            }
        }
    }

    /// Print the result of a redemption attempt
    pub fn print_verify(&self, outcome: &VerifyOutcome) {
        match self.format {
            OutputFormat::Human => {
                let mark = if outcome.success { "✓" } else { "✗" };
                println!("{} {}", mark, outcome.message);
            }
            OutputFormat::Json => self.json(outcome),
            OutputFormat::Quiet => {}
        }
    }

    /// Print an import summary
    pub fn print_import(&self, summary: &ImportSummary) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "✓ Imported {} code(s), {} new",
                    summary.total_imported, summary.new_codes_added
                );
            }
            OutputFormat::Json => self.json(summary),
            OutputFormat::Quiet => println!("{}", summary.new_codes_added),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn status_label(record: &CodeRecord) -> &'static str {
    if record.used {
        "used"
    } else {
        "unused"
    }
}

/// `YYYY-MM-DD HH:MM` for RFC 3339 stamps, anything else as-is
fn short_time(stamp: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(stamp)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| stamp.to_string())
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
