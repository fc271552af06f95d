//! Output helpers for the CLI
//!
//! Status lines go to stdout; warnings and errors go to stderr so they
//! never mix with a remote program's output.

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

/// Width of the label column in `print_field`
const LABEL_WIDTH: usize = 13;

/// Format a `label : value` line with aligned colons
pub fn format_field(label: &str, value: &str) -> String {
    format!("{:<width$}: {}", label, value, width = LABEL_WIDTH)
}

/// Print a `label : value` line to stdout
pub fn print_field(label: &str, value: &str) {
    println!("{}", format_field(label, value));
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr with red coloring for error feedback to the user.
pub fn print_error(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_align() {
        assert_eq!(format_field("Identity", "abc"), "Identity     : abc");
        assert_eq!(format_field("Listening on", "def"), "Listening on : def");
    }
}
