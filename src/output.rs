//! Output and color utilities for consistent terminal formatting
//!
//! Provides shared color functions respecting NO_COLOR environment variable.

use colored::Colorize;

/// Check if colors should be used (respects NO_COLOR env var)
pub fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

/// Colorize a user turn (cyan)
pub fn colorize_user(text: &str, use_color: bool) -> String {
    if use_color {
        text.cyan().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize an assistant turn (green)
pub fn colorize_bot(text: &str, use_color: bool) -> String {
    if use_color {
        text.green().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize a rank or id (yellow)
pub fn colorize_number(num: impl ToString, use_color: bool) -> String {
    if use_color {
        num.to_string().yellow().to_string()
    } else {
        num.to_string()
    }
}

/// Colorize labels and secondary text (dimmed)
pub fn colorize_label(text: &str, use_color: bool) -> String {
    if use_color {
        text.dimmed().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize headings (bold)
pub fn colorize_heading(text: &str, use_color: bool) -> String {
    if use_color {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}
