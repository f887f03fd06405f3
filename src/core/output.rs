//! Leveled console output, the teacher's `colored`-based idiom in place of a logging
//! framework dependency.

use colored::Colorize;

/// Emit an informational line, bold-prefixed the way the builder/selector narrate
/// progress (`@*{Selected}`-style emphasis in the source becomes bold here).
pub fn info(msg: &str) {
    println!("{}", msg);
}

pub fn emphasis(word: &str, rest: &str) {
    println!("{} {}", word.bold(), rest);
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "error:".red().bold(), msg);
}

pub fn bullet(msg: &str) {
    println!("  • {}", msg);
}

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_line_truncates() {
        let long = "a".repeat(100);
        let out = compact_line(&long, 10);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), 13);
    }

    #[test]
    fn test_compact_line_short_untouched() {
        assert_eq!(compact_line("hi there", 50), "hi there");
    }
}
