use regex::Regex;
use std::sync::LazyLock;

/// Compiled regex patterns that are reused across the codebase
pub struct RegexPatterns;

impl RegexPatterns {
    /// Regex for matching ANSI escape codes
    pub fn ansi_escape() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("Failed to compile ANSI escape regex")
        });
        &RE
    }

    /// Fenced code block tagged `python`, `py`, `repl` or untagged. Group 1 is the body.
    pub fn code_fence() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?s)```[ \t]*(?:python3?|py|repl)?[ \t]*\r?\n(.*?)```")
                .expect("Failed to compile code fence regex")
        });
        &RE
    }

    /// `FINAL_VAR(expr)` marker at the start of a line. Group 1 is the argument.
    pub fn final_var_marker() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?m)^[ \t]*FINAL_VAR\(\s*([^)]*?)\s*\)")
                .expect("Failed to compile FINAL_VAR marker regex")
        });
        &RE
    }

    /// `FINAL(answer)` marker at the start of a line. The answer runs to the
    /// first `)` that ends a line, so it may contain parentheses and span lines.
    pub fn final_marker() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?ms)^[ \t]*FINAL\((.*?)\)[ \t]*$")
                .expect("Failed to compile FINAL marker regex")
        });
        &RE
    }

    /// A plain Python identifier.
    pub fn identifier() -> &'static Regex {
        static RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Failed to compile identifier regex")
        });
        &RE
    }
}
