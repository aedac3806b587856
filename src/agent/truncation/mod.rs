use crate::utils::regex::RegexPatterns;

/// Clean captured REPL output and cap it at `max_chars` bytes.
///
/// ANSI escapes are stripped first. Long output keeps its head and tail so that
/// both the first lines and the final result stay visible to the model.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let clean = RegexPatterns::ansi_escape().replace_all(output, "");

    if clean.len() <= max_chars {
        return clean.into_owned();
    }

    // For very small limits, just return a short indicator rather than
    // a truncation message that would exceed max_chars itself
    if max_chars < 120 {
        let safe = floor_char_boundary(&clean, max_chars);
        return clean[..safe].to_string();
    }

    let budget = max_chars - 100;
    let head_len = floor_char_boundary(&clean, budget * 2 / 3);
    let tail_start = ceil_char_boundary(&clean, clean.len() - (budget - head_len));
    format!(
        "{}\n\n... [output truncated - {} of {} chars omitted] ...\n\n{}",
        &clean[..head_len],
        tail_start - head_len,
        clean.len(),
        &clean[tail_start..]
    )
}

/// Single-line preview of at most `max_chars` characters.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Find the largest byte index <= `index` that is a valid char boundary.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
