use crate::utils::regex::RegexPatterns;

/// How the model asked to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalMarker {
    /// `FINAL(text)`: the text itself is the answer.
    Answer(String),
    /// `FINAL_VAR(expr)`: the answer is read from the REPL namespace.
    Var(String),
}

impl FinalMarker {
    /// One-line snippet that resolves the marker inside the REPL.
    pub fn as_snippet(&self) -> Option<String> {
        match self {
            Self::Var(expr) => Some(format!("FINAL_VAR({})", expr)),
            Self::Answer(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    /// Code to run. A marker written after the code is honored only if the code succeeds.
    Code {
        snippet: String,
        final_marker: Option<FinalMarker>,
    },
    Final(FinalMarker),
    /// Neither code nor a final marker.
    Empty,
}

/// Split a model response into the code to execute and any final marker.
///
/// All runnable fences are concatenated in order. Markers are only looked for
/// outside fences and only at the start of a line, so mentioning `FINAL(...)`
/// mid-sentence does not end the session.
pub fn parse_response(text: &str) -> ParsedResponse {
    let fence = RegexPatterns::code_fence();
    let blocks: Vec<&str> = fence
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end())
        .filter(|block| !block.trim().is_empty())
        .collect();
    let prose = fence.replace_all(text, "\n");
    let final_marker = find_final_marker(&prose);

    if blocks.is_empty() {
        return final_marker.map_or(ParsedResponse::Empty, ParsedResponse::Final);
    }
    ParsedResponse::Code {
        snippet: blocks.join("\n\n"),
        final_marker,
    }
}

fn find_final_marker(prose: &str) -> Option<FinalMarker> {
    if let Some(caps) = RegexPatterns::final_var_marker().captures(prose) {
        let expr = caps[1].trim();
        if !expr.is_empty() {
            return Some(FinalMarker::Var(expr.to_string()));
        }
    }
    RegexPatterns::final_marker()
        .captures(prose)
        .map(|caps| FinalMarker::Answer(strip_quotes(caps[1].trim()).to_string()))
}

fn strip_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    s
}
