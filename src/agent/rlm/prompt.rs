use crate::agent::rlm::Task;
use crate::agent::tools::ToolRegistry;
use crate::agent::truncation::preview;
use crate::providers::base::Message;
use crate::session::{Session, TurnKind};
use serde_json::Value;

const CONTEXT_PREVIEW_CHARS: usize = 300;
const MAX_VARIABLE_HINTS: usize = 20;

const SYSTEM_PROMPT: &str = r#"You are tasked with answering a query with associated context. You can access, transform and analyze this context interactively in a persistent Python REPL environment. The REPL keeps its namespace between iterations, so build on what you already computed instead of recomputing it.

The REPL environment is initialized with:
1. A `context` variable that contains the data for your query. Inspect it before you rely on it; it may be too large to read in one go.
2. `llm_query(prompt)`: one plain language model call without a REPL. Returns the completion text. Useful for reading or classifying a chunk of text.
{recursion}3. `print()` output and the value of the last expression of each snippet are shown to you after the snippet runs. Long output is truncated, so print summaries rather than whole datasets.
4. `SHOW_VARS()` lists the variables you have defined.
{tools}
To run code, wrap it in a fenced block:
```repl
chunk = context[:1000]
print(len(context), chunk)
```

When you are done, finish in one of two ways:
- `FINAL(your answer)` on its own line, outside any code block, to answer with that text directly.
- `FINAL_VAR(variable_name)` to answer with the value of a variable from the REPL. You can call it inside a code block or write it on its own line.

Think step by step, plan, and execute the plan one snippet at a time. Do not answer before you have looked at the context."#;

const RECURSION_AVAILABLE: &str = "- `rlm_query(task, context=None)`: hand a sub-task to a child model that gets its own REPL with `context` bound. Returns the child's final answer.\n- `rlm_query_batched(tasks, contexts=None)`: run several child queries concurrently. Returns the answers in the order of `tasks`.\n";

const RECURSION_UNAVAILABLE: &str = "- `rlm_query` and `rlm_query_batched` are unavailable at this depth and raise `DepthExceededError`. Use `llm_query` for sub-questions.\n";

/// Instructions for one session, including tool signatures and whether it may recurse.
pub fn system_prompt(tools: &ToolRegistry, depth: u32, max_depth: u32) -> String {
    let recursion = if depth < max_depth {
        RECURSION_AVAILABLE
    } else {
        RECURSION_UNAVAILABLE
    };
    SYSTEM_PROMPT
        .replace("{recursion}", recursion)
        .replace("{tools}", &describe_tools(tools))
}

fn describe_tools(tools: &ToolRegistry) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut out = String::from("5. Custom functions, callable like any Python function:\n");
    for (name, tool) in tools.iter() {
        out.push_str(&format!(
            "   - `{}{}`: {}\n",
            name,
            tool.signature(),
            tool.description()
        ));
    }
    out
}

/// The opening user message: the instruction plus a description of `context`.
pub fn task_message(task: &Task) -> String {
    let mut msg = format!("Task:\n{}\n\n", task.instruction);
    match &task.context {
        Some(context) => msg.push_str(&describe_context(context)),
        None => msg.push_str("No `context` was provided; `context` is None in the REPL."),
    }
    msg
}

fn describe_context(context: &Value) -> String {
    let rendered = match context {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let shape = match context {
        Value::String(s) => format!("a str of {} characters", s.chars().count()),
        Value::Array(items) => format!("a list of {} items", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().take(10).map(String::as_str).collect();
            let more = if map.len() > keys.len() { ", ..." } else { "" };
            format!(
                "a dict with {} keys ({}{})",
                map.len(),
                keys.join(", "),
                more
            )
        }
        Value::Number(_) => "a number".to_string(),
        Value::Bool(_) => "a bool".to_string(),
        Value::Null => "None".to_string(),
    };
    format!(
        "Your context is {} ({} characters in total). Preview: {}",
        shape,
        rendered.chars().count(),
        preview(&rendered, CONTEXT_PREVIEW_CHARS)
    )
}

/// Full chat for the next backend call.
pub fn build_messages(
    system: &str,
    task: &str,
    session: &Session,
    max_iterations: u32,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(session.turns.len() * 2 + 3);
    messages.push(Message::system(system));
    messages.push(Message::user(task));

    for turn in &session.turns {
        match turn.kind {
            TurnKind::Summary => messages.push(Message::user(turn.render())),
            TurnKind::Final => messages.push(Message::assistant(&turn.model_output)),
            TurnKind::Step => {
                messages.push(Message::assistant(&turn.model_output));
                if let Some(obs) = &turn.observation {
                    messages.push(Message::user(format!("REPL output:\n{}", obs.render())));
                }
            }
        }
    }

    messages.push(Message::user(iteration_message(session, max_iterations)));
    messages
}

fn iteration_message(session: &Session, max_iterations: u32) -> String {
    let mut msg = format!(
        "Iteration {} of {}.",
        session.iterations + 1,
        max_iterations
    );
    if session.turns.is_empty() {
        msg.push_str(" You have not interacted with the REPL yet. Start by inspecting `context`.");
    }
    if !session.variables.is_empty() {
        msg.push_str("\nVariables in the REPL:\n");
        for var in session.variables.iter().take(MAX_VARIABLE_HINTS) {
            msg.push_str(&format!("- {}\n", var.render()));
        }
        if session.variables.len() > MAX_VARIABLE_HINTS {
            msg.push_str(&format!(
                "- ... and {} more\n",
                session.variables.len() - MAX_VARIABLE_HINTS
            ));
        }
    }
    msg.push_str("\nContinue with a ```repl block, or finish with FINAL(...) / FINAL_VAR(...).");
    msg
}
