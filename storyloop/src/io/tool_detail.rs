//! Short display strings for agent tool invocations.

use serde_json::Value;

const MAX_DETAIL_CHARS: usize = 120;

/// Derive a one-line, human-readable detail from a tool's name and input.
pub fn tool_detail(tool: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str);
    let detail = match tool {
        "Read" | "Write" | "Edit" | "MultiEdit" => field("file_path").map(str::to_string),
        "NotebookEdit" => field("notebook_path").map(str::to_string),
        "Bash" => field("command").map(first_line),
        "Glob" => field("pattern").map(|pattern| match field("path") {
            Some(path) => format!("{pattern} in {path}"),
            None => pattern.to_string(),
        }),
        "Grep" => field("pattern").map(|pattern| format!("/{pattern}/")),
        "Task" => field("description").map(str::to_string),
        "WebFetch" => field("url").map(str::to_string),
        "WebSearch" => field("query").map(str::to_string),
        "TodoWrite" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("{} items", todos.len())),
        _ => first_string_field(input),
    };
    truncate(detail.unwrap_or_default().trim(), MAX_DETAIL_CHARS)
}

fn first_line(text: &str) -> String {
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default();
    if lines.next().is_some() {
        format!("{first} ...")
    } else {
        first.to_string()
    }
}

fn first_string_field(input: &Value) -> Option<String> {
    input
        .as_object()?
        .values()
        .find_map(Value::as_str)
        .map(first_line)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}
