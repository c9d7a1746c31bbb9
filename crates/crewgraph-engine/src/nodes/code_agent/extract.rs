use std::collections::HashSet;

use crewgraph_core::types::{AgentMessage, AgentPart};

/// What one poll of the message list tells us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Assistant messages produced since the prompt was posted.
    pub message_count: usize,
    /// Reasoning and in-progress text, in order.
    pub reasoning: String,
    /// One line per tool call, e.g. `[tool] bash (completed): run tests`.
    pub tool_lines: Vec<String>,
    /// Set once the remote model finalized a text answer.
    pub final_answer: Option<String>,
    /// Best-effort reply when no final answer arrived.
    pub latest_text: String,
    /// Whether some reasoning part is still being written.
    pub reasoning_active: bool,
}

impl Extraction {
    /// Text streamed to observers: reasoning followed by the tool summary.
    pub fn combined(&self) -> String {
        let mut out = self.reasoning.trim().to_string();
        for line in &self.tool_lines {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

fn is_tool_call_finish(finish: Option<&str>) -> bool {
    matches!(finish, Some("tool-calls") | Some("tool_calls"))
}

/// Summarize the assistant messages not present in `baseline`.
pub fn extract(messages: &[AgentMessage], baseline: &HashSet<String>) -> Extraction {
    let mut out = Extraction::default();

    for message in messages
        .iter()
        .filter(|m| m.is_assistant() && !baseline.contains(&m.id))
    {
        out.message_count += 1;
        let mut finished_text = Vec::new();

        for part in &message.parts {
            match part {
                AgentPart::Reasoning { text, finished } => {
                    push_block(&mut out.reasoning, text);
                    if !finished {
                        out.reasoning_active = true;
                    }
                }
                AgentPart::Text { text, finished } => {
                    if !text.trim().is_empty() {
                        out.latest_text = text.clone();
                    }
                    if *finished {
                        finished_text.push(text.as_str());
                    } else {
                        push_block(&mut out.reasoning, text);
                    }
                }
                AgentPart::Tool { tool, status, title } => {
                    let line = match title.as_deref().filter(|t| !t.is_empty()) {
                        Some(title) => format!("[tool] {tool} ({status}): {title}"),
                        None => format!("[tool] {tool} ({status})"),
                    };
                    out.tool_lines.push(line);
                }
                AgentPart::Other => {}
            }
        }

        if message.completed
            && !finished_text.is_empty()
            && !is_tool_call_finish(message.finish.as_deref())
        {
            out.final_answer = Some(finished_text.join("\n"));
        }
    }

    out
}

fn push_block(buf: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push_str("\n\n");
    }
    buf.push_str(text);
}
