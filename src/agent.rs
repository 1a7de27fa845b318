use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AgentConfig;

/// Which pipeline phase a spawn serves. Verification gets the restricted
/// tool set and its own turn limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Implementation,
    Verification,
    Fix,
}

/// The supported agent binaries. A closed sum: adding an agent means
/// touching every match below, which is the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Build the spawn command for this agent. A configured override wins;
    /// `{{PROMPT}}` in override args is substituted, otherwise the prompt is
    /// appended as the last argument.
    pub fn build_command(
        &self,
        prompt: &str,
        phase: Phase,
        config: &AgentConfig,
    ) -> (String, Vec<String>) {
        if let Some(over) = config.commands.get(self.as_str()) {
            let template = match phase {
                Phase::Verification => over.verification_args.as_ref().or(over.args.as_ref()),
                _ => over.args.as_ref(),
            };
            if over.command.is_some() || template.is_some() {
                let command = over
                    .command
                    .clone()
                    .unwrap_or_else(|| self.as_str().to_string());
                let mut args = Vec::new();
                let mut substituted = false;
                for arg in template.cloned().unwrap_or_default() {
                    if arg.contains("{{PROMPT}}") {
                        args.push(arg.replace("{{PROMPT}}", prompt));
                        substituted = true;
                    } else {
                        args.push(arg);
                    }
                }
                if !substituted {
                    args.push(prompt.to_string());
                }
                return (command, args);
            }
        }
        self.default_command(prompt, phase, config)
    }

    fn default_command(&self, prompt: &str, phase: Phase, config: &AgentConfig) -> (String, Vec<String>) {
        let max_turns = match phase {
            Phase::Verification => config.verification_max_turns,
            _ => config.implementation_max_turns,
        };
        match self {
            Self::Claude => {
                let mut args = vec![
                    "--print".to_string(),
                    "--verbose".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--max-turns".to_string(),
                    max_turns.to_string(),
                ];
                let tools = match phase {
                    Phase::Verification => &config.verification_allowed_tools,
                    _ => &config.allowed_tools,
                };
                if tools.is_empty() {
                    args.push("--dangerously-skip-permissions".to_string());
                } else {
                    args.push("--allowedTools".to_string());
                    args.push(tools.join(","));
                }
                args.push(prompt.to_string());
                ("claude".to_string(), args)
            }
            Self::Codex => (
                "codex".to_string(),
                vec![
                    "exec".to_string(),
                    "--json".to_string(),
                    "--full-auto".to_string(),
                    prompt.to_string(),
                ],
            ),
            Self::Gemini => (
                "gemini".to_string(),
                vec!["--yolo".to_string(), "--prompt".to_string(), prompt.to_string()],
            ),
        }
    }

    /// Does this output look like the agent hit a rate limit? For gemini the
    /// generic words ("quota", "limit") must co-occur with an
    /// agent-identifying token, since agents frequently print those words
    /// about the code they are working on.
    pub fn looks_like_rate_limit(&self, combined: &str) -> bool {
        let lower = combined.to_lowercase();
        let generic = lower.contains("rate limit")
            || lower.contains("rate_limit")
            || lower.contains("too many requests")
            || lower.contains("429")
            || lower.contains("usage limit")
            || lower.contains("quota")
            || lower.contains("usage exceeded")
            || lower.contains("temporarily unavailable")
            || lower.contains("overloaded");
        match self {
            Self::Claude | Self::Codex => generic,
            Self::Gemini => {
                generic
                    && (lower.contains("gemini")
                        || lower.contains("generatecontent")
                        || lower.contains("googleapis"))
            }
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The binary itself could not run (missing from PATH, bad install).
pub fn looks_unavailable(combined: &str) -> bool {
    let lower = combined.to_lowercase();
    lower.contains("command not found")
        || lower.contains("no such file or directory")
        || lower.contains("enoent")
        || lower.contains("not recognized as an internal or external command")
        || lower.contains("os error 2")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Result,
}

/// Who produced a message. `System` marks messages the orchestrator itself
/// injects into a session (agent switches, git errors).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageAgent {
    Claude,
    Codex,
    Gemini,
    System,
}

impl From<AgentKind> for MessageAgent {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Claude => Self::Claude,
            AgentKind::Codex => Self::Codex,
            AgentKind::Gemini => Self::Gemini,
        }
    }
}

/// One normalized event from an agent's stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<MessageAgent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    /// The original line, kept only when it did not parse as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl AgentMessage {
    fn new(kind: MessageKind, agent: Option<MessageAgent>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            agent,
            content: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            raw: None,
        }
    }

    /// Orchestrator-injected note (agent switch, git failure) recorded in
    /// the session's message log.
    pub fn system_note(content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::System, Some(MessageAgent::System));
        msg.content = Some(content.into());
        msg
    }
}

/// Parse one stdout line into normalized messages.
///
/// Recognizes the claude stream-json schemas (system / assistant / user /
/// result, with content-block arrays), legacy direct-message variants, and
/// the item-event schema emitted by codex's `exec --json`. A line that is
/// not JSON, or JSON of an unknown shape, becomes a single assistant message
/// carrying the raw payload.
pub fn parse_agent_line(line: &str, agent: AgentKind) -> Vec<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let who = Some(MessageAgent::from(agent));

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return vec![fallback_message(trimmed, who)],
    };
    if !value.is_object() {
        return vec![fallback_message(trimmed, who)];
    }

    match value.get("type").and_then(Value::as_str) {
        Some("system") => {
            let mut msg = AgentMessage::new(MessageKind::System, who);
            msg.content = value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| value.get("message").and_then(Value::as_str).map(str::to_string));
            vec![msg]
        }
        Some("assistant") => parse_content_blocks(&value, who),
        Some("user") => parse_tool_results(&value, who),
        Some("result") => {
            let mut msg = AgentMessage::new(MessageKind::Result, who);
            msg.content = value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| value.get("subtype").and_then(Value::as_str).map(str::to_string));
            vec![msg]
        }
        // Legacy direct-message schema: {"type":"message","content":"..."}
        Some("message") => {
            let mut msg = AgentMessage::new(MessageKind::Assistant, who);
            msg.content = value
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| value.get("text").and_then(Value::as_str).map(str::to_string));
            vec![msg]
        }
        // Item events from codex exec --json
        Some("item.started") | Some("item.updated") | Some("item.completed") => {
            parse_item_event(&value, who)
                .map(|m| vec![m])
                .unwrap_or_default()
        }
        _ => vec![fallback_message(trimmed, who)],
    }
}

fn parse_content_blocks(value: &Value, who: Option<MessageAgent>) -> Vec<AgentMessage> {
    let blocks = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);

    let Some(blocks) = blocks else {
        // Legacy shape: assistant with a flat text field
        let mut msg = AgentMessage::new(MessageKind::Assistant, who);
        msg.content = value.get("text").and_then(Value::as_str).map(str::to_string);
        return vec![msg];
    };

    let mut messages = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let mut msg = AgentMessage::new(MessageKind::Assistant, who);
                msg.content = block.get("text").and_then(Value::as_str).map(str::to_string);
                messages.push(msg);
            }
            Some("tool_use") => {
                let mut msg = AgentMessage::new(MessageKind::ToolUse, who);
                msg.tool_name = block.get("name").and_then(Value::as_str).map(str::to_string);
                msg.tool_input = block.get("input").cloned();
                messages.push(msg);
            }
            _ => {}
        }
    }
    messages
}

fn parse_tool_results(value: &Value, who: Option<MessageAgent>) -> Vec<AgentMessage> {
    let blocks = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);

    let Some(blocks) = blocks else {
        return Vec::new();
    };

    let mut messages = Vec::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let mut msg = AgentMessage::new(MessageKind::ToolResult, who);
            msg.tool_result = match block.get("content") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Array(parts)) => {
                    let text: Vec<&str> = parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect();
                    Some(text.join("\n"))
                }
                _ => None,
            };
            messages.push(msg);
        }
    }
    messages
}

fn parse_item_event(value: &Value, who: Option<MessageAgent>) -> Option<AgentMessage> {
    let item = value.get("item")?;
    match item.get("type").and_then(Value::as_str) {
        Some("agent_message") | Some("reasoning") => {
            let mut msg = AgentMessage::new(MessageKind::Assistant, who);
            msg.content = item.get("text").and_then(Value::as_str).map(str::to_string);
            Some(msg)
        }
        Some("command_execution") => {
            let mut msg = AgentMessage::new(MessageKind::ToolUse, who);
            msg.tool_name = Some("command".into());
            msg.tool_input = item.get("command").cloned();
            msg.tool_result = item
                .get("aggregated_output")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(msg)
        }
        _ => None,
    }
}

fn fallback_message(line: &str, who: Option<MessageAgent>) -> AgentMessage {
    let mut msg = AgentMessage::new(MessageKind::Assistant, who);
    msg.content = Some(line.to_string());
    msg.raw = Some(Value::String(line.to_string()));
    msg
}
