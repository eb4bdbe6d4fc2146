use serde::Deserialize;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Accumulates a stream-json transcript into the final text.
#[derive(Debug, Default)]
pub struct StreamCollector {
    accumulated: String,
    final_result: Option<String>,
    is_error: bool,
    tool_uses: u32,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of backend stdout.
    pub fn push_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.accumulated.push_str(&text);
                            self.accumulated.push('\n');
                        }
                        ContentBlock::ToolUse { .. } => self.tool_uses += 1,
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result { result, is_error }) => {
                self.final_result = result;
                self.is_error = is_error;
            }
            Ok(StreamEvent::User { .. }) | Ok(StreamEvent::System { .. }) => {}
            Err(_) => {
                // Not a stream event; keep the raw line.
                self.accumulated.push_str(line);
                self.accumulated.push('\n');
            }
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn tool_uses(&self) -> u32 {
        self.tool_uses
    }

    /// The final `result` text when present, otherwise everything accumulated.
    pub fn finish(self) -> String {
        self.final_result.unwrap_or(self.accumulated)
    }
}
