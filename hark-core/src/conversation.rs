//! Chat history for the current session.

use chrono::{DateTime, Local, TimeZone};

use crate::collaborators::{Message, Role, ToolCall};

/// Ordered chat history headed by a rendered system prompt.
///
/// Non-system messages are capped; the oldest turn goes first, and a turn
/// is never cut so that a tool result loses the call it answers.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    max_messages: usize,
}

impl Conversation {
    /// Render `{current_date}` / `{current_time}` with the local clock.
    pub fn new(system_prompt: &str, max_messages: usize) -> Self {
        Self::new_at(system_prompt, max_messages, &Local::now())
    }

    pub fn new_at<Tz: TimeZone>(system_prompt: &str, max_messages: usize, now: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            messages: vec![Message::system(render_prompt(system_prompt, now))],
            max_messages: max_messages.max(2),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.push(Message::assistant(text, tool_calls));
    }

    pub fn push_tool_result(&mut self, call_id: impl Into<String>, content: impl Into<String>) {
        self.push(Message::tool(call_id, content));
    }

    /// Remove the most recent user turn and everything after it.
    ///
    /// Used when a turn fails half way so the history never holds a tool
    /// call without its result.
    pub fn discard_last_turn(&mut self) {
        if let Some(idx) = self.messages.iter().rposition(|m| m.role == Role::User) {
            self.messages.truncate(idx);
        }
    }

    /// Drop everything except the system prompt.
    pub fn clear(&mut self) {
        self.messages.truncate(1);
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.trim();
    }

    fn trim(&mut self) {
        // Only trim at a user turn boundary so tool chains stay intact.
        if self.messages.last().map(|m| m.role) != Some(Role::User) {
            return;
        }
        while self.messages.len() - 1 > self.max_messages {
            self.messages.remove(1);
            while self.messages.len() > 2 && self.messages[1].role != Role::User {
                self.messages.remove(1);
            }
        }
    }
}

/// Substitute the date/time placeholders in a system prompt.
pub fn render_prompt<Tz: TimeZone>(template: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    template
        .replace("{current_date}", &now.format("%A, %B %d, %Y").to_string())
        .replace("{current_time}", &now.format("%I:%M %p").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn prompt_placeholders_are_rendered() {
        let convo = Conversation::new_at(
            "Today is {current_date} at {current_time}.",
            10,
            &at_noon(),
        );
        assert_eq!(
            convo.system_prompt(),
            "Today is Tuesday, March 05, 2024 at 12:30 PM."
        );
    }

    #[test]
    fn oldest_turns_are_dropped_first() {
        let mut convo = Conversation::new_at("sys", 4, &at_noon());
        for i in 0..4 {
            convo.push_user(format!("q{i}"));
            convo.push_assistant(format!("a{i}"), Vec::new());
        }
        convo.push_user("q4");

        let contents: Vec<&str> = convo.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "q3", "a3", "q4"]);
        assert_eq!(convo.messages()[0].role, Role::System);
    }

    #[test]
    fn trimming_never_orphans_tool_results() {
        let mut convo = Conversation::new_at("sys", 3, &at_noon());
        convo.push_user("weather?");
        convo.push_assistant(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "weather".into(),
                arguments: Default::default(),
            }],
        );
        convo.push_tool_result("c1", r#"{"temp":12}"#);
        convo.push_assistant("It is 12 degrees.", Vec::new());
        convo.push_user("thanks");

        assert_eq!(convo.messages()[1].role, Role::User);
        assert_eq!(convo.messages()[1].content, "thanks");
        assert!(convo.messages().iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn failed_turn_is_discarded_whole() {
        let mut convo = Conversation::new_at("sys", 10, &at_noon());
        convo.push_user("first");
        convo.push_assistant("ok", Vec::new());
        convo.push_user("second");
        convo.push_assistant(
            "",
            vec![ToolCall {
                id: "c9".into(),
                name: "lights".into(),
                arguments: Default::default(),
            }],
        );
        convo.discard_last_turn();
        let contents: Vec<&str> = convo.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "first", "ok"]);
    }

    #[test]
    fn clear_keeps_the_system_prompt() {
        let mut convo = Conversation::new_at("sys", 4, &at_noon());
        convo.push_user("hello");
        convo.clear();
        assert_eq!(convo.messages().len(), 1);
        assert_eq!(convo.system_prompt(), "sys");
    }
}
