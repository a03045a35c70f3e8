//! Conversation manager: immutable base messages plus an append-only
//! history tail.
//!
//! Only the driver's task mutates history; gadget callbacks that want to
//! inject messages go through controller actions the driver applies.
//! `replace_history` exists for the compaction manager alone.

use gadgeteer_core::{Message, Role};

pub struct Conversation {
    base: Vec<Message>,
    history: Vec<Message>,
}

impl Conversation {
    /// Seed the conversation. `base` is frozen from here on.
    pub fn new(base: Vec<Message>) -> Self {
        Self {
            base,
            history: Vec::new(),
        }
    }

    pub fn base_messages(&self) -> &[Message] {
        &self.base
    }

    pub fn history_messages(&self) -> &[Message] {
        &self.history
    }

    /// Full prompt view: base followed by history.
    pub fn messages(&self) -> Vec<Message> {
        let mut all = self.base.clone();
        all.extend(self.history.iter().cloned());
        all
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.history.push(Message::user(content.into()));
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.history.push(Message::assistant(content.into()));
    }

    pub fn add_gadget_call_result(
        &mut self,
        invocation_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) {
        self.history
            .push(Message::gadget_result(invocation_id, content, is_error));
    }

    pub fn push_message(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Swap the history wholesale. Compaction only.
    pub fn replace_history(&mut self, new_history: Vec<Message>) {
        self.history = new_history;
    }

    pub fn len(&self) -> usize {
        self.base.len() + self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.history.is_empty()
    }

    /// Index of the first message of the last `turns` turns, where a turn is
    /// an assistant message together with the user/result messages that
    /// follow it. Used by compaction to find the preserved tail.
    pub fn turn_boundary(&self, turns: usize) -> usize {
        if turns == 0 {
            return self.history.len();
        }
        let mut seen = 0;
        for (idx, message) in self.history.iter().enumerate().rev() {
            if message.role == Role::Assistant {
                seen += 1;
                if seen == turns {
                    return idx;
                }
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gadgeteer_core::Message;

    #[test]
    fn base_stays_fixed_while_history_grows() {
        let mut conversation = Conversation::new(vec![Message::system("sys"), Message::user("hi")]);
        conversation.add_assistant_message("hello");
        assert_eq!(conversation.base_messages().len(), 2);
        assert_eq!(conversation.history_messages().len(), 1);
        assert_eq!(conversation.messages().len(), 3);
    }

    #[test]
    fn turn_boundary_counts_assistant_messages() {
        let mut conversation = Conversation::new(vec![]);
        conversation.add_assistant_message("turn 1");
        conversation.add_gadget_call_result("gadget_1", "r1", false);
        conversation.add_assistant_message("turn 2");
        conversation.add_gadget_call_result("gadget_2", "r2", false);
        conversation.add_assistant_message("turn 3");

        assert_eq!(conversation.turn_boundary(1), 4);
        assert_eq!(conversation.turn_boundary(2), 2);
        assert_eq!(conversation.turn_boundary(3), 0);
        assert_eq!(conversation.turn_boundary(10), 0);
    }
}
