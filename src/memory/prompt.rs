// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text shapes used around stored exchanges.

/// Builds the text whose embedding represents a whole exchange.
pub fn compose_exchange(user_text: &str, assistant_text: &str) -> String {
    format!("User: {user_text} Bot: {assistant_text}")
}

/// Formats one exchange as a context line.
pub fn context_line(user_text: &str, assistant_text: &str) -> String {
    format!("User: {user_text} | Bot: {assistant_text}")
}

/// Prepends retrieved context to a new message.
///
/// With no context the message is returned unchanged.
pub fn enhance_prompt(context: &[String], message: &str) -> String {
    if context.is_empty() {
        return message.to_string();
    }

    format!(
        "Context from previous conversations:\n{}\n\nCurrent question: {}",
        context.join("\n"),
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_text_labels_both_turns() {
        assert_eq!(
            compose_exchange("hello", "hi there"),
            "User: hello Bot: hi there"
        );
    }

    #[test]
    fn context_line_uses_pipe_separator() {
        assert_eq!(context_line("hello", "hi there"), "User: hello | Bot: hi there");
    }

    #[test]
    fn enhance_without_context_is_identity() {
        assert_eq!(enhance_prompt(&[], "what next?"), "what next?");
    }

    #[test]
    fn enhance_joins_context_lines() {
        let context = vec![
            "User: a | Bot: b".to_string(),
            "User: c | Bot: d".to_string(),
        ];
        assert_eq!(
            enhance_prompt(&context, "what next?"),
            "Context from previous conversations:\nUser: a | Bot: b\nUser: c | Bot: d\n\nCurrent question: what next?"
        );
    }
}
