//! Request normalization and reply formatting.
//!
//! Pure string functions; the dispatcher supplies prior context and
//! decoration settings.

/// Prompt ceiling in characters (not bytes).
pub const MAX_REQUEST_CHARS: usize = 4000;

/// Marks that end a sentence; a prompt ending in one is answered rather than continued.
pub const TERMINAL_PUNCTUATION: [char; 11] = [
    ',', '.', ';', '!', '?', '，', '。', '！', '？', '、', '…',
];

/// Appended to prompts without terminal punctuation.
pub const ANSWER_MARK: char = '？';

pub const EMPTY_REPLY_FALLBACK: &str =
    "The request did not produce a meaningful reply. Please ask a more specific question.";

const GROUP_REPLY_SEPARATOR: &str = " --------------------------------";

/// Builds the completion prompt. `None` means there is nothing to send.
pub fn build_request(
    raw_text: &str,
    prior_context: &str,
    self_mention: Option<&str>,
) -> Option<String> {
    let question = normalize_question(raw_text, self_mention)?;
    Some(compose_request(&question, prior_context))
}

/// Trims the sender's text and removes mentions of the bot. `None` when
/// nothing is left. This is what the session remembers as the request.
pub fn normalize_question(raw_text: &str, self_mention: Option<&str>) -> Option<String> {
    let text = match self_mention {
        Some(name) => strip_mention(raw_text, name),
        None => raw_text.trim().to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Prepends the prior exchange, enforces the ceiling and terminal punctuation.
fn compose_request(question: &str, prior_context: &str) -> String {
    let combined = if prior_context.is_empty() {
        question.to_string()
    } else {
        format!("{prior_context}\n{question}")
    };
    let mut request = truncate_chars(&combined, MAX_REQUEST_CHARS);

    let terminated = request
        .chars()
        .last()
        .is_some_and(|c| TERMINAL_PUNCTUATION.contains(&c));
    if !terminated {
        // Keep room for the mark so the ceiling holds.
        if request.chars().count() >= MAX_REQUEST_CHARS {
            request = truncate_chars(&request, MAX_REQUEST_CHARS - 1);
        }
        request.push(ANSWER_MARK);
    }
    request
}

/// Removes every `@name`, ignoring ASCII case like Telegram usernames do, and
/// trims the result. An empty name removes nothing.
pub fn strip_mention(text: &str, name: &str) -> String {
    if name.is_empty() {
        return text.trim().to_string();
    }
    let handle = format!("@{name}");
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = find_ignore_ascii_case(rest, &handle) {
        stripped.push_str(&rest[..idx]);
        rest = &rest[idx + handle.len()..];
    }
    stripped.push_str(rest);
    stripped.trim().to_string()
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    haystack
        .char_indices()
        .map(|(idx, _)| idx)
        .find(|&idx| {
            bytes
                .get(idx..idx + needle.len())
                .is_some_and(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
        })
}

/// Removes the first occurrence of the private trigger keyword and trims the result.
pub fn strip_trigger_keyword(text: &str, keyword: &str) -> String {
    if keyword.is_empty() {
        return text.trim().to_string();
    }
    text.replacen(keyword, "", 1).trim().to_string()
}

#[derive(Debug, Clone, Copy)]
pub enum ReplyDecoration<'a> {
    Private {
        prefix: &'a str,
    },
    Group {
        sender_name: &'a str,
        /// The sender's message with the bot mention removed.
        question: &'a str,
    },
}

/// Formats a raw completion into the message sent back to the chat.
pub fn build_reply(raw_reply: &str, decoration: ReplyDecoration<'_>) -> String {
    let mut reply = raw_reply;
    let paragraphs: Vec<&str> = raw_reply.split("\n\n").collect();
    if paragraphs.len() > 1 {
        // Character-class trim of the first paragraph's characters from both
        // ends, not a prefix removal. Kept for compatibility with existing
        // deployments; it can eat characters of the answer that also occur in
        // the lead paragraph.
        let lead = paragraphs[0];
        reply = reply.trim_matches(|c: char| lead.contains(c));
    }
    let reply = reply.trim();

    if reply.is_empty() {
        return match decoration {
            ReplyDecoration::Private { .. } => EMPTY_REPLY_FALLBACK.to_string(),
            ReplyDecoration::Group { sender_name, .. } => {
                format!("@{sender_name} {EMPTY_REPLY_FALLBACK}")
            }
        };
    }

    let decorated = match decoration {
        ReplyDecoration::Private { prefix } => format!("{prefix}\n{reply}"),
        ReplyDecoration::Group {
            sender_name,
            question,
        } => format!("@{sender_name}\n{question}\n{GROUP_REPLY_SEPARATOR}\n{reply}"),
    };
    decorated.trim_matches('\n').to_string()
}

/// Greeting posted when members join a group.
pub fn welcome_text(joined: &str) -> String {
    format!("Let's give a warm welcome 👏🏻 to {joined}, who just joined the group!")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
