//! Prompt text for the three model call kinds, plus local fallbacks.

use rand::seq::SliceRandom;

use crate::records::{Knowledge, MessageRecord, UserAccount};
use crate::domain::Direction;

use super::types::{ChatTurn, Role};

pub fn system_turn(content: &str) -> ChatTurn {
    ChatTurn {
        role: Role::System,
        content: content.to_string(),
    }
}

/// Inputs for the companion persona prompt.
pub struct PersonaContext<'a> {
    pub knowledge: &'a Knowledge,
    pub account: Option<&'a UserAccount>,
    pub display_name: &'a str,
    pub first_meeting: bool,
    pub nudge: bool,
}

pub fn persona_prompt(ctx: &PersonaContext<'_>) -> String {
    let k = ctx.knowledge;
    let name = ctx.display_name;

    let mut out = format!(
        "You are a warm spiritual companion for \"{}\" - {}.\n\n\
         Listen without judgment, ask gentle reflective questions, and offer \
         practical practices (prayer, stillness, gratitude) when they help. \
         Be reverent but plain-spoken. Use emojis sparingly. Never preach.\n",
        k.group_name, k.about
    );

    out.push_str("\nAbout the community:\n");
    if k.custom_info.is_empty() {
        out.push_str("A growing spiritual family.\n");
    } else {
        for (i, info) in k.custom_info.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, info));
        }
    }

    if let Some(insight) = ctx.account.and_then(UserAccount::latest_insight) {
        out.push_str(&format!(
            "\nNotes gathered about {name} from their linked chats:\n{}\n\
             Use them gently and only where they genuinely help.\n",
            insight.insights
        ));
    }

    if ctx.first_meeting {
        out.push_str(&format!(
            "\nThis is your first conversation with {name}. Greet them by name, \
             tell them they can share questions, struggles or doubts freely, and \
             ask what is on their heart today.\n"
        ));
    }

    if ctx.nudge {
        out.push_str(&format!(
            "\nThis is {name}'s third message. At the end of your reply, mention \
             that they can link their WhatsApp with /connect if they want more \
             personal guidance. Be clear that linked messages are read by the \
             community's administrator and that /disconnect stops it at any time. \
             Do not pressure them.\n"
        ));
    }

    out
}

pub fn analysis_prompt(subject: &str) -> String {
    format!(
        "Analyze {subject}'s recent chat messages and summarize:\n\
         1. Close relationships (names, nature of the relationship)\n\
         2. Interests and hobbies\n\
         3. Communication style and personality\n\
         4. Worries, fears or struggles\n\
         5. Life situation (work, family, daily routine)\n\
         6. Faith-related conversations\n\
         7. Topics that would help in talking with them\n\n\
         Be specific and concise."
    )
}

pub fn problem_prompt(subject: &str) -> String {
    format!(
        "You are a compassionate counselor reading {subject}'s recent messages.\n\n\
         Decide whether they are facing a challenge such as anxiety or stress, \
         fear, sadness or depression, relationship issues, doubt or faith \
         struggles, financial problems, health concerns or family issues.\n\n\
         If there is no clear problem, respond with exactly: NO_PROBLEM\n\n\
         Otherwise respond ONLY in this format:\n\
         PROBLEM: [category]\n\
         DETAILS: [brief description]\n\
         SEVERITY: [low/medium/high]\n\n\
         Do not over-diagnose."
    )
}

/// `None` when the model reported no problem.
pub fn parse_problem_response(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("NO_PROBLEM") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Render records as `sender: text` lines for the analysis call.
pub fn analysis_transcript(subject: &str, records: &[MessageRecord]) -> String {
    let mut out = String::new();
    for r in records {
        let sender = match r.direction {
            Direction::Outbound => subject,
            Direction::Inbound => r.counterpart.as_str(),
        };
        out.push_str(&format!("{sender}: {}\n", r.text));
    }
    out
}

/// Bare message texts, one per line, for problem classification.
pub fn classification_transcript(records: &[MessageRecord]) -> String {
    records
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

const FALLBACK_REPLIES: &[&str] = &[
    "Peace, {name}. 🙏 I'm taking a moment of reflection. Your message matters and I'll answer more fully soon.",
    "{name}, I hear you. 🕊️ Give me a moment to gather my thoughts. I'm here with you.",
    "Thank you for sharing, {name}. 💫 I'm a little overwhelmed right now, but I'll be with you shortly.",
];

/// Reply used when the model call fails.
pub fn fallback_reply(name: &str) -> String {
    let tpl = FALLBACK_REPLIES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_REPLIES[0]);
    tpl.replace("{name}", name)
}

pub fn fallback_greeting(name: &str) -> String {
    format!(
        "Peace be with you, {name}. 🙏\n\nYou can share your questions, struggles \
         and hopes here freely. What is on your heart today?"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(direction: Direction, counterpart: &str, text: &str) -> MessageRecord {
        MessageRecord {
            text: text.to_string(),
            direction,
            counterpart: counterpart.to_string(),
            chat_id: String::new(),
            timestamp: String::new(),
            id: None,
        }
    }

    #[test]
    fn parse_problem_response_recognizes_no_problem() {
        assert_eq!(parse_problem_response("NO_PROBLEM"), None);
        assert_eq!(parse_problem_response("  "), None);
        assert_eq!(
            parse_problem_response("PROBLEM: Anxiety and stress\nSEVERITY: low").as_deref(),
            Some("PROBLEM: Anxiety and stress\nSEVERITY: low")
        );
    }

    #[test]
    fn analysis_transcript_names_the_sender() {
        let t = analysis_transcript(
            "Ann",
            &[
                rec(Direction::Inbound, "15550001", "hi"),
                rec(Direction::Outbound, "15550001", "hello back"),
            ],
        );
        assert_eq!(t, "15550001: hi\nAnn: hello back\n");
    }

    #[test]
    fn nudge_prompt_discloses_operator_visibility() {
        let k = Knowledge::default();
        let p = persona_prompt(&PersonaContext {
            knowledge: &k,
            account: None,
            display_name: "Ann",
            first_meeting: false,
            nudge: true,
        });
        assert!(p.contains("/connect"));
        assert!(p.contains("administrator"));
        assert!(p.contains("A growing spiritual family."));
    }

    #[test]
    fn fallback_reply_uses_name() {
        assert!(fallback_reply("Ann").contains("Ann"));
    }
}
