use crate::inference::ChatTurn;
use crate::store::{Speaker, SpeakerTurn};

/// Assemble the grounded prompt in fixed order: system prompt, knowledge
/// block, replayed window, new customer message.
///
/// The `[KNOWLEDGE_BASE]` header is emitted even when the knowledge text is
/// empty so the prompt shape stays stable across tenants.
pub fn assemble_prompt(
    system_prompt: &str,
    knowledge_text: &str,
    window: &[SpeakerTurn],
    message: &str,
) -> Vec<ChatTurn> {
    let system_content = format!(
        "{}\n\n[KNOWLEDGE_BASE]\n{}",
        system_prompt.trim(),
        knowledge_text.trim()
    )
    .trim()
    .to_string();

    let mut turns = Vec::with_capacity(window.len() + 2);
    turns.push(ChatTurn::system(system_content));

    for turn in window {
        turns.push(match turn.speaker {
            Speaker::Customer => ChatTurn::user(turn.text.clone()),
            Speaker::Assistant => ChatTurn::assistant(turn.text.clone()),
        });
    }

    turns.push(ChatTurn::user(message));
    turns
}
