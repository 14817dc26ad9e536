use crate::delivery::Platform;
use crate::relay::InboundEvent;

/// Extract inbound text messages from a Meta webhook envelope.
///
/// WhatsApp Cloud API shape:
/// `{ "object": "whatsapp_business_account", "entry": [{ "id", "changes":
/// [{ "value": { "messages": [...] } }] }] }`
///
/// Instagram shape:
/// `{ "object": "instagram", "entry": [{ "id", "messaging": [{ "sender",
/// "message" }] }] }`
///
/// Status updates, non-text messages and unknown objects yield no events;
/// acknowledging them with an empty parse is correct behavior.
pub fn parse_envelope(payload: &serde_json::Value) -> Vec<InboundEvent> {
    match payload.get("object").and_then(|o| o.as_str()) {
        Some("whatsapp_business_account") => parse_whatsapp(payload),
        Some("instagram") => parse_instagram(payload),
        _ => Vec::new(),
    }
}

fn parse_whatsapp(payload: &serde_json::Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let Some(entries) = payload.get("entry").and_then(|e| e.as_array()) else {
        return events;
    };

    for entry in entries {
        let Some(business_account_id) = entry.get("id").and_then(|i| i.as_str()) else {
            continue;
        };
        let Some(changes) = entry.get("changes").and_then(|c| c.as_array()) else {
            continue;
        };

        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let Some(messages) = value.get("messages").and_then(|m| m.as_array()) else {
                continue;
            };

            for message in messages {
                if message.get("type").and_then(|t| t.as_str()) != Some("text") {
                    tracing::debug!("skipping non-text whatsapp message");
                    continue;
                }
                let Some(sender_id) = message.get("from").and_then(|f| f.as_str()) else {
                    continue;
                };
                let Some(message_id) = message.get("id").and_then(|i| i.as_str()) else {
                    continue;
                };
                let Some(text) = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(|b| b.as_str())
                else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }

                events.push(InboundEvent {
                    platform: Platform::WhatsApp,
                    business_account_id: business_account_id.to_string(),
                    sender_id: sender_id.to_string(),
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                });
            }
        }
    }

    events
}

fn parse_instagram(payload: &serde_json::Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let Some(entries) = payload.get("entry").and_then(|e| e.as_array()) else {
        return events;
    };

    for entry in entries {
        let Some(business_account_id) = entry.get("id").and_then(|i| i.as_str()) else {
            continue;
        };
        let Some(messaging) = entry.get("messaging").and_then(|m| m.as_array()) else {
            continue;
        };

        for item in messaging {
            let Some(sender_id) = item
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(|i| i.as_str())
            else {
                continue;
            };
            let Some(message) = item.get("message") else {
                continue;
            };
            let Some(message_id) = message.get("mid").and_then(|m| m.as_str()) else {
                continue;
            };
            let Some(text) = message.get("text").and_then(|t| t.as_str()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }

            events.push(InboundEvent {
                platform: Platform::Instagram,
                business_account_id: business_account_id.to_string(),
                sender_id: sender_id.to_string(),
                message_id: message_id.to_string(),
                text: text.to_string(),
            });
        }
    }

    events
}
