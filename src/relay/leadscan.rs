use regex::Regex;
use std::sync::LazyLock;

// International numbers and common separators; a candidate must still carry
// at least MIN_PHONE_DIGITS real digits to count.
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\+?\d{1,4}[\s-]?)?(\(?\d{3}\)?[\s-]?)?[\d\s-]{7,15}").unwrap()
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap()
});

const MIN_PHONE_DIGITS: usize = 7;

/// Scan inbound chat text for a contact handle. Phone numbers win over
/// email addresses when both are present.
pub fn extract_contact(text: &str) -> Option<String> {
    let phone = PHONE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .find(|candidate| {
            candidate.chars().filter(char::is_ascii_digit).count() >= MIN_PHONE_DIGITS
        });
    if let Some(phone) = phone {
        return Some(phone.to_string());
    }

    EMAIL_RE.find(text).map(|m| m.as_str().trim().to_string())
}
