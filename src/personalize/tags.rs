//! Tag extraction and classification.
//!
//! A tag is any `[...]` run in a template. Tags are case-insensitive: `[Email]`
//! and `[email]` are the same tag and render the same value.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::DataField;

pub(crate) static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("static tag pattern"));

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^name\|?(.*)$").expect("static name pattern"));

/// A tag found in a template, classified against the list's data fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Lowercased tag text including brackets. Substitution looks tags up by this.
    pub key: String,
    /// Bracket content with surrounding brackets and spaces trimmed, lowercased.
    pub name: String,
    pub kind: TagKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagKind {
    /// Rendered from the recipient's value for this field.
    Field(DataField),
    Builtin(Builtin),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    /// Recipient name, or `fallback` when the recipient has none.
    Name { fallback: String },
    Email,
    ListName,
    AdminUrl,
    AdminLink,
    Date,
    UserId,
    ExternalPass,
    Recipient,
    EnvelopeSender,
    Identifier,
    LetterUrl,
    LetterLink,
    Subject,
    /// Renders as an empty string.
    Unknown,
}

/// Lowercased tags in `text`, deduplicated, in order of first appearance.
pub fn find_tags(text: &str) -> Vec<String> {
    collect_tags(&[text]).into_iter().map(|(key, _)| key).collect()
}

/// Tags of several texts as `(key, raw)` pairs, deduplicated on the key.
///
/// The raw text of the first occurrence is kept so inline fallbacks such as
/// `[name|Friend]` keep their case.
pub fn collect_tags(texts: &[&str]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for text in texts {
        for m in TAG_PATTERN.find_iter(text) {
            let key = m.as_str().to_lowercase();
            if !out.iter().any(|(k, _)| *k == key) {
                out.push((key, m.as_str().to_string()));
            }
        }
    }
    out
}

fn trim_tag(raw: &str) -> &str {
    raw.trim_matches(|c| c == '[' || c == ']' || c == ' ')
}

/// Classify collected tags. A tag whose trimmed content equals a field's token
/// is a field tag; anything else is a builtin.
pub fn match_tags(found: &[(String, String)], fields: &[DataField]) -> Vec<Tag> {
    found
        .iter()
        .map(|(key, raw)| {
            let name = trim_tag(key).to_string();
            let kind = match fields.iter().find(|f| f.token == name) {
                Some(field) => TagKind::Field(field.clone()),
                None => TagKind::Builtin(builtin(trim_tag(raw))),
            };
            Tag {
                key: key.clone(),
                name,
                kind,
            }
        })
        .collect()
}

fn builtin(content: &str) -> Builtin {
    // `name` is matched as a prefix, so `[names]` is a name tag with fallback "s".
    if let Some(caps) = NAME_PATTERN.captures(content) {
        let fallback = caps.get(1).map_or("", |m| m.as_str());
        return Builtin::Name {
            fallback: fallback.to_string(),
        };
    }
    match content.to_lowercase().as_str() {
        "email" => Builtin::Email,
        "listname" => Builtin::ListName,
        "adminurl" => Builtin::AdminUrl,
        "adminlink" => Builtin::AdminLink,
        "date" => Builtin::Date,
        "userid" => Builtin::UserId,
        "externalpass" => Builtin::ExternalPass,
        "recipient" => Builtin::Recipient,
        "envelopesender" => Builtin::EnvelopeSender,
        "identifier" => Builtin::Identifier,
        "letterurl" => Builtin::LetterUrl,
        "letterlink" => Builtin::LetterLink,
        "subject" => Builtin::Subject,
        _ => Builtin::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldId, ListId};

    #[test]
    fn finds_lowercased_unique_tags() {
        let tags = find_tags("Hi [Name], [EMAIL] or [email]. [ date ]");
        assert_eq!(tags, vec!["[name]", "[email]", "[ date ]"]);
    }

    #[test]
    fn name_fallback_keeps_case() {
        let found = collect_tags(&["Dear [name|Friend]"]);
        let tags = match_tags(&found, &[]);
        assert_eq!(
            tags[0].kind,
            TagKind::Builtin(Builtin::Name {
                fallback: "Friend".into()
            })
        );
    }

    #[test]
    fn field_token_wins_over_builtin() {
        let field = DataField {
            id: FieldId(1),
            list_id: ListId(1),
            name: "E-mail".into(),
            token: "email".into(),
            default_value: String::new(),
            is_gender: false,
            is_birth_year: false,
        };
        let tags = match_tags(&collect_tags(&["[ Email ]"]), std::slice::from_ref(&field));
        assert_eq!(tags[0].name, "email");
        assert_eq!(tags[0].kind, TagKind::Field(field));
    }
}
