//! Chat markup normalization.
//!
//! Raw platform messages carry wire markup — `<@U123>` user mentions,
//! `<#C123|general>` channel references, `<https://…|label>` links, and
//! special broadcast tokens. Normalization rewrites all of it into plain
//! prose. The normalized text is what both the embedding and the metadata
//! excerpt see.
//!
//! User-name resolution is the only non-local step: [`mention_ids`] collects
//! the ids in a text so the caller can resolve them through its cache, and
//! [`clean`] performs the pure rewrite given the resolved names.

use std::collections::HashMap;

/// Collect the user ids referenced by `<@U…>` mentions, in order of first
/// appearance, without duplicates.
pub fn mention_ids(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for token in angle_tokens(text) {
        if let Some(id) = token.strip_prefix('@') {
            let id = id.split('|').next().unwrap_or(id);
            if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// Normalize a message body into plain prose.
///
/// `user_names` maps user ids to display names; unresolved mentions keep
/// the raw id so no information is lost.
pub fn clean(text: &str, user_names: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('>') {
            Some(end) => {
                out.push_str(&rewrite_token(&after[..end], user_names));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated angle bracket: keep the literal character.
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    collapse_whitespace(&out)
}

/// Rewrite one `<…>` token into its prose form.
fn rewrite_token(token: &str, user_names: &HashMap<String, String>) -> String {
    if let Some(body) = token.strip_prefix('@') {
        // <@U123> or <@U123|handle> → @display_name
        let id = body.split('|').next().unwrap_or(body);
        let name = user_names.get(id).map(String::as_str).unwrap_or(id);
        return format!("@{}", name);
    }

    if let Some(body) = token.strip_prefix('#') {
        // <#C123|general> → #general; bare <#C123> keeps the id.
        let name = body.split('|').nth(1).unwrap_or(body);
        return format!("#{}", name);
    }

    if let Some(body) = token.strip_prefix('!') {
        // <!here>, <!channel>, <!everyone> and <!thing|label>.
        return match body {
            "channel" | "here" | "everyone" => format!("@{}", body),
            other => other
                .split('|')
                .nth(1)
                .map(str::to_string)
                .unwrap_or_else(|| format!("@{}", other)),
        };
    }

    // <url|label> → label; <url> → url.
    match token.split_once('|') {
        Some((_, label)) if !label.is_empty() => label.to_string(),
        _ => token.to_string(),
    }
}

/// Iterate the bodies of well-formed `<…>` tokens.
fn angle_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split('<').skip(1).filter_map(|part| {
        part.find('>').map(|end| &part[..end])
    })
}

/// Strip control characters and collapse runs of whitespace to single
/// spaces, trimming the ends.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() || ch.is_control() {
            if ch.is_whitespace() {
                pending_space = true;
            }
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect()
    }

    #[test]
    fn test_user_mention_resolved() {
        let resolved = names(&[("U123", "jamie")]);
        assert_eq!(
            clean("hey <@U123> can you look?", &resolved),
            "hey @jamie can you look?"
        );
    }

    #[test]
    fn test_user_mention_unresolved_keeps_id() {
        assert_eq!(clean("ping <@U999>", &HashMap::new()), "ping @U999");
    }

    #[test]
    fn test_channel_mention() {
        assert_eq!(
            clean("see <#C42|engineering> for details", &HashMap::new()),
            "see #engineering for details"
        );
    }

    #[test]
    fn test_special_mentions() {
        assert_eq!(
            clean("<!here> deploy done, <!channel>", &HashMap::new()),
            "@here deploy done, @channel"
        );
    }

    #[test]
    fn test_link_with_label() {
        assert_eq!(
            clean("docs at <https://example.com/docs|the docs>", &HashMap::new()),
            "docs at the docs"
        );
    }

    #[test]
    fn test_bare_link_unwrapped() {
        assert_eq!(
            clean("see <https://example.com>", &HashMap::new()),
            "see https://example.com"
        );
    }

    #[test]
    fn test_whitespace_collapsed_and_controls_stripped() {
        assert_eq!(
            clean("a\u{0007}  b\n\n\tc  ", &HashMap::new()),
            "a b c"
        );
    }

    #[test]
    fn test_unterminated_bracket_kept() {
        assert_eq!(clean("1 < 2", &HashMap::new()), "1 < 2");
    }

    #[test]
    fn test_mention_ids_deduplicated_in_order() {
        let ids = mention_ids("<@U2> then <@U1> then <@U2> again");
        assert_eq!(ids, vec!["U2".to_string(), "U1".to_string()]);
    }

    #[test]
    fn test_empty_after_clean() {
        assert_eq!(clean("  \n\t ", &HashMap::new()), "");
    }
}
