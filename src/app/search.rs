use std::cmp::Ordering;

use pinyin::ToPinyin;

/// Case-insensitive substring match of `query` against any of `fields`, or
/// against the pinyin spelling of the first field. An empty query matches.
pub fn matches_query(query: &str, fields: &[&str]) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return true;
    }
    if fields.iter().any(|field| field.to_lowercase().contains(&query)) {
        return true;
    }
    fields
        .first()
        .map(|primary| to_pinyin_string(primary).contains(&query))
        .unwrap_or(false)
}

/// Lowercase pinyin for Han characters, every other character kept as-is (lowercased).
pub fn to_pinyin_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch.to_pinyin() {
            Some(pinyin) => out.push_str(pinyin.plain()),
            None => out.extend(ch.to_lowercase()),
        }
    }
    out
}

/// Display-name ordering: case-folded first, raw text as the tie-break.
pub fn collate(left: &str, right: &str) -> Ordering {
    left.to_lowercase()
        .cmp(&right.to_lowercase())
        .then_with(|| left.cmp(right))
}
