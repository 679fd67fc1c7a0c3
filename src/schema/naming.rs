//! Deterministic mapping between node type names and backing-store names.
//!
//! A type `WidgetPart` lives in table `widget_parts` with primary key
//! `_widget_parts_id`; a reference stream `owner` to type `Owner` is stored in
//! column `owners_id_owner`. Table names must map back to the exact type name.

use crate::error::{NodeError, NodeResult};
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Whether `name` can be spliced into SQL as an identifier.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Reject anything that is not a plain identifier.
pub fn check_identifier(name: &str) -> NodeResult<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(NodeError::Integrity(format!("'{}' is not a valid identifier", name)))
    }
}

/// Double-quote an identifier for SQL text.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `WidgetPart` -> `widget_part`
pub fn underscore(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// `widget_part` -> `WidgetPart`
pub fn camelize(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn pluralize(word: &str) -> String {
    let bytes = word.as_bytes();
    let last = bytes.last().copied().unwrap_or(b' ');
    let before_last = if bytes.len() > 1 { bytes[bytes.len() - 2] } else { b' ' };
    if last == b'y' && !b"aeiou".contains(&before_last) {
        format!("{}ies", &word[..word.len() - 1])
    } else if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}

pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{}y", stem);
    }
    for suffix in ["sses", "xes", "zes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') => stem.to_string(),
        _ => word.to_string(),
    }
}

/// Table name for a type; fails when the name would not round-trip.
pub fn table_name(type_name: &str) -> NodeResult<String> {
    check_identifier(type_name)?;
    let snake = underscore(type_name);
    let (head, tail) = match snake.rfind('_') {
        Some(pos) => (&snake[..=pos], &snake[pos + 1..]),
        None => ("", snake.as_str()),
    };
    let table = format!("{}{}", head, pluralize(tail));
    let back = type_name_for(&table);
    if back != type_name {
        return Err(NodeError::Integrity(format!(
            "type name '{}' maps to table '{}' which reverses to '{}'",
            type_name, table, back
        )));
    }
    Ok(table)
}

/// Type name a table was derived from.
pub fn type_name_for(table: &str) -> String {
    let (head, tail) = match table.rfind('_') {
        Some(pos) => (&table[..=pos], &table[pos + 1..]),
        None => ("", table),
    };
    camelize(&format!("{}{}", head, singularize(tail)))
}

pub fn primary_key_column(table: &str) -> String {
    format!("_{}_id", table)
}

/// Column holding a reference stream: `<referenced pk without leading underscore>_<stream>`.
pub fn reference_column(referenced_table: &str, stream: &str) -> String {
    format!(
        "{}_{}",
        primary_key_column(referenced_table).trim_start_matches('_'),
        stream
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        assert_eq!(table_name("Widget").unwrap(), "widgets");
        assert_eq!(table_name("WidgetPart").unwrap(), "widget_parts");
        assert_eq!(table_name("Category").unwrap(), "categories");
        assert_eq!(table_name("Box").unwrap(), "boxes");
        assert_eq!(type_name_for("widget_parts"), "WidgetPart");
    }

    #[test]
    fn unreversible_names_are_integrity_errors() {
        assert!(matches!(table_name("Bus"), Err(NodeError::Integrity(_))));
        assert!(matches!(table_name("HTTPRoute"), Err(NodeError::Integrity(_))));
        assert!(matches!(table_name("bad name"), Err(NodeError::Integrity(_))));
    }

    #[test]
    fn column_names() {
        assert_eq!(primary_key_column("owners"), "_owners_id");
        assert_eq!(reference_column("owners", "owner"), "owners_id_owner");
    }

    #[test]
    fn underscore_handles_acronyms() {
        assert_eq!(underscore("HTTPRoute"), "http_route");
        assert_eq!(underscore("Owner2Pet"), "owner2_pet");
    }
}
