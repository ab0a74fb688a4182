//! Tag store model
//!
//! Tags are named string properties of an object. On disk a tag
//! `foo.bar.qux` is the file `<object>/foo/bar/#qux`; in memory an
//! object's tags are a plain ordered map. The helpers here translate
//! between the two and implement the pattern matching used for rule
//! inputs (`prefix.*`) and the `has` builtin (glob on the final
//! component).

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Tag map of one object: tag name -> value.
pub type TagMap = BTreeMap<String, String>;

/// Relative filesystem path of a tag under its object root.
/// `foo.bar.qux` -> `foo/bar/#qux`, `baz` -> `#baz`.
pub fn tag_rel_path(name: &str) -> PathBuf {
    let mut path = PathBuf::new();
    let mut segments = name.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("#{}", segment));
        }
    }
    path
}

/// Does an input pattern match a tag name?
/// Patterns are exact, or end in `.*` meaning "every tag under this
/// prefix" (any depth).
pub fn pattern_matches(pattern: &str, tag: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => {
            tag.len() > prefix.len() + 1
                && tag.as_bytes()[prefix.len()] == b'.'
                && tag.starts_with(prefix)
        }
        None => pattern == tag,
    }
}

/// All tags in `context` matched by an input pattern, in name order.
pub fn matching_tags<'a>(context: &'a TagMap, pattern: &str) -> Vec<(&'a str, &'a str)> {
    context
        .iter()
        .filter(|(name, _)| pattern_matches(pattern, name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

/// Existence check for the `has` builtin: the final dotted component of
/// the pattern is a glob (`*`, `?`), the preceding components are exact.
pub fn has_match(context: &TagMap, pattern: &str) -> bool {
    let (pat_prefix, pat_leaf) = split_leaf(pattern);
    context.keys().any(|tag| {
        let (prefix, leaf) = split_leaf(tag);
        prefix == pat_prefix && glob_match(pat_leaf, leaf)
    })
}

fn split_leaf(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    }
}

/// Minimal `*`/`?` glob over one path-free component.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    glob_match_at(&pat, &txt)
}

fn glob_match_at(pat: &[char], txt: &[char]) -> bool {
    match pat.first() {
        None => txt.is_empty(),
        Some('*') => {
            (0..=txt.len()).any(|skip| glob_match_at(&pat[1..], &txt[skip..]))
        }
        Some('?') => !txt.is_empty() && glob_match_at(&pat[1..], &txt[1..]),
        Some(c) => txt.first() == Some(c) && glob_match_at(&pat[1..], &txt[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rel_path_nesting() {
        assert_eq!(tag_rel_path("baz"), PathBuf::from("#baz"));
        assert_eq!(tag_rel_path("foo.bar"), PathBuf::from("foo/#bar"));
        assert_eq!(tag_rel_path("foo.bar.qux"), PathBuf::from("foo/bar/#qux"));
    }

    #[test]
    fn exact_pattern() {
        assert!(pattern_matches("foo.bar", "foo.bar"));
        assert!(!pattern_matches("foo.bar", "foo.barx"));
        assert!(!pattern_matches("foo.bar", "foo"));
    }

    #[test]
    fn glob_pattern_matches_under_prefix() {
        assert!(pattern_matches("foo.*", "foo.bar"));
        assert!(pattern_matches("foo.*", "foo.bar.qux"));
        assert!(!pattern_matches("foo.*", "foo"));
        assert!(!pattern_matches("foo.*", "foobar.qux"));
    }

    #[test]
    fn matching_tags_sorted() {
        let ctx = map(&[("a.x", "1"), ("a.y", "2"), ("b", "3")]);
        let hits = matching_tags(&ctx, "a.*");
        assert_eq!(hits, vec![("a.x", "1"), ("a.y", "2")]);
        assert!(matching_tags(&ctx, "c.*").is_empty());
    }

    #[test]
    fn has_globs_final_component_only() {
        let ctx = map(&[("colors.red", "1"), ("colors.deep.blue", "2"), ("count", "3")]);
        assert!(has_match(&ctx, "colors.r*"));
        assert!(has_match(&ctx, "colors.red"));
        assert!(has_match(&ctx, "c*"));
        assert!(!has_match(&ctx, "colors.b*"));
        assert!(has_match(&ctx, "colors.deep.b???"));
        assert!(!has_match(&ctx, "colors.deep.b??"));
    }
}
