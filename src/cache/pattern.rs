use regex::Regex;
use std::fmt;

/// Glob matcher for cache keys
///
/// `*` matches any run of characters (including none), `?` exactly one.
/// Everything else is literal.
#[derive(Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Option<Regex>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Self {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' | '?' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();
                    source.push_str(if ch == '*' { ".*" } else { "." });
                }
                _ => literal.push(ch),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        // Only pathological sizes fail to compile; those degrade to an
        // exact comparison.
        let regex = Regex::new(&source).ok();
        Self {
            raw: pattern.to_string(),
            regex,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => self.raw == key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GlobPattern").field(&self.raw).finish()
    }
}
