//! Search filters in their RFC 4515 string form.
//!
//! Filters are parsed once and then evaluated locally against [`Entry`]
//! values. Matching is case-insensitive; ordering comparisons are numeric
//! when both operands are integers.

use crate::entry::Entry;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// A filter string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter '{filter}': {reason}")]
pub struct InvalidFilter {
    /// The offending input.
    pub filter: String,
    /// Why it was rejected.
    pub reason: String,
}

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// All sub-filters match.
    And(Vec<Filter>),
    /// Any sub-filter matches.
    Or(Vec<Filter>),
    /// The sub-filter does not match.
    Not(Box<Filter>),
    /// `(attr=value)`
    Equality {
        /// Attribute name, lowercased.
        attr: String,
        /// Asserted value.
        value: String,
    },
    /// `(attr=*)`
    Present {
        /// Attribute name, lowercased.
        attr: String,
    },
    /// `(attr=ini*any*fin)`
    Substring {
        /// Attribute name, lowercased.
        attr: String,
        /// Leading fragment.
        initial: Option<String>,
        /// Middle fragments, in order.
        any: Vec<String>,
        /// Trailing fragment.
        last: Option<String>,
    },
    /// `(attr>=value)`
    GreaterOrEqual {
        /// Attribute name, lowercased.
        attr: String,
        /// Asserted value.
        value: String,
    },
    /// `(attr<=value)`
    LessOrEqual {
        /// Attribute name, lowercased.
        attr: String,
        /// Asserted value.
        value: String,
    },
    /// `(attr~=value)`, evaluated as equality.
    Approx {
        /// Attribute name, lowercased.
        attr: String,
        /// Asserted value.
        value: String,
    },
}

impl Filter {
    /// The match-everything filter `(objectclass=*)`.
    pub fn match_all() -> Self {
        Filter::Present {
            attr: "objectclass".to_string(),
        }
    }

    /// Parse a filter string. A bare `attr=value` without parentheses is
    /// accepted.
    pub fn parse(input: &str) -> Result<Self, InvalidFilter> {
        let trimmed = input.trim();
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({})", trimmed);
            owned.as_str()
        };
        let mut parser = Parser {
            input: text,
            chars: text.chars().collect(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    /// Evaluate the filter against an entry.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Equality { attr, value } | Filter::Approx { attr, value } => {
                entry.get(attr).iter().any(|v| eq_ignore_case(v, value))
            }
            Filter::Present { attr } => entry.has(attr),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => entry
                .get(attr)
                .iter()
                .any(|v| substring_match(v, initial.as_deref(), any, last.as_deref())),
            Filter::GreaterOrEqual { attr, value } => entry
                .get(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Less),
            Filter::LessOrEqual { attr, value } => entry
                .get(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Greater),
        }
    }

    /// Evaluate only the predicates on `attr`; every other predicate is
    /// unknown. Returns `None` when the outcome depends on unknown terms.
    pub fn evaluate_on(&self, entry: &Entry, attr: &str) -> Option<bool> {
        match self {
            Filter::And(filters) => {
                let mut unknown = false;
                for f in filters {
                    match f.evaluate_on(entry, attr) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Filter::Or(filters) => {
                let mut unknown = false;
                for f in filters {
                    match f.evaluate_on(entry, attr) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Filter::Not(inner) => inner.evaluate_on(entry, attr).map(|b| !b),
            other => {
                if other.attribute().is_some_and(|a| a.eq_ignore_ascii_case(attr)) {
                    Some(other.matches(entry))
                } else {
                    None
                }
            }
        }
    }

    /// Fast pre-check: do the entry's object classes permit a match?
    /// Unknown outcomes pass.
    pub fn object_classes_permit(&self, entry: &Entry) -> bool {
        self.evaluate_on(entry, "objectclass").unwrap_or(true)
    }

    fn attribute(&self) -> Option<&str> {
        match self {
            Filter::Equality { attr, .. }
            | Filter::Present { attr }
            | Filter::Substring { attr, .. }
            | Filter::GreaterOrEqual { attr, .. }
            | Filter::LessOrEqual { attr, .. }
            | Filter::Approx { attr, .. } => Some(attr),
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => None,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) => {
                f.write_str("(&")?;
                for inner in filters {
                    write!(f, "{}", inner)?;
                }
                f.write_str(")")
            }
            Filter::Or(filters) => {
                f.write_str("(|")?;
                for inner in filters {
                    write!(f, "{}", inner)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality { attr, value } => write!(f, "({}={})", attr, escape(value)),
            Filter::Present { attr } => write!(f, "({}=*)", attr),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape(last))?;
                }
                f.write_str(")")
            }
            Filter::GreaterOrEqual { attr, value } => write!(f, "({}>={})", attr, escape(value)),
            Filter::LessOrEqual { attr, value } => write!(f, "({}<={})", attr, escape(value)),
            Filter::Approx { attr, value } => write!(f, "({}~={})", attr, escape(value)),
        }
    }
}

/// Escape a value for inclusion in a filter string.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn compare_values(actual: &str, asserted: &str) -> Ordering {
    match (actual.trim().parse::<i64>(), asserted.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => actual.to_lowercase().cmp(&asserted.to_lowercase()),
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let value = value.to_lowercase();
    let mut rest: &str = &value;
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> InvalidFilter {
        InvalidFilter {
            filter: self.input.to_string(),
            reason: format!("{} at offset {}", reason, self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<(), InvalidFilter> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c)))
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, InvalidFilter> {
        self.expect('(')?;
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end")),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, InvalidFilter> {
        let mut filters = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            filters.push(self.parse_filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter, InvalidFilter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';' || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        if attr.is_empty() {
            return Err(self.error("missing attribute name"));
        }
        let attr = attr.to_ascii_lowercase();

        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some('='), _) => {
                self.pos += 1;
                '='
            }
            (Some(c @ ('>' | '<' | '~')), Some('=')) => {
                self.pos += 2;
                c
            }
            _ => return Err(self.error("expected comparison operator")),
        };

        // Raw value up to the closing paren; '*' is significant only unescaped.
        let mut parts: Vec<String> = vec![String::new()];
        while let Some(c) = self.peek() {
            match c {
                ')' => break,
                '(' => return Err(self.error("unescaped '(' in value")),
                '*' => {
                    self.pos += 1;
                    parts.push(String::new());
                }
                '\\' => {
                    let hex: String = self.chars.iter().skip(self.pos + 1).take(2).collect();
                    let byte = u8::from_str_radix(&hex, 16)
                        .map_err(|_| self.error("bad escape sequence"))?;
                    self.pos += 3;
                    if let Some(last) = parts.last_mut() {
                        last.push(byte as char);
                    }
                }
                _ => {
                    self.pos += 1;
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                }
            }
        }

        if parts.len() == 1 {
            let value = parts.pop().unwrap_or_default();
            return Ok(match op {
                '=' => Filter::Equality { attr, value },
                '>' => Filter::GreaterOrEqual { attr, value },
                '<' => Filter::LessOrEqual { attr, value },
                _ => Filter::Approx { attr, value },
            });
        }
        if op != '=' {
            return Err(self.error("wildcard only allowed with '='"));
        }
        if parts.len() == 2 && parts.iter().all(String::is_empty) {
            return Ok(Filter::Present { attr });
        }
        let initial = Some(parts.remove(0)).filter(|s| !s.is_empty());
        let last = parts.pop().filter(|s| !s.is_empty());
        let any = parts.into_iter().filter(|s| !s.is_empty()).collect();
        Ok(Filter::Substring {
            attr,
            initial,
            any,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Entry {
        Entry::new("uid=alice,ou=users,o=smartdc")
            .with_attr("objectclass", ["sdcperson", "top"])
            .with_attr("uid", ["alice"])
            .with_attr("cn", ["Alice Smith"])
            .with_attr("uidnumber", ["1010"])
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_parse_equality() {
            assert_eq!(
                Filter::parse("(UID=alice)").unwrap(),
                Filter::Equality {
                    attr: "uid".to_string(),
                    value: "alice".to_string()
                }
            );
        }

        #[test]
        fn test_parse_without_parens() {
            assert_eq!(
                Filter::parse("objectclass=*").unwrap(),
                Filter::match_all()
            );
        }

        #[test]
        fn test_parse_nested() {
            let f = Filter::parse("(&(objectclass=sdcperson)(|(uid=a*)(!(cn=bob))))").unwrap();
            match f {
                Filter::And(parts) => {
                    assert_eq!(parts.len(), 2);
                    assert!(matches!(parts[1], Filter::Or(_)));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn test_parse_substring_parts() {
            assert_eq!(
                Filter::parse("(cn=al*ce*sm*)").unwrap(),
                Filter::Substring {
                    attr: "cn".to_string(),
                    initial: Some("al".to_string()),
                    any: vec!["ce".to_string(), "sm".to_string()],
                    last: None,
                }
            );
        }

        #[test]
        fn test_parse_escape() {
            assert_eq!(
                Filter::parse("(cn=a\\2ab)").unwrap(),
                Filter::Equality {
                    attr: "cn".to_string(),
                    value: "a*b".to_string()
                }
            );
        }

        #[test]
        fn test_parse_ordering_ops() {
            assert!(matches!(
                Filter::parse("(changenumber>=10)").unwrap(),
                Filter::GreaterOrEqual { .. }
            ));
            assert!(matches!(
                Filter::parse("(changenumber<=10)").unwrap(),
                Filter::LessOrEqual { .. }
            ));
            assert!(matches!(
                Filter::parse("(cn~=alice)").unwrap(),
                Filter::Approx { .. }
            ));
        }

        #[test]
        fn test_parse_errors() {
            assert!(Filter::parse("(uid=a").is_err());
            assert!(Filter::parse("(&)").is_err());
            assert!(Filter::parse("(=a)").is_err());
            assert!(Filter::parse("(uid=a))").is_err());
            assert!(Filter::parse("(uid>=a*)").is_err());
            assert!(Filter::parse("(cn=\\zz)").is_err());
        }

        #[test]
        fn test_display_roundtrips_through_parse() {
            let text = "(&(objectclass=sdcperson)(!(cn=a\\2ab))(uid=al*e)(changenumber>=5))";
            let parsed = Filter::parse(text).unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    mod matching {
        use super::*;

        #[test]
        fn test_equality_case_insensitive() {
            assert!(Filter::parse("(objectclass=SDCPerson)").unwrap().matches(&person()));
            assert!(!Filter::parse("(uid=bob)").unwrap().matches(&person()));
        }

        #[test]
        fn test_presence() {
            assert!(Filter::parse("(cn=*)").unwrap().matches(&person()));
            assert!(!Filter::parse("(mail=*)").unwrap().matches(&person()));
        }

        #[test]
        fn test_substring() {
            let entry = person();
            assert!(Filter::parse("(cn=alice*)").unwrap().matches(&entry));
            assert!(Filter::parse("(cn=*smith)").unwrap().matches(&entry));
            assert!(Filter::parse("(cn=a*e*h)").unwrap().matches(&entry));
            assert!(!Filter::parse("(cn=*bob*)").unwrap().matches(&entry));
        }

        #[test]
        fn test_numeric_ordering() {
            let entry = person();
            assert!(Filter::parse("(uidnumber>=999)").unwrap().matches(&entry));
            assert!(!Filter::parse("(uidnumber<=999)").unwrap().matches(&entry));
            assert!(Filter::parse("(uidnumber<=1010)").unwrap().matches(&entry));
        }

        #[test]
        fn test_boolean_composition() {
            let entry = person();
            assert!(Filter::parse("(&(uid=alice)(!(uid=bob)))").unwrap().matches(&entry));
            assert!(Filter::parse("(|(uid=bob)(uid=alice))").unwrap().matches(&entry));
            assert!(!Filter::parse("(&(uid=alice)(uid=bob))").unwrap().matches(&entry));
        }
    }

    mod object_class_precheck {
        use super::*;

        #[test]
        fn test_unknown_terms_pass() {
            let f = Filter::parse("(&(objectclass=sdcperson)(login=nobody))").unwrap();
            assert_eq!(f.evaluate_on(&person(), "objectclass"), None);
            assert!(f.object_classes_permit(&person()));
        }

        #[test]
        fn test_wrong_class_fails_fast() {
            let f = Filter::parse("(&(objectclass=sdckey)(login=nobody))").unwrap();
            assert_eq!(f.evaluate_on(&person(), "objectclass"), Some(false));
            assert!(!f.object_classes_permit(&person()));
        }

        #[test]
        fn test_or_with_known_true() {
            let f = Filter::parse("(|(login=x)(objectclass=top))").unwrap();
            assert_eq!(f.evaluate_on(&person(), "objectclass"), Some(true));
        }

        #[test]
        fn test_not_of_known() {
            let f = Filter::parse("(!(objectclass=top))").unwrap();
            assert_eq!(f.evaluate_on(&person(), "objectclass"), Some(false));
        }
    }
}
