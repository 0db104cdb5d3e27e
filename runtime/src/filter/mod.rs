use super::*;
use thiserror::Error;

mod parse;


pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// An LDAP-style property predicate.
///
/// Filters select property maps: `(key=value)` comparisons composed with
/// `(&...)`, `(|...)` and `(!...)`. A missing key makes a comparison false;
/// `(key=*)` tests for presence; list-valued properties match if any element
/// matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Test(Comparison),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub key: Box<str>,
    pub op: Operator,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    LessEq,
    GreaterEq,
    Approx,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Box<str>),
    /// `key=*`: the key exists, whatever its value.
    Present,
    /// Wildcard chain: the segments between `*`s, in order. The first
    /// segment anchors the start of the text and the last anchors the end;
    /// empty segments come from leading/trailing `*`s.
    Substring(Box<[Box<str>]>),
}

impl Filter {
    pub fn eq(key: &str, value: &str) -> Filter {
        Filter::Test(Comparison {
            key: key.into(),
            op: Operator::Equal,
            pattern: Pattern::Literal(value.into()),
        })
    }

    pub fn present(key: &str) -> Filter {
        Filter::Test(Comparison {
            key: key.into(),
            op: Operator::Equal,
            pattern: Pattern::Present,
        })
    }

    /// Conjunction of a set of filters, flattening the trivial cases.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Option<Filter> {
        let mut filters = filters.into_iter().collect::<Vec<_>>();
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::And(filters)),
        }
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(properties)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(properties)),
            Filter::Not(filter) => !filter.matches(properties),
            Filter::Test(comparison) => comparison.matches(properties),
        }
    }
}

/// Escapes a literal so it parses back as itself inside a filter.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Comparison {
    fn matches(&self, properties: &Properties) -> bool {
        let Some(value) = properties.get(&*self.key) else {
            return false;
        };
        self.matches_value(value)
    }

    fn matches_value(&self, value: &Value) -> bool {
        if let Value::List(items) = value {
            return items.iter().any(|item| self.matches_value(item));
        }

        match (self.op, &self.pattern) {
            (_, Pattern::Present) => true,
            (Operator::Equal, Pattern::Literal(literal)) => match value {
                Value::Str(s) => &**s == &**literal,
                Value::Int(i) => literal.trim().parse::<i64>() == Ok(*i),
                Value::Float(x) => literal.trim().parse::<f64>().is_ok_and(|l| l == *x),
                Value::Bool(b) => literal.trim().parse::<bool>() == Ok(*b),
                // Lists are unwrapped above
                Value::List(_) => false,
            },
            (Operator::Equal, Pattern::Substring(parts)) => {
                substring_match(parts, &value.to_string())
            }
            (Operator::LessEq, Pattern::Literal(literal)) => ordering(value, literal)
                .is_some_and(|o| o != std::cmp::Ordering::Greater),
            (Operator::GreaterEq, Pattern::Literal(literal)) => {
                ordering(value, literal).is_some_and(|o| o != std::cmp::Ordering::Less)
            }
            (Operator::Approx, Pattern::Literal(literal)) => {
                normalize(&value.to_string()).contains(&normalize(literal))
            }
            // The parser never emits a wildcard behind an ordering operator
            (_, Pattern::Substring(_)) => false,
        }
    }
}

fn ordering(value: &Value, literal: &str) -> Option<std::cmp::Ordering> {
    match value {
        Value::Int(i) => literal.trim().parse::<i64>().ok().map(|l| i.cmp(&l)),
        Value::Float(x) => literal
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|l| x.partial_cmp(&l)),
        Value::Str(s) => Some((**s).cmp(literal)),
        Value::Bool(_) | Value::List(_) => None,
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_match(parts: &[Box<str>], text: &str) -> bool {
    let last = parts.len() - 1;
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(&**part) else {
                return false;
            };
            rest = stripped;
        } else if i == last {
            return part.is_empty() || rest.ends_with(&**part);
        } else {
            let Some(pos) = rest.find(&**part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    true
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Filter::Not(filter) => write!(f, "(!{filter})"),
            Filter::Test(c) => write!(f, "({}{}{})", c.key, c.op, c.pattern),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Operator::Equal => "=",
            Operator::LessEq => "<=",
            Operator::GreaterEq => ">=",
            Operator::Approx => "~=",
        })
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Literal(s) => f.write_str(&escape(s)),
            Pattern::Present => f.write_str("*"),
            Pattern::Substring(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str("*")?;
                    }
                    f.write_str(&escape(part))?;
                }
                Ok(())
            }
        }
    }
}
