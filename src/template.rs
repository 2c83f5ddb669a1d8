use std::collections::BTreeMap;

use crate::error::ServerError;

/// A parsed resource URI template like `users://{user_id}/profile`.
///
/// Templates alternate literal runs and `{variable}` placeholders. A variable
/// matches one non-empty path segment (it never crosses `/`). Matching is
/// anchored at both ends: the whole URI must be consumed.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Variable(String),
}

impl UriTemplate {
    /// Parse a template string. Fails with `Configuration` on unbalanced
    /// braces, empty variable names, or adjacent variables (ambiguous).
    pub fn parse(raw: &str) -> Result<Self, ServerError> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while !rest.is_empty() {
            match rest.find('{') {
                None => {
                    if rest.contains('}') {
                        return Err(ServerError::Configuration(format!(
                            "unbalanced '}}' in URI template '{raw}'"
                        )));
                    }
                    segments.push(Segment::Literal(rest.to_string()));
                    rest = "";
                }
                Some(open) => {
                    if open > 0 {
                        segments.push(Segment::Literal(rest[..open].to_string()));
                    }
                    let after = &rest[open + 1..];
                    let close = after.find('}').ok_or_else(|| {
                        ServerError::Configuration(format!(
                            "unclosed '{{' in URI template '{raw}'"
                        ))
                    })?;
                    let name = &after[..close];
                    if name.is_empty() {
                        return Err(ServerError::Configuration(format!(
                            "empty variable name in URI template '{raw}'"
                        )));
                    }
                    if name.contains('{') {
                        return Err(ServerError::Configuration(format!(
                            "nested '{{' in URI template '{raw}'"
                        )));
                    }
                    if matches!(segments.last(), Some(Segment::Variable(_))) {
                        return Err(ServerError::Configuration(format!(
                            "adjacent variables in URI template '{raw}' are ambiguous"
                        )));
                    }
                    segments.push(Segment::Variable(name.to_string()));
                    rest = &after[close + 1..];
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original template string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Variable names, in template order.
    pub fn variables(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Test a concrete URI against this template, binding path variables on
    /// success. Returns `None` when the URI does not match.
    pub fn matches(&self, uri: &str) -> Option<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        let mut rest = uri;
        let mut segments = self.segments.iter().peekable();

        while let Some(segment) = segments.next() {
            match segment {
                Segment::Literal(lit) => {
                    rest = rest.strip_prefix(lit.as_str())?;
                }
                Segment::Variable(name) => {
                    let value = match segments.peek() {
                        // A variable is always delimited by the next literal.
                        Some(Segment::Literal(lit)) => {
                            let end = rest.find(lit.as_str())?;
                            let (value, tail) = rest.split_at(end);
                            rest = tail;
                            value
                        }
                        Some(Segment::Variable(_)) => return None,
                        None => {
                            let value = rest;
                            rest = "";
                            value
                        }
                    };
                    if value.is_empty() || value.contains('/') {
                        return None;
                    }
                    vars.insert(name.clone(), value.to_string());
                }
            }
        }

        if rest.is_empty() {
            Some(vars)
        } else {
            None
        }
    }
}
