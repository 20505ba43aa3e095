//! Filter chain applied to a resolved template variable.

use serde_json::Value;

use crate::vars::stringify;

/// A single filter invocation, e.g. `truncate:40` or `default:'N/A'`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    pub arg: Option<String>,
}

impl Filter {
    /// Apply the filter to the current value. Unknown filters are a no-op
    /// (spec: "return the pre-filter value unchanged; do not raise").
    pub fn apply(&self, value: Option<Value>) -> Option<Value> {
        match self.name.as_str() {
            "upper" => value.map(|v| Value::String(stringify(&v).to_uppercase())),
            "lower" => value.map(|v| Value::String(stringify(&v).to_lowercase())),
            "trim" => value.map(|v| Value::String(stringify(&v).trim().to_string())),
            "truncate" => value.map(|v| {
                let s = stringify(&v);
                let n: usize = self.arg.as_deref().and_then(|a| a.parse().ok()).unwrap_or(s.len());
                if s.chars().count() > n {
                    let truncated: String = s.chars().take(n).collect();
                    Value::String(format!("{truncated}..."))
                } else {
                    Value::String(s)
                }
            }),
            "default" => match value {
                Some(Value::Null) | None => {
                    Some(Value::String(self.arg.clone().unwrap_or_default()))
                }
                Some(other) => Some(other),
            },
            _ => value,
        }
    }
}

/// Parse a filter chain segment such as `trim|upper|truncate:5`.
pub fn parse_filter_chain(raw: &str) -> Vec<Filter> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_single_filter)
        .collect()
}

fn parse_single_filter(raw: &str) -> Filter {
    match raw.split_once(':') {
        Some((name, arg)) => Filter {
            name: name.trim().to_string(),
            arg: Some(parse_filter_arg(arg.trim())),
        },
        None => Filter {
            name: raw.trim().to_string(),
            arg: None,
        },
    }
}

/// A filter arg may be a single-quoted literal (`'X'`) or a bare number.
fn parse_filter_arg(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upper_lower_trim() {
        let v = Some(json!("  Hello  "));
        assert_eq!(
            Filter {
                name: "trim".into(),
                arg: None
            }
            .apply(v.clone()),
            Some(json!("Hello"))
        );
        assert_eq!(
            Filter {
                name: "upper".into(),
                arg: None
            }
            .apply(v.clone()),
            Some(json!("  HELLO  "))
        );
        assert_eq!(
            Filter {
                name: "lower".into(),
                arg: None
            }
            .apply(v),
            Some(json!("  hello  "))
        );
    }

    #[test]
    fn truncate_adds_ellipsis_when_over_length() {
        let f = Filter {
            name: "truncate".into(),
            arg: Some("5".into()),
        };
        assert_eq!(f.apply(Some(json!("hello world"))), Some(json!("hello...")));
    }

    #[test]
    fn truncate_leaves_short_strings_alone() {
        let f = Filter {
            name: "truncate".into(),
            arg: Some("50".into()),
        };
        assert_eq!(f.apply(Some(json!("hi"))), Some(json!("hi")));
    }

    #[test]
    fn default_applies_only_to_null_or_missing() {
        let f = Filter {
            name: "default".into(),
            arg: Some("N/A".into()),
        };
        assert_eq!(f.apply(None), Some(json!("N/A")));
        assert_eq!(f.apply(Some(Value::Null)), Some(json!("N/A")));
        assert_eq!(f.apply(Some(json!("present"))), Some(json!("present")));
    }

    #[test]
    fn unknown_filter_is_noop() {
        let f = Filter {
            name: "frobnicate".into(),
            arg: None,
        };
        assert_eq!(f.apply(Some(json!("x"))), Some(json!("x")));
    }

    #[test]
    fn parses_chain_with_args() {
        let chain = parse_filter_chain("trim|upper|truncate:5");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2].name, "truncate");
        assert_eq!(chain[2].arg.as_deref(), Some("5"));
    }

    #[test]
    fn parses_single_quoted_default_arg() {
        let chain = parse_filter_chain("default:'X'");
        assert_eq!(chain[0].arg.as_deref(), Some("X"));
    }

    #[test]
    fn parses_bare_number_default_arg() {
        let chain = parse_filter_chain("default:0");
        assert_eq!(chain[0].arg.as_deref(), Some("0"));
    }
}
