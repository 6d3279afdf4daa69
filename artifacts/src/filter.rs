use regex::Regex;

#[derive(thiserror::Error, Debug)]
pub enum FilterRuleError {
    #[error("filter name '{0}' must be non-empty and only use letters, digits, '_' or '-'")]
    InvalidName(String),
    #[error("filter '{name}' has an invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// A named pattern used to pick a subset of folded stacks for a focused flame graph.
///
/// A folded stack line is selected when the pattern matches anywhere in its frames. The trailing
/// sample count is not matched against. Matching is case sensitive unless the pattern says
/// otherwise, e.g. with `(?i)`.
#[derive(Debug, Clone)]
pub struct FilterRule {
    name: String,
    pattern: Regex,
}

impl FilterRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, FilterRuleError> {
        let name = name.into();
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(FilterRuleError::InvalidName(name));
        }

        let pattern = Regex::new(pattern)
            .map_err(|source| FilterRuleError::InvalidPattern {
                name: name.clone(),
                source,
            })?;

        Ok(Self { name, pattern })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Whether the pattern matches the stack of a folded line.
    pub fn matches(&self, line: &str) -> bool {
        let stack = line.rsplit_once(' ').map_or(line, |(stack, _)| stack);
        self.pattern.is_match(stack)
    }

    /// The matching lines of a folded stack file, in the order they appear.
    pub fn select<'a>(&self, folded: &'a str) -> Vec<&'a str> {
        folded
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter(|line| self.matches(line))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOLDED: &str = "\
main;accept_loop;accept 12
main;handle;recv 40
main;handle;compute;fibonacci 300
main;handle;send 7
";

    #[test]
    fn selects_matching_lines_in_order() {
        let network = FilterRule::new("network", "socket|recv|send|accept").unwrap();
        assert_eq!(
            network.select(FOLDED),
            vec![
                "main;accept_loop;accept 12",
                "main;handle;recv 40",
                "main;handle;send 7",
            ]
        );
    }

    #[test]
    fn matching_is_case_sensitive_by_default() {
        let upper = FilterRule::new("upper", "FIBONACCI").unwrap();
        assert!(upper.select(FOLDED).is_empty());

        let insensitive = FilterRule::new("insensitive", "(?i)FIBONACCI").unwrap();
        assert_eq!(insensitive.select(FOLDED).len(), 1);
    }

    #[test]
    fn sample_counts_are_not_matched() {
        let digits = FilterRule::new("digits", r"\d").unwrap();
        assert!(digits.select(FOLDED).is_empty());

        let seven = FilterRule::new("seven", "7").unwrap();
        assert!(!seven.matches("main;handle;send 7"));
        assert!(seven.matches("main;worker_7;send 1"));
    }

    #[test]
    fn rejects_names_unfit_for_file_names() {
        assert!(matches!(
            FilterRule::new("", "x"),
            Err(FilterRuleError::InvalidName(_))
        ));
        assert!(matches!(
            FilterRule::new("net/work", "x"),
            Err(FilterRuleError::InvalidName(_))
        ));
        assert!(FilterRule::new("net-work_2", "x").is_ok());
    }

    #[test]
    fn rejects_invalid_patterns() {
        let err = FilterRule::new("broken", "(unclosed").unwrap_err();
        assert!(err.to_string().starts_with("filter 'broken' has an invalid pattern"));
    }
}
