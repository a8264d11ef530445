//! 通配符匹配，用于字段脱敏与指标禁用名单。
//!
//! 模式语法：`*` 匹配任意长度字符序列；默认大小写不敏感，以 `(?-i)` 开头的模式大小写敏感。

use std::fmt;

const CASE_SENSITIVE_PREFIX: &str = "(?-i)";

/// 单个通配符模式。
#[derive(Clone, PartialEq, Eq)]
pub struct Matcher {
    pattern: String,
    segments: Vec<String>,
    leading_star: bool,
    trailing_star: bool,
    case_sensitive: bool,
}

impl Matcher {
    /// 解析模式字符串；任何输入都是合法模式。
    pub fn parse(pattern: &str) -> Self {
        let trimmed = pattern.trim();
        let (body, case_sensitive) = match trimmed.strip_prefix(CASE_SENSITIVE_PREFIX) {
            Some(rest) => (rest, true),
            None => (trimmed, false),
        };
        let normalized = if case_sensitive {
            body.to_owned()
        } else {
            body.to_lowercase()
        };
        let segments = normalized
            .split('*')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect();
        Self {
            pattern: trimmed.to_owned(),
            segments,
            leading_star: body.starts_with('*'),
            trailing_star: body.ends_with('*'),
            case_sensitive,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, name: &str) -> bool {
        let lowered;
        let name = if self.case_sensitive {
            name
        } else {
            lowered = name.to_lowercase();
            lowered.as_str()
        };

        if self.segments.is_empty() {
            // 空模式仅匹配空串；纯 `*` 匹配一切。
            return self.leading_star || name.is_empty();
        }

        let mut rest = name;
        let last = self.segments.len() - 1;
        for (index, segment) in self.segments.iter().enumerate() {
            if index == 0 && !self.leading_star {
                match rest.strip_prefix(segment.as_str()) {
                    Some(tail) => rest = tail,
                    None => return false,
                }
                if index == last && !self.trailing_star {
                    return rest.is_empty();
                }
                continue;
            }
            if index == last && !self.trailing_star {
                return rest.ends_with(segment.as_str());
            }
            match rest.find(segment.as_str()) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
        true
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Matcher").field(&self.pattern).finish()
    }
}

/// 模式集合，任一命中即视为匹配。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Matchers(Vec<Matcher>);

impl Matchers {
    pub fn parse<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            patterns
                .into_iter()
                .map(|pattern| Matcher::parse(pattern.as_ref()))
                .collect(),
        )
    }

    pub fn matches_any(&self, name: &str) -> bool {
        self.0.iter().any(|matcher| matcher.matches(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_are_case_insensitive_by_default() {
        let matcher = Matcher::parse("Password");
        assert!(matcher.matches("password"));
        assert!(matcher.matches("PASSWORD"));
        assert!(!matcher.matches("password2"));
    }

    #[test]
    fn stars_match_prefixes_suffixes_and_infixes() {
        assert!(Matcher::parse("*key").matches("api_key"));
        assert!(!Matcher::parse("*key").matches("keyring"));
        assert!(Matcher::parse("*token*").matches("x-auth-token-v2"));
        assert!(Matcher::parse("sess*id").matches("session_id"));
        assert!(!Matcher::parse("sess*id").matches("session_idx"));
        assert!(Matcher::parse("*").matches(""));
        assert!(Matcher::parse("a*b*c").matches("a-b-b-c"));
        assert!(!Matcher::parse("a*b*c").matches("a-c-b"));
    }

    #[test]
    fn explicit_case_sensitivity_prefix() {
        let matcher = Matcher::parse("(?-i)Secret*");
        assert!(matcher.matches("SecretValue"));
        assert!(!matcher.matches("secretvalue"));
    }

    #[test]
    fn matcher_set_matches_any() {
        let matchers = Matchers::parse(["password", "*card*"]);
        assert!(matchers.matches_any("Credit-Card-Number"));
        assert!(!matchers.matches_any("username"));
        assert!(!Matchers::default().matches_any("anything"));
    }
}
