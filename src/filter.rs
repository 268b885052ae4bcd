use crate::error::FilterError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

const CASE_INSENSITIVE_FLAG: &str = "(?i)";

/// On-disk layout of the rules file.
///
/// ```yaml
/// filter_rules:
///   - name: block-dating-spam
///     match: all
///     conditions:
///       - field: from
///         pattern: '@ecinetworks\.com$'
///       - field: subject
///         pattern: 'get(ting)? to know'
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub filter_rules: Vec<FilterRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    #[serde(rename = "match", default = "default_match")]
    pub match_mode: String,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub pattern: String,
}

fn default_match() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    From,
    To,
    Subject,
    Body,
    Html,
    BodyOrHtml,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "from" => Some(Field::From),
            "to" => Some(Field::To),
            "subject" => Some(Field::Subject),
            "body" => Some(Field::Body),
            "html" => Some(Field::Html),
            "body_or_html" => Some(Field::BodyOrHtml),
            _ => None,
        }
    }
}

/// The message fields a rule can look at.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterInput<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub html: &'a str,
}

#[derive(Debug)]
struct CompiledCondition {
    field: Field,
    regex: Regex,
}

impl CompiledCondition {
    fn matches(&self, input: &FilterInput) -> bool {
        match self.field {
            Field::From => self.regex.is_match(input.from),
            Field::To => self.regex.is_match(input.to),
            Field::Subject => self.regex.is_match(input.subject),
            Field::Body => self.regex.is_match(input.body),
            Field::Html => self.regex.is_match(input.html),
            Field::BodyOrHtml => {
                self.regex.is_match(input.body) || self.regex.is_match(input.html)
            }
        }
    }
}

#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    pub mode: MatchMode,
    conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Result<Self, FilterError> {
        let mode = match rule.match_mode.as_str() {
            "all" => MatchMode::All,
            "any" => MatchMode::Any,
            other => {
                return Err(FilterError::InvalidMatchType {
                    rule: rule.name.clone(),
                    value: other.to_string(),
                })
            }
        };

        let mut conditions = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let field = Field::parse(&condition.field).ok_or_else(|| FilterError::InvalidField {
                rule: rule.name.clone(),
                field: condition.field.clone(),
            })?;
            let regex = compile_case_insensitive(&condition.pattern).map_err(|source| {
                FilterError::InvalidPattern {
                    rule: rule.name.clone(),
                    pattern: condition.pattern.clone(),
                    source,
                }
            })?;
            conditions.push(CompiledCondition { field, regex });
        }

        Ok(CompiledRule {
            name: rule.name.clone(),
            mode,
            conditions,
        })
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    /// A rule without conditions never matches.
    pub fn matches(&self, input: &FilterInput) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.mode {
            MatchMode::All => self.conditions.iter().all(|c| c.matches(input)),
            MatchMode::Any => self.conditions.iter().any(|c| c.matches(input)),
        }
    }
}

fn compile_case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.starts_with(CASE_INSENSITIVE_FLAG) {
        Regex::new(pattern)
    } else {
        Regex::new(&format!("{CASE_INSENSITIVE_FLAG}{pattern}"))
    }
}

/// An immutable, fully compiled list of rules in load order.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[FilterRule]) -> Result<Self, FilterError> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSet { rules })
    }

    pub fn from_yaml(content: &str, path: &str) -> Result<Self, FilterError> {
        let file: RulesFile = serde_yaml::from_str(content).map_err(|source| FilterError::Parse {
            path: path.to_string(),
            source,
        })?;
        Self::compile(&file.filter_rules)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FilterError> {
        let path_str = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(&path).map_err(|source| FilterError::Read {
            path: path_str.clone(),
            source,
        })?;
        Self::from_yaml(&content, &path_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Name of the first rule matching `input`, if any.
    pub fn evaluate(&self, input: &FilterInput) -> Option<&str> {
        for rule in &self.rules {
            if rule.matches(input) {
                log::debug!("Rule '{}' matched", rule.name);
                return Some(rule.name.as_str());
            }
        }
        None
    }
}

/// Holds the active rule set and swaps it wholesale on reload.
///
/// Evaluation works on an `Arc` snapshot, so an in-flight message never sees
/// a half-replaced set.
#[derive(Debug, Default)]
pub struct FilterEngine {
    active: RwLock<Arc<RuleSet>>,
}

impl FilterEngine {
    pub fn new(rules: RuleSet) -> Self {
        FilterEngine {
            active: RwLock::new(Arc::new(rules)),
        }
    }

    /// Load rules from `path`. No path means an empty rule set.
    pub fn load(path: Option<&Path>) -> Result<Self, FilterError> {
        match path {
            Some(path) => {
                let rules = RuleSet::from_file(path)?;
                log::info!("Loaded {} filter rules from {}", rules.len(), path.display());
                Ok(Self::new(rules))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, rules: RuleSet) {
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = Arc::new(rules);
    }

    /// Compile `path` and activate it. On error the current rules stay active.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<usize, FilterError> {
        let rules = RuleSet::from_file(path)?;
        let count = rules.len();
        self.replace(rules);
        Ok(count)
    }

    pub fn evaluate(&self, input: &FilterInput) -> Option<String> {
        self.snapshot().evaluate(input).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rules(yaml: &str) -> RuleSet {
        RuleSet::from_yaml(yaml, "test.yaml").unwrap()
    }

    fn input<'a>(
        from: &'a str,
        to: &'a str,
        subject: &'a str,
        body: &'a str,
        html: &'a str,
    ) -> FilterInput<'a> {
        FilterInput {
            from,
            to,
            subject,
            body,
            html,
        }
    }

    #[test]
    fn test_load_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"filter_rules:
  - name: block-spam
    conditions:
      - field: subject
        pattern: 'spam'

  - name: block-domain
    match: all
    conditions:
      - field: from
        pattern: '@spammer\.com$'
"#
        )
        .unwrap();

        let set = RuleSet::from_file(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.rules()[0].name, "block-spam");
        assert_eq!(set.rules()[0].mode, MatchMode::All);
        assert_eq!(set.rules()[1].name, "block-domain");
    }

    #[test]
    fn test_load_without_path_is_empty() {
        let engine = FilterEngine::load(None).unwrap();
        assert!(engine.snapshot().is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuleSet::from_file("/non/existent/file.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_invalid_regex_fails_whole_load() {
        let err = RuleSet::from_yaml(
            r#"filter_rules:
  - name: good
    conditions:
      - field: subject
        pattern: 'fine'
  - name: bad-regex
    conditions:
      - field: subject
        pattern: '[invalid('
"#,
            "test.yaml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid regex pattern"));
    }

    #[test]
    fn test_invalid_field() {
        let err = RuleSet::from_yaml(
            r#"filter_rules:
  - name: bad-field
    conditions:
      - field: subjekt
        pattern: 'test'
"#,
            "test.yaml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid field 'subjekt'"));
    }

    #[test]
    fn test_invalid_match_type() {
        let err = RuleSet::from_yaml(
            r#"filter_rules:
  - name: bad-match
    match: invalid
    conditions:
      - field: subject
        pattern: 'test'
"#,
            "test.yaml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid match type"));
    }

    #[test]
    fn test_match_all() {
        let set = rules(
            r#"filter_rules:
  - name: block-dating-spam
    match: all
    conditions:
      - field: from
        pattern: '@ecinetworks\.com$'
      - field: subject
        pattern: 'get(ting)? to know'
"#,
        );

        let both = input("sender@ecinetworks.com", "to@test.com", "Getting to know you", "body", "");
        assert_eq!(set.evaluate(&both), Some("block-dating-spam"));

        let from_only = input("sender@ecinetworks.com", "to@test.com", "Hello", "body", "");
        assert_eq!(set.evaluate(&from_only), None);

        let subject_only = input("sender@other.com", "to@test.com", "Getting to know you", "body", "");
        assert_eq!(set.evaluate(&subject_only), None);
    }

    #[test]
    fn test_match_any() {
        let set = rules(
            r#"filter_rules:
  - name: block-spam-domains
    match: any
    conditions:
      - field: body
        pattern: 'cdnex\.online'
      - field: body
        pattern: 'spam-tracker\.net'
      - field: body
        pattern: 'click-now\.xyz'
"#,
        );

        for body in ["Visit cdnex.online", "Check spam-tracker.net", "Click click-now.xyz"] {
            let i = input("from@test.com", "to@test.com", "subject", body, "");
            assert_eq!(set.evaluate(&i), Some("block-spam-domains"), "body: {body}");
        }
        let clean = input("from@test.com", "to@test.com", "subject", "Clean body text", "");
        assert_eq!(set.evaluate(&clean), None);
    }

    #[test]
    fn test_each_field() {
        let set = rules(
            r#"filter_rules:
  - name: block-from
    conditions:
      - field: from
        pattern: 'blocked@'
  - name: block-to
    conditions:
      - field: to
        pattern: 'blocked-recipient@'
  - name: block-subject
    conditions:
      - field: subject
        pattern: 'BLOCKED_SUBJECT'
  - name: block-body
    conditions:
      - field: body
        pattern: 'BLOCKED_BODY'
  - name: block-html
    conditions:
      - field: html
        pattern: 'BLOCKED_HTML'
"#,
        );

        let cases = [
            (input("blocked@example.com", "to@test.com", "subject", "body", "html"), Some("block-from")),
            (input("from@test.com", "blocked-recipient@test.com", "subject", "body", "html"), Some("block-to")),
            (input("from@test.com", "to@test.com", "BLOCKED_SUBJECT here", "body", "html"), Some("block-subject")),
            (input("from@test.com", "to@test.com", "subject", "Contains BLOCKED_BODY", "html"), Some("block-body")),
            (input("from@test.com", "to@test.com", "subject", "body", "<p>BLOCKED_HTML</p>"), Some("block-html")),
            (input("good@example.com", "good@test.com", "good subject", "good body", "good html"), None),
        ];
        for (i, expected) in cases {
            assert_eq!(set.evaluate(&i), expected);
        }
    }

    #[test]
    fn test_body_or_html() {
        let set = rules(
            r#"filter_rules:
  - name: block-tracking-url
    conditions:
      - field: body_or_html
        pattern: 'adnxs\.com'
"#,
        );

        let body_only = input("f", "t", "s", "Visit adnxs.com", "");
        assert_eq!(set.evaluate(&body_only), Some("block-tracking-url"));
        let html_only = input("f", "t", "s", "", "<a href='http://adnxs.com'>link</a>");
        assert_eq!(set.evaluate(&html_only), Some("block-tracking-url"));
        let neither = input("f", "t", "s", "clean body", "<p>clean html</p>");
        assert_eq!(set.evaluate(&neither), None);
    }

    #[test]
    fn test_html_only_email() {
        let set = rules(
            r#"filter_rules:
  - name: block-html-url
    conditions:
      - field: html
        pattern: 'https?://[^\s"''<>]+\.(xyz|top|click)'
"#,
        );
        let spam = input("f", "t", "s", "", "<a href='http://spam.xyz/click'>Click here</a>");
        assert!(set.evaluate(&spam).is_some());
        let clean = input("f", "t", "s", "", "<p>Hello world</p>");
        assert!(set.evaluate(&clean).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let set = rules(
            r#"filter_rules:
  - name: first-rule
    conditions:
      - field: subject
        pattern: 'test'
  - name: second-rule
    conditions:
      - field: subject
        pattern: 'test subject'
"#,
        );
        let i = input("from@test.com", "to@test.com", "test subject", "body", "");
        assert_eq!(set.evaluate(&i), Some("first-rule"));
    }

    #[test]
    fn test_case_insensitive() {
        let set = rules(
            r#"filter_rules:
  - name: block-spam
    conditions:
      - field: subject
        pattern: 'spam'
  - name: already-flagged
    conditions:
      - field: body
        pattern: '(?i)EGGS'
"#,
        );
        for subject in ["SPAM MESSAGE", "SpAm MeSsAgE", "spam message"] {
            let i = input("f", "t", subject, "body", "");
            assert_eq!(set.evaluate(&i), Some("block-spam"));
        }
        let i = input("f", "t", "hello", "green eggs", "");
        assert_eq!(set.evaluate(&i), Some("already-flagged"));
    }

    #[test]
    fn test_no_rules_loaded() {
        let engine = FilterEngine::default();
        let i = input("any@email.com", "to@test.com", "any subject", "any body", "any html");
        assert_eq!(engine.evaluate(&i), None);
    }

    #[test]
    fn test_empty_conditions_never_match() {
        let set = rules(
            r#"filter_rules:
  - name: empty-rule
    conditions: []
"#,
        );
        let i = input("any@email.com", "to@test.com", "any subject", "any body", "");
        assert_eq!(set.evaluate(&i), None);
    }

    #[test]
    fn test_failed_reload_keeps_previous_rules() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        write!(
            good,
            "filter_rules:\n  - name: keep-me\n    conditions:\n      - field: subject\n        pattern: 'spam'\n"
        )
        .unwrap();
        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(
            bad,
            "filter_rules:\n  - name: broken\n    conditions:\n      - field: subject\n        pattern: '(('\n"
        )
        .unwrap();

        let engine = FilterEngine::load(Some(good.path())).unwrap();
        assert!(engine.reload(bad.path()).is_err());

        let i = input("f", "t", "SPAM", "", "");
        assert_eq!(engine.evaluate(&i).as_deref(), Some("keep-me"));
    }

    #[test]
    fn test_reload_swaps_rules() {
        let mut next = tempfile::NamedTempFile::new().unwrap();
        write!(
            next,
            "filter_rules:\n  - name: new-rule\n    conditions:\n      - field: from\n        pattern: 'evil'\n"
        )
        .unwrap();

        let engine = FilterEngine::default();
        let before = engine.snapshot();
        assert_eq!(engine.reload(next.path()).unwrap(), 1);

        let i = input("evil@example.com", "t", "s", "", "");
        assert_eq!(engine.evaluate(&i).as_deref(), Some("new-rule"));
        // snapshots taken before the swap are unaffected
        assert_eq!(before.evaluate(&i), None);
    }
}
