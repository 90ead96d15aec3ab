//! Result-set masking rules.
//!
//! Rules are declared in a JSON document and rewrite matching column values
//! in place before they leave for the client. Every rewrite preserves the
//! payload length, so packet framing and sequence numbers never change.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::protocol::response::{row_values, ColumnDef};

const DEFAULT_FILL: &str = "X";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("could not read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("rules document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid rules document: {0}")]
    Grammar(String),
    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

fn grammar(msg: impl Into<String>) -> RulesError {
    RulesError::Grammar(msg.into())
}

/// An account specifier from `applies_to`/`exempted`.
///
/// A host part containing `%` or `_` wildcards is compiled to an anchored
/// regex; otherwise both parts compare verbatim. An empty part matches
/// anything.
#[derive(Debug)]
enum Account {
    Verbatim { user: String, host: String },
    Pattern { user: String, host: regex::Regex },
}

impl Account {
    fn parse(spec: &str) -> Result<Self, RulesError> {
        let (user, host) = match spec.split_once('@') {
            Some((u, h)) => (trim_quotes(u), trim_quotes(h)),
            None => (trim_quotes(spec), ""),
        };

        if host.contains('%') || host.contains('_') {
            let mut pattern = String::from("^");
            for ch in host.chars() {
                match ch {
                    '%' => pattern.push_str(".*"),
                    '_' => pattern.push('.'),
                    other => pattern.push_str(&regex::escape(&other.to_string())),
                }
            }
            pattern.push('$');
            let host = regex::Regex::new(&pattern).map_err(|source| RulesError::Regex {
                pattern,
                source,
            })?;
            Ok(Account::Pattern {
                user: user.to_string(),
                host,
            })
        } else {
            Ok(Account::Verbatim {
                user: user.to_string(),
                host: host.to_string(),
            })
        }
    }

    fn matches(&self, user: &str, host: &str) -> bool {
        match self {
            Account::Verbatim {
                user: rule_user,
                host: rule_host,
            } => {
                (rule_user.is_empty() || rule_user == user)
                    && (rule_host.is_empty() || rule_host == host)
            }
            Account::Pattern {
                user: rule_user,
                host: rule_host,
            } => (rule_user.is_empty() || rule_user == user) && rule_host.is_match(host),
        }
    }
}

fn trim_quotes(s: &str) -> &str {
    let s = s.trim();
    for quote in ['\'', '"', '`'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// How a matching column value is rewritten
#[derive(Debug)]
pub enum RuleKind {
    Replace { value: String, fill: String },
    Obfuscate,
    Capture { pattern: regex::bytes::Regex, fill: String },
}

/// One masking rule
#[derive(Debug)]
pub struct Rule {
    column: String,
    table: String,
    database: String,
    applies_to: Vec<Account>,
    exempted: Vec<Account>,
    kind: RuleKind,
}

impl Rule {
    /// The column pattern as `database.table.column`, `*` for any
    pub fn match_string(&self) -> String {
        format!(
            "{}.{}.{}",
            if self.database.is_empty() { "*" } else { &self.database },
            if self.table.is_empty() { "*" } else { &self.table },
            self.column
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RuleKind::Replace { .. } => "replace",
            RuleKind::Obfuscate => "obfuscate",
            RuleKind::Capture { .. } => "capture",
        }
    }

    /// Does this rule apply to the column for this account?
    pub fn matches(&self, column_def: &ColumnDef, user: &str, host: &str) -> bool {
        let column_match = self.column == column_def.org_name
            && (self.table.is_empty() || self.table == column_def.org_table)
            && (self.database.is_empty() || self.database == column_def.schema);

        if !column_match {
            return false;
        }

        if !self.applies_to.is_empty() && !self.applies_to.iter().any(|a| a.matches(user, host)) {
            return false;
        }

        if !self.exempted.is_empty() && self.exempted.iter().any(|a| a.matches(user, host)) {
            return false;
        }

        true
    }

    /// Rewrite one column value in place; the length never changes.
    pub fn rewrite(&self, payload: &mut [u8]) {
        match &self.kind {
            RuleKind::Replace { value, fill } => {
                if !value.is_empty() && value.len() == payload.len() {
                    payload.copy_from_slice(value.as_bytes());
                } else if !fill.is_empty() {
                    fill_buffer(fill.as_bytes(), payload);
                } else {
                    warn!(
                        rule = %self.match_string(),
                        payload_len = payload.len(),
                        value_len = value.len(),
                        "No valid rewrite for value, leaving payload unchanged"
                    );
                }
            }
            RuleKind::Obfuscate => {
                for byte in payload.iter_mut() {
                    *byte = obfuscate_byte(*byte);
                }
            }
            RuleKind::Capture { pattern, fill } => {
                let mut offset = 0;
                while offset < payload.len() {
                    let Some(found) = pattern.find_at(payload, offset) else {
                        break;
                    };
                    // A zero-length match would never advance
                    if found.range().is_empty() {
                        break;
                    }
                    let range = found.range();
                    fill_buffer(fill.as_bytes(), &mut payload[range.clone()]);
                    offset = range.end;
                }
            }
        }
    }
}

/// ROT13 on ASCII letters; other bytes shift up by 32 saturating at 127
fn obfuscate_byte(b: u8) -> u8 {
    match b {
        b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
        b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
        _ => b.saturating_add(32).min(127),
    }
}

/// Tile the fill string across the output range
fn fill_buffer(fill: &[u8], out: &mut [u8]) {
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = fill[i % fill.len()];
    }
}

/// A loaded, immutable set of masking rules
#[derive(Debug, Default)]
pub struct MaskingRules {
    rules: Vec<Rule>,
}

impl MaskingRules {
    /// Load rules from a JSON file. A malformed document is refused whole.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RulesError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse rules from a JSON string
    pub fn parse(json: &str) -> Result<Self, RulesError> {
        let root: Value = serde_json::from_str(json)?;
        Self::from_root(&root)
    }

    fn from_root(root: &Value) -> Result<Self, RulesError> {
        let rules_array = root
            .get("rules")
            .ok_or_else(|| grammar("missing top-level 'rules' key"))?
            .as_array()
            .ok_or_else(|| grammar("'rules' is not an array"))?;

        let mut rules = Vec::with_capacity(rules_array.len());
        for (i, rule) in rules_array.iter().enumerate() {
            let rule = rule
                .as_object()
                .ok_or_else(|| grammar(format!("element {} of 'rules' is not an object", i)))?;
            rules.push(parse_rule(rule)?);
        }

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// First rule matching the column for this account, if any
    pub fn get_rule_for(&self, column_def: &ColumnDef, user: &str, host: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(column_def, user, host))
    }

    fn rule_index_for(&self, column_def: &ColumnDef, user: &str, host: &str) -> Option<usize> {
        self.rules
            .iter()
            .position(|rule| rule.matches(column_def, user, host))
    }

    /// Rewrite every masked column of a text-protocol row payload in place
    pub fn mask_row(payload: &mut [u8], column_rules: &[Option<&Rule>]) {
        let values = row_values(payload);
        for (value, rule) in values.into_iter().zip(column_rules.iter()) {
            if let (Some(range), Some(rule)) = (value, rule) {
                rule.rewrite(&mut payload[range]);
                crate::metrics::metrics().record_masking_rewrite(rule.kind_name());
            }
        }
    }
}

fn parse_rule(rule: &serde_json::Map<String, Value>) -> Result<Rule, RulesError> {
    let obfuscate = rule.get("obfuscate");
    let replace = rule.get("replace");

    if obfuscate.is_none() && replace.is_none() {
        return Err(grammar(
            "a masking rule contains neither an 'obfuscate' nor a 'replace' key",
        ));
    }

    // Obfuscate takes precedence; under replace, the presence of 'capture'
    // selects a capture rule over a literal replace.
    let (selector, kind_key) = if let Some(obj) = obfuscate {
        (obj, "obfuscate")
    } else {
        (replace.unwrap(), "replace")
    };

    let selector = selector
        .as_object()
        .ok_or_else(|| grammar(format!("'{}' is not an object", kind_key)))?;

    let column = get_string(selector, "column")?
        .ok_or_else(|| grammar(format!("'{}' lacks the mandatory 'column' key", kind_key)))?;
    let table = get_string(selector, "table")?.unwrap_or_default();
    let database = get_string(selector, "database")?.unwrap_or_default();

    let applies_to = parse_accounts(rule, "applies_to")?;
    let exempted = parse_accounts(rule, "exempted")?;

    let kind = if kind_key == "obfuscate" {
        RuleKind::Obfuscate
    } else {
        let with = rule.get("with").and_then(Value::as_object);
        let fill = with
            .map(|w| get_string(w, "fill"))
            .transpose()?
            .flatten()
            .unwrap_or_else(|| DEFAULT_FILL.to_string());
        if fill.is_empty() {
            return Err(grammar("'fill' must not be empty"));
        }

        if let Some(capture) = get_string(selector, "capture")? {
            if capture.is_empty() {
                return Err(grammar("'capture' must not be empty"));
            }
            let pattern =
                regex::bytes::Regex::new(&capture).map_err(|source| RulesError::Regex {
                    pattern: capture,
                    source,
                })?;
            RuleKind::Capture { pattern, fill }
        } else {
            let value = with
                .map(|w| get_string(w, "value"))
                .transpose()?
                .flatten()
                .ok_or_else(|| grammar("a 'replace' rule needs 'with.value'"))?;
            if value.is_empty() {
                return Err(grammar("'value' must not be empty"));
            }
            RuleKind::Replace { value, fill }
        }
    };

    Ok(Rule {
        column,
        table,
        database,
        applies_to,
        exempted,
        kind,
    })
}

fn get_string(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<String>, RulesError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(grammar(format!("'{}' is not a string", key))),
    }
}

fn parse_accounts(
    rule: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Vec<Account>, RulesError> {
    let Some(value) = rule.get(key) else {
        return Ok(Vec::new());
    };
    let array = value
        .as_array()
        .ok_or_else(|| grammar(format!("'{}' is not an array", key)))?;

    let mut accounts = Vec::with_capacity(array.len());
    for entry in array {
        let spec = entry
            .as_str()
            .ok_or_else(|| grammar(format!("an element of '{}' is not a string", key)))?;
        accounts.push(Account::parse(spec)?);
    }
    Ok(accounts)
}

/// Per-resultset masking plan: one optional rule per column, resolved from
/// the column definitions as they stream past. Owns a snapshot of the rule
/// set so a concurrent reload never changes rules mid-resultset.
pub struct MaskPlan {
    rules: std::sync::Arc<MaskingRules>,
    columns: Vec<Option<usize>>,
    any_match: bool,
}

impl MaskPlan {
    pub fn new(rules: std::sync::Arc<MaskingRules>) -> Self {
        Self {
            rules,
            columns: Vec::new(),
            any_match: false,
        }
    }

    /// Record one column definition in stream order
    pub fn add_column(&mut self, payload: &[u8], user: &str, host: &str) {
        let rule = ColumnDef::parse(payload)
            .and_then(|def| self.rules.rule_index_for(&def, user, host));
        self.any_match |= rule.is_some();
        self.columns.push(rule);
    }

    /// Any column of this resultset has a matching rule
    pub fn is_active(&self) -> bool {
        self.any_match
    }

    /// Apply the resolved rules to one row payload
    pub fn apply(&self, payload: &mut [u8]) {
        if !self.any_match {
            return;
        }
        let column_rules: Vec<Option<&Rule>> = self
            .columns
            .iter()
            .map(|idx| idx.map(|i| &self.rules.rules[i]))
            .collect();
        MaskingRules::mask_row(payload, &column_rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssn_rules() -> MaskingRules {
        MaskingRules::parse(
            r#"{
                "rules": [
                    {
                        "replace": {
                            "column": "ssn",
                            "table": "users"
                        },
                        "with": {
                            "value": "XXXXXXXXX",
                            "fill": "X"
                        }
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    fn column(schema: &str, table: &str, name: &str) -> ColumnDef {
        ColumnDef {
            schema: schema.to_string(),
            org_table: table.to_string(),
            org_name: name.to_string(),
        }
    }

    #[test]
    fn test_replace_exact_length() {
        let rules = ssn_rules();
        let rule = rules
            .get_rule_for(&column("db", "users", "ssn"), "alice", "localhost")
            .unwrap();

        let mut payload = b"123456789".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"XXXXXXXXX");
    }

    #[test]
    fn test_replace_fill_tiled_on_length_mismatch() {
        let rules = ssn_rules();
        let rule = rules
            .get_rule_for(&column("db", "users", "ssn"), "alice", "localhost")
            .unwrap();

        let mut payload = b"42".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"XX");
    }

    #[test]
    fn test_replace_multibyte_fill_tiles() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "c"}, "with": {"value": "ab", "fill": "xyz"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "c"), "u", "h").unwrap();

        let mut payload = b"1234567".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"xyzxyzx");
    }

    #[test]
    fn test_table_and_database_filters() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "ssn", "table": "users", "database": "prod"},
                           "with": {"value": "X"}}]}"#,
        )
        .unwrap();

        assert!(rules
            .get_rule_for(&column("prod", "users", "ssn"), "u", "h")
            .is_some());
        assert!(rules
            .get_rule_for(&column("stage", "users", "ssn"), "u", "h")
            .is_none());
        assert!(rules
            .get_rule_for(&column("prod", "accounts", "ssn"), "u", "h")
            .is_none());
        assert!(rules
            .get_rule_for(&column("prod", "users", "name"), "u", "h")
            .is_none());
    }

    #[test]
    fn test_obfuscate_rot13_involution() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"obfuscate": {"column": "name"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "name"), "u", "h").unwrap();

        let original = b"Hello World".to_vec();
        let mut payload = original.clone();
        rule.rewrite(&mut payload);
        assert_ne!(payload, original);

        // Letters return after a second pass; non-letters do not
        rule.rewrite(&mut payload);
        for (a, b) in original.iter().zip(payload.iter()) {
            if a.is_ascii_alphabetic() {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_obfuscate_non_letters_saturate() {
        assert_eq!(obfuscate_byte(b'a'), b'n');
        assert_eq!(obfuscate_byte(b'N'), b'A');
        assert_eq!(obfuscate_byte(b'0'), b'0' + 32);
        assert_eq!(obfuscate_byte(96), 127);
        assert_eq!(obfuscate_byte(200), 127);
    }

    #[test]
    fn test_capture_tiles_matches() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "card", "capture": "\\d{4}"},
                           "with": {"fill": "*"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "card"), "u", "h").unwrap();

        let mut payload = b"card 1234 5678 end".to_vec();
        let before = payload.len();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"card **** **** end");
        assert_eq!(payload.len(), before);
    }

    #[test]
    fn test_capture_no_match_leaves_payload() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "card", "capture": "\\d{4}"},
                           "with": {"fill": "*"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "card"), "u", "h").unwrap();

        let mut payload = b"no digits here".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"no digits here");
    }

    #[test]
    fn test_capture_zero_length_match_terminates() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "c", "capture": "x*"},
                           "with": {"fill": "*"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "c"), "u", "h").unwrap();

        // "x*" matches the empty string at offset 0 of "abc"; the rewrite
        // must not spin.
        let mut payload = b"abc".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"abc");
    }

    #[test]
    fn test_applies_to_and_exempted() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{
                "replace": {"column": "ssn"},
                "applies_to": ["alice@localhost", "bob@%"],
                "exempted": ["bob@10.0.0.1"],
                "with": {"value": "X"}
            }]}"#,
        )
        .unwrap();
        let def = column("", "", "ssn");

        assert!(rules.get_rule_for(&def, "alice", "localhost").is_some());
        assert!(rules.get_rule_for(&def, "alice", "10.0.0.9").is_none());
        assert!(rules.get_rule_for(&def, "bob", "anywhere.example").is_some());
        assert!(rules.get_rule_for(&def, "bob", "10.0.0.1").is_none());
        assert!(rules.get_rule_for(&def, "carol", "localhost").is_none());
    }

    #[test]
    fn test_host_wildcards() {
        let account = Account::parse("app@10.0.%").unwrap();
        assert!(account.matches("app", "10.0.0.1"));
        assert!(account.matches("app", "10.0.12.9"));
        assert!(!account.matches("app", "10.1.0.1"));
        assert!(!account.matches("other", "10.0.0.1"));

        let underscore = Account::parse("app@host_").unwrap();
        assert!(underscore.matches("app", "hosta"));
        assert!(!underscore.matches("app", "host"));
    }

    #[test]
    fn test_account_without_host_matches_any_host() {
        let account = Account::parse("alice").unwrap();
        assert!(account.matches("alice", "anywhere"));
        assert!(!account.matches("bob", "anywhere"));
    }

    #[test]
    fn test_quoted_account_parts() {
        let account = Account::parse("'alice'@'localhost'").unwrap();
        assert!(account.matches("alice", "localhost"));
    }

    #[test]
    fn test_obfuscate_takes_precedence_over_replace() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{
                "obfuscate": {"column": "c"},
                "replace": {"column": "other"},
                "with": {"value": "X"}
            }]}"#,
        )
        .unwrap();
        let rule = rules.iter().next().unwrap();
        assert_eq!(rule.kind_name(), "obfuscate");
    }

    #[test]
    fn test_malformed_documents_refused() {
        for doc in [
            "not json at all",
            r#"{"no_rules": []}"#,
            r#"{"rules": "not an array"}"#,
            r#"{"rules": [42]}"#,
            r#"{"rules": [{"neither": {}}]}"#,
            r#"{"rules": [{"replace": {"table": "t"}, "with": {"value": "X"}}]}"#,
            r#"{"rules": [{"replace": {"column": "c"}}]}"#,
            r#"{"rules": [{"replace": {"column": "c"}, "with": {"value": ""}}]}"#,
            r#"{"rules": [{"replace": {"column": "c", "capture": "("}, "with": {"fill": "*"}}]}"#,
            r#"{"rules": [{"replace": {"column": "c"}, "with": {"value": "X", "fill": ""}}]}"#,
        ] {
            assert!(MaskingRules::parse(doc).is_err(), "doc accepted: {}", doc);
        }
    }

    #[test]
    fn test_default_fill() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "c", "capture": "\\d+"}}]}"#,
        )
        .unwrap();
        let rule = rules.get_rule_for(&column("", "", "c"), "u", "h").unwrap();

        let mut payload = b"a99b".to_vec();
        rule.rewrite(&mut payload);
        assert_eq!(&payload, b"aXXb");
    }

    #[test]
    fn test_match_string_rendering() {
        let rules = MaskingRules::parse(
            r#"{"rules": [{"replace": {"column": "ssn", "table": "users"},
                           "with": {"value": "X"}}]}"#,
        )
        .unwrap();
        assert_eq!(rules.iter().next().unwrap().match_string(), "*.users.ssn");
    }

    #[test]
    fn test_mask_row_rewrites_only_ruled_columns() {
        let rules = ssn_rules();
        let ssn_rule = rules
            .get_rule_for(&column("db", "users", "ssn"), "u", "h")
            .unwrap();

        // Row: "alice", "123456789"
        let mut payload = Vec::new();
        payload.push(5);
        payload.extend_from_slice(b"alice");
        payload.push(9);
        payload.extend_from_slice(b"123456789");

        MaskingRules::mask_row(&mut payload, &[None, Some(ssn_rule)]);

        assert_eq!(&payload[1..6], b"alice");
        assert_eq!(&payload[7..16], b"XXXXXXXXX");
    }

    fn coldef_payload(schema: &str, table: &str, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in ["def", schema, table, table, name, name] {
            buf.push(part.len() as u8);
            buf.extend_from_slice(part.as_bytes());
        }
        buf.push(0x0c);
        buf.extend_from_slice(&[0u8; 12]);
        buf
    }

    #[test]
    fn test_mask_plan_streaming() {
        let rules = std::sync::Arc::new(ssn_rules());
        let mut plan = MaskPlan::new(rules);

        plan.add_column(&coldef_payload("db", "users", "name"), "alice", "localhost");
        plan.add_column(&coldef_payload("db", "users", "ssn"), "alice", "localhost");
        assert!(plan.is_active());

        // Row: "bob", "987654321"
        let mut payload = Vec::new();
        payload.push(3);
        payload.extend_from_slice(b"bob");
        payload.push(9);
        payload.extend_from_slice(b"987654321");

        plan.apply(&mut payload);
        assert_eq!(&payload[1..4], b"bob");
        assert_eq!(&payload[5..14], b"XXXXXXXXX");
    }

    #[test]
    fn test_mask_plan_inactive_without_matches() {
        let rules = std::sync::Arc::new(ssn_rules());
        let mut plan = MaskPlan::new(rules);
        plan.add_column(&coldef_payload("db", "orders", "total"), "alice", "localhost");
        assert!(!plan.is_active());
    }

    #[test]
    fn test_mask_row_skips_nulls() {
        let rules = ssn_rules();
        let ssn_rule = rules
            .get_rule_for(&column("db", "users", "ssn"), "u", "h")
            .unwrap();

        let mut payload = vec![0xFB];
        MaskingRules::mask_row(&mut payload, &[Some(ssn_rule)]);
        assert_eq!(payload, vec![0xFB]);
    }
}
