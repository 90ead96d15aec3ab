//! Per-statement classification driving routing decisions.
//!
//! The classifier turns one client command packet plus the session's context
//! (known temp tables, load-data state, transaction state) into a
//! `Classification` record. Statement typing goes through sqlparser where the
//! text parses; transaction control, user variables, multi-statement payloads
//! and LOAD DATA are detected with byte-level scans first since they must
//! work even on SQL the parser cannot handle.

use std::collections::HashSet;

use bytes::Bytes;
use sqlparser::ast::{ObjectType, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::protocol::Command;

/// Which backend(s) a statement should reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// The current master only
    Master,
    /// One slave, master fallback per configuration
    Slave,
    /// Every attached backend (session commands)
    All,
}

/// Load-data wire state, advanced by the router session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    /// Current statement starts a LOAD DATA LOCAL INFILE
    Start,
    /// Raw data packets are being forwarded
    Active,
    /// The terminating empty packet has been seen
    End,
}

/// Session context the classifier needs
#[derive(Debug, Default)]
pub struct ClassifyContext<'a> {
    pub temp_tables: Option<&'a HashSet<String>>,
    pub load_data_state: LoadDataState,
    pub in_transaction: bool,
}

/// Classification of one client command packet
#[derive(Debug, Default)]
pub struct Classification {
    pub command: u8,
    pub target: Option<RouteTarget>,
    pub is_session_modifying: bool,
    pub is_read_only: bool,
    pub is_multi_stmt: bool,
    pub starts_load_data: bool,
    pub ends_load_data: bool,
    pub touches_temp_table: bool,
    pub needs_broadcast: bool,
    /// Session commands that have no reply on the wire (e.g. COM_STMT_CLOSE)
    pub expects_response: bool,
    pub starts_transaction: bool,
    pub ends_transaction: bool,
    pub reads_user_variables: bool,
    pub writes_user_variables: bool,
    /// Temp table registered by CREATE TEMPORARY TABLE (lowercased last name part)
    pub creates_temp_table: Option<String>,
    /// Tables removed by DROP TABLE (lowercased last name parts)
    pub dropped_tables: Vec<String>,
}

impl Classification {
    fn for_command(command: u8) -> Self {
        Self {
            command,
            expects_response: true,
            ..Default::default()
        }
    }
}

pub struct QueryClassifier {
    dialect: MySqlDialect,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClassifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Classify one client command packet
    pub fn classify(&self, payload: &Bytes, ctx: &ClassifyContext) -> Classification {
        // While a LOAD DATA stream is active every packet is raw file data;
        // the empty packet terminates the stream.
        if ctx.load_data_state == LoadDataState::Active {
            let mut c = Classification::for_command(0);
            c.target = Some(RouteTarget::Master);
            c.ends_load_data = payload.is_empty();
            return c;
        }

        let Some(&cmd) = payload.first() else {
            return Classification::for_command(0);
        };

        match Command::from_byte(cmd) {
            Command::Query => {
                let sql = String::from_utf8_lossy(&payload[1..]);
                self.classify_sql(cmd, &sql, ctx)
            }
            // Session state changes that every backend must see
            Command::InitDb
            | Command::ChangeUser
            | Command::ResetConnection
            | Command::SetOption
            | Command::StmtPrepare => {
                let mut c = Classification::for_command(cmd);
                c.is_session_modifying = true;
                c.needs_broadcast = true;
                c.target = Some(RouteTarget::All);
                c
            }
            // Session commands without a reply on the wire
            Command::StmtClose | Command::StmtSendLongData => {
                let mut c = Classification::for_command(cmd);
                c.is_session_modifying = true;
                c.needs_broadcast = true;
                c.target = Some(RouteTarget::All);
                c.expects_response = false;
                c
            }
            // Prepared statement execution sticks to the master: the
            // statement id is only meaningful where it was prepared and
            // the payload is opaque to the classifier.
            Command::StmtExecute | Command::StmtReset | Command::StmtFetch => {
                let mut c = Classification::for_command(cmd);
                c.target = Some(RouteTarget::Master);
                c
            }
            _ => {
                let mut c = Classification::for_command(cmd);
                c.target = Some(RouteTarget::Master);
                c
            }
        }
    }

    fn classify_sql(&self, cmd: u8, sql: &str, ctx: &ClassifyContext) -> Classification {
        let mut c = Classification::for_command(cmd);
        let trimmed = sql.trim();
        let upper = trimmed.to_uppercase();

        c.is_multi_stmt = is_multi_statement(trimmed);
        let (reads_vars, writes_vars) = scan_user_variables(trimmed);
        c.reads_user_variables = reads_vars;
        c.writes_user_variables = writes_vars;

        // Transaction control before anything else; these never parse-fail.
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            c.starts_transaction = true;
            c.target = Some(RouteTarget::Master);
            return c;
        }
        if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            c.ends_transaction = true;
            c.target = Some(RouteTarget::Master);
            return c;
        }

        // SET touches per-connection server state, including autocommit
        // which doubles as transaction control.
        if upper.starts_with("SET") {
            c.is_session_modifying = true;
            c.needs_broadcast = true;
            c.target = Some(RouteTarget::All);
            if let Some(value) = autocommit_value(&upper) {
                if value {
                    c.ends_transaction = true;
                } else {
                    c.starts_transaction = true;
                }
            }
            return c;
        }

        if upper == "USE" || upper.starts_with("USE ") || upper.starts_with("USE`") {
            c.is_session_modifying = true;
            c.needs_broadcast = true;
            c.target = Some(RouteTarget::All);
            return c;
        }

        if upper.starts_with("LOAD DATA") {
            c.starts_load_data = true;
            c.target = Some(RouteTarget::Master);
            return c;
        }

        // Statement typing through the parser where possible
        match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) if !statements.is_empty() => {
                if statements.len() > 1 {
                    c.is_multi_stmt = true;
                }
                self.classify_statement(&statements[0], &mut c, ctx);
            }
            _ => {
                // Parser could not handle it; fall back to keyword heuristics
                c.is_read_only = upper.starts_with("SELECT")
                    || upper.starts_with("SHOW")
                    || upper.starts_with("DESCRIBE")
                    || upper.starts_with("DESC")
                    || upper.starts_with("EXPLAIN");
                c.target = Some(if c.is_read_only {
                    RouteTarget::Slave
                } else {
                    RouteTarget::Master
                });
                if c.is_read_only {
                    c.touches_temp_table = references_temp_table_text(&upper, ctx.temp_tables);
                }
            }
        }

        // SELECT ... FOR UPDATE and SELECT ... INTO are writes in disguise
        if c.is_read_only && (upper.contains(" FOR UPDATE") || upper.contains(" INTO ")) {
            c.is_read_only = false;
            c.target = Some(RouteTarget::Master);
        }

        // Reads that hit a temp table only exist on the master
        if c.touches_temp_table {
            c.target = Some(RouteTarget::Master);
        }

        // Inside a transaction every statement belongs to the master
        if ctx.in_transaction && c.target == Some(RouteTarget::Slave) {
            c.target = Some(RouteTarget::Master);
        }

        c
    }

    fn classify_statement(
        &self,
        stmt: &Statement,
        c: &mut Classification,
        ctx: &ClassifyContext,
    ) {
        match stmt {
            Statement::Query(query) => {
                c.is_read_only = query.locks.is_empty();
                c.target = Some(if c.is_read_only {
                    RouteTarget::Slave
                } else {
                    RouteTarget::Master
                });
                if let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() {
                    for table_with_joins in &select.from {
                        for table in table_names(table_with_joins) {
                            if is_temp_table(&table, ctx.temp_tables) {
                                c.touches_temp_table = true;
                            }
                        }
                    }
                }
            }
            Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowVariable { .. }
            | Statement::ShowVariables { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowCollation { .. }
            | Statement::ExplainTable { .. }
            | Statement::Explain { .. } => {
                c.is_read_only = true;
                c.target = Some(RouteTarget::Slave);
            }
            Statement::CreateTable {
                temporary, name, ..
            } => {
                c.target = Some(RouteTarget::Master);
                if *temporary {
                    c.creates_temp_table = Some(last_name_part(&name.to_string()));
                    c.touches_temp_table = true;
                }
            }
            Statement::Drop {
                object_type: ObjectType::Table,
                names,
                ..
            } => {
                c.target = Some(RouteTarget::Master);
                c.dropped_tables = names
                    .iter()
                    .map(|n| last_name_part(&n.to_string()))
                    .collect();
                c.touches_temp_table = c
                    .dropped_tables
                    .iter()
                    .any(|t| is_temp_table(t, ctx.temp_tables));
            }
            Statement::Insert { table_name, .. } => {
                c.target = Some(RouteTarget::Master);
                c.touches_temp_table =
                    is_temp_table(&last_name_part(&table_name.to_string()), ctx.temp_tables);
            }
            Statement::Update { table, .. } => {
                c.target = Some(RouteTarget::Master);
                c.touches_temp_table = table_names(table)
                    .iter()
                    .any(|t| is_temp_table(t, ctx.temp_tables));
            }
            Statement::Delete { from, .. } => {
                c.target = Some(RouteTarget::Master);
                c.touches_temp_table = from
                    .iter()
                    .flat_map(table_names)
                    .any(|t| is_temp_table(&t, ctx.temp_tables));
            }
            Statement::StartTransaction { .. } => {
                c.starts_transaction = true;
                c.target = Some(RouteTarget::Master);
            }
            Statement::Commit { .. } | Statement::Rollback { .. } => {
                c.ends_transaction = true;
                c.target = Some(RouteTarget::Master);
            }
            // Everything else (DDL, CALL, LOCK TABLES, ...) belongs on the master
            _ => {
                c.target = Some(RouteTarget::Master);
            }
        }
    }
}

/// Lowercased last dot-separated part of a possibly qualified table name
fn last_name_part(name: &str) -> String {
    name.rsplit('.')
        .next()
        .unwrap_or(name)
        .trim_matches('`')
        .to_lowercase()
}

fn table_names(table_with_joins: &TableWithJoins) -> Vec<String> {
    let mut names = Vec::new();
    if let TableFactor::Table { name, .. } = &table_with_joins.relation {
        names.push(last_name_part(&name.to_string()));
    }
    for join in &table_with_joins.joins {
        if let TableFactor::Table { name, .. } = &join.relation {
            names.push(last_name_part(&name.to_string()));
        }
    }
    names
}

fn is_temp_table(name: &str, temp_tables: Option<&HashSet<String>>) -> bool {
    temp_tables.is_some_and(|set| set.contains(&last_name_part(name)))
}

/// Word-level search for any known temp table name in unparseable SQL
fn references_temp_table_text(upper: &str, temp_tables: Option<&HashSet<String>>) -> bool {
    let Some(set) = temp_tables else {
        return false;
    };
    for name in set {
        let needle = name.to_uppercase();
        let mut start = 0;
        while let Some(idx) = upper[start..].find(&needle) {
            let abs = start + idx;
            let before_ok = abs == 0
                || !upper.as_bytes()[abs - 1].is_ascii_alphanumeric()
                    && upper.as_bytes()[abs - 1] != b'_';
            let end = abs + needle.len();
            let after_ok = end >= upper.len()
                || !upper.as_bytes()[end].is_ascii_alphanumeric() && upper.as_bytes()[end] != b'_';
            if before_ok && after_ok {
                return true;
            }
            start = end;
        }
    }
    false
}

/// Extract the value of an autocommit assignment from an uppercased SET statement
fn autocommit_value(upper: &str) -> Option<bool> {
    let idx = upper.find("AUTOCOMMIT")?;
    let rest = upper[idx + "AUTOCOMMIT".len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    if rest.starts_with('1') || rest.starts_with("ON") || rest.starts_with("TRUE") {
        Some(true)
    } else if rest.starts_with('0') || rest.starts_with("OFF") || rest.starts_with("FALSE") {
        Some(false)
    } else {
        None
    }
}

#[derive(PartialEq)]
enum ScanState {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    LineComment,
    BlockComment,
}

/// Detect a second statement after a top-level semicolon
fn is_multi_statement(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut state = ScanState::Normal;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match state {
            ScanState::Normal => match b {
                b'\'' => state = ScanState::SingleQuote,
                b'"' => state = ScanState::DoubleQuote,
                b'`' => state = ScanState::Backtick,
                b'#' => state = ScanState::LineComment,
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                b';' => {
                    // Anything but whitespace after the semicolon means a
                    // second statement follows.
                    if bytes[i + 1..].iter().any(|&b| !b.is_ascii_whitespace()) {
                        return true;
                    }
                }
                _ => {}
            },
            ScanState::SingleQuote => {
                if b == b'\\' {
                    i += 1;
                } else if b == b'\'' {
                    state = ScanState::Normal;
                }
            }
            ScanState::DoubleQuote => {
                if b == b'\\' {
                    i += 1;
                } else if b == b'"' {
                    state = ScanState::Normal;
                }
            }
            ScanState::Backtick => {
                if b == b'`' {
                    state = ScanState::Normal;
                }
            }
            ScanState::LineComment => {
                if b == b'\n' {
                    state = ScanState::Normal;
                }
            }
            ScanState::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = ScanState::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    false
}

/// Scan for user variables outside string literals.
///
/// Returns (reads, writes): a variable followed by `:=` or preceded by the
/// INTO keyword is a write, any other occurrence a read. `@@system_var`
/// references are neither.
fn scan_user_variables(sql: &str) -> (bool, bool) {
    let bytes = sql.as_bytes();
    let mut state = ScanState::Normal;
    let mut reads = false;
    let mut writes = false;
    let mut prev_word_into = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match state {
            ScanState::Normal => match b {
                b'\'' => state = ScanState::SingleQuote,
                b'"' => state = ScanState::DoubleQuote,
                b'`' => state = ScanState::Backtick,
                b'@' => {
                    if bytes.get(i + 1) == Some(&b'@') {
                        // System variable; skip both @s and the identifier
                        i += 1;
                        while i + 1 < bytes.len() && is_ident_byte(bytes[i + 1]) {
                            i += 1;
                        }
                    } else {
                        // User variable: consume the identifier
                        let mut j = i + 1;
                        while j < bytes.len() && is_ident_byte(bytes[j]) {
                            j += 1;
                        }
                        // Skip whitespace and look for :=
                        let mut k = j;
                        while k < bytes.len() && bytes[k].is_ascii_whitespace() {
                            k += 1;
                        }
                        let assigned = bytes.get(k) == Some(&b':') && bytes.get(k + 1) == Some(&b'=');
                        if assigned || prev_word_into {
                            writes = true;
                        } else {
                            reads = true;
                        }
                        i = j;
                        continue;
                    }
                }
                _ if b.is_ascii_alphabetic() => {
                    let start = i;
                    while i + 1 < bytes.len() && is_ident_byte(bytes[i + 1]) {
                        i += 1;
                    }
                    prev_word_into = sql[start..=i].eq_ignore_ascii_case("into");
                    i += 1;
                    continue;
                }
                _ => {}
            },
            ScanState::SingleQuote => {
                if b == b'\\' {
                    i += 1;
                } else if b == b'\'' {
                    state = ScanState::Normal;
                }
            }
            ScanState::DoubleQuote => {
                if b == b'\\' {
                    i += 1;
                } else if b == b'"' {
                    state = ScanState::Normal;
                }
            }
            ScanState::Backtick => {
                if b == b'`' {
                    state = ScanState::Normal;
                }
            }
            _ => state = ScanState::Normal,
        }
        if !b.is_ascii_whitespace() && state == ScanState::Normal && !b.is_ascii_alphabetic() {
            prev_word_into = false;
        }
        i += 1;
    }

    (reads, writes)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(sql: &str) -> Classification {
        classify_with(sql, &ClassifyContext::default())
    }

    fn classify_with(sql: &str, ctx: &ClassifyContext) -> Classification {
        let classifier = QueryClassifier::new();
        let packet = crate::protocol::Packet::query(sql);
        classifier.classify(&packet.payload, ctx)
    }

    #[test]
    fn test_select_goes_to_slave() {
        let c = classify("SELECT * FROM users WHERE id = 1");
        assert_eq!(c.target, Some(RouteTarget::Slave));
        assert!(c.is_read_only);
        assert!(!c.is_session_modifying);
    }

    #[test]
    fn test_writes_go_to_master() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET a = 1",
            "DELETE FROM t",
            "CREATE TABLE t (a int)",
            "ALTER TABLE t ADD COLUMN b int",
        ] {
            let c = classify(sql);
            assert_eq!(c.target, Some(RouteTarget::Master), "sql: {}", sql);
            assert!(!c.is_read_only, "sql: {}", sql);
        }
    }

    #[test]
    fn test_set_broadcasts() {
        let c = classify("SET @x := 5");
        assert!(c.is_session_modifying);
        assert!(c.needs_broadcast);
        assert_eq!(c.target, Some(RouteTarget::All));
    }

    #[test]
    fn test_use_broadcasts() {
        let c = classify("USE test");
        assert!(c.is_session_modifying);
        assert_eq!(c.target, Some(RouteTarget::All));
    }

    #[test]
    fn test_init_db_broadcasts() {
        let classifier = QueryClassifier::new();
        let mut payload = vec![Command::InitDb.byte()];
        payload.extend_from_slice(b"test");
        let c = classifier.classify(&Bytes::from(payload), &ClassifyContext::default());
        assert!(c.is_session_modifying);
        assert_eq!(c.target, Some(RouteTarget::All));
    }

    #[test]
    fn test_stmt_close_expects_no_response() {
        let classifier = QueryClassifier::new();
        let payload = Bytes::from(vec![Command::StmtClose.byte(), 1, 0, 0, 0]);
        let c = classifier.classify(&payload, &ClassifyContext::default());
        assert!(c.is_session_modifying);
        assert!(!c.expects_response);
    }

    #[test]
    fn test_transaction_control() {
        let begin = classify("BEGIN");
        assert!(begin.starts_transaction);
        assert_eq!(begin.target, Some(RouteTarget::Master));

        let commit = classify("COMMIT");
        assert!(commit.ends_transaction);

        assert!(classify("START TRANSACTION").starts_transaction);
        assert!(classify("ROLLBACK").ends_transaction);
    }

    #[test]
    fn test_autocommit_toggles_transaction_state() {
        let off = classify("SET autocommit = 0");
        assert!(off.starts_transaction);
        assert!(off.is_session_modifying);

        let on = classify("SET AUTOCOMMIT=1");
        assert!(on.ends_transaction);
    }

    #[test]
    fn test_user_variable_modifying_select_flagged() {
        let c = classify("SELECT @a:=@a+1 as a, test.b FROM test");
        assert!(c.writes_user_variables);
        assert!(c.is_read_only);
    }

    #[test]
    fn test_user_variable_read_flagged() {
        let c = classify("SELECT @x");
        assert!(c.reads_user_variables);
        assert!(!c.writes_user_variables);
    }

    #[test]
    fn test_system_variable_is_not_user_variable() {
        let c = classify("SELECT @@version");
        assert!(!c.reads_user_variables);
        assert!(!c.writes_user_variables);
    }

    #[test]
    fn test_at_sign_in_string_literal_ignored() {
        let c = classify("SELECT 'user@host' FROM t");
        assert!(!c.reads_user_variables);
    }

    #[test]
    fn test_select_into_variable_is_a_write() {
        let c = classify("SELECT a INTO @x FROM t");
        assert!(c.writes_user_variables);
    }

    #[test]
    fn test_multi_statement_detection() {
        assert!(classify("SELECT 1; SELECT 2;").is_multi_stmt);
        assert!(!classify("SELECT 1;").is_multi_stmt);
        assert!(!classify("SELECT ';' FROM t").is_multi_stmt);
        assert!(!classify("SELECT 1 -- ; SELECT 2").is_multi_stmt);
    }

    #[test]
    fn test_create_temporary_table_recorded() {
        let c = classify("CREATE TEMPORARY TABLE scratch (a int)");
        assert_eq!(c.creates_temp_table.as_deref(), Some("scratch"));
        assert_eq!(c.target, Some(RouteTarget::Master));
    }

    #[test]
    fn test_select_from_temp_table_goes_to_master() {
        let mut temp = HashSet::new();
        temp.insert("scratch".to_string());
        let ctx = ClassifyContext {
            temp_tables: Some(&temp),
            ..Default::default()
        };

        let c = classify_with("SELECT * FROM scratch", &ctx);
        assert!(c.touches_temp_table);
        assert_eq!(c.target, Some(RouteTarget::Master));

        let c = classify_with("SELECT * FROM users", &ctx);
        assert!(!c.touches_temp_table);
        assert_eq!(c.target, Some(RouteTarget::Slave));
    }

    #[test]
    fn test_drop_table_reports_names() {
        let c = classify("DROP TABLE scratch, other");
        assert_eq!(c.dropped_tables, vec!["scratch", "other"]);
    }

    #[test]
    fn test_load_data_starts_stream() {
        let c = classify("LOAD DATA LOCAL INFILE '/tmp/x.csv' INTO TABLE t");
        assert!(c.starts_load_data);
        assert_eq!(c.target, Some(RouteTarget::Master));
    }

    #[test]
    fn test_load_data_stream_packets() {
        let classifier = QueryClassifier::new();
        let ctx = ClassifyContext {
            load_data_state: LoadDataState::Active,
            ..Default::default()
        };

        let data = classifier.classify(&Bytes::from_static(b"1,2,3\n"), &ctx);
        assert!(!data.ends_load_data);
        assert_eq!(data.target, Some(RouteTarget::Master));

        let end = classifier.classify(&Bytes::new(), &ctx);
        assert!(end.ends_load_data);
    }

    #[test]
    fn test_reads_in_transaction_go_to_master() {
        let ctx = ClassifyContext {
            in_transaction: true,
            ..Default::default()
        };
        let c = classify_with("SELECT 1", &ctx);
        assert_eq!(c.target, Some(RouteTarget::Master));
        assert!(c.is_read_only);
    }

    #[test]
    fn test_select_for_update_goes_to_master() {
        let c = classify("SELECT * FROM t WHERE id = 1 FOR UPDATE");
        assert!(!c.is_read_only);
        assert_eq!(c.target, Some(RouteTarget::Master));
    }

    #[test]
    fn test_show_goes_to_slave() {
        let c = classify("SHOW TABLES");
        assert!(c.is_read_only);
        assert_eq!(c.target, Some(RouteTarget::Slave));
    }
}
