//! Masking filter integration tests.
//!
//! These expect hermes to be configured with a rules file masking
//! `it_mask_people.ssn` with value "XXXXXXXXX" / fill "X".

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_TABLE: &str = "it_mask_people";

fn setup_table(conn: &mut mysql::Conn) {
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS {} (name VARCHAR(32), ssn VARCHAR(16))",
        TEST_TABLE
    ))
    .expect("CREATE TABLE should succeed");
    conn.query_drop(format!("DELETE FROM {}", TEST_TABLE))
        .expect("cleanup should succeed");
    conn.query_drop(format!(
        "INSERT INTO {} (name, ssn) VALUES ('alice', '123456789'), ('bob', '42')",
        TEST_TABLE
    ))
    .expect("INSERT should succeed");
}

#[test]
fn test_masked_column_is_rewritten() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup_table(&mut conn);

    let rows: Vec<(String, String)> = conn
        .query(format!("SELECT name, ssn FROM {} ORDER BY name", TEST_TABLE))
        .expect("SELECT should succeed");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "alice");
    assert_eq!(rows[0].1, "XXXXXXXXX");
    // Fill is tiled when the value length does not match
    assert_eq!(rows[1].1, "XX");
}

#[test]
fn test_unmasked_column_passes_through() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();
    setup_table(&mut conn);

    let names: Vec<String> = conn
        .query(format!("SELECT name FROM {} ORDER BY name", TEST_TABLE))
        .expect("SELECT should succeed");
    assert_eq!(names, vec!["alice", "bob"]);
}
