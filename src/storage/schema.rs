use rusqlite::Connection;
use serde::Serialize;

/// Optional schema features, probed once when the engine opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchemaCapabilities {
    /// `repositories.is_fork` exists.
    pub has_fork_column: bool,
}

/// Column names of `table`, in declaration order. Empty if the table is missing.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| row.get(0))?;
    rows.collect()
}

pub fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    Ok(table_columns(conn, table)?
        .iter()
        .any(|c| c.eq_ignore_ascii_case(column)))
}

pub fn probe_capabilities(conn: &Connection) -> Result<SchemaCapabilities, rusqlite::Error> {
    Ok(SchemaCapabilities {
        has_fork_column: has_column(conn, "repositories", "is_fork")?,
    })
}
