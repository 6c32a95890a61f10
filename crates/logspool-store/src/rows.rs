// ABOUTME: SQLite-backed row store keyed by an auto-incrementing id, with versioned additive migrations.
// ABOUTME: Provides insert, filtered ordered scans, predicate deletes, counts, and whole-table clear.

use std::collections::HashMap;
use std::fs;
use std::ops::ControlFlow;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use thiserror::Error;

/// Name of the store-assigned primary key column.
pub const ID_COLUMN: &str = "oid";

/// Errors that can occur during row store operations.
#[derive(Debug, Error)]
pub enum RowStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to migrate schema from version {from} to {to}: {source}")]
    Migration {
        from: u32,
        to: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store schema version {found} is newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },

    #[error("unknown column '{0}'")]
    UnknownColumn(String),
}

/// A nullable text column and the schema version that introduced it.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub since: u32,
}

/// Table name, current schema version, and every column ever added.
/// Columns are never dropped or renamed; new versions only append.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub table: &'static str,
    pub version: u32,
    pub columns: &'static [ColumnDef],
}

impl TableSpec {
    /// The same table as it looked at an earlier schema version.
    pub fn at_version(&self, version: u32) -> TableSpec {
        TableSpec { version, ..*self }
    }

    fn columns_at(&self, version: u32) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(move |c| c.since <= version)
    }
}

/// Scan direction by row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    fn sql(self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

/// One stored row: its id and the value of every column present in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i64,
    values: HashMap<String, Option<String>>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }
}

/// A single-table SQLite store. Owns the database file and its schema version.
pub struct RowStore {
    conn: Connection,
    layout: TableSpec,
    /// Columns physically present, in select order.
    present: Vec<&'static str>,
}

impl RowStore {
    /// Open or create the store at the given path, creating parent directories
    /// and migrating an older schema in place.
    pub fn open(path: &Path, layout: TableSpec) -> Result<Self, RowStoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, layout)
    }

    /// Open a store that lives only in memory.
    pub fn open_in_memory(layout: TableSpec) -> Result<Self, RowStoreError> {
        Self::with_connection(Connection::open_in_memory()?, layout)
    }

    fn with_connection(mut conn: Connection, layout: TableSpec) -> Result<Self, RowStoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let exists = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![layout.table],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .is_some();

        if !exists {
            let columns: Vec<String> = layout
                .columns_at(layout.version)
                .map(|c| format!("{} TEXT", c.name))
                .collect();
            conn.execute_batch(&format!(
                "CREATE TABLE {} ({} INTEGER PRIMARY KEY AUTOINCREMENT, {});",
                layout.table,
                ID_COLUMN,
                columns.join(", ")
            ))?;
            conn.pragma_update(None, "user_version", layout.version)?;
            tracing::info!(table = layout.table, version = layout.version, "created row store");
        } else if found > layout.version {
            return Err(RowStoreError::NewerSchema {
                found,
                supported: layout.version,
            });
        } else if found < layout.version {
            // Stores that predate version tracking report 0; treat them as v1.
            Self::migrate(&mut conn, &layout, found.max(1))?;
        }

        let present = Self::present_columns(&conn, &layout)?;
        Ok(Self {
            conn,
            layout,
            present,
        })
    }

    /// Add every column introduced after `from`, in one transaction.
    /// Existing rows keep their values and read the new columns as null.
    fn migrate(conn: &mut Connection, layout: &TableSpec, from: u32) -> Result<(), RowStoreError> {
        let to = layout.version;
        let wrap = |source: rusqlite::Error| RowStoreError::Migration { from, to, source };

        let existing = Self::present_columns(conn, layout).map_err(|e| match e {
            RowStoreError::Sqlite(source) => wrap(source),
            other => other,
        })?;

        let tx = conn.transaction().map_err(wrap)?;
        for column in layout.columns.iter().filter(|c| c.since > from) {
            if existing.contains(&column.name) {
                continue;
            }
            tx.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT;",
                layout.table, column.name
            ))
            .map_err(wrap)?;
        }
        tx.pragma_update(None, "user_version", to).map_err(wrap)?;
        tx.commit().map_err(wrap)?;

        tracing::info!(table = layout.table, from, to, "migrated row store schema");
        Ok(())
    }

    fn present_columns(
        conn: &Connection,
        layout: &TableSpec,
    ) -> Result<Vec<&'static str>, RowStoreError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", layout.table))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;

        let mut on_disk = Vec::new();
        for name in names {
            on_disk.push(name?);
        }

        Ok(layout
            .columns
            .iter()
            .map(|c| c.name)
            .filter(|name| on_disk.iter().any(|n| n.as_str() == *name))
            .collect())
    }

    /// The schema version this store was opened at.
    pub fn version(&self) -> u32 {
        self.layout.version
    }

    fn column(&self, name: &str) -> Result<&'static str, RowStoreError> {
        if name == ID_COLUMN {
            return Ok(ID_COLUMN);
        }
        self.present
            .iter()
            .copied()
            .find(|c| *c == name)
            .ok_or_else(|| RowStoreError::UnknownColumn(name.to_string()))
    }

    /// Append a row and return its newly assigned id. Ids are never reused.
    pub fn insert(&self, values: &[(&str, Option<&str>)]) -> Result<i64, RowStoreError> {
        let mut names = Vec::with_capacity(values.len());
        for (name, _) in values {
            names.push(self.column(name)?);
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.layout.table,
                names.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter().map(|(_, v)| *v)),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Visit rows matching an optional equality filter, ordered by id.
    ///
    /// The cursor is held only while this call runs and is released on every
    /// exit path, including an early `ControlFlow::Break` from the visitor.
    pub fn scan<F>(
        &self,
        filter: Option<(&str, &str)>,
        order: Order,
        mut visit: F,
    ) -> Result<(), RowStoreError>
    where
        F: FnMut(Row) -> ControlFlow<()>,
    {
        let mut sql = format!(
            "SELECT {}, {} FROM {}",
            ID_COLUMN,
            self.present.join(", "),
            self.layout.table
        );
        let mut args: Vec<&str> = Vec::new();
        if let Some((column, value)) = filter {
            sql.push_str(&format!(" WHERE {} = ?1", self.column(column)?));
            args.push(value);
        }
        sql.push_str(&format!(" ORDER BY {} {}", ID_COLUMN, order.sql()));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args))?;
        while let Some(raw) = rows.next()? {
            let mut values = HashMap::with_capacity(self.present.len());
            for (i, name) in self.present.iter().enumerate() {
                values.insert(name.to_string(), raw.get::<_, Option<String>>(i + 1)?);
            }
            let row = Row {
                id: raw.get(0)?,
                values,
            };
            if visit(row).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Fetch the first row (lowest id) matching a column value.
    pub fn find(&self, column: &str, value: &str) -> Result<Option<Row>, RowStoreError> {
        let mut found = None;
        self.scan(Some((column, value)), Order::Ascending, |row| {
            found = Some(row);
            ControlFlow::Break(())
        })?;
        Ok(found)
    }

    pub fn get(&self, id: i64) -> Result<Option<Row>, RowStoreError> {
        self.find(ID_COLUMN, &id.to_string())
    }

    /// The lowest id in the table, if any rows exist.
    pub fn oldest(&self) -> Result<Option<Row>, RowStoreError> {
        let mut found = None;
        self.scan(None, Order::Ascending, |row| {
            found = Some(row);
            ControlFlow::Break(())
        })?;
        Ok(found)
    }

    /// Overwrite one column of one row.
    pub fn update(&self, id: i64, column: &str, value: Option<&str>) -> Result<(), RowStoreError> {
        let column = self.column(column)?;
        self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                self.layout.table, column, ID_COLUMN
            ),
            params![value, id],
        )?;
        Ok(())
    }

    /// Delete a row by id. Returns whether a row was removed.
    pub fn delete(&self, id: i64) -> Result<bool, RowStoreError> {
        let removed = self.conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", self.layout.table, ID_COLUMN),
            params![id],
        )?;
        Ok(removed > 0)
    }

    /// Delete every row whose column equals the value. Returns the number removed.
    pub fn delete_where(&self, column: &str, value: &str) -> Result<usize, RowStoreError> {
        let column = self.column(column)?;
        Ok(self.conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", self.layout.table, column),
            params![value],
        )?)
    }

    /// Count rows, optionally restricted to a column value.
    pub fn count(&self, filter: Option<(&str, &str)>) -> Result<usize, RowStoreError> {
        let count: i64 = match filter {
            Some((column, value)) => self.conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                    self.layout.table,
                    self.column(column)?
                ),
                params![value],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", self.layout.table),
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }

    /// Distinct non-null values of a column, sorted.
    pub fn distinct(&self, column: &str) -> Result<Vec<String>, RowStoreError> {
        let column = self.column(column)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT {0} FROM {1} WHERE {0} IS NOT NULL ORDER BY {0}",
            column, self.layout.table
        ))?;
        let values = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for value in values {
            out.push(value?);
        }
        Ok(out)
    }

    /// Remove all rows. Ids keep increasing afterwards.
    pub fn clear(&self) -> Result<(), RowStoreError> {
        self.conn
            .execute(&format!("DELETE FROM {}", self.layout.table), [])?;
        Ok(())
    }

    /// Close the underlying connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<(), RowStoreError> {
        self.conn.close().map_err(|(_, e)| RowStoreError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const COLUMNS: &[ColumnDef] = &[
        ColumnDef { name: "grp", since: 1 },
        ColumnDef { name: "body", since: 1 },
        ColumnDef { name: "tag", since: 2 },
    ];

    const ITEMS: TableSpec = TableSpec {
        table: "items",
        version: 2,
        columns: COLUMNS,
    };

    fn collect(store: &RowStore, filter: Option<(&str, &str)>, order: Order) -> Vec<i64> {
        let mut ids = Vec::new();
        store
            .scan(filter, order, |row| {
                ids.push(row.id);
                ControlFlow::Continue(())
            })
            .unwrap();
        ids
    }

    #[test]
    fn insert_scan_and_count() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();

        let a = store.insert(&[("grp", Some("a")), ("body", Some("1"))]).unwrap();
        let b = store.insert(&[("grp", Some("b")), ("body", Some("2"))]).unwrap();
        let c = store.insert(&[("grp", Some("a")), ("body", Some("3"))]).unwrap();
        assert!(a < b && b < c);

        assert_eq!(collect(&store, Some(("grp", "a")), Order::Ascending), vec![a, c]);
        assert_eq!(collect(&store, Some(("grp", "a")), Order::Descending), vec![c, a]);
        assert_eq!(collect(&store, None, Order::Ascending), vec![a, b, c]);

        assert_eq!(store.count(None).unwrap(), 3);
        assert_eq!(store.count(Some(("grp", "a"))).unwrap(), 2);
        assert_eq!(store.count(Some(("grp", "zzz"))).unwrap(), 0);

        let row = store.get(b).unwrap().expect("row b");
        assert_eq!(row.get("body"), Some("2"));
        assert_eq!(row.get("tag"), None);
    }

    #[test]
    fn scan_stops_early() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();
        for i in 0..5 {
            store
                .insert(&[("grp", Some("g")), ("body", Some(i.to_string().as_str()))])
                .unwrap();
        }

        let mut seen = 0;
        store
            .scan(None, Order::Ascending, |_| {
                seen += 1;
                if seen == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, 2);

        // The connection is usable for writes once the scan returns.
        store.clear().unwrap();
        assert_eq!(store.count(None).unwrap(), 0);
    }

    #[test]
    fn delete_variants_are_noops_when_nothing_matches() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();
        let id = store.insert(&[("grp", Some("g"))]).unwrap();

        assert!(!store.delete(id + 100).unwrap());
        assert_eq!(store.delete_where("grp", "other").unwrap(), 0);

        assert!(store.delete(id).unwrap());
        assert_eq!(store.count(None).unwrap(), 0);
    }

    #[test]
    fn ids_are_not_reused_after_clear() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();
        let first = store.insert(&[("grp", Some("g"))]).unwrap();
        store.clear().unwrap();
        let second = store.insert(&[("grp", Some("g"))]).unwrap();
        assert!(second > first);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();
        let err = store.insert(&[("nope", Some("x"))]).unwrap_err();
        assert!(matches!(err, RowStoreError::UnknownColumn(c) if c == "nope"));
    }

    #[test]
    fn oldest_update_and_distinct() {
        let store = RowStore::open_in_memory(ITEMS).unwrap();
        assert!(store.oldest().unwrap().is_none());

        let first = store.insert(&[("grp", Some("b"))]).unwrap();
        store.insert(&[("grp", Some("a"))]).unwrap();
        store.insert(&[("grp", Some("b"))]).unwrap();

        assert_eq!(store.oldest().unwrap().unwrap().id, first);
        assert_eq!(store.distinct("grp").unwrap(), vec!["a", "b"]);

        store.update(first, "tag", Some("t")).unwrap();
        assert_eq!(store.get(first).unwrap().unwrap().get("tag"), Some("t"));
    }

    #[test]
    fn migrates_older_schema_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("items.db");

        let old = RowStore::open(&path, ITEMS.at_version(1)).unwrap();
        assert_eq!(old.version(), 1);
        let legacy = old.insert(&[("grp", Some("g")), ("body", Some("old"))]).unwrap();
        assert!(matches!(
            old.insert(&[("tag", Some("x"))]),
            Err(RowStoreError::UnknownColumn(_))
        ));
        old.close().unwrap();

        let store = RowStore::open(&path, ITEMS).unwrap();
        assert_eq!(store.version(), 2);

        let row = store.get(legacy).unwrap().expect("legacy row survives");
        assert_eq!(row.get("body"), Some("old"));
        assert_eq!(row.get("tag"), None);

        let fresh = store
            .insert(&[("grp", Some("g")), ("body", Some("new")), ("tag", Some("t"))])
            .unwrap();
        assert!(fresh > legacy);
        store.close().unwrap();

        // Reopening at the current version is a no-op.
        let again = RowStore::open(&path, ITEMS).unwrap();
        assert_eq!(again.count(None).unwrap(), 2);
    }

    #[test]
    fn refuses_newer_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.db");

        RowStore::open(&path, ITEMS.at_version(3)).unwrap().close().unwrap();

        let err = RowStore::open(&path, ITEMS).err().expect("should refuse");
        assert!(matches!(
            err,
            RowStoreError::NewerSchema { found: 3, supported: 2 }
        ));
    }
}
