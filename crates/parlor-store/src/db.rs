//! SQLite durability for the store tree.
//!
//! The tree is kept as flattened leaf rows (`path -> json`), so a multi-path
//! write becomes a single SQLite transaction.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, Transaction};
use serde_json::{Value, json};
use tracing::{debug, info};

use parlor_types::paths;

use crate::tree;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrate(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        f(&mut conn)
    }

    /// Apply a batch of path writes in one transaction. `None` deletes.
    pub fn apply(&self, changes: &[(String, Option<Value>)]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for (path, value) in changes {
                clear_subtree(&tx, path)?;
                clear_ancestors(&tx, path)?;

                if let Some(value) = value {
                    let mut leaves = Vec::new();
                    tree::flatten(path, value, &mut leaves);
                    for (leaf_path, leaf) in leaves {
                        tx.execute(
                            "INSERT OR REPLACE INTO nodes (path, value) VALUES (?1, ?2)",
                            (leaf_path, serde_json::to_string(&leaf)?),
                        )?;
                    }
                }
            }
            tx.commit()?;
            debug!("Persisted {} path writes", changes.len());
            Ok(())
        })
    }

    /// Rebuild the full tree from the stored leaves.
    pub fn load_tree(&self) -> Result<Value> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path, value FROM nodes")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut root = json!({});
        for (path, raw) in &rows {
            let value: Value = serde_json::from_str(raw)?;
            tree::set(&mut root, path, value);
        }

        info!("Loaded {} stored leaves", rows.len());
        Ok(root)
    }

    pub fn leaf_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS nodes (
            path        TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

fn clear_subtree(tx: &Transaction<'_>, path: &str) -> Result<()> {
    // substr() instead of LIKE: keys may contain '_' and '%'
    let prefix = format!("{}/", path);
    tx.execute(
        "DELETE FROM nodes WHERE path = ?1 OR substr(path, 1, ?2) = ?3",
        (path, prefix.chars().count() as i64, &prefix),
    )?;
    Ok(())
}

fn clear_ancestors(tx: &Transaction<'_>, path: &str) -> Result<()> {
    let segments: Vec<&str> = paths::segments(path).collect();
    for depth in 1..segments.len() {
        tx.execute("DELETE FROM nodes WHERE path = ?1", [segments[..depth].join("/")])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parlor.db");

        {
            let db = Database::open(&path).unwrap();
            db.apply(&[
                ("Channels/general/name".into(), Some(json!("general"))),
                (
                    "Channels/general/rooms/welcome".into(),
                    Some(json!({ "name": "welcome" })),
                ),
                ("users/u_1/channels/general".into(), Some(json!("member"))),
            ])
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let root = db.load_tree().unwrap();
        assert_eq!(
            tree::get(&root, "Channels/general/rooms/welcome/name"),
            Some(json!("welcome"))
        );
        assert_eq!(tree::get(&root, "users/u_1/channels/general"), Some(json!("member")));
    }

    #[test]
    fn delete_removes_descendants_but_not_lookalikes() {
        let db = Database::open_in_memory().unwrap();
        db.apply(&[
            ("users/u_1/unread_rooms/c/r1".into(), Some(json!(true))),
            ("users/u_1/unread_rooms/c/r2".into(), Some(json!(true))),
            ("users/uX1/unread_rooms/c/r1".into(), Some(json!(true))),
        ])
        .unwrap();

        db.apply(&[("users/u_1/unread_rooms".into(), None)]).unwrap();

        assert_eq!(db.leaf_count().unwrap(), 1);
        let root = db.load_tree().unwrap();
        assert!(tree::get(&root, "users/uX1/unread_rooms/c/r1").is_some());
    }

    #[test]
    fn writing_below_a_leaf_drops_the_leaf() {
        let db = Database::open_in_memory().unwrap();
        db.apply(&[("a/b".into(), Some(json!("leaf")))]).unwrap();
        db.apply(&[("a/b/c".into(), Some(json!(1)))]).unwrap();

        let root = db.load_tree().unwrap();
        assert_eq!(tree::get(&root, "a"), Some(json!({ "b": { "c": 1 } })));
    }
}
