use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;

impl Database {
    /// Insert or replace, last write wins.
    pub async fn put_object(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO objects (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to store object {key}"))?;
            Ok(())
        })
        .await
    }

    pub async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let object: Option<String> = conn
                .query_row(
                    "SELECT value FROM objects WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed to load object {key}"))?;
            Ok(object)
        })
        .await
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM objects WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete object {key}"))?;
            Ok(())
        })
        .await
    }

    pub async fn object_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM objects
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key ASC",
            )?;
            let mut rows = stmt.query(params![prefix])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                keys.push(row.get::<_, String>(0)?);
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("objects.sqlite3")).expect("open");

        db.put_object("ks:progress:p-1", "{\"a\":1}").await.expect("put");
        db.put_object("ks:progress:p-1", "{\"a\":2}").await.expect("overwrite");
        db.put_object("ks:summary:b-1", "{}").await.expect("put");

        let stored = db.get_object("ks:progress:p-1").await.expect("get");
        assert_eq!(stored, Some("{\"a\":2}".to_string()));
        assert_eq!(
            db.object_keys("ks:progress:").await.expect("keys"),
            vec!["ks:progress:p-1".to_string()]
        );

        db.delete_object("ks:progress:p-1").await.expect("delete");
        assert!(db.get_object("ks:progress:p-1").await.expect("get").is_none());
    }
}
