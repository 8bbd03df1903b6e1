//! SQLite persistence for finished result sets.

use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::task;

use crate::error::{GraphError, Result};
use crate::traversal::ResultSet;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS resources (
    id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    key TEXT NOT NULL,
    resource JSON NOT NULL,
    PRIMARY KEY (id, resource_type)
);
CREATE INDEX IF NOT EXISTS idx_resources_type ON resources(resource_type);";

/// Resource table wrapper; each call opens its own connection
pub struct ResourceDb {
    path: PathBuf,
}

impl ResourceDb {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the database file is already there and a save will merge into it
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Execute a closure with a connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            // WAL so a summarize can read while a run is still writing
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; \
                 PRAGMA synchronous = NORMAL; \
                 PRAGMA temp_store = MEMORY;",
            )?;
            conn.execute_batch(SCHEMA)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GraphError::Io(std::io::Error::other(e)))?
    }

    /// Store every resource in `result_set`; rows already present are kept.
    /// Returns the number of rows inserted.
    pub async fn save_result_set(&self, result_set: &ResultSet) -> Result<usize> {
        let rows: Vec<(String, String, String, String)> = result_set
            .iter()
            .map(|(reference, document)| {
                Ok((
                    reference.id.clone(),
                    reference.resource_type.clone(),
                    reference.to_string(),
                    serde_json::to_string(document)?,
                ))
            })
            .collect::<Result<_>>()?;

        let inserted = self
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO resources (id, resource_type, key, resource) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (id, resource_type, key, resource) in &rows {
                        inserted += stmt.execute(params![id, resource_type, key, resource])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;

        log::info!("Saved {} new resource(s) to {}", inserted, self.path.display());
        Ok(inserted)
    }

    pub async fn count_resource_types(&self) -> Result<BTreeMap<String, usize>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT resource_type, COUNT(*) FROM resources GROUP BY resource_type")?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
            Ok(counts)
        })
        .await
    }

    /// Every stored resource of one type, ordered by id
    pub async fn all_resources(&self, resource_type: &str) -> Result<Vec<Value>> {
        let resource_type = resource_type.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT resource FROM resources WHERE resource_type = ?1 ORDER BY id")?;
            let raw = stmt
                .query_map([&resource_type], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            raw.iter()
                .map(|s| serde_json::from_str(s).map_err(GraphError::from))
                .collect()
        })
        .await
    }

    /// Rebuild a result set from everything stored
    pub async fn load_result_set(&self) -> Result<ResultSet> {
        let raw = self
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT resource FROM resources ORDER BY resource_type, id")?;
                let raw = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(raw)
            })
            .await?;

        let mut result_set = ResultSet::new();
        for s in raw {
            result_set.insert(serde_json::from_str(&s)?);
        }
        Ok(result_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::ResourceRef;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> ResultSet {
        let mut rs = ResultSet::new();
        rs.insert(json!({"resourceType": "Patient", "id": "1"}));
        rs.insert(json!({"resourceType": "Specimen", "id": "b", "subject": {"reference": "Patient/1"}}));
        rs.insert(json!({"resourceType": "Specimen", "id": "a", "subject": {"reference": "Patient/1"}}));
        rs
    }

    #[tokio::test]
    async fn test_save_and_count() {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::new(temp_dir.path().join("graph.sqlite"));
        assert!(!db.exists());

        assert_eq!(db.save_result_set(&sample()).await.unwrap(), 3);
        assert!(db.exists());
        // second save ignores rows already stored
        assert_eq!(db.save_result_set(&sample()).await.unwrap(), 0);

        let counts = db.count_resource_types().await.unwrap();
        assert_eq!(counts.get("Patient"), Some(&1));
        assert_eq!(counts.get("Specimen"), Some(&2));
    }

    #[tokio::test]
    async fn test_all_resources_by_type() {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::new(temp_dir.path().join("graph.sqlite"));
        db.save_result_set(&sample()).await.unwrap();

        let specimens = db.all_resources("Specimen").await.unwrap();
        let ids: Vec<_> = specimens.iter().map(|s| s["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(db.all_resources("Condition").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_result_set_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::new(temp_dir.path().join("graph.sqlite"));
        let original = sample();
        db.save_result_set(&original).await.unwrap();

        let loaded = db.load_result_set().await.unwrap();
        assert_eq!(loaded.sorted_refs(), original.sorted_refs());
        assert_eq!(
            loaded.get(&ResourceRef::new("Specimen", "a")),
            original.get(&ResourceRef::new("Specimen", "a"))
        );
    }

    #[tokio::test]
    async fn test_wal_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = ResourceDb::new(temp_dir.path().join("graph.sqlite"));
        let mode = db
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))?))
            .await
            .unwrap();
        assert_eq!(mode.to_uppercase(), "WAL");
    }
}
