//! SQLite-backed [`MetadataStore`].

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use vmlet_shared::errors::{VmletError, VmletResult};

use super::types::{ContainerFilter, ContainerRecord, PodSandboxRecord, SandboxFilter};
use super::{MetadataStore, UpdateFn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sandboxes (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    data        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS containers (
    id          TEXT PRIMARY KEY,
    sandbox_id  TEXT NOT NULL,
    state       TEXT NOT NULL,
    image       TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_containers_sandbox ON containers(sandbox_id);
";

fn db_err(e: rusqlite::Error) -> VmletError {
    VmletError::Database(e.to_string())
}

fn decode<T: DeserializeOwned>(id: &str, data: &str) -> VmletResult<T> {
    serde_json::from_str(data)
        .map_err(|e| VmletError::Database(format!("corrupt record {:?}: {}", id, e)))
}

fn encode<T: Serialize>(record: &T) -> VmletResult<String> {
    Ok(serde_json::to_string(record)?)
}

fn check_id(expected: &str, got: &str) -> VmletResult<()> {
    if expected != got {
        return Err(VmletError::InvalidArgument(format!(
            "record id {:?} does not match key {:?}",
            got, expected
        )));
    }
    Ok(())
}

/// Metadata store in a single SQLite file.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> VmletResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VmletError::Storage(format!("can't create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            VmletError::Database(format!("can't open {}: {}", path.display(), e))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> VmletResult<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> VmletResult<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load<T: DeserializeOwned>(conn: &Connection, sql: &str, id: &str) -> VmletResult<Option<T>> {
        let data: Option<String> = conn
            .query_row(sql, params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        data.map(|d| decode(id, &d)).transpose()
    }

    fn load_all<T: DeserializeOwned>(conn: &Connection, sql: &str) -> VmletResult<Vec<T>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, data) = row.map_err(db_err)?;
            out.push(decode(&id, &data)?);
        }
        Ok(out)
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn sandbox(&self, id: &str) -> VmletResult<Option<PodSandboxRecord>> {
        let conn = self.conn.lock();
        Self::load(&conn, "SELECT data FROM sandboxes WHERE id = ?1", id)
    }

    fn update_sandbox(
        &self,
        id: &str,
        f: UpdateFn<'_, PodSandboxRecord>,
    ) -> VmletResult<Option<PodSandboxRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = Self::load(&tx, "SELECT data FROM sandboxes WHERE id = ?1", id)?;
        let next = f(current)?;
        match &next {
            Some(record) => {
                check_id(id, &record.id)?;
                tx.execute(
                    "INSERT OR REPLACE INTO sandboxes (id, state, created_at, data) VALUES (?1, ?2, ?3, ?4)",
                    params![id, record.state, record.created_at, encode(record)?],
                )
                .map_err(db_err)?;
            }
            None => {
                tx.execute("DELETE FROM sandboxes WHERE id = ?1", params![id])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        tracing::trace!(sandbox_id = %id, deleted = next.is_none(), "Sandbox record updated");
        Ok(next)
    }

    fn list_sandboxes(&self, filter: &SandboxFilter) -> VmletResult<Vec<PodSandboxRecord>> {
        let conn = self.conn.lock();
        let all: Vec<PodSandboxRecord> = match &filter.id {
            Some(id) => Self::load(&conn, "SELECT data FROM sandboxes WHERE id = ?1", id)?
                .into_iter()
                .collect(),
            None => Self::load_all(&conn, "SELECT id, data FROM sandboxes ORDER BY created_at")?,
        };
        Ok(all.into_iter().filter(|r| filter.matches(r)).collect())
    }

    fn container(&self, id: &str) -> VmletResult<Option<ContainerRecord>> {
        let conn = self.conn.lock();
        Self::load(&conn, "SELECT data FROM containers WHERE id = ?1", id)
    }

    fn update_container(
        &self,
        id: &str,
        f: UpdateFn<'_, ContainerRecord>,
    ) -> VmletResult<Option<ContainerRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = Self::load(&tx, "SELECT data FROM containers WHERE id = ?1", id)?;
        let next = f(current)?;
        match &next {
            Some(record) => {
                check_id(id, &record.id)?;
                tx.execute(
                    "INSERT OR REPLACE INTO containers (id, sandbox_id, state, image, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, record.sandbox_id, record.state, record.image, encode(record)?],
                )
                .map_err(db_err)?;
            }
            None => {
                tx.execute("DELETE FROM containers WHERE id = ?1", params![id])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        tracing::trace!(container_id = %id, deleted = next.is_none(), "Container record updated");
        Ok(next)
    }

    fn list_containers(&self, filter: &ContainerFilter) -> VmletResult<Vec<ContainerRecord>> {
        let conn = self.conn.lock();
        let all: Vec<ContainerRecord> = match &filter.sandbox_id {
            Some(sandbox_id) => {
                let mut stmt = conn
                    .prepare("SELECT id, data FROM containers WHERE sandbox_id = ?1 ORDER BY id")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![sandbox_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(db_err)?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, data) = row.map_err(db_err)?;
                    out.push(decode(&id, &data)?);
                }
                out
            }
            None => Self::load_all(&conn, "SELECT id, data FROM containers ORDER BY id")?,
        };
        Ok(all.into_iter().filter(|r| filter.matches(r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::types::{ContainerState, PodSandboxConfig, SandboxState};

    fn sandbox(id: &str) -> PodSandboxRecord {
        PodSandboxRecord::new(id, PodSandboxConfig::default(), SandboxState::Ready, None)
    }

    fn container(id: &str, sandbox_id: &str, image: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.into(),
            sandbox_id: sandbox_id.into(),
            name: "vm".into(),
            attempt: 0,
            image: image.into(),
            state: ContainerState::Created,
            created_at: 1,
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            labels: Default::default(),
            annotations: Default::default(),
        }
    }

    #[test]
    fn test_sandbox_read_modify_write() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        assert!(store.sandbox("a").unwrap().is_none());

        store
            .update_sandbox("a", Box::new(|cur| {
                assert!(cur.is_none());
                Ok(Some(sandbox("a")))
            }))
            .unwrap();
        assert_eq!(store.sandbox("a").unwrap().unwrap().state, SandboxState::Ready);

        let stored = store
            .update_sandbox("a", Box::new(|cur| {
                Ok(cur.map(|mut r| {
                    r.state = SandboxState::NotReady;
                    r
                }))
            }))
            .unwrap();
        assert_eq!(stored.unwrap().state, SandboxState::NotReady);

        store.update_sandbox("a", Box::new(|_| Ok(None))).unwrap();
        assert!(store.sandbox("a").unwrap().is_none());
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        store
            .update_sandbox("a", Box::new(|_| Ok(Some(sandbox("a")))))
            .unwrap();

        let err = store.update_sandbox(
            "a",
            Box::new(|_| Err(VmletError::InvalidState("nope".into()))),
        );
        assert!(err.is_err());
        assert!(store.sandbox("a").unwrap().is_some());

        let err = store.update_sandbox("a", Box::new(|_| Ok(Some(sandbox("b")))));
        assert!(matches!(err, Err(VmletError::InvalidArgument(_))));
        assert!(store.sandbox("b").unwrap().is_none());
    }

    #[test]
    fn test_list_with_filters() {
        let store = SqliteMetadataStore::open_in_memory().unwrap();
        for id in ["a", "b"] {
            store
                .update_sandbox(id, Box::new(move |_| Ok(Some(sandbox(id)))))
                .unwrap();
        }
        store
            .update_sandbox("b", Box::new(|cur| {
                Ok(cur.map(|mut r| {
                    r.state = SandboxState::NotReady;
                    r
                }))
            }))
            .unwrap();

        assert_eq!(store.list_sandboxes(&SandboxFilter::default()).unwrap().len(), 2);
        let ready = store
            .list_sandboxes(&SandboxFilter {
                state: Some(SandboxState::Ready),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");

        for (id, sb, image) in [("c1", "a", "cirros"), ("c2", "b", "ubuntu")] {
            store
                .update_container(id, Box::new(move |_| Ok(Some(container(id, sb, image)))))
                .unwrap();
        }
        let in_a = store.list_containers(&ContainerFilter::for_sandbox("a")).unwrap();
        assert_eq!(in_a.len(), 1);
        assert_eq!(in_a[0].id, "c1");

        let images = store.images_in_use().unwrap();
        assert!(images.contains("cirros") && images.contains("ubuntu"));
    }

    #[test]
    fn test_reopen_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("vmlet.db");
        {
            let store = SqliteMetadataStore::open(&path).unwrap();
            store
                .update_sandbox("a", Box::new(|_| Ok(Some(sandbox("a")))))
                .unwrap();
        }
        let store = SqliteMetadataStore::open(&path).unwrap();
        assert!(store.sandbox("a").unwrap().is_some());
    }
}
