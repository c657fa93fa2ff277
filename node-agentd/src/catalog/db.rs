use std::collections::HashMap;
use std::path::Path;
use anyhow::{Context, Result};
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{HealthCheck, Node, NodeService, RaftIndex};

/// SQLite storage for the development catalog.
pub struct CatalogDb {
    conn: Connection,
}

impl CatalogDb {
    /// Open or create the catalog database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path != Path::new(":memory:") {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node             TEXT PRIMARY KEY,
                id               TEXT NOT NULL,
                address          TEXT NOT NULL,
                datacenter       TEXT NOT NULL,
                tagged_addresses TEXT NOT NULL,
                meta             TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS services (
                node          TEXT NOT NULL,
                id            TEXT NOT NULL,
                body          TEXT NOT NULL,
                create_index  INTEGER NOT NULL,
                modify_index  INTEGER NOT NULL,
                PRIMARY KEY (node, id)
            );

            CREATE TABLE IF NOT EXISTS checks (
                node          TEXT NOT NULL,
                id            TEXT NOT NULL,
                body          TEXT NOT NULL,
                create_index  INTEGER NOT NULL,
                modify_index  INTEGER NOT NULL,
                PRIMARY KEY (node, id)
            );

            CREATE TABLE IF NOT EXISTS meta (
                key    TEXT PRIMARY KEY,
                value  INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Allocates the next write index
    fn next_index(&self) -> Result<u64> {
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES ('index', 1)
                 ON CONFLICT(key) DO UPDATE SET value = value + 1",
                [],
            )
            .context("Failed to bump catalog index")?;

        let index: i64 = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'index'", [], |row| row.get(0))
            .context("Failed to read catalog index")?;
        Ok(index as u64)
    }

    /// Insert or update a node. Returns true if the node is new.
    pub fn upsert_node(&self, node: &Node) -> Result<bool> {
        let existed = self.get_node(&node.node)?.is_some();

        let tagged_json = serde_json::to_string(&node.tagged_addresses)
            .context("Failed to serialize tagged addresses")?;
        let meta_json = serde_json::to_string(&node.meta)
            .context("Failed to serialize node meta")?;

        self.conn.execute(
            r#"
            INSERT INTO nodes (node, id, address, datacenter, tagged_addresses, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(node) DO UPDATE SET
                id = excluded.id,
                address = excluded.address,
                datacenter = excluded.datacenter,
                tagged_addresses = excluded.tagged_addresses,
                meta = excluded.meta
            "#,
            params![
                &node.node,
                &node.id,
                &node.address,
                &node.datacenter,
                &tagged_json,
                &meta_json,
            ],
        )
        .context("Failed to upsert node")?;

        Ok(!existed)
    }

    pub fn get_node(&self, node: &str) -> Result<Option<Node>> {
        self.conn
            .query_row(
                "SELECT node, id, address, datacenter, tagged_addresses, meta
                 FROM nodes WHERE node = ?1",
                params![node],
                |row| Self::row_to_node(row),
            )
            .optional()
            .context("Failed to query node")
    }

    pub fn count_nodes(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .context("Failed to count nodes")?;
        Ok(count as usize)
    }

    /// Insert or update a service on a node. Keeps its create index.
    pub fn upsert_service(&self, node: &str, service: &NodeService) -> Result<()> {
        let index = self.next_index()?;
        let body = serde_json::to_string(service).context("Failed to serialize service")?;

        self.conn.execute(
            r#"
            INSERT INTO services (node, id, body, create_index, modify_index)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(node, id) DO UPDATE SET
                body = excluded.body,
                modify_index = excluded.modify_index
            "#,
            params![node, &service.id, &body, index as i64],
        )
        .context("Failed to upsert service")?;
        Ok(())
    }

    /// Remove a service and the checks attached to it. Returns false if the
    /// service was not registered.
    pub fn delete_service(&self, node: &str, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM services WHERE node = ?1 AND id = ?2", params![node, id])
            .context("Failed to delete service")?;

        let checks: Vec<String> = self
            .get_checks(node)?
            .into_iter()
            .filter(|check| check.service_id == id)
            .map(|check| check.check_id)
            .collect();
        for check_id in checks {
            self.delete_check(node, &check_id)?;
        }

        Ok(removed > 0)
    }

    pub fn get_services(&self, node: &str) -> Result<HashMap<String, NodeService>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body, create_index, modify_index
                 FROM services WHERE node = ?1"
            )
            .context("Failed to prepare query")?;

        let services = stmt
            .query_map([node], |row| {
                let mut service: NodeService = Self::decode_body(row)?;
                service.raft_index = Self::row_to_index(row)?;
                Ok(service)
            })
            .context("Failed to query services")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect services")?;

        Ok(services.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    /// Insert or update a check on a node. Keeps its create index.
    pub fn upsert_check(&self, node: &str, check: &HealthCheck) -> Result<()> {
        let index = self.next_index()?;
        let body = serde_json::to_string(check).context("Failed to serialize check")?;

        self.conn.execute(
            r#"
            INSERT INTO checks (node, id, body, create_index, modify_index)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(node, id) DO UPDATE SET
                body = excluded.body,
                modify_index = excluded.modify_index
            "#,
            params![node, &check.check_id, &body, index as i64],
        )
        .context("Failed to upsert check")?;
        Ok(())
    }

    /// Returns false if the check was not registered.
    pub fn delete_check(&self, node: &str, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM checks WHERE node = ?1 AND id = ?2", params![node, id])
            .context("Failed to delete check")?;
        Ok(removed > 0)
    }

    pub fn get_checks(&self, node: &str) -> Result<Vec<HealthCheck>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body, create_index, modify_index
                 FROM checks WHERE node = ?1 ORDER BY id"
            )
            .context("Failed to prepare query")?;

        let checks = stmt
            .query_map([node], |row| {
                let mut check: HealthCheck = Self::decode_body(row)?;
                check.raft_index = Self::row_to_index(row)?;
                Ok(check)
            })
            .context("Failed to query checks")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect checks")?;

        Ok(checks)
    }

    fn decode_body<T: serde::de::DeserializeOwned>(row: &rusqlite::Row) -> Result<T, rusqlite::Error> {
        let body: String = row.get(0)?;
        serde_json::from_str(&body).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    }

    fn row_to_index(row: &rusqlite::Row) -> Result<RaftIndex, rusqlite::Error> {
        Ok(RaftIndex {
            create_index: row.get::<_, i64>(1)? as u64,
            modify_index: row.get::<_, i64>(2)? as u64,
        })
    }

    fn row_to_node(row: &rusqlite::Row) -> Result<Node, rusqlite::Error> {
        let tagged_json: String = row.get(4)?;
        let meta_json: String = row.get(5)?;

        let tagged_addresses = serde_json::from_str(&tagged_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        let meta = serde_json::from_str(&meta_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        Ok(Node {
            node: row.get(0)?,
            id: row.get(1)?,
            address: row.get(2)?,
            datacenter: row.get(3)?,
            tagged_addresses,
            meta,
        })
    }
}
