use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::package::{DownloadPackage, PackageId};

#[cfg(feature = "sqlite")]
use rusqlite::params;

/// Durable home for packages between process runs.
pub trait PackageStore: Send + Sync {
    fn save_package(&mut self, package: &DownloadPackage) -> CoreResult<()>;
    fn load_package(&self, id: &PackageId) -> CoreResult<DownloadPackage>;
    fn list_packages(&self) -> CoreResult<Vec<DownloadPackage>>;
    fn delete_package(&mut self, id: &PackageId) -> CoreResult<()>;
}

/// Keeps packages in their serialized form, so a load behaves like a restart.
#[derive(Default)]
pub struct MemoryPackageStore {
    packages: HashMap<PackageId, String>,
}

impl PackageStore for MemoryPackageStore {
    fn save_package(&mut self, package: &DownloadPackage) -> CoreResult<()> {
        self.packages.insert(package.id, package.to_json()?);
        Ok(())
    }

    fn load_package(&self, id: &PackageId) -> CoreResult<DownloadPackage> {
        let json = self
            .packages
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        DownloadPackage::from_json(json)
    }

    fn list_packages(&self) -> CoreResult<Vec<DownloadPackage>> {
        self.packages
            .values()
            .map(|json| DownloadPackage::from_json(json))
            .collect()
    }

    fn delete_package(&mut self, id: &PackageId) -> CoreResult<()> {
        self.packages.remove(id);
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub struct SqlitePackageStore {
    pub path: String,
}

#[cfg(feature = "sqlite")]
fn sql_err(err: rusqlite::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

#[cfg(feature = "sqlite")]
fn json_err(err: serde_json::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

#[cfg(feature = "sqlite")]
impl SqlitePackageStore {
    pub fn new(path: impl Into<String>) -> CoreResult<Self> {
        let store = Self { path: path.into() };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(sql_err)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS packages (
                id TEXT PRIMARY KEY,
                urls TEXT NOT NULL,
                file_name TEXT,
                status TEXT NOT NULL,
                total_file_size INTEGER NOT NULL DEFAULT 0,
                received_bytes_size INTEGER NOT NULL DEFAULT 0,
                supports_range INTEGER NOT NULL DEFAULT 0,
                in_memory INTEGER NOT NULL DEFAULT 0,
                is_save_complete INTEGER NOT NULL DEFAULT 0,
                save_progress REAL NOT NULL DEFAULT 0,
                storage TEXT
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id TEXT NOT NULL,
                chunk_id INTEGER NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER,
                position INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                timeout_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                FOREIGN KEY(package_id) REFERENCES packages(id)
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl PackageStore for SqlitePackageStore {
    fn save_package(&mut self, package: &DownloadPackage) -> CoreResult<()> {
        let storage = package
            .storage
            .as_ref()
            .filter(|storage| !storage.is_disposed())
            .map(|storage| serde_json::to_string(&storage.descriptor()))
            .transpose()
            .map_err(json_err)?;
        let urls = serde_json::to_string(&package.urls).map_err(json_err)?;
        let file_name = package
            .file_name
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "
            INSERT INTO packages (
                id, urls, file_name, status, total_file_size, received_bytes_size,
                supports_range, in_memory, is_save_complete, save_progress, storage
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                urls=excluded.urls,
                file_name=excluded.file_name,
                status=excluded.status,
                total_file_size=excluded.total_file_size,
                received_bytes_size=excluded.received_bytes_size,
                supports_range=excluded.supports_range,
                in_memory=excluded.in_memory,
                is_save_complete=excluded.is_save_complete,
                save_progress=excluded.save_progress,
                storage=excluded.storage
            ",
            params![
                package.id.to_string(),
                urls,
                file_name,
                package.status.as_str(),
                package.total_file_size as i64,
                package.received_bytes_size as i64,
                package.is_support_download_in_range,
                package.in_memory,
                package.is_save_complete,
                package.save_progress,
                storage,
            ],
        )
        .map_err(sql_err)?;

        tx.execute(
            "DELETE FROM chunks WHERE package_id = ?1",
            params![package.id.to_string()],
        )
        .map_err(sql_err)?;
        for chunk in &package.chunks {
            tx.execute(
                "
                INSERT INTO chunks (
                    package_id, chunk_id, range_start, range_end, position, retry_count,
                    timeout_ms, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    package.id.to_string(),
                    chunk.id as i64,
                    chunk.start as i64,
                    chunk.end.map(|end| end as i64),
                    chunk.position as i64,
                    chunk.retry_count as i64,
                    chunk.timeout_ms as i64,
                    chunk.status.as_str(),
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    fn load_package(&self, id: &PackageId) -> CoreResult<DownloadPackage> {
        use rusqlite::OptionalExtension;

        use crate::chunk::{Chunk, ChunkStatus};
        use crate::package::DownloadStatus;
        use crate::storage::StorageDescriptor;

        let conn = self.conn()?;
        let row = conn
            .query_row(
                "
                SELECT urls, file_name, status, total_file_size, received_bytes_size,
                       supports_range, in_memory, is_save_complete, save_progress, storage
                FROM packages WHERE id = ?1
                ",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let (urls, file_name, status, total, received, ranged, in_memory, complete, progress, storage) = row;

        let status = DownloadStatus::parse(&status)
            .ok_or_else(|| CoreError::Storage(format!("unknown package status {}", status)))?;
        let storage = match storage {
            Some(json) => Some(
                serde_json::from_str::<StorageDescriptor>(&json)
                    .map_err(json_err)?
                    .open(),
            ),
            None => None,
        };

        let mut stmt = conn
            .prepare(
                "
                SELECT chunk_id, range_start, range_end, position, retry_count, timeout_ms, status
                FROM chunks WHERE package_id = ?1 ORDER BY chunk_id ASC
                ",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                let status: String = row.get(6)?;
                let status = ChunkStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?;
                Ok(Chunk {
                    id: row.get::<_, i64>(0)? as u32,
                    start: row.get::<_, i64>(1)? as u64,
                    end: row.get::<_, Option<i64>>(2)?.map(|end| end as u64),
                    position: row.get::<_, i64>(3)? as u64,
                    retry_count: row.get::<_, i64>(4)? as u32,
                    timeout_ms: row.get::<_, i64>(5)? as u64,
                    status,
                })
            })
            .map_err(sql_err)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(sql_err)?);
        }

        Ok(DownloadPackage {
            id: *id,
            urls: serde_json::from_str(&urls).map_err(json_err)?,
            chunks,
            total_file_size: total as u64,
            received_bytes_size: received as u64,
            is_support_download_in_range: ranged,
            file_name: file_name.map(Into::into),
            in_memory,
            is_saving: false,
            is_save_complete: complete,
            save_progress: progress,
            status,
            storage,
        })
    }

    fn list_packages(&self) -> CoreResult<Vec<DownloadPackage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM packages").map_err(sql_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;

        let mut packages = Vec::new();
        for id in ids {
            let id = id.map_err(sql_err)?;
            let package_id = PackageId::parse_str(&id).map_err(|_| CoreError::Storage(id))?;
            packages.push(self.load_package(&package_id)?);
        }
        Ok(packages)
    }

    fn delete_package(&mut self, id: &PackageId) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute("DELETE FROM chunks WHERE package_id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        tx.execute("DELETE FROM packages WHERE id = ?1", params![id.to_string()])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }
}
