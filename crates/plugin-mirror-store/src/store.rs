use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use plugin_mirror::artifact::absolute_path;
use plugin_mirror::plan;
use plugin_mirror::{
    ArtifactKey, ArtifactLookup, FetchedArtifact, LocalCatalog, MirrorStore, ProductVersion,
    PublishedCatalog, RetireReport, StoreError, StoredArtifact,
};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::{catalog_xml, layout, schema};

/// A published catalog as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub version: ProductVersion,
    pub file_name: String,
    pub entries: u64,
    pub published_at: u64,
}

/// Mirror store backed by plain files plus a SQLite index.
///
/// Artifacts live under `storage_path`, catalog documents under `base_path`.
/// The index and the staging area live in `storage_path/.mirror`, so staged
/// downloads are always moved into place by a rename on the same filesystem.
pub struct FsMirrorStore {
    conn: Mutex<Connection>,
    base_path: PathBuf,
    storage_path: PathBuf,
    storage_url: String,
    staging: PathBuf,
}

fn db(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl FsMirrorStore {
    /// Open (creating if needed) a store.
    ///
    /// Files left in the staging area by an interrupted run are removed.
    pub fn open(
        base_path: impl Into<PathBuf>,
        storage_path: impl Into<PathBuf>,
        storage_url: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        let storage_path = storage_path.into();
        let state = storage_path.join(layout::STATE_DIR);
        let staging = state.join(layout::STAGING_DIR);

        fs::create_dir_all(&base_path)?;
        fs::create_dir_all(&staging)?;
        let stale = clear_dir(&staging)?;
        if stale > 0 {
            info!(count = stale, "removed stale staging files");
        }

        let conn = Connection::open(state.join(layout::INDEX_FILE)).map_err(db)?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(db)?;

        let mut storage_url = storage_url.into();
        if !storage_url.ends_with('/') {
            storage_url.push('/');
        }

        let mut store = Self {
            conn: Mutex::new(conn),
            base_path,
            storage_path,
            storage_url,
            staging,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .get_mut()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        schema::migrations()
            .to_latest(conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("index connection poisoned".into()))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Where the catalog document for `version` is (or would be) written.
    pub fn catalog_path(&self, version: &ProductVersion) -> PathBuf {
        self.base_path.join(layout::catalog_file_name(version))
    }

    /// Every artifact recorded in the index, whether or not its file is intact.
    pub fn stored_artifacts(&self) -> Result<Vec<StoredArtifact>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT plugin_id, version, checksum, relative_path, size, completed_at
                 FROM artifacts
                 ORDER BY plugin_id, version",
            )
            .map_err(db)?;
        stmt.query_map([], row_to_artifact)
            .map_err(db)?
            .collect::<Result<_, _>>()
            .map_err(db)
    }

    pub fn published_catalogs(&self) -> Result<Vec<CatalogRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT product_version, file_name, entries, published_at
                 FROM catalogs
                 ORDER BY product_version",
            )
            .map_err(db)?;
        stmt.query_map([], |row| {
            Ok(CatalogRecord {
                version: ProductVersion::new(row.get::<_, String>(0)?),
                file_name: row.get(1)?,
                entries: get_u64(row, 2)?,
                published_at: get_u64(row, 3)?,
            })
        })
        .map_err(db)?
        .collect::<Result<_, _>>()
        .map_err(db)
    }

    fn indexed(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT plugin_id, version, checksum, relative_path, size, completed_at
             FROM artifacts
             WHERE plugin_id = ?1 AND version = ?2",
            rusqlite::params![key.plugin_id, key.version],
            row_to_artifact,
        )
        .optional()
        .map_err(db)
    }

    /// Delete everything under the storage root that no kept path needs.
    ///
    /// Dot entries and plain files at the root are never touched, nor is the
    /// catalog directory when it lives inside the storage root.
    fn sweep(&self, keep_files: &HashSet<String>) -> Result<usize, StoreError> {
        let catalogs = self.catalog_dir_in_storage();
        let mut keep_dirs = HashSet::new();
        for file in keep_files.iter().chain(catalogs.iter()) {
            let mut prefix = file.as_str();
            while let Some((parent, _)) = prefix.rsplit_once('/') {
                keep_dirs.insert(parent.to_owned());
                prefix = parent;
            }
        }
        let sweep = Sweep {
            keep_files,
            keep_dirs: &keep_dirs,
            catalogs: catalogs.as_deref(),
        };
        sweep.dir(&self.storage_path, "")
    }

    /// `base_path` relative to `storage_path` (`""` when they are the same
    /// directory), or `None` when catalogs live elsewhere.
    fn catalog_dir_in_storage(&self) -> Option<String> {
        let base = fs::canonicalize(&self.base_path).ok()?;
        let storage = fs::canonicalize(&self.storage_path).ok()?;
        let relative = base.strip_prefix(&storage).ok()?;
        Some(
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<StoredArtifact> {
    Ok(StoredArtifact {
        key: ArtifactKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        checksum: row.get(2)?,
        relative_path: row.get(3)?,
        size: get_u64(row, 4)?,
        completed_at: get_u64(row, 5)?,
    })
}

impl ArtifactLookup for FsMirrorStore {
    fn lookup(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        let Some(stored) = self.indexed(key)? else {
            return Ok(None);
        };

        let path = absolute_path(&self.storage_path, &stored);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() == stored.size => Ok(Some(stored)),
            Ok(meta) => {
                warn!(
                    artifact = %key,
                    recorded = stored.size,
                    on_disk = meta.len(),
                    "stored artifact does not match its index entry"
                );
                Ok(None)
            }
            Err(_) => {
                warn!(artifact = %key, path = %path.display(), "indexed artifact is missing");
                Ok(None)
            }
        }
    }
}

impl MirrorStore for FsMirrorStore {
    fn staging_dir(&self) -> &Path {
        &self.staging
    }

    fn commit_artifact(&self, fetched: FetchedArtifact) -> Result<StoredArtifact, StoreError> {
        let dir = layout::artifact_dir(&fetched.key);
        let stored = StoredArtifact {
            key: fetched.key.clone(),
            checksum: fetched.checksum.clone(),
            relative_path: format!("{dir}/{}", fetched.file_name),
            size: fetched.size,
            completed_at: now_epoch_secs(),
        };
        let size = to_sql_int(stored.size)?;
        let completed_at = to_sql_int(stored.completed_at)?;
        let target = absolute_path(&self.storage_path, &stored);
        fs::create_dir_all(layout::resolve(&self.storage_path, &dir))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "INSERT OR REPLACE INTO artifacts
                (plugin_id, version, checksum, relative_path, size, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                stored.key.plugin_id,
                stored.key.version,
                stored.checksum,
                stored.relative_path,
                size,
                completed_at,
            ],
        )
        .map_err(db)?;

        // A failed rename drops `tx`, rolling the row back; the staged file
        // is deleted with the returned error.
        fetched
            .staged
            .persist(&target)
            .map_err(|e| StoreError::Persist {
                path: target.clone(),
                reason: e.error.to_string(),
            })?;
        tx.commit().map_err(db)?;

        debug!(artifact = %stored.key, path = %stored.relative_path, "artifact committed");
        Ok(stored)
    }

    fn publish_catalog(&self, catalog: &LocalCatalog) -> Result<PublishedCatalog, StoreError> {
        for item in &catalog.entries {
            if !absolute_path(&self.storage_path, &item.artifact).is_file() {
                return Err(StoreError::DanglingReference(item.artifact.key.clone()));
            }
        }

        let document = catalog_xml::render(catalog, &self.storage_url)?;
        let file_name = layout::catalog_file_name(&catalog.version);
        let path = self.base_path.join(&file_name);

        let mut staged = tempfile::Builder::new()
            .prefix(".plugins-")
            .tempfile_in(&self.base_path)?;
        staged.write_all(&document)?;
        staged.as_file().sync_all()?;

        let entries = to_sql_int(catalog.entries.len() as u64)?;
        let mut conn = self.conn()?;

        // The new entry set is recorded next to the old one before the
        // document changes, so whichever document is live is always covered.
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "INSERT INTO catalogs (product_version, file_name, entries, published_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(product_version) DO NOTHING",
            rusqlite::params![catalog.version.as_str(), file_name, entries, now_sql()?],
        )
        .map_err(db)?;
        insert_entries(&tx, catalog, "INSERT OR IGNORE")?;
        tx.commit().map_err(db)?;

        staged.persist(&path).map_err(|e| StoreError::Persist {
            path: path.clone(),
            reason: e.error.to_string(),
        })?;
        sync_dir(&self.base_path);

        // The document is live and its entries are recorded; a failure here
        // only leaves rows from the previous catalog behind.
        if let Err(e) = record_published(&mut conn, catalog, &file_name, entries) {
            warn!(version = %catalog.version, "pruning previous catalog entries failed: {e}");
        }

        Ok(PublishedCatalog {
            version: catalog.version.clone(),
            path,
            entries: catalog.entries.len(),
        })
    }

    fn published_versions(&self) -> Result<Vec<ProductVersion>, StoreError> {
        Ok(self
            .published_catalogs()?
            .into_iter()
            .map(|record| record.version)
            .collect())
    }

    fn published_keys(&self, version: &ProductVersion) -> Result<HashSet<ArtifactKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT plugin_id, version FROM catalog_entries WHERE product_version = ?1")
            .map_err(db)?;
        stmt.query_map([version.as_str()], |row| {
            Ok(ArtifactKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })
        .map_err(db)?
        .collect::<Result<_, _>>()
        .map_err(db)
    }

    fn withdraw_catalog(&self, version: &ProductVersion) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;

        let file_name: Option<String> = tx
            .query_row(
                "SELECT file_name FROM catalogs WHERE product_version = ?1",
                [version.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        let Some(file_name) = file_name else {
            return Ok(());
        };

        tx.execute(
            "DELETE FROM catalog_entries WHERE product_version = ?1",
            [version.as_str()],
        )
        .map_err(db)?;
        tx.execute(
            "DELETE FROM catalogs WHERE product_version = ?1",
            [version.as_str()],
        )
        .map_err(db)?;
        let still_used: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM catalogs WHERE file_name = ?1)",
                [&file_name],
                |row| row.get(0),
            )
            .map_err(db)?;

        // Remove the document before committing so a failure keeps the
        // catalog recorded as published.
        if !still_used {
            match fs::remove_file(self.base_path.join(&file_name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit().map_err(db)?;

        info!(%version, file = %file_name, removed = !still_used, "catalog withdrawn");
        Ok(())
    }

    fn retire_unreferenced(
        &self,
        retained: &HashSet<ArtifactKey>,
    ) -> Result<RetireReport, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;

        // Anything a protected catalog still points at stays, whatever the
        // caller asked for.
        let mut keep_files = HashSet::new();
        let mut protected = HashSet::new();
        {
            let mut stmt = tx
                .prepare("SELECT plugin_id, version, relative_path FROM catalog_entries")
                .map_err(db)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        ArtifactKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(db)?;
            for row in rows {
                let (key, path) = row.map_err(db)?;
                protected.insert(key);
                keep_files.insert(path);
            }
        }

        let artifacts = {
            let mut stmt = tx
                .prepare(
                    "SELECT plugin_id, version, checksum, relative_path, size, completed_at
                     FROM artifacts",
                )
                .map_err(db)?;
            stmt.query_map([], row_to_artifact)
                .map_err(db)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db)?
        };

        protected.extend(retained.iter().cloned());
        let retired = plan::retirement_candidates(artifacts.iter().map(|a| &a.key), &protected);
        keep_files.extend(
            artifacts
                .into_iter()
                .filter(|a| protected.contains(&a.key))
                .map(|a| a.relative_path),
        );

        for key in &retired {
            tx.execute(
                "DELETE FROM artifacts WHERE plugin_id = ?1 AND version = ?2",
                rusqlite::params![key.plugin_id, key.version],
            )
            .map_err(db)?;
            info!(artifact = %key, "retiring artifact");
        }
        tx.commit().map_err(db)?;
        drop(conn);

        let swept = self.sweep(&keep_files)?;
        Ok(RetireReport {
            retired,
            swept,
            withdrawn: Vec::new(),
        })
    }
}

/// Remove every entry in `dir`, returning how many were removed.
fn clear_dir(dir: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

struct Sweep<'a> {
    keep_files: &'a HashSet<String>,
    keep_dirs: &'a HashSet<String>,
    catalogs: Option<&'a str>,
}

impl Sweep<'_> {
    fn dir(&self, dir: &Path, relative: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            let name = entry.file_name().to_string_lossy().into_owned();
            if relative.is_empty() && (name.starts_with('.') || !is_dir) {
                continue;
            }
            let path_rel = if relative.is_empty() {
                name
            } else {
                format!("{relative}/{name}")
            };
            if self.catalogs == Some(path_rel.as_str()) {
                continue;
            }

            if is_dir {
                if self.keep_dirs.contains(&path_rel) {
                    removed += self.dir(&entry.path(), &path_rel)?;
                } else {
                    debug!(path = %path_rel, "removing unreferenced directory");
                    fs::remove_dir_all(entry.path())?;
                    removed += 1;
                }
            } else if !self.keep_files.contains(&path_rel) {
                debug!(path = %path_rel, "removing unreferenced file");
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Replace the recorded entries of `catalog.version` with exactly the
/// published set and update its catalog row.
fn record_published(
    conn: &mut Connection,
    catalog: &LocalCatalog,
    file_name: &str,
    entries: i64,
) -> Result<(), StoreError> {
    let tx = conn.transaction().map_err(db)?;
    tx.execute(
        "DELETE FROM catalog_entries WHERE product_version = ?1",
        [catalog.version.as_str()],
    )
    .map_err(db)?;
    insert_entries(&tx, catalog, "INSERT OR REPLACE")?;
    tx.execute(
        "INSERT INTO catalogs (product_version, file_name, entries, published_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(product_version) DO UPDATE SET
            file_name = excluded.file_name,
            entries = excluded.entries,
            published_at = excluded.published_at",
        rusqlite::params![catalog.version.as_str(), file_name, entries, now_sql()?],
    )
    .map_err(db)?;
    tx.commit().map_err(db)
}

fn insert_entries(
    tx: &rusqlite::Transaction<'_>,
    catalog: &LocalCatalog,
    verb: &str,
) -> Result<(), StoreError> {
    let mut insert = tx
        .prepare(&format!(
            "{verb} INTO catalog_entries (product_version, plugin_id, version, relative_path)
             VALUES (?1, ?2, ?3, ?4)"
        ))
        .map_err(db)?;
    for item in &catalog.entries {
        insert
            .execute(rusqlite::params![
                catalog.version.as_str(),
                item.artifact.key.plugin_id,
                item.artifact.key.version,
                item.artifact.relative_path,
            ])
            .map_err(db)?;
    }
    Ok(())
}

/// SQLite integers are signed.
fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Database(format!("{value} does not fit in an INTEGER column")))
}

fn get_u64(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn now_sql() -> Result<i64, StoreError> {
    to_sql_int(now_epoch_secs())
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
