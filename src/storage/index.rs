//! SQLite perceptual-hash index
//!
//! Maps cached probe images to their persisted OCR artifacts. Lookup has
//! two tiers: a byte-exact content-hash match, then a bounded
//! nearest-neighbor scan over the most recently accessed rows using
//! Hamming distance on the configured hash kind. The bounded window is a
//! deliberate recall/latency tradeoff, not a correctness guarantee: a
//! visually similar entry outside the window is simply a cache miss.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::hashing::{HashKind, hamming_distance};

/// Rows considered by the nearest-neighbor scan, newest first.
const SCAN_WINDOW: usize = 100;

/// Extra entries removed beyond the surplus so eviction does not run on
/// every insert once the cache is full.
const EVICT_MARGIN: usize = 10;

/// One row of the `cache_entries` table. Owned exclusively by the index;
/// callers never mutate entries directly.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub image_path: String,
    pub json_path: String,
    pub phash: String,
    pub dhash: String,
    pub ahash: String,
    pub whash: String,
    /// Sorted region ids this entry was scoped to; empty = full frame.
    pub regions: Vec<u8>,
    pub image_size: i64,
    /// Hex digest of the probe image file bytes.
    pub image_hash: String,
}

/// What the index computes about a probe before querying.
#[derive(Debug, Clone)]
pub struct IndexProbe {
    /// Hex digest of the probe image file bytes.
    pub content_hash: String,
    /// Fingerprint of the configured [`HashKind`].
    pub primary_hash: String,
    /// Sorted region ids the search is scoped to; empty = full frame.
    pub regions: Vec<u8>,
}

/// A successful index lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Artifact file holding the cached detection set.
    pub json_path: PathBuf,
    /// Image path key of the matched entry (for self-healing overwrite).
    pub image_path: String,
    /// Whether the hit came from the byte-exact fast path.
    pub exact: bool,
}

/// The persistent hash index. Holds no open connection; every operation
/// opens, works and closes so concurrent processes interleave safely.
pub struct HashIndex {
    db_path: PathBuf,
    hash_kind: HashKind,
    hash_threshold: u32,
}

impl HashIndex {
    /// Open (creating if needed) the index at `db_path`.
    pub fn open(db_path: &Path, hash_kind: HashKind, hash_threshold: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }

        let index = Self {
            db_path: db_path.to_path_buf(),
            hash_kind,
            hash_threshold,
        };
        let conn = index.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                id INTEGER PRIMARY KEY,
                image_path TEXT NOT NULL UNIQUE,
                json_path TEXT NOT NULL,
                phash TEXT NOT NULL,
                dhash TEXT NOT NULL,
                ahash TEXT NOT NULL,
                whash TEXT NOT NULL,
                regions TEXT,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_access_time INTEGER NOT NULL,
                created_time INTEGER NOT NULL,
                image_size INTEGER NOT NULL,
                image_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_phash ON cache_entries(phash);
            CREATE INDEX IF NOT EXISTS idx_cache_dhash ON cache_entries(dhash);
            CREATE INDEX IF NOT EXISTS idx_cache_last_access
                ON cache_entries(last_access_time);
            CREATE INDEX IF NOT EXISTS idx_cache_image_hash
                ON cache_entries(image_hash);",
        )
        .context("Failed to initialize cache_entries schema")?;

        Ok(index)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open cache index {:?}", self.db_path))?;
        // Wait out writers from sibling sessions instead of failing.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Look up a cached artifact for the probe. Index errors are downgraded
    /// to a miss so the caller falls through to the live provider path.
    pub fn lookup(&self, probe: &IndexProbe) -> Option<CacheHit> {
        match self.try_lookup(probe) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Cache index lookup failed, treating as miss: {:#}", e);
                None
            }
        }
    }

    fn try_lookup(&self, probe: &IndexProbe) -> Result<Option<CacheHit>> {
        let conn = self.connect()?;
        let regions = regions_to_sql(&probe.regions);

        // Tier 1: byte-identical probe.
        let exact: Option<(String, String)> = conn
            .query_row(
                "SELECT image_path, json_path FROM cache_entries
                 WHERE image_hash = ?1 AND regions IS ?2
                 LIMIT 1",
                params![probe.content_hash, regions],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((image_path, json_path)) = exact {
            let json_path = PathBuf::from(json_path);
            if json_path.exists() {
                self.touch(&conn, &image_path)?;
                debug!("Exact content-hash cache hit for {}", image_path);
                return Ok(Some(CacheHit {
                    json_path,
                    image_path,
                    exact: true,
                }));
            }
            // Deliberate short-circuit: an exact-hash entry whose file is
            // gone is stale, so skip the Hamming scan and let the caller
            // fall through to the provider.
            warn!("Cache entry {} lost its artifact file, miss", image_path);
            return Ok(None);
        }

        // Tier 2: bounded nearest-neighbor scan over recent rows.
        let hash_column = match self.hash_kind {
            HashKind::Average => "ahash",
            HashKind::Difference => "dhash",
            HashKind::Perceptual => "phash",
            HashKind::Wavelet => "whash",
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT image_path, json_path, {} FROM cache_entries
             WHERE regions IS ?1
             ORDER BY last_access_time DESC
             LIMIT {}",
            hash_column, SCAN_WINDOW
        ))?;

        let mut best: Option<(u32, String, String)> = None;
        let rows = stmt.query_map(params![regions], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (image_path, json_path, hash) = row?;
            let Some(dist) = hamming_distance(&probe.primary_hash, &hash) else {
                continue;
            };
            if best.as_ref().map_or(true, |(d, _, _)| dist < *d) {
                best = Some((dist, image_path, json_path));
            }
        }
        drop(stmt);

        let Some((dist, image_path, json_path)) = best else {
            return Ok(None);
        };
        if dist > self.hash_threshold {
            debug!(
                "Nearest cache entry at Hamming distance {} exceeds threshold {}",
                dist, self.hash_threshold
            );
            return Ok(None);
        }

        let json_path = PathBuf::from(json_path);
        if !json_path.exists() {
            warn!("Cache entry {} lost its artifact file, miss", image_path);
            return Ok(None);
        }

        self.touch(&conn, &image_path)?;
        debug!(
            "Near-duplicate cache hit for {} at Hamming distance {}",
            image_path, dist
        );
        Ok(Some(CacheHit {
            json_path,
            image_path,
            exact: false,
        }))
    }

    fn touch(&self, conn: &Connection, image_path: &str) -> Result<()> {
        conn.execute(
            "UPDATE cache_entries
             SET hit_count = hit_count + 1, last_access_time = ?1
             WHERE image_path = ?2",
            params![now(), image_path],
        )?;
        Ok(())
    }

    /// Insert or replace the entry keyed by `image_path`. On replacement
    /// the creation time and hit count survive; everything else is
    /// overwritten (the self-healing path relies on this).
    pub fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.connect()?;
        let ts = now();
        conn.execute(
            "INSERT INTO cache_entries
                (image_path, json_path, phash, dhash, ahash, whash, regions,
                 hit_count, last_access_time, created_time, image_size, image_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8, ?9, ?10)
             ON CONFLICT(image_path) DO UPDATE SET
                json_path = excluded.json_path,
                phash = excluded.phash,
                dhash = excluded.dhash,
                ahash = excluded.ahash,
                whash = excluded.whash,
                regions = excluded.regions,
                last_access_time = excluded.last_access_time,
                image_size = excluded.image_size,
                image_hash = excluded.image_hash",
            params![
                entry.image_path,
                entry.json_path,
                entry.phash,
                entry.dhash,
                entry.ahash,
                entry.whash,
                regions_to_sql(&entry.regions),
                ts,
                entry.image_size,
                entry.image_hash,
            ],
        )
        .with_context(|| format!("Failed to upsert cache entry {}", entry.image_path))?;
        Ok(())
    }

    /// Remove the oldest entries once the count exceeds `max_size`,
    /// deleting index rows and backing files. Returns the number evicted.
    pub fn evict(&self, max_size: usize) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                row.get::<_, i64>(0)
            })? as usize;
        if count <= max_size {
            return Ok(0);
        }

        let surplus = ((count - max_size + EVICT_MARGIN).min(count)) as i64;
        let victims: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT image_path, json_path FROM cache_entries
                 ORDER BY last_access_time ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![surplus], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut evicted = 0;
        for (image_path, json_path) in &victims {
            // A sibling process may have removed the files already.
            if let Err(e) = std::fs::remove_file(image_path) {
                debug!("Could not remove evicted image {}: {}", image_path, e);
            }
            if let Err(e) = std::fs::remove_file(json_path) {
                debug!("Could not remove evicted artifact {}: {}", json_path, e);
            }
            evicted += conn.execute(
                "DELETE FROM cache_entries WHERE image_path = ?1",
                params![image_path],
            )?;
        }

        if evicted > 0 {
            debug!("Evicted {} cache entries (max size {})", evicted, max_size);
        }
        Ok(evicted)
    }

    /// Current number of entries.
    pub fn len(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Hit count for an entry, if present. Mainly useful for diagnostics.
    pub fn hit_count(&self, image_path: &str) -> Result<Option<i64>> {
        let conn = self.connect()?;
        Ok(conn
            .query_row(
                "SELECT hit_count FROM cache_entries WHERE image_path = ?1",
                params![image_path],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Drop every entry and its backing files.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.connect()?;
        let victims: Vec<(String, String)> = {
            let mut stmt = conn.prepare("SELECT image_path, json_path FROM cache_entries")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for (image_path, json_path) in &victims {
            let _ = std::fs::remove_file(image_path);
            let _ = std::fs::remove_file(json_path);
        }
        let removed = conn.execute("DELETE FROM cache_entries", [])?;
        Ok(removed)
    }
}

/// Regions serialize to a canonical JSON array; the full frame is NULL so
/// `regions IS ?` matches both shapes.
fn regions_to_sql(regions: &[u8]) -> Option<String> {
    if regions.is_empty() {
        None
    } else {
        Some(serde_json::to_string(regions).unwrap_or_default())
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
