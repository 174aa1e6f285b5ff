use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{create_dir, target_quality::SearchResult};

/// Bumped whenever search behavior changes in a way that invalidates
/// previously cached probes or results.
pub const ALGORITHM_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path:?} failed: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Stable key of one cache entry: a namespace plus the SHA-256 of the
/// serialized inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    kind:   &'static str,
    digest: String,
}

impl CacheKey {
    #[inline]
    pub fn new<T: Serialize>(kind: &'static str, material: &T) -> Result<Self, CacheError> {
        let mut hasher = Sha256::new();
        hasher.update(ALGORITHM_VERSION.to_le_bytes());
        hasher.update(kind.as_bytes());
        hasher.update(serde_json::to_vec(material)?);

        Ok(Self {
            kind,
            digest: hex::encode(hasher.finalize()),
        })
    }

}

impl fmt::Display for CacheKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.digest.get(..12).unwrap_or(&self.digest))
    }
}

/// CRF to score observations of one scene search. Entries are never
/// overwritten once recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    probes: BTreeMap<i32, f64>,
}

impl ProbeRecord {
    #[inline]
    pub fn get(&self, crf: i32) -> Option<f64> {
        self.probes.get(&crf).copied()
    }

    /// Records `score` for `crf` unless it was already recorded, returning
    /// the stored score.
    #[inline]
    pub fn insert(&mut self, crf: i32, score: f64) -> f64 {
        *self.probes.entry(crf).or_insert(score)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (i32, f64)> + '_ {
        self.probes.iter().map(|(&crf, &score)| (crf, score))
    }

    /// The probe whose score is closest to `target`, the smallest CRF on
    /// ties.
    #[inline]
    pub fn closest(&self, target: f64) -> Option<(i32, f64)> {
        self.iter().min_by(|(_, a), (_, b)| (a - target).abs().total_cmp(&(b - target).abs()))
    }
}

impl FromIterator<(i32, f64)> for ProbeRecord {
    #[inline]
    fn from_iter<I: IntoIterator<Item = (i32, f64)>>(iter: I) -> Self {
        let mut record = Self::default();
        for (crf, score) in iter {
            record.insert(crf, score);
        }
        record
    }
}

/// Filesystem-backed memo store shared by all workers. Opened once per run
/// and closed at shutdown, which removes ephemeral entries.
#[derive(Debug)]
pub struct ProbeCache {
    root:      PathBuf,
    ephemeral: Mutex<BTreeSet<CacheKey>>,
}

impl ProbeCache {
    #[inline]
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        create_dir!(root).map_err(|source| CacheError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        debug!("opened cache at {root:?}");

        Ok(Self {
            root:      root.to_path_buf(),
            ephemeral: Mutex::new(BTreeSet::new()),
        })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.kind).join(format!("{}.json", key.digest))
    }

    /// Reads an entry. Unreadable or corrupt entries count as missing.
    fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let path = self.entry_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("ignoring unreadable cache entry {path:?}: {e}");
                return None;
            },
        };

        match serde_json::from_reader(BufReader::new(file)) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("ignoring corrupt cache entry {path:?}: {e}");
                None
            },
        }
    }

    /// Writes an entry through a temporary file and a rename, so a crash
    /// never leaves a truncated entry behind. A stored entry survives
    /// [`ProbeCache::close`] until it is marked ephemeral again.
    fn store<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let io_error = |source| CacheError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            create_dir!(parent).map_err(io_error)?;
        }

        let staging = path.with_extension("json.partial");
        {
            let mut writer = BufWriter::new(File::create(&staging).map_err(io_error)?);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush().map_err(io_error)?;
        }
        fs::rename(&staging, &path).map_err(io_error)?;

        self.ephemeral.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    #[inline]
    pub fn load_probes(&self, key: &CacheKey) -> Option<ProbeRecord> {
        self.load(key)
    }

    /// Persists the probe record of an unfinished search.
    #[inline]
    pub fn store_probes(&self, key: &CacheKey, record: &ProbeRecord) -> Result<(), CacheError> {
        self.store(key, record)
    }

    #[inline]
    pub fn load_result(&self, key: &CacheKey) -> Option<SearchResult> {
        self.load(key)
    }

    #[inline]
    pub fn store_result(&self, key: &CacheKey, result: &SearchResult) -> Result<(), CacheError> {
        self.store(key, result)
    }

    /// Schedules an existing entry for deletion at [`ProbeCache::close`].
    #[inline]
    pub fn mark_ephemeral(&self, key: &CacheKey) {
        self.ephemeral.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone());
    }

    /// Deletes ephemeral entries. Returns how many were removed.
    #[inline]
    pub fn close(mut self) -> Result<usize, CacheError> {
        let ephemeral = std::mem::take(self.ephemeral.get_mut().unwrap_or_else(PoisonError::into_inner));
        let mut removed = 0;
        for key in &ephemeral {
            let path = self.entry_path(key);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {},
                Err(source) => {
                    return Err(CacheError::Io {
                        path,
                        source,
                    })
                },
            }
        }
        debug!("closed cache, removed {removed} ephemeral entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn closest_prefers_smallest_distance() {
        let record: ProbeRecord = [(10, 80.0), (20, 90.0), (30, 95.0)].into_iter().collect();
        assert_eq!(record.closest(91.0), Some((20, 90.0)));
    }

    #[test]
    fn closest_ties_pick_smallest_crf() {
        let record: ProbeRecord = [(30, 92.0), (20, 88.0)].into_iter().collect();
        assert_eq!(record.closest(90.0), Some((20, 88.0)));
    }

    #[test]
    fn recorded_scores_are_not_overwritten() {
        let mut record = ProbeRecord::default();
        assert_eq!(record.insert(24, 93.0), 93.0);
        assert_eq!(record.insert(24, 10.0), 93.0);
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn keys_depend_on_every_input() {
        let a = CacheKey::new("probes", &(0, 100, "x264", 94.0, "abc")).unwrap();
        let b = CacheKey::new("probes", &(0, 100, "x264", 94.0, "abd")).unwrap();
        let c = CacheKey::new("results", &(0, 100, "x264", 94.0, "abc")).unwrap();
        assert_eq!(a, CacheKey::new("probes", &(0, 100, "x264", 94.0, "abc")).unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entries_survive_reopen_unless_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        let kept = CacheKey::new("results", &1).unwrap();
        let dropped = CacheKey::new("probes", &1).unwrap();

        let cache = ProbeCache::open(dir.path()).unwrap();
        cache.store(&kept, &42_i32).unwrap();
        cache.store(&dropped, &7_i32).unwrap();
        cache.mark_ephemeral(&dropped);
        assert_eq!(cache.load::<i32>(&dropped), Some(7));
        assert_eq!(cache.close().unwrap(), 1);

        let cache = ProbeCache::open(dir.path()).unwrap();
        assert_eq!(cache.load::<i32>(&kept), Some(42));
        assert_eq!(cache.load::<i32>(&dropped), None);
    }

    #[test]
    fn corrupt_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProbeCache::open(dir.path()).unwrap();
        let key = CacheKey::new("probes", &"scene").unwrap();
        fs::create_dir_all(dir.path().join("probes")).unwrap();
        fs::write(cache.entry_path(&key), b"{ not json").unwrap();
        assert_eq!(cache.load::<ProbeRecord>(&key), None);
    }

    #[test]
    fn concurrent_first_use_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(dir.path().join("nested").join("cache"));
        let handles = (0..8)
            .map(|i| {
                let root = Arc::clone(&root);
                thread::spawn(move || {
                    let cache = ProbeCache::open(&root).unwrap();
                    let key = CacheKey::new("probes", &i).unwrap();
                    cache.store(&key, &i).unwrap();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fs::read_dir(root.join("probes")).unwrap().count(), 8);
    }
}
