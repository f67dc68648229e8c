use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::hasher;

const THUMBNAIL_MAX: (u32, u32) = (400, 225);
const THUMBNAIL_QUALITY: u8 = 75;
pub const DEFAULT_CACHE_CAPACITY: usize = 500;

/// Content-addressed screenshot store.
///
/// Keeps recently captured frames as base64 JPEG in an in-memory LRU, and a
/// thumbnail per persisted hash on disk (`thumbnails/thumb_<hash12>.jpg`,
/// resized to fit 400x225). Originals are written only when a caller asks to
/// retain them. All failures are non-fatal: reads come back as "not found",
/// writes are logged and skipped.
pub struct ImageStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    cache: LruCache<String, String>,
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedImage {
    pub thumbnail_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStoreStats {
    pub cached_images: usize,
    pub cache_capacity: usize,
    pub thumbnail_count: usize,
    pub thumbnail_bytes: u64,
    pub base_dir: PathBuf,
}

impl ImageStore {
    pub fn new(base_dir: impl Into<PathBuf>, cache_capacity: usize) -> Self {
        let base_dir = base_dir.into();
        let capacity =
            NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap());
        let store = Self {
            inner: Mutex::new(StoreInner {
                cache: LruCache::new(capacity),
                base_dir,
            }),
        };
        store.ensure_dirs();
        store
    }

    fn ensure_dirs(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for dir in [inner.base_dir.join("thumbnails"), inner.base_dir.clone()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "failed to create image store directory");
            }
        }
    }

    /// Insert into the cache (or promote to most-recently-used).
    /// Returns the base64 encoding of the bytes.
    pub fn cache(&self, hash: &str, bytes: &[u8]) -> String {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.cache.get(hash) {
            return existing.clone();
        }
        let encoded = BASE64.encode(bytes);
        inner.cache.put(hash.to_string(), encoded.clone());
        encoded
    }

    /// Fetch by hash: cache first, thumbnail file on miss (promoting it into
    /// the cache). Returns base64 JPEG.
    pub fn get(&self, hash: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(data) = inner.cache.get(hash) {
            return Some(data.clone());
        }

        let path = thumbnail_path(&inner.base_dir, hash);
        match fs::read(&path) {
            Ok(bytes) => {
                let encoded = BASE64.encode(&bytes);
                inner.cache.put(hash.to_string(), encoded.clone());
                Some(encoded)
            }
            Err(_) => None,
        }
    }

    /// Batched form of `get`. Absent hashes are simply missing from the map.
    pub fn get_many(&self, hashes: &[String]) -> HashMap<String, String> {
        let mut out = HashMap::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(data) = self.get(hash) {
                out.insert(hash.clone(), data);
            }
        }
        out
    }

    /// Write the thumbnail (and optionally the original) for a hash, then
    /// drop the cache entry. Returns `None` if the write failed; callers
    /// proceed without persistence.
    pub fn persist(&self, hash: &str, bytes: &[u8], keep_original: bool) -> Option<PersistedImage> {
        let base_dir = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.base_dir.clone()
        };

        let thumb_path = thumbnail_path(&base_dir, hash);
        let size = match write_thumbnail(bytes, &thumb_path) {
            Ok(size) => size,
            Err(e) => {
                warn!(hash, error = %e, "thumbnail write failed");
                return None;
            }
        };

        if keep_original {
            let orig_path = original_path(&base_dir, hash);
            if let Err(e) = write_atomic(&orig_path, bytes) {
                warn!(hash, error = %e, "original write failed");
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cache.pop(hash);
        debug!(hash, size, path = %thumb_path.display(), "persisted screenshot");

        Some(PersistedImage {
            thumbnail_path: thumb_path,
            size,
        })
    }

    /// Delete thumbnails (and originals) older than `max_age` by mtime.
    /// Returns the number of files removed.
    pub fn gc(&self, max_age: Duration) -> usize {
        let base_dir = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.base_dir.clone()
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for dir in [base_dir.join("thumbnails"), base_dir.join("originals")] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if stale && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "image store gc");
        }
        removed
    }

    /// Atomically rebind the store to a new base directory. Subsequent
    /// writes go there; existing entries remain readable until the old
    /// files age out.
    pub fn update_storage_path(&self, new_base: impl Into<PathBuf>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.base_dir = new_base.into();
        }
        self.ensure_dirs();
    }

    /// Drop every cache entry. Returns how many were held.
    pub fn clear_cache(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = inner.cache.len();
        inner.cache.clear();
        count
    }

    pub fn stats(&self) -> ImageStoreStats {
        let (cached, capacity, base_dir) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            (
                inner.cache.len(),
                inner.cache.cap().get(),
                inner.base_dir.clone(),
            )
        };

        let mut thumbnail_count = 0;
        let mut thumbnail_bytes = 0u64;
        if let Ok(entries) = fs::read_dir(base_dir.join("thumbnails")) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    thumbnail_count += 1;
                    thumbnail_bytes += meta.len();
                }
            }
        }

        ImageStoreStats {
            cached_images: cached,
            cache_capacity: capacity,
            thumbnail_count,
            thumbnail_bytes,
            base_dir,
        }
    }

    pub fn thumbnail_path_for(&self, hash: &str) -> PathBuf {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        thumbnail_path(&inner.base_dir, hash)
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn thumbnail_path(base_dir: &Path, hash: &str) -> PathBuf {
    base_dir
        .join("thumbnails")
        .join(format!("thumb_{}.jpg", short_hash(hash)))
}

fn original_path(base_dir: &Path, hash: &str) -> PathBuf {
    base_dir
        .join("originals")
        .join(format!("orig_{}.jpg", short_hash(hash)))
}

/// Decode, resize to the thumbnail bounds, re-encode at thumbnail quality,
/// and write via temp + rename. Returns the thumbnail byte size.
fn write_thumbnail(bytes: &[u8], path: &Path) -> Result<u64> {
    let img = hasher::decode_image(bytes)?;
    let thumb = hasher::resize_to_fit(&img, THUMBNAIL_MAX.0, THUMBNAIL_MAX.1);
    let encoded = hasher::encode_jpeg(&thumb, THUMBNAIL_QUALITY)?;
    write_atomic(path, &encoded)?;
    Ok(encoded.len() as u64)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("jpg.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{encode_jpeg, PerceptualHasher};
    use image::{Rgb, RgbImage};

    fn test_jpeg(w: u32, h: u32) -> Vec<u8> {
        let mut img = RgbImage::new(w, h);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
        }
        encode_jpeg(&image::DynamicImage::ImageRgb8(img), 85).unwrap()
    }

    fn test_store() -> (ImageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), 3);
        (store, dir)
    }

    #[test]
    fn cache_and_get() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(64, 64);

        let encoded = store.cache("aaaa111122223333", &bytes);
        assert_eq!(store.get("aaaa111122223333"), Some(encoded));
        assert_eq!(store.get("ffff000000000000"), None);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(32, 32);

        store.cache("hash000000000001", &bytes);
        store.cache("hash000000000002", &bytes);
        store.cache("hash000000000003", &bytes);
        // Touch 1 so 2 becomes the eviction candidate
        store.get("hash000000000001");
        store.cache("hash000000000004", &bytes);

        assert!(store.get("hash000000000001").is_some());
        assert!(store.get("hash000000000002").is_none());
        assert!(store.get("hash000000000004").is_some());
    }

    #[test]
    fn persist_writes_bounded_thumbnail() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(1920, 1080);

        let persisted = store.persist("cafe000000000001", &bytes, false).unwrap();
        assert!(persisted.thumbnail_path.exists());
        assert!(persisted.size > 0);

        let thumb = image::open(&persisted.thumbnail_path).unwrap();
        assert!(thumb.width() <= 400);
        assert!(thumb.height() <= 225);
    }

    #[test]
    fn persisted_thumbnail_phash_stays_close() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(800, 450);
        let hasher = PerceptualHasher::new();
        let original_hash = hasher.hash_jpeg(&bytes).unwrap();

        let persisted = store.persist(&original_hash, &bytes, false).unwrap();
        let thumb_bytes = fs::read(&persisted.thumbnail_path).unwrap();
        let thumb_hash = hasher.hash_jpeg(&thumb_bytes).unwrap();

        let dist = PerceptualHasher::hamming_distance(&original_hash, &thumb_hash);
        assert!(dist <= 2, "thumbnail drifted too far from source: {dist}");
    }

    #[test]
    fn persist_drops_cache_entry_but_get_reloads_thumbnail() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(64, 64);

        store.cache("beef000000000001", &bytes);
        store.persist("beef000000000001", &bytes, false).unwrap();

        // Entry was dropped from the LRU, but get() falls back to the
        // thumbnail file and promotes it.
        assert!(store.get("beef000000000001").is_some());
    }

    #[test]
    fn persist_keep_original() {
        let (store, dir) = test_store();
        let bytes = test_jpeg(64, 64);

        store.persist("dead000000000001", &bytes, true).unwrap();
        let orig = dir
            .path()
            .join("originals")
            .join("orig_dead00000000.jpg");
        assert!(orig.exists());
        assert_eq!(fs::read(&orig).unwrap(), bytes);
    }

    #[test]
    fn gc_removes_only_stale_files() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(64, 64);
        store.persist("feed000000000001", &bytes, false).unwrap();

        // Nothing is older than an hour.
        assert_eq!(store.gc(Duration::from_secs(3600)), 0);
        // Everything is older than zero seconds.
        assert_eq!(store.gc(Duration::from_secs(0)), 1);
        assert_eq!(store.get("feed000000000001"), None);
    }

    #[test]
    fn update_storage_path_redirects_writes() {
        let (store, _dir) = test_store();
        let new_dir = tempfile::tempdir().unwrap();
        store.update_storage_path(new_dir.path());

        let bytes = test_jpeg(64, 64);
        let persisted = store.persist("face000000000001", &bytes, false).unwrap();
        assert!(persisted.thumbnail_path.starts_with(new_dir.path()));
    }

    #[test]
    fn get_many_skips_missing() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(32, 32);
        store.cache("0123456789abcdef", &bytes);

        let result = store.get_many(&[
            "0123456789abcdef".to_string(),
            "missing000000000".to_string(),
        ]);
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("0123456789abcdef"));
    }

    #[test]
    fn clear_cache_counts_entries() {
        let (store, _dir) = test_store();
        let bytes = test_jpeg(32, 32);
        store.cache("1111111111111111", &bytes);
        store.cache("2222222222222222", &bytes);
        assert_eq!(store.clear_cache(), 2);
        assert_eq!(store.get("1111111111111111"), None);
    }
}
