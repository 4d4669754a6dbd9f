//! Named frame buffers shared between pipeline stages.
//!
//! Producers create a buffer under a unique name, write it exactly once and
//! publish only the name. Consumers open the buffer by name and release their
//! view when done; the stage that owns the frame's lifetime deletes it.

use crate::error::FrameStoreError;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct SharedBuffer {
    name: String,
    data: RwLock<Vec<u8>>,
    sealed: AtomicBool,
    readers: AtomicUsize,
}

/// Writer handle returned by [`SharedFrameStore::create`]
#[derive(Clone)]
pub struct FrameBuffer {
    buffer: Arc<SharedBuffer>,
}

impl FrameBuffer {
    pub fn name(&self) -> &str {
        &self.buffer.name
    }

    pub fn len(&self) -> usize {
        self.buffer.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the buffer and seal it. Frames are never mutated after this.
    pub fn write_once(&self, bytes: &[u8]) -> Result<(), FrameStoreError> {
        if self.buffer.sealed.swap(true, Ordering::AcqRel) {
            return Err(FrameStoreError::Sealed {
                name: self.buffer.name.clone(),
            });
        }
        self.copy_in(bytes)
    }

    /// Replace the contents of a scratch buffer (detector tensors and results)
    pub fn overwrite(&self, bytes: &[u8]) -> Result<(), FrameStoreError> {
        if self.buffer.sealed.load(Ordering::Acquire) {
            return Err(FrameStoreError::Sealed {
                name: self.buffer.name.clone(),
            });
        }
        self.copy_in(bytes)
    }

    fn copy_in(&self, bytes: &[u8]) -> Result<(), FrameStoreError> {
        let mut data = self.buffer.data.write();
        if data.len() != bytes.len() {
            return Err(FrameStoreError::ShapeMismatch {
                name: self.buffer.name.clone(),
                expected: data.len(),
                actual: bytes.len(),
            });
        }
        data.copy_from_slice(bytes);
        Ok(())
    }
}

/// Read view over a stored buffer
pub struct FrameView {
    buffer: Arc<SharedBuffer>,
    rows: usize,
    cols: usize,
}

impl FrameView {
    pub fn name(&self) -> &str {
        &self.buffer.name
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.buffer.data.read()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.data.read().clone()
    }
}

/// Counters describing store activity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStoreStats {
    pub live_buffers: usize,
    pub created: u64,
    pub deleted: u64,
    pub misses: u64,
}

#[derive(Default)]
struct StoreCounters {
    created: AtomicU64,
    deleted: AtomicU64,
    misses: AtomicU64,
}

/// Process-wide arena of named buffers. Cheap to clone.
#[derive(Clone, Default)]
pub struct SharedFrameStore {
    buffers: Arc<Mutex<HashMap<String, Arc<SharedBuffer>>>>,
    counters: Arc<StoreCounters>,
}

impl SharedFrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of `size` bytes under `name`
    pub fn create(&self, name: &str, size: usize) -> Result<FrameBuffer, FrameStoreError> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(name) {
            return Err(FrameStoreError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let buffer = Arc::new(SharedBuffer {
            name: name.to_string(),
            data: RwLock::new(vec![0u8; size]),
            sealed: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        });
        buffers.insert(name.to_string(), Arc::clone(&buffer));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(FrameBuffer { buffer })
    }

    /// Reattach a writer handle to an existing buffer
    pub fn open(&self, name: &str) -> Result<FrameBuffer, FrameStoreError> {
        self.buffers
            .lock()
            .get(name)
            .map(|buffer| FrameBuffer {
                buffer: Arc::clone(buffer),
            })
            .ok_or_else(|| FrameStoreError::NotFound {
                name: name.to_string(),
            })
    }

    /// Open the buffer or allocate it when missing. A size mismatch is an error.
    pub fn create_or_open(&self, name: &str, size: usize) -> Result<FrameBuffer, FrameStoreError> {
        match self.create(name, size) {
            Err(FrameStoreError::AlreadyExists { .. }) => {
                let buffer = self.open(name)?;
                let actual = buffer.len();
                if actual != size {
                    return Err(FrameStoreError::ShapeMismatch {
                        name: name.to_string(),
                        expected: size,
                        actual,
                    });
                }
                Ok(buffer)
            }
            other => other,
        }
    }

    /// Open a read view. `dims` is `(rows, cols)` of the expected layout.
    pub fn get(&self, name: &str, dims: (usize, usize)) -> Result<FrameView, FrameStoreError> {
        let buffer = match self.buffers.lock().get(name) {
            Some(buffer) => Arc::clone(buffer),
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Err(FrameStoreError::NotFound {
                    name: name.to_string(),
                });
            }
        };

        let expected = dims.0 * dims.1;
        let actual = buffer.data.read().len();
        if expected != actual {
            return Err(FrameStoreError::ShapeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }

        buffer.readers.fetch_add(1, Ordering::AcqRel);
        Ok(FrameView {
            buffer,
            rows: dims.0,
            cols: dims.1,
        })
    }

    /// Release the caller's view of `name`
    pub fn close(&self, name: &str) {
        if let Some(buffer) = self.buffers.lock().get(name) {
            let _ = buffer
                .readers
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Remove `name`. Outstanding views keep their bytes until dropped.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.buffers.lock().remove(name);
        match removed {
            Some(buffer) => {
                let readers = buffer.readers.load(Ordering::Acquire);
                if readers > 0 {
                    debug!("Deleting {} with {} open views", name, readers);
                }
                self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.lock().contains_key(name)
    }

    pub fn open_views(&self, name: &str) -> usize {
        self.buffers
            .lock()
            .get(name)
            .map(|b| b.readers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of live buffers starting with `prefix`
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .buffers
            .lock()
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Delete every buffer whose name starts with `prefix`
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let names = self.names_with_prefix(prefix);
        names.iter().filter(|n| self.delete(n)).count()
    }

    pub fn stats(&self) -> FrameStoreStats {
        FrameStoreStats {
            live_buffers: self.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            deleted: self.counters.deleted.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Log any buffers still alive, returning how many leaked
    pub fn report_leaks(&self) -> usize {
        let names = self.names_with_prefix("");
        if !names.is_empty() {
            warn!("{} frame buffers still allocated: {:?}", names.len(), names);
        }
        names.len()
    }
}

/// Keeps the last `depth` published frames of a camera alive so downstream
/// consumers can still open them, and hands back the names that fall out.
#[derive(Debug)]
pub struct FrameRetention {
    depth: usize,
    names: VecDeque<String>,
}

impl FrameRetention {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            names: VecDeque::with_capacity(depth.max(1) + 1),
        }
    }

    /// Record a published frame, returning the frame that should now be deleted
    pub fn push(&mut self, name: String) -> Option<String> {
        self.names.push_back(name);
        if self.names.len() > self.depth {
            self.names.pop_front()
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.names.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_create_write_get_delete() {
        let store = SharedFrameStore::new();
        let buffer = store.create("cam1.000000", 6).unwrap();
        buffer.write_once(&[1, 2, 3, 4, 5, 6]).unwrap();

        let view = store.get("cam1.000000", (2, 3)).unwrap();
        assert_eq!(&view.data()[..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(store.open_views("cam1.000000"), 1);
        store.close("cam1.000000");
        assert_eq!(store.open_views("cam1.000000"), 0);

        assert!(store.delete("cam1.000000"));
        assert!(!store.delete("cam1.000000"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_rejects_existing_name() {
        let store = SharedFrameStore::new();
        store.create("a", 4).unwrap();
        assert!(matches!(
            store.create("a", 4),
            Err(FrameStoreError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_get_missing_and_mismatched() {
        let store = SharedFrameStore::new();
        assert!(matches!(
            store.get("nope", (1, 1)),
            Err(FrameStoreError::NotFound { .. })
        ));
        store.create("a", 12).unwrap();
        let err = store.get("a", (2, 4)).err().unwrap();
        assert!(matches!(err, FrameStoreError::ShapeMismatch { expected: 8, actual: 12, .. }));
        assert!(!err.is_transient());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_frames_are_write_once() {
        let store = SharedFrameStore::new();
        let buffer = store.create("f", 2).unwrap();
        buffer.write_once(&[1, 1]).unwrap();
        assert!(matches!(buffer.write_once(&[2, 2]), Err(FrameStoreError::Sealed { .. })));
        assert!(matches!(buffer.overwrite(&[2, 2]), Err(FrameStoreError::Sealed { .. })));
    }

    #[test]
    fn test_view_outlives_delete() {
        let store = SharedFrameStore::new();
        store.create("f", 3).unwrap().write_once(&[7, 8, 9]).unwrap();
        let view = store.get("f", (1, 3)).unwrap();
        store.delete("f");
        assert_eq!(view.to_vec(), vec![7, 8, 9]);
        assert!(!store.contains("f"));
    }

    #[test]
    fn test_create_or_open_checks_size() {
        let store = SharedFrameStore::new();
        store.create_or_open("det", 10).unwrap();
        assert!(store.create_or_open("det", 10).is_ok());
        assert!(matches!(
            store.create_or_open("det", 11),
            Err(FrameStoreError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let mut retention = FrameRetention::new(2);
        assert_eq!(retention.push("a".into()), None);
        assert_eq!(retention.push("b".into()), None);
        assert_eq!(retention.push("c".into()), Some("a".to_string()));
        assert_eq!(retention.drain(), vec!["b".to_string(), "c".to_string()]);
    }

    /// Randomized capture/consume/delete sequences never leak buffers, never
    /// delete a frame with an open view and never hand out a view of a deleted
    /// frame.
    #[test]
    fn test_lifecycle_random_sequences_do_not_leak() {
        let mut rng = StdRng::seed_from_u64(0x5eed_f4a3);
        for _round in 0..50 {
            let store = SharedFrameStore::new();
            let mut retention = FrameRetention::new(rng.gen_range(1..4));
            let mut queued: VecDeque<String> = VecDeque::new();
            let mut deleted: Vec<String> = Vec::new();
            let queue_cap = 2;

            for i in 0..rng.gen_range(10..60) {
                let name = format!("cam{}", i);
                let buffer = store.create(&name, 4).unwrap();
                buffer.write_once(&[i as u8; 4]).unwrap();

                // producer side: bounded queue, drop when full
                if queued.len() < queue_cap {
                    queued.push_back(name.clone());
                } else {
                    assert_eq!(store.open_views(&name), 0);
                    store.delete(&name);
                    deleted.push(name.clone());
                }

                // consumer drains a random amount
                for _ in 0..rng.gen_range(0..3) {
                    let Some(next) = queued.pop_front() else { break };
                    let readers = rng.gen_range(1..4);
                    let views: Vec<_> = (0..readers).map(|_| store.get(&next, (1, 4)).unwrap()).collect();
                    assert_eq!(store.open_views(&next), readers);
                    assert!(views.iter().all(|view| view.data().len() == 4));
                    for _ in 0..readers {
                        store.close(&next);
                    }
                    assert_eq!(store.open_views(&next), 0);
                    if let Some(old) = retention.push(next) {
                        assert_eq!(store.open_views(&old), 0);
                        assert!(store.delete(&old));
                        deleted.push(old);
                    }
                }

                for gone in &deleted {
                    assert!(store.get(gone, (1, 4)).is_err());
                }
            }

            // shutdown: drain the queue and the retention window
            for name in queued.drain(..).chain(retention.drain()) {
                assert_eq!(store.open_views(&name), 0);
                store.delete(&name);
            }
            assert_eq!(store.report_leaks(), 0);
            let stats = store.stats();
            assert_eq!(stats.created, stats.deleted);
        }
    }
}
