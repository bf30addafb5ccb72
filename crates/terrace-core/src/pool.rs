//! # Buffer Pool
//!
//! Typed, reusable buffers handed out against release groups ("packs").
//!
//! - Free lists are kept per element type (`TypeId`), so storage released as
//!   `f32` is only ever handed out again as `f32`.
//! - Every buffer acquired through a `Pack` is freed by one call on that pack.
//! - A pack must not be freed while a job touching its buffers is running.
//!   `release_all` detects that through the pack's tracked job handles and
//!   refuses (counted as misuse); `dispose` defers the free behind a handle.
//!
//! The pool itself is only touched from the scheduling thread. Worker jobs
//! see buffers through `PooledBuffer` clones, never through the pool.

use crate::{FlowError, JobHandle};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

/// Element types a pooled buffer can hold.
pub trait Element: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Element for T {}

// =============================================================================
// BUFFERS
// =============================================================================

struct BufferCell<T> {
    data: RwLock<Vec<T>>,
    released: AtomicBool,
}

trait Reclaim: Send + Sync {
    /// Mark released and recycle the storage. Returns `false` if the
    /// storage was locked and stays with the remaining handles instead.
    fn reclaim(&self, free: &mut FreeLists) -> bool;
}

impl<T: Element> Reclaim for BufferCell<T> {
    fn reclaim(&self, free: &mut FreeLists) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return true;
        }
        let mut data = match self.data.try_write() {
            Ok(data) => data,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        free.put(std::mem::take(&mut *data));
        true
    }
}

/// Shared handle to one pooled buffer.
///
/// Clones refer to the same storage. Once the owning pack is released every
/// clone reports `UseAfterFree`.
#[derive(Clone)]
pub struct PooledBuffer<T: Element> {
    cell: Arc<BufferCell<T>>,
}

impl<T: Element> PooledBuffer<T> {
    /// Whether the owning pack has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.cell.released.load(Ordering::Acquire)
    }

    /// Shared access to the contents.
    ///
    /// Drop the guard before the owning pack is released: storage still
    /// locked at release is not recycled and the release counts as misuse.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>, FlowError> {
        if self.is_released() {
            return Err(FlowError::UseAfterFree);
        }
        Ok(self.cell.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Exclusive access to the contents.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, FlowError> {
        if self.is_released() {
            return Err(FlowError::UseAfterFree);
        }
        Ok(self.cell.data.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Result<Vec<T>, FlowError> {
        Ok(self.read()?.clone())
    }

    /// Number of elements (0 once released).
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().map(|data| data.len()).unwrap_or(0)
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Element> fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}

// =============================================================================
// FREE LISTS
// =============================================================================

#[derive(Default)]
struct FreeLists {
    lists: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl FreeLists {
    /// Take recycled storage, preferring one that already fits `len`.
    fn take<T: Element>(&mut self, len: usize) -> Option<Vec<T>> {
        let list = self
            .lists
            .get_mut(&TypeId::of::<T>())?
            .downcast_mut::<Vec<Vec<T>>>()?;
        if list.is_empty() {
            return None;
        }
        let index = list
            .iter()
            .position(|storage| storage.capacity() >= len)
            .unwrap_or(list.len() - 1);
        Some(list.swap_remove(index))
    }

    fn put<T: Element>(&mut self, mut storage: Vec<T>) {
        storage.clear();
        let key = TypeId::of::<T>();
        match self
            .lists
            .get_mut(&key)
            .and_then(|list| list.downcast_mut::<Vec<Vec<T>>>())
        {
            Some(list) => list.push(storage),
            None => {
                self.lists.insert(key, Box::new(vec![storage]));
            }
        }
    }

    fn count<T: Element>(&self) -> usize {
        self.lists
            .get(&TypeId::of::<T>())
            .and_then(|list| list.downcast_ref::<Vec<Vec<T>>>())
            .map_or(0, Vec::len)
    }
}

// =============================================================================
// PACK
// =============================================================================

/// Release group: every buffer acquired through it is freed together.
pub struct Pack {
    id: u64,
    buffers: Vec<Arc<dyn Reclaim>>,
    handles: Vec<JobHandle>,
}

impl Pack {
    fn new(id: u64) -> Self {
        Self {
            id,
            buffers: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// Identifier used in diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of buffers held by this pack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pack holds no buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Register a job that reads or writes this pack's buffers.
    pub fn track(&mut self, handle: JobHandle) {
        self.handles.retain(|tracked| !tracked.is_completed());
        if !handle.is_completed() {
            self.handles.push(handle);
        }
    }

    /// Number of tracked jobs still running.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| !handle.is_completed())
            .count()
    }

    /// Handle completing once every tracked job has.
    #[must_use]
    pub fn completion(&self) -> JobHandle {
        JobHandle::combine(&self.handles)
    }
}

impl fmt::Debug for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pack")
            .field("id", &self.id)
            .field("buffers", &self.buffers.len())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// =============================================================================
// BUFFER POOL
// =============================================================================

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub packs_created: u64,
    pub acquired: u64,
    /// Acquisitions served from a free list.
    pub reused: u64,
    pub released_buffers: u64,
    pub released_packs: u64,
    /// Packs whose free was deferred behind a job handle.
    pub deferred: u64,
    /// Packs released while jobs were still outstanding, plus buffers
    /// still locked when their pack was freed.
    pub misuse: u64,
    /// Deferred packs given up on at shutdown because their jobs never
    /// finished. Their storage stays with the jobs.
    pub abandoned: u64,
}

/// Typed arena of reusable buffers.
#[derive(Default)]
pub struct BufferPool {
    free: FreeLists,
    next_pack: u64,
    deferred: Vec<(Pack, JobHandle)>,
    stats: PoolStats,
}

impl BufferPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new release group.
    pub fn new_pack(&mut self) -> Pack {
        self.next_pack = self.next_pack.saturating_add(1);
        self.stats.packs_created += 1;
        Pack::new(self.next_pack)
    }

    /// Storage for exactly `len` elements, tracked by `pack`.
    ///
    /// Recycled storage keeps no meaningful content; callers overwrite it.
    pub fn acquire<T: Element>(&mut self, pack: &mut Pack, len: usize) -> PooledBuffer<T> {
        let mut storage = self.storage::<T>(len);
        storage.resize(len, T::default());
        self.track(pack, storage)
    }

    /// Storage initialised with a copy of `source`, tracked by `pack`.
    pub fn acquire_from<T: Element>(&mut self, pack: &mut Pack, source: &[T]) -> PooledBuffer<T> {
        let mut storage = self.storage::<T>(source.len());
        storage.extend_from_slice(source);
        self.track(pack, storage)
    }

    /// Free every buffer of `pack` now.
    ///
    /// Fails with `ResourceMisuse` if a tracked job is still running. The
    /// pack is then deferred instead of freed, so no buffer is reclaimed
    /// underneath a worker.
    pub fn release_all(&mut self, pack: Pack) -> Result<usize, FlowError> {
        let outstanding = pack.outstanding();
        if outstanding > 0 {
            let id = pack.id;
            self.stats.misuse += 1;
            tracing::error!(
                pack = id,
                outstanding,
                "pack released while jobs still use its buffers; deferring"
            );
            self.defer(pack, JobHandle::completed());
            return Err(FlowError::ResourceMisuse { pack: id, outstanding });
        }
        Ok(self.reclaim(pack))
    }

    /// Free `pack` once `handle` and every tracked job have completed.
    pub fn dispose(&mut self, pack: Pack, handle: JobHandle) {
        if handle.is_completed() && pack.outstanding() == 0 {
            self.reclaim(pack);
        } else {
            self.defer(pack, handle);
        }
    }

    /// Free deferred packs whose jobs have finished. Returns buffers freed.
    pub fn collect(&mut self) -> usize {
        let mut freed = 0;
        let mut waiting = Vec::new();
        for (pack, handle) in std::mem::take(&mut self.deferred) {
            if handle.is_completed() {
                freed += self.reclaim(pack);
            } else {
                waiting.push((pack, handle));
            }
        }
        self.deferred = waiting;
        freed
    }

    /// Number of packs waiting on jobs before they can be freed.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.deferred.len()
    }

    /// Stop tracking every deferred pack without freeing it.
    ///
    /// Storage still referenced by a running job stays alive through that
    /// job's buffer handles. Returns the number of packs given up.
    pub fn abandon_pending(&mut self) -> usize {
        let abandoned = std::mem::take(&mut self.deferred);
        for (pack, _) in &abandoned {
            tracing::warn!(
                pack = pack.id,
                outstanding = pack.outstanding(),
                "pack abandoned with jobs still running"
            );
        }
        self.stats.abandoned += abandoned.len() as u64;
        abandoned.len()
    }

    /// Handle completing once every deferred pack can be freed.
    #[must_use]
    pub fn pending_completion(&self) -> JobHandle {
        let handles: Vec<JobHandle> = self.deferred.iter().map(|(_, h)| h.clone()).collect();
        JobHandle::combine(&handles)
    }

    /// Recycled buffers of element type `T` ready for reuse.
    #[must_use]
    pub fn free_count<T: Element>(&self) -> usize {
        self.free.count::<T>()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    fn storage<T: Element>(&mut self, len: usize) -> Vec<T> {
        self.stats.acquired += 1;
        match self.free.take::<T>(len) {
            Some(storage) => {
                self.stats.reused += 1;
                storage
            }
            None => Vec::with_capacity(len),
        }
    }

    fn track<T: Element>(&mut self, pack: &mut Pack, storage: Vec<T>) -> PooledBuffer<T> {
        let cell = Arc::new(BufferCell {
            data: RwLock::new(storage),
            released: AtomicBool::new(false),
        });
        pack.buffers.push(Arc::clone(&cell) as Arc<dyn Reclaim>);
        PooledBuffer { cell }
    }

    fn defer(&mut self, pack: Pack, handle: JobHandle) {
        self.stats.deferred += 1;
        let handle = JobHandle::combine(&[handle, pack.completion()]);
        tracing::debug!(pack = pack.id, "pack free deferred behind job handle");
        self.deferred.push((pack, handle));
    }

    fn reclaim(&mut self, pack: Pack) -> usize {
        let mut count = 0;
        for buffer in &pack.buffers {
            if buffer.reclaim(&mut self.free) {
                count += 1;
            } else {
                self.stats.misuse += 1;
                tracing::error!(pack = pack.id, "buffer still locked at release; storage not recycled");
            }
        }
        self.stats.released_buffers += count as u64;
        self.stats.released_packs += 1;
        tracing::debug!(pack = pack.id, buffers = count, "pack released");
        count
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("next_pack", &self.next_pack)
            .field("deferred", &self.deferred.len())
            .field("stats", &self.stats)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobTrigger;

    #[test]
    fn acquire_returns_requested_length() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();

        let buffer = pool.acquire::<f32>(&mut pack, 16);

        assert_eq!(buffer.len(), 16);
        assert_eq!(pack.len(), 1);
    }

    #[test]
    fn acquire_from_copies_source() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();

        let buffer = pool.acquire_from(&mut pack, &[1u32, 2, 3]);

        assert_eq!(buffer.to_vec().expect("read"), vec![1, 2, 3]);
    }

    #[test]
    fn release_returns_storage_to_typed_free_list() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let _heights = pool.acquire::<f32>(&mut pack, 8);
        let _counts = pool.acquire::<u32>(&mut pack, 8);

        let freed = pool.release_all(pack).expect("release");

        assert_eq!(freed, 2);
        assert_eq!(pool.free_count::<f32>(), 1);
        assert_eq!(pool.free_count::<u32>(), 1);
        assert_eq!(pool.free_count::<u64>(), 0);
    }

    #[test]
    fn released_storage_is_reused() {
        let mut pool = BufferPool::new();
        let mut first = pool.new_pack();
        let _ = pool.acquire::<f32>(&mut first, 64);
        pool.release_all(first).expect("release");

        let mut second = pool.new_pack();
        let buffer = pool.acquire::<f32>(&mut second, 32);

        assert_eq!(buffer.len(), 32);
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(pool.free_count::<f32>(), 0);
    }

    #[test]
    fn stale_handle_reports_use_after_free() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let buffer = pool.acquire::<f32>(&mut pack, 4);
        pool.release_all(pack).expect("release");

        assert!(buffer.is_released());
        assert!(matches!(buffer.read(), Err(FlowError::UseAfterFree)));
        assert!(matches!(buffer.write(), Err(FlowError::UseAfterFree)));
    }

    #[test]
    fn release_with_running_job_is_misuse_and_deferred() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let buffer = pool.acquire_from(&mut pack, &[7.0f32; 4]);
        let (trigger, job) = JobTrigger::pending();
        pack.track(job);

        let result = pool.release_all(pack);

        assert!(matches!(
            result,
            Err(FlowError::ResourceMisuse { outstanding: 1, .. })
        ));
        assert_eq!(pool.stats().misuse, 1);
        assert_eq!(pool.pending_releases(), 1);
        assert_eq!(buffer.to_vec().expect("still readable"), vec![7.0; 4]);
        assert_eq!(pool.collect(), 0);

        trigger.complete();
        assert_eq!(pool.collect(), 1);
        assert_eq!(pool.pending_releases(), 0);
        assert!(buffer.is_released());
    }

    #[test]
    fn release_while_reading_does_not_block() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let buffer = pool.acquire_from(&mut pack, &[1u16, 2]);
        let guard = buffer.read().expect("read");

        let freed = pool.release_all(pack).expect("release");

        assert_eq!(freed, 0);
        assert_eq!(pool.stats().misuse, 1);
        assert_eq!(pool.free_count::<u16>(), 0);
        assert_eq!(*guard, vec![1, 2]);
        drop(guard);
        assert!(buffer.is_released());
        assert!(matches!(buffer.read(), Err(FlowError::UseAfterFree)));
    }

    #[test]
    fn abandoning_keeps_storage_with_the_job() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let buffer = pool.acquire_from(&mut pack, &[3u8; 4]);
        let (_trigger, job) = JobTrigger::pending();
        pool.dispose(pack, job);

        assert_eq!(pool.abandon_pending(), 1);

        assert_eq!(pool.pending_releases(), 0);
        assert_eq!(pool.stats().abandoned, 1);
        assert_eq!(pool.stats().released_packs, 0);
        assert_eq!(buffer.to_vec().expect("still owned by the job"), vec![3; 4]);
    }

    #[test]
    fn dispose_waits_for_handle() {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let buffer = pool.acquire::<u8>(&mut pack, 3);
        let (trigger, job) = JobTrigger::pending();

        pool.dispose(pack, job);
        assert_eq!(pool.stats().deferred, 1);
        assert!(!buffer.is_released());
        assert!(!pool.pending_completion().is_completed());

        trigger.complete();
        pool.collect();
        assert!(buffer.is_released());
        assert_eq!(pool.stats().misuse, 0);
    }
}
