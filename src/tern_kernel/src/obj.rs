//! The common header embedded in every waitable kernel object.
use crate::error::BadIdError;
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::task::TaskCb;
use crate::utils::{intrusive_list::ListHead, Init};
use crate::KernelTraits;

/// The object-type tag. It is stamped when an object is created and cleared
/// back to `None` on deletion; every entry point checks it so that a stale
/// handle is caught instead of corrupting a dead object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjKind {
    None,
    Semaphore,
    Queue,
    Mutex,
    Timer,
}

impl Init for ObjKind {
    const INIT: Self = Self::None;
}

/// Specifies the sorting order of a pend list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// The pend list is processed in a FIFO order.
    Fifo,
    /// The pend list is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

impl Init for QueueOrder {
    const INIT: Self = Self::TaskPriority;
}

/// Whether an object's storage came from the embedder or the kernel heap.
/// Deletion entry points are split along this axis and refuse the wrong kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocKind {
    Static,
    #[cfg(feature = "dyn_alloc")]
    Dynamic,
}

impl Init for AllocKind {
    const INIT: Self = Self::Static;
}

/// The common header of every waitable object: identity plus the pend list
/// of tasks blocked on the object.
pub(crate) struct BlockObj<Traits: KernelTraits> {
    pub(crate) name: CpuLockCell<Traits, &'static str>,
    pub(crate) kind: CpuLockCell<Traits, ObjKind>,
    pub(crate) order: CpuLockCell<Traits, QueueOrder>,
    pub(crate) pend_list: CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
}

impl<Traits: KernelTraits> Init for BlockObj<Traits> {
    const INIT: Self = Self {
        name: Init::INIT,
        kind: Init::INIT,
        order: Init::INIT,
        pend_list: CpuLockCell::new(ListHead::INIT),
    };
}

impl<Traits: KernelTraits> BlockObj<Traits> {
    pub(crate) fn init(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        name: &'static str,
        kind: ObjKind,
        order: QueueOrder,
    ) {
        self.name.replace(&mut *lock, name);
        self.order.replace(&mut *lock, order);
        self.pend_list.replace(&mut *lock, ListHead::INIT);
        self.kind.replace(&mut *lock, kind);
    }

    /// Validate the type tag, rejecting deleted and never-created objects.
    #[inline]
    pub(crate) fn expect_kind(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        kind: ObjKind,
    ) -> Result<(), BadIdError> {
        if self.kind.get(&*lock) == kind {
            Ok(())
        } else {
            Err(BadIdError::BadId)
        }
    }
}

/// The kernel object registry. Every create links the new object here and
/// every delete unlinks it, giving debuggers one place to enumerate live
/// objects from.
#[cfg(feature = "system_stats")]
pub(crate) struct KObjRegistry<Traits: KernelTraits> {
    pub(crate) tasks: CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
    pub(crate) semaphores: CpuLockCell<Traits, ListHead<crate::semaphore::SemaphoreCb<Traits>>>,
    pub(crate) queues: CpuLockCell<Traits, ListHead<crate::queue::QueueCb<Traits>>>,
    pub(crate) mutexes: CpuLockCell<Traits, ListHead<crate::mutex::MutexCb<Traits>>>,
}

#[cfg(feature = "system_stats")]
impl<Traits: KernelTraits> Init for KObjRegistry<Traits> {
    const INIT: Self = Self {
        tasks: CpuLockCell::new(ListHead::INIT),
        semaphores: CpuLockCell::new(ListHead::INIT),
        queues: CpuLockCell::new(ListHead::INIT),
        mutexes: CpuLockCell::new(ListHead::INIT),
    };
}
