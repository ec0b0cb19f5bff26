//! Message queues
//!
//! A bounded FIFO of pointer-sized opaque messages. When receivers are
//! already waiting, a sent message bypasses the buffer and is handed
//! directly to the head waiter's message slot.
use core::fmt;

use crate::error::{FlushQueueError, QueryKobjError, RecvQueueError, SendQueueError};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::obj::{AllocKind, BlockObj, ObjKind, QueueOrder};
use crate::sched;
use crate::task::{TaskCb, WakeReason};
use crate::trace;
use crate::utils::ring_buffer::{MsgSlot, RawMessage, RingBuf};
use crate::utils::Init;
use crate::wait::{self, BlkSource};
use crate::{KernelTraits, Timeout};

use crate::error::CreateKobjError;
#[cfg(feature = "system_stats")]
use crate::utils::intrusive_list::ListAccessor;
#[cfg(any(feature = "system_stats", feature = "dyn_alloc"))]
use crate::utils::intrusive_list::{Link, ListHead};

/// Message-slot storage for one queue, supplied by the embedder.
pub struct QueueStorage<Traits: 'static, const N: usize> {
    slots: [MsgSlot<Traits>; N],
}

impl<Traits: 'static, const N: usize> QueueStorage<Traits, N> {
    pub const fn new() -> Self {
        Self {
            slots: <[MsgSlot<Traits>; N] as Init>::INIT,
        }
    }

    #[doc(hidden)]
    pub fn slots(&'static self) -> &'static [MsgSlot<Traits>] {
        &self.slots
    }
}

/// A snapshot of a queue's occupancy.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    /// Buffered messages.
    pub count: usize,
    /// Capacity in messages.
    pub size: usize,
    /// The highest occupancy ever observed.
    #[cfg(feature = "system_stats")]
    pub peak: usize,
}

/// *Queue control block* - the state data of a message queue.
pub struct QueueCb<Traits: KernelTraits> {
    pub(crate) blk_obj: BlockObj<Traits>,
    pub(crate) ring: RingBuf<Traits>,
    #[cfg(feature = "system_stats")]
    pub(crate) peak_num: CpuLockCell<Traits, usize>,
    pub(crate) alloc_kind: CpuLockCell<Traits, AllocKind>,
    #[cfg(feature = "system_stats")]
    pub(crate) registry_link: CpuLockCell<Traits, Option<Link<QueueCb<Traits>>>>,
    #[cfg(feature = "dyn_alloc")]
    pub(crate) pool_link: CpuLockCell<Traits, Option<Link<QueueCb<Traits>>>>,
}

impl<Traits: KernelTraits> Init for QueueCb<Traits> {
    const INIT: Self = Self {
        blk_obj: Init::INIT,
        ring: Init::INIT,
        #[cfg(feature = "system_stats")]
        peak_num: Init::INIT,
        alloc_kind: Init::INIT,
        #[cfg(feature = "system_stats")]
        registry_link: Init::INIT,
        #[cfg(feature = "dyn_alloc")]
        pool_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

/// A handle to a message queue.
pub struct Queue<Traits: KernelTraits>(&'static QueueCb<Traits>);

impl<Traits: KernelTraits> Clone for Queue<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for Queue<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Queue").field(&(self.0 as *const _)).finish()
    }
}

#[cfg(feature = "system_stats")]
fn registry_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<QueueCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    QueueCb<Traits>,
    impl Fn(&'static QueueCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<QueueCb<Traits>>>>,
> {
    ListAccessor::new(head, |cb: &'static QueueCb<Traits>| &cb.registry_link)
}

#[cfg(feature = "dyn_alloc")]
fn pool_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<QueueCb<Traits>>>,
) -> crate::utils::intrusive_list::ListAccessor<
    'a,
    Traits,
    QueueCb<Traits>,
    impl Fn(&'static QueueCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<QueueCb<Traits>>>>,
> {
    crate::utils::intrusive_list::ListAccessor::new(head, |cb: &'static QueueCb<Traits>| {
        &cb.pool_link
    })
}

impl<Traits: KernelTraits> Queue<Traits> {
    pub(crate) fn from_cb(cb: &'static QueueCb<Traits>) -> Self {
        Self(cb)
    }

    /// Initialize a queue control block over the given message storage.
    pub fn create<const N: usize>(
        cb: &'static QueueCb<Traits>,
        name: &'static str,
        storage: &'static QueueStorage<Traits, N>,
    ) -> Result<Queue<Traits>, CreateKobjError> {
        // An empty buffer cannot distinguish full from empty
        if N == 0 {
            return Err(CreateKobjError::BadParam);
        }
        Ok(create_queue(cb, name, storage.slots(), AllocKind::Static))
    }

    /// Like [`Self::create`], but the control block and the message storage
    /// are allocated from the kernel heap.
    #[cfg(feature = "dyn_alloc")]
    pub fn create_dyn(name: &'static str, len: usize) -> Result<Queue<Traits>, CreateKobjError> {
        use alloc::boxed::Box;
        use alloc::vec::Vec;

        if len == 0 {
            return Err(CreateKobjError::BadParam);
        }

        let slots: &'static [MsgSlot<Traits>] = Box::leak(
            (0..len)
                .map(|_| MsgSlot::INIT)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );

        let cb = {
            let mut lock = klock::relock_cpu::<Traits>();
            pool_accessor(&Traits::state().queue_pool).pop_front(lock.borrow_mut())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => Box::leak(Box::new(QueueCb::INIT)),
        };

        Ok(create_queue(cb, name, slots, AllocKind::Dynamic))
    }

    /// Append a message, or hand it directly to the head waiter if any
    /// receiver is pending.
    pub fn send(self, msg: *mut ()) -> Result<(), SendQueueError> {
        self.send_inner(msg, false)
    }

    /// Like [`Self::send`], but every pending receiver is woken and handed
    /// the same message.
    pub fn send_all(self, msg: *mut ()) -> Result<(), SendQueueError> {
        self.send_inner(msg, true)
    }

    fn send_inner(self, msg: *mut (), wake_all: bool) -> Result<(), SendQueueError> {
        let cb = self.0;
        let mut lock = klock::relock_cpu::<Traits>();
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;

        if cb.ring.len(lock.borrow_mut()) >= cb.ring.capacity(lock.borrow_mut()) {
            return Err(SendQueueError::QueueFull);
        }

        if cb.blk_obj.pend_list.get(&*lock).is_empty() {
            // No receiver is waiting; the message goes through the buffer
            let pushed = cb.ring.push(lock.borrow_mut(), RawMessage(msg));
            debug_assert!(pushed);

            #[cfg(feature = "system_stats")]
            {
                let num = cb.ring.len(lock.borrow_mut());
                if num > cb.peak_num.get(&*lock) {
                    cb.peak_num.replace(&mut *lock, num);
                }
            }

            Traits::trace(trace::Event::QueueSend { queue: cb });
            return Ok(());
        }

        // Hand the message to the waiter(s) directly, bypassing the buffer
        if wake_all {
            while let Some(front) = wait::pend_list_front(lock.borrow_mut(), &cb.blk_obj) {
                deliver_msg(lock.borrow_mut(), front, msg);
            }
        } else {
            let front = wait::pend_list_front(lock.borrow_mut(), &cb.blk_obj)
                .expect("non-empty pend list without a head");
            deliver_msg(lock.borrow_mut(), front, msg);
        }

        Traits::trace(trace::Event::QueueSend { queue: cb });

        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// Receive the oldest message, waiting up to `timeout` for one to
    /// arrive.
    pub fn recv(self, timeout: Timeout) -> Result<*mut (), RecvQueueError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;

        // Only the polling form may be used inside an interrupt handler
        if !timeout.is_no_wait() {
            sched::expect_no_isr(lock.borrow_mut())?;
        }

        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;

        if let Some(msg) = cb.ring.pop(lock.borrow_mut()) {
            return Ok(msg.0);
        }

        if timeout.is_no_wait() {
            return Err(RecvQueueError::WouldBlock);
        }

        let task = sched::expect_task_context(lock.borrow_mut())?;
        if Traits::state().cpu_current().sched_lock.get(&*lock) > 0 {
            return Err(RecvQueueError::SchedulerLocked);
        }

        wait::pend_to_blk_obj(
            lock.borrow_mut(),
            task,
            BlkSource::Queue(cb),
            timeout.deadline_ticks(),
        );

        Traits::trace(trace::Event::QueueRecvBlk { queue: cb, task });

        sched::critical_exit_sched(lock);

        // The task was rescheduled; the sender left the message in our slot
        let mut lock = klock::relock_cpu::<Traits>();
        let reason = wait::pend_end(lock.borrow_mut(), task);
        let msg = task.msg.replace(&mut *lock, RawMessage::NULL);
        drop(lock);

        match reason {
            Ok(()) => Ok(msg.0),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the buffer is at capacity.
    pub fn is_full(self) -> Result<bool, QueryKobjError> {
        let cb = self.0;
        let mut lock = klock::relock_cpu::<Traits>();
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;
        Ok(cb.ring.len(lock.borrow_mut()) >= cb.ring.capacity(lock.borrow_mut()))
    }

    /// A snapshot of the queue's occupancy.
    pub fn info(self) -> Result<QueueInfo, QueryKobjError> {
        let cb = self.0;
        let mut lock = klock::relock_cpu::<Traits>();
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;
        Ok(QueueInfo {
            count: cb.ring.len(lock.borrow_mut()),
            size: cb.ring.capacity(lock.borrow_mut()),
            #[cfg(feature = "system_stats")]
            peak: cb.peak_num.get(&*lock),
        })
    }

    /// Discard every buffered message. Waiting receivers are unaffected.
    pub fn flush(self) -> Result<(), FlushQueueError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;
        cb.ring.reset(lock.borrow_mut());
        Ok(())
    }

    /// Delete the queue, waking every waiter with the `Deleted` reason.
    pub fn delete(self) -> Result<(), crate::error::DeleteKobjError> {
        delete_queue(self.0, AllocKind::Static)
    }

    /// Delete a dynamically created queue, recycling its control block and
    /// freeing its message storage.
    #[cfg(feature = "dyn_alloc")]
    pub fn delete_dyn(self) -> Result<(), crate::error::DeleteKobjError> {
        use alloc::boxed::Box;

        delete_queue(self.0, AllocKind::Dynamic)?;

        let mut lock = klock::relock_cpu::<Traits>();
        let slots = self.0.ring.detach(lock.borrow_mut());
        pool_accessor(&Traits::state().queue_pool).push_back(lock.borrow_mut(), self.0);
        drop(lock);

        if let Some(slots) = slots {
            // Safety: the slots were leaked from a boxed slice by
            // `create_dyn` and the ring held the only reference
            drop(unsafe {
                Box::from_raw(slots as *const [MsgSlot<Traits>] as *mut [MsgSlot<Traits>])
            });
        }
        Ok(())
    }
}

/// Write the message into the waiter's slot and wake it.
fn deliver_msg<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    msg: *mut (),
) {
    task.msg.replace(&mut *lock, RawMessage(msg));
    wait::wake_task(lock, task, WakeReason::Finish);
}

pub(crate) fn create_queue<Traits: KernelTraits>(
    cb: &'static QueueCb<Traits>,
    name: &'static str,
    slots: &'static [MsgSlot<Traits>],
    alloc_kind: AllocKind,
) -> Queue<Traits> {
    let mut lock = klock::relock_cpu::<Traits>();

    cb.ring.attach(lock.borrow_mut(), slots);
    #[cfg(feature = "system_stats")]
    cb.peak_num.replace(&mut *lock, 0);
    cb.alloc_kind.replace(&mut *lock, alloc_kind);

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.queues).push_back(lock.borrow_mut(), cb);

    cb.blk_obj.init(
        lock.borrow_mut(),
        name,
        ObjKind::Queue,
        QueueOrder::TaskPriority,
    );

    Queue(cb)
}

fn delete_queue<Traits: KernelTraits>(
    cb: &'static QueueCb<Traits>,
    expected_kind: AllocKind,
) -> Result<(), crate::error::DeleteKobjError> {
    use crate::error::DeleteKobjError;

    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_no_isr(lock.borrow_mut())?;
    cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Queue)?;

    if cb.alloc_kind.get(&*lock) != expected_kind {
        return Err(DeleteKobjError::BadKind);
    }

    cb.blk_obj.kind.replace(&mut *lock, ObjKind::None);

    wait::wake_all_pending(lock.borrow_mut(), &cb.blk_obj, WakeReason::Deleted);
    cb.ring.reset(lock.borrow_mut());

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.queues).remove(lock.borrow_mut(), cb);

    sched::critical_exit_sched(lock);
    Ok(())
}
