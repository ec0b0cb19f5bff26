//! Kernel scenario tests driven through the hosted port.
//!
//! Each scenario builds its own kernel instance (one kernel trait type per
//! module) and drives time explicitly, so the schedules asserted here are
//! fully deterministic.
use std::sync::Mutex;

/// A per-scenario event log filled in by tasks and asserted by the
/// test-controlled thread.
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

macro_rules! scenario_kernel {
    ($SystemTraits:ident) => {
        tern_port_std::use_port!(unsafe struct $SystemTraits);

        tern_kernel::build! {
            impl KernelCfg for $SystemTraits {
                num_priority_levels: 32,
                num_cpus: 1,
                ticks_per_second: 100,
                time_slice_default: 50,
                timer: {
                    task_priority: 5,
                    task_stack_words: 2048,
                    queue_len: 20,
                },
                reaper: {
                    task_stack_words: 2048,
                },
            }
        }
    };
}

/// Basic priority inheritance: while H waits on the mutex, the holder L
/// runs at H's priority and is never preempted by the middle task M.
mod basic_inheritance {
    use super::EventLog;
    use std::sync::OnceLock;
    use tern_kernel::mutex::{Mutex, MutexCb};
    use tern_kernel::task::{Task, TaskCb, TaskOptions, TaskStack};
    use tern_kernel::Timeout;
    use tern_port_std::{advance_time, boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();
    static MUTEX_X: OnceLock<Mutex<K>> = OnceLock::new();

    static L_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static L_STACK: TaskStack<1024> = TaskStack::new();
    static M_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static M_STACK: TaskStack<1024> = TaskStack::new();
    static H_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static H_STACK: TaskStack<1024> = TaskStack::new();

    static MUTEX_X_CB: MutexCb<K> = <MutexCb<K> as tern_kernel::utils::Init>::INIT;

    fn l_body(_: usize) {
        let x = *MUTEX_X.get().unwrap();
        x.lock(Timeout::Forever).unwrap();
        LOG.push("L:locked");
        Task::<K>::sleep(2).unwrap();
        LOG.push("L:unlocking");
        x.unlock().unwrap();
        LOG.push("L:done");
    }

    fn m_body(_: usize) {
        Task::<K>::sleep(2).unwrap();
        LOG.push("M:ran");
    }

    fn h_body(_: usize) {
        Task::<K>::sleep(1).unwrap();
        LOG.push("H:locking");
        let x = *MUTEX_X.get().unwrap();
        x.lock(Timeout::Forever).unwrap();
        LOG.push("H:locked");
        x.unlock().unwrap();
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        MUTEX_X.set(Mutex::create(&MUTEX_X_CB, "X")).ok().unwrap();

        let l = Task::create(
            &L_CB, "L", l_body, 0, 30, 0, &L_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        Task::create(
            &M_CB, "M", m_body, 0, 20, 0, &M_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        Task::create(
            &H_CB, "H", h_body, 0, 10, 0, &H_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        assert_eq!(LOG.snapshot(), ["L:locked"]);

        // Tick 1: H wakes and blocks on X, raising L to priority 10
        advance_time::<K>(1);
        wait_until_idle::<K>();
        assert_eq!(l.priority(), 10);
        assert_eq!(l.base_priority(), 30);

        // Tick 2: both L and M wake; the inherited priority must order L
        // (and the unblocked H) ahead of M
        advance_time::<K>(1);
        wait_until_idle::<K>();
        assert_eq!(
            LOG.take(),
            [
                "L:locked",
                "H:locking",
                "L:unlocking",
                "H:locked",
                "M:ran",
                "L:done",
            ]
        );
    }
}

/// Chained inheritance: C's priority propagates through B (pending on X)
/// to A, and aborting C's wait unwinds the chain to B's priority.
mod chained_inheritance {
    use super::EventLog;
    use std::sync::OnceLock;
    use tern_kernel::mutex::{Mutex, MutexCb};
    use tern_kernel::semaphore::{Semaphore, SemaphoreCb};
    use tern_kernel::task::{Task, TaskCb, TaskOptions, TaskStack};
    use tern_kernel::Timeout;
    use tern_port_std::{boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();
    static MUTEX_X: OnceLock<Mutex<K>> = OnceLock::new();
    static MUTEX_Y: OnceLock<Mutex<K>> = OnceLock::new();
    static PARK: OnceLock<Semaphore<K>> = OnceLock::new();

    static A_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static A_STACK: TaskStack<1024> = TaskStack::new();
    static B_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static B_STACK: TaskStack<1024> = TaskStack::new();
    static C_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static C_STACK: TaskStack<1024> = TaskStack::new();

    static MUTEX_X_CB: MutexCb<K> = <MutexCb<K> as tern_kernel::utils::Init>::INIT;
    static MUTEX_Y_CB: MutexCb<K> = <MutexCb<K> as tern_kernel::utils::Init>::INIT;
    static PARK_CB: SemaphoreCb<K> = <SemaphoreCb<K> as tern_kernel::utils::Init>::INIT;

    fn a_body(_: usize) {
        MUTEX_X.get().unwrap().lock(Timeout::Forever).unwrap();
        LOG.push("A:holds-X");
        // Park while holding X
        let _ = PARK.get().unwrap().take(Timeout::Forever);
    }

    fn b_body(_: usize) {
        MUTEX_Y.get().unwrap().lock(Timeout::Forever).unwrap();
        LOG.push("B:holds-Y");
        let _ = MUTEX_X.get().unwrap().lock(Timeout::Forever);
        LOG.push("B:got-X");
    }

    fn c_body(_: usize) {
        LOG.push("C:locking-Y");
        let result = MUTEX_Y.get().unwrap().lock(Timeout::Forever);
        LOG.push(format!("C:{result:?}"));
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        MUTEX_X.set(Mutex::create(&MUTEX_X_CB, "X")).ok().unwrap();
        MUTEX_Y.set(Mutex::create(&MUTEX_Y_CB, "Y")).ok().unwrap();
        PARK.set(Semaphore::create(&PARK_CB, "park", 0)).ok().unwrap();

        let a = Task::create(
            &A_CB, "A", a_body, 0, 30, 0, &A_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        let b = Task::create(
            &B_CB, "B", b_body, 0, 25, 0, &B_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        // B is blocked on X, so A already inherited B's priority
        assert_eq!(a.priority(), 25);

        let c = Task::create(
            &C_CB, "C", c_body, 0, 5, 0, &C_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        // C blocks on Y; the raise propagates B -> A
        assert_eq!(b.priority(), 5);
        assert_eq!(a.priority(), 5);

        // Aborting C's wait unwinds the inheritance chain
        c.wait_abort().unwrap();
        wait_until_idle::<K>();
        assert_eq!(b.priority(), 25);
        assert_eq!(a.priority(), 25);

        let log = LOG.take();
        assert!(log.contains(&"C:Err(Interrupted)".to_string()), "{log:?}");
    }
}

/// Queue wake-one: a send with two pending receivers wakes only the
/// higher-priority one, bypassing the buffer.
mod queue_wake_one {
    use super::EventLog;
    use std::sync::OnceLock;
    use tern_kernel::queue::{Queue, QueueCb, QueueStorage};
    use tern_kernel::task::{Task, TaskCb, TaskOptions, TaskStack};
    use tern_kernel::Timeout;
    use tern_port_std::{boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();
    static QUEUE: OnceLock<Queue<K>> = OnceLock::new();

    static R1_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static R1_STACK: TaskStack<1024> = TaskStack::new();
    static R2_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static R2_STACK: TaskStack<1024> = TaskStack::new();

    static QUEUE_CB: QueueCb<K> = <QueueCb<K> as tern_kernel::utils::Init>::INIT;
    static QUEUE_STORAGE: QueueStorage<K, 4> = QueueStorage::new();

    fn r1_body(_: usize) {
        let msg = QUEUE.get().unwrap().recv(Timeout::Forever).unwrap();
        LOG.push(format!("R1:{:#x}", msg as usize));
    }

    fn r2_body(_: usize) {
        let msg = QUEUE.get().unwrap().recv(Timeout::Forever).unwrap();
        LOG.push(format!("R2:{:#x}", msg as usize));
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        QUEUE
            .set(Queue::create(&QUEUE_CB, "q", &QUEUE_STORAGE).unwrap())
            .ok()
            .unwrap();
        let queue = *QUEUE.get().unwrap();

        Task::create(
            &R1_CB, "R1", r1_body, 0, 10, 0, &R1_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        Task::create(
            &R2_CB, "R2", r2_body, 0, 20, 0, &R2_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();

        queue.send(0xAA as *mut ()).unwrap();
        wait_until_idle::<K>();

        // Only the higher-priority receiver woke, and the message never
        // touched the buffer
        assert_eq!(LOG.snapshot(), ["R1:0xaa"]);
        assert_eq!(queue.info().unwrap().count, 0);

        // Release the remaining receiver
        queue.send(0xBB as *mut ()).unwrap();
        wait_until_idle::<K>();
        assert_eq!(LOG.take(), ["R1:0xaa", "R2:0xbb"]);
    }
}

/// Semaphore take with a 5-tick deadline from tick 100 times out exactly at
/// tick 105, and the expiry is a one-shot.
mod sem_timeout {
    use super::EventLog;
    use std::sync::OnceLock;
    use tern_kernel::error::WaitSemaphoreError;
    use tern_kernel::semaphore::{Semaphore, SemaphoreCb};
    use tern_kernel::task::{Task, TaskCb, TaskOptions, TaskStack};
    use tern_kernel::{System, Timeout};
    use tern_port_std::{advance_time, boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();
    static SEM: OnceLock<Semaphore<K>> = OnceLock::new();
    static SEM_CB: SemaphoreCb<K> = <SemaphoreCb<K> as tern_kernel::utils::Init>::INIT;

    static T_CB: TaskCb<K> = <TaskCb<K> as tern_kernel::utils::Init>::INIT;
    static T_STACK: TaskStack<1024> = TaskStack::new();

    fn t_body(_: usize) {
        LOG.push(format!("start@{}", System::<K>::tick_count()));
        let result = SEM.get().unwrap().take(Timeout::Ticks(5));
        assert_eq!(result, Err(WaitSemaphoreError::Timeout));
        LOG.push(format!("timeout@{}", System::<K>::tick_count()));
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        SEM.set(Semaphore::create(&SEM_CB, "s", 0)).ok().unwrap();

        advance_time::<K>(100);
        Task::create(
            &T_CB, "T", t_body, 0, 10, 0, &T_STACK,
            TaskOptions::AUTO_START, None,
        )
        .unwrap();
        wait_until_idle::<K>();
        assert_eq!(LOG.snapshot(), ["start@100"]);

        advance_time::<K>(4);
        wait_until_idle::<K>();
        assert_eq!(LOG.snapshot(), ["start@100"], "woke too early");

        advance_time::<K>(1);
        wait_until_idle::<K>();
        assert_eq!(LOG.snapshot(), ["start@100", "timeout@105"]);

        // The expired deadline must not fire again
        advance_time::<K>(10);
        wait_until_idle::<K>();
        assert_eq!(LOG.take(), ["start@100", "timeout@105"]);
    }
}

/// The software-timer service: a periodic timer with first = 3 and
/// round = 5 fires at ticks 3, 8, 13; `change` while active is rejected;
/// `stop` halts it.
mod timer_service {
    use super::EventLog;
    use std::sync::OnceLock;
    use tern_kernel::error::TimerOpError;
    use tern_kernel::timer::{Timer, TimerCb};
    use tern_kernel::System;
    use tern_port_std::{advance_time, boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();
    static TIMER_CB: TimerCb<K> = <TimerCb<K> as tern_kernel::utils::Init>::INIT;

    fn fire(_timer: Timer<K>, _arg: *mut ()) {
        LOG.push(format!("fire@{}", System::<K>::tick_count()));
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        let timer =
            Timer::create(&TIMER_CB, "t", fire, 3, 5, core::ptr::null_mut(), false).unwrap();

        timer.start().unwrap();
        wait_until_idle::<K>();

        advance_time::<K>(3);
        wait_until_idle::<K>();
        assert_eq!(LOG.snapshot(), ["fire@3"]);

        advance_time::<K>(5);
        wait_until_idle::<K>();
        advance_time::<K>(5);
        wait_until_idle::<K>();
        assert_eq!(LOG.snapshot(), ["fire@3", "fire@8", "fire@13"]);

        // Reconfiguration requires the timer to be stopped first
        assert_eq!(timer.change(7, 7), Err(TimerOpError::BadObjectState));

        timer.stop().unwrap();
        wait_until_idle::<K>();

        advance_time::<K>(20);
        wait_until_idle::<K>();
        assert_eq!(LOG.take(), ["fire@3", "fire@8", "fire@13"]);

        // A stopped timer can be reconfigured and deleted
        timer.change(7, 0).unwrap();
        wait_until_idle::<K>();
        timer.delete().unwrap();
        wait_until_idle::<K>();
        assert_eq!(timer.start(), Err(TimerOpError::BadId));
    }
}

/// Dynamic tasks: the reaper reclaims a finished dynamic task's resources,
/// and the recycled control block serves later creations.
mod dyn_task_reaper {
    use super::EventLog;
    use tern_kernel::task::{Task, TaskOptions};
    use tern_port_std::{boot, log_init, wait_until_idle};

    scenario_kernel!(SystemTraits);
    type K = SystemTraits;

    static LOG: EventLog = EventLog::new();

    fn worker(param: usize) {
        LOG.push(format!("ran:{param}"));
    }

    #[test]
    fn scenario() {
        log_init();
        boot::<K>();

        for i in 0..4 {
            Task::<K>::create_dyn(
                "dyn",
                worker,
                i,
                10,
                0,
                1024,
                TaskOptions::AUTO_START,
                None,
            )
            .unwrap();
            wait_until_idle::<K>();
        }

        assert_eq!(LOG.take(), ["ran:0", "ran:1", "ran:2", "ran:3"]);
    }
}
