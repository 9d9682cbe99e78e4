//! Run loop scheduling, adaptors and cancellation.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use offload_driver::{devinfo_list, CtxState, DriverError, DriverResult, NativeCtx, NativeDevice, NativeRdma};
use offload_runtime::run_loop::ScheduleOperation;
use offload_runtime::{
    just, starts_on, sync_wait, sync_wait_with_stop, Context, IdleStrategy, Just, OperationState,
    PeContext, Receiver, RunLoop, RunLoopConfig, Scheduler, Sender, SenderExt, StopSource,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};

type Log = Arc<Mutex<Vec<(usize, usize, Option<String>)>>>;

struct Collect {
    producer: usize,
    seq: usize,
    log: Log,
}

impl Receiver<(), Infallible> for Collect {
    fn set_value(self, (): ()) {
        let name = thread::current().name().map(str::to_owned);
        self.log.lock().push((self.producer, self.seq, name));
    }

    fn set_error(self, never: Infallible) {
        match never {}
    }

    fn set_stopped(self) {
        panic!("schedule was not cancelled");
    }
}

fn on_driver_thread() -> bool {
    thread::current()
        .name()
        .is_some_and(|name| name.starts_with("offload-pe-"))
}

#[test]
fn continuations_from_many_threads_run_once_in_order_per_producer() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    let ctx = PeContext::new().unwrap();
    let log: Log = Arc::default();

    let total = PRODUCERS * PER_PRODUCER;
    let wait_for_all = |log: &Log| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while log.lock().len() < total {
            assert!(Instant::now() < deadline, "continuations did not all run");
            thread::sleep(Duration::from_millis(1));
        }
    };

    thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let scheduler = ctx.scheduler();
            let log = log.clone();
            scope.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(producer as u64);
                let mut ops: Vec<Pin<Box<ScheduleOperation<Collect>>>> = Vec::with_capacity(PER_PRODUCER);
                for seq in 0..PER_PRODUCER {
                    let mut op = Box::pin(scheduler.schedule().connect(Collect {
                        producer,
                        seq,
                        log: log.clone(),
                    }));
                    op.as_mut().start();
                    ops.push(op);
                    if rng.gen_ratio(1, 16) {
                        thread::yield_now();
                    }
                }
                // Operations stay pinned here until every continuation ran.
                wait_for_all(&log);
            });
        }
    });

    let log = log.lock();
    assert_eq!(log.len(), PRODUCERS * PER_PRODUCER);
    let mut next = [0usize; PRODUCERS];
    for (producer, seq, name) in log.iter() {
        assert_eq!(*seq, next[*producer], "producer {producer} ran out of order");
        next[*producer] += 1;
        assert!(name.as_deref().is_some_and(|n| n.starts_with("offload-pe-")));
    }
}

proptest! {
    #[test]
    fn manual_run_loop_preserves_start_order(batches in proptest::collection::vec(1usize..20, 1..8)) {
        let run_loop = RunLoop::new(RunLoopConfig::default());
        let scheduler = run_loop.scheduler();
        let log: Log = Arc::default();
        let mut expected = Vec::new();
        let mut ops = Vec::new();

        for (producer, batch) in batches.iter().enumerate() {
            for seq in 0..*batch {
                let mut op = Box::pin(scheduler.schedule().connect(Collect {
                    producer,
                    seq,
                    log: log.clone(),
                }));
                op.as_mut().start();
                ops.push(op);
                expected.push((producer, seq));
            }
        }
        prop_assert_eq!(run_loop.run_some(), expected.len());
        let seen: Vec<_> = log.lock().iter().map(|(p, s, _)| (*p, *s)).collect();
        prop_assert_eq!(seen, expected);
        prop_assert!(run_loop.is_empty());
    }
}

#[test]
fn stop_requested_before_start_resolves_stopped() {
    let ctx = PeContext::new().unwrap();
    let source = StopSource::new();
    source.request_stop();

    let ran = AtomicBool::new(false);
    let work = ctx.scheduler().schedule().then(|()| ran.store(true, Ordering::SeqCst));
    assert_eq!(sync_wait_with_stop(work, source.token()), Ok(None));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn starts_on_and_let_value_chain_on_the_driver_thread() {
    let ctx = PeContext::new().unwrap();
    let chained = starts_on(ctx.scheduler(), just(20))
        .let_value(|x| just(x + 1).then(|y| (y, on_driver_thread())));
    assert_eq!(sync_wait(chained), Ok(Some((21, true))));
}

#[test]
fn just_completes_inline() {
    assert_eq!(sync_wait(just("inline").then(str::len)), Ok(Some(6)));
}

struct Fails(&'static str);

struct FailsOp<R> {
    error: &'static str,
    receiver: Option<R>,
}

impl Sender for Fails {
    type Output = u32;
    type Error = &'static str;
    type Operation<R: Receiver<u32, &'static str>> = FailsOp<R>;

    fn connect<R: Receiver<u32, &'static str>>(self, receiver: R) -> FailsOp<R> {
        FailsOp {
            error: self.0,
            receiver: Some(receiver),
        }
    }
}

impl<R: Receiver<u32, &'static str>> OperationState for FailsOp<R> {
    fn start(self: Pin<&mut Self>) {
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(receiver) = this.receiver.take() {
            receiver.set_error(this.error);
        }
    }
}

#[test]
fn errors_skip_then_and_convert_through_let_value() {
    let mapped_ran = AtomicBool::new(false);
    let mapped = Fails("boom").then(|v| {
        mapped_ran.store(true, Ordering::SeqCst);
        v * 2
    });
    assert_eq!(sync_wait(mapped), Err("boom"));
    assert!(!mapped_ran.load(Ordering::SeqCst));

    let chained = Fails("bad descriptor").let_value(Just::<u32, String>::new);
    assert_eq!(sync_wait(chained), Err("bad descriptor".to_owned()));
}

#[test]
fn every_idle_strategy_makes_progress() {
    for idle in [
        IdleStrategy::Spin,
        IdleStrategy::Yield,
        IdleStrategy::Park(Duration::from_micros(10)),
        IdleStrategy::Park(Duration::from_millis(20)),
    ] {
        let ctx = PeContext::with_config(RunLoopConfig::with_idle(idle)).unwrap();
        let counter = AtomicUsize::new(0);
        for _ in 0..50 {
            let work = ctx.scheduler().schedule().then(|()| counter.fetch_add(1, Ordering::SeqCst));
            sync_wait(work).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        ctx.join().unwrap();
    }
}

struct Bare(NativeRdma);

impl Context for Bare {
    fn as_ctx(&self) -> &NativeCtx {
        self.0.as_ctx()
    }

    fn start(&self) -> DriverResult<()> {
        self.0.start()
    }

    fn stop(&self) -> DriverResult<()> {
        self.0.stop()
    }
}

#[test]
fn contexts_register_once_through_the_driver_thread() {
    let device = NativeDevice::open(&devinfo_list()[0]).unwrap();
    let bare = Bare(NativeRdma::create(&device).unwrap());
    assert_eq!(bare.start(), Err(DriverError::BadState));

    let ctx = PeContext::new().unwrap();
    ctx.connect_ctx(&bare).unwrap();
    assert_eq!(ctx.connect_ctx(&bare), Err(DriverError::BadState));

    bare.start().unwrap();
    assert_eq!(bare.state(), CtxState::Running);
    bare.stop().unwrap();
    assert_eq!(bare.state(), CtxState::Idle);
}

/// Counts every completion it receives.
struct Count(Arc<AtomicUsize>);

impl Receiver<(), Infallible> for Count {
    fn set_value(self, (): ()) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn set_error(self, never: Infallible) {
        match never {}
    }

    fn set_stopped(self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn counters(n: usize) -> Vec<Arc<AtomicUsize>> {
    (0..n).map(|_| Arc::new(AtomicUsize::new(0))).collect()
}

fn hits(counters: &[Arc<AtomicUsize>]) -> Vec<usize> {
    counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
}

#[test]
fn dropping_a_queued_operation_unlinks_it() {
    let run_loop = RunLoop::new(RunLoopConfig::default());
    let scheduler = run_loop.scheduler();
    let counts = counters(4);
    let mut ops: Vec<_> = counts
        .iter()
        .map(|count| Box::pin(scheduler.schedule().connect(Count(count.clone()))))
        .collect();
    for op in &mut ops {
        op.as_mut().start();
    }
    assert_eq!(run_loop.len(), 4);

    drop(ops.remove(3));
    drop(ops.remove(1));
    assert_eq!(run_loop.len(), 2);

    assert_eq!(run_loop.run_some(), 2);
    assert!(run_loop.is_empty());
    assert_eq!(hits(&counts), vec![1, 0, 1, 0]);
}

#[test]
fn started_operations_complete_exactly_once() {
    const PRODUCERS: usize = 3;
    const PER_PRODUCER: usize = 100;

    let ctx = PeContext::new().unwrap();
    let counts = counters(PRODUCERS * PER_PRODUCER);

    thread::scope(|scope| {
        for chunk in counts.chunks(PER_PRODUCER) {
            let scheduler = ctx.scheduler();
            scope.spawn(move || {
                let mut ops = Vec::with_capacity(chunk.len());
                for count in chunk {
                    let mut op = Box::pin(scheduler.schedule().connect(Count(count.clone())));
                    op.as_mut().start();
                    ops.push(op);
                }
                let deadline = Instant::now() + Duration::from_secs(10);
                while chunk.iter().any(|c| c.load(Ordering::SeqCst) == 0) {
                    assert!(Instant::now() < deadline, "operations did not all complete");
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
    });

    // A few more loop passes must not deliver anything twice.
    sync_wait(ctx.scheduler().schedule()).unwrap();
    thread::sleep(Duration::from_millis(10));
    assert!(hits(&counts).iter().all(|&n| n == 1), "{:?}", hits(&counts));
}

#[test]
fn dropping_right_after_start_never_completes_twice() {
    let ctx = PeContext::new().unwrap();
    let counts = counters(500);
    for (i, count) in counts.iter().enumerate() {
        let mut op = Box::pin(ctx.scheduler().schedule().connect(Count(count.clone())));
        op.as_mut().start();
        if i % 2 == 0 {
            thread::yield_now();
        }
        drop(op);
    }

    sync_wait(ctx.scheduler().schedule()).unwrap();
    assert!(ctx.scheduler().run_loop().is_empty());
    let seen = hits(&counts);
    assert!(seen.iter().all(|&n| n <= 1), "{seen:?}");
}
