// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end dataflow designs run through the public API.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tapa_rt::{yield_now, ContextMode, IStream, Mode, OStream, Seq, Stream, Streams, Task};

async fn produce_floats(out: OStream<f32>, n: u32) {
    for i in 0..n {
        out.write(i as f32).await;
    }
    out.close().await;
}

async fn sum_floats(input: IStream<f32>, result: Arc<Mutex<Option<f64>>>) {
    let mut sum = 0.0f64;
    while let Some(v) = input.next_value().await {
        sum += v as f64;
    }
    input.open().await;
    *result.lock().unwrap() = Some(sum);
}

#[test]
fn float_pipeline_sums_to_expected() {
    common::init_tracing();
    let result = Arc::new(Mutex::new(None));
    let s: Stream<f32> = Stream::with_depth("a_to_b", 8);
    Task::new()
        .invoke(Mode::Join, produce_floats(s.ostream(), 1000))
        .invoke(Mode::Join, sum_floats(s.istream(), result.clone()));
    assert_eq!(*result.lock().unwrap(), Some(499_500.0));
    assert!(s.is_empty());
}

#[test]
fn float_pipeline_in_thread_backed_mode() {
    let result = Arc::new(Mutex::new(None));
    let s: Stream<f32> = Stream::with_depth("threaded", 8);
    Task::builder()
        .mode(ContextMode::ThreadBacked)
        .build()
        .invoke(Mode::Join, produce_floats(s.ostream(), 1000))
        .invoke(Mode::Join, sum_floats(s.istream(), result.clone()));
    assert_eq!(*result.lock().unwrap(), Some(499_500.0));
}

#[test]
fn join_returns_while_detached_child_spins() {
    let joined = Arc::new(AtomicUsize::new(0));
    let spinning = Arc::new(AtomicBool::new(false));
    {
        let task = Task::builder().workers(2).build();
        for _ in 0..2 {
            let joined = joined.clone();
            task.invoke(Mode::Join, async move {
                for _ in 0..50 {
                    yield_now().await;
                }
                joined.fetch_add(1, Ordering::Relaxed);
            });
        }
        let flag = spinning.clone();
        task.invoke(Mode::Detach, async move {
            loop {
                flag.store(true, Ordering::Relaxed);
                yield_now().await;
            }
        });
    }
    assert_eq!(joined.load(Ordering::Relaxed), 2);
}

#[test]
fn sequence_argument_supplies_call_order() {
    for mode in [Mode::Join, Mode::Detach] {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let remaining = Arc::new(AtomicUsize::new(6));
        {
            let task = Task::builder().workers(2).build();
            let seq = Seq::new();
            let mut position = 0;
            task.invoke_n(mode, 6, || {
                let call = position;
                position += 1;
                let index = seq.next();
                let (seen, remaining) = (seen.clone(), remaining.clone());
                async move {
                    seen.lock().unwrap().push((call, index));
                    remaining.fetch_sub(1, Ordering::AcqRel);
                }
            });
            while remaining.load(Ordering::Acquire) > 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 6);
        for (call, index) in &seen {
            assert_eq!(call, index, "{:?}: invocation {} got index {}", mode, call, index);
        }
        let calls: BTreeSet<usize> = seen.iter().map(|(call, _)| *call).collect();
        assert_eq!(calls, (0..6).collect());
    }
}

#[test]
fn sequential_children_complete_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let task = Task::builder().workers(1).build();
    for i in 0..3 {
        let order_clone = order.clone();
        task.invoke(Mode::Sequential, async move {
            yield_now().await;
            order_clone.lock().unwrap().push(i);
        });
        assert_eq!(order.lock().unwrap().len(), i + 1);
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

/// Fan out one stream to lanes by index, then merge the lanes back.
/// Runs `design` on a helper thread and fails instead of hanging.
fn finishes_within(limit: Duration, design: impl FnOnce() + Send + 'static) {
    let (done_tx, done_rx) = mpsc::channel();
    let runner = std::thread::spawn(move || {
        design();
        let _ = done_tx.send(());
    });
    if done_rx.recv_timeout(limit).is_err() {
        panic!("design did not finish within {:?}", limit);
    }
    runner.join().unwrap();
}

#[test]
fn sequential_child_inside_a_body_keeps_the_worker_running() {
    finishes_within(Duration::from_secs(10), || {
        let s: Stream<u32> = Stream::new("to_sequential_child");
        let (tx, rx) = (s.ostream(), s.istream());
        let got = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicBool::new(false));
        {
            let task = Task::builder().workers(1).build();
            let ctx = task.context().clone();
            let (g, st) = (got.clone(), started.clone());
            task.invoke(Mode::Join, async move {
                st.store(true, Ordering::Release);
                Task::nested(&ctx).invoke(Mode::Sequential, async move {
                    g.store(rx.read().await as usize, Ordering::Release);
                });
            });
            while !started.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            task.invoke(Mode::Join, async move {
                tx.write(7).await;
            });
        }
        assert_eq!(got.load(Ordering::Acquire), 7);
    });
}

#[test]
fn awaited_sequential_child_suspends_with_its_parent() {
    finishes_within(Duration::from_secs(10), || {
        let s: Stream<u32> = Stream::with_depth("to_awaited_child", 1);
        let (tx, rx) = (s.ostream(), s.istream());
        let sum = Arc::new(AtomicUsize::new(0));
        {
            let task = Task::builder().workers(1).build();
            let ctx = task.context().clone();
            let total = sum.clone();
            task.invoke(Mode::Join, async move {
                let child = Task::nested(&ctx);
                child
                    .call(async move {
                        while let Some(v) = rx.next_value().await {
                            total.fetch_add(v as usize, Ordering::AcqRel);
                        }
                        rx.open().await;
                    })
                    .await;
            })
            .invoke(Mode::Join, async move {
                for i in 1..=10 {
                    tx.write(i).await;
                }
                tx.close().await;
            });
        }
        assert_eq!(sum.load(Ordering::Acquire), 55);
    });
}

#[test]
fn fan_out_and_merge_across_stream_array() {
    const LANES: usize = 4;
    const N: u64 = 400;

    let source: Stream<u64> = Stream::new("source");
    let mut lanes: Streams<u64> = Streams::with_depth("lane", LANES, 4);
    let total = Arc::new(AtomicUsize::new(0));
    {
        let task = Task::builder().workers(3).build();

        let (input, mut outs) = (source.istream(), lanes.ostreams(LANES));
        let lane_outs: Vec<OStream<u64>> = (0..LANES).map(|_| outs.take_next()).collect();
        task.invoke_named(Mode::Join, "split", async move {
            let mut i = 0;
            while let Some(v) = input.next_value().await {
                lane_outs[i % LANES].write(v).await;
                i += 1;
            }
            input.open().await;
            for out in &lane_outs {
                out.close().await;
            }
        });

        let ins = lanes.istreams(LANES);
        let t = total.clone();
        task.invoke_named(Mode::Join, "merge", async move {
            let mut open = LANES;
            while open > 0 {
                open = 0;
                for lane in ins.iter() {
                    match lane.try_eot() {
                        Some(false) => {
                            let v = lane.try_read().unwrap();
                            t.fetch_add(v as usize, Ordering::Relaxed);
                            open += 1;
                        }
                        Some(true) => {}
                        None => open += 1,
                    }
                }
                yield_now().await;
            }
            assert!(ins.all_eot());
            for lane in ins.iter() {
                lane.open().await;
            }
        });

        let out = source.ostream();
        task.invoke_named(Mode::Join, "feed", async move {
            for v in 1..=N {
                out.write(v).await;
            }
            out.close().await;
        });
    }
    assert_eq!(total.load(Ordering::Relaxed) as u64, N * (N + 1) / 2);
    assert!(lanes.iter().all(Stream::is_empty));
}

#[test]
fn nested_tree_reuses_the_runtime() {
    let leaves = Arc::new(AtomicUsize::new(0));
    {
        let top = Task::builder().workers(2).build();
        let ctx = top.context().clone();
        let width = ctx.worker_count();
        assert_eq!(width, 2);
        for _ in 0..2 {
            let (ctx, leaves) = (ctx.clone(), leaves.clone());
            top.invoke(Mode::Join, async move {
                let mid = Task::nested(&ctx);
                let grand_ctx = mid.context().clone();
                let leaves = leaves.clone();
                mid.invoke(Mode::Join, async move {
                    let leaf = Task::nested(&grand_ctx);
                    leaf.invoke_n(Mode::Join, 3, || {
                        let leaves = leaves.clone();
                        async move {
                            leaves.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                });
            });
        }
    }
    assert_eq!(leaves.load(Ordering::Relaxed), 6);
}

#[test]
fn channel_reused_across_transactions() {
    let s: Stream<u32> = Stream::with_depth("session", 2);
    let sums = Arc::new(Mutex::new(Vec::new()));
    {
        let task = Task::builder().workers(2).build();
        let out = s.ostream();
        task.invoke(Mode::Join, async move {
            for round in 1..=3u32 {
                for v in 0..round * 10 {
                    out.write(v).await;
                }
                out.close().await;
            }
        });
        let (input, sums) = (s.istream(), sums.clone());
        task.invoke(Mode::Join, async move {
            for _ in 0..3 {
                let mut sum = 0;
                while let Some(v) = input.next_value().await {
                    sum += v;
                }
                input.open().await;
                sums.lock().unwrap().push(sum);
            }
        });
    }
    assert_eq!(*sums.lock().unwrap(), vec![45, 190, 435]);
}
