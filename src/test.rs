#[cfg(test)]
mod tests {
    use crate::args;
    use crate::chanrpc::{Args, Handler, Server, Value};
    use crate::console::CommandRegistry;
    use crate::error::RpcError;
    use crate::module::{CloseSignal, Module, ModuleManager, Skeleton, SkeletonConfig};
    use crate::timer::Dispatcher;
    use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    /// Minimal consumer loop for a bare server, for tests that do not need a
    /// full skeleton. Returns the server on stop so assertions can continue.
    fn serve(mut server: Server, stop_rx: Receiver<()>) -> JoinHandle<Server> {
        thread::spawn(move || {
            let call_rx = server.call_queue().clone();
            loop {
                crossbeam::channel::select! {
                    recv(stop_rx) -> _ => {
                        server.close();
                        return server;
                    }
                    recv(call_rx) -> ci => {
                        if let Ok(ci) = ci {
                            server.exec(ci);
                        }
                    }
                }
            }
        })
    }

    fn double_handler() -> Handler {
        Handler::single(|args: Args| {
            let x = args[0].downcast_ref::<i32>().copied().unwrap();
            Box::new(x * 2) as Value
        })
    }

    #[test]
    fn register_twice_fails_and_table_is_unchanged() {
        let mut server = Server::new(4);
        server.register("double", double_handler()).unwrap();

        let err = server
            .register("double", Handler::no_ret(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyRegistered(_)));

        let handle = server.handle();
        let (stop_tx, stop_rx) = bounded(1);
        let join = serve(server, stop_rx);

        // Still the original single-return handler.
        let v = handle.call1("double", args![21i32]).unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 42);

        stop_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn sync_calls_round_trip_every_kind() {
        let mut server = Server::new(4);
        server.register("noop", Handler::no_ret(|_| {})).unwrap();
        server.register("double", double_handler()).unwrap();
        server
            .register(
                "pair",
                Handler::multi(|args: Args| {
                    let x = args[0].downcast_ref::<i32>().copied().unwrap();
                    vec![Box::new(x) as Value, Box::new(x + 1) as Value]
                }),
            )
            .unwrap();

        let handle = server.handle();
        let (stop_tx, stop_rx) = bounded(1);
        let join = serve(server, stop_rx);

        handle.call0("noop", args![]).unwrap();

        let v = handle.call1("double", args![4i32]).unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 8);

        let vs = handle.call_n("pair", args![7i32]).unwrap();
        assert_eq!(vs.len(), 2);
        assert_eq!(*vs[1].downcast_ref::<i32>().unwrap(), 8);

        stop_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn unknown_id_and_kind_mismatch_surface_as_errors() {
        let mut server = Server::new(4);
        server.register("noop", Handler::no_ret(|_| {})).unwrap();

        let handle = server.handle();
        let (stop_tx, stop_rx) = bounded(1);
        let join = serve(server, stop_rx);

        assert!(matches!(
            handle.call0("missing", args![]),
            Err(RpcError::NotRegistered(_))
        ));
        assert!(matches!(
            handle.call1("noop", args![]),
            Err(RpcError::KindMismatch(_))
        ));

        stop_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn handler_panic_becomes_an_error_and_server_survives() {
        let mut server = Server::new(4);
        server
            .register(
                "div",
                Handler::single(|args: Args| {
                    let a = args[0].downcast_ref::<i32>().copied().unwrap();
                    let b = args[1].downcast_ref::<i32>().copied().unwrap();
                    if b == 0 {
                        panic!("division by zero");
                    }
                    Box::new(a / b) as Value
                }),
            )
            .unwrap();

        let handle = server.handle();
        let (stop_tx, stop_rx) = bounded(1);
        let join = serve(server, stop_rx);

        let err = handle.call1("div", args![4i32, 0i32]).unwrap_err();
        assert!(err.to_string().contains("division by zero"));

        // The loop keeps processing after the panic.
        let v = handle.call1("div", args![8i32, 2i32]).unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 4);

        stop_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn cast_is_best_effort_and_counts_drops() {
        let mut server = Server::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        server
            .register(
                "hit",
                Handler::no_ret(move |_| {
                    hits_in.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let handle = server.handle();
        let (stop_tx, stop_rx) = bounded(1);
        let join = serve(server, stop_rx);

        handle.cast("hit", args![]);
        handle.cast("missing", args![]);

        let deadline = std::time::Instant::now() + WAIT;
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(handle.dropped_casts(), 1);

        stop_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn async_overflow_rejects_inline_and_delivers_the_rest() {
        let mut server = Server::new(8);
        server
            .register(
                "id",
                Handler::single(|mut args: Args| args.remove(0)),
            )
            .unwrap();

        let handle = server.handle();
        let mut client = handle.open(2);

        let (tx, rx) = unbounded::<(i32, Result<i32, RpcError>)>();
        for i in 1..=3 {
            let tx = tx.clone();
            client.async_call1("id", args![i], move |r| {
                let r = r.map(|v| *v.downcast::<i32>().unwrap());
                tx.send((i, r)).unwrap();
            });
        }

        // The third call was rejected synchronously, before any draining.
        let (i, r) = rx.try_recv().unwrap();
        assert_eq!(i, 3);
        assert!(matches!(r, Err(RpcError::TooManyCalls)));
        assert!(rx.try_recv().is_err());

        // Drain the server, then the client; the first two callbacks run in
        // server order with their real results.
        let call_rx = server.call_queue().clone();
        while let Ok(ci) = call_rx.try_recv() {
            server.exec(ci);
        }
        client.close();
        assert!(client.idle());

        assert_eq!(rx.try_recv().unwrap(), (1, Ok(1)));
        assert_eq!(rx.try_recv().unwrap(), (2, Ok(2)));
    }

    #[test]
    fn async_capacity_one_rejects_second_call_synchronously() {
        let mut server = Server::new(8);
        server.register("noop", Handler::no_ret(|_| {})).unwrap();

        let handle = server.handle();
        let mut client = handle.open(1);

        let rejected = Arc::new(AtomicBool::new(false));
        client.async_call0("noop", args![], |_| {});

        let flag = rejected.clone();
        client.async_call0("noop", args![], move |r| {
            assert!(matches!(r, Err(RpcError::TooManyCalls)));
            flag.store(true, Ordering::SeqCst);
        });
        assert!(rejected.load(Ordering::SeqCst));

        let call_rx = server.call_queue().clone();
        while let Ok(ci) = call_rx.try_recv() {
            server.exec(ci);
        }
        client.close();
        assert!(client.idle());
    }

    #[test]
    fn async_lookup_failure_flows_through_the_callback_path() {
        let server = Server::new(8);
        let handle = server.handle();
        let mut client = handle.open(2);

        let (tx, rx) = unbounded();
        client.async_call0("missing", args![], move |r| {
            tx.send(r).unwrap();
        });

        // Queued as a synthetic reply, not run inline.
        assert!(rx.try_recv().is_err());
        client.close();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RpcError::NotRegistered(_))
        ));
    }

    #[test]
    fn server_close_poisons_pending_calls_without_deadlock() {
        let mut server = Server::new(1);
        server.register("slow", Handler::no_ret(|_| {})).unwrap();
        let handle = server.handle();

        // No consumer: the call sits in the queue until close drains it.
        let caller = {
            let handle = handle.clone();
            thread::spawn(move || handle.call0("slow", args![]))
        };
        thread::sleep(Duration::from_millis(50));

        server.close();
        assert!(matches!(
            caller.join().unwrap(),
            Err(RpcError::ServerClosed)
        ));

        // Late callers observe the terminal error immediately.
        assert!(matches!(
            handle.call0("slow", args![]),
            Err(RpcError::ServerClosed)
        ));
    }

    // ---- Module manager ----

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        close_sigs: Arc<AtomicUsize>,
        panic_on_destroy: bool,
    }

    impl Module for Recorder {
        fn on_init(&mut self) {
            self.log.lock().push(format!("init {}", self.name));
        }

        fn run(&mut self, close_sig: CloseSignal) {
            if close_sig.recv().is_ok() {
                self.close_sigs.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_destroy(&mut self) {
            self.log.lock().push(format!("destroy {}", self.name));
            if self.panic_on_destroy {
                panic!("destroy failed");
            }
        }
    }

    #[test]
    fn manager_destroys_in_reverse_order_despite_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let close_sigs = Arc::new(AtomicUsize::new(0));

        let mut manager = ModuleManager::new();
        for (name, panic_on_destroy) in [("a", false), ("b", true), ("c", false)] {
            manager.register(Recorder {
                name,
                log: log.clone(),
                close_sigs: close_sigs.clone(),
                panic_on_destroy,
            });
        }

        manager.init().unwrap();
        manager.destroy();
        // Second destroy is a no-op.
        manager.destroy();

        let entries = log.lock().clone();
        let entries: Vec<&str> = entries.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            entries,
            vec![
                "init a", "init b", "init c", "destroy c", "destroy b", "destroy a"
            ]
        );
        // Every module observed its close signal exactly once.
        assert_eq!(close_sigs.load(Ordering::SeqCst), 3);
    }

    struct CrashingRun;

    impl Module for CrashingRun {
        fn on_init(&mut self) {}

        fn run(&mut self, _close_sig: CloseSignal) {
            panic!("loop died");
        }

        fn on_destroy(&mut self) {}
    }

    #[test]
    fn run_panic_in_one_module_does_not_stop_teardown_of_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let close_sigs = Arc::new(AtomicUsize::new(0));

        let mut manager = ModuleManager::new();
        manager.register(Recorder {
            name: "a",
            log: log.clone(),
            close_sigs: close_sigs.clone(),
            panic_on_destroy: false,
        });
        manager.register(CrashingRun);
        manager.register(Recorder {
            name: "c",
            log: log.clone(),
            close_sigs: close_sigs.clone(),
            panic_on_destroy: false,
        });

        manager.init().unwrap();
        manager.destroy();

        // The dead loop thread is reaped and the reverse walk continues.
        let entries = log.lock().clone();
        let entries: Vec<&str> = entries.iter().map(|s| s.as_str()).collect();
        assert_eq!(entries, vec!["init a", "init c", "destroy c", "destroy a"]);
        assert_eq!(close_sigs.load(Ordering::SeqCst), 2);
    }

    // ---- Skeleton ----

    fn spawn_skeleton(sk: Skeleton) -> (Sender<()>, JoinHandle<Skeleton>) {
        let (close_tx, close_rx) = bounded(1);
        let join = thread::spawn(move || {
            let mut sk = sk;
            sk.run(close_rx);
            sk
        });
        (close_tx, join)
    }

    #[test]
    fn skeleton_serves_rpc_and_tears_down() {
        let server = Server::new(8);
        let handle = server.handle();

        let mut sk = Skeleton::with_server(
            SkeletonConfig {
                go_len: 2,
                timer_dispatcher_len: 8,
                async_call_len: 4,
                ..Default::default()
            },
            server,
        )
        .unwrap();
        sk.register_chan_rpc(
            "add",
            Handler::single(|args: Args| {
                let a = args[0].downcast_ref::<i32>().copied().unwrap();
                let b = args[1].downcast_ref::<i32>().copied().unwrap();
                Box::new(a + b) as Value
            }),
        );

        let (close_tx, join) = spawn_skeleton(sk);

        let v = handle.call1("add", args![2i32, 3i32]).unwrap();
        assert_eq!(*v.downcast::<i32>().unwrap(), 5);

        close_tx.send(()).unwrap();
        join.join().unwrap();

        // After teardown the server is terminally closed.
        assert!(matches!(
            handle.call1("add", args![1i32, 1i32]),
            Err(RpcError::ServerClosed)
        ));
    }

    #[test]
    fn skeleton_runs_pool_callbacks_on_the_loop_without_overlap() {
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let enter = {
            let busy = busy.clone();
            let overlapped = overlapped.clone();
            move || {
                if busy.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                busy.store(false, Ordering::SeqCst);
            }
        };

        let mut server = Server::new(8);
        let guard = enter.clone();
        server
            .register("busy", Handler::no_ret(move |_| guard()))
            .unwrap();
        let handle = server.handle();

        let sk = Skeleton::with_server(
            SkeletonConfig {
                go_len: 4,
                async_call_len: 4,
                ..Default::default()
            },
            server,
        )
        .unwrap();

        let (done_tx, done_rx) = unbounded();
        for _ in 0..4 {
            let guard = enter.clone();
            let done_tx = done_tx.clone();
            sk.go(
                || thread::sleep(Duration::from_millis(10)),
                move || {
                    guard();
                    done_tx.send(()).unwrap();
                },
            );
        }

        let (close_tx, join) = spawn_skeleton(sk);

        for _ in 0..4 {
            handle.cast("busy", args![]);
        }
        for _ in 0..4 {
            done_rx.recv_timeout(WAIT).unwrap();
        }

        close_tx.send(()).unwrap();
        join.join().unwrap();

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn linear_context_preserves_submission_order() {
        let sk = Skeleton::new(SkeletonConfig {
            go_len: 4,
            ..Default::default()
        })
        .unwrap();

        let lc = sk.new_linear_context().unwrap();
        let (tx, rx) = unbounded();
        for (i, ms) in [(1, 30u64), (2, 20), (3, 10)] {
            let tx = tx.clone();
            lc.go(
                move || thread::sleep(Duration::from_millis(ms)),
                move || tx.send(i).unwrap(),
            );
        }

        let (close_tx, join) = spawn_skeleton(sk);

        let order: Vec<i32> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);

        close_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn skeleton_async_call_reaches_another_server() {
        let target = {
            let mut server = Server::new(8);
            server.register("double", double_handler()).unwrap();
            server
        };
        let target_handle = target.handle();
        let (target_stop, target_stop_rx) = bounded(1);
        let target_join = serve(target, target_stop_rx);

        let mut sk = Skeleton::new(SkeletonConfig {
            async_call_len: 4,
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = unbounded();
        sk.async_call1(&target_handle, "double", args![5i32], move |r| {
            tx.send(r.map(|v| *v.downcast::<i32>().unwrap())).unwrap();
        });

        let (close_tx, join) = spawn_skeleton(sk);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(10));

        close_tx.send(()).unwrap();
        join.join().unwrap();
        target_stop.send(()).unwrap();
        target_join.join().unwrap();
    }

    #[test]
    fn skeleton_timers_fire_and_cancel() {
        let sk = Skeleton::new(SkeletonConfig {
            timer_dispatcher_len: 8,
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = unbounded();
        {
            let tx = tx.clone();
            sk.after_func(Duration::from_millis(10), move || {
                let _ = tx.send("fired");
            });
        }

        let cancelled_hit = Arc::new(AtomicBool::new(false));
        let t = {
            let hit = cancelled_hit.clone();
            sk.after_func(Duration::from_millis(30), move || {
                hit.store(true, Ordering::SeqCst);
            })
        };
        t.stop();

        let (close_tx, join) = spawn_skeleton(sk);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fired");
        thread::sleep(Duration::from_millis(100));
        assert!(!cancelled_hit.load(Ordering::SeqCst));

        close_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn dispatcher_fires_same_duration_timers_in_arm_order() {
        let dispatcher = Dispatcher::new(8).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let order = order.clone();
            dispatcher.after_func(Duration::from_millis(20), move || {
                order.lock().push(i);
            });
        }

        let fired_rx = dispatcher.fired_queue().clone();
        for _ in 0..3 {
            fired_rx.recv_timeout(WAIT).unwrap().fire();
        }
        assert_eq!(order.lock().clone(), vec![1, 2, 3]);
    }

    #[test]
    fn full_dispatcher_queue_blocks_delivery_without_losing_fires() {
        let dispatcher = Dispatcher::new(2).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let fired = fired.clone();
            dispatcher.after_func(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Every deadline has passed, but the queue holds two entries and the
        // scheduler sits blocked on the third instead of dropping it.
        thread::sleep(Duration::from_millis(100));
        let fired_rx = dispatcher.fired_queue().clone();
        assert_eq!(fired_rx.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Draining unblocks the scheduler; all six fires arrive exactly once.
        for _ in 0..6 {
            fired_rx.recv_timeout(WAIT).unwrap().fire();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 6);
        assert!(fired_rx.try_recv().is_err());
    }

    #[test]
    #[should_panic(expected = "invalid go_len")]
    fn disabled_pool_facility_fails_fast() {
        let sk = Skeleton::new(SkeletonConfig::default()).unwrap();
        sk.go(|| {}, || {});
    }

    #[test]
    fn console_commands_dispatch_over_the_command_server() {
        let registry = Arc::new(CommandRegistry::new());

        let mut sk = Skeleton::new(SkeletonConfig {
            command_registry: Some(registry.clone()),
            ..Default::default()
        })
        .unwrap();
        sk.register_command(
            "status",
            "report module status",
            Handler::single(|args: Args| Box::new(format!("ok ({} args)", args.len())) as Value),
        );

        let (close_tx, join) = spawn_skeleton(sk);

        assert_eq!(
            registry.dispatch("status", &["verbose"]).unwrap(),
            "ok (1 args)"
        );
        assert!(registry.dispatch("nope", &[]).is_none());
        assert!(registry
            .help_text()
            .contains("status - report module status"));

        close_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn runtime_config_fills_defaults_from_empty_json() {
        let cfg: crate::config::RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.stack_trace_bytes, 4096);
        assert_eq!(cfg.console.port, 0);
        assert_eq!(cfg.log.level, "info");
    }
}
