//! Process entry point: CLI parsing, logging setup, privilege/resource
//! tuning, and wiring the collaborators (storage engine, stats registry,
//! deferred-delete sweeper, coarse clock) to the dispatcher/worker pool
//! that makes up the protocol core (SPEC_FULL.md §2, components A-N).

mod cli;
mod dispatcher;
mod pidfile;
mod worker;

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
};

use clap::Parser;
use cli::Args;
use dispatcher::WorkerHandle;
use tracing::{error, info, warn};
use wireline_core::{
    deferred_delete::{self, DeferredDeleteQueue},
    managed::BucketTable,
    udp::bind_reuseport,
};
use wireline_stats::StatsRegistry;
use wireline_store::Store;
use worker::{Worker, WorkerShared};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Best-effort resource/privilege tuning requested by `-r`/`-k`/`-u`. None
/// of these are on the hot path; a failure here is logged, never fatal,
/// matching SPEC_FULL.md §7's "collaborators never propagate errors to the
/// protocol core" policy.
fn apply_resource_limits(args: &Args) {
    if args.maximize_core_size {
        // SAFETY: setrlimit with a stack-local rlimit struct, fd-free syscall.
        let rc = unsafe {
            let limit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
            libc::setrlimit(libc::RLIMIT_CORE, &limit)
        };
        if rc != 0 {
            warn!("failed to raise RLIMIT_CORE (-r)");
        }
    }
    if args.mlockall {
        // SAFETY: no arguments beyond flags, fd-free syscall.
        let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        if rc != 0 {
            warn!("mlockall failed (-k); continuing without locked memory");
        }
    }
    if let Some(user) = &args.user {
        drop_privileges(user);
    }
}

fn drop_privileges(user: &str) {
    let cname = match std::ffi::CString::new(user) {
        Ok(c) => c,
        Err(_) => {
            warn!(%user, "invalid username for -u, ignoring");
            return;
        }
    };
    // SAFETY: getpwnam reads from a null-terminated C string we just built;
    // the returned pointer is only used before any other libc call that
    // might clobber the static buffer it points into.
    let (uid, gid) = unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        if pw.is_null() {
            warn!(%user, "-u: no such user, ignoring");
            return;
        }
        ((*pw).pw_uid, (*pw).pw_gid)
    };
    // SAFETY: uid/gid resolved above from a valid passwd entry.
    unsafe {
        if libc::setgid(gid) != 0 || libc::setuid(uid) != 0 {
            warn!(%user, "failed to drop privileges (-u)");
        } else {
            info!(%user, uid, gid, "dropped privileges");
        }
    }
}

fn main() {
    let args = match Args::parse().validate_and_fill() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("wireline: configuration error: {err}");
            std::process::exit(1);
        }
    };

    if args.license {
        println!("{}", cli::LICENSE_TEXT);
        return;
    }

    init_logging(args.verbosity);
    info!(version = VERSION, "starting up");

    if args.tcp_port_binary.is_some() || args.udp_port_binary.is_some() {
        warn!("-n/-N request the binary protocol, which this build does not implement; ignoring");
    }

    apply_resource_limits(&args);

    let pidfile = match pidfile::Pidfile::write(args.pidfile.clone()) {
        Ok(p) => p,
        Err(err) => {
            error!(?err, "failed to write pidfile");
            std::process::exit(1);
        }
    };

    let byte_limit = if args.disable_eviction { 0 } else { args.byte_limit() };
    let store = Arc::new(Store::new(byte_limit));
    let stats_registry = Arc::new(StatsRegistry::new(std::process::id()));
    let deferred = Arc::new(Mutex::new(DeferredDeleteQueue::new()));
    let buckets = args.managed.then(|| Arc::new(BucketTable::new(args.buckets)));

    wireline_time::spawn_ticker();
    deferred_delete::spawn_sweeper(Arc::clone(&deferred), Arc::clone(&store));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(err) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!(?err, "failed to install SIGINT/SIGTERM handler");
        }
    }
    #[cfg(unix)]
    {
        let registry = Arc::clone(&stats_registry);
        // SAFETY: the handler only touches an atomic inside `registry`, no
        // allocation or locking, mirroring this workspace's existing
        // SIGTERM handler pattern.
        let result = unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGUSR1, move || {
                registry.set_verbosity(registry.verbosity() + 1);
            })
        };
        if let Err(err) = result {
            warn!(?err, "failed to install SIGUSR1 handler");
        }
    }

    let bind_ip: IpAddr = args.bind_address.parse().unwrap_or_else(|_| {
        warn!(address = %args.bind_address, "couldn't parse -l address, defaulting to 0.0.0.0");
        IpAddr::from([0, 0, 0, 0])
    });

    let worker_count = args.worker_count();
    info!(worker_count, "spawning worker pool");

    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let conn_buffer_cap = args.conn_buffer_bytes / worker_count.max(1);

    let mut worker_handles = Vec::with_capacity(worker_count);
    let mut join_handles = Vec::with_capacity(worker_count);

    for i in 0..worker_count {
        let udp_socket = match args.udp_port {
            Some(port) => match bind_reuseport(SocketAddr::new(bind_ip, port)) {
                Ok(socket) => Some(socket),
                Err(err) => {
                    error!(?err, worker = i, "failed to bind UDP reuseport socket");
                    std::process::exit(1);
                }
            },
            None => None,
        };
        let shared = WorkerShared {
            store: Arc::clone(&store),
            stats_registry: Arc::clone(&stats_registry),
            deferred: Arc::clone(&deferred),
            buckets: buckets.clone(),
            version: VERSION,
            reqs_per_event: args.reqs_per_event,
            stop: Arc::clone(&stop),
            conn_buffer_cap,
        };
        let (tx, rx) = mpsc::channel();
        let worker = match Worker::new(rx, udp_socket, shared) {
            Ok(w) => w,
            Err(err) => {
                error!(?err, worker = i, "failed to initialize worker reactor");
                std::process::exit(1);
            }
        };
        worker_handles.push(WorkerHandle { sender: tx, waker: worker.waker() });
        let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()].id);
        join_handles.push(
            std::thread::Builder::new()
                .name(format!("wireline-worker-{i}"))
                .spawn(move || {
                    wireline_util::pin_to_core(core_id);
                    worker.run();
                })
                .expect("failed to spawn worker thread"),
        );
    }

    if let Some(path) = args.stream_path.clone() {
        if let Err(err) = dispatcher::run_unix(path, worker_handles, Arc::clone(&stats_registry), args.max_connections, Arc::clone(&stop)) {
            error!(?err, "unix socket dispatcher exited with an error");
        }
    } else if let Some(port) = args.tcp_port {
        let addr = SocketAddr::new(bind_ip, port);
        if let Err(err) = dispatcher::run_tcp(addr, worker_handles, Arc::clone(&stats_registry), args.max_connections, Arc::clone(&stop)) {
            error!(?err, "TCP dispatcher exited with an error");
        }
    } else {
        // UDP-only: every worker already owns and polls its reuseport
        // socket directly, so the main thread just waits for shutdown.
        drop(worker_handles);
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(250));
        }
    }

    info!("shutting down");
    stop.store(true, Ordering::SeqCst);
    for handle in join_handles {
        let _ = handle.join();
    }
    pidfile.remove();
}
