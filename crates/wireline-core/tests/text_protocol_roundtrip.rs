//! Drives one real TCP connection through the actual `Connection` state
//! machine end to end: a client thread writes wire-format commands over a
//! loopback socket while this thread services them with a real `mio::Poll`,
//! the same way a worker thread would.

use std::{
    io::{Read, Write},
    net::TcpStream as StdTcpStream,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, net::TcpListener as MioTcpListener};
use wireline_core::{ConnOutcome, Connection, Handlers, Transport, buffer_pool::BufferPool, deferred_delete::DeferredDeleteQueue, managed::BucketTable};
use wireline_stats::{StatsRegistry, ThreadStats};
use wireline_store::Store;

const TOKEN: Token = Token(10);

fn drive_until_idle(conn: &mut Connection, poll: &mut Poll, handlers: &Handlers<'_>) {
    let mut events = Events::with_capacity(8);
    for _ in 0..200 {
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        let mut saw_event = false;
        for event in events.iter() {
            if event.token() == TOKEN {
                saw_event = true;
                let outcome = conn.drive(poll.registry(), event.is_readable(), event.is_writable(), handlers, 20);
                if matches!(outcome, ConnOutcome::Closed) {
                    return;
                }
            }
        }
        if !saw_event {
            continue;
        }
    }
}

#[test]
fn set_then_get_roundtrip() {
    let mut listener = MioTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.write_all(b"set foo 0 0 3\r\nbar\r\n").unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STORED\r\n");

        stream.write_all(b"get foo\r\n").unwrap();
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"VALUE foo 0 3\r\nbar\r\nEND\r\n");

        stream.write_all(b"delete foo\r\n").unwrap();
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"DELETED\r\n");
    });

    let mut poll = Poll::new().unwrap();
    poll.registry().register(&mut listener, Token(0), Interest::READABLE).unwrap();
    let mut events = Events::with_capacity(4);
    poll.poll(&mut events, Some(Duration::from_secs(2))).unwrap();
    let (stream, peer) = listener.accept().unwrap();

    let store = Store::new(1024 * 1024);
    let registry = StatsRegistry::new(1);
    let stats: Arc<ThreadStats> = registry.register();
    let deferred = Mutex::new(DeferredDeleteQueue::new());
    let buckets: Option<Arc<BucketTable>> = None;
    let mut buffer_pool = BufferPool::new(4);
    let read_buf = buffer_pool.acquire();

    let mut conn = Connection::new(TOKEN, Transport::Tcp(stream), peer.to_string(), Arc::clone(&stats), read_buf);
    conn.register(poll.registry()).unwrap();

    let handlers = Handlers {
        store: &store,
        stats: &stats,
        deferred: &deferred,
        buckets: buckets.as_deref(),
        registry: &registry,
        version: "test",
        buffer_pool: &buffer_pool,
    };

    drive_until_idle(&mut conn, &mut poll, &handlers);

    client.join().unwrap();
}
