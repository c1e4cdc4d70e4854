mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use common::{spawn_server, spawn_server_with};

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_clients_all_served() {
        let server = Arc::new(spawn_server());
        let mut handles = Vec::new();

        for _ in 0..200 {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                let response = server.request("GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
                assert_eq!(response.code(), 200);
                assert_eq!(response.body, b"<h1>hi</h1>\n");
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_connection_isolation() {
        // Every client asks for its own file; nobody may see another
        // client's body.
        let server = Arc::new(spawn_server_with(|dir| {
            for i in 0..8 {
                fs::write(dir.join(format!("client_{i}.txt")), format!("payload-{i}\n")).unwrap();
            }
        }));

        let mut handles = Vec::new();
        for i in 0..8 {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let response = server
                        .request(&format!("GET /client_{i}.txt HTTP/1.1\r\nHost: x\r\n\r\n"));
                    assert_eq!(response.code(), 200);
                    assert_eq!(response.body, format!("payload-{i}\n").as_bytes());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}

#[cfg(test)]
mod backpressure_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use legion::{TASK_QUEUE_SIZE, THREAD_COUNT};

    use super::*;

    #[test]
    fn test_queue_overflow_closes_extra_connections() {
        let server = Arc::new(spawn_server());
        let release = Arc::new(AtomicBool::new(false));

        // Pin every worker: each of these connections drips request bytes
        // without ever sending the blank-line terminator, so its handler
        // keeps reading and the worker never comes back to the queue.
        let mut blockers = Vec::new();
        for _ in 0..THREAD_COUNT {
            let server = Arc::clone(&server);
            let release = Arc::clone(&release);
            blockers.push(thread::spawn(move || {
                let mut client = server.client();
                if client.try_send(b"GET /never").is_err() {
                    return;
                }
                while !release.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(250));
                    if client.try_send(b".").is_err() {
                        break;
                    }
                }
            }));
        }

        // Let the blockers reach the workers before flooding.
        thread::sleep(Duration::from_millis(500));

        // More readable connections than the queue can hold. The first
        // TASK_QUEUE_SIZE sit in the queue; the overflow must be closed
        // promptly by the reactor instead of backing up.
        let flood = 100;
        let mut floods = Vec::new();
        for _ in 0..flood {
            let server = Arc::clone(&server);
            floods.push(thread::spawn(move || {
                let mut client = server.client();
                let request = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
                if client.try_send(request).is_err() {
                    return false;
                }
                match client.try_read_response() {
                    Some(response) => {
                        assert_eq!(response.code(), 200);
                        true
                    }
                    None => false,
                }
            }));
        }

        // Hold the workers until the whole flood has been accepted and
        // dispatched or rejected, then let the queue drain.
        thread::sleep(Duration::from_secs(3));
        release.store(true, Ordering::Relaxed);

        let mut served = 0usize;
        let mut closed = 0usize;
        for handle in floods {
            if handle.join().unwrap() {
                served += 1;
            } else {
                closed += 1;
            }
        }
        for handle in blockers {
            let _ = handle.join();
        }

        assert_eq!(served + closed, flood);
        assert!(closed >= 1, "queue never overflowed (served {served})");
        assert!(
            served >= TASK_QUEUE_SIZE,
            "queued requests did not complete (served {served}, closed {closed})"
        );
    }
}

#[cfg(test)]
mod burst_tests {
    use super::*;

    #[test]
    fn test_burst_over_one_session() {
        let server = spawn_server();
        let mut client = server.client();

        for _ in 0..50 {
            client.send(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
            let response = client.read_response(false);
            assert_eq!(response.code(), 200);
            assert_eq!(response.body, b"<h1>hi</h1>\n");
        }
    }

    #[test]
    fn test_large_body_streams_completely() {
        // Bigger than both the page size and the chunked write scratch.
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let server = spawn_server_with(move |dir| {
            fs::write(dir.join("big.bin"), &payload).unwrap();
        });

        let response = server.request("GET /big.bin HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.code(), 200);
        assert_eq!(
            response.header("Content-Length").unwrap(),
            expected.len().to_string()
        );
        assert_eq!(response.body, expected);
    }

    #[test]
    fn test_rapid_reconnects() {
        let server = spawn_server();
        for _ in 0..30 {
            let mut client = server.client();
            client.send(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
            let response = client.read_response(false);
            assert_eq!(response.code(), 200);
            client.expect_close();
        }
    }
}
