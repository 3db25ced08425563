use reactor_server::config::BufferConfig;
use reactor_server::connection::{
    ConnId, ConnectionIo, ConnectionTable, FlushOutcome, Next, ReadOutcome,
};
use reactor_server::http::HttpParser;
use reactor_server::metrics::ServerMetrics;
use reactor_server::response::ResponseBuilder;
use reactor_server::transport::Transport;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tempfile::tempdir;

/// A connected pair over loopback; the first half is nonblocking.
fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    (server, client, peer)
}

fn io_for(stream: TcpStream) -> ConnectionIo {
    ConnectionIo::new(
        Transport::Plain(stream),
        BufferConfig::new(256, 4096),
        BufferConfig::new(256, 4096),
        HttpParser::new(),
    )
}

/// Read until the response head and `Content-Length` body are complete.
fn read_response(client: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-response");
        data.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&data).into_owned();
        if let Some(end) = text.find("\r\n\r\n") {
            let length: usize = text[..end]
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return text;
            }
        }
    }
}

#[test]
fn test_lease_is_exclusive() {
    let (server, _client, peer) = tcp_pair();
    let mut table = ConnectionTable::new();
    let id = table.insert(peer, io_for(server));

    let lease = table.take_lease(id).unwrap();
    assert_eq!(lease.id(), id);
    assert!(table.take_lease(id).is_none());
    assert!(table.get(id).unwrap().is_leased());
    assert_eq!(table.leased(), 1);

    assert!(table.return_lease(lease));
    assert_eq!(table.leased(), 0);
    assert!(!table.get(id).unwrap().is_leased());
    assert!(table.take_lease(id).is_some());
}

#[test]
fn test_removed_id_goes_stale() {
    let (server, _client, peer) = tcp_pair();
    let mut table = ConnectionTable::new();
    let id = table.insert(peer, io_for(server));
    let lease = table.take_lease(id).unwrap();

    // closed while a task holds the lease
    let conn = table.remove(id).unwrap();
    assert_eq!(conn.id, id);
    assert!(!table.contains(id));
    assert!(table.is_empty());
    assert!(!table.return_lease(lease));
    assert_eq!(table.leased(), 0);

    // the slot comes back with a new generation
    let (server, _client, peer) = tcp_pair();
    let reused = table.insert(peer, io_for(server));
    assert_eq!(reused.index, id.index);
    assert_ne!(reused.generation, id.generation);
    assert!(table.take_lease(id).is_none());
    assert!(table.remove(id).is_none());
    assert!(table.contains(reused));
}

#[test]
fn test_lookup_by_descriptor() {
    let (server, _client, peer) = tcp_pair();
    let fd = server.as_raw_fd();
    let mut table = ConnectionTable::new();
    let id = table.insert(peer, io_for(server));

    assert_eq!(table.lookup_fd(fd), Some(id));
    assert_eq!(table.get(id).unwrap().fd, fd);
    assert_eq!(table.get(id).unwrap().peer, peer);
    assert_eq!(table.ids(), vec![id]);

    table.remove(id);
    assert_eq!(table.lookup_fd(fd), None);
}

#[test]
fn test_token_round_trip() {
    let id = ConnId {
        index: 12,
        generation: 3,
    };
    assert_eq!(ConnId::from_token(id.token()), Some(id));
    assert_eq!(id.to_string(), "12#3");
}

#[test]
fn test_read_process_flush_missing_file() {
    let dir = tempdir().unwrap();
    let builder = ResponseBuilder::new(dir.path());
    let metrics = ServerMetrics::new();
    let (server, mut client, _) = tcp_pair();
    let mut io = io_for(server);

    // nothing yet
    assert_eq!(io.read().unwrap(), ReadOutcome::Data(0));

    client
        .write_all(b"GET /nope.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let mut got = 0;
    while got == 0 {
        std::thread::sleep(Duration::from_millis(10));
        if let ReadOutcome::Data(n) = io.read().unwrap() {
            got = n;
        }
    }

    assert_eq!(io.process(&builder, &metrics), Next::Write);
    assert!(io.keep_alive);
    assert!(matches!(io.flush().unwrap(), FlushOutcome::Done(_)));
    assert_eq!(io.pending_bytes(), 0);
    assert_eq!(metrics.requests.value(), 1);

    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Connection: keep-alive\r\n"));
    assert!(response.contains("File NotFound!"));
}

#[test]
fn test_mapped_file_is_sent_after_head() {
    let dir = tempdir().unwrap();
    let page = dir.path().join("page.html");
    let body = "<p>hello</p>".repeat(1000);
    fs::write(&page, &body).unwrap();
    fs::set_permissions(&page, fs::Permissions::from_mode(0o644)).unwrap();

    let builder = ResponseBuilder::new(dir.path());
    let metrics = ServerMetrics::new();
    let (server, mut client, _) = tcp_pair();
    let mut io = io_for(server);

    client.write_all(b"GET /page.html HTTP/1.1\r\n\r\n").unwrap();
    while io.read().unwrap() == ReadOutcome::Data(0) {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(io.process(&builder, &metrics), Next::Write);
    assert!(!io.keep_alive);
    assert!(io.pending_bytes() > body.len());

    loop {
        match io.flush().unwrap() {
            FlushOutcome::Done(_) => break,
            FlushOutcome::Pending(_) => std::thread::sleep(Duration::from_millis(5)),
        }
    }

    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/html\r\n"));
    assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert!(response.ends_with(&body));
}

#[test]
fn test_malformed_request_stages_bad_request() {
    let dir = tempdir().unwrap();
    let builder = ResponseBuilder::new(dir.path());
    let metrics = ServerMetrics::new();
    let (server, mut client, _) = tcp_pair();
    let mut io = io_for(server);

    client.write_all(b"NONSENSE\r\n\r\n").unwrap();
    while io.read().unwrap() == ReadOutcome::Data(0) {
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(io.process(&builder, &metrics), Next::Write);
    assert!(!io.keep_alive);
    assert!(!io.has_buffered_input());
    assert_eq!(metrics.bad_requests.value(), 1);
    io.flush().unwrap();

    let response = read_response(&mut client);
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.contains("Connection: close\r\n"));
}

#[test]
fn test_peer_close_is_reported() {
    let (server, client, _) = tcp_pair();
    let mut io = io_for(server);
    drop(client);

    let outcome = loop {
        match io.read().unwrap() {
            ReadOutcome::Data(0) => std::thread::sleep(Duration::from_millis(10)),
            other => break other,
        }
    };
    assert_eq!(outcome, ReadOutcome::Closed);
}

#[test]
fn test_oversized_request_is_rejected() {
    let dir = tempdir().unwrap();
    let builder = ResponseBuilder::new(dir.path());
    let metrics = ServerMetrics::new();
    let (server, mut client, _) = tcp_pair();
    let mut io = ConnectionIo::new(
        Transport::Plain(server),
        BufferConfig::new(64, 128),
        BufferConfig::new(256, 4096),
        HttpParser::new(),
    );

    // a request line that never ends
    client.write_all(&[b'a'; 200]).unwrap();
    let mut total = 0;
    while total < 128 {
        std::thread::sleep(Duration::from_millis(10));
        if let ReadOutcome::Data(n) = io.read().unwrap() {
            total += n;
        }
    }

    assert_eq!(io.process(&builder, &metrics), Next::Write);
    assert_eq!(metrics.bad_requests.value(), 1);
}

#[test]
fn test_file_body_length_survives_keep_alive() {
    let dir = tempdir().unwrap();
    let page = dir.path().join("index.html");
    fs::write(&page, "<h1>home</h1>").unwrap();
    fs::set_permissions(&page, fs::Permissions::from_mode(0o644)).unwrap();

    let builder = ResponseBuilder::new(dir.path());
    let metrics = ServerMetrics::new();
    let (server, mut client, _) = tcp_pair();
    let mut io = io_for(server);

    for _ in 0..2 {
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        while io.read().unwrap() == ReadOutcome::Data(0) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(io.process(&builder, &metrics), Next::Write);
        assert!(io.keep_alive);
        while let FlushOutcome::Pending(_) = io.flush().unwrap() {
            std::thread::sleep(Duration::from_millis(5));
        }

        // exactly one response per request, with nothing trailing it
        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 13\r\n"));
        assert!(response.ends_with("\r\n\r\n<h1>home</h1>"));
    }
    assert_eq!(metrics.requests.value(), 2);
}
