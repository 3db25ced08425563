use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reactor_server::buffer::{ByteBuffer, LinearBuffer};
use reactor_server::http::{HttpParser, Method, ParseStatus, Status};
use reactor_server::response::Response;
use reactor_server::ring_buffer::RingBuffer;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn benchmark_buffer_fd_io(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");

    group.bench_function("ring_drain_fill_4k", |b| {
        let (tx, rx) = UnixStream::pair().unwrap();
        let data = vec![7u8; 4096];
        let mut out = RingBuffer::new(8192);
        let mut input = LinearBuffer::new(8192);

        b.iter(|| {
            out.append(black_box(&data)).unwrap();
            while out.readable_bytes() > 0 {
                out.drain_to_fd(tx.as_raw_fd()).unwrap();
            }
            while input.readable_bytes() < data.len() {
                input.fill_from_fd(rx.as_raw_fd()).unwrap();
            }
            assert_eq!(input.read_all().len(), data.len());
        })
    });

    group.bench_function("linear_fill_through_spill_16k", |b| {
        let data = vec![1u8; 16 * 1024];
        b.iter_custom(|iters| {
            let (mut tx, rx) = UnixStream::pair().unwrap();
            let mut elapsed = Duration::ZERO;
            for _ in 0..iters {
                // a small buffer forces every fill past the free space
                let mut input = LinearBuffer::new(1024);
                tx.write_all(&data).unwrap();
                let start = Instant::now();
                while input.readable_bytes() < data.len() {
                    input.fill_from_fd(rx.as_raw_fd()).unwrap();
                }
                elapsed += start.elapsed();
            }
            elapsed
        })
    });

    group.finish();
}

fn benchmark_http_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_parser");

    let simple_request = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";

    group.bench_function("parse_simple_request", |b| {
        let mut buffer = LinearBuffer::new(1024);
        let mut parser = HttpParser::new();
        b.iter(|| {
            buffer.append(black_box(simple_request)).unwrap();
            assert_eq!(parser.parse(&mut buffer).unwrap(), ParseStatus::Complete);
            let request = parser.get_request().unwrap();
            assert_eq!(request.method, Method::Get);
            assert_eq!(request.path, "/index.html");
            parser.reset();
        })
    });

    let form_request = b"POST /submit HTTP/1.1\r\n\
                         Host: example.com\r\n\
                         Content-Type: application/x-www-form-urlencoded\r\n\
                         Content-Length: 27\r\n\
                         User-Agent: Benchmark\r\n\
                         Accept: */*\r\n\
                         \r\n\
                         username=a+b&password=x%21y";

    group.bench_function("parse_form_request", |b| {
        let mut buffer = LinearBuffer::new(1024);
        let mut parser = HttpParser::new();
        b.iter(|| {
            buffer.append(black_box(form_request)).unwrap();
            assert_eq!(parser.parse(&mut buffer).unwrap(), ParseStatus::Complete);
            let request = parser.get_request().unwrap();
            assert_eq!(request.method, Method::Post);
            assert_eq!(request.form("username"), Some("a b"));
            parser.reset();
        })
    });

    group.bench_function("parse_byte_at_a_time", |b| {
        b.iter(|| {
            let mut buffer = LinearBuffer::new(64);
            let mut parser = HttpParser::new();
            let mut status = ParseStatus::Incomplete;
            for byte in simple_request.iter() {
                buffer.append(&[*byte]).unwrap();
                status = parser.parse(&mut buffer).unwrap();
            }
            assert_eq!(status, ParseStatus::Complete);
        })
    });

    group.finish();
}

fn benchmark_response_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("response");

    group.bench_function("stage_error_page", |b| {
        let mut buffer = RingBuffer::new(4096);
        b.iter(|| {
            let response = Response::inline(black_box(Status::NotFound), "File NotFound!", true);
            response.write_into(&mut buffer).unwrap();
            assert!(buffer.readable_bytes() > 0);
            buffer.reset();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_buffer_fd_io,
    benchmark_http_parsing,
    benchmark_response_head
);
criterion_main!(benches);
