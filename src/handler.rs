use std::io::{self, Write as _};
use std::os::unix::fs::FileExt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use crate::cache::{AssetCache, AssetEntry, Body};
use crate::registry::Connection;
use crate::{BUFFER_SIZE, RTT_TIMEOUT};

/// Request methods the server distinguishes. Anything that is not `GET` or
/// `HEAD` gets an internal-error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

/// Split the request line into a method and request-target. Returns `None`
/// when either token is missing, which the caller answers with a 500.
pub fn parse_request_line(request: &[u8]) -> Option<(Method, &str)> {
    let sp = request.iter().position(|&b| b == b' ')?;
    let method = match &request[..sp] {
        b"GET" => Method::Get,
        b"HEAD" => Method::Head,
        _ => Method::Other,
    };
    let rest = &request[sp + 1..];
    let end = rest.iter().position(|&b| b == b' ')?;
    let target = std::str::from_utf8(&rest[..end]).ok()?;
    Some((method, target))
}

/// The only header the server inspects, matched on the literal bytes.
pub fn wants_close(head: &[u8]) -> bool {
    contains(head, b"Connection: close")
}

/// Byte offset of the blank-line terminator, if a complete request is
/// buffered.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

enum ReadOutcome {
    Data,
    Eof,
    TimedOut,
    Error,
}

/// Drive one worker-side interaction over an established TLS session.
///
/// Reads and parses requests until the peer goes idle, closes, or errors.
/// Returns `Some(conn)` when the connection stays alive and must be re-armed
/// by the reactor; `None` when it has been torn down.
pub async fn handle_request(mut conn: Connection, cache: &AssetCache) -> Option<Connection> {
    // Whether a response has gone out since this task started; an idle peer
    // is only parked once it is between requests.
    let mut served = false;

    loop {
        if conn.buf.len() >= BUFFER_SIZE {
            // Terminator never showed up within one buffer's worth of bytes.
            trace!(fd = conn.fd(), "request exceeded buffer, closing");
            conn.close().await;
            return None;
        }

        match read_some(&mut conn).await {
            ReadOutcome::Data => {}
            ReadOutcome::TimedOut => {
                if served && conn.buf.is_empty() {
                    return Some(conn);
                }
                conn.close().await;
                return None;
            }
            ReadOutcome::Eof | ReadOutcome::Error => {
                conn.close().await;
                return None;
            }
        }

        // Serve every complete request currently buffered.
        while let Some(end) = find_terminator(&conn.buf) {
            let request = parse_request_line(&conn.buf[..end])
                .map(|(method, target)| (method, strip_slash(target).to_string()));
            conn.keep_alive = !wants_close(&conn.buf[..end]);
            conn.buf.drain(..end + 4);

            let result = match request {
                Some((Method::Get, key)) => respond_with_asset(&mut conn, cache, &key, false).await,
                Some((Method::Head, key)) => respond_with_asset(&mut conn, cache, &key, true).await,
                _ => {
                    conn.keep_alive = false;
                    send_internal_error(&mut conn, cache).await
                }
            };

            if result.is_err() || !conn.keep_alive {
                conn.close().await;
                return None;
            }
            served = true;
        }
    }
}

fn strip_slash(target: &str) -> &str {
    target.strip_prefix('/').unwrap_or(target)
}

/// Pull more bytes into the connection buffer, bounded by the round-trip
/// timeout. The buffer never grows past `BUFFER_SIZE`.
async fn read_some(conn: &mut Connection) -> ReadOutcome {
    let mut scratch = [0u8; BUFFER_SIZE];
    let want = BUFFER_SIZE - conn.buf.len();
    match timeout(RTT_TIMEOUT, conn.stream.read(&mut scratch[..want])).await {
        Ok(Ok(0)) => ReadOutcome::Eof,
        Ok(Ok(n)) => {
            conn.buf.extend_from_slice(&scratch[..n]);
            ReadOutcome::Data
        }
        Ok(Err(err)) => {
            trace!(fd = conn.fd(), %err, "read failed");
            ReadOutcome::Error
        }
        Err(_) => ReadOutcome::TimedOut,
    }
}

async fn respond_with_asset(
    conn: &mut Connection,
    cache: &AssetCache,
    key: &str,
    head_only: bool,
) -> io::Result<()> {
    match cache.lookup(key) {
        Some(entry) => send_asset(conn, entry, head_only).await,
        None => {
            conn.keep_alive = false;
            send_not_found(conn, cache).await
        }
    }
}

async fn send_asset(conn: &mut Connection, entry: &AssetEntry, head_only: bool) -> io::Result<()> {
    let mut head = Vec::with_capacity(256);
    write!(
        head,
        "HTTP/1.1 200 OK\r\nServer: legion\r\n\
         Content-Type: {}; charset=UTF-8\r\n\
         Content-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        entry.mime_type().as_str(),
        entry.size()
    )?;
    write_bounded(conn, &head).await?;
    if !head_only {
        write_body(conn, entry).await?;
    }
    flush_bounded(conn).await
}

async fn send_not_found(conn: &mut Connection, cache: &AssetCache) -> io::Result<()> {
    let page = cache.not_found();
    let mut head = Vec::with_capacity(256);
    // The space before "charset" is part of the wire contract for this
    // status; existing clients match the line literally.
    write!(
        head,
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: {} charset=UTF-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        page.mime_type().as_str(),
        page.size()
    )?;
    write_bounded(conn, &head).await?;
    write_body(conn, page).await?;
    flush_bounded(conn).await
}

async fn send_internal_error(conn: &mut Connection, cache: &AssetCache) -> io::Result<()> {
    let page = cache.server_error();
    let mut head = Vec::with_capacity(256);
    write!(
        head,
        "HTTP/1.1 500 Internal Server Error\r\n\
         Content-Type: {}; charset=UTF-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        page.mime_type().as_str(),
        page.size()
    )?;
    write_bounded(conn, &head).await?;
    write_body(conn, page).await?;
    flush_bounded(conn).await
}

/// Stream an asset body: one bulk write for mapped files, chunked positional
/// reads for fd-backed files.
async fn write_body(conn: &mut Connection, entry: &AssetEntry) -> io::Result<()> {
    match entry.body() {
        Body::Mapped(map) => write_bounded(conn, &map[..]).await,
        Body::Fd(file) => {
            let mut chunk = [0u8; BUFFER_SIZE];
            let mut offset = 0u64;
            while offset < entry.size() {
                let n = file.read_at(&mut chunk, offset)?;
                if n == 0 {
                    break;
                }
                write_bounded(conn, &chunk[..n]).await?;
                offset += n as u64;
            }
            Ok(())
        }
    }
}

async fn write_bounded(conn: &mut Connection, buf: &[u8]) -> io::Result<()> {
    match timeout(RTT_TIMEOUT, conn.stream.write_all(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
    }
}

async fn flush_bounded(conn: &mut Connection) -> io::Result<()> {
    match timeout(RTT_TIMEOUT, conn.stream.flush()).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "flush timed out")),
    }
}
