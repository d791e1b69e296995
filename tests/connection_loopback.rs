//! End-to-end loopback tests: a minimal hand-rolled bus on a std blocking
//! `UnixListener`, a real `busway::Connection` on the other end, talking the
//! actual AUTH line protocol and the binary wire format.

use std::convert::TryInto;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::Duration;

use busway::{Connection, ConnectionBuilder, ConnectionState, LocalServer, Message, ObjectPath, Reader, Writer};

fn socket_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("busway-test-{}-{}.sock", std::process::id(), tag))
}

/// Reads bytes off `stream` until `buf` holds a full CRLF-terminated line,
/// returning it without the terminator and leaving any trailing bytes in
/// `buf` for the next read.
fn read_line(stream: &mut UnixStream, buf: &mut Vec<u8>) -> String {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8(buf[..pos].to_vec()).unwrap();
            buf.drain(..pos + 2);
            return line;
        }
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed mid-handshake");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Reads a full framed message, using the same prologue-peeking approach
/// `Connection`'s own receive pipeline uses, so the fake bus never has to
/// guess at a fixed read size.
fn read_message(stream: &mut UnixStream, buf: &mut Vec<u8>) -> Message {
    loop {
        if buf.len() >= 16 {
            let body_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
            let fields_len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
            let fields_end = 16 + fields_len;
            let pad = (8 - fields_end % 8) % 8;
            let body_start = fields_end + pad;
            let total = body_start + body_len;
            if buf.len() >= total {
                let (msg, consumed) = Message::deserialize(&buf[..total]).unwrap();
                buf.drain(..consumed);
                return msg;
            }
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed mid-message");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drives the server side of the AUTH handshake: leading NUL, `AUTH
/// EXTERNAL`, `OK`, the unix-fd negotiation dance, `BEGIN`. Returns
/// whatever trailing bytes were already read past `BEGIN\r\n`.
fn server_handshake(stream: &mut UnixStream) -> Vec<u8> {
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul).unwrap();
    assert_eq!(nul[0], 0);

    let mut buf = Vec::new();
    let auth_line = read_line(stream, &mut buf);
    assert!(auth_line.starts_with("AUTH EXTERNAL "), "got: {auth_line}");
    stream
        .write_all(b"OK 0000000000000000000000000000000000000000\r\n")
        .unwrap();

    let next = read_line(stream, &mut buf);
    if next == "NEGOTIATE_UNIX_FD" {
        stream.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
        let begin = read_line(stream, &mut buf);
        assert_eq!(begin, "BEGIN");
    } else {
        assert_eq!(next, "BEGIN");
    }
    buf
}

fn write_message(stream: &mut UnixStream, msg: &Message) {
    stream.write_all(&msg.serialize().unwrap()).unwrap();
}

/// Drives the client side of the AUTH handshake against a `LocalServer`,
/// the reverse of `server_handshake`.
fn client_handshake(stream: &mut UnixStream) {
    stream.write_all(&[0u8]).unwrap();
    stream.write_all(b"AUTH EXTERNAL 30\r\n").unwrap();

    let mut buf = Vec::new();
    let ok = read_line(stream, &mut buf);
    assert!(ok.starts_with("OK "), "got: {ok}");
    stream.write_all(b"BEGIN\r\n").unwrap();
}

/// A `LocalServer` accepts a peer that completes the AUTH handshake and
/// hands back a `Connection` that is already `Connected` with no unique
/// name -- there is no bus daemon on a peer-to-peer link to assign one.
#[test]
fn local_server_accepts_peer_without_hello() {
    let path = socket_path("peer");
    let _ = std::fs::remove_file(&path);
    let addr = format!("unix:path={}", path.display());

    let mut server = LocalServer::bind(&addr, false).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        // Give the server a moment to be listening; `LocalServer::bind`
        // already bound the socket before this thread was spawned, but a
        // real client would normally retry on `ConnectionRefused`.
        let mut stream = UnixStream::connect(&client_path).unwrap();
        client_handshake(&mut stream);
        // Keep the stream open long enough for the assertions below.
        thread::sleep(Duration::from_millis(200));
    });

    let mut server_conn: Option<Connection> = None;
    for _ in 0..100 {
        if let Some(conn) = server.try_accept().unwrap() {
            server_conn = Some(conn);
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let server_conn = server_conn.expect("server should have accepted the peer");

    assert_eq!(server_conn.state(), ConnectionState::Connected);
    assert_eq!(server_conn.unique_name(), None);
    assert!(!server_conn.supports_passing_file_descriptors());

    client.join().unwrap();
}

/// A client that authenticates and completes `Hello` can make a method
/// call and read back a real reply body.
#[test]
fn connect_hello_and_round_trip_call() {
    let path = socket_path("call");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let server_path = path.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = server_handshake(&mut stream);

        let hello = read_message(&mut stream, &mut buf);
        assert_eq!(hello.header.member.as_deref(), Some("Hello"));

        let mut w = Writer::new();
        w.write_string(":1.42").unwrap();
        let body = w.finish().unwrap();
        write_message(&mut stream, &Message::method_return(&hello.header).with_body(body));

        let call = read_message(&mut stream, &mut buf);
        assert_eq!(call.header.member.as_deref(), Some("Ping"));

        let mut w = Writer::new();
        w.write_string("pong").unwrap();
        let body = w.finish().unwrap();
        write_message(&mut stream, &Message::method_return(&call.header).with_body(body));

        let _ = std::fs::remove_file(&server_path);
    });

    let mut conn = ConnectionBuilder::for_address_string(&format!("unix:path={}", path.display()))
        .unwrap()
        .connect()
        .unwrap();

    let call_msg = Message::method_call(ObjectPath::new("/test").unwrap(), "Ping".to_string())
        .with_destination("org.example".to_string());
    let result = conn.call(call_msg, Some(Duration::from_secs(5))).unwrap();

    let mut reader = Reader::new(&result.data, result.signature.as_str()).unwrap();
    assert_eq!(reader.read_string().unwrap(), "pong");
    assert_eq!(conn.unique_name(), Some(":1.42"));
    assert_eq!(conn.state(), ConnectionState::Connected);

    server.join().unwrap();
}

/// A call that never gets a reply completes with a timeout rather than
/// hanging `call()` forever.
#[test]
fn call_without_reply_times_out() {
    let path = socket_path("timeout");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let server_path = path.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = server_handshake(&mut stream);

        let hello = read_message(&mut stream, &mut buf);
        let mut w = Writer::new();
        w.write_string(":1.7").unwrap();
        let body = w.finish().unwrap();
        write_message(&mut stream, &Message::method_return(&hello.header).with_body(body));

        // Read (and drop) the call, but never answer it.
        let _ = read_message(&mut stream, &mut buf);

        // Keep the stream open until the client gives up so the test
        // exercises a real timeout rather than a disconnect.
        thread::sleep(Duration::from_millis(500));
        let _ = std::fs::remove_file(&server_path);
    });

    let mut conn = ConnectionBuilder::for_address_string(&format!("unix:path={}", path.display()))
        .unwrap()
        .connect()
        .unwrap();

    let call_msg = Message::method_call(ObjectPath::new("/test").unwrap(), "Never".to_string())
        .with_destination("org.example".to_string());
    let result = conn.call(call_msg, Some(Duration::from_millis(100)));
    assert!(matches!(result, Err(busway::Error::Timeout)));

    server.join().unwrap();
}

/// A signal arriving unsolicited shows up through `try_recv`, not routed
/// into any pending-reply table.
#[test]
fn unsolicited_signal_is_queued_for_try_recv() {
    let path = socket_path("signal");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let server_path = path.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = server_handshake(&mut stream);

        let hello = read_message(&mut stream, &mut buf);
        let mut w = Writer::new();
        w.write_string(":1.9").unwrap();
        let body = w.finish().unwrap();
        write_message(&mut stream, &Message::method_return(&hello.header).with_body(body));

        let signal = Message::signal(
            ObjectPath::new("/test").unwrap(),
            "org.example.Iface".to_string(),
            "Tick".to_string(),
        );
        write_message(&mut stream, &signal);

        thread::sleep(Duration::from_millis(200));
        let _ = std::fs::remove_file(&server_path);
    });

    let mut conn = ConnectionBuilder::for_address_string(&format!("unix:path={}", path.display()))
        .unwrap()
        .connect()
        .unwrap();

    let mut seen = None;
    for _ in 0..50 {
        conn.step(Some(Duration::from_millis(20))).unwrap();
        if let Some(msg) = conn.try_recv() {
            seen = Some(msg);
            break;
        }
    }
    let msg = seen.expect("signal should have arrived");
    assert_eq!(msg.header.member.as_deref(), Some("Tick"));

    server.join().unwrap();
}

/// Closing the connection completes any still-pending call with
/// `LocalDisconnect` instead of leaving it hanging forever.
#[test]
fn close_completes_pending_calls_with_local_disconnect() {
    let path = socket_path("close");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let server_path = path.clone();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = server_handshake(&mut stream);

        let hello = read_message(&mut stream, &mut buf);
        let mut w = Writer::new();
        w.write_string(":1.3").unwrap();
        let body = w.finish().unwrap();
        write_message(&mut stream, &Message::method_return(&hello.header).with_body(body));

        // Never replies to the call that follows; just keeps the socket
        // open until the client closes first.
        let _ = read_message(&mut stream, &mut buf);
        thread::sleep(Duration::from_millis(300));
        let _ = std::fs::remove_file(&server_path);
    });

    let mut conn = ConnectionBuilder::for_address_string(&format!("unix:path={}", path.display()))
        .unwrap()
        .connect()
        .unwrap();

    let call_msg = Message::method_call(ObjectPath::new("/test").unwrap(), "Never".to_string())
        .with_destination("org.example".to_string());
    let pending = conn.send_with_reply(call_msg, None).unwrap();
    // Give the write a chance to actually land before closing.
    conn.step(Some(Duration::from_millis(50))).unwrap();

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(pending.try_take(), Some(busway::ReplyOutcome::LocalDisconnect)));

    server.join().unwrap();
}
