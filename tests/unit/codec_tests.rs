//! Unit tests for the lossy line codec.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use agent_foreman::supervisor::codec::StreamLineCodec;

#[test]
fn decodes_complete_lines() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from("first\nsecond\n");

    assert_eq!(codec.decode(&mut buf).expect("ok"), Some("first".into()));
    assert_eq!(codec.decode(&mut buf).expect("ok"), Some("second".into()));
    assert_eq!(codec.decode(&mut buf).expect("ok"), None);
}

#[test]
fn buffers_partial_lines() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from("par");

    assert_eq!(codec.decode(&mut buf).expect("ok"), None);
    buf.extend_from_slice(b"tial\n");
    assert_eq!(codec.decode(&mut buf).expect("ok"), Some("partial".into()));
}

#[test]
fn strips_carriage_return() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from("windows line\r\n");

    assert_eq!(
        codec.decode(&mut buf).expect("ok"),
        Some("windows line".into())
    );
}

#[test]
fn invalid_utf8_is_replaced_not_fatal() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from(&b"caf\xff latte\n"[..]);

    let line = codec.decode(&mut buf).expect("ok").expect("line");
    assert!(line.starts_with("caf"));
    assert!(line.contains('\u{FFFD}'), "got {line:?}");
    assert!(line.ends_with("latte"));
}

#[test]
fn oversized_line_errors_then_resyncs() {
    let mut codec = StreamLineCodec::with_max_length(8);
    let mut buf = BytesMut::from("0123456789abcdef");

    // Over the cap with no newline: one error, remainder discarded.
    assert!(codec.decode(&mut buf).is_err());

    // Tail of the oversized line plus a healthy one.
    buf.extend_from_slice(b"tail\nok\n");
    assert_eq!(codec.decode(&mut buf).expect("ok"), Some("ok".into()));
}

#[test]
fn eof_flushes_unterminated_line() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from("no newline");

    assert_eq!(codec.decode(&mut buf).expect("ok"), None);
    assert_eq!(
        codec.decode_eof(&mut buf).expect("ok"),
        Some("no newline".into())
    );
    assert_eq!(codec.decode_eof(&mut buf).expect("ok"), None);
}

#[test]
fn empty_lines_pass_through() {
    let mut codec = StreamLineCodec::new();
    let mut buf = BytesMut::from("\n\n");

    assert_eq!(codec.decode(&mut buf).expect("ok"), Some(String::new()));
    assert_eq!(codec.decode(&mut buf).expect("ok"), Some(String::new()));
}
