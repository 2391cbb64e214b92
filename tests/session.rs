//! End-to-end protocol tests: a real TCP session from handshake through
//! decoded framebuffer updates.

use rfbserver::auth::encrypt_challenge;
use rfbserver::{PixelFormat, ServerEvent, VncServer};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const ENCODING_RAW: i32 = 0;
const ENCODING_COPYRECT: i32 = 1;
const ENCODING_TIGHT: i32 = 7;
const ENCODING_RICH_CURSOR: i32 = -239;
const ENCODING_LAST_RECT: i32 = -224;

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Connects a viewer socket to a server that adopts the other end.
async fn connect(server: &VncServer) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let viewer = TcpStream::connect(addr).await.unwrap();
    let (served, _) = listener.accept().await.unwrap();
    let server = server.clone();
    tokio::spawn(async move { server.serve_stream(served).await });
    viewer
}

/// Runs the no-auth RFB 3.3 handshake, returning the ServerInit bytes
/// after the name length field (the name itself).
async fn handshake(stream: &mut TcpStream) -> (u16, u16, Vec<u8>, String) {
    let banner = read_exact(stream, 12).await;
    assert_eq!(&banner, b"RFB 003.003\n");
    stream.write_all(b"RFB 003.003\n").await.unwrap();

    let auth = read_exact(stream, 4).await;
    assert_eq!(auth, 1u32.to_be_bytes()); // no authentication

    stream.write_all(&[1]).await.unwrap(); // shared

    let head = read_exact(stream, 24).await;
    let width = u16::from_be_bytes([head[0], head[1]]);
    let height = u16::from_be_bytes([head[2], head[3]]);
    let pixel_format = head[4..20].to_vec();
    let name_len = u32::from_be_bytes([head[20], head[21], head[22], head[23]]) as usize;
    let name = String::from_utf8(read_exact(stream, name_len).await).unwrap();
    (width, height, pixel_format, name)
}

fn set_encodings_msg(encodings: &[i32]) -> Vec<u8> {
    let mut msg = vec![2u8, 0];
    msg.extend((encodings.len() as u16).to_be_bytes());
    for &enc in encodings {
        msg.extend(enc.to_be_bytes());
    }
    msg
}

fn update_request_msg(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut msg = vec![3u8, u8::from(incremental)];
    msg.extend(x.to_be_bytes());
    msg.extend(y.to_be_bytes());
    msg.extend(w.to_be_bytes());
    msg.extend(h.to_be_bytes());
    msg
}

/// Reads a FramebufferUpdate header, returning the rectangle count.
async fn read_update_header(stream: &mut TcpStream) -> u16 {
    let head = read_exact(stream, 4).await;
    assert_eq!(head[0], 0, "expected FramebufferUpdate");
    u16::from_be_bytes([head[2], head[3]])
}

/// Reads one rectangle header: (x, y, w, h, encoding).
async fn read_rect_header(stream: &mut TcpStream) -> (u16, u16, u16, u16, i32) {
    let head = read_exact(stream, 12).await;
    (
        u16::from_be_bytes([head[0], head[1]]),
        u16::from_be_bytes([head[2], head[3]]),
        u16::from_be_bytes([head[4], head[5]]),
        u16::from_be_bytes([head[6], head[7]]),
        i32::from_be_bytes([head[8], head[9], head[10], head[11]]),
    )
}

fn test_server() -> VncServer {
    VncServer::new(4, 3)
}

#[tokio::test]
async fn handshake_and_server_init() {
    let server = test_server();
    server.set_desktop_name("TEST").await;
    let mut viewer = connect(&server).await;

    let (width, height, pixel_format, name) = handshake(&mut viewer).await;
    assert_eq!((width, height), (4, 3));
    assert_eq!(name, "TEST");

    // 32bpp depth 24, little-endian true colour, 8 bits per channel at
    // shifts 16/8/0.
    assert_eq!(
        pixel_format,
        vec![32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0]
    );
}

#[tokio::test]
async fn raw_update_of_zeroed_framebuffer() {
    let server = test_server();
    server.set_defer_update_ms(0).await;
    let mut viewer = connect(&server).await;
    handshake(&mut viewer).await;

    viewer
        .write_all(&update_request_msg(false, 0, 0, 4, 3))
        .await
        .unwrap();

    assert_eq!(read_update_header(&mut viewer).await, 1);
    assert_eq!(read_rect_header(&mut viewer).await, (0, 0, 4, 3, ENCODING_RAW));
    let pixels = read_exact(&mut viewer, 48).await;
    assert_eq!(pixels, vec![0u8; 48]);
}

#[tokio::test]
async fn copyrect_after_server_side_copy() {
    let server = test_server();
    server.set_defer_update_ms(0).await;
    let format = PixelFormat::rgb32();
    let mut viewer = connect(&server).await;
    handshake(&mut viewer).await;

    viewer
        .write_all(&set_encodings_msg(&[ENCODING_COPYRECT, ENCODING_RAW]))
        .await
        .unwrap();

    // Row 0: red, green, blue, white.
    let mut row = Vec::new();
    for (r, g, b) in [(255u8, 0u8, 0u8), (0, 255, 0), (0, 0, 255), (255, 255, 255)] {
        row.extend(format.rgb_to_pixel(r, g, b).to_le_bytes());
    }
    server.update_framebuffer(&row, 0, 0, 4, 1).await;

    viewer
        .write_all(&update_request_msg(false, 0, 0, 4, 3))
        .await
        .unwrap();
    let n = read_update_header(&mut viewer).await;
    assert_eq!(n, 1);
    let (_, _, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!(enc, ENCODING_RAW);
    read_exact(&mut viewer, usize::from(w) * usize::from(h) * 4).await;

    // Copy columns 0..2 of row 0 two columns to the right.
    server.do_copy_rect(0, 0, 2, 1, 2, 0).await;

    viewer
        .write_all(&update_request_msg(true, 0, 0, 4, 3))
        .await
        .unwrap();
    assert_eq!(read_update_header(&mut viewer).await, 1);
    assert_eq!(
        read_rect_header(&mut viewer).await,
        (2, 0, 2, 1, ENCODING_COPYRECT)
    );
    let src = read_exact(&mut viewer, 4).await;
    assert_eq!(src, [0, 0, 0, 0]); // src_x = 0, src_y = 0

    // The server framebuffer now reads red, green, red, green.
    let fb = server
        .framebuffer()
        .read_rect(&rfbserver::Rect::new(0, 0, 4, 1))
        .await;
    assert_eq!(fb[0..4], fb[8..12]);
    assert_eq!(fb[4..8], fb[12..16]);
    assert_eq!(&fb[8..12], &format.rgb_to_pixel(255, 0, 0).to_le_bytes());
}

#[tokio::test]
async fn rich_cursor_shape_sent_once() {
    let server = test_server();
    server.set_defer_update_ms(0).await;

    let mut cursor = rfbserver::Cursor::from_bitmaps(2, 2, 0, 0, vec![0xC0, 0xC0], vec![0xC0, 0xC0]);
    cursor.rich_rgb = Some(vec![255, 0, 0, 0, 0, 0, 0, 0, 0, 255, 0, 0]);
    server.set_cursor(Some(cursor)).await;

    let mut viewer = connect(&server).await;
    handshake(&mut viewer).await;

    // One write, so the encodings and the request are handled in the
    // same pass and the cursor shape rides the first real update.
    let mut msgs = set_encodings_msg(&[ENCODING_RAW, ENCODING_RICH_CURSOR]);
    msgs.extend(update_request_msg(false, 0, 0, 4, 3));
    viewer.write_all(&msgs).await.unwrap();

    assert_eq!(read_update_header(&mut viewer).await, 2);
    let (x, y, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!(enc, ENCODING_RICH_CURSOR);
    assert_eq!((x, y), (0, 0)); // hotspot
    assert_eq!((w, h), (2, 2));
    // Four client pixels then one padded mask byte per row.
    let payload = read_exact(&mut viewer, 4 * 4 + 2).await;
    assert_eq!(&payload[16..], &[0xC0, 0xC0]);

    let (_, _, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!(enc, ENCODING_RAW);
    read_exact(&mut viewer, usize::from(w) * usize::from(h) * 4).await;

    // With the cursor unchanged, the next update has no cursor rect.
    server.mark_rect_modified(0, 0, 1, 0).await;
    viewer
        .write_all(&update_request_msg(true, 0, 0, 4, 3))
        .await
        .unwrap();
    assert_eq!(read_update_header(&mut viewer).await, 1);
    let (_, _, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!(enc, ENCODING_RAW);
    read_exact(&mut viewer, usize::from(w) * usize::from(h) * 4).await;
}

#[tokio::test]
async fn tight_update_uses_last_rect_when_negotiated() {
    let server = test_server();
    server.set_defer_update_ms(0).await;
    let mut viewer = connect(&server).await;
    handshake(&mut viewer).await;

    let mut msgs = set_encodings_msg(&[ENCODING_TIGHT, ENCODING_LAST_RECT]);
    msgs.extend(update_request_msg(false, 0, 0, 4, 3));
    viewer.write_all(&msgs).await.unwrap();

    assert_eq!(read_update_header(&mut viewer).await, 0xFFFF);

    // A zeroed 4x3 rectangle compresses to a single Tight fill.
    let (_, _, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!((w, h, enc), (4, 3, ENCODING_TIGHT));
    let fill = read_exact(&mut viewer, 4).await;
    assert_eq!(fill, [0x80, 0, 0, 0]);

    // The terminator closes the open-ended update.
    let (x, y, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!((x, y, w, h), (0, 0, 0, 0));
    assert_eq!(enc, ENCODING_LAST_RECT);
}

#[tokio::test]
async fn vnc_authentication_challenge() {
    let server = test_server();
    server.set_password(Some("secret".to_string())).await;
    let mut viewer = connect(&server).await;

    let banner = read_exact(&mut viewer, 12).await;
    assert_eq!(&banner, b"RFB 003.003\n");
    viewer.write_all(b"RFB 003.003\n").await.unwrap();

    let scheme = read_exact(&mut viewer, 4).await;
    assert_eq!(scheme, 2u32.to_be_bytes()); // VNC authentication

    let challenge: [u8; 16] = read_exact(&mut viewer, 16).await.try_into().unwrap();
    let response = encrypt_challenge("secret", &challenge);
    viewer.write_all(&response).await.unwrap();

    let result = read_exact(&mut viewer, 4).await;
    assert_eq!(result, 0u32.to_be_bytes()); // OK

    viewer.write_all(&[1]).await.unwrap();
    let head = read_exact(&mut viewer, 24).await;
    assert_eq!(u16::from_be_bytes([head[0], head[1]]), 4);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = test_server();
    server.set_password(Some("secret".to_string())).await;
    let mut viewer = connect(&server).await;

    read_exact(&mut viewer, 12).await;
    viewer.write_all(b"RFB 003.003\n").await.unwrap();
    read_exact(&mut viewer, 4).await; // scheme
    let challenge: [u8; 16] = read_exact(&mut viewer, 16).await.try_into().unwrap();
    let response = encrypt_challenge("hunter2", &challenge);
    viewer.write_all(&response).await.unwrap();

    let result = read_exact(&mut viewer, 4).await;
    assert_eq!(result, 1u32.to_be_bytes()); // failed

    // The server closes the connection after a failed check.
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(5), viewer.read(&mut probe))
        .await
        .expect("close timed out")
        .expect("read failed");
    assert_eq!(read, 0);
}

#[tokio::test]
async fn pointer_ownership_is_exclusive() {
    let server = test_server();
    server.set_defer_update_ms(0).await;
    let mut events = server.events().await.unwrap();

    let mut viewer_a = connect(&server).await;
    handshake(&mut viewer_a).await;
    let mut viewer_b = connect(&server).await;
    handshake(&mut viewer_b).await;

    let pointer = |mask: u8, x: u16, y: u16| {
        let mut msg = vec![5u8, mask];
        msg.extend(x.to_be_bytes());
        msg.extend(y.to_be_bytes());
        msg
    };

    // Client A presses; B's press while A holds the button is dropped;
    // A releases; then B is free to move.
    viewer_a.write_all(&pointer(1, 1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    viewer_b.write_all(&pointer(1, 2, 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    viewer_a.write_all(&pointer(0, 1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    viewer_b.write_all(&pointer(0, 3, 3)).await.unwrap();

    let mut pointer_events = Vec::new();
    while pointer_events.len() < 3 {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed");
        if let ServerEvent::PointerEvent { client_id, x, button_mask, .. } = event {
            pointer_events.push((client_id, x, button_mask));
        }
    }

    let ids: Vec<usize> = pointer_events.iter().map(|e| e.0).collect();
    // First two events come from the owner, the third from B after the
    // release; B's press at x=2 never surfaces.
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[2], ids[0]);
    assert_eq!(pointer_events[0].2, 1);
    assert_eq!(pointer_events[1].2, 0);
    assert_eq!(pointer_events[2].1, 3);
}

#[tokio::test]
async fn zlib_update_decompresses_to_raw_pixels() {
    let server = test_server();
    server.set_defer_update_ms(0).await;
    let format = PixelFormat::rgb32();
    let mut viewer = connect(&server).await;
    handshake(&mut viewer).await;

    viewer.write_all(&set_encodings_msg(&[6])).await.unwrap(); // Zlib

    let mut pixels = Vec::new();
    for i in 0..12u8 {
        pixels.extend(format.rgb_to_pixel(i * 20, 0, 255 - i * 20).to_le_bytes());
    }
    server.update_framebuffer(&pixels, 0, 0, 4, 3).await;

    viewer
        .write_all(&update_request_msg(false, 0, 0, 4, 3))
        .await
        .unwrap();

    assert_eq!(read_update_header(&mut viewer).await, 1);
    let (_, _, w, h, enc) = read_rect_header(&mut viewer).await;
    assert_eq!((w, h, enc), (4, 3, 6));

    let len_bytes = read_exact(&mut viewer, 4).await;
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let compressed = read_exact(&mut viewer, len).await;

    let mut inflater = flate2::Decompress::new(true);
    let mut out = vec![0u8; 1024];
    inflater
        .decompress(&compressed, &mut out, flate2::FlushDecompress::Sync)
        .unwrap();
    out.truncate(inflater.total_out() as usize);
    assert_eq!(out, pixels);
}
