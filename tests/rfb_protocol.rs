//! End-to-end protocol tests: drive a real [`Server`] over a loopback TCP
//! connection and assert on the exact bytes a viewer would see.

use std::time::Duration;
use tinyrfb::{Event, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Binds the server to an OS-assigned loopback port and returns both the
/// running server and the address clients should connect to.
async fn spawn_server(width: u32, height: u32) -> (Server, std::net::SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(width, height, 4).unwrap();
    server.set_socket(listener).unwrap();
    server.start().await.unwrap();
    (server, addr)
}

async fn handshake_none(stream: &mut TcpStream) {
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"RFB 003.008\n");
    stream.write_all(&version).await.unwrap();

    let mut sec_types = [0u8; 2];
    stream.read_exact(&mut sec_types).await.unwrap();
    assert_eq!(sec_types[0], 1, "one security type offered");
    assert_eq!(sec_types[1], 1, "security type None");
    stream.write_all(&[1]).await.unwrap();

    let mut sec_result = [0u8; 4];
    stream.read_exact(&mut sec_result).await.unwrap();
    assert_eq!(u32::from_be_bytes(sec_result), 0, "SecurityResult OK");

    stream.write_all(&[1]).await.unwrap(); // ClientInit: shared-flag
}

#[tokio::test]
async fn handshake_v8_exact_bytes() {
    let (server, addr) = spawn_server(2, 1).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    handshake_none(&mut stream).await;

    let mut server_init = [0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    assert_eq!(u16::from_be_bytes([server_init[0], server_init[1]]), 2);
    assert_eq!(u16::from_be_bytes([server_init[2], server_init[3]]), 1);
    assert_eq!(server_init[4], 32, "bits_per_pixel");
    assert_eq!(server_init[5], 24, "depth");
    assert_eq!(server_init[6], 0, "little-endian");
    assert_eq!(server_init[7], 1, "true-colour");

    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let len = u32::from_be_bytes(name_len) as usize;
    let mut name = vec![0u8; len];
    stream.read_exact(&mut name).await.unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn handshake_v3_fallback() {
    let (server, addr) = spawn_server(4, 4).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"RFB 003.008\n");
    stream.write_all(b"RFB 003.003\n").await.unwrap();

    // v3.3: server sends the chosen security type unconditionally, no list.
    let mut sec_type = [0u8; 4];
    stream.read_exact(&mut sec_type).await.unwrap();
    assert_eq!(u32::from_be_bytes(sec_type), 1);

    stream.write_all(&[1]).await.unwrap(); // ClientInit

    let mut server_init_header = [0u8; 4];
    stream.read_exact(&mut server_init_header).await.unwrap();
    assert_eq!(u16::from_be_bytes([server_init_header[0], server_init_header[1]]), 4);
    assert_eq!(u16::from_be_bytes([server_init_header[2], server_init_header[3]]), 4);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn framebuffer_update_raw_exact_bytes() {
    let (server, addr) = spawn_server(2, 1).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none(&mut stream).await;

    let mut server_init = vec![0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let mut name = vec![0u8; u32::from_be_bytes(name_len) as usize];
    stream.read_exact(&mut name).await.unwrap();

    {
        let mut fb = server.lock_fb(true);
        fb.set_pixel(0, 0, 0x00_0A_14_1E); // (10, 20, 30)
        fb.set_pixel(1, 0, 0x00_28_32_3C); // (40, 50, 60)
    }

    // FramebufferUpdateRequest: type=3, incremental=0, x=0, y=0, w=2, h=1
    let request: [u8; 10] = [3, 0, 0, 0, 0, 0, 0, 2, 0, 1];
    stream.write_all(&request).await.unwrap();

    let mut response = [0u8; 16 + 2 * 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();

    let expected: [u8; 24] = [
        0x00, 0x00, 0x00, 0x01, // FramebufferUpdate, padding, 1 rectangle
        0x00, 0x00, 0x00, 0x00, // x=0, y=0
        0x00, 0x02, 0x00, 0x01, // w=2, h=1
        0x00, 0x00, 0x00, 0x00, // encoding = Raw
        0x1E, 0x14, 0x0A, 0x00, // pixel (10,20,30) as BGRX little-endian
        0x3C, 0x32, 0x28, 0x00, // pixel (40,50,60)
    ];
    assert_eq!(response, expected);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn set_pixel_format_changes_update_wire_bytes() {
    let (server, addr) = spawn_server(2, 1).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none(&mut stream).await;

    let mut server_init = vec![0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let mut name = vec![0u8; u32::from_be_bytes(name_len) as usize];
    stream.read_exact(&mut name).await.unwrap();

    {
        let mut fb = server.lock_fb(true);
        fb.set_pixel(0, 0, 0x00_FF_00_00); // pure red
        fb.set_pixel(1, 0, 0x00_00_FF_00); // pure green
    }

    // SetPixelFormat: type=0, 3 pad, then the 16-byte PixelFormat record for
    // RGB565 (bpp=16, depth=16, little-endian, true-colour).
    let set_pixel_format: [u8; 20] = [
        0, 0, 0, 0, // type=0, 3 pad
        16, 16, 0, 1, // bits_per_pixel, depth, big_endian_flag, true_colour_flag
        0, 31, // red_max = 31
        0, 63, // green_max = 63
        0, 31, // blue_max = 31
        11, 5, 0, // red_shift, green_shift, blue_shift
        0, 0, 0, // padding
    ];
    stream.write_all(&set_pixel_format).await.unwrap();

    // FramebufferUpdateRequest: type=3, incremental=0, x=0, y=0, w=2, h=1
    let request: [u8; 10] = [3, 0, 0, 0, 0, 0, 0, 2, 0, 1];
    stream.write_all(&request).await.unwrap();

    let mut response = [0u8; 16 + 2 * 2];
    timeout(Duration::from_secs(2), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();

    // Pure red under RGB565 (mask 31 at shift 11) packs to 0xF800; pure
    // green (mask 63 at shift 5) packs to 0x07E0. Both little-endian.
    let expected: [u8; 20] = [
        0x00, 0x00, 0x00, 0x01, // FramebufferUpdate, padding, 1 rectangle
        0x00, 0x00, 0x00, 0x00, // x=0, y=0
        0x00, 0x02, 0x00, 0x01, // w=2, h=1
        0x00, 0x00, 0x00, 0x00, // encoding = Raw
        0x00, 0xF8, 0xE0, 0x07, // pixel data: red then green under RGB565
    ];
    assert_eq!(response, expected);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn key_event_reaches_poll_event() {
    let (server, addr) = spawn_server(4, 4).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none(&mut stream).await;

    let mut server_init = vec![0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let mut name = vec![0u8; u32::from_be_bytes(name_len) as usize];
    stream.read_exact(&mut name).await.unwrap();

    // KeyEvent: type=4, down-flag=1, padding(2), keysym=0x0061 ('a')
    let msg: [u8; 8] = [4, 1, 0, 0, 0, 0, 0, 0x61];
    stream.write_all(&msg).await.unwrap();

    let event = loop {
        if let Some(e) = server.poll_event() {
            break e;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(event, Event::Key { down: true, code: 0x61 });

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_completes_promptly_with_client_connected() {
    let (server, addr) = spawn_server(4, 4).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none(&mut stream).await;

    let mut server_init = vec![0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let mut name = vec![0u8; u32::from_be_bytes(name_len) as usize];
    stream.read_exact(&mut name).await.unwrap();

    let start = std::time::Instant::now();
    timeout(Duration::from_secs(2), server.stop()).await.unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn unknown_message_type_closes_connection_without_crashing() {
    let (server, addr) = spawn_server(4, 4).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake_none(&mut stream).await;

    let mut server_init = vec![0u8; 4 + 16];
    stream.read_exact(&mut server_init).await.unwrap();
    let mut name_len = [0u8; 4];
    stream.read_exact(&mut name_len).await.unwrap();
    let mut name = vec![0u8; u32::from_be_bytes(name_len) as usize];
    stream.read_exact(&mut name).await.unwrap();

    stream.write_all(&[0x7F]).await.unwrap();

    let mut buf = [0u8; 1];
    let result = timeout(Duration::from_secs(2), stream.read(&mut buf)).await.unwrap();
    match result {
        Ok(0) => {} // connection closed, as expected
        Ok(_) => panic!("server kept talking after an unknown message type"),
        Err(_) => panic!("read error instead of a clean close"),
    }

    server.stop().await.unwrap();
}
