//! Per-client connection worker: handshake, message dispatch, and the pixel
//! conversion pipeline that turns the shared framebuffer into each client's
//! negotiated format.

use crate::error::{Result, VncError};
use crate::events::Event;
use crate::framebuffer::Framebuffer;
use crate::io::{BufferedIo, IoOutcome};
use crate::logging::{log_error, log_info, log_warn};
use crate::protocol::{
    encode_server_cut_text, PixelFormat, ProtocolVersion, Rectangle, ServerInit,
    CLIENT_MSG_CLIENT_CUT_TEXT, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT,
    CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT,
    SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SERVER_MSG_FRAMEBUFFER_UPDATE,
};
use crate::server::ServerShared;
use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

/// Per-connection lifecycle state, polled cooperatively at every I/O
/// boundary instead of relying on task cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete, message loop running normally.
    Working,
    /// A stop has been requested; the worker will exit at its next poll.
    Stop,
    /// The worker has exited cleanly.
    Stopped,
    /// The worker exited due to a transport or protocol error.
    Error,
}

/// Milliseconds the message loop blocks on a single read before rechecking
/// whether a stop has been requested.
const POLL_TIMEOUT_MS: u64 = 250;
/// Timeout applied to handshake steps and outbound writes.
const IO_TIMEOUT_MS: u64 = 5000;

fn peer_name(addr: SocketAddr) -> String {
    format!("{addr}")
}

fn random_fallback_name() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("C-{suffix:08x}")
}

/// Runs one client connection to completion, returning once the handshake,
/// message loop, and any error handling have all concluded.
pub(crate) async fn run(
    socket: TcpStream,
    _addr: SocketAddr,
    shared: Arc<ServerShared>,
    state: Arc<Mutex<ConnectionState>>,
) -> Result<()> {
    let name = socket.peer_addr().map(peer_name).unwrap_or_else(|_| random_fallback_name());
    let sink = shared.log_sink.clone();
    log_info!(&sink, "{name}: connection accepted");

    let cut_text_rx = shared.cut_text_tx.subscribe();
    let mut io = BufferedIo::new(socket);
    let mut worker = Worker {
        io: &mut io,
        shared,
        state,
        name,
        pixel_format: PixelFormat::server_default(),
        client_fb: None,
        cut_text_rx,
    };

    let name_for_log = worker.name.clone();
    let result = match worker.negotiate().await {
        Ok(()) => worker.message_loop().await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) => log_info!(&sink, "{name_for_log}: connection closed"),
        Err(e) => log_error!(&sink, "{name_for_log}: connection terminated: {e}"),
    }
    result
}

struct Worker<'a> {
    io: &'a mut BufferedIo<TcpStream>,
    shared: Arc<ServerShared>,
    state: Arc<Mutex<ConnectionState>>,
    name: String,
    pixel_format: PixelFormat,
    client_fb: Option<Framebuffer>,
    cut_text_rx: broadcast::Receiver<String>,
}

impl<'a> Worker<'a> {
    fn is_stop_requested(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ConnectionState::Stop)
    }

    fn set_state(&self, s: ConnectionState) {
        *self.state.lock().unwrap() = s;
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let state = self.state.clone();
        self.io
            .read_exact_cooperative(buf, IO_TIMEOUT_MS, || {
                !matches!(*state.lock().unwrap(), ConnectionState::Stop)
            })
            .await
    }

    async fn negotiate(&mut self) -> Result<()> {
        self.io
            .write_all(&ProtocolVersion::V8.encode(), IO_TIMEOUT_MS)
            .await?;

        let mut version_buf = [0u8; 12];
        self.read_exact(&mut version_buf).await?;
        let version = ProtocolVersion::decode(&version_buf)?;

        match version {
            ProtocolVersion::V3 => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(u32::from(SECURITY_TYPE_NONE));
                self.io.write_all(&buf, IO_TIMEOUT_MS).await?;
            }
            ProtocolVersion::V7 | ProtocolVersion::V8 => {
                self.io.write_all(&[1, SECURITY_TYPE_NONE], IO_TIMEOUT_MS).await?;
                let mut chosen = [0u8; 1];
                self.read_exact(&mut chosen).await?;
                if chosen[0] != SECURITY_TYPE_NONE {
                    return Err(VncError::protocol("client selected unsupported security type"));
                }
                if version == ProtocolVersion::V8 {
                    let mut buf = BytesMut::with_capacity(4);
                    buf.put_u32(SECURITY_RESULT_OK);
                    self.io.write_all(&buf, IO_TIMEOUT_MS).await?;
                }
            }
        }

        let mut client_init = [0u8; 1];
        self.read_exact(&mut client_init).await?;

        let (width, height) = {
            let fb = self.shared.fb.lock().unwrap();
            (fb.width(), fb.height())
        };
        let server_init = ServerInit {
            framebuffer_width: width as u16,
            framebuffer_height: height as u16,
            pixel_format: self.pixel_format.clone(),
            name: "TEST".to_string(),
        };
        let mut buf = BytesMut::new();
        server_init.write_to(&mut buf);
        self.io.write_all(&buf, IO_TIMEOUT_MS).await?;

        Ok(())
    }

    async fn message_loop(&mut self) -> Result<()> {
        loop {
            if self.is_stop_requested() {
                self.set_state(ConnectionState::Stopped);
                return Ok(());
            }

            while let Ok(text) = self.cut_text_rx.try_recv() {
                if let Err(e) = self.send_cut_text(&text).await {
                    self.set_state(ConnectionState::Error);
                    return Err(e);
                }
            }

            let mut msg_type = [0u8; 1];
            match self.io.read_timeout(&mut msg_type, POLL_TIMEOUT_MS).await {
                Ok(IoOutcome::Timeout) => continue,
                Ok(IoOutcome::Data(_)) => {}
                Err(e) => {
                    self.set_state(ConnectionState::Error);
                    return Err(e);
                }
            }

            if let Err(e) = self.dispatch(msg_type[0]).await {
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
        }
    }

    async fn dispatch(&mut self, msg_type: u8) -> Result<()> {
        match msg_type {
            CLIENT_MSG_SET_PIXEL_FORMAT => self.handle_set_pixel_format().await,
            CLIENT_MSG_SET_ENCODINGS => self.handle_set_encodings().await,
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => self.handle_update_request().await,
            CLIENT_MSG_KEY_EVENT => self.handle_key_event().await,
            CLIENT_MSG_POINTER_EVENT => self.handle_pointer_event().await,
            CLIENT_MSG_CLIENT_CUT_TEXT => self.handle_cut_text().await,
            other => Err(VncError::protocol(format!("unknown message type {other}"))),
        }
    }

    async fn handle_set_pixel_format(&mut self) -> Result<()> {
        let mut body = [0u8; 19];
        self.read_exact(&mut body).await?;
        let mut buf = BytesMut::from(&body[3..]);
        let fmt = PixelFormat::from_bytes(&mut buf)?;
        if !fmt.is_valid() {
            return Err(VncError::protocol("invalid SetPixelFormat"));
        }

        let (width, height) = {
            let fb = self.shared.fb.lock().unwrap();
            (fb.width(), fb.height())
        };
        self.client_fb = Some(Framebuffer::create_of_format(width, height, &fmt)?);
        self.pixel_format = fmt;
        Ok(())
    }

    async fn handle_set_encodings(&mut self) -> Result<()> {
        let mut header = [0u8; 3];
        self.read_exact(&mut header).await?;
        let count = u16::from_be_bytes([header[1], header[2]]);
        let mut rest = vec![0u8; usize::from(count) * 4];
        self.read_exact(&mut rest).await?;
        let encodings: Vec<i32> = rest
            .chunks_exact(4)
            .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if !encodings.contains(&crate::protocol::ENCODING_RAW) && !encodings.is_empty() {
            log_warn!(&self.shared.log_sink, "{}: client did not list Raw encoding, sending it anyway", self.name);
        }
        Ok(())
    }

    async fn handle_update_request(&mut self) -> Result<()> {
        let mut body = [0u8; 9];
        self.read_exact(&mut body).await?;
        let _incremental = body[0] != 0;
        let x = u16::from_be_bytes([body[1], body[2]]);
        let y = u16::from_be_bytes([body[3], body[4]]);
        let w = u16::from_be_bytes([body[5], body[6]]);
        let h = u16::from_be_bytes([body[7], body[8]]);

        let need_create = self.client_fb.is_none();
        {
            let guard = self.shared.lock_fb(false);
            if need_create {
                self.client_fb = Some(Framebuffer::create_of_format(
                    guard.width(),
                    guard.height(),
                    &self.pixel_format,
                )?);
            }
            let dst = self.client_fb.as_mut().expect("just created above");
            Framebuffer::convert(dst, &guard)?;
        }
        let fb = self.client_fb.as_mut().expect("populated above");
        fb.endian(self.pixel_format.big_endian_flag != 0);

        let (x, y, w, h) = (u32::from(x), u32::from(y), u32::from(w), u32::from(h));
        if x >= fb.width() || y >= fb.height() {
            log_warn!(&self.shared.log_sink, "{}: update request origin ({x},{y}) out of bounds", self.name);
            return Ok(());
        }
        let w = w.min(fb.width() - x);
        let h = h.min(fb.height() - y);

        let mut buf = BytesMut::new();
        buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
        buf.put_u8(0);
        buf.put_u16(1);
        Rectangle { x: x as u16, y: y as u16, width: w as u16, height: h as u16 }.write_header(&mut buf);
        buf.put_slice(&rect_bytes(fb, x, y, w, h));

        self.io.write_all(&buf, IO_TIMEOUT_MS).await
    }

    async fn handle_key_event(&mut self) -> Result<()> {
        let mut body = [0u8; 7];
        self.read_exact(&mut body).await?;
        let down = body[0] != 0;
        let code = u32::from_be_bytes([body[3], body[4], body[5], body[6]]);
        self.push_event(Event::Key { down, code });
        Ok(())
    }

    async fn handle_pointer_event(&mut self) -> Result<()> {
        let mut body = [0u8; 5];
        self.read_exact(&mut body).await?;
        let button_mask = body[0];
        let x = u16::from_be_bytes([body[1], body[2]]);
        let y = u16::from_be_bytes([body[3], body[4]]);
        self.push_event(Event::Pointer { button_mask, x, y });
        Ok(())
    }

    async fn handle_cut_text(&mut self) -> Result<()> {
        let mut header = [0u8; 7];
        self.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);
        let mut text_buf = vec![0u8; len as usize];
        self.read_exact(&mut text_buf).await?;
        let text = String::from_utf8_lossy(&text_buf).into_owned();
        self.push_event(Event::CutText { text });
        Ok(())
    }

    async fn send_cut_text(&mut self, text: &str) -> Result<()> {
        let buf = encode_server_cut_text(text);
        self.io.write_all(&buf, IO_TIMEOUT_MS).await
    }

    fn push_event(&self, event: Event) {
        let mut events = self.shared.events.lock().unwrap();
        if events.add_event(event).is_err() {
            log_warn!(&self.shared.log_sink, "{}: event queue full, dropping event", self.name);
        }
    }
}

fn rect_bytes(fb: &Framebuffer, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
    let bpp = fb.bpp() as usize;
    let stride = fb.width() as usize * bpp;
    let pixels = fb.pixels();
    let mut out = Vec::with_capacity(w as usize * h as usize * bpp);
    for row in 0..h {
        let start = (y as usize + row as usize) * stride + x as usize * bpp;
        let end = start + w as usize * bpp;
        out.extend_from_slice(&pixels[start..end]);
    }
    out
}
