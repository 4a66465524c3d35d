// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # tinyrfb
//!
//! A minimal Rust implementation of an RFB (VNC) server, built to be
//! embedded inside an application that already owns a pixel source (a
//! camera, a software renderer) and wants to publish it to VNC viewers.
//!
//! Only what a viewer actually needs to see a live framebuffer and send
//! input back is implemented: no authentication beyond the RFB "None"
//! security type, and no encoding beyond Raw. If you need Tight, ZRLE,
//! VNC authentication, or TLS, this is not that server.
//!
//! ## Quick start
//!
//! ```no_run
//! use tinyrfb::{Event, Server};
//!
//! #[tokio::main]
//! async fn main() -> tinyrfb::Result<()> {
//!     let server = Server::new(640, 480, 4)?;
//!     server.bind("0.0.0.0:5900").await?;
//!     server.start().await?;
//!
//!     {
//!         let mut fb = server.lock_fb(true);
//!         for y in 0..fb.height() {
//!             for x in 0..fb.width() {
//!                 fb.set_pixel(x, y, 0x00_20_40_80);
//!             }
//!         }
//!     }
//!
//!     while let Some(event) = server.poll_event() {
//!         if let Event::Key { down: true, code } = event {
//!             println!("key pressed: {code:#x}");
//!         }
//!     }
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────┐
//! │      Your application       │
//! │  paints the framebuffer,    │
//! │  drains events              │
//! └──────────────┬──────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────┐
//! │            Server           │
//! │  accept loop, event queue,  │
//! │  framebuffer lock           │
//! └──────────────┬──────────────┘
//!        ┌────────┼────────┐
//!        ▼        ▼        ▼
//!   connection connection connection
//!    worker     worker     worker
//!   (handshake, dispatch, pixel conversion per client)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod events;
pub mod framebuffer;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod server;

mod connection;

pub use error::{Result, VncError};
pub use events::{Event, EventQueue};
pub use framebuffer::Framebuffer;
pub use io::{BufferedIo, IoOutcome};
pub use protocol::PixelFormat;
pub use server::{FbGuard, Server};

/// RFB protocol version line this server offers during the handshake.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Default RFB/VNC port.
pub const DEFAULT_PORT: u16 = 5900;
