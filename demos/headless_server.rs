//! Headless RFB server example with animated content.
//!
//! Continuously paints the framebuffer with an animated gradient, with no
//! screen capture or GUI involved.
//!
//! Usage:
//!   cargo run --example headless_server

use std::error::Error;
use std::time::Duration;
use tinyrfb::Server;
use tokio::time;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless RFB server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");

    const WIDTH: u32 = 640;
    const HEIGHT: u32 = 480;

    let server = Server::new(WIDTH, HEIGHT, 4)?;
    server.bind(("0.0.0.0", 5900)).await?;
    server.start().await?;

    println!("Server started, generating animated content...");
    println!("Press Ctrl+C to stop");

    let mut frame: u32 = 0;
    loop {
        {
            let mut fb = server.lock_fb(true);
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    let r = (x + frame) % 256;
                    let g = (y + frame) % 256;
                    let b = (frame / 2) % 256;
                    fb.set_pixel(x, y, (r << 16) | (g << 8) | b);
                }
            }
        }

        while let Some(event) = server.poll_event() {
            println!("event: {event:?}");
        }

        frame = frame.wrapping_add(1);
        time::sleep(Duration::from_millis(33)).await;

        if frame % 300 == 0 {
            println!("frame {frame}, clients have consumed {} frames", server.updated());
        }
    }
}
