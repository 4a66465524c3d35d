//! Simple RFB server example with a static test pattern.
//!
//! Usage:
//!   cargo run --example simple_server
//!
//! Then connect with a VNC viewer to localhost:5900. No password: this
//! server only implements the "None" security type.

use std::error::Error;
use tinyrfb::Server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting RFB server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");

    const WIDTH: u32 = 800;
    const HEIGHT: u32 = 600;

    let server = Server::new(WIDTH, HEIGHT, 4)?;

    {
        let mut fb = server.lock_fb(true);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let r = x * 255 / WIDTH;
                let g = y * 255 / HEIGHT;
                let b = 128;
                fb.set_pixel(x, y, (r << 16) | (g << 8) | b);
            }
        }
    }

    println!("Framebuffer painted with test pattern");

    server.bind(("0.0.0.0", 5900)).await?;
    server.start().await?;

    println!("Server ready for connections, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    server.stop().await?;

    Ok(())
}
