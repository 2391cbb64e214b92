//! Headless VNC server example with animated content.
//!
//! Runs a server whose framebuffer is repainted by a small animation
//! loop, demonstrating embedding without any screen capture.
//!
//! Usage:
//!   cargo run --example headless_server

use rfbserver::{PixelFormat, ServerEvent, VncServer};
use std::error::Error;
use std::time::Duration;
use tokio::time;

const WIDTH: u16 = 640;
const HEIGHT: u16 = 480;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless VNC server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");

    let server = VncServer::new(WIDTH, HEIGHT);
    server.set_desktop_name("rfbserver demo").await;

    let listener = server.clone();
    tokio::spawn(async move {
        if let Err(e) = listener.listen(5900).await {
            eprintln!("Server error: {}", e);
        }
    });

    // Print input events as they arrive.
    let mut events = server.events().await.expect("events taken once");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::ClientConnected { id, address } => {
                    println!("client {} connected from {}", id, address);
                }
                ServerEvent::ClientDisconnected { id } => {
                    println!("client {} disconnected", id);
                }
                ServerEvent::KeyEvent { client_id, key, pressed } => {
                    println!("client {}: key {:#x} {}", client_id, key, if pressed { "down" } else { "up" });
                }
                _ => {}
            }
        }
    });

    println!("Server started, generating animated content...");
    println!("Press Ctrl+C to stop");

    let format = PixelFormat::rgb32();
    let mut frame = 0u32;
    let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];

    loop {
        for y in 0..u32::from(HEIGHT) {
            for x in 0..u32::from(WIDTH) {
                let offset = ((y * u32::from(WIDTH) + x) * 4) as usize;
                let r = ((x + frame) % 256) as u8;
                let g = ((y + frame) % 256) as u8;
                let b = ((frame / 2) % 256) as u8;
                let word = format.rgb_to_pixel(r, g, b);
                pixels[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
            }
        }

        server.update_framebuffer(&pixels, 0, 0, WIDTH, HEIGHT).await;
        frame = frame.wrapping_add(1);

        // ~30 FPS
        time::sleep(Duration::from_millis(33)).await;

        if frame % 300 == 0 {
            println!("Frame: {}", frame);
        }
    }
}
