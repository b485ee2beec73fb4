use clap::{Parser, Subcommand};
use comfy_table::Table;
use futures_util::{SinkExt, StreamExt};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use spinners::{Spinner, Spinners};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// Default locations of the canvas server.
const WS_BASE_URL: &str = "ws://127.0.0.1:8080";
const API_BASE_URL: &str = "http://127.0.0.1:8080";

/// A CLI for painting on and watching the shared pixel canvas.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Paint images and/or random noise onto the canvas, in shuffled order.
    /// Example: canvas paint --image art.png --offset-x 200 --offset-y 100 --random 1000
    Paint {
        /// Base URL of the server's WebSocket endpoints.
        #[arg(long, default_value = WS_BASE_URL)]
        url: String,
        /// PNG images to paint. Pure black pixels are skipped.
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        /// Horizontal offset applied to every image.
        #[arg(long, default_value_t = 0)]
        offset_x: i32,
        /// Vertical offset applied to every image.
        #[arg(long, default_value_t = 0)]
        offset_y: i32,
        /// Number of random pixels to add.
        #[arg(long, default_value_t = 0)]
        random: usize,
        /// Width of the area random pixels land in.
        #[arg(long, default_value_t = 500)]
        width: i32,
        /// Height of the area random pixels land in.
        #[arg(long, default_value_t = 300)]
        height: i32,
        /// Pause between two pixels, in milliseconds.
        #[arg(long, default_value_t = 5)]
        delay_ms: u64,
    },
    /// Paint a single pixel.
    Pixel {
        #[arg(long, default_value = WS_BASE_URL)]
        url: String,
        x: i32,
        y: i32,
        /// Color as #RRGGBB.
        color: String,
    },
    /// Connect as a viewer and print every message from the server.
    Watch {
        #[arg(long, default_value = WS_BASE_URL)]
        url: String,
    },
    /// Print the current canvas as a table.
    Snapshot {
        #[arg(long, default_value = API_BASE_URL)]
        api: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Pixel {
    x: i32,
    y: i32,
    color: String,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PaintMessage<'a> {
    Update { pixel: &'a Pixel },
}

// Messages the viewer endpoint pushes to us.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ViewerMessage {
    Initial { pixels: Vec<Pixel> },
    Update { pixel: Pixel },
}

fn color_to_hex(r: u8, g: u8, b: u8) -> String {
    format!("#{r:02X}{g:02X}{b:02X}")
}

// Reads an image and turns every non-black pixel into a paint event.
fn load_pixels_from_image(
    path: &Path,
    offset_x: i32,
    offset_y: i32,
) -> Result<Vec<Pixel>, image::ImageError> {
    let img = image::open(path)?.to_rgb8();
    let pixels = img
        .enumerate_pixels()
        .filter_map(|(x, y, rgb)| {
            let [r, g, b] = rgb.0;
            let color = color_to_hex(r, g, b);
            (color != "#000000").then(|| Pixel {
                x: x as i32 + offset_x,
                y: y as i32 + offset_y,
                color,
            })
        })
        .collect();
    Ok(pixels)
}

fn generate_random_pixels(width: i32, height: i32, count: usize) -> Vec<Pixel> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| Pixel {
            x: rng.random_range(0..width.max(1)),
            y: rng.random_range(0..height.max(1)),
            color: color_to_hex(rng.random(), rng.random(), rng.random()),
        })
        .collect()
}

async fn paint(url: &str, pixels: &[Pixel], delay: Duration) -> Result<usize, Box<dyn std::error::Error>> {
    let (socket, _) = connect_async(format!("{}/ws/paint", url.trim_end_matches('/'))).await?;
    let (mut sender, mut receiver) = socket.split();

    // The painter endpoint never writes, but draining keeps control frames flowing.
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = receiver.next().await {} });

    let mut sent = 0;
    for pixel in pixels {
        let message = serde_json::to_string(&PaintMessage::Update { pixel })?;
        if let Err(e) = sender.send(Message::Text(message.into())).await {
            eprintln!("Error: Could not send pixel: {}", e);
            break;
        }
        sent += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    reader.abort();
    Ok(sent)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Paint {
            url,
            images,
            offset_x,
            offset_y,
            random,
            width,
            height,
            delay_ms,
        } => {
            let mut all_pixels = Vec::new();
            for image in &images {
                match load_pixels_from_image(image, offset_x, offset_y) {
                    Ok(pixels) => all_pixels.extend(pixels),
                    Err(e) => eprintln!("Error loading image {}: {}", image.display(), e),
                }
            }
            all_pixels.extend(generate_random_pixels(width, height, random));
            all_pixels.shuffle(&mut rand::rng());

            if all_pixels.is_empty() {
                println!("Nothing to paint.");
                return Ok(());
            }

            let mut sp = Spinner::new(
                Spinners::Dots9,
                format!("Painting {} pixels...", all_pixels.len()),
            );
            match paint(&url, &all_pixels, Duration::from_millis(delay_ms)).await {
                Ok(sent) => sp.stop_with_message(format!("✓ Painted {} pixels.", sent)),
                Err(e) => sp.stop_with_message(format!("✗ Error: {}", e)),
            }
        }
        Commands::Pixel { url, x, y, color } => {
            let pixel = Pixel { x, y, color };
            let sent = paint(&url, std::slice::from_ref(&pixel), Duration::ZERO).await?;
            if sent == 1 {
                println!("✓ Painted ({}, {}) {}", pixel.x, pixel.y, pixel.color);
            }
        }
        Commands::Watch { url } => {
            let (socket, _) = connect_async(format!("{}/ws/view", url.trim_end_matches('/'))).await?;
            let (_sender, mut receiver) = socket.split();
            println!("--- Watching the canvas (Ctrl-C to stop) ---");

            while let Some(message) = receiver.next().await {
                match message? {
                    Message::Text(text) => match serde_json::from_str::<ViewerMessage>(text.as_str()) {
                        Ok(ViewerMessage::Initial { pixels }) => {
                            println!("initial: {} pixels on the canvas", pixels.len());
                        }
                        Ok(ViewerMessage::Update { pixel }) => {
                            println!("update:  ({}, {}) {}", pixel.x, pixel.y, pixel.color);
                        }
                        Err(e) => eprintln!("Unrecognised message ({}): {}", e, text.as_str()),
                    },
                    Message::Close(frame) => {
                        println!("Server closed the stream: {:?}", frame);
                        break;
                    }
                    _ => {}
                }
            }
        }
        Commands::Snapshot { api } => {
            let mut sp = Spinner::new(Spinners::Dots9, "Fetching the canvas...".into());

            let client = reqwest::Client::new();
            let api_url = format!("{}/api/pixels", api.trim_end_matches('/'));
            let response = client.get(&api_url).send().await;

            match response {
                Ok(res) if res.status().is_success() => {
                    let pixels = res.json::<Vec<Pixel>>().await?;
                    sp.stop_with_message(format!("✓ {} pixels on the canvas", pixels.len()));

                    let mut table = Table::new();
                    table.set_header(vec!["X", "Y", "Color"]);
                    for pixel in &pixels {
                        table.add_row(vec![
                            pixel.x.to_string(),
                            pixel.y.to_string(),
                            pixel.color.clone(),
                        ]);
                    }
                    println!("{table}");
                }
                Ok(res) => {
                    sp.stop_with_message(format!(
                        "✗ Error: Failed to fetch the canvas (Status: {})",
                        res.status()
                    ));
                }
                Err(e) => {
                    sp.stop_with_message(format!("✗ Error: Could not connect to the server: {}", e));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_colors_are_upper_case() {
        assert_eq!(color_to_hex(255, 0, 171), "#FF00AB");
        assert_eq!(color_to_hex(0, 0, 0), "#000000");
    }

    #[test]
    fn random_pixels_stay_inside_the_area() {
        let pixels = generate_random_pixels(10, 4, 200);
        assert_eq!(pixels.len(), 200);
        assert!(pixels.iter().all(|p| (0..10).contains(&p.x) && (0..4).contains(&p.y)));
        assert!(pixels.iter().all(|p| p.color.len() == 7 && p.color.starts_with('#')));
    }

    #[test]
    fn paint_messages_use_the_painter_wire_format() {
        let pixel = Pixel {
            x: 5,
            y: 5,
            color: "#FF0000".into(),
        };
        assert_eq!(
            serde_json::to_string(&PaintMessage::Update { pixel: &pixel }).unwrap(),
            r##"{"type":"update","pixel":{"x":5,"y":5,"color":"#FF0000"}}"##
        );
    }

    #[test]
    fn viewer_messages_are_understood() {
        let initial: ViewerMessage = serde_json::from_str(
            r##"{"type":"initial","pixels":[{"x":0,"y":0,"color":"#000000"}]}"##,
        )
        .unwrap();
        assert!(matches!(initial, ViewerMessage::Initial { pixels } if pixels.len() == 1));
    }
}
