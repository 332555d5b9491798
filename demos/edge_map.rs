//! Write the square try-on input and its Canny edge map for an image.
//!
//! ```text
//! cargo run --example edge_map -- photo.jpg out/
//! ```

use anyhow::{Context, Result};
use pawsight::config::TryOnSettings;
use pawsight::source::load_image;
use pawsight::tryon::prepare_control;
use std::path::PathBuf;
use std::time::Instant;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let source = args.next().context("usage: edge_map <image|url> [out_dir]")?;
    let out = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));

    let image = load_image(&source)?;
    let settings = TryOnSettings::default();
    let start = Instant::now();
    let (square, edges) = prepare_control(&image, None, &settings);
    println!("edge map in {:?}", start.elapsed());

    std::fs::create_dir_all(&out)?;
    square.save(out.join("input.png"))?;
    edges.save(out.join("edges.png"))?;
    println!("wrote {} and {}", out.join("input.png").display(), out.join("edges.png").display());
    Ok(())
}
