use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pawsight::breed::{processing_error, BreedDetector, BreedReport};
use pawsight::builder::{build_database, collect_images, BuildOptions};
use pawsight::config::Settings;
use pawsight::detector::{AnimalKind, BoundingBox, Detector};
use pawsight::prompt::{Catalog, Style};
use pawsight::source::{annotate, load_image};
use pawsight::tryon::{ProductRef, TryOnPipeline, TryOnRequest};
use pawsight::vision::ImageEmbedder;
use pawsight::vote::Aggregation;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pawsight", version, about = "Pet breed identification and product try-on")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true, env = "PAWSIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// ONNX intra-op threads, 0 for one per core
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify the breed of the pet in an image
    Detect {
        /// Image path or http(s) URL
        #[arg(long)]
        image: Option<String>,
        /// Expected animal type; the detected type still picks the database
        #[arg(long = "type", value_enum)]
        animal: Option<AnimalKind>,
        /// Load the models and exit
        #[arg(long)]
        init_only: bool,
        /// Include the per-neighbor vote table
        #[arg(long)]
        explain: bool,
        /// Write the image with the detection box drawn on it
        #[arg(long)]
        annotate: Option<PathBuf>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long, value_enum)]
        aggregation: Option<Aggregation>,
    },
    /// Render the pet with a catalog product
    TryOn {
        #[arg(long)]
        image: String,
        /// Catalog product id
        #[arg(long, required_unless_present = "describe", conflicts_with = "describe")]
        product: Option<String>,
        /// Free-form product description instead of a catalog id
        #[arg(long)]
        describe: Option<String>,
        /// Style id (chibi, anime, cartoon); unknown ids fall back to chibi
        #[arg(long, default_value = "chibi", value_parser = parse_style)]
        style: Style,
        #[arg(long = "type", value_enum)]
        animal: Option<AnimalKind>,
        /// Output directory for generated images
        #[arg(long, default_value = "tryon_out")]
        out: PathBuf,
        #[arg(long)]
        steps: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        samples: Option<usize>,
        #[arg(long)]
        guidance: Option<f32>,
    },
    /// List catalog products
    Products {
        #[arg(long = "type", value_enum)]
        animal: Option<AnimalKind>,
    },
    /// Embed a `<dataset>/<breed>/*` tree into an index and id map
    BuildIndex {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
        /// Embed whole images instead of detected crops
        #[arg(long)]
        no_detect: bool,
        /// Save detected crops here and record their paths
        #[arg(long)]
        crops: Option<PathBuf>,
    },
    /// Download embedder files from the Hugging Face Hub
    #[cfg(feature = "hf-hub")]
    FetchModel {
        /// Repository id, e.g. `user/clip-vit-b-16-onnx`
        #[arg(long)]
        repo: String,
    },
    /// Serve the demo web UI
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
}

fn parse_style(id: &str) -> std::result::Result<Style, std::convert::Infallible> {
    Ok(Style::from_id_or_default(id))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn detect(
    settings: &Settings,
    image: Option<&str>,
    animal: Option<AnimalKind>,
    init_only: bool,
    explain: bool,
    annotate_to: Option<&Path>,
) -> Result<()> {
    let mut detector = BreedDetector::new(settings).context("loading breed models")?;
    if init_only {
        detector.init()?;
        return print_json(&json!({ "success": true, "message": "Models initialized" }));
    }
    let Some(source) = image else {
        return print_json(&json!({ "success": false, "error": "--image argument required" }));
    };

    let image = match load_image(source) {
        Ok(image) => image,
        Err(e) => return print_json(&processing_error(&e)),
    };
    let report = detector.detect_breed(&image, animal, explain);

    if let (Some(path), BreedReport::Success(found)) = (annotate_to, &report) {
        #[allow(clippy::cast_precision_loss)]
        let [x1, y1, x2, y2] = found.metadata.bounding_box.map(|v| v as f32);
        annotate(&image, &BoundingBox::new(x1, y1, x2, y2), 3)
            .save(path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "annotated image written");
    }
    print_json(&report)
}

fn try_on(settings: &Settings, image: &str, request: &TryOnRequest, out: &Path) -> Result<()> {
    let mut pipeline = TryOnPipeline::new(settings).context("loading try-on models")?;
    let image = load_image(image)?;

    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}%") {
        pb.set_style(style.progress_chars("##>-"));
    }
    let result = pipeline.generate(&image, request, &mut |p| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = (p * 100.0).round() as u64;
        pb.set_position(percent);
    })?;
    pb.finish_and_clear();

    std::fs::create_dir_all(out)?;
    let edges_path = out.join("edges.png");
    result.control.save(&edges_path)?;
    let mut paths = Vec::with_capacity(result.images.len());
    for (i, generated) in result.images.iter().enumerate() {
        let path = out.join(format!("tryon_{}_{}_{i}.png", result.product_id, result.style));
        generated.save(&path)?;
        paths.push(path.display().to_string());
    }

    print_json(&json!({
        "success": true,
        "animal_type": result.animal_type,
        "product_id": result.product_id,
        "style": result.style,
        "style_name": result.style.display_name(),
        "prompt": result.prompts.positive,
        "negative_prompt": result.prompts.negative,
        "images": paths,
        "edge_map": edges_path.display().to_string(),
        "processing_time_ms": result.processing_time_ms,
    }))
}

fn build_index(
    settings: &Settings,
    dataset: &Path,
    out: &Path,
    options: &BuildOptions,
    detect: bool,
) -> Result<()> {
    let images = collect_images(dataset)?;
    anyhow::ensure!(!images.is_empty(), "no images found under {}", dataset.display());
    info!(images = images.len(), dataset = %dataset.display(), "building index");

    let mut embedder = ImageEmbedder::new(&settings.breed.embedder_dir, settings.threads)?;
    let mut detector = if detect {
        Some(Detector::new(settings.detector.clone(), settings.threads)?)
    } else {
        None
    };
    let (database, stats) = build_database(&mut embedder, detector.as_mut(), &images, options)?;
    database
        .save(out)
        .with_context(|| format!("saving database to {}", out.display()))?;

    let mut breeds: Vec<&str> = images.iter().map(|i| i.breed.as_str()).collect();
    breeds.dedup();
    print_json(&json!({
        "success": true,
        "out": out.display().to_string(),
        "indexed": stats.indexed,
        "unreadable": stats.unreadable,
        "undetected": stats.undetected,
        "breeds": breeds.len(),
    }))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())
        .with_context(|| format!("reading settings from {:?}", cli.config))?;
    if let Some(threads) = cli.threads {
        settings.threads = threads;
    }

    match cli.command {
        Command::Detect {
            image,
            animal,
            init_only,
            explain,
            annotate,
            top_k,
            aggregation,
        } => {
            if let Some(top_k) = top_k {
                settings.breed.top_breeds = top_k;
            }
            if let Some(aggregation) = aggregation {
                settings.breed.aggregation = aggregation;
            }
            detect(&settings, image.as_deref(), animal, init_only, explain, annotate.as_deref())
        }
        Command::TryOn {
            image,
            product,
            describe,
            style,
            animal,
            out,
            steps,
            seed,
            samples,
            guidance,
        } => {
            let tryon = &mut settings.tryon;
            tryon.steps = steps.unwrap_or(tryon.steps);
            tryon.seed = seed.unwrap_or(tryon.seed);
            tryon.samples = samples.unwrap_or(tryon.samples);
            tryon.guidance_scale = guidance.unwrap_or(tryon.guidance_scale);
            let product = match (product, describe) {
                (Some(id), _) => ProductRef::Catalog(id),
                (None, Some(text)) => ProductRef::Described(text),
                (None, None) => anyhow::bail!("either --product or --describe is required"),
            };
            let request = TryOnRequest {
                product,
                style,
                animal,
            };
            try_on(&settings, &image, &request, &out)
        }
        Command::Products { animal } => {
            let catalog = Catalog::from_file(&settings.tryon.catalog)?;
            print_json(&catalog.products_for(animal))
        }
        Command::BuildIndex {
            dataset,
            out,
            batch_size,
            no_detect,
            crops,
        } => {
            let options = BuildOptions {
                batch_size,
                crop_pad: settings.breed.crop_pad,
                crops_dir: crops,
                show_progress: true,
            };
            build_index(&settings, &dataset, &out, &options, !no_detect)
        }
        #[cfg(feature = "hf-hub")]
        Command::FetchModel { repo } => {
            let dir = pawsight::model_manager::get_hf_model(&repo)?;
            print_json(&json!({ "success": true, "model_dir": dir.display().to_string() }))
        }
        Command::Serve { bind } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(pawsight::server::serve(settings, bind))?;
            Ok(())
        }
    }
}
