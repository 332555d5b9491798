//! Build a breed database from a `<dataset>/<breed>/<image>` tree.

use crate::crop::crop_with_padding;
use crate::detector::Detector;
use crate::error::{PawsightError, Result};
use crate::index::{BreedDatabase, FlatIndex, IdEntry, IdMap, Metric};
use crate::vision::ImageEmbedder;
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub breed: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub batch_size: usize,
    pub crop_pad: u32,
    /// Where detected crops are written; recorded as `crop_path` in the id map.
    pub crops_dir: Option<PathBuf>,
    pub show_progress: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            crop_pad: 2,
            crops_dir: None,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub indexed: usize,
    pub unreadable: usize,
    pub undetected: usize,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// Every image below `dataset`, labeled by its top-level directory, sorted by path.
pub fn collect_images(dataset: &Path) -> Result<Vec<LabeledImage>> {
    if !dataset.is_dir() {
        return Err(PawsightError::NotFound(dataset.to_owned()));
    }
    let mut images: Vec<LabeledImage> = WalkDir::new(dataset)
        .min_depth(2)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(dataset).ok()?;
            let breed = relative.components().next()?.as_os_str().to_str()?.to_string();
            Some(LabeledImage {
                breed,
                path: entry.path().to_path_buf(),
            })
        })
        .collect();
    images.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(images)
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>7}/{len:7} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("##>-"));
    }
    pb
}

/// Embed `images` into an inner-product index with a matching id map.
///
/// With a detector, each image is cropped to its best pet box first; images
/// without a detection are embedded whole. Unreadable files are skipped.
pub fn build_database(
    embedder: &mut ImageEmbedder,
    mut detector: Option<&mut Detector>,
    images: &[LabeledImage],
    options: &BuildOptions,
) -> Result<(BreedDatabase, BuildStats)> {
    let start = Instant::now();
    let mut index = FlatIndex::new(embedder.dim(), Metric::InnerProduct);
    let mut entries = Vec::with_capacity(images.len());
    let mut stats = BuildStats::default();
    let pb = progress_bar(images.len(), options.show_progress);

    for chunk in images.chunks(options.batch_size.max(1)) {
        let decoded: Vec<(&LabeledImage, Option<DynamicImage>)> = chunk
            .par_iter()
            .map(|item| match image::open(&item.path) {
                Ok(img) => (item, Some(img)),
                Err(e) => {
                    warn!(path = %item.path.display(), error = %e, "skipping unreadable image");
                    (item, None)
                }
            })
            .collect();

        let mut batch = Vec::with_capacity(decoded.len());
        for (item, img) in decoded {
            pb.inc(1);
            let Some(img) = img else {
                stats.unreadable += 1;
                continue;
            };
            let crop = match detector.as_deref_mut() {
                Some(det) => match det.best(&img)? {
                    Some(found) => crop_with_padding(&img, Some(&found.bbox), options.crop_pad),
                    None => {
                        debug!(path = %item.path.display(), "no pet detected, using whole image");
                        stats.undetected += 1;
                        img
                    }
                },
                None => img,
            };
            let crop_path = match &options.crops_dir {
                Some(dir) => Some(save_crop(dir, entries.len(), item, &crop)?),
                None => None,
            };
            entries.push(IdEntry {
                breed: item.breed.clone(),
                crop_path,
                src_path: Some(item.path.display().to_string()),
            });
            batch.push(crop);
        }

        if !batch.is_empty() {
            let embeddings = embedder.embed_images(&batch)?;
            index.add(embeddings.view())?;
        }
    }
    pb.finish_with_message("done");

    stats.indexed = index.len();
    info!(
        indexed = stats.indexed,
        unreadable = stats.unreadable,
        undetected = stats.undetected,
        elapsed = ?start.elapsed(),
        "breed database built"
    );
    Ok((
        BreedDatabase {
            index,
            id_map: IdMap::List(entries),
        },
        stats,
    ))
}

/// Crops are named after their id map position so same-stem sources stay apart.
fn save_crop(dir: &Path, position: usize, item: &LabeledImage, crop: &DynamicImage) -> Result<String> {
    let breed_dir = dir.join(&item.breed);
    fs::create_dir_all(&breed_dir)?;
    let stem = item
        .path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("crop");
    let path = breed_dir.join(format!("{position:06}_{stem}.jpg"));
    crop.to_rgb8().save(&path)?;
    Ok(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn collects_images_labeled_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (breed, file) in [
            ("n02085620-Chihuahua", "a.jpg"),
            ("n02085620-Chihuahua", "b.PNG"),
            ("siamese", "nested/c.jpeg"),
            ("siamese", "notes.txt"),
        ] {
            let path = root.join(breed).join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"x").unwrap();
        }
        fs::write(root.join("stray.jpg"), b"x").unwrap();

        let images = collect_images(root).unwrap();
        let labels: Vec<&str> = images.iter().map(|i| i.breed.as_str()).collect();
        assert_eq!(labels, vec!["n02085620-Chihuahua", "n02085620-Chihuahua", "siamese"]);
        assert!(images[2].path.ends_with("nested/c.jpeg"));
    }

    #[test]
    fn missing_dataset_is_not_found() {
        assert!(matches!(
            collect_images(Path::new("/no/such/dataset")),
            Err(PawsightError::NotFound(_))
        ));
    }

    #[test]
    fn saves_crops_under_breed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let item = LabeledImage {
            breed: "pug".to_string(),
            path: PathBuf::from("/data/pug/p1.png"),
        };
        let crop = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])));
        let saved = save_crop(dir.path(), 3, &item, &crop).unwrap();
        assert!(saved.ends_with("000003_p1.jpg"));
        assert!(dir.path().join("pug/000003_p1.jpg").is_file());
    }

    #[test]
    fn same_stem_crops_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let crop = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])));
        let first = LabeledImage {
            breed: "siamese".to_string(),
            path: PathBuf::from("/data/siamese/a/c.jpeg"),
        };
        let second = LabeledImage {
            breed: "siamese".to_string(),
            path: PathBuf::from("/data/siamese/c.png"),
        };
        let a = save_crop(dir.path(), 0, &first, &crop).unwrap();
        let b = save_crop(dir.path(), 1, &second, &crop).unwrap();
        assert_ne!(a, b);
        assert!(Path::new(&a).is_file());
        assert!(Path::new(&b).is_file());
    }
}
