//! Product try-on: subject detection, edge conditioning and generation.

use crate::config::{Settings, TryOnSettings};
use crate::crop::{crop_with_ratio, fit_to_square};
use crate::detector::{select_subject, AnimalKind, BoundingBox, Detection, Detector, SUBJECT_CLASSES};
use crate::diffusion::{ControlNetPipeline, GenerationParams};
use crate::edges::edge_map;
use crate::error::{PawsightError, Result};
use crate::prompt::{Catalog, Prompts, ScenePrompt, Style};
use image::{DynamicImage, RgbImage};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the pet should be shown with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductRef {
    /// A `product_id` from the catalog.
    Catalog(String),
    /// A free-form product description, prompted with [`ScenePrompt`].
    Described(String),
}

impl ProductRef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Catalog(id) | Self::Described(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryOnRequest {
    pub product: ProductRef,
    pub style: Style,
    /// Skips detection of the animal type when set.
    pub animal: Option<AnimalKind>,
}

pub struct TryOnResult {
    pub images: Vec<RgbImage>,
    pub control: RgbImage,
    pub animal_type: AnimalKind,
    pub product_id: String,
    pub style: Style,
    pub prompts: Prompts,
    pub processing_time_ms: u64,
}

/// Animal type and subject box read from a single detector pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubjectScan {
    pub animal: Option<AnimalKind>,
    pub subject: Option<BoundingBox>,
}

/// Split best-first `detections` into the top animal among `animal_classes`
/// and the subject chosen among people and pets.
#[must_use]
pub fn split_detections(detections: &[Detection], animal_classes: &[usize]) -> SubjectScan {
    let animal = detections
        .iter()
        .find(|d| animal_classes.contains(&d.class_id))
        .and_then(Detection::animal);
    let candidates: Vec<Detection> = detections
        .iter()
        .filter(|d| SUBJECT_CLASSES.contains(&d.class_id))
        .copied()
        .collect();
    SubjectScan {
        animal,
        subject: select_subject(&candidates).map(|d| d.bbox),
    }
}

/// Square input image and its edge map.
#[must_use]
pub fn prepare_control(
    image: &DynamicImage,
    subject: Option<&BoundingBox>,
    settings: &TryOnSettings,
) -> (RgbImage, RgbImage) {
    let source = subject
        .filter(|_| settings.crop_subject)
        .and_then(|bbox| crop_with_ratio(image, bbox, settings.subject_pad_ratio));
    let square = fit_to_square(source.as_ref().unwrap_or(image), settings.size);
    let edges = edge_map(&square, settings.canny_low, settings.canny_high);
    (square, edges)
}

pub struct TryOnPipeline {
    pub detector: Detector,
    pub catalog: Catalog,
    pub diffusion: ControlNetPipeline,
    pub settings: TryOnSettings,
}

impl TryOnPipeline {
    pub fn new(settings: &Settings) -> Result<Self> {
        let start = Instant::now();
        let detector = Detector::new(settings.detector.clone(), settings.threads)?;
        let catalog = Catalog::from_file(&settings.tryon.catalog)?;
        let diffusion = ControlNetPipeline::new(&settings.tryon.diffusion_dir, settings.threads)?;
        info!(
            products = catalog.products.len(),
            elapsed = ?start.elapsed(),
            "try-on pipeline loaded"
        );
        Ok(Self {
            detector,
            catalog,
            diffusion,
            settings: settings.tryon.clone(),
        })
    }

    #[must_use]
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            steps: self.settings.steps,
            guidance_scale: self.settings.guidance_scale,
            controlnet_scale: self.settings.controlnet_scale,
            seed: self.settings.seed,
            samples: self.settings.samples,
            width: self.settings.size,
            height: self.settings.size,
        }
    }

    /// Prompts for `request` once the animal is known.
    pub fn prompts(&self, request: &TryOnRequest, animal: AnimalKind) -> Result<Prompts> {
        match &request.product {
            ProductRef::Catalog(id) => self.catalog.build_prompt(id, request.style, animal),
            ProductRef::Described(text) => Ok(ScenePrompt::for_product(animal, text).build()),
        }
    }

    /// One detector pass covering the animal classes and, when cropping, the subject classes.
    fn scan(&mut self, image: &DynamicImage) -> Result<SubjectScan> {
        let animal_classes = self.detector.settings.classes.clone();
        let mut classes = animal_classes.clone();
        if self.settings.crop_subject {
            classes.extend(SUBJECT_CLASSES.iter().filter(|c| !animal_classes.contains(c)));
        }
        let conf = self.detector.settings.conf;
        let detections = self.detector.detect_with(image, &classes, conf)?;
        debug!(found = detections.len(), "subject scan");
        Ok(split_detections(&detections, &animal_classes))
    }

    pub fn generate(
        &mut self,
        image: &DynamicImage,
        request: &TryOnRequest,
        progress: &mut dyn FnMut(f32),
    ) -> Result<TryOnResult> {
        let start = Instant::now();
        let compatible = match &request.product {
            ProductRef::Catalog(id) => self
                .catalog
                .product(id)
                .ok_or_else(|| PawsightError::UnknownProduct(id.clone()))?
                .compatible_animals
                .clone(),
            ProductRef::Described(_) => Vec::new(),
        };

        let scan = if request.animal.is_none() || self.settings.crop_subject {
            self.scan(image)?
        } else {
            SubjectScan::default()
        };
        let animal = match request.animal {
            Some(animal) => animal,
            None => scan.animal.ok_or(PawsightError::NoAnimal)?,
        };
        if !compatible.is_empty() && !compatible.contains(&animal) {
            warn!(product = request.product.id(), %animal, "product not listed for this animal");
        }

        let subject = scan.subject.filter(|_| self.settings.crop_subject);
        let (_, control) = prepare_control(image, subject.as_ref(), &self.settings);
        let prompts = self.prompts(request, animal)?;
        debug!(positive = %prompts.positive, negative = %prompts.negative, "prompts");

        let params = self.params();
        let images = self.diffusion.generate(&prompts, &control, &params, progress)?;
        let processing_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            product = request.product.id(),
            style = %request.style,
            %animal,
            ms = processing_time_ms,
            "try-on generated"
        );

        Ok(TryOnResult {
            images,
            control,
            animal_type: animal,
            product_id: request.product.id().to_string(),
            style: request.style,
            prompts,
            processing_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn dog_on_grass() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(200, 100, |x, y| {
            if (60..140).contains(&x) && (20..80).contains(&y) {
                Rgb([20, 20, 20])
            } else {
                Rgb([240, 240, 240])
            }
        }))
    }

    fn settings(crop_subject: bool) -> TryOnSettings {
        TryOnSettings {
            size: 64,
            crop_subject,
            ..TryOnSettings::default()
        }
    }

    #[test]
    fn control_is_square_with_edges() {
        let (square, edges) = prepare_control(&dog_on_grass(), None, &settings(false));
        assert_eq!(square.dimensions(), (64, 64));
        assert_eq!(edges.dimensions(), (64, 64));
        assert!(edges.pixels().any(|p| p.0 == [255, 255, 255]));
        assert!(edges.pixels().all(|p| p.0 == [0, 0, 0] || p.0 == [255, 255, 255]));
        // letterboxed wide image keeps a white band at the top
        assert_eq!(square.get_pixel(32, 0).0, [255, 255, 255]);
    }

    fn det(bbox: BoundingBox, confidence: f32, class_id: usize) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id,
        }
    }

    #[test]
    fn one_pass_yields_animal_and_subject() {
        use crate::detector::{COCO_CAT, COCO_DOG, COCO_PERSON};
        // best first, as the detector returns them
        let detections = [
            det(BoundingBox::new(0.0, 0.0, 300.0, 300.0), 0.95, COCO_PERSON),
            det(BoundingBox::new(10.0, 10.0, 60.0, 60.0), 0.9, COCO_CAT),
            det(BoundingBox::new(100.0, 100.0, 250.0, 250.0), 0.5, COCO_DOG),
        ];
        let scan = split_detections(&detections, &[COCO_CAT, COCO_DOG]);
        assert_eq!(scan.animal, Some(AnimalKind::Cat));
        // the person is larger but pets win, then the largest pet
        assert_eq!(scan.subject, Some(BoundingBox::new(100.0, 100.0, 250.0, 250.0)));

        let people_only = split_detections(&detections[..1], &[COCO_CAT, COCO_DOG]);
        assert_eq!(people_only.animal, None);
        assert_eq!(people_only.subject, Some(BoundingBox::new(0.0, 0.0, 300.0, 300.0)));
    }

    #[test]
    fn subject_box_only_used_when_cropping() {
        let bbox = BoundingBox::new(60.0, 20.0, 140.0, 80.0);
        let (uncropped, _) = prepare_control(&dog_on_grass(), Some(&bbox), &settings(false));
        let (cropped, _) = prepare_control(&dog_on_grass(), Some(&bbox), &settings(true));
        let dark = |img: &RgbImage| img.pixels().filter(|p| p.0[0] < 128).count();
        assert!(dark(&cropped) > dark(&uncropped));
    }
}
