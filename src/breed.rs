//! Detect → crop → embed → search → vote, reported as JSON.

use crate::config::{BreedSettings, Settings};
use crate::crop::crop_with_padding;
use crate::detector::{AnimalKind, Detection, Detector};
use crate::error::{PawsightError, Result};
use crate::index::{BreedDatabase, IdMap, SearchHit};
use crate::vision::ImageEmbedder;
use crate::vote::{self, BreedCandidate, VoteRow};
use image::DynamicImage;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const NO_PET_MESSAGE: &str =
    "No pet detected in image. Please upload a clearer photo with the pet visible.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionMetadata {
    pub animal_detected: bool,
    pub detection_confidence: f32,
    pub bounding_box: [i32; 4],
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreedMatch {
    pub success: bool,
    pub breed: String,
    pub breed_raw: String,
    pub confidence: f32,
    pub animal_type: AnimalKind,
    pub top_breeds: Vec<BreedCandidate>,
    pub metadata: DetectionMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes: Option<Vec<VoteRow>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreedFailure {
    pub success: bool,
    pub error: String,
    pub animal_detected: bool,
}

impl BreedFailure {
    fn new(error: String) -> Self {
        Self {
            success: false,
            error,
            animal_detected: false,
        }
    }
}

/// Result of one breed request; never an `Err`, failures are reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BreedReport {
    Success(BreedMatch),
    Failure(BreedFailure),
}

impl BreedReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

/// Build the success report from raw search hits.
///
/// Scores in the report are rounded to three decimals.
#[must_use]
pub fn summarize(
    detection: &Detection,
    animal: AnimalKind,
    hits: &[SearchHit],
    id_map: &IdMap,
    settings: &BreedSettings,
    elapsed: Duration,
) -> BreedMatch {
    let mut top_breeds = vote::rank(hits, id_map, settings.aggregation, settings.top_breeds);
    for candidate in &mut top_breeds {
        candidate.score = round3(candidate.score);
    }
    let (breed, breed_raw, confidence) = top_breeds.first().map_or_else(
        || ("Unknown".to_string(), "Unknown".to_string(), 0.0),
        |best| (best.breed.clone(), best.breed_raw.clone(), best.score),
    );

    BreedMatch {
        success: true,
        breed,
        breed_raw,
        confidence,
        animal_type: animal,
        top_breeds,
        metadata: DetectionMetadata {
            animal_detected: true,
            detection_confidence: round3(detection.confidence),
            bounding_box: detection.bbox.pixels(),
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        },
        votes: None,
    }
}

pub struct BreedDetector {
    pub detector: Detector,
    pub embedder: ImageEmbedder,
    pub settings: BreedSettings,
    databases: HashMap<AnimalKind, BreedDatabase>,
}

impl BreedDetector {
    /// Load the detector and embedder; databases open on first use.
    pub fn new(settings: &Settings) -> Result<Self> {
        let start = Instant::now();
        let detector = Detector::new(settings.detector.clone(), settings.threads)?;
        let embedder = ImageEmbedder::new(&settings.breed.embedder_dir, settings.threads)?;
        info!(elapsed = ?start.elapsed(), "breed models loaded");
        Ok(Self::from_parts(detector, embedder, settings.breed.clone()))
    }

    #[must_use]
    pub fn from_parts(detector: Detector, embedder: ImageEmbedder, settings: BreedSettings) -> Self {
        Self {
            detector,
            embedder,
            settings,
            databases: HashMap::new(),
        }
    }

    /// Open every database present under the data directory.
    pub fn init(&mut self) -> Result<()> {
        for animal in [AnimalKind::Dog, AnimalKind::Cat] {
            if self.settings.data_dir.join(animal.as_str()).is_dir() {
                self.database(animal)?;
            } else {
                warn!(%animal, dir = %self.settings.data_dir.display(), "no breed database");
            }
        }
        Ok(())
    }

    /// The database for `animal`, opened and cached on first call.
    pub fn database(&mut self, animal: AnimalKind) -> Result<&BreedDatabase> {
        cached_database(&mut self.databases, &self.settings.data_dir, animal)
    }

    /// Run the pipeline; `Ok(None)` when no pet is found.
    ///
    /// The detected animal picks the database; `hint` is only compared against it.
    pub fn analyze(
        &mut self,
        image: &DynamicImage,
        hint: Option<AnimalKind>,
        explain: bool,
    ) -> Result<Option<BreedMatch>> {
        let start = Instant::now();
        let Some(detection) = self.detector.best(image)? else {
            return Ok(None);
        };
        let animal = detection.animal().unwrap_or(AnimalKind::Dog);
        if let Some(hint) = hint.filter(|&h| h != animal) {
            info!(%hint, detected = %animal, "requested type differs from detection");
        }
        debug!(bbox = ?detection.bbox, conf = detection.confidence, %animal, "subject");

        let crop = crop_with_padding(image, Some(&detection.bbox), self.settings.crop_pad);
        let embedding = self.embedder.embed_image(&crop)?;
        let db = cached_database(&mut self.databases, &self.settings.data_dir, animal)?;
        if db.index.dim() != embedding.len() {
            return Err(PawsightError::Index(format!(
                "Index for {animal} has dimension {}, embedder produces {}",
                db.index.dim(),
                embedding.len()
            )));
        }
        let hits = db.index.search(embedding.view(), self.settings.search_k)?;
        let mut report = summarize(&detection, animal, &hits, &db.id_map, &self.settings, start.elapsed());
        if explain {
            report.votes = Some(vote::vote_table(&hits, &db.id_map, self.settings.aggregation));
        }
        info!(
            breed = %report.breed,
            confidence = report.confidence,
            ms = report.metadata.processing_time_ms,
            "breed detected"
        );
        Ok(Some(report))
    }

    /// [`Self::analyze`] folded into a report.
    pub fn detect_breed(
        &mut self,
        image: &DynamicImage,
        hint: Option<AnimalKind>,
        explain: bool,
    ) -> BreedReport {
        match self.analyze(image, hint, explain) {
            Ok(Some(report)) => BreedReport::Success(report),
            Ok(None) => BreedReport::Failure(BreedFailure::new(NO_PET_MESSAGE.to_string())),
            Err(e) => {
                warn!(error = %e, "breed detection failed");
                BreedReport::Failure(BreedFailure::new(format!("Processing error: {e}")))
            }
        }
    }
}

fn cached_database<'a>(
    databases: &'a mut HashMap<AnimalKind, BreedDatabase>,
    data_dir: &Path,
    animal: AnimalKind,
) -> Result<&'a BreedDatabase> {
    match databases.entry(animal) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let db = BreedDatabase::open(&data_dir.join(animal.as_str()))?;
            Ok(entry.insert(db))
        }
    }
}

/// Failure report for errors raised before the pipeline runs, e.g. unreadable input.
#[must_use]
pub fn processing_error(error: &impl std::fmt::Display) -> BreedReport {
    BreedReport::Failure(BreedFailure::new(format!("Processing error: {error}")))
}
