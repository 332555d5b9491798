#[cfg(test)]
mod tests {
    use anyhow::Result;
    use ndarray::{Array1, Array2};
    use pawsight::breed::{summarize, BreedReport};
    use pawsight::config::{BreedSettings, Settings};
    use pawsight::detector::{AnimalKind, BoundingBox, Detection, COCO_DOG};
    use pawsight::index::{BreedDatabase, FlatIndex, IdEntry, IdMap, Metric};
    use pawsight::vote::{self, Aggregation};
    use std::path::Path;
    use std::time::Duration;

    const BREEDS: &[&str] = &["n02085620-Chihuahua", "n02086240-Shih-Tzu", "n02110185-Siberian_husky"];

    fn unit(v: &[f32]) -> Array1<f32> {
        let a = Array1::from(v.to_vec());
        let norm = a.dot(&a).sqrt();
        a / norm
    }

    /// Three breeds, four references each, clustered around orthogonal axes.
    fn synthetic_database() -> Result<BreedDatabase> {
        let mut rows = Vec::new();
        let mut entries = Vec::new();
        for (b, breed) in BREEDS.iter().enumerate() {
            for j in 0..4 {
                let mut v = [0.05_f32; 3];
                v[b] = 1.0;
                #[allow(clippy::cast_precision_loss)]
                let jitter = j as f32 * 0.1;
                v[(b + 1) % 3] += jitter;
                rows.extend(unit(&v).to_vec());
                entries.push(IdEntry {
                    breed: (*breed).to_string(),
                    crop_path: Some(format!("crops/{breed}/{j}.jpg")),
                    src_path: Some(format!("images/{breed}/{j}.jpg")),
                });
            }
        }
        let mut index = FlatIndex::new(3, Metric::InnerProduct);
        index.add(Array2::from_shape_vec((rows.len() / 3, 3), rows)?.view())?;
        Ok(BreedDatabase {
            index,
            id_map: IdMap::List(entries),
        })
    }

    fn dog_detection() -> Detection {
        Detection {
            bbox: BoundingBox::new(12.0, 30.0, 300.0, 280.0),
            confidence: 0.87,
            class_id: COCO_DOG,
        }
    }

    #[test]
    fn database_round_trips_through_disk() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let settings = Settings {
            breed: BreedSettings {
                data_dir: tmp.path().to_path_buf(),
                ..BreedSettings::default()
            },
            ..Settings::default()
        };
        let dir = settings.database_dir(AnimalKind::Dog.as_str());
        synthetic_database()?.save(&dir)?;
        assert!(dir.join("faiss_IndexFlatIP.faiss").is_file());
        assert!(dir.join("id_map.json").is_file());

        let db = BreedDatabase::open(&dir)?;
        assert_eq!(db.index.len(), 12);
        assert_eq!(db.index.dim(), 3);
        assert_eq!(db.id_map.len(), 12);
        assert_eq!(db.id_map.breed(5), BREEDS[1]);
        Ok(())
    }

    #[test]
    fn nearest_breed_wins_the_vote() -> Result<()> {
        let db = synthetic_database()?;
        let query = unit(&[0.1, 0.2, 1.0]);
        let hits = db.index.search(query.view(), 50)?;
        assert_eq!(hits.len(), 12);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        let ranked = vote::rank(&hits, &db.id_map, Aggregation::Max, 5);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].breed, "Siberian_husky");
        assert_eq!(ranked[0].rank, 1);

        let report = summarize(
            &dog_detection(),
            AnimalKind::Dog,
            &hits,
            &db.id_map,
            &BreedSettings::default(),
            Duration::from_millis(120),
        );
        assert_eq!(report.breed_raw, "n02110185-Siberian_husky");
        assert!(report.confidence > 0.9);
        assert_eq!(report.metadata.bounding_box, [12, 30, 300, 280]);

        let json = serde_json::to_value(BreedReport::Success(report))?;
        assert_eq!(json["animal_type"], "dog");
        assert_eq!(json["metadata"]["animal_detected"], true);
        assert_eq!(json["top_breeds"].as_array().map(Vec::len), Some(3));
        Ok(())
    }

    #[test]
    fn keyed_id_map_is_accepted() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("id_map.json");
        std::fs::write(
            &path,
            r#"{ "0": { "breed": "siamese", "crop_path": "c/0.jpg" }, "1": { "src_path": "s/1.jpg" } }"#,
        )?;
        let map = IdMap::read(&path)?;
        assert_eq!(map.breed(0), "siamese");
        assert_eq!(map.breed(1), "UNKNOWN");
        assert_eq!(map.breed(7), "UNKNOWN");
        Ok(())
    }

    #[test]
    #[ignore = "needs exported detector, embedder and breed databases"]
    fn detects_breed_with_real_models() -> Result<()> {
        let settings = Settings::load(std::env::var_os("PAWSIGHT_CONFIG").as_deref().map(Path::new))?;
        let mut detector = pawsight::BreedDetector::new(&settings)?;
        detector.init()?;
        let path = std::env::var("PAWSIGHT_TEST_IMAGE").unwrap_or_else(|_| "assets/img/dog.jpg".into());
        let image = image::open(path)?;
        let report = detector.detect_breed(&image, Some(AnimalKind::Dog), true);
        let BreedReport::Success(found) = &report else {
            panic!("expected a breed, got {report:?}");
        };
        assert_eq!(found.animal_type, AnimalKind::Dog);
        assert!(!found.top_breeds.is_empty());
        assert!(found.votes.is_some());
        Ok(())
    }
}
