//! Exact nearest-neighbor search over FAISS flat index files.
//!
//! Only the `IndexFlatIP` / `IndexFlatL2` layouts are understood: a fourcc,
//! the common index header, then the raw `f32` vectors. Everything is
//! little-endian.

use crate::error::{PawsightError, Result};
use crate::model_manager;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

const FOURCC_IP: &[u8; 4] = b"IxFI";
const FOURCC_L2: &[u8; 4] = b"IxF2";
const HEADER_DUMMY: i64 = 1 << 20;

pub const UNKNOWN_LABEL: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    InnerProduct,
    L2,
}

impl Metric {
    const fn code(self) -> i32 {
        match self {
            Self::InnerProduct => 0,
            Self::L2 => 1,
        }
    }

    const fn fourcc(self) -> &'static [u8; 4] {
        match self {
            Self::InnerProduct => FOURCC_IP,
            Self::L2 => FOURCC_L2,
        }
    }
}

/// One search result: the stored vector's position and its score.
///
/// For inner product the score is the similarity, for L2 the squared distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub position: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    metric: Metric,
    vectors: Array2<f32>,
}

impl FlatIndex {
    #[must_use]
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            metric,
            vectors: Array2::zeros((0, dim)),
        }
    }

    #[must_use]
    pub const fn metric(&self) -> Metric {
        self.metric
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored vector at `position`.
    #[must_use]
    pub fn reconstruct(&self, position: usize) -> Option<ArrayView1<'_, f32>> {
        (position < self.len()).then(|| self.vectors.row(position))
    }

    /// Append rows; they must have the index dimension.
    pub fn add(&mut self, rows: ndarray::ArrayView2<f32>) -> Result<()> {
        if rows.ncols() != self.dim() {
            return Err(PawsightError::Index(format!(
                "Dimension mismatch: index {} vs vectors {}",
                self.dim(),
                rows.ncols()
            )));
        }
        self.vectors.append(Axis(0), rows)?;
        Ok(())
    }

    /// Exact top-`k` search, best first. Returns at most `min(k, len)` hits.
    pub fn search(&self, query: ArrayView1<f32>, k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim() {
            return Err(PawsightError::Index(format!(
                "Dimension mismatch: index {} vs query {}",
                self.dim(),
                query.len()
            )));
        }

        let scores: Vec<f32> = match self.metric {
            Metric::InnerProduct => self.vectors.dot(&query).to_vec(),
            Metric::L2 => self
                .vectors
                .rows()
                .into_iter()
                .map(|row| {
                    row.iter()
                        .zip(query.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum()
                })
                .collect(),
        };

        let mut hits: Vec<SearchHit> = scores
            .into_iter()
            .enumerate()
            .map(|(position, score)| SearchHit { position, score })
            .collect();
        let metric = self.metric;
        let order = |a: &SearchHit, b: &SearchHit| {
            let by_score = match metric {
                Metric::InnerProduct => b.score.total_cmp(&a.score),
                Metric::L2 => a.score.total_cmp(&b.score),
            };
            by_score.then(a.position.cmp(&b.position))
        };

        let k = k.min(hits.len());
        if k == 0 {
            return Ok(Vec::new());
        }
        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, order);
            hits.truncate(k);
        }
        hits.sort_by(order);
        Ok(hits)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PawsightError::NotFound(path.to_owned()),
            _ => PawsightError::Io(e),
        })?;
        Self::from_reader(&mut BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut fourcc = [0_u8; 4];
        reader.read_exact(&mut fourcc)?;
        let metric = if &fourcc == FOURCC_IP {
            Metric::InnerProduct
        } else if &fourcc == FOURCC_L2 {
            Metric::L2
        } else {
            return Err(PawsightError::Index(format!(
                "Unsupported index type '{}'",
                String::from_utf8_lossy(&fourcc)
            )));
        };

        let dim = read_i32(reader)?;
        let ntotal = read_i64(reader)?;
        let _dummy = read_i64(reader)?;
        let _dummy = read_i64(reader)?;
        let mut is_trained = [0_u8; 1];
        reader.read_exact(&mut is_trained)?;
        let metric_type = read_i32(reader)?;
        if metric_type > 1 {
            let _metric_arg = read_f32(reader)?;
        }
        if metric_type != metric.code() {
            return Err(PawsightError::Index(format!(
                "Metric type {metric_type} does not match index type"
            )));
        }

        let dim = usize::try_from(dim)
            .map_err(|_| PawsightError::Index(format!("Invalid dimension {dim}")))?;
        let ntotal = usize::try_from(ntotal)
            .map_err(|_| PawsightError::Index(format!("Invalid vector count {ntotal}")))?;
        let floats = ntotal
            .checked_mul(dim)
            .ok_or_else(|| PawsightError::Index(format!("{ntotal} vectors of dim {dim} overflow")))?;
        let byte_len = floats
            .checked_mul(4)
            .ok_or_else(|| PawsightError::Index(format!("{floats} floats overflow")))?;

        // Newer writers store the float count, older ones the byte count.
        let stored = usize::try_from(read_u64(reader)?)
            .map_err(|_| PawsightError::Index("Code size overflow".to_string()))?;
        if stored != floats && stored != byte_len {
            return Err(PawsightError::Index(format!(
                "Code size {stored} does not match {ntotal} vectors of dim {dim}"
            )));
        }

        // Sized by what the reader holds, not by the header.
        let mut bytes = Vec::new();
        reader.take(byte_len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != byte_len {
            return Err(PawsightError::Index(format!(
                "Truncated index: expected {byte_len} bytes of codes, found {}",
                bytes.len()
            )));
        }
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            metric,
            vectors: Array2::from_shape_vec((ntotal, dim), data)?,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(self.metric.fourcc())?;
        writer.write_all(&(self.dim() as i32).to_le_bytes())?;
        writer.write_all(&(self.len() as i64).to_le_bytes())?;
        writer.write_all(&HEADER_DUMMY.to_le_bytes())?;
        writer.write_all(&HEADER_DUMMY.to_le_bytes())?;
        writer.write_all(&[1_u8])?;
        writer.write_all(&self.metric.code().to_le_bytes())?;
        writer.write_all(&((self.len() * self.dim()) as u64).to_le_bytes())?;
        for value in &self.vectors {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0_u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    Ok(i32::from_le_bytes(read_array(reader)?))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    Ok(i64::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    Ok(f32::from_le_bytes(read_array(reader)?))
}

/// Metadata stored alongside each indexed vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdEntry {
    #[serde(default = "unknown_label")]
    pub breed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_path: Option<String>,
}

impl Default for IdEntry {
    fn default() -> Self {
        Self {
            breed: unknown_label(),
            crop_path: None,
            src_path: None,
        }
    }
}

fn unknown_label() -> String {
    UNKNOWN_LABEL.to_string()
}

/// Position → metadata, stored either as a JSON list or an object keyed by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdMap {
    List(Vec<IdEntry>),
    Keyed(HashMap<String, IdEntry>),
}

impl IdMap {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PawsightError::NotFound(path.to_owned()),
            _ => PawsightError::Io(e),
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&IdEntry> {
        match self {
            Self::List(entries) => entries.get(position),
            Self::Keyed(entries) => entries.get(&position.to_string()),
        }
    }

    /// Label of a position; unknown positions map to [`UNKNOWN_LABEL`].
    #[must_use]
    pub fn breed(&self, position: usize) -> &str {
        self.get(position).map_or(UNKNOWN_LABEL, |e| e.breed.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::List(entries) => entries.len(),
            Self::Keyed(entries) => entries.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A flat index paired with its id map, one per animal type.
#[derive(Debug, Clone)]
pub struct BreedDatabase {
    pub index: FlatIndex,
    pub id_map: IdMap,
}

impl BreedDatabase {
    /// Open `faiss_IndexFlatIP.faiss` and `id_map.json` from `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let (index_path, id_map_path) = model_manager::database_files(dir)?;
        let index = FlatIndex::read(&index_path)?;
        // Breed voting ranks higher scores first.
        if index.metric() != Metric::InnerProduct {
            return Err(PawsightError::Index(format!(
                "{} is not an inner product index",
                index_path.display()
            )));
        }
        let id_map = IdMap::read(&id_map_path)?;
        info!(
            dir = %dir.display(),
            vectors = index.len(),
            dim = index.dim(),
            "breed database loaded"
        );
        Ok(Self { index, id_map })
    }

    /// Write both files into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.index.write(&dir.join(model_manager::INDEX_FILE))?;
        self.id_map.write(&dir.join(model_manager::ID_MAP_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_index(metric: Metric) -> FlatIndex {
        let mut index = FlatIndex::new(2, metric);
        index
            .add(array![[1.0_f32, 0.0], [0.0, 1.0], [0.6, 0.8], [-1.0, 0.0]].view())
            .unwrap();
        index
    }

    #[test]
    fn inner_product_ranks_by_similarity() {
        let index = sample_index(Metric::InnerProduct);
        let hits = index.search(array![0.8_f32, 0.6].view(), 2).unwrap();
        let positions: Vec<usize> = hits.iter().map(|h| h.position).collect();
        assert_eq!(positions, vec![2, 0]);
        assert!((hits[0].score - 0.96).abs() < 1e-6);
    }

    #[test]
    fn l2_ranks_by_distance() {
        let index = sample_index(Metric::L2);
        let hits = index.search(array![-0.9_f32, 0.0].view(), 1).unwrap();
        assert_eq!(hits[0].position, 3);
        assert!((hits[0].score - 0.01).abs() < 1e-6);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let index = sample_index(Metric::InnerProduct);
        assert_eq!(index.search(array![1.0_f32, 0.0].view(), 50).unwrap().len(), 4);
        assert!(index.search(array![1.0_f32, 0.0].view(), 0).unwrap().is_empty());
    }

    #[test]
    fn reconstruct_returns_stored_rows() {
        let index = sample_index(Metric::InnerProduct);
        assert_eq!(index.reconstruct(2).unwrap(), array![0.6_f32, 0.8]);
        assert!(index.reconstruct(4).is_none());
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let index = sample_index(Metric::InnerProduct);
        assert!(index.search(array![1.0_f32].view(), 1).is_err());
        let mut index = index;
        assert!(index.add(array![[1.0_f32, 2.0, 3.0]].view()).is_err());
    }

    #[test]
    fn file_layout_matches_faiss_header() {
        let index = sample_index(Metric::InnerProduct);
        let mut bytes = Vec::new();
        index.to_writer(&mut bytes).unwrap();
        assert_eq!(&bytes[..4], b"IxFI");
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(bytes[8..16].try_into().unwrap()), 4);
        // fourcc + d + ntotal + 2 dummies + is_trained + metric + size + data
        assert_eq!(bytes.len(), 4 + 4 + 8 + 16 + 1 + 4 + 8 + 8 * 4);

        let back = FlatIndex::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(back, index);
    }

    #[test]
    fn legacy_byte_count_is_accepted() {
        let index = sample_index(Metric::L2);
        let mut bytes = Vec::new();
        index.to_writer(&mut bytes).unwrap();
        let size_at = 4 + 4 + 8 + 16 + 1 + 4;
        bytes[size_at..size_at + 8].copy_from_slice(&32_u64.to_le_bytes());
        let back = FlatIndex::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back.metric(), Metric::L2);
    }

    #[test]
    fn rejects_other_index_types() {
        let bytes = b"IHNf\0\0\0\0".to_vec();
        assert!(matches!(
            FlatIndex::from_reader(&mut bytes.as_slice()),
            Err(PawsightError::Index(_))
        ));
    }

    fn header(dim: i32, ntotal: i64, code_size: u64) -> Vec<u8> {
        let mut bytes = b"IxFI".to_vec();
        bytes.extend(dim.to_le_bytes());
        bytes.extend(ntotal.to_le_bytes());
        bytes.extend(HEADER_DUMMY.to_le_bytes());
        bytes.extend(HEADER_DUMMY.to_le_bytes());
        bytes.push(1);
        bytes.extend(Metric::InnerProduct.code().to_le_bytes());
        bytes.extend(code_size.to_le_bytes());
        bytes
    }

    #[test]
    fn oversized_header_is_an_error() {
        let bytes = header(1 << 30, 1 << 40, 0);
        assert!(matches!(
            FlatIndex::from_reader(&mut bytes.as_slice()),
            Err(PawsightError::Index(_))
        ));
    }

    #[test]
    fn truncated_codes_are_an_error() {
        // Header claims 1M vectors but carries a single one.
        let mut bytes = header(2, 1_000_000, 2_000_000);
        bytes.extend(1.0_f32.to_le_bytes());
        bytes.extend(0.0_f32.to_le_bytes());
        assert!(matches!(
            FlatIndex::from_reader(&mut bytes.as_slice()),
            Err(PawsightError::Index(_))
        ));
    }

    #[test]
    fn id_map_accepts_list_and_keyed_forms() {
        let list: IdMap = serde_json::from_str(
            r#"[{"breed": "n02085620-Chihuahua", "crop_path": "c/0.jpg"}, {}]"#,
        )
        .unwrap();
        assert_eq!(list.breed(0), "n02085620-Chihuahua");
        assert_eq!(list.breed(1), UNKNOWN_LABEL);
        assert_eq!(list.breed(7), UNKNOWN_LABEL);
        assert_eq!(list.get(0).unwrap().crop_path.as_deref(), Some("c/0.jpg"));

        let keyed: IdMap = serde_json::from_str(r#"{"3": {"breed": "pug"}}"#).unwrap();
        assert_eq!(keyed.breed(3), "pug");
        assert_eq!(keyed.breed(0), UNKNOWN_LABEL);
        assert_eq!(keyed.len(), 1);
    }

    #[test]
    fn database_round_trips_through_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db = BreedDatabase {
            index: sample_index(Metric::InnerProduct),
            id_map: IdMap::List(vec![IdEntry::default(); 4]),
        };
        let dir = tmp.path().join("dog");
        db.save(&dir).unwrap();
        let loaded = BreedDatabase::open(&dir).unwrap();
        assert_eq!(loaded.index, db.index);
        assert_eq!(loaded.id_map.len(), 4);

        assert!(matches!(
            BreedDatabase::open(&tmp.path().join("cat")),
            Err(PawsightError::NotFound(_))
        ));
    }

    #[test]
    fn database_requires_inner_product_index() {
        let tmp = tempfile::tempdir().unwrap();
        let db = BreedDatabase {
            index: sample_index(Metric::L2),
            id_map: IdMap::List(vec![IdEntry::default(); 4]),
        };
        db.save(tmp.path()).unwrap();
        assert!(matches!(
            BreedDatabase::open(tmp.path()),
            Err(PawsightError::Index(_))
        ));
    }
}
