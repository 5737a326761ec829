use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::types::{FeatureSet, Sample, FLEX_COLUMNS, GYRO_COLUMNS, NUM_FLEX, NUM_GYRO};

/// Accepted spellings per column, compared case-insensitively. Older capture
/// scripts wrote `flex1..flex5` / `gyroX`, the log converter wrote `Gyro_X`.
const FLEX_ALIASES: [&[&str]; NUM_FLEX] = [
    &["thumb", "flex1"],
    &["index", "flex2"],
    &["middle", "flex3"],
    &["ring", "flex4"],
    &["pinky", "flex5"],
];
const GYRO_ALIASES: [&[&str]; NUM_GYRO] = [
    &["gyrox", "gyro_x", "gyro x"],
    &["gyroy", "gyro_y", "gyro y"],
    &["gyroz", "gyro_z", "gyro z"],
];

/// Rows of a training CSV plus the columns they came with.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub samples: Vec<Sample>,
    pub has_gyro: bool,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drops rows whose flex values are all zero (no signal). Returns how
    /// many rows were removed.
    pub fn clean(&mut self) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| !s.is_flex_silent());
        before - self.samples.len()
    }

    /// Feature matrix for `feature_set`. Asking for gyro features from a
    /// dataset without gyro columns is an error, never a zero fill.
    pub fn feature_matrix(&self, feature_set: FeatureSet) -> Result<Vec<Vec<f32>>> {
        if feature_set.uses_gyro() && !self.has_gyro {
            bail!("gyro features requested but the dataset has no GyroX/GyroY/GyroZ columns");
        }
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                s.features(feature_set)
                    .with_context(|| format!("row {}", i + 1))
            })
            .collect()
    }
}

fn find_column(headers: &StringRecord, aliases: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_ascii_lowercase();
        aliases.iter().any(|a| *a == h)
    })
}

/// Loads a training CSV with header `Thumb,Index,Middle,Ring,Pinky[,GyroX,GyroY,GyroZ]`.
/// Extra columns (e.g. `cluster`, `gesture`) are ignored.
pub fn load_training_csv(path: impl AsRef<Path>) -> Result<TrainingSet> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("cannot open CSV {:?}", path))?;

    let headers = reader.headers()?.clone();

    let mut flex_idx = [0usize; NUM_FLEX];
    for (i, aliases) in FLEX_ALIASES.iter().enumerate() {
        flex_idx[i] = match find_column(&headers, aliases) {
            Some(idx) => idx,
            None => bail!("{:?} has no {} column", path, FLEX_COLUMNS[i]),
        };
    }

    let gyro_found: Vec<Option<usize>> = GYRO_ALIASES
        .iter()
        .map(|aliases| find_column(&headers, aliases))
        .collect();
    let has_gyro = match gyro_found.iter().filter(|c| c.is_some()).count() {
        0 => false,
        NUM_GYRO => true,
        _ => bail!("{:?} has only some of the gyro columns", path),
    };

    let mut samples = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let line = row_idx + 2;
        let record = result.with_context(|| format!("invalid row {} in {:?}", line, path))?;

        let mut flex = [0u32; NUM_FLEX];
        for (dst, &col) in flex.iter_mut().zip(&flex_idx) {
            *dst = parse_field(&record, col)
                .with_context(|| format!("{:?} line {}: bad flex value", path, line))?;
        }

        let gyro = if has_gyro {
            let mut gyro = [0i32; NUM_GYRO];
            for (dst, col) in gyro.iter_mut().zip(&gyro_found) {
                let col = col.unwrap_or_default();
                *dst = parse_field(&record, col)
                    .with_context(|| format!("{:?} line {}: bad gyro value", path, line))?;
            }
            Some(gyro)
        } else {
            None
        };

        samples.push(Sample { flex, gyro });
    }

    Ok(TrainingSet { samples, has_gyro })
}

/// Integers, but tolerate `600.0` from spreadsheets.
fn parse_field<T: TryFrom<i64>>(record: &StringRecord, col: usize) -> Result<T> {
    let raw = record.get(col).map(str::trim).unwrap_or("");
    let value: i64 = match raw.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            let f: f64 = raw.parse().with_context(|| format!("not a number: {:?}", raw))?;
            if f.fract() != 0.0 || !f.is_finite() {
                bail!("not an integer: {:?}", raw);
            }
            f as i64
        }
    };
    T::try_from(value).map_err(|_| anyhow::anyhow!("out of range: {}", value))
}

fn header_for(with_gyro: bool) -> Vec<&'static str> {
    let mut header: Vec<&'static str> = FLEX_COLUMNS.to_vec();
    if with_gyro {
        header.extend(GYRO_COLUMNS);
    }
    header
}

fn sample_fields(sample: &Sample, with_gyro: bool) -> Vec<String> {
    let mut fields: Vec<String> = sample.flex.iter().map(|v| v.to_string()).collect();
    if with_gyro {
        // Only reached when every sample carries gyro
        if let Some(gyro) = sample.gyro {
            fields.extend(gyro.iter().map(|v| v.to_string()));
        }
    }
    fields
}

/// Streaming writer for captured samples.
pub struct SampleCsvWriter<W: std::io::Write> {
    writer: csv::Writer<W>,
    with_gyro: bool,
    rows: usize,
}

impl SampleCsvWriter<std::fs::File> {
    pub fn create(path: impl AsRef<Path>, with_gyro: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create CSV {:?}", path))?;
        Self::new(file, with_gyro)
    }
}

impl<W: std::io::Write> SampleCsvWriter<W> {
    pub fn new(inner: W, with_gyro: bool) -> Result<Self> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(inner);
        writer.write_record(header_for(with_gyro))?;
        Ok(Self {
            writer,
            with_gyro,
            rows: 0,
        })
    }

    /// Rows without gyro are rejected when the file carries gyro columns.
    pub fn write(&mut self, sample: &Sample) -> Result<()> {
        if self.with_gyro && sample.gyro.is_none() {
            bail!("sample without gyro values in a gyro CSV");
        }
        self.writer.write_record(sample_fields(sample, self.with_gyro))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing CSV: {}", e.error()))
    }
}

/// One output row of a labeled dataset.
pub struct LabeledRow<'a> {
    pub sample: &'a Sample,
    pub cluster: usize,
    pub gesture: Option<&'a str>,
}

/// Re-emits the dataset with an appended `cluster` column and, when known,
/// a `gesture` column.
pub fn write_labeled_csv<'a>(
    path: impl AsRef<Path>,
    with_gyro: bool,
    rows: impl IntoIterator<Item = LabeledRow<'a>>,
) -> Result<usize> {
    let path = path.as_ref();
    let mut rows = rows.into_iter().peekable();
    let with_gesture = rows.peek().map(|r| r.gesture.is_some()).unwrap_or(false);

    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("cannot create CSV {:?}", path))?;

    let mut header = header_for(with_gyro);
    header.push("cluster");
    if with_gesture {
        header.push("gesture");
    }
    writer.write_record(&header)?;

    let mut count = 0;
    for row in rows {
        let mut fields = sample_fields(row.sample, with_gyro);
        fields.push(row.cluster.to_string());
        if with_gesture {
            fields.push(row.gesture.unwrap_or_default().to_string());
        }
        writer.write_record(&fields)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Reads the `cluster` column written by `write_labeled_csv`.
pub fn load_cluster_column(path: impl AsRef<Path>) -> Result<Vec<usize>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("cannot open CSV {:?}", path))?;

    let headers = reader.headers()?.clone();
    let Some(col) = find_column(&headers, &["cluster"]) else {
        bail!("{:?} has no cluster column; run `train` first", path);
    };

    let mut clusters = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result?;
        clusters.push(
            parse_field(&record, col)
                .with_context(|| format!("{:?} line {}: bad cluster id", path, row_idx + 2))?,
        );
    }
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_flex_and_gyro_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(
            &path,
            "Thumb,Index,Middle,Ring,Pinky,GyroX,GyroY,GyroZ\n600,100,120,110,95,5,-3,2\n0,0,0,0,0,1,1,1\n",
        )
        .unwrap();

        let mut set = load_training_csv(&path).unwrap();
        assert!(set.has_gyro);
        assert_eq!(set.len(), 2);
        assert_eq!(set.samples[0].gyro, Some([5, -3, 2]));

        assert_eq!(set.clean(), 1);
        assert_eq!(set.len(), 1);
        let m = set.feature_matrix(FeatureSet::FlexGyro).unwrap();
        assert_eq!(m[0], vec![600.0, 100.0, 120.0, 110.0, 95.0, 5.0, -3.0, 2.0]);
    }

    #[test]
    fn accepts_legacy_header_spellings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        fs::write(
            &path,
            "flex1,flex2,flex3,flex4,flex5,Gyro_X,Gyro_Y,Gyro_Z\n1,2,3,4,5,-1,-2,-3\n",
        )
        .unwrap();
        let set = load_training_csv(&path).unwrap();
        assert_eq!(set.samples[0].flex, [1, 2, 3, 4, 5]);
        assert_eq!(set.samples[0].gyro, Some([-1, -2, -3]));
    }

    #[test]
    fn gyro_features_without_gyro_columns_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flex.csv");
        fs::write(&path, "Thumb,Index,Middle,Ring,Pinky\n600,100,120,110,95.0\n").unwrap();

        let set = load_training_csv(&path).unwrap();
        assert!(!set.has_gyro);
        assert!(set.feature_matrix(FeatureSet::Flex).is_ok());
        assert!(set.feature_matrix(FeatureSet::FlexGyro).is_err());
    }

    #[test]
    fn missing_flex_column_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "Thumb,Index,Middle,Ring\n1,2,3,4\n").unwrap();
        assert!(load_training_csv(&path).is_err());
    }

    #[test]
    fn labeled_output_appends_cluster_and_gesture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labeled.csv");
        let samples = [
            Sample::new([600, 100, 120, 110, 95], None),
            Sample::new([100, 600, 120, 110, 95], None),
        ];
        let rows = samples.iter().zip([5usize, 1]).map(|(s, c)| LabeledRow {
            sample: s,
            cluster: c,
            gesture: Some(if c == 5 { "thumb_bent" } else { "index_bent" }),
        });
        assert_eq!(write_labeled_csv(&path, false, rows).unwrap(), 2);

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Thumb,Index,Middle,Ring,Pinky,cluster,gesture"));
        assert_eq!(lines.next(), Some("600,100,120,110,95,5,thumb_bent"));

        assert_eq!(load_cluster_column(&path).unwrap(), vec![5, 1]);
        // The labeled file is itself a valid training set
        assert_eq!(load_training_csv(&path).unwrap().len(), 2);
    }

    #[test]
    fn sample_writer_emits_header_and_rows() {
        let mut writer = SampleCsvWriter::new(Vec::new(), true).unwrap();
        writer.write(&Sample::new([1, 2, 3, 4, 5], Some([6, -7, 8]))).unwrap();
        assert!(writer.write(&Sample::new([1, 2, 3, 4, 5], None)).is_err());
        assert_eq!(writer.rows(), 1);

        let bytes = writer.into_inner().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "Thumb,Index,Middle,Ring,Pinky,GyroX,GyroY,GyroZ\n1,2,3,4,5,6,-7,8\n"
        );
    }
}
