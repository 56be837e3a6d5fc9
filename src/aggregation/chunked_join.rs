use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap, HashSet},
    fs::File,
    io::Write,
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::classification::scheme::CategoryPath;
use crate::geofile::feature::Feature;
use crate::grid::access_points::AccessPoint;
use crate::grid::grid::GridId;
use crate::travel_time::record::{Minutes, TravelTimeError, TravelTimeRecord};

pub const ACCESS_TABLE_HEADER: [&str; 6] = [
    "from_id",
    "Class_C",
    "Class_B",
    "travel_time_p50",
    "n",
    "cum_pois",
];

/// Number of features of one category first reached from `from_id` at `travel_time_p50`,
/// and the running total up to that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRow {
    pub from_id: GridId,
    #[serde(rename = "Class_C")]
    pub class_c: String,
    #[serde(rename = "Class_B")]
    pub class_b: String,
    pub travel_time_p50: Minutes,
    pub n: usize,
    pub cum_pois: usize,
}

/// Classified features indexed by the grid cells they are reachable through.
pub struct AccessIndex {
    pois_by_cell: HashMap<GridId, Vec<usize>>,
    categories: Vec<CategoryPath>,
}

impl AccessIndex {
    pub fn new(access_points: &BTreeSet<AccessPoint>, features: &[Feature]) -> Self {
        let mut positions = HashMap::new();
        let mut categories = Vec::new();
        for feature in features {
            if let Some(category) = &feature.category {
                if positions
                    .insert(feature.id.as_str(), categories.len())
                    .is_some()
                {
                    log::warn!("Feature id {} is not unique, the last one wins", feature.id);
                }
                categories.push(category.clone());
            }
        }
        let mut pois_by_cell: HashMap<GridId, Vec<usize>> = HashMap::new();
        for access_point in access_points {
            match positions.get(access_point.feature_id.as_str()) {
                Some(poi) => pois_by_cell
                    .entry(access_point.nearest_grid_cell)
                    .or_default()
                    .push(*poi),
                None => log::debug!(
                    "Access point of unknown or unclassified feature {}",
                    access_point.feature_id
                ),
            }
        }
        Self {
            pois_by_cell,
            categories,
        }
    }

    pub fn num_pois(&self) -> usize {
        self.categories.len()
    }

    pub fn destinations(&self) -> impl Iterator<Item = GridId> + '_ {
        self.pois_by_cell.keys().copied()
    }

    fn pois_at(&self, cell: GridId) -> &[usize] {
        self.pois_by_cell.get(&cell).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub records: usize,
    pub malformed: usize,
    pub out_of_order: usize,
    pub origins: usize,
    pub chunks: usize,
    pub rows: usize,
}

/// Groups an origin-ordered record stream into chunks of at most `chunk_size` origins.
/// Malformed and out-of-order records are counted and skipped.
pub struct OriginChunks<I> {
    records: I,
    chunk_size: usize,
    seen_origins: HashSet<GridId>,
    current_origin: Option<GridId>,
    pending: Option<TravelTimeRecord>,
    stats: StreamStats,
}

impl<I> OriginChunks<I>
where
    I: Iterator<Item = Result<TravelTimeRecord, TravelTimeError>>,
{
    pub fn new(records: I, chunk_size: usize) -> Self {
        Self {
            records,
            chunk_size: chunk_size.max(1),
            seen_origins: HashSet::new(),
            current_origin: None,
            pending: None,
            stats: StreamStats::default(),
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }
}

impl<I> Iterator for OriginChunks<I>
where
    I: Iterator<Item = Result<TravelTimeRecord, TravelTimeError>>,
{
    type Item = Result<Vec<TravelTimeRecord>, TravelTimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::new();
        let mut num_origins = 0;
        loop {
            let record = match self.pending.take() {
                Some(record) => record,
                None => match self.records.next() {
                    None => break,
                    Some(Ok(record)) => record,
                    Some(Err(err)) if err.is_malformed() => {
                        log::warn!("Skipping record: {}", err);
                        self.stats.malformed += 1;
                        continue;
                    }
                    Some(Err(err)) => return Some(Err(err)),
                },
            };
            if self.current_origin != Some(record.from_id) {
                if self.seen_origins.contains(&record.from_id) {
                    log::warn!(
                        "Skipping record {} -> {}: origin {} appeared earlier in the stream",
                        record.from_id,
                        record.to_id,
                        record.from_id
                    );
                    self.stats.out_of_order += 1;
                    continue;
                }
                if num_origins == self.chunk_size {
                    self.pending = Some(record);
                    break;
                }
                self.seen_origins.insert(record.from_id);
                self.current_origin = Some(record.from_id);
                self.stats.origins += 1;
                num_origins += 1;
            }
            self.stats.records += 1;
            chunk.push(record);
        }
        if chunk.is_empty() {
            None
        } else {
            self.stats.chunks += 1;
            Some(Ok(chunk))
        }
    }
}

/// Join one chunk against the access index and aggregate it to access rows ordered by
/// (from_id, Class_C, Class_B, travel time).
pub fn aggregate_chunk(records: &[TravelTimeRecord], index: &AccessIndex) -> Vec<AccessRow> {
    // Per (origin, poi): minimum travel time, ties going to the lowest destination.
    let mut nearest: HashMap<(GridId, usize), (Minutes, GridId)> = HashMap::new();
    for record in records {
        for poi in index.pois_at(record.to_id) {
            let candidate = (record.travel_time, record.to_id);
            match nearest.entry((record.from_id, *poi)) {
                Entry::Occupied(mut entry) => {
                    if candidate < *entry.get() {
                        entry.insert(candidate);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(candidate);
                }
            }
        }
    }

    let mut counts: BTreeMap<(GridId, &str, &str, Minutes), usize> = BTreeMap::new();
    for ((origin, poi), (travel_time, _)) in nearest {
        let category = &index.categories[poi];
        *counts
            .entry((
                origin,
                category.class_c.as_str(),
                category.class_b.as_str(),
                travel_time,
            ))
            .or_insert(0) += 1;
    }

    let mut rows: Vec<AccessRow> = Vec::with_capacity(counts.len());
    for ((from_id, class_c, class_b, travel_time_p50), n) in counts {
        let cum_pois = match rows.last() {
            Some(last)
                if last.from_id == from_id && last.class_c == class_c && last.class_b == class_b =>
            {
                last.cum_pois + n
            }
            _ => n,
        };
        rows.push(AccessRow {
            from_id,
            class_c: class_c.to_string(),
            class_b: class_b.to_string(),
            travel_time_p50,
            n,
            cum_pois,
        });
    }
    rows
}

/// Receives aggregated rows chunk by chunk.
pub trait AccessRowSink {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()>;
}

impl AccessRowSink for Vec<AccessRow> {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()> {
        self.extend_from_slice(rows);
        Ok(())
    }
}

impl<S: AccessRowSink + ?Sized> AccessRowSink for &mut S {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()> {
        (**self).accept(rows)
    }
}

impl<A: AccessRowSink, B: AccessRowSink> AccessRowSink for (A, B) {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()> {
        self.0.accept(rows)?;
        self.1.accept(rows)
    }
}

/// `grid_ttm_access.csv` writer. The header is written up front so that a city without any
/// reachable POI still gets a readable table.
pub struct AccessTableWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl AccessTableWriter<File> {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| format!("Creating {:?}", path))?;
        Self::new(file)
    }
}

impl<W: Write> AccessTableWriter<W> {
    pub fn new(writer: W) -> anyhow::Result<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        writer.write_record(ACCESS_TABLE_HEADER)?;
        Ok(Self { writer })
    }

    pub fn finish(mut self) -> anyhow::Result<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("Flushing access table: {}", err.error()))
    }
}

impl<W: Write> AccessRowSink for AccessTableWriter<W> {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        Ok(())
    }
}

/// Stream the travel-time records through the access join chunk by chunk.
pub fn join_travel_times<I, S>(
    records: I,
    index: &AccessIndex,
    chunk_size: usize,
    mut sink: S,
) -> anyhow::Result<StreamStats>
where
    I: Iterator<Item = Result<TravelTimeRecord, TravelTimeError>>,
    S: AccessRowSink,
{
    let mut chunks = OriginChunks::new(records, chunk_size);
    let mut num_rows = 0;
    for chunk in &mut chunks {
        let chunk = chunk?;
        let rows = aggregate_chunk(&chunk, index);
        log::debug!("Aggregated {} records to {} rows", chunk.len(), rows.len());
        num_rows += rows.len();
        sink.accept(&rows)?;
    }
    let mut stats = chunks.stats();
    stats.rows = num_rows;
    Ok(stats)
}

const REPLAY_BATCH_SIZE: usize = 10_000;

/// Feed a persisted `grid_ttm_access.csv` to a sink in batches. Returns the number of rows.
pub fn replay_access_table<S: AccessRowSink>(path: &Path, mut sink: S) -> anyhow::Result<usize> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Opening {:?}", path))?;
    let mut batch = Vec::with_capacity(REPLAY_BATCH_SIZE);
    let mut num_rows = 0;
    for row in reader.deserialize::<AccessRow>() {
        batch.push(row.with_context(|| format!("Reading {:?}", path))?);
        if batch.len() == REPLAY_BATCH_SIZE {
            sink.accept(&batch)?;
            num_rows += batch.len();
            batch.clear();
        }
    }
    sink.accept(&batch)?;
    num_rows += batch.len();
    Ok(num_rows)
}
