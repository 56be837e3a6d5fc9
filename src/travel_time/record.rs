use std::io::Read;

use anyhow::{anyhow, Context};

use crate::grid::grid::GridId;

/// Travel times are whole minutes.
pub type Minutes = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TravelTimeRecord {
    pub from_id: GridId,
    pub to_id: GridId,
    pub travel_time: Minutes,
}

#[derive(Debug, thiserror::Error)]
pub enum TravelTimeError {
    /// The record is skipped, the stream goes on.
    #[error("Malformed travel time record on line {line}: {reason}")]
    Malformed { line: u64, reason: String },
    /// The stream itself broke.
    #[error("Reading the travel time stream failed")]
    Io(#[source] csv::Error),
}

impl TravelTimeError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, TravelTimeError::Malformed { .. })
    }
}

const TRAVEL_TIME_COLUMNS: [&str; 2] = ["travel_time_p50", "travel_time"];

/// Streaming reader of `from_id,to_id,travel_time_p50` CSV. Unreachable pairs (empty or
/// NaN travel time) are skipped silently.
pub struct TravelTimeReader<R: Read> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
    from_column: usize,
    to_column: usize,
    time_column: usize,
}

impl<R: Read> TravelTimeReader<R> {
    pub fn new(reader: R) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader
            .headers()
            .context("Reading travel time header")?
            .clone();
        let column = |names: &[&str]| {
            headers
                .iter()
                .position(|header| names.contains(&header))
                .ok_or_else(|| {
                    anyhow!("Travel time header {:?} lacks column {}", headers, names[0])
                })
        };
        Ok(Self {
            from_column: column(&["from_id"])?,
            to_column: column(&["to_id"])?,
            time_column: column(&TRAVEL_TIME_COLUMNS)?,
            reader,
            record: csv::StringRecord::new(),
        })
    }

    fn field(&self, column: usize, name: &str) -> Result<&str, String> {
        self.record
            .get(column)
            .ok_or_else(|| format!("missing {}", name))
    }

    fn parse_id(&self, column: usize, name: &str) -> Result<GridId, String> {
        let value = self.field(column, name)?;
        value
            .parse::<GridId>()
            .map_err(|_| format!("{} '{}' is not a grid id", name, value))
    }

    /// `Ok(None)` for unreachable pairs.
    fn parse_record(&self) -> Result<Option<TravelTimeRecord>, String> {
        let from_id = self.parse_id(self.from_column, "from_id")?;
        let to_id = self.parse_id(self.to_column, "to_id")?;
        let value = self.field(self.time_column, "travel time")?;
        if value.is_empty() {
            return Ok(None);
        }
        let minutes = value
            .parse::<f64>()
            .map_err(|_| format!("travel time '{}' is not a number", value))?;
        if minutes.is_nan() {
            return Ok(None);
        }
        if !minutes.is_finite() || minutes < 0.0 || minutes.round() > Minutes::MAX as f64 {
            return Err(format!("travel time {} is out of range", value));
        }
        Ok(Some(TravelTimeRecord {
            from_id,
            to_id,
            travel_time: minutes.round() as Minutes,
        }))
    }
}

impl<R: Read> Iterator for TravelTimeReader<R> {
    type Item = Result<TravelTimeRecord, TravelTimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => return None,
                Ok(true) => {}
                Err(err) if err.is_io_error() => return Some(Err(TravelTimeError::Io(err))),
                Err(err) => {
                    let line = err.position().map_or(0, |position| position.line());
                    return Some(Err(TravelTimeError::Malformed {
                        line,
                        reason: err.to_string(),
                    }));
                }
            }
            let line = self.record.position().map_or(0, |position| position.line());
            match self.parse_record() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => log::trace!("Unreachable pair on line {}", line),
                Err(reason) => return Some(Err(TravelTimeError::Malformed { line, reason })),
            }
        }
    }
}
