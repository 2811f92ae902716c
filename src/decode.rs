/// Line decoding: turn one gateway log line into a job-execution event.
///
/// A line is a single CSV record. Field 2 carries the date (`MM/DD/YY`),
/// field 4 the application tag and field 5 a JSON payload describing the
/// finished job. Lines from other applications are skipped, not rejected.
use chrono::NaiveDateTime;
use csv::StringRecord;
use serde_json::{Map, Value};

/// Application tag that marks job-execution lines.
pub const APP_TAG: &str = "COMPASS_ECCONNECT";

const DATE: usize = 2;
const APP: usize = 4;
const MSG: usize = 5;

/// `%.f` makes a trailing fractional-second part optional when parsing.
const TIMESTAMP_FORMAT: &str = "%m/%d/%y %H:%M:%S%.f";

/// Longest raw-line prefix kept in a [`LineError`].
const EXCERPT_CHARS: usize = 80;

/// One completed job, decoded from a qualifying line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub server: String,
    /// Final dot-separated component of the payload's `JOBTYPE`.
    pub job_type: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Whole seconds from `start` to `end`, truncated toward zero.
    /// Negative when `end` precedes `start` (a job that crossed midnight).
    pub duration_secs: i64,
}

/// Outcome of decoding a line that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(JobEvent),
    /// Not a job line: too few fields or a different application tag.
    Skip,
}

/// Decode one raw log line.
pub fn decode_line(line: &str) -> Result<Decoded, DecodeError> {
    let record = match read_single_record(line)? {
        Some(r) => r,
        None => return Ok(Decoded::Skip),
    };

    if record.len() <= MSG || &record[APP] != APP_TAG {
        return Ok(Decoded::Skip);
    }

    let payload: Value = serde_json::from_str(&record[MSG]).map_err(DecodeError::Json)?;
    let msg = payload.as_object().ok_or(DecodeError::NotAnObject)?;

    let server = string_field(msg, "SERVERNAME")?;
    let job_type = short_job_type(string_field(msg, "JOBTYPE")?);

    let date = &record[DATE];
    let start = timestamp(date, msg, "START")?;
    let end = timestamp(date, msg, "END")?;

    Ok(Decoded::Event(JobEvent {
        server: server.to_string(),
        job_type: job_type.to_string(),
        start,
        end,
        duration_secs: end.signed_duration_since(start).num_seconds(),
    }))
}

fn read_single_record(line: &str) -> Result<Option<StringRecord>, DecodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());

    let mut record = StringRecord::new();
    if !reader.read_record(&mut record).map_err(DecodeError::Csv)? {
        return Ok(None);
    }

    let mut extra = StringRecord::new();
    if reader.read_record(&mut extra).map_err(DecodeError::Csv)? {
        return Err(DecodeError::MultipleRecords);
    }

    Ok(Some(record))
}

fn string_field<'a>(msg: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, DecodeError> {
    msg.get(key)
        .ok_or(DecodeError::MissingField(key))?
        .as_str()
        .ok_or(DecodeError::NotAString(key))
}

/// `a.b.Sync` -> `Sync`; a name without dots is returned whole.
fn short_job_type(raw: &str) -> &str {
    raw.rsplit('.').next().unwrap_or(raw)
}

fn timestamp(
    date: &str,
    msg: &Map<String, Value>,
    key: &'static str,
) -> Result<NaiveDateTime, DecodeError> {
    let time = string_field(msg, key)?;
    let value = format!("{date} {time}");
    NaiveDateTime::parse_from_str(&value, TIMESTAMP_FORMAT).map_err(|source| {
        DecodeError::Timestamp {
            field: key,
            value,
            source,
        }
    })
}

/// Why a qualifying line could not be decoded.
#[derive(Debug)]
pub enum DecodeError {
    Csv(csv::Error),
    /// The line held more than one CSV record.
    MultipleRecords,
    Json(serde_json::Error),
    NotAnObject,
    MissingField(&'static str),
    NotAString(&'static str),
    Timestamp {
        field: &'static str,
        value: String,
        source: chrono::ParseError,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Csv(e) => write!(f, "malformed CSV record: {e}"),
            DecodeError::MultipleRecords => write!(f, "line contains more than one CSV record"),
            DecodeError::Json(e) => write!(f, "invalid JSON payload: {e}"),
            DecodeError::NotAnObject => write!(f, "JSON payload is not an object"),
            DecodeError::MissingField(key) => write!(f, "payload is missing {key}"),
            DecodeError::NotAString(key) => write!(f, "payload field {key} is not a string"),
            DecodeError::Timestamp {
                field,
                value,
                source,
            } => write!(f, "cannot parse {field} timestamp {value:?}: {source}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Csv(e) => Some(e),
            DecodeError::Json(e) => Some(e),
            DecodeError::Timestamp { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A [`DecodeError`] tied to the line that produced it.
#[derive(Debug)]
pub struct LineError {
    /// 1-based position of the line within its window.
    pub line_no: u64,
    /// Leading characters of the raw line.
    pub excerpt: String,
    pub kind: DecodeError,
}

impl LineError {
    pub fn new(line_no: u64, line: &str, kind: DecodeError) -> Self {
        Self {
            line_no,
            excerpt: line.chars().take(EXCERPT_CHARS).collect(),
            kind,
        }
    }
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {} (line starts {:?})", self.line_no, self.kind, self.excerpt)
    }
}

impl std::error::Error for LineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
