//! CSV record store for venues and reviews: BOM-prefixed UTF-8, fixed column order,
//! append without touching prior rows, atomic full rewrite when rows change.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use sha2::{Digest, Sha256};
use harvest_core::{
    AttributeSet, Field, RecordId, Review, ReviewContent, ReviewKeyScheme, Venue, VenueDetails,
    VenueField,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

pub const BOM: &str = "\u{feff}";

pub const VENUE_BASE_COLUMNS: [&str; 12] = [
    "id",
    "url",
    "name",
    "type",
    "rating",
    "review_count",
    "phone",
    "price_tier",
    "address",
    "latitude",
    "longitude",
    "refresh_timestamp",
];

const REVIEW_COLUMNS_TAIL: [&str; 14] = [
    "venue_id",
    "reviewer_name",
    "reviewer_info",
    "rating",
    "relative_time_text",
    "body",
    "service_rating",
    "food_rating",
    "atmosphere_rating",
    "service_type",
    "meal_type",
    "language",
    "resolved_date",
    "refresh_timestamp",
];

pub const PROVIDER_REVIEW_ID_COLUMN: &str = "provider_review_id";

/// Review columns for a key scheme; the provider id column exists only for
/// [`ReviewKeyScheme::ProviderId`].
pub fn review_columns(scheme: ReviewKeyScheme) -> Vec<&'static str> {
    let mut columns = vec!["id"];
    if scheme == ReviewKeyScheme::ProviderId {
        columns.push(PROVIDER_REVIEW_ID_COLUMN);
    }
    columns.extend(REVIEW_COLUMNS_TAIL);
    columns
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed csv in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{}: missing required column `{column}`", path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{}: store was written with a different review key scheme than {scheme:?}", path.display())]
    SchemeMismatch {
        path: PathBuf,
        scheme: ReviewKeyScheme,
    },
    #[error("encoding attribute column `{category}`: {source}")]
    Encode {
        category: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a store file, `None` when it does not exist yet.
pub fn fingerprint(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Venue rows plus the dynamic attribute columns present in (or destined for) the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenueTable {
    pub attribute_columns: Vec<String>,
    pub venues: Vec<Venue>,
}

#[derive(Debug, Clone)]
pub struct VenueStore {
    path: PathBuf,
}

impl VenueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Result<Option<String>, StoreError> {
        fingerprint(&self.path)
    }

    /// Creates the file with the base header when it is missing or empty.
    pub fn ensure_initialized(&self) -> Result<bool, StoreError> {
        let header = VENUE_BASE_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        ensure_header(&self.path, &header)
    }

    /// Reads every row. A missing file is an empty table.
    pub fn load(&self) -> Result<VenueTable, StoreError> {
        let Some(raw) = read_table(&self.path)? else {
            return Ok(VenueTable::default());
        };
        for column in ["id", "url", "name"] {
            if !raw.index.contains(column) {
                return Err(StoreError::MissingColumn {
                    path: self.path.clone(),
                    column,
                });
            }
        }

        let attribute_columns = raw
            .headers
            .iter()
            .filter(|h| !VENUE_BASE_COLUMNS.contains(&h.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        let venues = raw
            .records
            .iter()
            .enumerate()
            .map(|(line, record)| {
                let mut details = VenueDetails::default();
                for field in VenueField::ALL {
                    *details.get_mut(field) = Field::new(raw.index.cell(record, field.column()));
                }
                let mut attributes = AttributeSet::new();
                for column in &attribute_columns {
                    if let Some(items) = decode_attribute_cell(raw.index.cell(record, column), column, line + 2) {
                        attributes.insert(column.clone(), items);
                    }
                }
                Venue {
                    id: RecordId::from_raw(raw.index.cell(record, "id")),
                    url: Field::new(raw.index.cell(record, "url")),
                    name: Field::new(raw.index.cell(record, "name")),
                    details,
                    refreshed_at: Field::new(raw.index.cell(record, "refresh_timestamp")),
                    attributes,
                }
            })
            .collect();

        Ok(VenueTable {
            attribute_columns,
            venues,
        })
    }

    /// Appends rows using the given attribute column set, which must match the file header.
    pub fn append(&self, venues: &[Venue], attribute_columns: &[String]) -> Result<usize, StoreError> {
        if venues.is_empty() {
            return Ok(0);
        }
        let mut rows = Vec::with_capacity(venues.len());
        for venue in venues {
            rows.push(venue_row(venue, attribute_columns)?);
        }
        append_rows(&self.path, &rows)?;
        Ok(venues.len())
    }

    /// Re-emits the whole file with the table's column set via temp file + rename.
    pub fn rewrite(&self, table: &VenueTable) -> Result<usize, StoreError> {
        let mut header = VENUE_BASE_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        header.extend(table.attribute_columns.iter().cloned());

        let mut rows = Vec::with_capacity(table.venues.len());
        for venue in &table.venues {
            rows.push(venue_row(venue, &table.attribute_columns)?);
        }
        write_atomically(&self.path, &header, &rows)?;
        info!(
            path = %self.path.display(),
            rows = rows.len(),
            attribute_columns = table.attribute_columns.len(),
            "rewrote venue store"
        );
        Ok(rows.len())
    }
}

#[derive(Debug, Clone)]
pub struct ReviewStore {
    path: PathBuf,
    scheme: ReviewKeyScheme,
}

impl ReviewStore {
    pub fn new(path: impl Into<PathBuf>, scheme: ReviewKeyScheme) -> Self {
        Self {
            path: path.into(),
            scheme,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scheme(&self) -> ReviewKeyScheme {
        self.scheme
    }

    pub fn fingerprint(&self) -> Result<Option<String>, StoreError> {
        fingerprint(&self.path)
    }

    pub fn ensure_initialized(&self) -> Result<bool, StoreError> {
        let header = review_columns(self.scheme)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        ensure_header(&self.path, &header)
    }

    pub fn load(&self) -> Result<Vec<Review>, StoreError> {
        let Some(raw) = read_table(&self.path)? else {
            return Ok(Vec::new());
        };
        for column in ["id", "venue_id", "reviewer_name"] {
            if !raw.index.contains(column) {
                return Err(StoreError::MissingColumn {
                    path: self.path.clone(),
                    column,
                });
            }
        }
        let has_provider_column = raw.index.contains(PROVIDER_REVIEW_ID_COLUMN);
        if has_provider_column != (self.scheme == ReviewKeyScheme::ProviderId) {
            return Err(StoreError::SchemeMismatch {
                path: self.path.clone(),
                scheme: self.scheme,
            });
        }

        let cell = |record: &StringRecord, column: &str| Field::new(raw.index.cell(record, column));
        Ok(raw
            .records
            .iter()
            .map(|record| Review {
                id: RecordId::from_raw(raw.index.cell(record, "id")),
                venue_id: RecordId::from_raw(raw.index.cell(record, "venue_id")),
                content: ReviewContent {
                    provider_review_id: cell(record, PROVIDER_REVIEW_ID_COLUMN),
                    reviewer_name: cell(record, "reviewer_name"),
                    reviewer_info: cell(record, "reviewer_info"),
                    rating: cell(record, "rating"),
                    relative_time: cell(record, "relative_time_text"),
                    body: cell(record, "body"),
                    service_rating: cell(record, "service_rating"),
                    food_rating: cell(record, "food_rating"),
                    atmosphere_rating: cell(record, "atmosphere_rating"),
                    service_type: cell(record, "service_type"),
                    meal_type: cell(record, "meal_type"),
                    language: cell(record, "language"),
                },
                resolved_date: cell(record, "resolved_date"),
                refreshed_at: cell(record, "refresh_timestamp"),
            })
            .collect())
    }

    pub fn append(&self, reviews: &[Review]) -> Result<usize, StoreError> {
        if reviews.is_empty() {
            return Ok(0);
        }
        let rows = reviews
            .iter()
            .map(|review| review_row(review, self.scheme))
            .collect::<Vec<_>>();
        append_rows(&self.path, &rows)?;
        Ok(rows.len())
    }
}

fn venue_row(venue: &Venue, attribute_columns: &[String]) -> Result<Vec<String>, StoreError> {
    let mut row = vec![
        venue.id.as_str().to_string(),
        venue.url.as_str().to_string(),
        venue.name.as_str().to_string(),
    ];
    row.extend(
        VenueField::ALL
            .iter()
            .map(|field| venue.details.get(*field).as_str().to_string()),
    );
    row.push(venue.refreshed_at.as_str().to_string());
    for category in attribute_columns {
        let items = venue.attributes.get(category).unwrap_or_default();
        let encoded = serde_json::to_string(items).map_err(|source| StoreError::Encode {
            category: category.clone(),
            source,
        })?;
        row.push(encoded);
    }
    Ok(row)
}

fn review_row(review: &Review, scheme: ReviewKeyScheme) -> Vec<String> {
    let c = &review.content;
    let mut row = vec![review.id.as_str().to_string()];
    if scheme == ReviewKeyScheme::ProviderId {
        row.push(c.provider_review_id.as_str().to_string());
    }
    row.extend(
        [
            review.venue_id.as_str(),
            c.reviewer_name.as_str(),
            c.reviewer_info.as_str(),
            c.rating.as_str(),
            c.relative_time.as_str(),
            c.body.as_str(),
            c.service_rating.as_str(),
            c.food_rating.as_str(),
            c.atmosphere_rating.as_str(),
            c.service_type.as_str(),
            c.meal_type.as_str(),
            c.language.as_str(),
            review.resolved_date.as_str(),
            review.refreshed_at.as_str(),
        ]
        .map(str::to_string),
    );
    row
}

/// Blank cell: category absent. `[]`: category known with no items.
fn decode_attribute_cell(cell: &str, column: &str, line: usize) -> Option<Vec<String>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    match serde_json::from_str::<Vec<String>>(cell) {
        Ok(items) => Some(items),
        Err(err) => {
            warn!(column, line, error = %err, "unparseable attribute cell, treating as empty list");
            Some(Vec::new())
        }
    }
}

struct HeaderIndex {
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    fn new(headers: &[String]) -> Self {
        let mut positions = HashMap::with_capacity(headers.len());
        for (i, h) in headers.iter().enumerate() {
            positions.entry(h.clone()).or_insert(i);
        }
        Self { positions }
    }

    fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }

    fn cell<'r>(&self, record: &'r StringRecord, column: &str) -> &'r str {
        self.positions
            .get(column)
            .and_then(|&i| record.get(i))
            .unwrap_or_default()
    }
}

struct RawTable {
    headers: Vec<String>,
    index: HeaderIndex,
    records: Vec<StringRecord>,
}

fn read_table(path: &Path) -> Result<Option<RawTable>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let body = bytes.strip_prefix(BOM.as_bytes()).unwrap_or(&bytes);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let csv_err = |source| StoreError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);
    let headers = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        records.push(record);
    }

    Ok(Some(RawTable {
        index: HeaderIndex::new(&headers),
        headers,
        records,
    }))
}

fn encode_rows(header: Option<&[String]>, rows: &[Vec<String>]) -> Result<Vec<u8>, io::Error> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn ensure_header(path: &Path, header: &[String]) -> Result<bool, StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut bytes = BOM.as_bytes().to_vec();
    bytes.extend(encode_rows(Some(header), &[]).map_err(write_err)?);
    fs::write(path, bytes).map_err(write_err)?;
    info!(path = %path.display(), "created store file");
    Ok(true)
}

fn append_rows(path: &Path, rows: &[Vec<String>]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut bytes = encode_rows(None, rows).map_err(write_err)?;
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(write_err)?;
    if !ends_with_newline(&mut file).map_err(write_err)? {
        bytes.insert(0, b'\n');
    }
    // One write call so a failure never leaves half a row behind the previous ones.
    file.write_all(&bytes).map_err(write_err)?;
    file.flush().map_err(write_err)
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn write_atomically(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut bytes = BOM.as_bytes().to_vec();
    bytes.extend(encode_rows(Some(header), rows).map_err(write_err)?);

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(write_err)?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let result = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    if let Err(source) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(write_err(source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprints_track_file_bytes() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let dir = tempdir().unwrap();
        let store = VenueStore::new(dir.path().join("venues.csv"));
        assert_eq!(store.fingerprint().unwrap(), None);
        store.ensure_initialized().unwrap();
        let empty = store.fingerprint().unwrap().expect("hash");
        store.append(&[venue("1", "Cafe A")], &[]).unwrap();
        assert_ne!(store.fingerprint().unwrap(), Some(empty));
    }

    fn venue(id: &str, name: &str) -> Venue {
        Venue {
            id: RecordId::from_raw(id),
            url: Field::new(format!("https://maps.example/place/{id}")),
            name: Field::new(name),
            details: VenueDetails {
                rating: Field::new("4.0"),
                phone: Field::new("555-1234"),
                ..Default::default()
            },
            refreshed_at: Field::new("2024-01-01 08:00:00"),
            attributes: AttributeSet::new(),
        }
    }

    fn review(id: u64, venue_id: &str, reviewer: &str) -> Review {
        Review {
            id: RecordId::allocated(id),
            venue_id: RecordId::from_raw(venue_id),
            content: ReviewContent {
                provider_review_id: Field::new(format!("g-{id}")),
                reviewer_name: Field::new(reviewer),
                rating: Field::new("5"),
                body: Field::new("Great, \"really\" great\nsecond line"),
                ..Default::default()
            },
            resolved_date: Field::new("2024-01-08"),
            refreshed_at: Field::new("2024-01-10 12:00:00"),
        }
    }

    #[test]
    fn initialized_store_starts_with_bom_and_header() {
        let dir = tempdir().expect("tempdir");
        let store = VenueStore::new(dir.path().join("data/venues.csv"));
        assert!(store.ensure_initialized().expect("init"));
        assert!(!store.ensure_initialized().expect("second init"));

        let text = fs::read_to_string(store.path()).expect("read");
        assert!(text.starts_with(BOM));
        assert!(text.contains("id,url,name,type,rating"));
        assert!(store.load().expect("load").venues.is_empty());
    }

    #[test]
    fn appends_leave_earlier_bytes_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = VenueStore::new(dir.path().join("venues.csv"));
        store.ensure_initialized().expect("init");
        store.append(&[venue("1", "Cafe A")], &[]).expect("append");
        let before = fs::read(store.path()).expect("read");

        store.append(&[venue("2", "Cafe B")], &[]).expect("append");
        let after = fs::read(store.path()).expect("read");
        assert!(after.starts_with(&before));

        let table = store.load().expect("load");
        assert_eq!(table.venues.len(), 2);
        assert_eq!(table.venues[1].name.as_str(), "Cafe B");
        assert_eq!(table.venues[0].details.phone.as_str(), "555-1234");
    }

    #[test]
    fn rewrite_unions_attribute_columns_and_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = VenueStore::new(dir.path().join("venues.csv"));
        let mut a = venue("1", "Cafe A");
        a.attributes.insert("Accessibility", vec!["Wheelchair-accessible entrance".into()]);
        let b = venue("2", "Cafe B");
        let table = VenueTable {
            attribute_columns: vec!["Accessibility".into(), "Offerings".into()],
            venues: vec![a.clone(), b],
        };
        store.rewrite(&table).expect("rewrite");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.attribute_columns, table.attribute_columns);
        assert_eq!(
            loaded.venues[0].attributes.get("Accessibility"),
            a.attributes.get("Accessibility")
        );
        // absent categories persist as known-empty lists
        assert_eq!(loaded.venues[1].attributes.get("Offerings"), Some(&[][..]));
        let leftovers = fs::read_dir(dir.path()).expect("dir").count();
        assert_eq!(leftovers, 1, "temp file must be renamed away");
    }

    #[test]
    fn malformed_attribute_cell_loads_as_empty_list() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("venues.csv");
        let text = format!(
            "{BOM}id,url,name,type,rating,review_count,phone,price_tier,address,latitude,longitude,refresh_timestamp,Offerings\n\
             1,u,Cafe A,,,,,,,,,,not json\n2,u2,Cafe B,,,,,,,,,,\n"
        );
        fs::write(&path, text).expect("write");
        let table = VenueStore::new(&path).load().expect("load");
        assert_eq!(table.venues[0].attributes.get("Offerings"), Some(&[][..]));
        assert!(!table.venues[1].attributes.contains("Offerings"));
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("venues.csv");
        fs::write(&path, "id,title\n1,x\n").expect("write");
        let err = VenueStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { column: "url", .. }));
    }

    #[test]
    fn reviews_round_trip_with_quoted_bodies() {
        let dir = tempdir().expect("tempdir");
        let store = ReviewStore::new(dir.path().join("reviews.csv"), ReviewKeyScheme::ProviderId);
        store.ensure_initialized().expect("init");
        store
            .append(&[review(1, "5", "Jane"), review(2, "5", "Bob")])
            .expect("append");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], review(1, "5", "Jane"));
        assert_eq!(loaded[1].content.provider_review_id.as_str(), "g-2");
    }

    #[test]
    fn review_scheme_must_match_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.csv");
        ReviewStore::new(&path, ReviewKeyScheme::ReviewerName)
            .ensure_initialized()
            .expect("init");
        let err = ReviewStore::new(&path, ReviewKeyScheme::ProviderId).load().unwrap_err();
        assert!(matches!(err, StoreError::SchemeMismatch { .. }));
    }

    #[test]
    fn append_repairs_missing_trailing_newline() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reviews.csv");
        let header = review_columns(ReviewKeyScheme::ReviewerName).join(",");
        fs::write(&path, format!("{BOM}{header}")).expect("write");
        let store = ReviewStore::new(&path, ReviewKeyScheme::ReviewerName);
        store.append(&[review(1, "5", "Jane")]).expect("append");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content.reviewer_name.as_str(), "Jane");
        // provider id is not persisted under the name scheme
        assert!(loaded[0].content.provider_review_id.is_blank());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = ReviewStore::new(dir.path().join("absent.csv"), ReviewKeyScheme::ReviewerName);
        assert!(store.load().expect("load").is_empty());
    }
}
