//! Columnar page files.
//!
//! Pages are Arrow IPC files. Every page is written to a temporary path,
//! fsynced, and renamed into place, and its CRC32 is recorded in the
//! manifest so torn or foreign files are detected on read.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Write};
use std::path::Path;

use crc32fast::Hasher;
use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::arrow::ipc::reader::FileReader;
use datafusion::arrow::ipc::writer::FileWriter;
use datafusion::arrow::record_batch::RecordBatch;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};
use crate::order::concat;

/// File extension used for page files.
pub const PAGE_EXTENSION: &str = "arrow";

/// Stable fingerprint of a result schema (field names, types, nullability).
pub fn schema_fingerprint(schema: &Schema) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"route-page-schema/v1");
    for field in schema.fields() {
        hasher.update((field.name().len() as u64).to_le_bytes());
        hasher.update(field.name().as_bytes());
        hasher.update(format!("{:?}", field.data_type()).as_bytes());
        hasher.update([u8::from(field.is_nullable())]);
    }
    hex::encode(hasher.finalize())
}

/// Writer adapter that checksums every byte it forwards.
struct ChecksumWriter<W> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes one page durably at `path` and returns its CRC32.
pub fn write_page(path: &Path, batch: &RecordBatch) -> StoreResult<u32> {
    let tmp_path = path.with_extension("arrow.tmp");
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .map_err(|err| StoreError::io(format!("open page {}", tmp_path.display()), err))?;
    let sink = ChecksumWriter {
        inner: file,
        hasher: Hasher::new(),
    };

    let mut writer = FileWriter::try_new(sink, batch.schema().as_ref())
        .map_err(|err| StoreError::arrow("start page", err))?;
    writer
        .write(batch)
        .map_err(|err| StoreError::arrow("write page", err))?;
    writer
        .finish()
        .map_err(|err| StoreError::arrow("finish page", err))?;
    let mut sink = writer
        .into_inner()
        .map_err(|err| StoreError::arrow("release page writer", err))?;
    sink.flush()
        .map_err(|err| StoreError::io("flush page", err))?;
    sink.inner
        .sync_all()
        .map_err(|err| StoreError::io("sync page", err))?;
    let crc = sink.hasher.finalize();

    fs::rename(&tmp_path, path)
        .map_err(|err| StoreError::io(format!("publish page {}", path.display()), err))?;
    Ok(crc)
}

/// Failure modes when reading a page that callers treat differently.
#[derive(Debug)]
pub enum PageReadError {
    /// The page file is gone (typically superseded by a concurrent writer).
    Missing,
    /// Contents do not match the manifest checksum or cannot be decoded.
    Corrupt(String),
    /// Any other storage failure.
    Store(StoreError),
}

impl From<StoreError> for PageReadError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Reads a page, verifying its checksum, optionally projecting a column subset.
pub fn read_page(
    path: &Path,
    expected_crc: u32,
    projection: Option<Vec<usize>>,
) -> Result<RecordBatch, PageReadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(PageReadError::Missing);
        }
        Err(err) => {
            return Err(StoreError::io(format!("read page {}", path.display()), err).into());
        }
    };
    let actual_crc = crc32fast::hash(&bytes);
    if actual_crc != expected_crc {
        return Err(PageReadError::Corrupt(format!(
            "page {} crc {actual_crc:08x} != manifest {expected_crc:08x}",
            path.display()
        )));
    }

    let reader = FileReader::try_new(Cursor::new(bytes), projection)
        .map_err(|err| PageReadError::Corrupt(format!("decode page {}: {err}", path.display())))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| PageReadError::Corrupt(format!("decode page {}: {err}", path.display())))?;
    Ok(concat(&schema, &batches)?)
}

/// Reads only the schema of a page file.
pub fn read_page_schema(path: &Path) -> StoreResult<SchemaRef> {
    let file = File::open(path)
        .map_err(|err| StoreError::io(format!("open page {}", path.display()), err))?;
    let reader = FileReader::try_new(file, None)
        .map_err(|err| StoreError::arrow(format!("decode page {}", path.display()), err))?;
    Ok(reader.schema())
}

/// Splits rows into pages of at most `rows_per_page` rows.
///
/// An empty result still yields one empty page so the schema is persisted.
pub fn paginate(batch: &RecordBatch, rows_per_page: usize) -> Vec<RecordBatch> {
    let rows_per_page = rows_per_page.max(1);
    if batch.num_rows() == 0 {
        return vec![batch.clone()];
    }
    (0..batch.num_rows())
        .step_by(rows_per_page)
        .map(|start| batch.slice(start, rows_per_page.min(batch.num_rows() - start)))
        .collect()
}
