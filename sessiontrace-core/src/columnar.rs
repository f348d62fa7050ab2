//! Columnar (Parquet) output for extracted tables.
//!
//! Rows are buffered as Arrow batches against a frozen `TableSchema`, then
//! concatenated and written once. Every file lands via temp file + rename,
//! so a destination is either fully replaced or left untouched.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{ArrowError, DataType, SchemaRef};
use arrow_select::concat::concat_batches;
use arrow_select::take::take;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use serde_json::{Number, Value};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::schema::{Column, ColumnType, Record, TableSchema};

/// Directory name used for null or empty partition values.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Schema inference error: {0}")]
    SchemaInference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Invalid write options: {0}")]
    InvalidOptions(String),
}

/// How a buffered table lands on disk.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Schema to enforce; inferred from the first row when absent.
    pub schema: Option<TableSchema>,
    /// Hive-style partition columns. Empty means a single file.
    pub partition_by: Vec<String>,
    /// Merge into an existing file instead of replacing it. For partitioned
    /// output this only means "keep existing partitions".
    pub append: bool,
    /// Key column; on collision the last row wins. Not supported together
    /// with `partition_by`.
    pub dedupe_key: Option<String>,
}

impl WriteOptions {
    pub fn with_schema(schema: TableSchema) -> Self {
        Self {
            schema: Some(schema),
            ..Default::default()
        }
    }

    pub fn append_dedupe(mut self, key: impl Into<String>) -> Self {
        self.append = true;
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn partitioned<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_by = columns.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// Row → Arrow coercion
// ============================================================================

fn mismatch(column: &Column, value: &Value, row: usize) -> WriteError {
    WriteError::SchemaInference(format!(
        "row {}: column '{}' expects {:?}, got {}",
        row, column.name, column.ty, value
    ))
}

fn build_column(column: &Column, rows: &[Record]) -> Result<ArrayRef, WriteError> {
    let cells = rows
        .iter()
        .map(|row| row.get(&column.name).filter(|v| !v.is_null()));

    let array: ArrayRef = match column.ty {
        ColumnType::Boolean => {
            let values = cells
                .enumerate()
                .map(|(i, cell)| match cell {
                    None => Ok(None),
                    Some(Value::Bool(b)) => Ok(Some(*b)),
                    Some(other) => Err(mismatch(column, other, i)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(BooleanArray::from(values))
        }
        ColumnType::Int64 => {
            let values = cells
                .enumerate()
                .map(|(i, cell)| match cell {
                    None => Ok(None),
                    Some(v @ Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| mismatch(column, v, i)),
                    Some(other) => Err(mismatch(column, other, i)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(Int64Array::from(values))
        }
        ColumnType::Float64 => {
            let values = cells
                .enumerate()
                .map(|(i, cell)| match cell {
                    None => Ok(None),
                    Some(v @ Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| mismatch(column, v, i)),
                    Some(other) => Err(mismatch(column, other, i)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Arc::new(Float64Array::from(values))
        }
        ColumnType::Utf8 => {
            let values: Vec<Option<String>> = cells
                .map(|cell| {
                    cell.map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
    };
    Ok(array)
}

/// Coerce records to `schema`. Keys the schema does not know are rejected;
/// keys it knows but the record lacks are null.
pub fn records_to_batch(schema: &TableSchema, rows: &[Record]) -> Result<RecordBatch, WriteError> {
    for (i, row) in rows.iter().enumerate() {
        if let Some(unknown) = row.keys().find(|k| schema.column(k).is_none()) {
            return Err(WriteError::SchemaInference(format!(
                "row {}: column '{}' is not in the schema",
                i, unknown
            )));
        }
    }

    let columns = schema
        .columns()
        .iter()
        .map(|c| build_column(c, rows))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RecordBatch::try_new(schema.to_arrow(), columns)?)
}

/// Convert a batch back into named records.
pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<Record>, WriteError> {
    let schema = batch.schema();
    let mut records = vec![Record::new(); batch.num_rows()];

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let values = cell_values(array.as_ref())?;
        for (record, value) in records.iter_mut().zip(values) {
            record.insert(field.name().clone(), value);
        }
    }
    Ok(records)
}

fn cell_values(array: &dyn Array) -> Result<Vec<Value>, WriteError> {
    let len = array.len();
    let values: Vec<Value> = match array.data_type() {
        DataType::Utf8 => {
            let a = array.as_string::<i32>();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::String(a.value(i).to_string()) })
                .collect()
        }
        DataType::Int64 => {
            let a = array.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::from(a.value(i)) })
                .collect()
        }
        DataType::Float64 => {
            let a = array.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Number::from_f64(a.value(i)).map(Value::Number).unwrap_or(Value::Null)
                    }
                })
                .collect()
        }
        DataType::Boolean => {
            let a = array.as_boolean();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::Bool(a.value(i)) })
                .collect()
        }
        other => {
            return Err(WriteError::SchemaInference(format!(
                "unsupported column type {}",
                other
            )))
        }
    };
    Ok(values)
}

/// Cell values rendered as strings, for keys and partition values.
fn cell_strings(array: &dyn Array) -> Result<Vec<Option<String>>, WriteError> {
    Ok(cell_values(array)?
        .into_iter()
        .map(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
        .collect())
}

fn column_index(batch: &RecordBatch, name: &str) -> Result<usize, WriteError> {
    batch
        .schema()
        .index_of(name)
        .map_err(|_| WriteError::SchemaInference(format!("column '{}' is not in the table", name)))
}

fn take_rows(batch: &RecordBatch, rows: Vec<u32>) -> Result<RecordBatch, WriteError> {
    let indices = UInt32Array::from(rows);
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Keep the last row for every key, preserving the relative order of the
/// survivors. Null keys never collide.
pub fn dedupe_keep_last(batch: &RecordBatch, key: &str) -> Result<RecordBatch, WriteError> {
    let keys = cell_strings(batch.column(column_index(batch, key)?).as_ref())?;

    let mut last: HashMap<&str, usize> = HashMap::new();
    for (i, k) in keys.iter().enumerate() {
        if let Some(k) = k {
            last.insert(k.as_str(), i);
        }
    }

    let keep: Vec<u32> = keys
        .iter()
        .enumerate()
        .filter(|(i, k)| match k {
            None => true,
            Some(k) => last.get(k.as_str()) == Some(i),
        })
        .map(|(i, _)| i as u32)
        .collect();

    if keep.len() == batch.num_rows() {
        return Ok(batch.clone());
    }
    tracing::debug!(
        key = key,
        dropped = batch.num_rows() - keep.len(),
        "Deduplicated rows"
    );
    take_rows(batch, keep)
}

// ============================================================================
// BufferedTable
// ============================================================================

/// Accumulates pages for one destination. The schema is fixed by the
/// constructor or by the first non-empty page.
#[derive(Debug, Default)]
pub struct BufferedTable {
    schema: Option<TableSchema>,
    batches: Vec<RecordBatch>,
    rows: usize,
}

impl BufferedTable {
    pub fn new(schema: Option<TableSchema>) -> Self {
        Self {
            schema,
            batches: Vec::new(),
            rows: 0,
        }
    }

    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Add a page. A row that violates the schema rejects the whole page.
    pub fn push(&mut self, rows: &[Record]) -> Result<usize, WriteError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let schema = self.schema.get_or_insert_with(|| TableSchema::infer(first));
        let batch = records_to_batch(schema, rows)?;
        self.rows += batch.num_rows();
        self.batches.push(batch);
        Ok(rows.len())
    }

    /// Non-null values of one column across everything buffered so far.
    pub fn string_column(&self, name: &str) -> Result<Vec<String>, WriteError> {
        let mut out = Vec::with_capacity(self.rows);
        for batch in &self.batches {
            let values = cell_strings(batch.column(column_index(batch, name)?).as_ref())?;
            out.extend(values.into_iter().flatten());
        }
        Ok(out)
    }

    /// Write everything buffered to `dest` and return the number of rows this
    /// table contributed after deduplication.
    ///
    /// A replacing write with a known schema always lands, so zero rows
    /// leave an empty table behind. An append with zero rows, or a table
    /// that never learned its schema, leaves `dest` untouched.
    pub fn finish(self, dest: &Path, options: &WriteOptions) -> Result<usize, WriteError> {
        let Some(schema) = self.schema else {
            tracing::debug!(dest = %dest.display(), "No schema known, skipping write");
            return Ok(0);
        };
        if self.rows == 0 && options.append {
            tracing::debug!(dest = %dest.display(), "No rows to append, skipping write");
            return Ok(0);
        }
        if options.dedupe_key.is_some() && !options.partition_by.is_empty() {
            return Err(WriteError::InvalidOptions(
                "dedupe_key cannot be combined with partition_by".to_string(),
            ));
        }

        let arrow_schema = schema.to_arrow();
        let table = concat_batches(&arrow_schema, &self.batches)?;

        for name in options.partition_by.iter().chain(options.dedupe_key.iter()) {
            column_index(&table, name)?;
        }

        let table = match &options.dedupe_key {
            Some(key) => dedupe_keep_last(&table, key)?,
            None => table,
        };
        let rows = table.num_rows();

        if !options.partition_by.is_empty() {
            write_partitioned(&table, dest, &options.partition_by, options.append)?;
        } else {
            let merged = if options.append && dest.exists() {
                let existing = read_file(dest)?;
                if existing.schema().fields() != arrow_schema.fields() {
                    return Err(WriteError::SchemaInference(format!(
                        "existing file {} has a different schema",
                        dest.display()
                    )));
                }
                let merged = concat_batches(&arrow_schema, [&existing, &table])?;
                match &options.dedupe_key {
                    Some(key) => dedupe_keep_last(&merged, key)?,
                    None => merged,
                }
            } else {
                table
            };
            write_parquet_atomic(dest, &merged)?;
        }

        tracing::debug!(dest = %dest.display(), rows = rows, "Wrote table");
        Ok(rows)
    }
}

/// One-shot write of a single batch of records.
pub fn write_records(rows: &[Record], dest: &Path, options: &WriteOptions) -> Result<usize, WriteError> {
    let mut table = BufferedTable::new(options.schema.clone());
    table.push(rows)?;
    table.finish(dest, options)
}

// ============================================================================
// File I/O
// ============================================================================

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Write `batch` to a temp file beside `dest`, then rename over it.
fn write_parquet_atomic(dest: &Path, batch: &RecordBatch) -> Result<(), WriteError> {
    let parent = parent_dir(dest);
    fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".parquet.tmp")
        .tempfile_in(&parent)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    tmp.persist(dest).map_err(|e| WriteError::Io(e.error))?;
    Ok(())
}

fn partition_value(raw: Option<&str>) -> String {
    match raw {
        None | Some("") => DEFAULT_PARTITION.to_string(),
        Some(v) => v.replace(['/', '\\'], "_"),
    }
}

fn write_partitioned(
    table: &RecordBatch,
    dest: &Path,
    columns: &[String],
    append: bool,
) -> Result<(), WriteError> {
    let key_columns = columns
        .iter()
        .map(|c| cell_strings(table.column(column_index(table, c)?).as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: BTreeMap<Vec<String>, Vec<u32>> = BTreeMap::new();
    for row in 0..table.num_rows() {
        let key = key_columns
            .iter()
            .map(|col| partition_value(col[row].as_deref()))
            .collect();
        groups.entry(key).or_default().push(row as u32);
    }

    let parent = parent_dir(dest);
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    let root = if append {
        dest.to_path_buf()
    } else {
        parent.join(format!(".{}.staging-{}", name, Uuid::new_v4()))
    };

    let written = (|| -> Result<(), WriteError> {
        fs::create_dir_all(&root)?;
        for (values, rows) in groups {
            let dir = columns
                .iter()
                .zip(&values)
                .fold(root.clone(), |dir, (c, v)| dir.join(format!("{}={}", c, v)));
            fs::create_dir_all(&dir)?;
            let part = take_rows(table, rows)?;
            write_parquet_atomic(&dir.join(format!("part-{}.parquet", Uuid::new_v4())), &part)?;
        }
        Ok(())
    })();

    if append {
        return written;
    }
    if let Err(e) = written {
        let _ = fs::remove_dir_all(&root);
        return Err(e);
    }

    // Swap the staged directory in.
    if dest.exists() {
        let backup = parent.join(format!(".{}.old-{}", name, Uuid::new_v4()));
        fs::rename(dest, &backup)?;
        if let Err(e) = fs::rename(&root, dest) {
            let _ = fs::rename(&backup, dest);
            let _ = fs::remove_dir_all(&root);
            return Err(e.into());
        }
        if backup.is_dir() {
            fs::remove_dir_all(&backup)?;
        } else {
            fs::remove_file(&backup)?;
        }
    } else {
        fs::rename(&root, dest)?;
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<RecordBatch, WriteError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema: SchemaRef = builder.schema().clone();
    let batches = builder.build()?.collect::<Result<Vec<_>, ArrowError>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

/// Read a written table: a single file or a partitioned directory.
/// `None` when nothing exists at `path`.
pub fn read_table(path: &Path) -> Result<Option<RecordBatch>, WriteError> {
    if !path.exists() {
        return Ok(None);
    }
    if !path.is_dir() {
        return read_file(path).map(Some);
    }

    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && name.ends_with(".parquet")
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let batches = files
        .iter()
        .map(|f| read_file(f))
        .collect::<Result<Vec<_>, _>>()?;
    match batches.first() {
        None => Ok(None),
        Some(first) => Ok(Some(concat_batches(&first.schema(), &batches)?)),
    }
}

pub fn read_records(path: &Path) -> Result<Vec<Record>, WriteError> {
    match read_table(path)? {
        Some(batch) => batch_to_records(&batch),
        None => Ok(Vec::new()),
    }
}

/// Non-null values of one column, in file order.
pub fn read_string_column(path: &Path, column: &str) -> Result<Vec<String>, WriteError> {
    match read_table(path)? {
        Some(batch) => Ok(cell_strings(batch.column(column_index(&batch, column)?).as_ref())?
            .into_iter()
            .flatten()
            .collect()),
        None => Ok(Vec::new()),
    }
}
