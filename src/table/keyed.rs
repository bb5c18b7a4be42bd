use anyhow::{bail, Context, Result};
use csv::{StringRecord, Writer};
use std::{
    fs::{self, File},
    path::{Component, Path, PathBuf},
};
use tracing::warn;

use super::{column_index, create_writer, open_reader, read_header};

/// Whether `key` can name a folder directly under the output root: a single plain path
/// component, so no empty key, `.`, `..`, separator or absolute path.
pub fn is_safe_key(key: &str) -> bool {
    let mut components = Path::new(key).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == key
    )
}

/// Writes rows into `<root>/<key>/<file_name>`, keeping exactly one file open.
///
/// Rows must arrive grouped by key: when the key changes the open file is flushed and
/// closed before the next one is created (truncating it if it already exists). Dropping
/// the writer releases the open handle on every path, `finish` additionally reports
/// flush errors.
pub struct KeyedWriter {
    root: PathBuf,
    file_name: String,
    header: StringRecord,
    current: Option<(String, Writer<File>)>,
    written: Vec<PathBuf>,
}

impl KeyedWriter {
    pub fn new(
        root: impl Into<PathBuf>,
        file_name: impl Into<String>,
        header: StringRecord,
    ) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
            header,
            current: None,
            written: Vec::new(),
        }
    }

    /// Append `record` to the file of `key`. Returns `true` when a new file was opened.
    pub fn write(&mut self, key: &str, record: &StringRecord) -> Result<bool> {
        let opened = !matches!(&self.current, Some((open_key, _)) if open_key == key);
        if opened {
            if !is_safe_key(key) {
                bail!("key `{key}` does not name a folder under {}", self.root.display());
            }
            self.close_current()?;
            let dir = self.root.join(key);
            fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
            let path = dir.join(&self.file_name);
            let mut writer = create_writer(&path)?;
            writer.write_record(&self.header)?;
            self.written.push(path);
            self.current = Some((key.to_string(), writer));
        }
        if let Some((_, writer)) = self.current.as_mut() {
            writer.write_record(record)?;
        }
        Ok(opened)
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some((key, mut writer)) = self.current.take() {
            writer
                .flush()
                .with_context(|| format!("flushing {} for key {}", self.file_name, key))?;
        }
        Ok(())
    }

    /// Flush the last open file and return every file written, in creation order.
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.close_current()?;
        Ok(std::mem::take(&mut self.written))
    }
}

/// Split `table` into `<output_dir>/<key>/<table file name>`, one file per value of
/// `key_column`, preserving row order. The table must be grouped by `key_column`.
///
/// Rows whose key is empty or is not a single path component are skipped: their
/// target would be `output_dir` itself or a folder outside of it.
pub fn breakout(table: &Path, output_dir: &Path, key_column: &str) -> Result<Vec<PathBuf>> {
    let mut reader = open_reader(table)?;
    let header = read_header(&mut reader, table)?;
    let key_idx = column_index(&header, key_column, table)?;
    let file_name = table
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("table path {} has no file name", table.display()))?;

    let mut writer = KeyedWriter::new(output_dir, file_name, header);
    let mut skipped = 0u64;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", table.display()))?;
        let key = &record[key_idx];
        if !is_safe_key(key) {
            skipped += 1;
            continue;
        }
        writer.write(key, &record)?;
    }
    if skipped > 0 {
        warn!(
            skipped,
            table = %table.display(),
            "rows without a usable location key were not broken out"
        );
    }
    writer.finish()
}
