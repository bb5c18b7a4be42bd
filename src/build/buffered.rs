use anyhow::Result;
use std::{
    mem,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use super::{
    direct::static_columns, join_columns, promote, topic_tables, workspace_for,
    write_key_date_table, BuildOptions, MainTableBuilder, MainTableSummary,
};
use crate::table::{self, SortKey};

/// Two scratch files that alternate between being read and written.
///
/// Every step reads `input()` and writes `output()`, then calls `swap()` so the result
/// becomes the next step's input.
#[derive(Debug)]
pub struct WorkingBuffer {
    input: PathBuf,
    output: PathBuf,
}

impl WorkingBuffer {
    pub fn new(dir: &Path) -> Self {
        Self {
            input: dir.join("buffer-a.csv"),
            output: dir.join("buffer-b.csv"),
        }
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn swap(&mut self) {
        mem::swap(&mut self.input, &mut self.output);
    }
}

/// Joins the tables one after the other in path order, ping-ponging between two files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferedJoin;

impl MainTableBuilder for BufferedJoin {
    fn name(&self) -> &'static str {
        "buffered"
    }

    #[instrument(level = "info", skip(self, options), fields(strategy = "buffered"))]
    fn build(
        &self,
        tables_dir: &Path,
        output: &Path,
        options: &BuildOptions,
    ) -> Result<MainTableSummary> {
        let workspace = workspace_for(output)?;
        let mut buffer = WorkingBuffer::new(workspace.path());

        write_key_date_table(tables_dir, options, workspace.path(), buffer.output())?;
        buffer.swap();

        let mut summary = MainTableSummary::default();
        for path in topic_tables(tables_dir, options)? {
            let columns = table::columns(&path)?;
            let on = join_columns(&columns, options);
            if on.len() == 1 {
                summary.static_columns.extend(static_columns(&columns, options));
            }
            let rows = table::join(buffer.input(), &path, &on, buffer.output())?;
            buffer.swap();
            debug!(table = %path.display(), rows, "joined into working buffer");
            summary.tables.push(table::table_name(&path));
        }

        if options.drop_empty_columns {
            summary.dropped_columns = table::drop_empty_columns(buffer.input(), buffer.output())?;
            buffer.swap();
        }

        summary.rows = table::sort(
            buffer.input(),
            buffer.output(),
            SortKey::Row,
            options.sort_chunk_rows,
        )?;
        buffer.swap();
        summary.columns = table::columns(buffer.input())?;
        promote(buffer.input(), output)?;

        info!(rows = summary.rows, tables = summary.tables.len(), "main table built");
        Ok(summary)
    }
}
