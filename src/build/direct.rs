use anyhow::Result;
use std::{collections::BTreeSet, path::Path};
use tracing::{debug, info, instrument};

use super::{
    index_table, join_columns, promote, topic_tables, workspace_for, write_key_date_table,
    BuildOptions, MainTableBuilder, MainTableSummary, INDEX_TABLE,
};
use crate::table::{self, SortKey};

/// Streams every table into a single working file, seeding it with the index so that
/// index columns lead the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectJoin;

impl MainTableBuilder for DirectJoin {
    fn name(&self) -> &'static str {
        "direct"
    }

    #[instrument(level = "info", skip(self, options), fields(strategy = "direct"))]
    fn build(
        &self,
        tables_dir: &Path,
        output: &Path,
        options: &BuildOptions,
    ) -> Result<MainTableSummary> {
        let workspace = workspace_for(output)?;
        let work = workspace.path();
        let main = work.join("main.csv");
        let scratch = work.join("main.tmp.csv");

        let index = index_table(tables_dir)?;
        write_key_date_table(tables_dir, options, work, &scratch)?;
        let key = [options.key_column.as_str()];
        table::join(&scratch, &index, &key, &main)?;

        let mut summary = MainTableSummary {
            tables: vec![table::table_name(&index)],
            ..Default::default()
        };
        summary.static_columns = static_columns(&table::columns(&index)?, options);

        for path in topic_tables(tables_dir, options)? {
            if path.ends_with(INDEX_TABLE) {
                continue;
            }
            let columns = table::columns(&path)?;
            let on = join_columns(&columns, options);
            if on.len() == 1 {
                summary.static_columns.extend(static_columns(&columns, options));
            }
            let rows = table::join(&main, &path, &on, &scratch)?;
            promote(&scratch, &main)?;
            debug!(table = %path.display(), rows, "joined into main table");
            summary.tables.push(table::table_name(&path));
        }

        if options.drop_empty_columns {
            summary.dropped_columns = table::drop_empty_columns(&main, &scratch)?;
            promote(&scratch, &main)?;
        }

        summary.rows = table::sort(&main, &scratch, SortKey::Row, options.sort_chunk_rows)?;
        summary.columns = table::columns(&scratch)?;
        promote(&scratch, output)?;

        info!(rows = summary.rows, tables = summary.tables.len(), "main table built");
        Ok(summary)
    }
}

/// Columns a table without a date axis contributes.
pub(crate) fn static_columns(columns: &[String], options: &BuildOptions) -> BTreeSet<String> {
    columns
        .iter()
        .filter(|c| **c != options.key_column)
        .cloned()
        .collect()
}
