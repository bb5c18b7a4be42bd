use anyhow::Result;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{
    direct::static_columns, index_table, join_columns, promote, topic_tables, workspace_for,
    write_key_date_table, BuildOptions, MainTableBuilder, MainTableSummary, INDEX_TABLE,
};
use crate::{
    duck::{safe_table_name, StagingStore},
    table::{self, DATE_COLUMN},
};

/// Merges inside an embedded DuckDB in three steps: the static tables on the key,
/// the dated tables on `(key, date)` over the key x date universe, then both on the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedMerge;

impl MainTableBuilder for StagedMerge {
    fn name(&self) -> &'static str {
        "staged"
    }

    #[instrument(level = "info", skip(self, options), fields(strategy = "staged"))]
    fn build(
        &self,
        tables_dir: &Path,
        output: &Path,
        options: &BuildOptions,
    ) -> Result<MainTableSummary> {
        let workspace = workspace_for(output)?;
        let work = workspace.path();
        let universe = work.join("cross-product.csv");
        let index = index_table(tables_dir)?;
        write_key_date_table(tables_dir, options, work, &universe)?;

        let store = StagingStore::open_in_memory()?;
        let index_rel = store.import(&index, "t_index")?;
        let mut static_rels = vec![index_rel];
        let mut dated_rels = vec![store.import(&universe, "_cross_product")?];

        let mut summary = MainTableSummary {
            tables: vec![table::table_name(&index)],
            ..Default::default()
        };
        summary.static_columns = static_columns(&table::columns(&index)?, options);

        for path in topic_tables(tables_dir, options)? {
            if path.ends_with(INDEX_TABLE) {
                continue;
            }
            let name = table::table_name(&path);
            let relation = store.import(&path, &format!("t_{}", safe_table_name(&name)))?;
            if join_columns(&relation.columns, options).len() == 1 {
                summary.static_columns.extend(static_columns(&relation.columns, options));
                static_rels.push(relation);
            } else {
                dated_rels.push(relation);
            }
            summary.tables.push(name);
        }
        debug!(
            static_tables = static_rels.len(),
            dated_tables = dated_rels.len() - 1,
            "imported tables"
        );

        let key = options.key_column.as_str();
        let statics = store.merge(&static_rels, &[key], "_idx1")?;
        let dated = store.merge(&dated_rels, &[key, DATE_COLUMN], "_idx2")?;
        let main = store.merge(&[dated, statics], &[key], "_main")?;
        summary.rows = store.row_count(&main)?;

        let exported = work.join("main.csv");
        store.export(&main, &[key, DATE_COLUMN], &exported)?;
        let finished = if options.drop_empty_columns {
            let trimmed = work.join("main.trimmed.csv");
            summary.dropped_columns = table::drop_empty_columns(&exported, &trimmed)?;
            trimmed
        } else {
            exported
        };
        summary.columns = table::columns(&finished)?;
        promote(&finished, output)?;

        info!(rows = summary.rows, tables = summary.tables.len(), "main table built");
        Ok(summary)
    }
}
