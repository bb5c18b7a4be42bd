use anyhow::{Context, Result};
use duckdb::Connection;
use std::path::Path;
use tracing::debug;

use crate::{error::PublishError, table};

/// A table living inside the staging database, with its column names in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub columns: Vec<String>,
}

/// Quote an identifier for DuckDB.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for DuckDB.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Table names come from file stems, which may carry characters SQL dislikes.
pub fn safe_table_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Embedded DuckDB used by the staged merge. Every value is imported as VARCHAR so the
/// exported CSV carries the same text as the inputs.
pub struct StagingStore {
    conn: Connection,
}

impl StagingStore {
    /// Open a DuckDB in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory DuckDB")?;
        Ok(Self { conn })
    }

    /// Import the CSV at `path` as a new table called `name`.
    pub fn import(&self, path: &Path, name: &str) -> Result<Relation> {
        let columns = table::columns(path)?;
        let name = safe_table_name(name);
        let column_types = columns
            .iter()
            .map(|c| format!("{}: 'VARCHAR'", literal(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "CREATE TABLE {table} AS SELECT * FROM read_csv({path}, header = true, \
             delim = ',', quote = '\"', columns = {{{column_types}}});",
            table = ident(&name),
            path = literal(&path.to_string_lossy()),
        );
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("importing {} into DuckDB", path.display()))?;

        debug!(table = %name, columns = columns.len(), "imported relation");
        Ok(Relation { name, columns })
    }

    /// Left-join every relation after the first onto the first, on the `on` columns,
    /// storing the result as `into`.
    ///
    /// Same semantics as the streaming join: the base keeps all of its rows, joined
    /// relations contribute at most one row per key (their last one), and a column
    /// present on both sides keeps the earlier non-null value.
    pub fn merge(&self, relations: &[Relation], on: &[&str], into: &str) -> Result<Relation> {
        let (base, rest) = relations
            .split_first()
            .context("merge needs at least one relation")?;
        for rel in relations {
            for key in on {
                if !rel.columns.iter().any(|c| c == key) {
                    return Err(PublishError::MissingColumn {
                        table: rel.name.clone().into(),
                        column: key.to_string(),
                    }
                    .into());
                }
            }
        }

        // (name, select expression) of every output column
        let mut exprs: Vec<(String, String)> = base
            .columns
            .iter()
            .map(|c| (c.clone(), format!("t0.{}", ident(c))))
            .collect();

        let mut from = format!("{} AS t0", ident(&base.name));
        for (i, rel) in rest.iter().enumerate() {
            let alias = format!("t{}", i + 1);
            for col in rel.columns.iter().filter(|c| !on.contains(&c.as_str())) {
                let value = format!("{alias}.{}", ident(col));
                match exprs.iter_mut().find(|(name, _)| name == col) {
                    Some((_, expr)) => *expr = format!("COALESCE({expr}, {value})"),
                    None => exprs.push((col.clone(), value)),
                }
            }

            let partition = on.iter().map(|k| ident(k)).collect::<Vec<_>>().join(", ");
            let condition = on
                .iter()
                .map(|k| format!("t0.{key} = {alias}.{key}", key = ident(k)))
                .collect::<Vec<_>>()
                .join(" AND ");
            from.push_str(&format!(
                " LEFT JOIN (SELECT * FROM {rel} QUALIFY row_number() OVER \
                 (PARTITION BY {partition} ORDER BY rowid DESC) = 1) AS {alias} ON {condition}",
                rel = ident(&rel.name),
            ));
        }

        let select = exprs
            .iter()
            .map(|(name, expr)| format!("{expr} AS {}", ident(name)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE TABLE {} AS SELECT {select} FROM {from};", ident(into));
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("merging {} relations into {}", relations.len(), into))?;

        debug!(into, relations = relations.len(), "merged relations");
        Ok(Relation {
            name: into.to_string(),
            columns: exprs.into_iter().map(|(name, _)| name).collect(),
        })
    }

    pub fn row_count(&self, relation: &Relation) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {};", ident(&relation.name)),
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Write `relation` to `output` as CSV ordered by `sort_by`. Nulls become empty cells.
    pub fn export(&self, relation: &Relation, sort_by: &[&str], output: &Path) -> Result<()> {
        let order = if sort_by.is_empty() {
            String::new()
        } else {
            format!(
                " ORDER BY {}",
                sort_by.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", ")
            )
        };
        let sql = format!(
            "COPY (SELECT * FROM {table}{order}) TO {path} (HEADER, DELIMITER ',');",
            table = ident(&relation.name),
            path = literal(&output.to_string_lossy()),
        );
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("exporting {} to {}", relation.name, output.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::test_util::{read_lines, write_table};
    use tempfile::tempdir;

    #[test]
    fn merge_matches_streaming_join_semantics() -> Result<()> {
        let dir = tempdir()?;
        let base = dir.path().join("base.csv");
        let cases = dir.path().join("cases.csv");
        write_table(
            &base,
            &["location_key,date", "US,2020-01-01", "AD,2020-01-02", "AD,2020-01-01"],
        )?;
        write_table(
            &cases,
            &[
                "location_key,date,new_confirmed",
                "AD,2020-01-02,5",
                "AD,2020-01-02,6",
                "ZZ,2020-01-01,1",
            ],
        )?;

        let store = StagingStore::open_in_memory()?;
        let base = store.import(&base, "base")?;
        let cases = store.import(&cases, "cases")?;
        let merged = store.merge(&[base, cases], &["location_key", "date"], "_merged")?;
        assert_eq!(merged.columns, vec!["location_key", "date", "new_confirmed"]);
        assert_eq!(store.row_count(&merged)?, 3);

        let out = dir.path().join("out.csv");
        store.export(&merged, &["location_key", "date"], &out)?;
        assert_eq!(
            read_lines(&out)?,
            vec![
                "location_key,date,new_confirmed",
                "AD,2020-01-01,",
                "AD,2020-01-02,6",
                "US,2020-01-01,",
            ]
        );
        Ok(())
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(safe_table_name("by-age.v2"), "by_age_v2");
    }
}
