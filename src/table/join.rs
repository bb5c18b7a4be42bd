use anyhow::{Context, Result};
use csv::StringRecord;
use std::{collections::HashMap, path::Path};
use tracing::debug;

use super::{column_index, create_writer, open_reader, read_header};

/// Every row of `left` paired with every row of `right`. Columns are `left ++ right`.
///
/// `right` is held in memory, so it should be the smaller table (e.g. the date list).
pub fn cross_product(left: &Path, right: &Path, output: &Path) -> Result<u64> {
    let mut right_reader = open_reader(right)?;
    let right_header = read_header(&mut right_reader, right)?;
    let right_rows: Vec<StringRecord> = right_reader
        .records()
        .collect::<Result<_, _>>()
        .with_context(|| format!("reading {}", right.display()))?;

    let mut left_reader = open_reader(left)?;
    let left_header = read_header(&mut left_reader, left)?;

    let mut writer = create_writer(output)?;
    writer.write_record(left_header.iter().chain(right_header.iter()))?;

    let mut rows = 0u64;
    for record in left_reader.records() {
        let record = record.with_context(|| format!("reading {}", left.display()))?;
        for other in &right_rows {
            writer.write_record(record.iter().chain(other.iter()))?;
            rows += 1;
        }
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;

    debug!(rows, output = %output.display(), "cross product written");
    Ok(rows)
}

/// Where a right-hand value column lands in the joined output.
enum Target {
    /// Appended as a new column.
    New,
    /// Same name as an existing left column: fills it only where the left cell is empty.
    Fill(usize),
}

/// Left outer join of `left` with `right` on the `on` columns, streamed into `output`.
///
/// Every left row is written exactly once, so the row count never changes:
/// - right rows whose key is absent on the left are dropped,
/// - duplicate right keys collapse to their last occurrence,
/// - right columns already present on the left only fill empty left cells.
pub fn join(left: &Path, right: &Path, on: &[&str], output: &Path) -> Result<u64> {
    // 1) Load the right table keyed by its join columns
    let mut right_reader = open_reader(right)?;
    let right_header = read_header(&mut right_reader, right)?;
    let right_on: Vec<usize> = on
        .iter()
        .map(|c| column_index(&right_header, c, right))
        .collect::<Result<_>>()?;
    let right_values: Vec<usize> = (0..right_header.len())
        .filter(|i| !right_on.contains(i))
        .collect();

    let mut lookup: HashMap<Vec<String>, StringRecord> = HashMap::new();
    for (row, record) in right_reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", row + 1, right.display()))?;
        let key = right_on.iter().map(|&i| record[i].to_string()).collect();
        lookup.insert(key, record);
    }

    // 2) Work out the output header
    let mut left_reader = open_reader(left)?;
    let left_header = read_header(&mut left_reader, left)?;
    let left_on: Vec<usize> = on
        .iter()
        .map(|c| column_index(&left_header, c, left))
        .collect::<Result<_>>()?;

    let targets: Vec<(usize, Target)> = right_values
        .iter()
        .map(|&ri| {
            let name = &right_header[ri];
            match left_header.iter().position(|c| c == name) {
                Some(li) => (ri, Target::Fill(li)),
                None => (ri, Target::New),
            }
        })
        .collect();

    let mut out_header = left_header.clone();
    for (ri, target) in &targets {
        if let Target::New = target {
            out_header.push_field(&right_header[*ri]);
        }
    }

    let mut writer = create_writer(output)?;
    writer.write_record(&out_header)?;

    // 3) Stream the left table through the lookup
    let mut key: Vec<String> = Vec::with_capacity(left_on.len());
    let mut out: Vec<String> = Vec::with_capacity(out_header.len());
    let mut rows = 0u64;
    let mut matched = 0u64;
    for (row, record) in left_reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", row + 1, left.display()))?;

        key.clear();
        key.extend(left_on.iter().map(|&i| record[i].to_string()));

        out.clear();
        out.extend(record.iter().map(str::to_string));

        match lookup.get(&key) {
            Some(other) => {
                matched += 1;
                for (ri, target) in &targets {
                    match target {
                        Target::New => out.push(other[*ri].to_string()),
                        Target::Fill(li) => {
                            if out[*li].is_empty() {
                                out[*li] = other[*ri].to_string();
                            }
                        }
                    }
                }
            }
            None => {
                for (_, target) in &targets {
                    if let Target::New = target {
                        out.push(String::new());
                    }
                }
            }
        }

        writer.write_record(&out)?;
        rows += 1;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;

    debug!(
        rows,
        matched,
        right = %right.display(),
        "joined table"
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{read_lines, write_table};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cross_product_pairs_every_row() -> Result<()> {
        let dir = tempdir()?;
        let keys = dir.path().join("keys.csv");
        let dates = dir.path().join("dates.csv");
        let out = dir.path().join("out.csv");
        write_table(&keys, &["location_key", "AD", "US"])?;
        write_table(&dates, &["date", "2020-01-01", "2020-01-02"])?;

        assert_eq!(cross_product(&keys, &dates, &out)?, 4);
        assert_eq!(
            read_lines(&out)?,
            vec![
                "location_key,date",
                "AD,2020-01-01",
                "AD,2020-01-02",
                "US,2020-01-01",
                "US,2020-01-02",
            ]
        );
        Ok(())
    }

    #[test]
    fn join_keeps_every_left_row() -> Result<()> {
        let dir = tempdir()?;
        let left = dir.path().join("left.csv");
        let right = dir.path().join("right.csv");
        let out = dir.path().join("out.csv");
        write_table(
            &left,
            &["location_key,date", "AD,2020-01-01", "AD,2020-01-02", "US,2020-01-01"],
        )?;
        write_table(
            &right,
            &[
                "location_key,date,new_confirmed",
                "AD,2020-01-02,5",
                "ZZ,2020-01-01,9",
                "AD,2020-01-02,6",
            ],
        )?;

        assert_eq!(join(&left, &right, &["location_key", "date"], &out)?, 3);
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
    fn static_join_broadcasts_and_fills_collisions() -> Result<()> {
        let dir = tempdir()?;
        let left = dir.path().join("left.csv");
        let right = dir.path().join("right.csv");
        let out = dir.path().join("out.csv");
        write_table(
            &left,
            &["location_key,date,name", "AD,2020-01-01,", "AD,2020-01-02,Andorra"],
        )?;
        write_table(&right, &["location_key,name,population", "AD,Principality,77543"])?;

        join(&left, &right, &["location_key"], &out)?;
        assert_eq!(
            read_lines(&out)?,
            vec![
                "location_key,date,name,population",
                "AD,2020-01-01,Principality,77543",
                "AD,2020-01-02,Andorra,77543",
            ]
        );
        Ok(())
    }

    #[test]
    fn join_on_missing_column_fails() -> Result<()> {
        let dir = tempdir()?;
        let left = dir.path().join("left.csv");
        let right = dir.path().join("right.csv");
        write_table(&left, &["location_key", "AD"])?;
        write_table(&right, &["key,value", "AD,1"])?;

        assert!(join(&left, &right, &["location_key"], &dir.path().join("o.csv")).is_err());
        Ok(())
    }
}
