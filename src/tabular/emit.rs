//! 各输出格式的 chunk emitter / header / merger。
//!
//! 整表输出定义为 `header + emit_chunk(0, rows)`，
//! 因此单线程与并发路径对同一输入逐字节一致。

use super::table::Table;
use super::OutputFormat;
use crate::error::{EtlError, EtlResult};

/// 格式对应的表头（JSON 没有表头）
pub fn header(table: &Table, format: OutputFormat) -> Vec<u8> {
    let names: Vec<&str> = table.field_names().collect();
    let mut out = Vec::new();
    match format {
        OutputFormat::Json => {}
        OutputFormat::Csv => {
            out.extend_from_slice(names.join(",").as_bytes());
            out.push(b'\n');
        }
        OutputFormat::Txt | OutputFormat::Text => {
            out.extend_from_slice(names.join("\t").as_bytes());
            out.push(b'\n');
            let dashes: Vec<String> = names.iter().map(|n| "-".repeat(n.len())).collect();
            out.extend_from_slice(dashes.join("\t").as_bytes());
            out.push(b'\n');
        }
    }
    out
}

/// `[start, end)` 行的输出，不含表头
pub fn emit_chunk(table: &Table, format: OutputFormat, start: usize, end: usize) -> EtlResult<Vec<u8>> {
    match format {
        OutputFormat::Json => chunk_json(table, start, end),
        OutputFormat::Csv => chunk_csv(table, start, end),
        OutputFormat::Txt | OutputFormat::Text => chunk_text(table, start, end),
    }
}

/// 单线程整表输出
pub fn emit_table(table: &Table, format: OutputFormat) -> EtlResult<Vec<u8>> {
    let mut out = header(table, format);
    out.extend_from_slice(&emit_chunk(table, format, 0, table.num_rows())?);
    Ok(out)
}

/// 表头 + 按 index 顺序拼接各 chunk
pub fn merge(table: &Table, format: OutputFormat, chunks: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = header(table, format);
    out.reserve(chunks.iter().map(|c| c.len()).sum());
    for chunk in chunks {
        out.extend_from_slice(&chunk);
    }
    out
}

fn chunk_json(table: &Table, start: usize, end: usize) -> EtlResult<Vec<u8>> {
    let names: Vec<&str> = table.field_names().collect();
    let mut out = Vec::new();
    for row in start..end {
        let mut record = serde_json::Map::with_capacity(names.len());
        for (col, name) in names.iter().enumerate() {
            record.insert((*name).to_string(), table.cell(col, row)?.to_json());
        }
        serde_json::to_writer(&mut out, &record)
            .map_err(|e| EtlError::internal(format!("failed to marshal JSON for row {row}: {e}")))?;
        out.push(b'\n');
    }
    Ok(out)
}

fn chunk_csv(table: &Table, start: usize, end: usize) -> EtlResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    let mut record = Vec::with_capacity(table.num_columns());
    for row in start..end {
        record.clear();
        for col in 0..table.num_columns() {
            record.push(table.cell(col, row)?.to_string());
        }
        writer
            .write_record(&record)
            .map_err(|e| EtlError::internal(format!("failed to write CSV row {row}: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| EtlError::internal(format!("failed to flush CSV: {e}")))
}

fn chunk_text(table: &Table, start: usize, end: usize) -> EtlResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut values = Vec::with_capacity(table.num_columns());
    for row in start..end {
        values.clear();
        for col in 0..table.num_columns() {
            values.push(table.cell(col, row)?.to_string());
        }
        out.extend_from_slice(values.join("\t").as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabular::table::tests::id_name_parquet;

    fn two_rows() -> Table {
        Table::from_parquet(id_name_parquet(&[(1, Some("a")), (2, Some("b"))], 16)).unwrap()
    }

    #[test]
    fn json_lines() {
        let out = emit_table(&two_rows(), OutputFormat::Json).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(text.ends_with('\n'));
        assert_eq!(
            lines,
            vec![
                serde_json::json!({"id": 1, "name": "a"}),
                serde_json::json!({"id": 2, "name": "b"}),
            ]
        );
    }

    #[test]
    fn csv_with_header() {
        let out = emit_table(&two_rows(), OutputFormat::Csv).unwrap();
        assert_eq!(out, b"id,name\n1,a\n2,b\n");
    }

    #[test]
    fn txt_with_separator() {
        let expected = b"id\tname\n--\t----\n1\ta\n2\tb\n";
        assert_eq!(emit_table(&two_rows(), OutputFormat::Txt).unwrap(), expected);
        assert_eq!(emit_table(&two_rows(), OutputFormat::Text).unwrap(), expected);
    }

    #[test]
    fn csv_quotes_and_nulls() {
        let table = Table::from_parquet(id_name_parquet(
            &[(1, Some("x,y")), (2, None), (3, Some("say \"hi\""))],
            16,
        ))
        .unwrap();
        let out = emit_table(&table, OutputFormat::Csv).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,name\n1,\"x,y\"\n2,\n3,\"say \"\"hi\"\"\"\n"
        );

        let json = emit_chunk(&table, OutputFormat::Json, 1, 2).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(v, serde_json::json!({"id": 2, "name": null}));
    }

    #[test]
    fn empty_table_emits_only_header() {
        let table = Table::from_parquet(id_name_parquet(&[], 16)).unwrap();
        assert_eq!(table.num_rows(), 0);
        assert!(emit_table(&table, OutputFormat::Json).unwrap().is_empty());
        assert_eq!(emit_table(&table, OutputFormat::Csv).unwrap(), b"id,name\n");
        assert_eq!(
            emit_table(&table, OutputFormat::Txt).unwrap(),
            b"id\tname\n--\t----\n"
        );
    }

    #[test]
    fn merge_matches_whole_table() {
        let table = two_rows();
        for format in [OutputFormat::Json, OutputFormat::Csv, OutputFormat::Txt] {
            let chunks = vec![
                emit_chunk(&table, format, 0, 1).unwrap(),
                emit_chunk(&table, format, 1, 2).unwrap(),
            ];
            assert_eq!(merge(&table, format, chunks), emit_table(&table, format).unwrap());
        }
    }
}
