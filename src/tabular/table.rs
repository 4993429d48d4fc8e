use std::fmt;

use arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use arrow::datatypes::{
    DataType, Float16Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    SchemaRef, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow::util::display::array_value_to_string;
use base64::Engine;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::error::{EtlError, EtlResult};

/// 单元格取值：只有原始类型或 null，嵌套/其它类型统一渲染成文本
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl Cell {
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => Value::Bool(*b),
            Cell::Int(v) => Value::from(*v),
            Cell::UInt(v) => Value::from(*v),
            // NaN / inf 没有 JSON 表示
            Cell::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Binary(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
        }
    }
}

/// 文本形式（CSV / TXT）：null 为空串
impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::UInt(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
            Cell::Binary(b) => f.write_str(&base64::engine::general_purpose::STANDARD.encode(b)),
        }
    }
}

/// 一列：若干个 chunk（每个 RecordBatch 贡献一个）
#[derive(Clone, Debug, Default)]
pub struct Column {
    chunks: Vec<ArrayRef>,
}

impl Column {
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按 chunk 长度累加定位；越界返回 None
    fn locate(&self, row: usize) -> Option<(&ArrayRef, usize)> {
        let mut row = row;
        for chunk in &self.chunks {
            if row < chunk.len() {
                return Some((chunk, row));
            }
            row -= chunk.len();
        }
        None
    }
}

/// 行视图：schema + N 个分块列
#[derive(Clone, Debug)]
pub struct Table {
    schema: SchemaRef,
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    /// 解析整个 parquet blob
    pub fn from_parquet(data: Bytes) -> EtlResult<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data)
            .map_err(|e| EtlError::bad_input(format!("failed to read parquet: {e}")))?;
        let schema = builder.schema().clone();
        let reader = builder
            .build()
            .map_err(|e| EtlError::bad_input(format!("failed to read parquet: {e}")))?;
        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EtlError::bad_input(format!("failed to read table: {e}")))?;
        Ok(Self::from_batches(schema, &batches))
    }

    pub fn from_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Self {
        let columns: Vec<Column> = (0..schema.fields().len())
            .map(|i| Column {
                chunks: batches.iter().map(|b| b.column(i).clone()).collect(),
            })
            .collect();
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        Self {
            schema,
            columns,
            rows,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.schema.fields().iter().map(|f| f.name().as_str())
    }

    /// (col, row) 处的值；越界或逻辑 null 返回 `Cell::Null`
    pub fn cell(&self, col: usize, row: usize) -> EtlResult<Cell> {
        let Some((array, idx)) = self.columns.get(col).and_then(|c| c.locate(row)) else {
            return Ok(Cell::Null);
        };
        if array.is_null(idx) {
            return Ok(Cell::Null);
        }
        extract(array, idx)
    }
}

fn extract(array: &ArrayRef, i: usize) -> EtlResult<Cell> {
    let cell = match array.data_type() {
        DataType::Boolean => Cell::Bool(array.as_boolean().value(i)),
        DataType::Int8 => Cell::Int(array.as_primitive::<Int8Type>().value(i).into()),
        DataType::Int16 => Cell::Int(array.as_primitive::<Int16Type>().value(i).into()),
        DataType::Int32 => Cell::Int(array.as_primitive::<Int32Type>().value(i).into()),
        DataType::Int64 => Cell::Int(array.as_primitive::<Int64Type>().value(i)),
        DataType::UInt8 => Cell::UInt(array.as_primitive::<UInt8Type>().value(i).into()),
        DataType::UInt16 => Cell::UInt(array.as_primitive::<UInt16Type>().value(i).into()),
        DataType::UInt32 => Cell::UInt(array.as_primitive::<UInt32Type>().value(i).into()),
        DataType::UInt64 => Cell::UInt(array.as_primitive::<UInt64Type>().value(i)),
        DataType::Float16 => Cell::Float(array.as_primitive::<Float16Type>().value(i).to_f64()),
        DataType::Float32 => Cell::Float(array.as_primitive::<Float32Type>().value(i).into()),
        DataType::Float64 => Cell::Float(array.as_primitive::<Float64Type>().value(i)),
        DataType::Utf8 => Cell::Text(array.as_string::<i32>().value(i).to_string()),
        DataType::LargeUtf8 => Cell::Text(array.as_string::<i64>().value(i).to_string()),
        DataType::Utf8View => Cell::Text(array.as_string_view().value(i).to_string()),
        DataType::Binary => Cell::Binary(array.as_binary::<i32>().value(i).to_vec()),
        DataType::LargeBinary => Cell::Binary(array.as_binary::<i64>().value(i).to_vec()),
        DataType::BinaryView => Cell::Binary(array.as_binary_view().value(i).to_vec()),
        DataType::FixedSizeBinary(_) => {
            Cell::Binary(array.as_fixed_size_binary().value(i).to_vec())
        }
        // 时间 / decimal / 字典 / 嵌套类型：交给 arrow 的显示格式
        _ => Cell::Text(
            array_value_to_string(array, i)
                .map_err(|e| EtlError::internal(format!("failed to render cell: {e}")))?,
        ),
    };
    Ok(cell)
}
