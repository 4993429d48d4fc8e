//! Parquet -> JSON lines / CSV / TXT 分块转换
//!
//! 行数 <= 1000 走单线程整表输出；否则按 `max(100, rows / parallelism)` 切成
//! 连续的 chunk 并发输出，再按 index 顺序合并。两条路径输出逐字节一致。

pub mod emit;
pub mod table;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use parking_lot::Mutex;
use rayon::prelude::*;

pub use table::{Cell, Column, Table};

use crate::error::{EtlError, EtlResult};

pub const CONCURRENT_THRESHOLD: usize = 1000;
pub const MIN_CHUNK_ROWS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
    Txt,
    Text,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Txt => "txt",
            OutputFormat::Text => "text",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "txt" => Ok(OutputFormat::Txt),
            "text" => Ok(OutputFormat::Text),
            other => Err(EtlError::bad_input(format!(
                "unsupported output format: {other}. Supported: json, csv, txt, text"
            ))),
        }
    }
}

/// 输出格式优先级：合法的请求参数 > 环境默认值 > json。
/// 非法的请求参数被忽略；最终值非法则报 BAD_INPUT。
pub fn resolve_format(request: Option<&str>, env_default: Option<&str>) -> EtlResult<OutputFormat> {
    if let Some(f) = request
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<OutputFormat>().ok())
    {
        return Ok(f);
    }
    match env_default.filter(|s| !s.trim().is_empty()) {
        Some(s) => s.parse(),
        None => Ok(OutputFormat::Json),
    }
}

/// 一个 chunk：`[start, end)`，index 决定合并顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkTask {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// 把 `[0, rows)` 切成连续的 chunk
pub fn chunk_tasks(rows: usize, parallelism: usize) -> Vec<ChunkTask> {
    let chunk_size = MIN_CHUNK_ROWS.max(rows / parallelism.max(1));
    (0..rows)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| ChunkTask {
            index,
            start,
            end: (start + chunk_size).min(rows),
        })
        .collect()
}

/// 持有专用 rayon 线程池的转换器（每个进程一个）
pub struct Converter {
    pool: rayon::ThreadPool,
    parallelism: usize,
}

impl Converter {
    pub fn new(parallelism: usize) -> anyhow::Result<Self> {
        let parallelism = parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("parquet-chunk-{i}"))
            .build()?;
        Ok(Self { pool, parallelism })
    }

    /// 按可用核数建池
    pub fn with_available_parallelism() -> anyhow::Result<Self> {
        Self::new(num_cpus::get())
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn convert(&self, data: Bytes, format: OutputFormat) -> EtlResult<Vec<u8>> {
        let table = Table::from_parquet(data)?;
        self.convert_table(&table, format)
    }

    pub fn convert_table(&self, table: &Table, format: OutputFormat) -> EtlResult<Vec<u8>> {
        if table.num_rows() > CONCURRENT_THRESHOLD {
            self.convert_concurrent(table, format)
        } else {
            emit::emit_table(table, format)
        }
    }

    /// 并发路径：每个 chunk 的输出写入 `results[index]`，全部成功后合并
    pub fn convert_concurrent(&self, table: &Table, format: OutputFormat) -> EtlResult<Vec<u8>> {
        let tasks = chunk_tasks(table.num_rows(), self.parallelism);
        let results = Mutex::new(vec![Vec::new(); tasks.len()]);
        tracing::debug!(
            "converting {} rows as {} in {} chunks",
            table.num_rows(),
            format,
            tasks.len()
        );

        self.pool.install(|| {
            tasks.par_iter().try_for_each(|task| -> EtlResult<()> {
                let data = emit::emit_chunk(table, format, task.start, task.end).map_err(|e| {
                    EtlError::internal(format!("chunk {} failed: {e}", task.index))
                })?;
                results.lock()[task.index] = data;
                Ok(())
            })
        })?;

        Ok(emit::merge(table, format, results.into_inner()))
    }
}
