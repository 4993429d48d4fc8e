use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EtlError, EtlResult};

/// 单个样本级转换（封闭集合，按顺序执行）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Conversion {
    /// bytes -> image
    Decode { ext_name: String },
    /// angle == 0 表示每次调用随机选取 [0, 100) 度
    Rotate {
        ext_name: String,
        #[serde(default)]
        angle: f64,
    },
    /// 线性插值缩放到 [w, h]
    Resize { ext_name: String, dst_size: Vec<u32> },
    /// dst -> [src...]：第一个存在的 src 移到 dst
    Rename { renames: BTreeMap<String, Vec<String>> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub ext_name: String,
}

/// 进程级、初始化后不可变的转换任务
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformJob {
    #[serde(default)]
    pub conversions: Vec<Conversion>,
    #[serde(default)]
    pub selections: Vec<Selection>,
}

impl TransformJob {
    pub fn from_json(spec: &[u8]) -> EtlResult<Self> {
        let job: TransformJob = serde_json::from_slice(spec)
            .map_err(|e| EtlError::bad_input(format!("invalid transform spec: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    fn validate(&self) -> EtlResult<()> {
        for conv in &self.conversions {
            match conv {
                Conversion::Resize { ext_name, dst_size } => {
                    if dst_size.len() != 2 || dst_size.iter().any(|&d| d == 0) {
                        return Err(EtlError::bad_input(format!(
                            "Resize of {ext_name:?}: dst_size must be two positive integers, got {dst_size:?}"
                        )));
                    }
                }
                Conversion::Rotate { ext_name, angle } if !angle.is_finite() => {
                    return Err(EtlError::bad_input(format!(
                        "Rotate of {ext_name:?}: angle must be finite"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 空 selections 表示全选
    pub fn selects_all(&self) -> bool {
        self.selections.is_empty()
    }
}

/// 启动时加载 job：inline 与文件二选一
pub fn load_job(spec: Option<&str>, spec_file: Option<&Path>) -> anyhow::Result<Option<TransformJob>> {
    let raw = match (spec, spec_file) {
        (Some(_), Some(_)) => anyhow::bail!("specify either spec or spec-file"),
        (Some(s), None) => s.as_bytes().to_vec(),
        (None, Some(p)) => std::fs::read(p)
            .map_err(|e| anyhow::anyhow!("failed to read spec file {}: {}", p.display(), e))?,
        (None, None) => return Ok(None),
    };
    let job = TransformJob::from_json(&raw)?;
    tracing::info!(
        "loaded transform job: {} conversions, {} selections",
        job.conversions.len(),
        job.selections.len()
    );
    Ok(Some(job))
}
