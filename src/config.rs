//! 两个 worker 的命令行 / 环境变量配置

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::cache::{CacheConfig, Watermarks};
use crate::pipeline::{load_job, TransformJob};

/// 兼容单横线写法的长参数（`-spec`），解析前改写成 `--` 形式
const SINGLE_DASH_FLAGS: &[&str] = &["spec", "spec-file"];

pub fn normalize_single_dash_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let Some(s) = arg.to_str() else {
                return arg;
            };
            let Some(rest) = s.strip_prefix('-').filter(|r| !r.starts_with('-')) else {
                return arg;
            };
            let name = rest.split('=').next().unwrap_or(rest);
            if SINGLE_DASH_FLAGS.contains(&name) {
                OsString::from(format!("-{s}"))
            } else {
                arg
            }
        })
        .collect()
}

/// `1024`、`512MiB`、`8GiB`、`2 GB` ...（`KiB/MiB/GiB` 为 1024 进制，`KB/MB/GB` 为 1000 进制）
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    byte_unit::Byte::from_str(s.trim())
        .map(|b| b.as_u64())
        .map_err(|e| format!("invalid byte size {s:?}: {e}"))
}

/// `RUST_LOG` 优先，默认 info
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// tar2tf：TAR -> TFRecord，带磁盘缓存
#[derive(Debug, Clone, Parser)]
#[command(name = "tar2tf", version, about = "TAR to TFRecord transformer with an on-disk artifact cache")]
pub struct Tar2TfArgs {
    /// 监听地址
    #[arg(short = 'l', default_value = "localhost")]
    pub listen: String,

    /// 监听端口
    #[arg(short = 'p', default_value_t = 8000)]
    pub port: u16,

    /// 内联 job spec（JSON）
    #[arg(long, conflicts_with = "spec_file")]
    pub spec: Option<String>,

    /// 从文件读取 job spec
    #[arg(long = "spec-file")]
    pub spec_file: Option<PathBuf>,

    /// 后端对象存储地址
    #[arg(long, env = "AIS_TARGET_URL")]
    pub target_url: Option<String>,

    /// GC 触发线
    #[arg(long, env = "TAR2TF_CACHE_HIGH_WATER", default_value = "8GiB", value_parser = parse_byte_size)]
    pub cache_high_water: u64,

    /// GC 回收目标，必须小于 high water
    #[arg(long, env = "TAR2TF_CACHE_LOW_WATER", default_value = "4GiB", value_parser = parse_byte_size)]
    pub cache_low_water: u64,

    /// 秒；超过该年龄的 artifact 在 GC 时总是回收
    #[arg(long, default_value_t = 3600)]
    pub cache_max_age: u64,

    /// 秒
    #[arg(long, default_value_t = 60)]
    pub gc_interval: u64,

    /// 临时缓存根目录的父目录（默认系统临时目录）
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// 秒；收到退出信号后等待在途请求的上限
    #[arg(long, default_value_t = 10)]
    pub drain_timeout: u64,
}

impl Tar2TfArgs {
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_single_dash_flags(std::env::args_os()))
    }

    pub fn target_url(&self) -> Option<&str> {
        non_empty(&self.target_url)
    }

    pub fn cache_config(&self) -> anyhow::Result<CacheConfig> {
        anyhow::ensure!(
            self.cache_low_water < self.cache_high_water,
            "--cache-low-water ({}) must be below --cache-high-water ({})",
            self.cache_low_water,
            self.cache_high_water
        );
        anyhow::ensure!(self.gc_interval > 0, "--gc-interval must be positive");
        Ok(CacheConfig {
            parent_dir: self.cache_dir.clone(),
            watermarks: Watermarks {
                high: self.cache_high_water,
                low: self.cache_low_water,
            },
            max_age: Duration::from_secs(self.cache_max_age),
            gc_interval: Duration::from_secs(self.gc_interval),
        })
    }

    pub fn load_job(&self) -> anyhow::Result<Option<TransformJob>> {
        load_job(self.spec.as_deref(), self.spec_file.as_deref())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

/// parquet-parser：parquet -> json / csv / txt
#[derive(Debug, Clone, Parser)]
#[command(name = "parquet-parser", version, about = "Parquet to JSON lines / CSV / text converter")]
pub struct ParquetArgs {
    #[arg(short = 'l', default_value = "0.0.0.0")]
    pub listen: String,

    #[arg(short = 'p', default_value_t = 8000)]
    pub port: u16,

    /// 默认输出格式（json / csv / txt / text）
    #[arg(long, env = "OUTPUT_FORMAT")]
    pub output_format: Option<String>,

    /// 拉取模式（GET /<bucket>/<name>）使用的后端地址
    #[arg(long, env = "AIS_TARGET_URL")]
    pub target_url: Option<String>,

    #[arg(long, default_value_t = 10)]
    pub drain_timeout: u64,
}

impl ParquetArgs {
    pub fn parse_args() -> Self {
        Self::parse_from(normalize_single_dash_flags(std::env::args_os()))
    }

    pub fn output_format(&self) -> Option<&str> {
        non_empty(&self.output_format)
    }

    pub fn target_url(&self) -> Option<&str> {
        non_empty(&self.target_url)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}
