use std::collections::BTreeMap;
use std::io::Read;

use image::DynamicImage;

use crate::error::{EtlError, EtlResult};

/// 单个成员按头部 size 预分配的上限
const MAX_PREALLOC: u64 = 1 << 20;

/// 样本中的单个值
#[derive(Clone, Debug)]
pub enum SampleValue {
    /// TAR 成员的原始字节
    Bytes(Vec<u8>),
    /// Decode 之后的图像
    Image(DynamicImage),
    /// 其它任意值，写入 record 时按 JSON 编码
    Json(serde_json::Value),
}

impl SampleValue {
    pub fn kind(&self) -> &'static str {
        match self {
            SampleValue::Bytes(_) => "bytes",
            SampleValue::Image(_) => "image",
            SampleValue::Json(_) => "json",
        }
    }
}

/// 同一 basename 的 TAR 成员集合：扩展名 -> 值
#[derive(Clone, Debug, Default)]
pub struct Sample {
    pub prefix: String,
    pub values: BTreeMap<String, SampleValue>,
}

impl Sample {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SampleValue> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: SampleValue) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<SampleValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

/// 输入归档的封装格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ArchiveKind {
    #[default]
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// `archive_type` 查询参数：TAR.GZ / TARGZ / TGZ（大小写无关）选择 gzip，其它一律按 TAR
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_uppercase()).as_deref() {
            Some("TAR.GZ") | Some("TARGZ") | Some("TGZ") => ArchiveKind::TarGz,
            _ => ArchiveKind::Tar,
        }
    }

    pub fn is_gzip(self) -> bool {
        self == ArchiveKind::TarGz
    }

    /// 按需在前面套一层 gzip 解码
    pub fn wrap<'r, R: Read + 'r>(self, r: R) -> Box<dyn Read + 'r> {
        match self {
            ArchiveKind::Tar => Box::new(r),
            ArchiveKind::TarGz => Box::new(flate2::read::GzDecoder::new(r)),
        }
    }
}

/// 成员路径拆分为 (prefix, key)：`a/x.seg.png` -> (`a/x`, `seg.png`)
pub fn split_member_path(path: &str) -> Option<(&str, &str)> {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dot = path[name_start..].find('.')? + name_start;
    let (prefix, key) = (&path[..dot], &path[dot + 1..]);
    if key.is_empty() || dot == name_start {
        return None;
    }
    Some((prefix, key))
}

/// 惰性地把 TAR 成员流组装成样本：连续、同 prefix 的成员归为一个样本。
///
/// 序列有限且不可重启；读到第一个错误后停止。
pub struct SampleReader<'a, R: Read> {
    entries: tar::Entries<'a, R>,
    pending: Option<Sample>,
    done: bool,
}

impl<'a, R: Read> SampleReader<'a, R> {
    pub fn new(archive: &'a mut tar::Archive<R>) -> EtlResult<Self> {
        let entries = archive
            .entries()
            .map_err(|e| EtlError::bad_input(format!("failed to read TAR: {e}")))?;
        Ok(Self {
            entries,
            pending: None,
            done: false,
        })
    }

    fn next_sample(&mut self) -> EtlResult<Option<Sample>> {
        while let Some(entry) = self.entries.next() {
            let mut entry =
                entry.map_err(|e| EtlError::bad_input(format!("failed to read TAR entry: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry
                .path()
                .map_err(|e| EtlError::bad_input(format!("invalid TAR member path: {e}")))?
                .to_string_lossy()
                .into_owned();
            let Some((prefix, key)) = split_member_path(&path) else {
                tracing::debug!("skipping TAR member without extension: {}", path);
                continue;
            };
            let (prefix, key) = (prefix.to_string(), key.to_string());

            // 头部里的 size 不可信：预分配封顶，读完再核对长度
            let declared = entry.size();
            let mut data = Vec::with_capacity(declared.min(MAX_PREALLOC) as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| EtlError::bad_input(format!("failed to read TAR member {path}: {e}")))?;
            if data.len() as u64 != declared {
                return Err(EtlError::bad_input(format!(
                    "truncated TAR member {path}: header says {declared} bytes, got {}",
                    data.len()
                )));
            }

            match self.pending.as_mut() {
                Some(sample) if sample.prefix == prefix => {
                    sample.insert(key, SampleValue::Bytes(data));
                }
                _ => {
                    let mut next = Sample::new(prefix);
                    next.insert(key, SampleValue::Bytes(data));
                    if let Some(done) = self.pending.replace(next) {
                        return Ok(Some(done));
                    }
                }
            }
        }
        Ok(self.pending.take())
    }
}

impl<'a, R: Read> Iterator for SampleReader<'a, R> {
    type Item = EtlResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_sample() {
            Ok(Some(s)) => Some(Ok(s)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
