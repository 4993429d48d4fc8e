use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// FQN -> 后端版本号。读并行、写串行。
///
/// 不变量：条目 `(fqn, v)` 存在时，fqn 处的文件就是版本 v 的转换结果
/// （只在文件提交成功后 `put`，GC 删除文件时 `delete`）。
#[derive(Debug, Default)]
pub struct VersionCache {
    inner: RwLock<HashMap<PathBuf, String>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fqn: &Path) -> Option<String> {
        self.inner.read().get(fqn).cloned()
    }

    pub fn put(&self, fqn: PathBuf, version: String) {
        self.inner.write().insert(fqn, version);
    }

    pub fn delete(&self, fqn: &Path) -> Option<String> {
        self.inner.write().remove(fqn)
    }

    pub fn equals(&self, fqn: &Path, version: &str) -> bool {
        self.inner
            .read()
            .get(fqn)
            .map(|v| v == version)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
