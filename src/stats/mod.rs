use std::fmt;

/// 磁盘缓存状态（GC 逐出后打印）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheReport {
    /// 缓存根目录
    pub root: String,
    /// 当前 size_bytes
    pub size_bytes: u64,
    pub high_water: u64,
    pub low_water: u64,
    /// 版本缓存条目数
    pub entries: usize,
    /// 仍在读取中的 artifact 句柄数
    pub open_readers: u64,
    /// 累计逐出的文件数 / 字节数
    pub evicted_files: u64,
    pub evicted_bytes: u64,
    /// 累计 refetch 次数
    pub refetches: u64,
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           tar2tf Cache Report                    ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ root: {}", self.root)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   size:         {:>10}                       ║",
            human_bytes(self.size_bytes)
        )?;
        writeln!(
            f,
            "║   low / high:   {:>10} / {:<10}          ║",
            human_bytes(self.low_water),
            human_bytes(self.high_water)
        )?;
        writeln!(
            f,
            "║   entries:      {:>10}                       ║",
            self.entries
        )?;
        writeln!(
            f,
            "║   open readers: {:>10}                       ║",
            self.open_readers
        )?;
        writeln!(
            f,
            "║   refetches:    {:>10}                       ║",
            self.refetches
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║   evicted:      {:>10}  ({:>10})          ║",
            self.evicted_files,
            human_bytes(self.evicted_bytes)
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
