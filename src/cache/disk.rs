use std::io::{self, BufWriter, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use ignore::WalkBuilder;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use super::remote::{BackingStore, ObjectId};
use super::version::VersionCache;
use crate::core::{HttpRange, OnCloseReader, TeeWriter, WriteCounter};
use crate::error::{EtlError, EtlResult};
use crate::pipeline::{ArchiveKind, Pipeline, TransformJob};
use crate::stats::CacheReport;

pub const TARGET_URL_ENV: &str = "AIS_TARGET_URL";

const GIB: u64 = 1024 * 1024 * 1024;
/// 临时根目录下的 staging 子目录；GC 不进入，对象名不能落在其中
const STAGING_DIR: &str = ".staging";

/// GC 阈值：size >= high 时触发，回收到 low 附近
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watermarks {
    pub high: u64,
    pub low: u64,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: 8 * GIB,
            low: 4 * GIB,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// 临时根目录的父目录；None 使用系统临时目录
    pub parent_dir: Option<PathBuf>,
    pub watermarks: Watermarks,
    /// 超过该年龄的文件在 GC 触发时无条件回收
    pub max_age: Duration,
    pub gc_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            parent_dir: None,
            watermarks: Watermarks::default(),
            max_age: Duration::from_secs(3600),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// 一次 fetch 的结果：已打开的 artifact 句柄（之后被 GC unlink 也不影响读取）
#[derive(Debug)]
pub struct CachedArtifact {
    pub fqn: PathBuf,
    pub file: tokio::fs::File,
    pub version: String,
    pub size: u64,
}

/// 单次 GC 的回收结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub files: u64,
    pub bytes: u64,
}

pub type ArtifactReader = OnCloseReader<tokio::io::Take<tokio::fs::File>>;

/// tar2tf 的磁盘缓存服务：持有临时根目录、版本缓存、size_bytes 和 per-FQN 锁。
///
/// 同一 FQN 的 refetch 串行（per-FQN 锁），不同 FQN 互不阻塞。
/// artifact 先写到 `<root>/.staging/<seq>.partial`，成功后 rename 覆盖 FQN，
/// 之后才更新版本缓存和 size_bytes。
pub struct ArtifactCache {
    root: tempfile::TempDir,
    config: CacheConfig,
    versions: VersionCache,
    size_bytes: AtomicU64,
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    store: Option<Arc<dyn BackingStore>>,
    job: Option<Arc<TransformJob>>,
    staging_seq: AtomicU64,

    open_readers: Arc<AtomicU64>,
    refetches: AtomicU64,
    evicted_files: AtomicU64,
    evicted_bytes: AtomicU64,
}

impl ArtifactCache {
    pub fn new(
        config: CacheConfig,
        store: Option<Arc<dyn BackingStore>>,
        job: Option<TransformJob>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.watermarks.low < config.watermarks.high,
            "cache low water ({}) must be below high water ({})",
            config.watermarks.low,
            config.watermarks.high
        );

        let mut builder = tempfile::Builder::new();
        builder.prefix("tar2tf-");
        let root = match &config.parent_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        std::fs::create_dir_all(root.path().join(STAGING_DIR))?;

        Ok(Self {
            root,
            config,
            versions: VersionCache::new(),
            size_bytes: AtomicU64::new(0),
            locks: DashMap::new(),
            store,
            job: job.map(Arc::new),
            staging_seq: AtomicU64::new(0),
            open_readers: Arc::new(AtomicU64::new(0)),
            refetches: AtomicU64::new(0),
            evicted_files: AtomicU64::new(0),
            evicted_bytes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// 进程级 job（PUT 路径与 refetch 共用）
    pub fn job(&self) -> Option<Arc<TransformJob>> {
        self.job.clone()
    }

    pub fn versions(&self) -> &VersionCache {
        &self.versions
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    pub fn fqn(&self, obj: &ObjectId) -> EtlResult<PathBuf> {
        let rel = obj.relative_path()?;
        if rel.starts_with(STAGING_DIR) {
            return Err(EtlError::bad_input(format!(
                "bucket name {:?} is reserved",
                obj.bucket
            )));
        }
        Ok(self.root().join(rel))
    }

    fn staging_dir(&self) -> PathBuf {
        self.root().join(STAGING_DIR)
    }

    fn staging_path(&self) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        self.staging_dir().join(format!("{seq}-{nanos}.partial"))
    }

    pub fn report(&self) -> CacheReport {
        CacheReport {
            root: self.root().display().to_string(),
            size_bytes: self.size_bytes(),
            high_water: self.config.watermarks.high,
            low_water: self.config.watermarks.low,
            entries: self.versions.len(),
            open_readers: self.open_readers.load(Ordering::Acquire),
            evicted_files: self.evicted_files.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            refetches: self.refetches.load(Ordering::Relaxed),
        }
    }

    fn lock_for(&self, fqn: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.entry(fqn.to_path_buf()).or_default().clone()
    }

    /// 调用方已放掉自己的 Arc 后调用：没有其它持有者就删掉条目
    fn prune_lock(&self, fqn: &Path) {
        self.locks.remove_if(fqn, |_, l| Arc::strong_count(l) == 1);
    }

    fn adjust_size(&self, previous: u64, current: u64) {
        if current >= previous {
            self.size_bytes.fetch_add(current - previous, Ordering::AcqRel);
        } else {
            self.release_size(previous - current);
        }
    }

    fn release_size(&self, bytes: u64) {
        let _ = self
            .size_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(s.saturating_sub(bytes))
            });
    }

    /// 取得与后端当前版本一致的 artifact；必要时重新转换。
    ///
    /// refetch 在独立 task 中持锁完成：请求方断开也不会留下半提交的 artifact。
    pub async fn fetch(self: &Arc<Self>, obj: &ObjectId) -> EtlResult<CachedArtifact> {
        let store = self
            .store
            .clone()
            .ok_or_else(|| EtlError::missing_env(TARGET_URL_ENV))?;
        let fqn = self.fqn(obj)?;

        let this = self.clone();
        let obj = obj.clone();
        tokio::spawn(async move { this.fetch_locked(store, obj, fqn).await }).await?
    }

    async fn fetch_locked(
        &self,
        store: Arc<dyn BackingStore>,
        obj: ObjectId,
        fqn: PathBuf,
    ) -> EtlResult<CachedArtifact> {
        let lock = self.lock_for(&fqn);
        let res = {
            let _guard = lock.lock().await;
            self.refresh(store, obj, fqn.clone()).await
        };
        drop(lock);
        self.prune_lock(&fqn);
        res
    }

    /// 持 FQN 锁执行：HEAD 比较版本，不一致时重新转换
    async fn refresh(
        &self,
        store: Arc<dyn BackingStore>,
        obj: ObjectId,
        fqn: PathBuf,
    ) -> EtlResult<CachedArtifact> {
        let remote = store.head_version(&obj).await?;
        if self.versions.equals(&fqn, &remote) {
            match open_artifact(&fqn).await {
                Ok((file, size)) => {
                    tracing::debug!("cache hit {} (version {:?})", fqn.display(), remote);
                    return Ok(CachedArtifact {
                        fqn,
                        file,
                        version: remote,
                        size,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!("cached artifact {} vanished, refetching", fqn.display());
                    self.versions.delete(&fqn);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // 只 stat，不持有旧文件句柄
        let previous = match tokio::fs::metadata(&fqn).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let cached = self.versions.get(&fqn);

        let body = store.get(&obj).await?;
        let reader = SyncIoBridge::new(body);
        let staging = self.staging_path();
        let job = self.job.clone();
        let archive = if obj.gzip {
            ArchiveKind::TarGz
        } else {
            ArchiveKind::Tar
        };

        let written = {
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || write_artifact(reader, &staging, archive, job.as_deref()))
                .await?
        };
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&staging) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        tracing::warn!("failed to remove {}: {}", staging.display(), rm);
                    }
                }
                return Err(e);
            }
        };

        let committed = async {
            if let Some(parent) = fqn.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&staging, &fqn).await
        }
        .await;
        if let Err(e) = committed {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        self.versions.put(fqn.clone(), remote.clone());
        self.adjust_size(previous, written);
        self.refetches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "refetched {}/{}: version {:?} -> {:?}, {} bytes",
            obj.bucket,
            obj.name,
            cached.unwrap_or_default(),
            remote,
            written
        );

        let (file, size) = open_artifact(&fqn).await?;
        Ok(CachedArtifact {
            fqn,
            file,
            version: remote,
            size,
        })
    }

    /// 把 artifact 定位到 range 起点，返回只读 `length` 字节的 reader；
    /// reader 关闭时 open_readers 减一。
    pub async fn open_window(
        &self,
        artifact: CachedArtifact,
        range: HttpRange,
    ) -> EtlResult<ArtifactReader> {
        let mut file = artifact.file;
        file.seek(SeekFrom::Start(range.start)).await?;

        let readers = self.open_readers.clone();
        readers.fetch_add(1, Ordering::AcqRel);
        Ok(OnCloseReader::new(file.take(range.length), move || {
            readers.fetch_sub(1, Ordering::AcqRel);
        }))
    }

    pub fn collect_garbage(&self) -> GcOutcome {
        self.collect_garbage_at(SystemTime::now())
    }

    /// 一次 GC：size < high 时什么都不做；否则按 mtime 从旧到新（同 mtime 按路径）遍历，
    /// 跳过 `size <= low && age < max_age` 的文件，其余 unlink 并扣减 size、删除版本条目。
    ///
    /// 跳过条件用 `<=` 而不是 `<`：size 恰好回落到 low 时只再回收超龄文件。
    /// staging 目录和正在 refetch 的 FQN 不动。
    pub fn collect_garbage_at(&self, now: SystemTime) -> GcOutcome {
        let Watermarks { high, low } = self.config.watermarks;
        let mut outcome = GcOutcome::default();
        if self.size_bytes() < high {
            return outcome;
        }

        let staging = self.staging_dir();
        let mut files: Vec<(SystemTime, PathBuf, u64)> = WalkBuilder::new(self.root())
            .standard_filters(false)
            .filter_entry(move |e| e.path() != staging.as_path())
            .build()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::warn!("gc walk error: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
                Some((mtime, e.into_path(), meta.len()))
            })
            .collect();
        files.sort();

        for (mtime, path, size) in files {
            let age = now.duration_since(mtime).unwrap_or_default();
            if self.size_bytes() <= low && age < self.config.max_age {
                continue;
            }

            // 持锁期间 fetch 会等待，放锁后看到版本条目已删而重新转换
            let lock = self.lock_for(&path);
            let evicted = match lock.try_lock() {
                Ok(_guard) => self.evict(&path, size),
                Err(_) => {
                    tracing::debug!("gc skipping busy {}", path.display());
                    false
                }
            };
            drop(lock);
            self.prune_lock(&path);

            if evicted {
                outcome.files += 1;
                outcome.bytes += size;
            }
        }

        self.evicted_files.fetch_add(outcome.files, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(outcome.bytes, Ordering::Relaxed);
        outcome
    }

    fn evict(&self, path: &Path, size: u64) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("gc failed to remove {}: {}", path.display(), e);
                return false;
            }
        }
        self.release_size(size);
        self.versions.delete(path);
        true
    }

    /// 启动后台 GC：只持有 Weak，服务被 drop 后自然退出
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let res = tokio::task::spawn_blocking(move || {
                    let outcome = cache.collect_garbage();
                    (outcome, cache.report())
                })
                .await;
                match res {
                    Ok((outcome, report)) if outcome.files > 0 => {
                        tracing::info!(
                            "gc evicted {} files ({} bytes)\n{}",
                            outcome.files,
                            outcome.bytes,
                            report
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("gc task failed: {}", e),
                }
            }
            tracing::debug!("cache dropped, gc loop exiting");
        })
    }
}

async fn open_artifact(fqn: &Path) -> io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(fqn).await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}

/// 阻塞线程内：源 TAR -> pipeline -> (staging 文件 + 计数器)
fn write_artifact<R: io::Read>(
    reader: R,
    staging: &Path,
    archive: ArchiveKind,
    job: Option<&TransformJob>,
) -> EtlResult<u64> {
    let file = std::fs::File::create(staging)?;
    let counter = WriteCounter::new();
    let sink = TeeWriter::new(BufWriter::new(file), &counter);
    let stats = Pipeline::new(reader, sink, archive, job).run()?;
    tracing::debug!(
        "wrote {} records ({} samples) to {}",
        stats.records,
        stats.samples,
        staging.display()
    );
    Ok(counter.size())
}
