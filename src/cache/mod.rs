//! tar2tf 的 artifact 缓存
//!
//! - `version`：FQN -> 后端版本号
//! - `disk`：临时根目录下的 artifact 文件、size_bytes 记账、后台 GC
//! - `remote`：后端对象存储（HEAD 取版本、GET 取内容）

pub mod disk;
pub mod remote;
pub mod version;

pub use disk::{
    ArtifactCache, ArtifactReader, CacheConfig, CachedArtifact, GcOutcome, Watermarks,
    TARGET_URL_ENV,
};
pub use remote::{BackingStore, HttpStore, ObjectId, ObjectReader};
pub use version::VersionCache;
