//! TAR -> TFRecord 样本流水线
//!
//! ```text
//! archive_reader -> [transform_samples] -> sample_to_record -> record_writer
//! ```
//!
//! 各阶段都是惰性迭代器，下游拉取多少上游才读多少；`run()` 阻塞直到完成，
//! 返回第一个出现的错误。

pub mod job;
pub mod record;
pub mod sample;
pub mod transform;

use std::io::{Read, Write};

pub use job::{load_job, Conversion, Selection, TransformJob};
pub use record::{read_examples, Example, RecordReader, RecordWriter};
pub use sample::{ArchiveKind, Sample, SampleReader, SampleValue};

use crate::error::{EtlError, EtlResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub samples: u64,
    pub records: u64,
}

pub struct Pipeline<'j, R, W> {
    reader: R,
    writer: W,
    archive: ArchiveKind,
    job: Option<&'j TransformJob>,
}

impl<'j, R: Read, W: Write> Pipeline<'j, R, W> {
    /// `job == None` 为默认流水线：每个成员原样写成 bytes feature
    pub fn new(reader: R, writer: W, archive: ArchiveKind, job: Option<&'j TransformJob>) -> Self {
        Self {
            reader,
            writer,
            archive,
            job,
        }
    }

    pub fn run(self) -> EtlResult<PipelineStats> {
        let Pipeline {
            reader,
            writer,
            archive,
            job,
        } = self;

        let mut archive = tar::Archive::new(archive.wrap(reader));
        let mut records = RecordWriter::new(writer);
        let mut stats = PipelineStats::default();

        let examples = SampleReader::new(&mut archive)?
            .inspect(|s| {
                if s.is_ok() {
                    stats.samples += 1;
                }
            })
            .map(|s| match job {
                Some(job) => s.and_then(|s| transform::transform_sample(job, s)),
                None => s,
            })
            .map(|s| s.and_then(transform::sample_to_example));

        for example in examples {
            let payload = example?.encode();
            records
                .write_record(&payload)
                .map_err(|e| EtlError::internal(format!("failed to write record: {e}")))?;
        }

        stats.records = records.records();
        records
            .finish()
            .map_err(|e| EtlError::internal(format!("failed to flush records: {e}")))?;
        Ok(stats)
    }
}
