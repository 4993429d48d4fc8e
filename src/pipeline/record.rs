use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use prost::Message;

/// TFRecord CRC mask 常量（与 TensorFlow `crc32c::Mask` 一致）
const MASK_DELTA: u32 = 0xa282_ead8;

pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// TFRecord 写入器：
///
/// ```text
/// u64 length (LE) | u32 masked_crc32c(length) | payload | u32 masked_crc32c(payload)
/// ```
pub struct RecordWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = (payload.len() as u64).to_le_bytes();
        self.inner.write_all(&len)?;
        self.inner.write_all(&masked_crc32c(&len).to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&masked_crc32c(payload).to_le_bytes())?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// TFRecord 读取器（校验两段 CRC），按记录迭代 payload
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn read_one(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len = [0u8; 8];
        match read_full(&mut self.inner, &mut len)? {
            0 => return Ok(None),
            8 => {}
            n => return Err(corrupt(format!("truncated length header ({n} bytes)"))),
        }
        let mut crc = [0u8; 4];
        self.inner.read_exact(&mut crc)?;
        if u32::from_le_bytes(crc) != masked_crc32c(&len) {
            return Err(corrupt("length crc mismatch".into()));
        }

        let n = u64::from_le_bytes(len);
        let n = usize::try_from(n).map_err(|_| corrupt(format!("record too large: {n}")))?;
        let mut payload = vec![0u8; n];
        self.inner.read_exact(&mut payload)?;
        self.inner.read_exact(&mut crc)?;
        if u32::from_le_bytes(crc) != masked_crc32c(&payload) {
            return Err(corrupt("payload crc mismatch".into()));
        }
        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_one().transpose()
    }
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn corrupt(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// `tf.train.Example`，只包含 `BytesList` feature。
///
/// key 使用 BTreeMap，编码结果与插入顺序无关（同一输入 PUT / GET 字节完全一致）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Example {
    pub features: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.features.insert(key.into(), vec![value]);
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.features
            .get(key)
            .and_then(|v| v.first())
            .map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let feature = self
            .features
            .iter()
            .map(|(key, values)| {
                let kind = proto::Kind::BytesList(proto::BytesList {
                    value: values.clone(),
                });
                (key.clone(), proto::Feature { kind: Some(kind) })
            })
            .collect();
        proto::Example {
            features: Some(proto::Features { feature }),
        }
        .encode_to_vec()
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let msg = proto::Example::decode(buf).map_err(|e| corrupt(format!("example: {e}")))?;
        let mut example = Example::new();
        for (key, feature) in msg.features.unwrap_or_default().feature {
            let values = match feature.kind {
                Some(proto::Kind::BytesList(list)) => list.value,
                // 空 BytesList 编码后与缺省值相同
                None => Vec::new(),
                Some(other) => {
                    return Err(corrupt(format!("feature {key:?}: unsupported kind {other:?}")))
                }
            };
            example.features.insert(key, values);
        }
        Ok(example)
    }
}

/// tensorflow/core/example/{example,feature}.proto 的子集
mod proto {
    use std::collections::BTreeMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Example {
        #[prost(message, optional, tag = "1")]
        pub features: Option<Features>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Features {
        #[prost(btree_map = "string, message", tag = "1")]
        pub feature: BTreeMap<String, Feature>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Feature {
        #[prost(oneof = "Kind", tags = "1, 2, 3")]
        pub kind: Option<Kind>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        BytesList(BytesList),
        #[prost(message, tag = "2")]
        FloatList(FloatList),
        #[prost(message, tag = "3")]
        Int64List(Int64List),
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct BytesList {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub value: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FloatList {
        #[prost(float, repeated, tag = "1")]
        pub value: Vec<f32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Int64List {
        #[prost(int64, repeated, tag = "1")]
        pub value: Vec<i64>,
    }
}

/// 读取整个 TFRecord 流并解码为 Example
pub fn read_examples<R: Read>(r: R) -> io::Result<Vec<Example>> {
    RecordReader::new(r)
        .map(|payload| payload.and_then(|p| Example::decode(&p)))
        .collect()
}
