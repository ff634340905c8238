//! The record batch, Kafka's unit of storage and transfer (message format v2).
//!
//! # References
//! - <https://kafka.apache.org/documentation/#recordbatch>
//! - [KIP-98](https://cwiki.apache.org/confluence/display/KAFKA/KIP-98+-+Exactly+Once+Delivery+and+Transactional+Messaging)

use std::io::{Cursor, Read, Write};

use super::{
    primitives::{Varint, Varlong},
    traits::{ReadError, ReadType, WriteError, WriteType},
    vec_builder::VecBuilder,
};

/// The only message format we understand.
const MAGIC: i8 = 2;

/// Size of the batch header fields that follow `batch_length` and precede `attributes`.
const HEADER_AFTER_LENGTH: usize = 4 + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

/// A single record inside a batch, with its timestamp and offset stored relative to the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<RecordHeader>,
}

fn read_varint_bytes<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ReadError> {
    match Varint::read(reader)?.0 {
        -1 => Ok(None),
        l if l < -1 => Err(ReadError::Malformed(
            format!("Invalid negative length for record field: {l}").into(),
        )),
        l => Ok(Some(
            VecBuilder::new(usize::try_from(l)?)
                .read_exact(reader)?
                .into(),
        )),
    }
}

fn write_varint_bytes<W: Write>(writer: &mut W, data: Option<&[u8]>) -> Result<(), WriteError> {
    match data {
        Some(data) => {
            Varint(i32::try_from(data.len())?).write(writer)?;
            writer.write_all(data)?;
        }
        None => Varint(-1).write(writer)?,
    }
    Ok(())
}

impl<R: Read> ReadType<R> for Record {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = usize::try_from(Varint::read(reader)?.0)?;
        let body: Vec<u8> = VecBuilder::new(len).read_exact(reader)?.into();
        let mut body = Cursor::new(body);

        // attributes are unused by the v2 format
        i8::read(&mut body)?;

        let timestamp_delta = Varlong::read(&mut body)?.0;
        let offset_delta = Varint::read(&mut body)?.0;
        let key = read_varint_bytes(&mut body)?;
        let value = read_varint_bytes(&mut body)?;

        let count = usize::try_from(Varint::read(&mut body)?.0)?;
        let mut headers = VecBuilder::new(count);
        for _ in 0..count {
            let key = read_varint_bytes(&mut body)?
                .ok_or_else(|| ReadError::Malformed("Record header key is null".into()))?;
            let key = String::from_utf8(key).map_err(|e| ReadError::Malformed(Box::new(e)))?;
            let value = read_varint_bytes(&mut body)?.unwrap_or_default();
            headers.push(RecordHeader { key, value });
        }

        if body.position() != len as u64 {
            return Err(ReadError::Malformed(
                format!(
                    "Record length mismatch: announced {len} bytes, used {}",
                    body.position()
                )
                .into(),
            ));
        }

        Ok(Self {
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers: headers.into(),
        })
    }
}

impl<W: Write> WriteType<W> for Record {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let mut body = vec![];
        0i8.write(&mut body)?;
        Varlong(self.timestamp_delta).write(&mut body)?;
        Varint(self.offset_delta).write(&mut body)?;
        write_varint_bytes(&mut body, self.key.as_deref())?;
        write_varint_bytes(&mut body, self.value.as_deref())?;

        Varint(i32::try_from(self.headers.len())?).write(&mut body)?;
        for header in &self.headers {
            write_varint_bytes(&mut body, Some(header.key.as_bytes()))?;
            write_varint_bytes(&mut body, Some(&header.value))?;
        }

        Varint(i32::try_from(body.len())?).write(writer)?;
        writer.write_all(&body)?;
        Ok(())
    }
}

/// Transaction markers written by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlBatchRecord {
    Abort,
    Commit,
}

impl ControlBatchRecord {
    fn from_record(record: &Record) -> Result<Self, ReadError> {
        let key = record
            .key
            .as_deref()
            .ok_or_else(|| ReadError::Malformed("Control record without key".into()))?;
        let mut key = Cursor::new(key);

        let version = i16::read(&mut key)?;
        if version != 0 {
            return Err(ReadError::Malformed(
                format!("Unknown control record version: {version}").into(),
            ));
        }

        match i16::read(&mut key)? {
            0 => Ok(Self::Abort),
            1 => Ok(Self::Commit),
            t => Err(ReadError::Malformed(
                format!("Unknown control record type: {t}").into(),
            )),
        }
    }

    fn to_record(self) -> Record {
        let t: i16 = match self {
            Self::Abort => 0,
            Self::Commit => 1,
        };
        let mut key = 0i16.to_be_bytes().to_vec();
        key.extend_from_slice(&t.to_be_bytes());

        Record {
            timestamp_delta: 0,
            offset_delta: 0,
            key: Some(key),
            value: None,
            headers: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBatchOrRecords {
    ControlBatch(ControlBatchRecord),
    Records(Vec<Record>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordBatchCompression {
    NoCompression,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl RecordBatchCompression {
    fn from_attributes(attributes: i16) -> Result<Self, ReadError> {
        match attributes & 0x7 {
            0 => Ok(Self::NoCompression),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            3 => Ok(Self::Lz4),
            4 => Ok(Self::Zstd),
            c => Err(ReadError::Malformed(
                format!("Unknown compression type: {c}").into(),
            )),
        }
    }

    fn attribute_bits(self) -> i16 {
        match self {
            Self::NoCompression => 0,
            Self::Gzip => 1,
            Self::Snappy => 2,
            Self::Lz4 => 3,
            Self::Zstd => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordBatchTimestampType {
    CreateTime,
    LogAppendTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: ControlBatchOrRecords,
    pub compression: RecordBatchCompression,
    pub is_transactional: bool,
    pub timestamp_type: RecordBatchTimestampType,
}

impl<R: Read> ReadType<R> for RecordBatch {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let base_offset = i64::read(reader)?;
        let batch_length = usize::try_from(i32::read(reader)?)?;
        if batch_length < HEADER_AFTER_LENGTH {
            return Err(ReadError::Malformed(
                format!("Record batch too short: {batch_length} bytes").into(),
            ));
        }

        let batch: Vec<u8> = VecBuilder::new(batch_length).read_exact(reader)?.into();
        let mut header = Cursor::new(&batch[..HEADER_AFTER_LENGTH]);

        let partition_leader_epoch = i32::read(&mut header)?;
        let magic = i8::read(&mut header)?;
        if magic != MAGIC {
            return Err(ReadError::Malformed(
                format!("Unsupported message format (magic {magic})").into(),
            ));
        }

        let crc = u32::read(&mut header)?;
        let body = &batch[HEADER_AFTER_LENGTH..];
        let actual = crc32c::crc32c(body);
        if crc != actual {
            return Err(ReadError::Malformed(
                format!("CRC error, got 0x{actual:x}, expected 0x{crc:x}").into(),
            ));
        }

        let mut body = Cursor::new(body);
        let attributes = i16::read(&mut body)?;
        let compression = RecordBatchCompression::from_attributes(attributes)?;
        let timestamp_type = if attributes & 0x8 == 0 {
            RecordBatchTimestampType::CreateTime
        } else {
            RecordBatchTimestampType::LogAppendTime
        };
        let is_transactional = attributes & 0x10 != 0;
        let is_control = attributes & 0x20 != 0;

        let last_offset_delta = i32::read(&mut body)?;
        let first_timestamp = i64::read(&mut body)?;
        let max_timestamp = i64::read(&mut body)?;
        let producer_id = i64::read(&mut body)?;
        let producer_epoch = i16::read(&mut body)?;
        let base_sequence = i32::read(&mut body)?;
        let count = usize::try_from(i32::read(&mut body)?)?;

        let pos = usize::try_from(body.position())?;
        let data = decompress(compression, &body.into_inner()[pos..])?;
        let mut data = Cursor::new(data);

        let mut records = VecBuilder::new(count);
        for _ in 0..count {
            records.push(Record::read(&mut data)?);
        }
        let records: Vec<Record> = records.into();

        let records = if is_control {
            match records.as_slice() {
                [record] => ControlBatchOrRecords::ControlBatch(ControlBatchRecord::from_record(
                    record,
                )?),
                _ => {
                    return Err(ReadError::Malformed(
                        format!("Control batch with {} records", records.len()).into(),
                    ))
                }
            }
        } else {
            ControlBatchOrRecords::Records(records)
        };

        Ok(Self {
            base_offset,
            partition_leader_epoch,
            last_offset_delta,
            first_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
            compression,
            is_transactional,
            timestamp_type,
        })
    }
}

impl<W: Write> WriteType<W> for RecordBatch {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let mut attributes = self.compression.attribute_bits();
        if self.timestamp_type == RecordBatchTimestampType::LogAppendTime {
            attributes |= 0x8;
        }
        if self.is_transactional {
            attributes |= 0x10;
        }

        let records = match &self.records {
            ControlBatchOrRecords::ControlBatch(control) => {
                attributes |= 0x20;
                vec![control.to_record()]
            }
            ControlBatchOrRecords::Records(records) => records.clone(),
        };

        let mut data = vec![];
        for record in &records {
            record.write(&mut data)?;
        }
        let data = compress(self.compression, data)?;

        let mut body = vec![];
        attributes.write(&mut body)?;
        self.last_offset_delta.write(&mut body)?;
        self.first_timestamp.write(&mut body)?;
        self.max_timestamp.write(&mut body)?;
        self.producer_id.write(&mut body)?;
        self.producer_epoch.write(&mut body)?;
        self.base_sequence.write(&mut body)?;
        i32::try_from(records.len())?.write(&mut body)?;
        body.extend_from_slice(&data);

        self.base_offset.write(writer)?;
        i32::try_from(HEADER_AFTER_LENGTH + body.len())?.write(writer)?;
        self.partition_leader_epoch.write(writer)?;
        MAGIC.write(writer)?;
        crc32c::crc32c(&body).write(writer)?;
        writer.write_all(&body)?;

        Ok(())
    }
}

#[cfg(feature = "compression-snappy")]
const JAVA_SNAPPY_MAGIC: [u8; 8] = [0x82, b'S', b'N', b'A', b'P', b'P', b'Y', 0];

fn unsupported(compression: RecordBatchCompression) -> Box<dyn std::error::Error + Send + Sync> {
    format!("{compression:?} compression is not enabled in this build").into()
}

fn decompress(compression: RecordBatchCompression, data: &[u8]) -> Result<Vec<u8>, ReadError> {
    match compression {
        RecordBatchCompression::NoCompression => Ok(data.to_vec()),
        #[cfg(feature = "compression-gzip")]
        RecordBatchCompression::Gzip => {
            let mut out = vec![];
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "compression-snappy")]
        RecordBatchCompression::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            let raw = |decoder: &mut snap::raw::Decoder, chunk: &[u8]| {
                decoder
                    .decompress_vec(chunk)
                    .map_err(|e| ReadError::Malformed(Box::new(e)))
            };

            if !data.starts_with(&JAVA_SNAPPY_MAGIC) {
                return raw(&mut decoder, data);
            }

            // xerial framing as used by the java client: magic, version, compat version, then sized chunks
            let chunks = data
                .get(JAVA_SNAPPY_MAGIC.len() + 8..)
                .ok_or_else(|| ReadError::Malformed("Truncated java snappy header".into()))?;
            let mut cursor = Cursor::new(chunks);
            let mut out = vec![];
            while (cursor.position() as usize) < cursor.get_ref().len() {
                let chunk = Vec::<u8>::read(&mut cursor)?;
                out.extend(raw(&mut decoder, &chunk)?);
            }
            Ok(out)
        }
        #[cfg(feature = "compression-lz4")]
        RecordBatchCompression::Lz4 => {
            let mut out = vec![];
            lz4::Decoder::new(data)?.read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "compression-zstd")]
        RecordBatchCompression::Zstd => Ok(zstd::stream::decode_all(data)?),
        #[allow(unreachable_patterns)]
        other => Err(ReadError::Malformed(unsupported(other))),
    }
}

fn compress(compression: RecordBatchCompression, data: Vec<u8>) -> Result<Vec<u8>, WriteError> {
    match compression {
        RecordBatchCompression::NoCompression => Ok(data),
        #[cfg(feature = "compression-gzip")]
        RecordBatchCompression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
        #[cfg(feature = "compression-snappy")]
        RecordBatchCompression::Snappy => snap::raw::Encoder::new()
            .compress_vec(&data)
            .map_err(|e| WriteError::Malformed(Box::new(e))),
        #[cfg(feature = "compression-lz4")]
        RecordBatchCompression::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new().build(Vec::new())?;
            encoder.write_all(&data)?;
            let (out, result) = encoder.finish();
            result?;
            Ok(out)
        }
        #[cfg(feature = "compression-zstd")]
        RecordBatchCompression::Zstd => Ok(zstd::stream::encode_all(data.as_slice(), 0)?),
        #[allow(unreachable_patterns)]
        other => Err(WriteError::Malformed(unsupported(other))),
    }
}
