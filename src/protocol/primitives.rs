//! Primitive types.
//!
//! Only the non-flexible encodings are implemented; none of the message versions this crate speaks use compact
//! types or tagged fields.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_types>

use std::io::{Cursor, Read, Write};

use integer_encoding::{VarIntReader, VarIntWriter};

use super::{
    record::RecordBatch,
    traits::{ReadError, ReadType, WriteError, WriteType},
    vec_builder::VecBuilder,
};

impl<R: Read> ReadType<R> for bool {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        // any non-zero value is considered true
        Ok(i8::read(reader)? != 0)
    }
}

impl<W: Write> WriteType<W> for bool {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        i8::from(*self).write(writer)
    }
}

macro_rules! fixed_width_int {
    ($t:ty) => {
        impl<R: Read> ReadType<R> for $t {
            fn read(reader: &mut R) -> Result<Self, ReadError> {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                reader.read_exact(&mut buf)?;
                Ok(<$t>::from_be_bytes(buf))
            }
        }

        impl<W: Write> WriteType<W> for $t {
            fn write(&self, writer: &mut W) -> Result<(), WriteError> {
                writer.write_all(&self.to_be_bytes())?;
                Ok(())
            }
        }
    };
}

fixed_width_int!(i8);
fixed_width_int!(i16);
fixed_width_int!(i32);
fixed_width_int!(i64);
fixed_width_int!(u32);

/// Represents an integer between `-2^31` and `2^31-1` inclusive.
///
/// Encoding follows the variable-length zig-zag encoding from Google Protocol Buffers.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Varint(pub i32);

impl<R: Read> ReadType<R> for Varint {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        // read 64bit and use a checked downcast, so that oversized values are reported instead of truncated
        let i: i64 = reader.read_varint()?;
        Ok(Self(i32::try_from(i)?))
    }
}

impl<W: Write> WriteType<W> for Varint {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_varint(self.0)?;
        Ok(())
    }
}

/// Represents an integer between `-2^63` and `2^63-1` inclusive.
///
/// Encoding follows the variable-length zig-zag encoding from Google Protocol Buffers.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Varlong(pub i64);

impl<R: Read> ReadType<R> for Varlong {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        Ok(Self(reader.read_varint()?))
    }
}

impl<W: Write> WriteType<W> for Varlong {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        writer.write_varint(self.0)?;
        Ok(())
    }
}

fn read_str<R: Read>(reader: &mut R, len: usize) -> Result<String, ReadError> {
    let buf = VecBuilder::new(len).read_exact(reader)?;
    String::from_utf8(buf.into()).map_err(|e| ReadError::Malformed(Box::new(e)))
}

// STRING
impl<R: Read> ReadType<R> for String {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = i16::read(reader)?;
        let len = usize::try_from(len).map_err(|e| ReadError::Malformed(Box::new(e)))?;
        read_str(reader, len)
    }
}

impl<W: Write> WriteType<W> for String {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        i16::try_from(self.len())?.write(writer)?;
        writer.write_all(self.as_bytes())?;
        Ok(())
    }
}

// NULLABLE_STRING
impl<R: Read> ReadType<R> for Option<String> {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        match i16::read(reader)? {
            -1 => Ok(None),
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for nullable string: {l}").into(),
            )),
            l => Ok(Some(read_str(reader, usize::try_from(l)?)?)),
        }
    }
}

impl<W: Write> WriteType<W> for Option<String> {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match self {
            Some(s) => s.write(writer),
            None => (-1i16).write(writer),
        }
    }
}

// BYTES
impl<R: Read> ReadType<R> for Vec<u8> {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let len = i32::read(reader)?;
        let len = usize::try_from(len).map_err(|_| {
            ReadError::Malformed(format!("Invalid length for bytes: {len}").into())
        })?;
        Ok(VecBuilder::new(len).read_exact(reader)?.into())
    }
}

impl<W: Write> WriteType<W> for Vec<u8> {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        i32::try_from(self.len())?.write(writer)?;
        writer.write_all(self)?;
        Ok(())
    }
}

// NULLABLE_BYTES
impl<R: Read> ReadType<R> for Option<Vec<u8>> {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        match i32::read(reader)? {
            -1 => Ok(None),
            l if l < -1 => Err(ReadError::Malformed(
                format!("Invalid negative length for nullable bytes: {l}").into(),
            )),
            l => Ok(Some(
                VecBuilder::new(usize::try_from(l)?)
                    .read_exact(reader)?
                    .into(),
            )),
        }
    }
}

impl<W: Write> WriteType<W> for Option<Vec<u8>> {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        match self {
            Some(buf) => buf.write(writer),
            None => (-1i32).write(writer),
        }
    }
}

// ARRAY of primitives. A null array reads as empty.
macro_rules! primitive_array {
    ($t:ty) => {
        impl<R: Read> ReadType<R> for Vec<$t> {
            fn read(reader: &mut R) -> Result<Self, ReadError> {
                let len = i32::read(reader)?;
                if len == -1 {
                    return Ok(vec![]);
                }

                let len = usize::try_from(len)?;
                let mut res = VecBuilder::new(len);
                for _ in 0..len {
                    res.push(<$t>::read(reader)?);
                }

                Ok(res.into())
            }
        }

        impl<W: Write> WriteType<W> for Vec<$t> {
            fn write(&self, writer: &mut W) -> Result<(), WriteError> {
                i32::try_from(self.len())?.write(writer)?;
                for elmt in self {
                    elmt.write(writer)?;
                }

                Ok(())
            }
        }
    };
}

primitive_array!(i32);
primitive_array!(String);

/// Represents a sequence of Kafka records as NULLABLE_BYTES.
///
/// Only message format v2 ([KIP-98]) is supported. During `Produce` this holds exactly one batch, during `Fetch`
/// it may hold zero or more, and the last one may be cut off half-way when the broker hits the partition size
/// limit ([KIP-74]).
///
/// [KIP-74]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-74%3A+Add+Fetch+Response+Size+Limit+in+Bytes
/// [KIP-98]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-98+-+Exactly+Once+Delivery+and+Transactional+Messaging
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Records(pub Vec<RecordBatch>);

impl<R: Read> ReadType<R> for Records {
    fn read(reader: &mut R) -> Result<Self, ReadError> {
        let buf = Option::<Vec<u8>>::read(reader)?.unwrap_or_default();
        let len = u64::try_from(buf.len())?;
        let mut buf = Cursor::new(buf);

        let mut batches = vec![];
        while buf.position() < len {
            match RecordBatch::read(&mut buf) {
                Ok(batch) => batches.push(batch),
                Err(ReadError::IO(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // the trailing batch got cut off by the fetch size limit
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self(batches))
    }
}

impl<W: Write> WriteType<W> for Records {
    fn write(&self, writer: &mut W) -> Result<(), WriteError> {
        let mut buf = vec![];
        for batch in &self.0 {
            batch.write(&mut buf)?;
        }
        Some(buf).write(writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::protocol::record::{
        ControlBatchOrRecords, RecordBatchCompression, RecordBatchTimestampType,
    };

    #[test]
    fn test_boolean_decode() {
        assert!(!bool::read(&mut Cursor::new(vec![0])).unwrap());

        for v in [1, 35, 255] {
            assert!(bool::read(&mut Cursor::new(vec![v])).unwrap());
        }
    }

    #[test]
    fn test_int_big_endian() {
        let mut buf = vec![];
        0x0102_0304i32.write(&mut buf).unwrap();
        (-2i16).write(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0xff, 0xfe]);
    }

    #[test]
    fn test_varint_special_values() {
        // zig-zag: 0 -> 0, -1 -> 1, 1 -> 2, -2 -> 3
        for (v, want) in [(0, vec![0x00]), (-1, vec![0x01]), (1, vec![0x02]), (-2, vec![0x03])] {
            let mut data = vec![];
            Varint(v).write(&mut data).unwrap();
            assert_eq!(data, want, "{v}");
        }

        for v in [300, 2147483647, -2147483648] {
            let mut data = vec![];
            Varint(v).write(&mut data).unwrap();
            assert_eq!(Varint::read(&mut Cursor::new(data)).unwrap().0, v);
        }
    }

    #[test]
    fn test_varint_read_read_overflow() {
        let mut buf = Cursor::new(vec![0xffu8; 11]);
        assert_matches!(Varint::read(&mut buf).unwrap_err(), ReadError::IO(_));
    }

    #[test]
    fn test_varint_read_downcast_overflow() {
        // valid 64bit varint that does not fit into 32bit
        let mut data = vec![0xffu8; 9];
        data.push(0x00);

        let err = Varint::read(&mut Cursor::new(data)).unwrap_err();
        assert_matches!(err, ReadError::Overflow(_));
    }

    #[test]
    fn test_varlong_extremes() {
        for v in [i64::MIN, i64::MAX] {
            let mut data = vec![];
            Varlong(v).write(&mut data).unwrap();
            assert_eq!(Varlong::read(&mut Cursor::new(data)).unwrap().0, v);
        }
    }

    #[test]
    fn test_string_blowup_memory() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        i16::MAX.write(&mut buf).unwrap();
        buf.set_position(0);

        assert_matches!(String::read(&mut buf).unwrap_err(), ReadError::IO(_));
    }

    #[test]
    fn test_nullable_string_read_negative_length() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        (-2i16).write(&mut buf).unwrap();
        buf.set_position(0);

        let err = Option::<String>::read(&mut buf).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed data: Invalid negative length for nullable string: -2",
        );
    }

    #[test]
    fn test_nullable_string_null() {
        let mut buf = vec![];
        Option::<String>::None.write(&mut buf).unwrap();
        assert_eq!(buf, [0xff, 0xff]);
        assert_eq!(Option::<String>::read(&mut Cursor::new(buf)).unwrap(), None);
    }

    #[test]
    fn test_nullable_bytes_blowup_memory() {
        let mut buf = Cursor::new(Vec::<u8>::new());
        i32::MAX.write(&mut buf).unwrap();
        buf.set_position(0);

        assert_matches!(Option::<Vec<u8>>::read(&mut buf).unwrap_err(), ReadError::IO(_));
    }

    #[test]
    fn test_null_array_reads_empty() {
        let buf = (-1i32).to_be_bytes().to_vec();
        assert!(Vec::<i32>::read(&mut Cursor::new(buf)).unwrap().is_empty());
    }

    #[test]
    fn test_records_partial() {
        // fetch responses may cut off the last batch
        let batch_1 = record_batch(1);
        let batch_2 = record_batch(2);

        let mut buf = vec![];
        batch_1.write(&mut buf).unwrap();
        batch_2.write(&mut buf).unwrap();
        let inner = buf[..buf.len() - 1].to_vec();

        let mut buf = vec![];
        Some(inner).write(&mut buf).unwrap();

        let records = Records::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(records.0, vec![batch_1]);
    }

    #[test]
    fn test_records_null() {
        let buf = (-1i32).to_be_bytes().to_vec();
        assert_eq!(Records::read(&mut Cursor::new(buf)).unwrap(), Records::default());
    }

    fn record_batch(base_offset: i64) -> RecordBatch {
        RecordBatch {
            base_offset,
            partition_leader_epoch: 0,
            last_offset_delta: 0,
            first_timestamp: 0,
            max_timestamp: 0,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: ControlBatchOrRecords::Records(vec![]),
            compression: RecordBatchCompression::NoCompression,
            is_transactional: false,
            timestamp_type: RecordBatchTimestampType::CreateTime,
        }
    }

    proptest! {
        #[test]
        fn varint_roundtrip(v: i32) {
            let mut data = vec![];
            Varint(v).write(&mut data).unwrap();
            prop_assert_eq!(Varint::read(&mut Cursor::new(data)).unwrap(), Varint(v));
        }

        #[test]
        fn garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = Records::read(&mut Cursor::new(data.clone()));
            let _ = Option::<String>::read(&mut Cursor::new(data));
        }
    }
}
