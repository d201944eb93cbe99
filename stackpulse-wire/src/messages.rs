use crate::xdr::{DecodeError, Decoder, Encoder};

/// Value carried in `DataHeader::rank` until the job rank is published.
pub const RANK_UNRESOLVED: u64 = u64::MAX;

/// Header stamped onto every performance-data batch.
///
/// `rank` stays at [`RANK_UNRESOLVED`] until the embedding job publishes its
/// rank; `addr_begin`/`addr_end` and `time_begin`/`time_end` are end-exclusive
/// intervals covering every address and instant sampled into the batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub experiment: u32,
    pub collector: String,
    pub host: String,
    pub pid: u64,
    pub posix_tid: u64,
    pub rank: u64,
    pub omp_tid: u32,
    pub time_begin: u64,
    pub time_end: u64,
    pub addr_begin: u64,
    pub addr_end: u64,
}

impl DataHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut enc = Encoder::new(buf);
        enc.put_u32(self.experiment);
        enc.put_string(&self.collector);
        enc.put_string(&self.host);
        enc.put_u64(self.pid);
        enc.put_u64(self.posix_tid);
        enc.put_u64(self.rank);
        enc.put_u32(self.omp_tid);
        enc.put_u64(self.time_begin);
        enc.put_u64(self.time_end);
        enc.put_u64(self.addr_begin);
        enc.put_u64(self.addr_end);
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(DataHeader {
            experiment: dec.get_u32()?,
            collector: dec.get_string()?,
            host: dec.get_string()?,
            pid: dec.get_u64()?,
            posix_tid: dec.get_u64()?,
            rank: dec.get_u64()?,
            omp_tid: dec.get_u32()?,
            time_begin: dec.get_u64()?,
            time_end: dec.get_u64()?,
            addr_begin: dec.get_u64()?,
            addr_end: dec.get_u64()?,
        })
    }
}

/// One batch of aggregated stack samples.
///
/// `stacktraces` and `count` advance in lockstep: a non-zero count marks the
/// top of a stack whose frames occupy the following slots, a zero count marks
/// a continuation slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleData {
    pub interval: u64,
    pub stacktraces: Vec<u64>,
    pub count: Vec<u8>,
}

impl SampleData {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        Self::encode_parts(self.interval, &self.stacktraces, &self.count, buf);
    }

    /// Encodes a payload from borrowed parts. The runtime flushes from a
    /// signal context, so this must not allocate beyond the buffer it is
    /// handed (callers reserve capacity up front).
    pub fn encode_parts(interval: u64, stacktraces: &[u64], count: &[u8], buf: &mut Vec<u8>) {
        assert_eq!(
            stacktraces.len(),
            count.len(),
            "stacktrace and count arrays must advance in lockstep"
        );
        let mut enc = Encoder::new(buf);
        enc.put_u64(interval);
        enc.put_u32(stacktraces.len() as u32);
        for pc in stacktraces {
            enc.put_u64(*pc);
        }
        enc.put_opaque(count);
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        let interval = dec.get_u64()?;
        let len = dec.get_u32()? as usize;
        let mut stacktraces = Vec::with_capacity(len);
        for _ in 0..len {
            stacktraces.push(dec.get_u64()?);
        }
        let count = dec.get_opaque()?.to_vec();
        assert_eq!(
            stacktraces.len(),
            count.len(),
            "stacktrace and count arrays must advance in lockstep"
        );
        Ok(SampleData {
            interval,
            stacktraces,
            count,
        })
    }
}

/// Wire form of a bit-per-address map over `[begin, end)`.
///
/// Bit `i` corresponds to address `begin + i` and lives in `bytes[i / 8]` at
/// position `i % 8` (LSB first). The payload always carries at least one
/// byte, even for an empty range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBitmapMsg {
    pub begin: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
}

impl AddressBitmapMsg {
    /// Number of payload bytes a bitmap over `[begin, end)` must carry.
    pub fn expected_len(begin: u64, end: u64) -> usize {
        let width = end - begin;
        if width == 0 {
            1
        } else {
            ((width - 1) / 8 + 1) as usize
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut enc = Encoder::new(buf);
        enc.put_u64(self.begin);
        enc.put_u64(self.end);
        enc.put_opaque(&self.bytes);
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(AddressBitmapMsg {
            begin: dec.get_u64()?,
            end: dec.get_u64()?,
            bytes: dec.get_opaque()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionMsg {
    pub name: String,
    pub bitmaps: Vec<AddressBitmapMsg>,
}

impl FunctionMsg {
    fn encode(&self, buf: &mut Vec<u8>) {
        Encoder::new(buf).put_string(&self.name);
        encode_bitmaps(&self.bitmaps, buf);
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(FunctionMsg {
            name: dec.get_string()?,
            bitmaps: decode_bitmaps(dec)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementMsg {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub bitmaps: Vec<AddressBitmapMsg>,
}

impl StatementMsg {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut enc = Encoder::new(buf);
        enc.put_string(&self.path);
        enc.put_u32(self.line);
        enc.put_u32(self.column);
        encode_bitmaps(&self.bitmaps, buf);
    }

    fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(StatementMsg {
            path: dec.get_string()?,
            line: dec.get_u32()?,
            column: dec.get_u32()?,
            bitmaps: decode_bitmaps(dec)?,
        })
    }
}

/// Wire form of the per-binary symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableMsg {
    pub path: String,
    pub checksum: u64,
    pub functions: Vec<FunctionMsg>,
    pub statements: Vec<StatementMsg>,
}

impl SymbolTableMsg {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut enc = Encoder::new(buf);
        enc.put_string(&self.path);
        enc.put_u64(self.checksum);
        enc.put_u32(self.functions.len() as u32);
        for function in &self.functions {
            function.encode(buf);
        }
        let mut enc = Encoder::new(buf);
        enc.put_u32(self.statements.len() as u32);
        for statement in &self.statements {
            statement.encode(buf);
        }
    }

    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {
        let path = dec.get_string()?;
        let checksum = dec.get_u64()?;
        let function_len = dec.get_u32()? as usize;
        let mut functions = Vec::with_capacity(function_len);
        for _ in 0..function_len {
            functions.push(FunctionMsg::decode(dec)?);
        }
        let statement_len = dec.get_u32()? as usize;
        let mut statements = Vec::with_capacity(statement_len);
        for _ in 0..statement_len {
            statements.push(StatementMsg::decode(dec)?);
        }
        Ok(SymbolTableMsg {
            path,
            checksum,
            functions,
            statements,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let message = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(message)
    }
}

fn encode_bitmaps(bitmaps: &[AddressBitmapMsg], buf: &mut Vec<u8>) {
    Encoder::new(buf).put_u32(bitmaps.len() as u32);
    for bitmap in bitmaps {
        bitmap.encode(buf);
    }
}

fn decode_bitmaps(dec: &mut Decoder) -> Result<Vec<AddressBitmapMsg>, DecodeError> {
    let len = dec.get_u32()? as usize;
    let mut bitmaps = Vec::with_capacity(len);
    for _ in 0..len {
        bitmaps.push(AddressBitmapMsg::decode(dec)?);
    }
    Ok(bitmaps)
}
