use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use stackpulse_wire::{DataHeader, SampleData};

/// Suffix of performance-data files emitted by [`FileTransport`].
pub const DATA_SUFFIX: &str = "cbtf-data";

/// Sizing factor for the per-batch encode buffer. A batch is one header plus
/// at most 1024 stack slots and their counts, which this comfortably covers.
const BLOB_SIZE_FACTOR: usize = 15;

/// Borrowed view of one batch's payload, valid for the duration of a `send`.
pub struct SamplePayload<'a> {
    pub interval: u64,
    pub stacktraces: &'a [u64],
    pub count: &'a [u8],
}

/// Seam between the sampling runtime and off-process storage.
///
/// `send` is invoked from the sample handler when the buffer fills, so
/// implementations used in production must not allocate or take locks.
/// Failures are the transport's problem: the runtime drops the batch and
/// moves on.
pub trait Transport: Send {
    fn send(&mut self, header: &DataHeader, payload: &SamplePayload) -> io::Result<()>;
}

/// Streams batches to a file named `<collector>-<pid>-<tid>.cbtf-data`.
///
/// The file and the encode buffer are set up at construction; each `send` is
/// one encode into the preallocated buffer and one `write(2)`.
pub struct FileTransport {
    file: fs::File,
    path: PathBuf,
    buf: Vec<u8>,
}

impl FileTransport {
    pub fn create(directory: &Path, collector: &str, pid: u64, tid: u64) -> io::Result<Self> {
        let path = directory.join(format!("{collector}-{pid}-{tid}.{DATA_SUFFIX}"));
        let file = fs::File::create(&path)?;
        debug!("writing performance data to {}", path.display());
        Ok(FileTransport {
            file,
            path,
            buf: Vec::with_capacity(BLOB_SIZE_FACTOR * 1024),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for FileTransport {
    fn send(&mut self, header: &DataHeader, payload: &SamplePayload) -> io::Result<()> {
        self.buf.clear();
        header.encode(&mut self.buf);
        SampleData::encode_parts(
            payload.interval,
            payload.stacktraces,
            payload.count,
            &mut self.buf,
        );
        self.file.write_all(&self.buf)
    }
}

/// Hands batches to an in-process consumer over a channel. Cloning the
/// payload allocates, so this is for tests and in-process aggregation, not
/// for the production signal path.
pub struct ChannelTransport {
    sender: Sender<(DataHeader, SampleData)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<(DataHeader, SampleData)>) {
        let (sender, receiver) = unbounded();
        (ChannelTransport { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, header: &DataHeader, payload: &SamplePayload) -> io::Result<()> {
        let data = SampleData {
            interval: payload.interval,
            stacktraces: payload.stacktraces.to_vec(),
            count: payload.count.to_vec(),
        };
        self.sender
            .send((header.clone(), data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "batch consumer hung up"))
    }
}

#[cfg(test)]
mod tests {
    use stackpulse_wire::Decoder;

    use super::*;

    fn test_batch() -> (DataHeader, Vec<u64>, Vec<u8>) {
        let header = DataHeader {
            experiment: 9,
            collector: "usertime".into(),
            host: "localhost".into(),
            pid: 100,
            posix_tid: 101,
            rank: u64::MAX,
            omp_tid: 0,
            time_begin: 10,
            time_end: 20,
            addr_begin: 0x1000,
            addr_end: 0x2001,
        };
        (header, vec![0x1000, 0x1100, 0x2000], vec![2, 0, 0])
    }

    #[test]
    fn test_file_transport_writes_decodable_batches() {
        let dir = std::env::temp_dir();
        let (header, stacktraces, count) = test_batch();
        let payload = SamplePayload {
            interval: 1234,
            stacktraces: &stacktraces,
            count: &count,
        };

        let mut transport = FileTransport::create(&dir, "usertime", 100, 101).unwrap();
        let path = transport.path().to_path_buf();
        assert!(path.to_string_lossy().ends_with("usertime-100-101.cbtf-data"));

        transport.send(&header, &payload).unwrap();
        transport.send(&header, &payload).unwrap();

        let bytes = fs::read(&path).unwrap();
        let mut dec = Decoder::new(&bytes);
        for _ in 0..2 {
            let decoded_header = DataHeader::decode(&mut dec).unwrap();
            let decoded_data = SampleData::decode(&mut dec).unwrap();
            assert_eq!(decoded_header, header);
            assert_eq!(decoded_data.interval, 1234);
            assert_eq!(decoded_data.stacktraces, stacktraces);
            assert_eq!(decoded_data.count, count);
        }
        dec.finish().unwrap();

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_channel_transport_delivers_batches() {
        let (mut transport, receiver) = ChannelTransport::new();
        let (header, stacktraces, count) = test_batch();

        transport
            .send(
                &header,
                &SamplePayload {
                    interval: 55,
                    stacktraces: &stacktraces,
                    count: &count,
                },
            )
            .unwrap();

        let (received_header, received_data) = receiver.try_recv().unwrap();
        assert_eq!(received_header, header);
        assert_eq!(received_data.stacktraces, stacktraces);
        assert_eq!(received_data.count, count);
    }

    #[test]
    fn test_channel_transport_reports_hangup() {
        let (mut transport, receiver) = ChannelTransport::new();
        drop(receiver);
        let (header, stacktraces, count) = test_batch();
        let result = transport.send(
            &header,
            &SamplePayload {
                interval: 1,
                stacktraces: &stacktraces,
                count: &count,
            },
        );
        assert!(result.is_err());
    }
}
