//! Stream round-trips over a real connection: a sender task writes typed
//! data into a DataOStream whose chunks travel as OBJECT_DELTA packets
//! over a pipe connection; the receiver reassembles and reads them back.

use std::time::Duration;

use trellis_node::buffer::BufferCache;
use trellis_node::connection::{Connection, ConnectionSet, SetEvent};
use trellis_node::{ObjectId, Version};
use trellis_protocol::packet::{encode_object_packet, ObjectData, ObjectOp, PacketHeader};
use trellis_stream::{
    ChunkOut, ChunkSink, DataIStream, DataOStream, QueuedChunks, StreamError,
};

const MESSAGE: &str = "So long, and thanks for all the fish";

/// Sink turning chunks into OBJECT_DELTA packets on a connection.
struct ConnectionSink {
    conn: Connection,
    object_id: ObjectId,
    handle: tokio::runtime::Handle,
}

impl ChunkSink for ConnectionSink {
    fn emit(&mut self, chunk: ChunkOut) -> Result<(), StreamError> {
        let pkt = encode_object_packet(ObjectOp::Delta, |b| {
            ObjectData {
                object_id: self.object_id,
                version: chunk.version,
                sequence: chunk.sequence,
                last: chunk.last,
                compressor: chunk.compressor,
                n_chunks: chunk.n_chunks,
                data_size: chunk.data_size,
                body: chunk.body.clone(),
            }
            .encode(b)
        });
        let conn = self.conn.clone();
        self.handle
            .block_on(async move { conn.send(pkt).await })
            .map_err(|e| StreamError::Sink(e.to_string()))
    }
}

/// Receive OBJECT_DELTA packets until the last flag, yielding an istream.
async fn receive_burst(events: &mut trellis_node::connection::SetEvents) -> DataIStream {
    let mut queue = QueuedChunks::new(Version(1));
    loop {
        match events.select(Duration::from_secs(5)).await {
            SetEvent::Data { buffer, .. } => {
                let mut slice = &buffer[..];
                PacketHeader::decode(&mut slice).unwrap();
                let data = ObjectData::decode(&mut slice).unwrap();
                let last = data.last;
                queue.push(trellis_stream::RawChunk {
                    compressor: data.compressor,
                    n_chunks: data.n_chunks,
                    data_size: data.data_size,
                    body: data.body,
                });
                if last {
                    return DataIStream::new(Box::new(queue));
                }
            }
            SetEvent::Timeout => panic!("no data within timeout"),
            _ => {}
        }
    }
}

fn spawn_sender(
    conn: Connection,
    write: impl FnOnce(&mut DataOStream) + Send + 'static,
) -> std::thread::JoinHandle<()> {
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let sink = ConnectionSink {
            conn,
            object_id: ObjectId::random(),
            handle,
        };
        let mut os = DataOStream::new();
        os.set_chunk_size(4096);
        os.enable(Box::new(sink), Version(1), 4096);
        write(&mut os);
        os.disable().unwrap();
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_round_trip_primitives() {
    let (set, mut events) = ConnectionSet::new(BufferCache::new());
    let (tx, rx) = Connection::pipe_pair();
    set.add_connection(rx);

    let doubles: Vec<f64> = (0..65_536).map(|i| i as f64).collect();
    let expected = doubles.clone();
    let sender = spawn_sender(tx, move |os| {
        os.write(42i32);
        os.write(43.0f32);
        os.write(44.0f64);
        os.write_vec(&doubles);
        os.write_string(MESSAGE);
    });

    let mut is = receive_burst(&mut events).await;
    assert_eq!(is.read::<i32>().unwrap(), 42);
    assert_eq!(is.read::<f32>().unwrap(), 43.0);
    assert_eq!(is.read::<f64>().unwrap(), 44.0);
    let back: Vec<f64> = is.read_vec().unwrap();
    assert_eq!(back.len(), 65_536);
    assert_eq!(back, expected);
    assert_eq!(is.read_string().unwrap(), MESSAGE);
    assert!(!is.has_data());

    sender.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunked_delta_across_boundary() {
    let (set, mut events) = ConnectionSet::new(BufferCache::new());
    let (tx, rx) = Connection::pipe_pair();
    set.add_connection(rx);

    // 128 KiB of u32 values in one stream, read back as one vector.
    let values: Vec<u32> = (0..32_768).collect();
    let sender = spawn_sender(tx, move |os| {
        os.write_vec(&values);
    });

    let mut is = receive_burst(&mut events).await;
    let back: Vec<u32> = is.read_vec().unwrap();
    assert_eq!(back.len(), 32_768);
    for (i, v) in back.iter().enumerate() {
        assert_eq!(*v as usize, i);
    }
    sender.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_small_writes_cross_chunks() {
    let (set, mut events) = ConnectionSet::new(BufferCache::new());
    let (tx, rx) = Connection::pipe_pair();
    set.add_connection(rx);

    let sender = {
        let handle = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            let sink = ConnectionSink {
                conn: tx,
                object_id: ObjectId::random(),
                handle,
            };
            let mut os = DataOStream::new();
            os.set_chunk_size(64); // tiny chunks: many boundaries
            os.enable(Box::new(sink), Version(1), 64);
            for i in 0..4096u32 {
                os.write(i);
            }
            os.disable().unwrap();
        })
    };

    let mut is = receive_burst(&mut events).await;
    for i in 0..4096u32 {
        assert_eq!(is.read::<u32>().unwrap(), i);
    }
    assert!(matches!(is.read::<u32>(), Err(StreamError::ShortRead)));
    sender.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_burst_sequence_and_last_flag_on_wire() {
    let (set, mut events) = ConnectionSet::new(BufferCache::new());
    let (tx, rx) = Connection::pipe_pair();
    set.add_connection(rx);

    let sender = spawn_sender(tx, move |os| {
        let big = vec![7u8; 20_000];
        for _ in 0..4 {
            os.write_array(&big);
        }
    });

    let mut sequences = Vec::new();
    let mut lasts = Vec::new();
    loop {
        match events.select(Duration::from_secs(5)).await {
            SetEvent::Data { buffer, .. } => {
                let mut slice = &buffer[..];
                PacketHeader::decode(&mut slice).unwrap();
                let data = ObjectData::decode(&mut slice).unwrap();
                sequences.push(data.sequence);
                lasts.push(data.last);
                if data.last {
                    break;
                }
            }
            _ => panic!("unexpected event"),
        }
    }
    sender.join().unwrap();

    let expected: Vec<u32> = (0..sequences.len() as u32).collect();
    assert_eq!(sequences, expected);
    assert!(lasts.iter().rev().skip(1).all(|l| !l));
    assert_eq!(lasts.last(), Some(&true));
}
