use anyscreen_bridge::{
    Bridge, BridgeConfig, BridgeError, DeviceFile, SignalChannel, Transfer, TransferBuf,
    TransferWorker,
};
use anyscreen_proto::{Header, IoctlCode, RequestType, PACKET_ACK, PACKET_NACK};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BLOCK: usize = 512;

fn bridge(max_chunk: usize, max_blocks: usize) -> Arc<Bridge> {
    bridge_with_queue(4, max_chunk, max_blocks)
}

fn bridge_with_queue(capacity: usize, max_chunk: usize, max_blocks: usize) -> Arc<Bridge> {
    Arc::new(Bridge::new(BridgeConfig::new(capacity, max_chunk, BLOCK, max_blocks)).unwrap())
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for bridge state");
        thread::sleep(Duration::from_millis(1));
    }
}

/// One producer per address writing a block filled with `address + 1`.
fn spawn_writers(
    bridge: &Arc<Bridge>,
    count: u8,
) -> Vec<thread::JoinHandle<anyscreen_bridge::Result<()>>> {
    (0..count)
        .map(|id| {
            let bridge = Arc::clone(bridge);
            thread::spawn(move || {
                bridge.submit_transfer(id.into(), TransferBuf::Write(&[id + 1; BLOCK]))
            })
        })
        .collect()
}

/// Poll until a request is bound, then read its header.
fn next_request(file: &DeviceFile) -> Header {
    loop {
        if file.has_pending_request() {
            return file.read_header().unwrap();
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drain a write request's payload in `chunk`-sized reads and complete it.
fn take_write(file: &DeviceFile, chunk: usize) -> (Header, Vec<u8>) {
    let header = next_request(file);
    assert_eq!(header.kind, RequestType::Write);
    let mut payload = Vec::with_capacity(header.length);
    let mut buf = vec![0u8; chunk];
    while payload.len() < header.length {
        let count = file.read(&mut buf).unwrap();
        assert!(count > 0);
        payload.extend_from_slice(&buf[..count]);
    }
    file.block_done().unwrap();
    (header, payload)
}

/// Answer a read request with `data` and complete it.
fn answer_read(file: &DeviceFile, data: &[u8]) -> Header {
    let header = next_request(file);
    assert_eq!(header.kind, RequestType::Read);
    assert_eq!(header.length, data.len());
    assert_eq!(file.write(data).unwrap(), data.len());
    file.block_done().unwrap();
    header
}

/// Batch contents where every byte of block `i` is `i + 1`.
fn batch(blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK).map(|i| (i / BLOCK) as u8 + 1).collect()
}

fn read_blocks(bridge: &Arc<Bridge>, addresses: Vec<u64>) -> thread::JoinHandle<Vec<Vec<u8>>> {
    let bridge = Arc::clone(bridge);
    thread::spawn(move || {
        addresses
            .into_iter()
            .map(|address| {
                let mut buf = vec![0u8; BLOCK];
                bridge
                    .submit_transfer(address, TransferBuf::Read(&mut buf))
                    .unwrap();
                buf
            })
            .collect()
    })
}

fn preload(file: &DeviceFile, implicit_ack: bool) {
    file.set_in_block(50);
    file.set_out_block1(1000);
    file.set_out_block2(2000);
    if implicit_ack {
        file.enable_implicit_ack();
    }
    file.enter_preload();
    file.set_batch_size(4).unwrap();
    file.ready();
}

#[test]
fn large_write_is_split_into_chunks() {
    let bridge = bridge_with_queue(2, 512, 4);
    let file = bridge.open().unwrap();
    file.ready();

    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            let data: Vec<u8> = (0..1024).map(|i| i as u8).collect();
            bridge.submit_transfer(10, TransferBuf::Write(&data))
        })
    };

    let (first, head) = take_write(&file, BLOCK);
    assert_eq!(first, Header::new(RequestType::Write, 10, 512));
    let (second, tail) = take_write(&file, BLOCK);
    assert_eq!(second, Header::new(RequestType::Write, 11, 512));
    producer.join().unwrap().unwrap();

    let expected: Vec<u8> = (0..1024).map(|i| i as u8).collect();
    assert_eq!([head, tail].concat(), expected);
    assert!(!file.has_pending_request());
}

#[test]
fn write_survives_arbitrary_read_chunking() {
    let bridge = bridge(2048, 4);
    let file = bridge.open().unwrap();
    file.ready();
    let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();

    let producer = {
        let bridge = Arc::clone(&bridge);
        let data = data.clone();
        thread::spawn(move || bridge.submit_transfer(0, TransferBuf::Write(&data)))
    };

    let mut received = Vec::new();
    for (index, chunk) in [7usize, 1000].into_iter().enumerate() {
        let (header, payload) = take_write(&file, chunk);
        assert_eq!(header.address, index * 4);
        received.extend(payload);
    }
    producer.join().unwrap().unwrap();
    assert_eq!(received, data);
}

#[test]
fn requests_are_serviced_in_submission_order() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    file.ready();

    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            for address in 0..3u64 {
                bridge
                    .submit_transfer(address * 8, TransferBuf::Write(&[address as u8 + 1; BLOCK]))
                    .unwrap();
            }
        })
    };

    for address in 0..3usize {
        let (header, payload) = take_write(&file, BLOCK);
        assert_eq!(header.address, address * 8);
        assert!(payload.iter().all(|&b| b == address as u8 + 1));
    }
    producer.join().unwrap();
}

#[test]
fn direct_read_returns_daemon_data() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    file.ready();

    let reader = read_blocks(&bridge, vec![3]);
    let header = answer_read(&file, &[0x5a; BLOCK]);
    assert_eq!(header.address, 3);
    assert_eq!(reader.join().unwrap(), vec![vec![0x5a; BLOCK]]);
}

#[test]
fn preload_refills_once_and_serves_next_block_from_cache() {
    let bridge = bridge(4096, 4);
    let file = bridge.open().unwrap();
    preload(&file, false);

    let reader = read_blocks(&bridge, vec![1000, 1001]);
    let header = answer_read(&file, &batch(4));
    assert_eq!(header, Header::new(RequestType::Read, 1000, 4 * BLOCK));

    let blocks = reader.join().unwrap();
    assert_eq!(blocks[0], vec![1; BLOCK]);
    assert_eq!(blocks[1], vec![2; BLOCK]);
    assert!(!file.has_pending_request());
    let status = file.status();
    assert!(status.batch_valid);
    assert_eq!(status.batch_size, 4);
    assert_eq!(status.block_pointer, 2);
}

#[test]
fn ack_write_invalidates_batch() {
    let bridge = bridge(4096, 4);
    let file = bridge.open().unwrap();
    preload(&file, false);

    let reader = read_blocks(&bridge, vec![1000]);
    answer_read(&file, &batch(4));
    reader.join().unwrap();
    assert!(file.status().batch_valid);

    // Below the in-block the ACK flag is ordinary data.
    let writer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            let mut packet = [0u8; BLOCK];
            packet[0] = PACKET_ACK;
            bridge.submit_transfer(10, TransferBuf::Write(&packet)).unwrap();
            packet[0] = PACKET_NACK;
            bridge.submit_transfer(60, TransferBuf::Write(&packet)).unwrap();
        })
    };
    take_write(&file, BLOCK);
    take_write(&file, BLOCK);
    writer.join().unwrap();
    assert!(!file.status().batch_valid);

    let reader = read_blocks(&bridge, vec![1001]);
    let header = answer_read(&file, &batch(4));
    assert_eq!(header.address, 1001);
    assert_eq!(reader.join().unwrap(), vec![vec![1; BLOCK]]);
}

#[test]
fn implicit_ack_refills_on_output_block_crossing() {
    let bridge = bridge(4096, 4);
    let file = bridge.open().unwrap();
    preload(&file, true);

    let reader = read_blocks(&bridge, vec![1000, 2000]);
    answer_read(&file, &batch(4));
    let header = answer_read(&file, &batch(4));
    assert_eq!(header.address, 2000);
    let blocks = reader.join().unwrap();
    assert_eq!(blocks[1], vec![1; BLOCK]);
    assert_eq!(file.status().window.current_out_block, 2000);
}

#[test]
fn empty_batch_sentinel_forces_refill() {
    let bridge = bridge(4096, 4);
    let file = bridge.open().unwrap();
    preload(&file, false);

    let mut data = batch(4);
    data[BLOCK..BLOCK + 4].fill(0);
    let reader = read_blocks(&bridge, vec![1000, 1001, 1002]);
    answer_read(&file, &data);
    let header = answer_read(&file, &batch(4));
    assert_eq!(header.address, 1002);

    let blocks = reader.join().unwrap();
    assert_eq!(blocks[0], vec![1; BLOCK]);
    assert_eq!(&blocks[1][..4], &[0; 4]);
    assert_eq!(blocks[2], vec![1; BLOCK]);
}

#[test]
fn producers_wait_for_ready() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.submit_transfer(1, TransferBuf::Write(&[9; BLOCK])))
    };

    wait_until(|| bridge.status().producers_waiting == 1);
    assert_eq!(file.status().queued, 0);
    assert!(!file.has_pending_request());

    file.ioctl(IoctlCode::Ready.into(), 0).unwrap();
    take_write(&file, BLOCK);
    producer.join().unwrap().unwrap();
}

#[test]
fn release_fails_blocked_producer_and_resets_device() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    assert!(matches!(bridge.open(), Err(BridgeError::Busy)));
    file.ready();

    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.submit_transfer(1, TransferBuf::Write(&[9; BLOCK])))
    };
    let header = next_request(&file);
    assert_eq!(header.address, 1);
    file.release();

    assert!(matches!(
        producer.join().unwrap(),
        Err(BridgeError::SessionAborted)
    ));
    assert!(!bridge.status().open);

    let file = bridge.open().unwrap();
    let status = file.status();
    assert_eq!(status.queued, 0);
    assert!(status.bound.is_none());
    assert!(!status.batch_valid);
}

#[test]
fn concurrent_producers_fill_the_queue() {
    let bridge = bridge_with_queue(2, 512, 4);
    let file = bridge.open().unwrap();
    file.ready();

    let mut producers: Vec<_> = spawn_writers(&bridge, 3).into_iter().map(Some).collect();
    wait_until(|| {
        let status = file.status();
        status.in_flight == 3 && status.queued == 2
    });
    thread::sleep(Duration::from_millis(20));
    assert_eq!(file.status().queued, 2);
    assert!(producers.iter().flatten().all(|p| !p.is_finished()));

    for served in 0..3 {
        let (header, payload) = take_write(&file, BLOCK);
        assert!(payload.iter().all(|&b| usize::from(b) == header.address + 1));
        let done = producers[header.address].take().unwrap();
        wait_until(|| done.is_finished());
        done.join().unwrap().unwrap();
        assert!(producers.iter().flatten().all(|p| !p.is_finished()));
        if served == 0 {
            // The producer that was waiting for space takes the freed slot.
            wait_until(|| file.status().queued == 2);
        }
    }
    assert_eq!(file.status().in_flight, 0);
    assert!(!file.has_pending_request());
}

#[test]
fn release_fails_producer_waiting_for_ready() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || bridge.submit_transfer(3, TransferBuf::Write(&[1; BLOCK])))
    };

    wait_until(|| bridge.status().producers_waiting == 1);
    file.release();
    assert!(matches!(
        producer.join().unwrap(),
        Err(BridgeError::SessionAborted)
    ));
    assert_eq!(bridge.status().producers_waiting, 0);
}

#[test]
fn release_fails_producers_waiting_for_queue_space() {
    let bridge = bridge_with_queue(2, 512, 4);
    let file = bridge.open().unwrap();
    file.ready();

    let producers = spawn_writers(&bridge, 3);
    wait_until(|| {
        let status = file.status();
        status.in_flight == 3 && status.queued == 2
    });
    file.release();

    for producer in producers {
        assert!(matches!(
            producer.join().unwrap(),
            Err(BridgeError::SessionAborted)
        ));
    }
    let file = bridge.open().unwrap();
    assert_eq!(file.status().in_flight, 0);
}

#[test]
fn raw_ioctl_surface() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();

    let err = file.ioctl(IoctlCode::SetBatchSize.into(), 0).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidBatchSize { requested: 0, max: 4 }));
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(file.ioctl(IoctlCode::SetBatchSize.into(), 5).is_err());
    file.ioctl(IoctlCode::SetBatchSize.into(), 2).unwrap();

    assert_eq!(file.ioctl(IoctlCode::HasPendingRequest.into(), 0).unwrap(), 0);
    assert!(matches!(
        file.ioctl(IoctlCode::BlockDone.into(), 0),
        Err(BridgeError::ProtocolMisuse(_))
    ));
    assert!(matches!(
        file.ioctl(0xad7, 0),
        Err(BridgeError::ProtocolMisuse(_))
    ));

    file.ioctl(IoctlCode::SetOutBlock1.into(), 100).unwrap();
    file.ioctl(IoctlCode::EnterPreload.into(), 0).unwrap();
    let window = file.status().window;
    assert!(window.preload);
    assert_eq!(window.current_out_block, 100);
}

#[test]
fn notifier_fires_once_per_burst() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    let (notifier, signals) = SignalChannel::channel();
    file.fasync(Some(Arc::new(notifier)));
    file.ready();

    let producer = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            bridge.submit_transfer(0, TransferBuf::Write(&[1; BLOCK])).unwrap();
            bridge.submit_transfer(1, TransferBuf::Write(&[2; BLOCK])).unwrap();
        })
    };

    signals.recv_blocking().unwrap();
    take_write(&file, BLOCK);
    take_write(&file, BLOCK);
    producer.join().unwrap();
    assert!(signals.try_recv().is_err());

    file.disable_poll();
    assert!(file.status().notifications_armed);
}

#[test]
fn worker_round_trips_reads() {
    let bridge = bridge(512, 4);
    let file = bridge.open().unwrap();
    file.ready();
    let worker = TransferWorker::spawn(Arc::clone(&bridge), 4).unwrap();

    let write = worker.post(Transfer::write(7, vec![3; BLOCK])).unwrap();
    let read = worker.post(Transfer::read(7, BLOCK)).unwrap();
    let (_, payload) = take_write(&file, BLOCK);
    answer_read(&file, &payload);

    assert_eq!(write.wait().unwrap().data, vec![3; BLOCK]);
    let read = read.wait().unwrap();
    assert_eq!(read.kind, RequestType::Read);
    assert_eq!(read.data, vec![3; BLOCK]);
    worker.shutdown();
}
