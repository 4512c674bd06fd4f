use super::*;
use crate::peer::{BlockRequest, ConnectionId};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::fs::OpenOptions;

const PEER_A: ConnectionId = ConnectionId(1);
const PEER_B: ConnectionId = ConnectionId(2);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn digests_for(data: &[u8], piece_length: usize) -> Vec<u8> {
    data.chunks(piece_length)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect()
}

async fn open_files(temp: &TempDir, entries: &[FileEntry]) -> FileSet {
    let mut handles = Vec::new();
    for entry in entries {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(temp.path().join(&entry.path))
            .await
            .unwrap();
        handles.push(file);
    }
    FileSet::new(entries.to_vec(), handles).unwrap()
}

fn two_files() -> Vec<FileEntry> {
    vec![
        FileEntry::new(PathBuf::from("file1.dat"), 10000, 0),
        FileEntry::new(PathBuf::from("file2.dat"), 10000, 10000),
    ]
}

async fn store_for(temp: &TempDir, data: &[u8], piece_length: usize, block: u32) -> PieceStore {
    let count = data.len().div_ceil(piece_length);
    let last = data.len() - (count - 1) * piece_length;
    let mut store = PieceStore::new(
        count,
        piece_length as u64,
        last as u64,
        block,
        &digests_for(data, piece_length),
    )
    .unwrap();
    let entries = vec![FileEntry::new(PathBuf::from("test.dat"), data.len() as u64, 0)];
    store.attach(open_files(temp, &entries).await);
    store
}

async fn deliver_piece(store: &mut PieceStore, data: &[u8], index: u32, piece_length: usize) -> BlockOutcome {
    let mut outcome = BlockOutcome::Accepted;
    while let Some(req) = store.next_block_request(index) {
        let start = index as usize * piece_length + req.offset as usize;
        outcome = store
            .on_block_received(index, req.offset, &data[start..start + req.length as usize], PEER_A)
            .await
            .unwrap();
    }
    outcome
}

#[test]
fn test_map_range_spans_files() {
    let files = vec![
        FileEntry::new(PathBuf::from("a"), 100, 0),
        FileEntry::new(PathBuf::from("empty"), 0, 100),
        FileEntry::new(PathBuf::from("b"), 50, 100),
        FileEntry::new(PathBuf::from("c"), 200, 150),
    ];

    let segments = map_range(&files, 90, 100);
    assert_eq!(
        segments,
        vec![
            FileSegment { file_index: 0, file_offset: 90, length: 10 },
            FileSegment { file_index: 2, file_offset: 0, length: 50 },
            FileSegment { file_index: 3, file_offset: 0, length: 40 },
        ]
    );

    let inside = map_range(&files, 160, 10);
    assert_eq!(inside, vec![FileSegment { file_index: 3, file_offset: 10, length: 10 }]);

    let past_end: u64 = map_range(&files, 340, 100).iter().map(|s| s.length).sum();
    assert_eq!(past_end, 10);
}

#[test]
fn test_new_rejects_bad_digests() {
    assert!(matches!(
        PieceStore::new(2, 16384, 16384, 16384, &[0u8; 30]),
        Err(StorageError::InvalidDigests(30))
    ));
}

#[test]
fn test_new_rejects_piece_length_above_u32() {
    let huge = u32::MAX as u64 + 1;
    assert!(matches!(
        PieceStore::new(2, huge, 16384, 16384, &[0u8; 40]),
        Err(StorageError::PieceTooLarge(len)) if len == huge
    ));
    assert!(matches!(
        PieceStore::new(1, 16384, huge, 16384, &[0u8; 20]),
        Err(StorageError::PieceTooLarge(_))
    ));
}

#[test]
fn test_block_requests_respect_inflight_cap() {
    let mut store = PieceStore::new(1, 65536, 65536, 16384, &[0u8; 20])
        .unwrap()
        .with_inflight_cap(2);

    let first = store.next_block_request(0).unwrap();
    let second = store.next_block_request(0).unwrap();
    assert_eq!(first, BlockRequest::new(0, 0, 16384));
    assert_eq!(second, BlockRequest::new(0, 16384, 16384));
    assert!(store.next_block_request(0).is_none());

    store.release_request(&first);
    assert_eq!(store.next_block_request(0), Some(first));
    assert!(store.in_progress(0));
    assert!(!store.fully_requested(0));
}

#[test]
fn test_last_block_is_short() {
    let mut store = PieceStore::new(2, 32768, 20000, 16384, &[0u8; 40]).unwrap();
    assert_eq!(store.total_length(), 52768);
    assert_eq!(store.next_block_request(1), Some(BlockRequest::new(1, 0, 16384)));
    assert_eq!(store.next_block_request(1), Some(BlockRequest::new(1, 16384, 3616)));
    assert!(store.next_block_request(1).is_none());
    assert!(store.fully_requested(1));
    assert_eq!(store.outstanding_blocks(1).len(), 2);
}

#[test]
fn test_single_byte_flip_invalidates() {
    let data = pattern(64);
    let digest: [u8; 20] = Sha1::digest(&data).into();
    assert_eq!(check_digest(&digest, &data), PieceState::Verified);

    for i in 0..data.len() {
        let mut flipped = data.clone();
        flipped[i] ^= 0x01;
        assert_eq!(check_digest(&digest, &flipped), PieceState::Invalid, "byte {i}");
    }
}

#[tokio::test]
async fn test_receive_and_verify_writes_once() {
    let temp = TempDir::new().unwrap();
    let data = pattern(40000);
    let mut store = store_for(&temp, &data, 32768, 16384).await;

    assert_eq!(deliver_piece(&mut store, &data, 0, 32768).await, BlockOutcome::Verified);
    assert_eq!(deliver_piece(&mut store, &data, 1, 32768).await, BlockOutcome::Verified);

    assert!(store.is_complete());
    assert_eq!(store.bytes_written(), 40000);
    assert_eq!(store.remaining(), 0);

    let on_disk = tokio::fs::read(temp.path().join("test.dat")).await.unwrap();
    assert_eq!(on_disk, data);

    let again = store
        .on_block_received(0, 0, &data[..16384], PEER_B)
        .await
        .unwrap();
    assert_eq!(again, BlockOutcome::Duplicate);
    assert_eq!(store.bytes_written(), 40000);
}

#[tokio::test]
async fn test_malformed_and_duplicate_blocks() {
    let temp = TempDir::new().unwrap();
    let data = pattern(32768);
    let mut store = store_for(&temp, &data, 32768, 16384).await;

    let outcome = store.on_block_received(0, 100, &data[..100], PEER_A).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Malformed);
    let outcome = store.on_block_received(5, 0, &data[..16384], PEER_A).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Malformed);
    let outcome = store.on_block_received(0, 0, &data[..1000], PEER_A).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Malformed);

    let outcome = store.on_block_received(0, 0, &data[..16384], PEER_A).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Accepted);
    let outcome = store.on_block_received(0, 0, &data[..16384], PEER_B).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Duplicate);
}

#[tokio::test]
async fn test_hash_mismatch_resets_piece() {
    let temp = TempDir::new().unwrap();
    let data = pattern(32768);
    let mut store = store_for(&temp, &data, 32768, 16384).await;

    let mut corrupt = data[16384..].to_vec();
    corrupt[10] ^= 0xFF;

    store.on_block_received(0, 0, &data[..16384], PEER_A).await.unwrap();
    let outcome = store.on_block_received(0, 16384, &corrupt, PEER_B).await.unwrap();
    assert_eq!(
        outcome,
        BlockOutcome::HashMismatch { contributors: vec![PEER_A, PEER_B] }
    );
    assert_eq!(store.state(0), Some(PieceState::Pending));
    assert_eq!(store.bytes_written(), 0);
    assert!(!store.in_progress(0));

    assert_eq!(deliver_piece(&mut store, &data, 0, 32768).await, BlockOutcome::Verified);
}

#[tokio::test]
async fn test_verify_existing_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let data = pattern(5 * 16384);

    let mut on_disk = data.clone();
    on_disk[2 * 16384 + 7] ^= 0x55;
    on_disk.truncate(4 * 16384 + 100);
    tokio::fs::write(temp.path().join("test.dat"), &on_disk).await.unwrap();

    let mut store = store_for(&temp, &data, 16384, 16384).await;

    let mut calls = Vec::new();
    let first = store.verify_existing(|done, total| calls.push((done, total))).await.unwrap();
    let second = store.verify_existing(|_, _| {}).await.unwrap();

    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!(first.available_pieces(), vec![0, 1, 3]);
    assert_eq!(calls.last(), Some(&(5, 5)));
    assert_eq!(store.verified_bytes(), 3 * 16384);
    assert_eq!(store.bytes_written(), 0);
}

#[tokio::test]
async fn test_read_block_requires_verified_piece() {
    let temp = TempDir::new().unwrap();
    let data = pattern(32768);
    let mut store = store_for(&temp, &data, 16384, 16384).await;

    let request = BlockRequest::new(0, 0, 16384);
    assert!(matches!(
        store.read_block(&request).await,
        Err(StorageError::PieceNotAvailable(0))
    ));

    deliver_piece(&mut store, &data, 0, 16384).await;
    let block = store.read_block(&BlockRequest::new(0, 100, 200)).await.unwrap();
    assert_eq!(block.as_ref(), &data[100..300]);

    assert!(matches!(
        store.read_block(&BlockRequest::new(0, 16000, 1000)).await,
        Err(StorageError::InvalidBlock { .. })
    ));
    assert!(matches!(
        store.read_block(&BlockRequest::new(9, 0, 10)).await,
        Err(StorageError::InvalidPieceIndex(9))
    ));
}

#[tokio::test]
async fn test_multifile_piece_spans_files() {
    let temp = TempDir::new().unwrap();
    let data = pattern(20000);
    let digests = digests_for(&data, 16384);
    let mut store = PieceStore::new(2, 16384, 3616, 16384, &digests).unwrap();
    store.attach(open_files(&temp, &two_files()).await);

    deliver_piece(&mut store, &data, 0, 16384).await;
    deliver_piece(&mut store, &data, 1, 16384).await;
    store.sync().await.unwrap();

    let first = tokio::fs::read(temp.path().join("file1.dat")).await.unwrap();
    let second = tokio::fs::read(temp.path().join("file2.dat")).await.unwrap();
    assert_eq!(first, &data[..10000]);
    assert_eq!(second, &data[10000..]);

    let spanning = store.read_block(&BlockRequest::new(0, 9000, 2000)).await.unwrap();
    assert_eq!(spanning.as_ref(), &data[9000..11000]);
}

#[tokio::test]
async fn test_unattached_store_cannot_write() {
    let data = pattern(16384);
    let mut store = PieceStore::new(1, 16384, 16384, 16384, &digests_for(&data, 16384)).unwrap();
    assert!(matches!(
        store.on_block_received(0, 0, &data, PEER_A).await,
        Err(StorageError::NotAttached)
    ));
}

#[test]
fn test_file_set_rejects_handle_count() {
    assert!(matches!(
        FileSet::new(two_files(), Vec::new()),
        Err(StorageError::HandleCount { expected: 2, got: 0 })
    ));
}

#[tokio::test]
async fn test_existing_dir_provider_rejects_traversal() {
    use crate::metainfo::Metainfo;
    use std::sync::Arc;

    let temp = TempDir::new().unwrap();
    let metainfo = Metainfo::from_bytes(
        b"d4:infod5:filesld6:lengthi1e4:pathl2:..4:evileee4:name1:x12:piece lengthi16384eee",
    )
    .unwrap();
    let result = FileSet::open(
        &ExistingDirProvider,
        Arc::new(metainfo),
        temp.path().to_path_buf(),
    )
    .await;
    assert!(matches!(
        result,
        Err(StorageError::Provider(ProviderError::InvalidRequest(_)))
    ));
}
