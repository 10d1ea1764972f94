use super::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn single_file_store(temp: &TempDir, piece_length: u64, size: u64) -> BlockStore {
    BlockStore::open(vec![(temp.path().join("test.dat"), size)], piece_length)
        .await
        .expect("test store creation")
}

#[tokio::test]
async fn test_open_sizes_files() {
    let temp = TempDir::new().unwrap();
    let store = BlockStore::open(
        vec![
            (temp.path().join("a/one.dat"), 100),
            (temp.path().join("a/empty.dat"), 0),
            (temp.path().join("b/two.dat"), 28),
        ],
        16,
    )
    .await
    .unwrap();

    assert_eq!(store.total_size(), 128);
    assert_eq!(store.piece_count(), 8);
    assert_eq!(std::fs::metadata(temp.path().join("a/one.dat")).unwrap().len(), 100);
    assert_eq!(std::fs::metadata(temp.path().join("a/empty.dat")).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(temp.path().join("b/two.dat")).unwrap().len(), 28);
}

#[tokio::test]
async fn test_open_resizes_existing_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("big.dat");
    std::fs::write(&path, vec![1u8; 500]).unwrap();

    let store = BlockStore::open(vec![(path.clone(), 77)], 16).await.unwrap();
    assert_eq!(store.total_size(), 77);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 77);
}

#[tokio::test]
async fn test_zero_piece_length_rejected() {
    let temp = TempDir::new().unwrap();
    let result = BlockStore::open(vec![(temp.path().join("x"), 10)], 0).await;
    assert!(matches!(result, Err(StorageError::ZeroPieceLength)));
}

#[tokio::test]
async fn test_write_and_read_block() {
    let temp = TempDir::new().unwrap();
    let store = single_file_store(&temp, 32768, 65536).await;

    let block = pattern(16384);
    store.write_block(0, 0, &block).await.unwrap();
    store.write_block(1, 16384, &block).await.unwrap();

    assert_eq!(store.read_block(0, 0, 16384).await.unwrap().as_ref(), block.as_slice());
    assert_eq!(store.read_block(1, 16384, 16384).await.unwrap().as_ref(), block.as_slice());
}

#[tokio::test]
async fn test_block_across_file_boundary() {
    let temp = TempDir::new().unwrap();
    let store = BlockStore::open(
        vec![
            (temp.path().join("test1"), 15),
            (temp.path().join("test2"), 7),
        ],
        4,
    )
    .await
    .unwrap();

    let data: Vec<u8> = b"0000111122223333444455".to_vec();
    store.write_block(0, 0, &data).await.unwrap();

    assert_eq!(std::fs::read(temp.path().join("test1")).unwrap(), b"000011112222333");
    assert_eq!(std::fs::read(temp.path().join("test2")).unwrap(), b"3444455");

    let block = store.read_block(3, 2, 4).await.unwrap();
    assert_eq!(block.as_ref(), b"3344");
}

#[tokio::test]
async fn test_round_trip_with_empty_files_between() {
    let temp = TempDir::new().unwrap();
    let store = BlockStore::open(
        vec![
            (temp.path().join("empty0"), 0),
            (temp.path().join("first"), 10),
            (temp.path().join("empty1"), 0),
            (temp.path().join("empty2"), 0),
            (temp.path().join("second"), 3),
            (temp.path().join("third"), 20),
            (temp.path().join("empty3"), 0),
        ],
        8,
    )
    .await
    .unwrap();
    assert_eq!(store.total_size(), 33);
    assert_eq!(store.piece_count(), 5);

    let data = pattern(17);
    store.write_block(0, 6, &data).await.unwrap();

    let read = store.read_block(0, 6, 17).await.unwrap();
    assert_eq!(read.as_ref(), data.as_slice());

    assert_eq!(std::fs::read(temp.path().join("second")).unwrap(), &data[4..7]);
    assert!(std::fs::read(temp.path().join("empty1")).unwrap().is_empty());

    // same bytes addressed through a different piece
    let read = store.read_block(1, 0, 10).await.unwrap();
    assert_eq!(read.as_ref(), &data[2..12]);
}

#[tokio::test]
async fn test_write_does_not_touch_neighbours() {
    let temp = TempDir::new().unwrap();
    let store = BlockStore::open(
        vec![
            (temp.path().join("left"), 8),
            (temp.path().join("right"), 8),
        ],
        16,
    )
    .await
    .unwrap();

    store.write_block(0, 0, &[0xAA; 16]).await.unwrap();
    store.write_block(0, 6, &[0x11; 4]).await.unwrap();

    assert_eq!(
        std::fs::read(temp.path().join("left")).unwrap(),
        [0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x11, 0x11]
    );
    assert_eq!(
        std::fs::read(temp.path().join("right")).unwrap(),
        [0x11, 0x11, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]
    );
}

#[tokio::test]
async fn test_last_piece_is_shorter() {
    let temp = TempDir::new().unwrap();
    let store = single_file_store(&temp, 16, 77).await;

    assert_eq!(store.piece_count(), 5);
    assert_eq!(store.piece_size(0).unwrap(), 16);
    assert_eq!(store.piece_size(4).unwrap(), 13);

    let data = pattern(77);
    store.write_block(0, 0, &data).await.unwrap();

    let last = store.read_piece(4).await.unwrap();
    assert_eq!(last.as_ref(), &data[64..]);
}

#[tokio::test]
async fn test_out_of_range() {
    let temp = TempDir::new().unwrap();
    let store = single_file_store(&temp, 16, 77).await;

    let result = store.read_block(4, 0, 14).await;
    assert!(matches!(result, Err(StorageError::OutOfRange { total: 77, .. })));

    let result = store.write_block(4, 10, &[0u8; 4]).await;
    assert!(matches!(result, Err(StorageError::OutOfRange { .. })));

    assert!(store.read_block(4, 12, 1).await.is_ok());
}

#[tokio::test]
async fn test_invalid_piece_index() {
    let temp = TempDir::new().unwrap();
    let store = single_file_store(&temp, 16384, 32768).await;

    let result = store.read_piece(2).await;
    assert!(matches!(result, Err(StorageError::InvalidPieceIndex(2))));
}

#[tokio::test]
async fn test_open_in_rejects_traversal() {
    let temp = TempDir::new().unwrap();

    let result =
        BlockStore::open_in(temp.path(), vec![(PathBuf::from("../escape.dat"), 10)], 4).await;
    assert!(matches!(result, Err(StorageError::PathTraversal(_))));

    let store = BlockStore::open_in(temp.path(), vec![(PathBuf::from("dir/ok.dat"), 10)], 4)
        .await
        .unwrap();
    assert_eq!(store.files()[0].path, temp.path().join("dir/ok.dat"));
}

#[test]
fn test_layout_offsets() {
    let files = FileEntry::layout(vec![
        (PathBuf::from("a"), 5),
        (PathBuf::from("b"), 0),
        (PathBuf::from("c"), 7),
    ]);
    assert_eq!(files[1].offset, 5);
    assert_eq!(files[2].offset, 5);
    assert_eq!(files[2].end(), 12);
    assert!(!files[1].contains_offset(5));
}
