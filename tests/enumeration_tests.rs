use std::collections::HashSet;
use std::io::Write;
use std::net::Ipv4Addr;

use resolver_scan_rs::error::ScanError;
use resolver_scan_rs::ranges::RangeList;

#[tokio::test]
async fn small_range_file_is_counted_and_enumerated_once() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "# test ranges").unwrap();
    writeln!(file, "10.0.0.0/30").unwrap();
    writeln!(file, "not-a-cidr").unwrap();
    writeln!(file, "300.1.1.1/24").unwrap();
    file.flush().unwrap();

    let ranges = RangeList::load_async(file.path().to_path_buf())
        .await
        .expect("load ok");
    assert_eq!(ranges.total_addresses(), 2);
    assert_eq!(ranges.skipped(), 2);

    let emitted: Vec<Ipv4Addr> = ranges.enumerate(500).flatten().collect();
    let unique: HashSet<Ipv4Addr> = emitted.iter().copied().collect();
    assert_eq!(emitted.len(), unique.len());
    assert_eq!(
        unique,
        HashSet::from([Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)])
    );
}

#[tokio::test]
async fn file_without_ranges_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "# only comments").unwrap();
    writeln!(file, "garbage").unwrap();
    file.flush().unwrap();

    let err = RangeList::load_async(file.path().to_path_buf())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NoAddresses { .. }));
}

#[tokio::test]
async fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RangeList::load_async(dir.path().join("absent.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::RangeFile { .. }));
}

#[test]
fn wide_range_enumerates_every_block_once() {
    let ranges = RangeList::parse("172.16.0.0/22\n");
    let emitted: Vec<Ipv4Addr> = ranges.enumerate(100).flatten().collect();
    let unique: HashSet<Ipv4Addr> = emitted.iter().copied().collect();
    assert_eq!(emitted.len(), unique.len());
    // Four /24 blocks, each without its .0 and .255.
    assert_eq!(unique.len(), 4 * 254);
    assert!(!unique.contains(&Ipv4Addr::new(172, 16, 1, 0)));
    assert!(!unique.contains(&Ipv4Addr::new(172, 16, 2, 255)));
}
