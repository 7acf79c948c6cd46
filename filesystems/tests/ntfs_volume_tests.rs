// Integration tests for the NTFS engine
// Format a device, mount it and drive the public volume API end to end.

use std::sync::Arc;
use strata_core::{BlockDevice, FileBlockDevice, FormatOptions, MemoryBlockDevice, StrataError, VolumeConfig, VolumeFormatter};
use strata_filesystems::ntfs::attributes::AttributeRecord;
use strata_filesystems::ntfs::index::IndexRoot;
use strata_filesystems::ntfs::structures::AttributeType;
use strata_filesystems::{NtfsFormatter, NtfsVolume};
use tempfile::NamedTempFile;

const MIB: u64 = 1024 * 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn format_memory(size: u64, options: &FormatOptions) -> (Arc<MemoryBlockDevice>, NtfsVolume) {
    init_logging();
    let device = Arc::new(MemoryBlockDevice::with_size(512, size));
    NtfsFormatter.format(device.clone(), options).expect("format");
    let volume = NtfsVolume::open(device.clone(), VolumeConfig::default()).expect("mount");
    (device, volume)
}

fn pattern(length: usize, seed: u8) -> Vec<u8> {
    (0..length).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn names_in(volume: &NtfsVolume, path: &str) -> Vec<String> {
    let directory = volume.get_file_record(path).unwrap().reference();
    volume
        .get_file_name_records_in_directory(directory)
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect()
}

fn index_root(record: &strata_filesystems::FileRecord) -> IndexRoot {
    match record.get_attribute(AttributeType::INDEX_ROOT, "$I30") {
        Some(AttributeRecord::Resident(r)) => IndexRoot::parse(&r.data).unwrap(),
        other => panic!("unexpected $INDEX_ROOT {:?}", other),
    }
}

#[test]
fn test_write_and_read_back_file_in_subdirectory() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    volume.create_file_at_path("\\A", true).unwrap();
    let file = volume.create_file_at_path("\\A\\test.txt", false).unwrap();

    let data = pattern(10000, 7);
    volume.write_file(file.reference(), 0, &data).unwrap();
    assert_eq!(volume.read_file(file.reference(), 0, 10000).unwrap(), data);
    assert_eq!(volume.get_file_record("\\A\\test.txt").unwrap().data_length(), 10000);
}

#[test]
fn test_directory_index_splits_keep_collation_order() {
    let options = FormatOptions {
        bytes_per_index_record: 256,
        ..FormatOptions::default()
    };
    let (_device, volume) = format_memory(64 * MIB, &options);
    let directory = volume.create_file_at_path("\\dir", true).unwrap();
    for name in ["m", "d", "a", "z", "b"] {
        volume.create_file(directory.reference(), name, false).unwrap();
    }

    assert_eq!(names_in(&volume, "\\dir"), vec!["a", "b", "d", "m", "z"]);
    let record = volume.get_file_record("\\dir").unwrap();
    assert!(index_root(&record).is_parent_node);
    assert!(record.has_attribute(AttributeType::INDEX_ALLOCATION, "$I30"));
}

#[test]
fn test_deleting_last_file_collapses_directory_index() {
    let options = FormatOptions {
        bytes_per_index_record: 256,
        ..FormatOptions::default()
    };
    let (_device, volume) = format_memory(64 * MIB, &options);
    let directory = volume.create_file_at_path("\\dir", true).unwrap().reference();
    let free = volume.free_clusters().unwrap();
    for name in ["m", "d", "a", "z", "b"] {
        volume.create_file(directory, name, false).unwrap();
    }
    assert!(volume
        .get_file_record("\\dir")
        .unwrap()
        .has_attribute(AttributeType::INDEX_ALLOCATION, "$I30"));

    for name in ["a", "z", "d", "b"] {
        volume.delete_file(directory, name).unwrap();
    }
    assert_eq!(names_in(&volume, "\\dir"), vec!["m"]);
    volume.delete_file(directory, "m").unwrap();

    let record = volume.get_file_record("\\dir").unwrap();
    let root = index_root(&record);
    assert!(!root.is_parent_node);
    assert_eq!(root.entries.len(), 1);
    assert!(root.entries[0].is_last_entry);
    assert!(!record.has_attribute(AttributeType::INDEX_ALLOCATION, "$I30"));
    assert!(!record.has_attribute(AttributeType::BITMAP, "$I30"));
    assert_eq!(volume.free_clusters().unwrap(), free);
    volume.delete_file_at_path("\\dir").unwrap();
}

#[test]
fn test_deleted_file_reference_is_stale() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let root = volume.root_directory_reference().unwrap();
    let free_records = volume.free_file_records().unwrap();
    let file = volume.create_file(root, "gone.bin", false).unwrap();
    volume.write_file(file.reference(), 0, &pattern(50000, 1)).unwrap();
    let free = volume.free_clusters().unwrap();
    assert_eq!(volume.free_file_records().unwrap(), free_records - 1);

    volume.delete_file(root, "gone.bin").unwrap();
    assert_eq!(volume.free_file_records().unwrap(), free_records);
    let err = volume.get_file_record_by_reference(file.reference()).unwrap_err();
    assert!(matches!(err, StrataError::StaleReference(_)));
    assert!(err.is_not_found());
    assert!(volume.free_clusters().unwrap() >= free + 50000 / 4096);
    assert!(matches!(
        volume.delete_file(root, "gone.bin"),
        Err(StrataError::NotFound(_))
    ));
}

#[test]
fn test_move_file_matches_reference_driver() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let root = volume.root_directory_reference().unwrap();
    let source = volume.create_file(root, "src", true).unwrap();
    let target = volume.create_file(root, "dst", true).unwrap();
    let file = volume.create_file(source.reference(), "old.txt", false).unwrap();
    volume.write_file(file.reference(), 0, b"payload").unwrap();
    let before = volume
        .get_file_record_by_reference(file.reference())
        .unwrap()
        .long_file_name()
        .unwrap()
        .unwrap();

    volume.move_file(file.reference(), target.reference(), "new.txt").unwrap();

    assert!(names_in(&volume, "\\src").is_empty());
    assert_eq!(names_in(&volume, "\\dst"), vec!["new.txt"]);
    let moved = volume.get_file_record("\\dst\\new.txt").unwrap();
    assert_eq!(moved.reference(), file.reference());
    let after = moved.long_file_name().unwrap().unwrap();
    assert_eq!(after.parent_directory, target.reference());
    // The renamed $FILE_NAME keeps the old timestamps and sizes rather than refreshing them
    assert_eq!(after.timestamps, before.timestamps);
    assert_eq!(after.file_size, before.file_size);
    assert_eq!(after.allocated_length, before.allocated_length);
    assert_eq!(volume.read_file(moved.reference(), 0, 100).unwrap(), b"payload");
}

#[test]
fn test_move_onto_existing_name_fails() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let root = volume.root_directory_reference().unwrap();
    let first = volume.create_file(root, "first", false).unwrap();
    volume.create_file(root, "second", false).unwrap();
    assert!(matches!(
        volume.move_file(first.reference(), root, "SECOND"),
        Err(StrataError::AlreadyExists(_))
    ));
    // Changing only the case of a name is a rename onto itself
    volume.move_file(first.reference(), root, "FIRST").unwrap();
    assert!(names_in(&volume, "\\").contains(&"FIRST".to_string()));
}

#[test]
fn test_large_file_grows_and_shrinks() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let root = volume.root_directory_reference().unwrap();
    let file = volume.create_file(root, "big.dat", false).unwrap().reference();
    let free = volume.free_clusters().unwrap();

    // Small writes stay resident, the third one forces the move out of the record
    volume.write_file(file, 0, &pattern(100, 1)).unwrap();
    volume.write_file(file, 100, &pattern(100, 2)).unwrap();
    let head = volume.read_file(file, 0, 200).unwrap();
    volume.write_file(file, 200, &pattern(MIB as usize, 3)).unwrap();
    assert_eq!(volume.read_file(file, 0, 200).unwrap(), head);
    assert_eq!(volume.read_file(file, 200, MIB as usize).unwrap(), pattern(MIB as usize, 3));

    volume.set_file_length(file, 8192).unwrap();
    assert_eq!(volume.get_file_record_by_reference(file).unwrap().data_length(), 8192);
    assert_eq!(volume.free_clusters().unwrap(), free - 2);

    // Extending past the written data reads back zeros
    volume.set_file_length(file, 20000).unwrap();
    assert!(volume.read_file(file, 8192, 20000).unwrap().iter().all(|b| *b == 0));
}

#[test]
fn test_changes_survive_remount() {
    let (device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    volume.create_file_at_path("\\docs", true).unwrap();
    for i in 0..40 {
        let file = volume
            .create_file_at_path(&format!("\\docs\\note-{:02}.txt", i), false)
            .unwrap();
        volume.write_file(file.reference(), 0, &pattern(3000, i as u8)).unwrap();
    }
    volume.close().unwrap();

    let volume = NtfsVolume::open(device, VolumeConfig::default()).unwrap();
    let names = names_in(&volume, "\\docs");
    assert_eq!(names.len(), 40);
    assert_eq!(names[0], "note-00.txt");
    let file = volume.get_file_record("\\docs\\note-17.txt").unwrap();
    assert_eq!(volume.read_file(file.reference(), 0, 3000).unwrap(), pattern(3000, 17));
}

#[test]
fn test_read_only_mount_rejects_writes() {
    let (device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let file = volume.create_file_at_path("\\keep.txt", false).unwrap();
    volume.write_file(file.reference(), 0, b"kept").unwrap();
    volume.close().unwrap();

    let volume = NtfsVolume::open(device, VolumeConfig::read_only()).unwrap();
    let records_before = volume.log_stats().unwrap().records_written;
    let root = volume.root_directory_reference().unwrap();
    assert!(matches!(
        volume.create_file(root, "new.txt", false),
        Err(StrataError::AccessDenied(_))
    ));
    assert!(matches!(
        volume.write_file(file.reference(), 0, b"over"),
        Err(StrataError::AccessDenied(_))
    ));
    assert!(matches!(volume.delete_file(root, "keep.txt"), Err(StrataError::AccessDenied(_))));
    assert_eq!(volume.log_stats().unwrap().records_written, records_before);
    assert_eq!(volume.read_file(file.reference(), 0, 4).unwrap(), b"kept");
    volume.close().unwrap();
}

#[test]
fn test_invalid_names_are_rejected_before_any_change() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let root = volume.root_directory_reference().unwrap();
    let records = volume.log_stats().unwrap().records_written;
    assert!(matches!(volume.create_file(root, "a|b", false), Err(StrataError::InvalidInput(_))));
    assert!(matches!(
        volume.create_file(root, &"n".repeat(256), false),
        Err(StrataError::InvalidInput(_))
    ));
    assert!(matches!(volume.get_file_record("no\\root"), Err(StrataError::InvalidPath(_))));
    assert!(matches!(volume.set_volume_label(&"L".repeat(40)), Err(StrataError::InvalidInput(_))));
    assert_eq!(volume.log_stats().unwrap().records_written, records);
}

#[test]
fn test_image_file_volume() {
    init_logging();
    let image = NamedTempFile::new().unwrap();
    {
        let device = Arc::new(FileBlockDevice::create(image.path(), 512, 32 * MIB).unwrap());
        let options = FormatOptions {
            label: Some("IMAGE".to_string()),
            ..FormatOptions::default()
        };
        NtfsFormatter.format(device.clone(), &options).unwrap();
        let volume = NtfsVolume::open(device, VolumeConfig::default()).unwrap();
        let file = volume.create_file_at_path("\\hello.txt", false).unwrap();
        volume.write_file(file.reference(), 0, b"hello from an image").unwrap();
        volume.close().unwrap();
    }

    let device = Arc::new(FileBlockDevice::open(image.path(), 512, true).unwrap());
    assert!(device.is_read_only());
    let volume = NtfsVolume::open(device, VolumeConfig::read_only()).unwrap();
    assert_eq!(volume.volume_label().unwrap(), "IMAGE");
    let file = volume.get_file_record("\\HELLO.TXT").unwrap();
    assert_eq!(volume.read_file(file.reference(), 0, 64).unwrap(), b"hello from an image");
}

#[test]
fn test_mount_rejects_unformatted_device() {
    init_logging();
    let device = Arc::new(MemoryBlockDevice::with_size(512, 8 * MIB));
    let result = NtfsVolume::open(device, VolumeConfig::default());
    assert!(matches!(result, Err(StrataError::InvalidData(_))));
}

#[test]
fn test_log_stats_report_activity() {
    let (_device, volume) = format_memory(64 * MIB, &FormatOptions::default());
    let before = volume.log_stats().unwrap();
    volume.create_file_at_path("\\logged.txt", false).unwrap();
    let after = volume.log_stats().unwrap();
    assert!(after.records_written > before.records_written);
    assert_eq!(after.active_transactions, 0);

    let json = serde_json::to_value(&after).unwrap();
    assert_eq!(json["records_written"], after.records_written);
}
