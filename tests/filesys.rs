//! File-system scenarios: hierarchical paths, extensible files, removal
//! accounting, pipes.

use minnow::fs::directory::Directory;
use minnow::fs::file_header::FileHeader;
use minnow::fs::open_file::OpenFile;
use minnow::fs::pipe::{PipeFile, MAX_PIPE_LEN};
use minnow::fs::{FsError, DIRECTORY_SECTOR};
use minnow::{Kernel, KernelOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn hierarchical_create_write_read_remove() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    let snapshot = fs.free_map_snapshot(&kernel);

    assert_eq!(fs.create(&kernel, "/a", None), Ok(()));
    assert_eq!(fs.create(&kernel, "/a/b", None), Ok(()));
    assert_eq!(fs.create(&kernel, "/a/b/c", Some(37)), Ok(()));

    let payload: Vec<u8> = (0..37u8).map(|b| b.wrapping_mul(7)).collect();
    {
        let file = fs.open(&kernel, "/a/b/c").expect("created above");
        assert_eq!(file.write(&kernel, &payload), 37);
    }
    {
        let file = fs.open(&kernel, "/a/b/c").expect("still there");
        let mut back = vec![0u8; 37];
        assert_eq!(file.read(&kernel, &mut back), 37);
        assert_eq!(back, payload);
        // Reading past the end yields nothing.
        let mut extra = [0u8; 8];
        assert_eq!(file.read_at(&kernel, &mut extra, 37), 0);
    }

    // A populated directory refuses removal.
    assert_eq!(fs.remove(&kernel, "/a"), Err(FsError::DirectoryNotEmpty));
    assert_eq!(fs.remove(&kernel, "/a/b"), Err(FsError::DirectoryNotEmpty));

    assert_eq!(fs.remove(&kernel, "/a/b/c"), Ok(()));
    assert_eq!(fs.remove(&kernel, "/a/b"), Ok(()));
    assert_eq!(fs.remove(&kernel, "/a"), Ok(()));

    // Every sector the subtree held is free again.
    assert_eq!(fs.free_map_snapshot(&kernel), snapshot);
}

#[test]
fn path_errors_and_collisions() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;

    assert_eq!(fs.create(&kernel, "relative", Some(1)), Err(FsError::PathError));
    assert_eq!(
        fs.create(&kernel, "/missing/x", Some(1)),
        Err(FsError::PathError)
    );
    assert_eq!(fs.open(&kernel, "/nothing").unwrap_err(), FsError::NotFound);
    assert_eq!(fs.remove(&kernel, "/nothing"), Err(FsError::NotFound));

    assert_eq!(fs.create(&kernel, "/dup", Some(4)), Ok(()));
    assert_eq!(fs.create(&kernel, "/dup", Some(4)), Err(FsError::NameCollision));
    assert_eq!(fs.create(&kernel, "/dup", None), Err(FsError::NameCollision));
}

#[test]
fn listing_includes_dot_entries() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/x", Some(1)).unwrap();
    fs.create(&kernel, "/y", None).unwrap();
    let names = fs.list(&kernel);
    assert_eq!(names, vec![".", "..", "x", "y"]);
}

#[test]
fn growth_through_the_indirect_tree_preserves_data() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/big", Some(0)).unwrap();
    let file = fs.open(&kernel, "/big").unwrap();

    // First write crosses from the direct range deep into the
    // two-level indirect tree.
    let first: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(file.write_at(&kernel, &first, 0), 2000);
    assert_eq!(file.length(&kernel), 2000);

    // Growing further must leave the old prefix in place.
    let second: Vec<u8> = (0..3000u32).map(|i| (i % 13) as u8).collect();
    assert_eq!(file.write_at(&kernel, &second, 2000), 3000);
    assert_eq!(file.length(&kernel), 5000);

    let mut back = vec![0u8; 5000];
    assert_eq!(file.read_at(&kernel, &mut back, 0), 5000);
    assert_eq!(&back[..2000], &first[..]);
    assert_eq!(&back[2000..], &second[..]);
}

#[test]
fn unaligned_overwrites_read_modify_write() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/patch", Some(300)).unwrap();
    let file = fs.open(&kernel, "/patch").unwrap();

    let base = vec![0xAAu8; 300];
    file.write_at(&kernel, &base, 0);
    // Overwrite a span straddling a sector boundary.
    let patch = vec![0x55u8; 40];
    assert_eq!(file.write_at(&kernel, &patch, 110), 40);

    let mut back = vec![0u8; 300];
    file.read_at(&kernel, &mut back, 0);
    assert!(back[..110].iter().all(|&b| b == 0xAA));
    assert!(back[110..150].iter().all(|&b| b == 0x55));
    assert!(back[150..].iter().all(|&b| b == 0xAA));
}

#[test]
fn create_then_remove_is_identity_on_the_bitmap() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    let before = fs.free_map_snapshot(&kernel);
    fs.create(&kernel, "/tmp", Some(500)).unwrap();
    assert_ne!(fs.free_map_snapshot(&kernel), before);
    fs.remove(&kernel, "/tmp").unwrap();
    assert_eq!(fs.free_map_snapshot(&kernel), before);
}

#[test]
fn no_space_fails_cleanly() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    let before = fs.free_map_snapshot(&kernel);
    // Far more than the disk holds.
    assert_eq!(
        fs.create(&kernel, "/huge", Some(1 << 20)),
        Err(FsError::NoSpace)
    );
    // The failed operation left no allocations behind.
    assert_eq!(fs.free_map_snapshot(&kernel), before);
    assert_eq!(fs.open(&kernel, "/huge").unwrap_err(), FsError::NotFound);
}

#[test]
fn inode_records_absolute_path_and_timestamps() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/dir", None).unwrap();
    fs.create(&kernel, "/dir/file", Some(10)).unwrap();

    let file = fs.open(&kernel, "/dir/file").unwrap();
    let hdr = FileHeader::fetch_from(&kernel, file.hdr_sector());
    assert_eq!(hdr.path_string(&kernel), "/dir/file");
    let created = hdr.create_time();
    assert!(!created.is_empty());

    file.write(&kernel, b"0123456789");
    let hdr = FileHeader::fetch_from(&kernel, file.hdr_sector());
    assert_ne!(hdr.modify_time(), created, "writes move the modify stamp");

    let dir = fs.open(&kernel, "/dir").unwrap();
    let dir_hdr = FileHeader::fetch_from(&kernel, dir.hdr_sector());
    assert_eq!(dir_hdr.path_string(&kernel), "/dir/");
}

#[test]
fn fetch_write_back_round_trips_the_free_map() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/seed", Some(64)).unwrap();
    let first = fs.free_map_snapshot(&kernel);
    // Snapshotting is a fetch; fetching again must see the same image.
    let second = fs.free_map_snapshot(&kernel);
    assert_eq!(first, second);
}

#[test]
fn dot_entries_bind_self_and_parent() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/a", None).unwrap();
    fs.create(&kernel, "/a/b", None).unwrap();

    let a = fs.open(&kernel, "/a").unwrap();
    let b = fs.open(&kernel, "/a/b").unwrap();
    let dir_b = Directory::fetch_from(&kernel, &b);
    assert_eq!(dir_b.find(&kernel, "."), Some(b.hdr_sector()));
    assert_eq!(dir_b.find(&kernel, ".."), Some(a.hdr_sector()));

    // The root is its own parent.
    let root_file = OpenFile::new(DIRECTORY_SECTOR);
    let root = Directory::fetch_from(&kernel, &root_file);
    assert_eq!(root.find(&kernel, "."), Some(DIRECTORY_SECTOR));
    assert_eq!(root.find(&kernel, ".."), Some(DIRECTORY_SECTOR));

    // Fetch after write-back sees the identical table.
    root.write_back(&kernel, &root_file);
    let again = Directory::fetch_from(&kernel, &root_file);
    assert_eq!(root.list(&kernel), again.list(&kernel));
    assert_eq!(again.find(&kernel, "a"), Some(a.hdr_sector()));
}

#[test]
fn pipe_is_a_bounded_mailbox() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let pipe = PipeFile::new("/mbox");
    pipe.open(&kernel).unwrap();

    assert!(pipe.read(&kernel, b"hello "));
    assert!(pipe.read(&kernel, b"world"));
    // Refuse what would overflow the mailbox.
    let big = vec![b'x'; MAX_PIPE_LEN];
    assert!(!pipe.read(&kernel, &big));

    // One write drains everything and resets the count.
    assert_eq!(pipe.write(&kernel), b"hello world".to_vec());
    assert_eq!(pipe.write(&kernel), Vec::<u8>::new());

    // Capacity is available again after the drain.
    assert!(pipe.read(&kernel, &big));
    assert_eq!(pipe.write(&kernel).len(), MAX_PIPE_LEN);

    pipe.remove(&kernel).unwrap();
    assert_eq!(
        kernel.file_system.open(&kernel, "/mbox").unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn print_dumps_the_tree() {
    init_logging();
    let kernel = Kernel::new(KernelOptions::default());
    let fs = &kernel.file_system;
    fs.create(&kernel, "/doc", Some(4)).unwrap();
    let file = fs.open(&kernel, "/doc").unwrap();
    file.write(&kernel, b"text");
    let dump = fs.print(&kernel);
    assert!(dump.contains("directory contents:"));
    assert!(dump.contains("name: doc"));
    assert!(dump.contains("text"));
}
