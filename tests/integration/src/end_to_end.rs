//! Admin uploads a tree to a filesystem bucket; devices sync from it.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use emu_sync_core::{
    Backend, DirectoryBackend, FileRunLock, RateLimiter, RetryPolicy, StatePaths, SyncEngine,
    SyncOptions, SyncSelection, UploadOptions, Uploader, verify,
};
use emu_sync_test_utils::TestTree;
use pretty_assertions::assert_eq;

struct Device {
    tree: TestTree,
    state: StatePaths,
}

impl Device {
    fn new() -> Self {
        let tree = TestTree::new();
        let state = StatePaths::in_dir(tree.state_dir());
        Self { tree, state }
    }

    fn engine(&self, backend: Arc<dyn Backend>) -> SyncEngine {
        SyncEngine::new(backend, Arc::new(FileRunLock::new(&self.state.lock_file)))
    }

    fn options(&self) -> SyncOptions {
        let mut opts = SyncOptions::new(self.tree.root(), &self.state.local_manifest);
        opts.retry = RetryPolicy::no_retry();
        opts
    }
}

fn admin_upload(admin: &TestTree, backend: Arc<dyn Backend>) {
    let state = StatePaths::in_dir(admin.state_dir());
    let uploader = Uploader::new(backend, Arc::new(FileRunLock::new(&state.lock_file)));
    let mut opts = UploadOptions::new(admin.root(), &state.upload_cache);
    opts.workers = 3;
    let report = uploader.run(&opts).unwrap();
    assert!(report.is_success(), "upload failed: {}", report.summary());
}

#[test]
fn upload_then_sync_mirrors_the_tree() {
    let admin = TestTree::new();
    admin.write_file("roms/snes/Game.sfc", b"snes rom data");
    admin.write_file("roms/gba/Other.gba", b"gba rom data");
    admin.write_file("bios/scph1001.bin", b"bios");
    admin.write_file("roms/.DS_Store", b"junk");

    let bucket: Arc<dyn Backend> = Arc::new(DirectoryBackend::new(admin.bucket_dir()).with_prefix("library"));
    admin_upload(&admin, bucket.clone());

    let device = Device::new();
    let mut opts = device.options();
    opts.workers = 2;
    let report = device.engine(bucket.clone()).run(&opts).unwrap();

    assert_eq!(report.downloaded.len(), 3);
    assert_eq!(
        TestTree::list_files(&device.tree.root()),
        vec![
            "bios/scph1001.bin".to_string(),
            "roms/gba/Other.gba".to_string(),
            "roms/snes/Game.sfc".to_string(),
        ]
    );
    device.tree.assert_file_contents("roms/snes/Game.sfc", b"snes rom data");

    let check = verify(&device.tree.root(), &device.state.local_manifest).unwrap();
    assert_eq!(check.ok.len(), 3);
}

#[test]
fn admin_changes_reach_the_device() {
    let admin = TestTree::new();
    admin.write_file("roms/snes/Game.sfc", b"snes rom data");
    admin.write_file("roms/snes/Old.sfc", b"old");
    let bucket: Arc<dyn Backend> = Arc::new(DirectoryBackend::new(admin.bucket_dir()));
    admin_upload(&admin, bucket.clone());

    let device = Device::new();
    let engine = device.engine(bucket.clone());
    engine.run(&device.options()).unwrap();

    admin.write_file("roms/snes/Game.sfc", b"snes rom data v2");
    admin.remove("roms/snes/Old.sfc");
    admin_upload(&admin, bucket.clone());

    let pending = engine.status(&device.options()).unwrap();
    assert_eq!(pending.modified, vec!["roms/snes/Game.sfc".to_string()]);
    assert_eq!(pending.deleted, vec!["roms/snes/Old.sfc".to_string()]);

    let report = engine.run(&device.options()).unwrap();
    assert_eq!(report.downloaded, vec!["roms/snes/Game.sfc".to_string()]);
    assert_eq!(report.deleted, vec!["roms/snes/Old.sfc".to_string()]);
    device.tree.assert_file_contents("roms/snes/Game.sfc", b"snes rom data v2");
    device.tree.assert_file_not_exists("roms/snes/Old.sfc");
    assert!(!admin.bucket_dir().join("roms").join("snes").join("Old.sfc").exists());
}

#[test]
fn corrupted_file_is_repaired_after_verify() {
    let admin = TestTree::new();
    admin.write_file("roms/nes/Game.nes", b"nes rom data");
    let bucket: Arc<dyn Backend> = Arc::new(DirectoryBackend::new(admin.bucket_dir()));
    admin_upload(&admin, bucket.clone());

    let device = Device::new();
    let engine = device.engine(bucket);
    engine.run(&device.options()).unwrap();

    device.tree.write_file("roms/nes/Game.nes", b"nes rom dat4");
    let check = engine.verify(&device.options()).unwrap();
    assert_eq!(check.mismatch, vec!["roms/nes/Game.nes".to_string()]);

    let report = engine.run(&device.options()).unwrap();
    assert_eq!(report.downloaded, vec!["roms/nes/Game.nes".to_string()]);
    device.tree.assert_file_contents("roms/nes/Game.nes", b"nes rom data");
}

#[test]
fn device_selection_and_excludes_apply() {
    let admin = TestTree::new();
    admin.write_file("roms/snes/Game.sfc", b"snes");
    admin.write_file("roms/psx/Big.bin", b"psx");
    admin.write_file("bios/scph1001.bin", b"bios");
    let bucket: Arc<dyn Backend> = Arc::new(DirectoryBackend::new(admin.bucket_dir()));
    admin_upload(&admin, bucket.clone());

    let device = Device::new();
    let mut opts = device.options();
    opts.selection = SyncSelection::new(["roms"]).with_exclude(["roms/psx/Big.bin"]);
    let report = device.engine(bucket).run(&opts).unwrap();

    assert_eq!(report.downloaded, vec!["roms/snes/Game.sfc".to_string()]);
    assert_eq!(
        TestTree::list_files(&device.tree.root()),
        vec!["roms/snes/Game.sfc".to_string()]
    );
}

#[test]
fn bandwidth_cap_slows_transfers() {
    let admin = TestTree::new();
    admin.write_file("roms/big.bin", &vec![7u8; 96 * 1024]);
    let plain: Arc<dyn Backend> = Arc::new(DirectoryBackend::new(admin.bucket_dir()));
    admin_upload(&admin, plain);

    // Bucket starts with 32 KiB of burst; the remaining 64 KiB takes about 2s
    let limiter = Arc::new(RateLimiter::new(32 * 1024));
    let capped: Arc<dyn Backend> =
        Arc::new(DirectoryBackend::new(admin.bucket_dir()).with_limiter(limiter));

    let device = Device::new();
    let started = Instant::now();
    let report = device.engine(capped).run(&device.options()).unwrap();

    assert_eq!(report.downloaded.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(fs::read(device.tree.path("roms/big.bin")).unwrap().len(), 96 * 1024);
}
