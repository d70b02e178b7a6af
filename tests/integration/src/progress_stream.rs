//! Progress events as newline-delimited JSON

use std::io::Write;
use std::sync::{Arc, Mutex};

use emu_sync_core::{
    Backend, JsonLinesSink, MemoryBackend, NoopRunLock, ProgressReporter, SyncEngine,
    SyncOptions,
};
use emu_sync_test_utils::{ManifestBuilder, TestTree};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn sync_emits_one_json_object_per_line() {
    let tree = TestTree::new();
    tree.write_file("roms/old.sfc", b"old");
    ManifestBuilder::new()
        .file("roms/old.sfc", b"old")
        .write_to(&tree.local_manifest_path());

    let backend = Arc::new(MemoryBackend::new());
    backend.put_object("roms/snes/Game.sfc", b"snes rom data".to_vec());
    backend
        .upload_manifest(
            &ManifestBuilder::new()
                .file("roms/snes/Game.sfc", b"snes rom data")
                .to_json(),
        )
        .unwrap();

    let buf = SharedBuf::default();
    let reporter = ProgressReporter::new(Arc::new(JsonLinesSink::new(buf.clone())));
    let engine = SyncEngine::new(backend, Arc::new(NoopRunLock)).with_progress(reporter);
    engine
        .run(&SyncOptions::new(tree.root(), tree.local_manifest_path()))
        .unwrap();

    let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let events: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(
        events,
        vec![
            json!({"event": "start", "file": "roms/snes/Game.sfc", "size": 13}),
            json!({"event": "complete", "file": "roms/snes/Game.sfc"}),
            json!({"event": "delete", "file": "roms/old.sfc"}),
            json!({
                "event": "done",
                "downloaded": 1,
                "deleted": 1,
                "retained": 0,
                "errors": 0,
                "skipped": 0
            }),
        ]
    );
}
