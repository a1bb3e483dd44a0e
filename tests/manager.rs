use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

use rand::Rng;

use packrat::{
    AssetError, AssetLoader, AssetManager, BlobLoader, CellState, Handle, LoadContext,
    ManagerOptions, MemorySource, ScratchArena, TaskPool, WorkerPool,
};

/// Test loader that counts how often its load/unload bodies actually ran, and can be told
/// to fail its first N load attempts.
struct CountingLoader {
    key: String,
    loads: Arc<AtomicUsize>,
    unloads: Arc<AtomicUsize>,
    fail_remaining: Arc<AtomicUsize>,
    payload: Option<Vec<u8>>,
}

impl CountingLoader {
    fn new(key: &str, loads: &Arc<AtomicUsize>, unloads: &Arc<AtomicUsize>) -> Self {
        Self {
            key: key.to_string(),
            loads: loads.clone(),
            unloads: unloads.clone(),
            fail_remaining: Arc::new(AtomicUsize::new(0)),
            payload: None,
        }
    }

    fn failing_first(key: &str, failures: usize, loads: &Arc<AtomicUsize>) -> Self {
        Self {
            key: key.to_string(),
            loads: loads.clone(),
            unloads: Arc::new(AtomicUsize::new(0)),
            fail_remaining: Arc::new(AtomicUsize::new(failures)),
            payload: None,
        }
    }
}

impl AssetLoader for CountingLoader {
    type View = [u8];

    fn hash(&self) -> u64 {
        packrat::handle::hash_bytes(self.key.as_bytes())
    }

    fn load(&mut self, ctx: &mut LoadContext<'_>) -> Result<(), AssetError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
        {
            return Err(AssetError::NotFound);
        }

        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut staging = ctx.scratch.take_buffer();
        ctx.source.read_into(&self.key, &mut staging)?;
        self.payload = Some(staging.clone());
        ctx.scratch.recycle(staging);
        Ok(())
    }

    fn unload(&mut self, _scratch: &mut ScratchArena) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.payload = None;
    }

    fn view(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

/// Loader that blocks inside its load body until released, to freeze a cell in `loading`.
struct BlockingLoader {
    key: String,
    started: Mutex<Sender<()>>,
    gate: Mutex<Receiver<()>>,
}

impl AssetLoader for BlockingLoader {
    type View = [u8];

    fn hash(&self) -> u64 {
        packrat::handle::hash_bytes(self.key.as_bytes())
    }

    fn load(&mut self, _ctx: &mut LoadContext<'_>) -> Result<(), AssetError> {
        self.started
            .lock()
            .unwrap()
            .send(())
            .expect("test dropped the started receiver");
        self.gate
            .lock()
            .unwrap()
            .recv()
            .expect("test dropped the gate sender");
        Ok(())
    }

    fn unload(&mut self, _scratch: &mut ScratchArena) {}

    fn view(&self) -> &[u8] {
        &[]
    }
}

fn manager_with<L: AssetLoader + 'static>(source: MemorySource) -> AssetManager<L> {
    let pool = Arc::new(WorkerPool::new(2));
    AssetManager::with_parts(Arc::new(source), pool, ManagerOptions::default())
}

fn manager_with_pool<L: AssetLoader + 'static>(
    source: MemorySource,
    pool: Arc<dyn TaskPool>,
) -> AssetManager<L> {
    AssetManager::with_parts(Arc::new(source), pool, ManagerOptions::default())
}

#[test]
fn load_get_unget_unload_round_trip() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("maps/town.bin", b"town geometry".to_vec());
    let manager = manager_with(source);

    let handle = manager.load(CountingLoader::new("maps/town.bin", &loads, &unloads))?;
    assert_eq!(Some(CellState::Loaded(0)), manager.state(handle));

    let resource = manager.get(handle)?;
    assert_eq!(b"town geometry".as_slice(), resource.view());
    assert_eq!(Some(CellState::Loaded(1)), manager.state(handle));

    // Unloading with the reference outstanding must refuse and change nothing.
    assert!(!manager.unload(handle));
    assert_eq!(Some(CellState::Loaded(1)), manager.state(handle));

    manager.unget(resource);
    assert_eq!(Some(CellState::Loaded(0)), manager.state(handle));
    assert!(manager.unload(handle));
    assert_eq!(Some(CellState::Unloaded), manager.state(handle));
    assert_eq!(1, loads.load(Ordering::SeqCst));
    assert_eq!(1, unloads.load(Ordering::SeqCst));

    // A fresh load after the round trip runs the loader body exactly once more.
    let reloaded = manager.load(CountingLoader::new("maps/town.bin", &loads, &unloads))?;
    assert_eq!(handle, reloaded);
    assert_eq!(2, loads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn identical_hashes_share_one_cell() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new()
        .with_file("a.bin", b"a".to_vec())
        .with_file("b.bin", b"b".to_vec());
    let manager = manager_with(source);

    let first = manager.load(CountingLoader::new("a.bin", &loads, &unloads))?;
    let second = manager.load(CountingLoader::new("a.bin", &loads, &unloads))?;
    let other = manager.load(CountingLoader::new("b.bin", &loads, &unloads))?;

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(2, loads.load(Ordering::SeqCst));
    assert_eq!(2, manager.stats().cells);
    Ok(())
}

#[test]
fn concurrent_loads_of_one_key_run_the_body_once() -> Result<(), anyhow::Error> {
    const THREADS: usize = 8;

    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("contended.bin", b"payload".to_vec());
    let manager: AssetManager<CountingLoader> = manager_with(source);

    let threads = (0..THREADS)
        .map(|index| {
            let manager = manager.clone();
            let loads = loads.clone();
            let unloads = unloads.clone();
            std::thread::Builder::new()
                .name(format!("Loader-{}", index))
                .spawn(move || {
                    manager
                        .load(CountingLoader::new("contended.bin", &loads, &unloads))
                        .expect("concurrent load failed")
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    let handles = threads
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect::<Vec<_>>();

    // Exactly one thread executed the underlying read; all got the same handle.
    assert_eq!(1, loads.load(Ordering::SeqCst));
    assert!(handles.iter().all(|&handle| handle == handles[0]));

    let resource = manager.get(handles[0])?;
    assert_eq!(b"payload".as_slice(), resource.view());
    Ok(())
}

#[test]
fn try_get_never_blocks_on_a_loading_cell() -> Result<(), anyhow::Error> {
    let (started_tx, started_rx) = channel();
    let (gate_tx, gate_rx) = channel();

    let source = MemorySource::new();
    let manager: AssetManager<BlockingLoader> = manager_with(source);

    // Interning first pins the blocking loader instance inside the cell.
    let handle = manager.intern(BlockingLoader {
        key: "slow.bin".to_string(),
        started: Mutex::new(started_tx),
        gate: Mutex::new(gate_rx),
    });
    assert!(manager.try_get(handle).is_none(), "unloaded is unavailable");

    let loader_thread = {
        let manager = manager.clone();
        std::thread::Builder::new()
            .name("BlockedLoad".into())
            .spawn(move || {
                manager
                    .load(BlockingLoader {
                        key: "slow.bin".to_string(),
                        started: Mutex::new(channel().0),
                        gate: Mutex::new(channel().1),
                    })
                    .expect("blocked load failed")
            })
            .unwrap()
    };

    started_rx.recv()?;
    assert_eq!(Some(CellState::Loading), manager.state(handle));
    assert!(manager.try_get(handle).is_none(), "loading is unavailable");

    gate_tx.send(())?;
    loader_thread.join().unwrap();

    let resource = manager.try_get(handle);
    assert!(resource.is_some(), "loaded must be available");
    Ok(())
}

#[test]
fn get_loads_on_demand_after_eviction() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("evicted.bin", b"bytes".to_vec());
    let manager = manager_with(source);

    let handle = manager.load(CountingLoader::new("evicted.bin", &loads, &unloads))?;
    assert!(manager.unload(handle));
    assert_eq!(Some(CellState::Unloaded), manager.state(handle));

    // get() re-runs the load transition instead of failing.
    let resource = manager.get(handle)?;
    assert_eq!(b"bytes".as_slice(), resource.view());
    assert_eq!(2, loads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn two_references_block_unload_until_both_released() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("shared.bin", b"shared".to_vec());
    let manager = manager_with(source);

    let handle = manager.load(CountingLoader::new("shared.bin", &loads, &unloads))?;
    let first = manager.get(handle)?;
    let second = manager.get(handle)?;
    assert_eq!(Some(CellState::Loaded(2)), manager.state(handle));

    assert!(!manager.unload(handle));
    assert_eq!(Some(CellState::Loaded(2)), manager.state(handle));

    drop(first);
    assert!(!manager.unload(handle));

    manager.unget(second);
    assert_eq!(Some(CellState::Loaded(0)), manager.state(handle));
    assert!(manager.unload(handle));
    assert_eq!(Some(CellState::Unloaded), manager.state(handle));
    assert_eq!(1, unloads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn scheduled_loads_converge_once_the_pool_drains() {
    const FILES: usize = 24;

    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let mut source = MemorySource::new();
    for index in 0..FILES {
        source.insert(&format!("streamed/{}.bin", index), vec![index as u8]);
    }

    let pool = Arc::new(WorkerPool::new(4));
    let manager = manager_with_pool(source, pool.clone());

    let handles = (0..FILES)
        .map(|index| {
            manager.schedule_load(CountingLoader::new(
                &format!("streamed/{}.bin", index),
                &loads,
                &unloads,
            ))
        })
        .collect::<Vec<_>>();

    pool.shutdown();

    assert_eq!(FILES, loads.load(Ordering::SeqCst));
    for handle in handles {
        assert_eq!(Some(CellState::Loaded(0)), manager.state(handle));
    }
    assert_eq!(FILES as u64, manager.stats().scheduled);
}

#[test]
fn failed_scheduled_load_leaves_a_usable_cell() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("flaky.bin", b"eventually".to_vec());

    let pool = Arc::new(WorkerPool::new(1));
    let manager = manager_with_pool(source, pool.clone());

    // First attempt fails inside the worker; the failure is logged and swallowed there.
    let handle = manager.schedule_load(CountingLoader::failing_first("flaky.bin", 1, &loads));
    pool.shutdown();

    assert_eq!(Some(CellState::Unloaded), manager.state(handle));
    assert_eq!(1, manager.stats().load_failures);

    // The rolled-back cell accepts a retry; the interned loader has no failures left.
    let retried = manager.load(CountingLoader::failing_first("flaky.bin", 1, &loads))?;
    assert_eq!(handle, retried);
    assert_eq!(Some(CellState::Loaded(0)), manager.state(handle));
    assert_eq!(1, loads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn scheduled_unload_skips_referenced_cells() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("pinned.bin", b"pinned".to_vec());

    let pool = Arc::new(WorkerPool::new(1));
    let manager = manager_with_pool(source, pool.clone());

    let handle = manager.load(CountingLoader::new("pinned.bin", &loads, &unloads))?;
    let resource = manager.get(handle)?;

    manager.schedule_unload(handle);
    pool.shutdown();

    assert_eq!(Some(CellState::Loaded(1)), manager.state(handle));
    assert_eq!(b"pinned".as_slice(), resource.view());
    assert_eq!(0, unloads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn reference_counts_stay_consistent_under_contention() -> Result<(), anyhow::Error> {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 500;

    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new().with_file("hot.bin", b"hot".to_vec());
    let manager: AssetManager<CountingLoader> = manager_with(source);
    let handle = manager.load(CountingLoader::new("hot.bin", &loads, &unloads))?;

    let threads = (0..THREADS)
        .map(|index| {
            let manager = manager.clone();
            std::thread::Builder::new()
                .name(format!("Churn-{}", index))
                .spawn(move || {
                    let mut rng = rand::rng();
                    for iteration in 0..ITERATIONS {
                        if let Some(resource) = manager.try_get(handle) {
                            assert_eq!(b"hot".as_slice(), resource.view());
                            drop(resource);
                        }
                        // Mix in full load/unload churn from half the threads.
                        if index % 2 == 0 && iteration % 16 == 0 {
                            manager.unload(handle);
                        } else if let Ok(resource) = manager.get(handle) {
                            manager.unget(resource);
                        }
                        if iteration % 64 == 0 {
                            // Jitter so the threads do not lockstep through the loop.
                            std::thread::sleep(std::time::Duration::from_micros(
                                rng.random_range(0..100),
                            ));
                        }
                    }
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap();
    }

    // Quiescent point: every reference was released, so only the two stable states remain
    // and the body ran exactly once per observed load cycle.
    match manager.state(handle) {
        Some(CellState::Loaded(0)) | Some(CellState::Unloaded) => {}
        other => panic!("unexpected quiescent state: {:?}", other),
    }
    assert_eq!(
        loads.load(Ordering::SeqCst),
        unloads.load(Ordering::SeqCst) + usize::from(manager.state(handle) == Some(CellState::Loaded(0)))
    );
    Ok(())
}

#[test]
fn shutdown_sweeps_unreferenced_cells_and_reports_leaks() -> Result<(), anyhow::Error> {
    let loads = Arc::new(AtomicUsize::new(0));
    let unloads = Arc::new(AtomicUsize::new(0));
    let source = MemorySource::new()
        .with_file("swept.bin", b"swept".to_vec())
        .with_file("leaked.bin", b"leaked".to_vec());
    let manager = manager_with(source);

    manager.load(CountingLoader::new("swept.bin", &loads, &unloads))?;
    let leaked_handle = manager.load(CountingLoader::new("leaked.bin", &loads, &unloads))?;
    let pinned = manager.get(leaked_handle)?;

    assert_eq!(1, manager.shutdown());
    assert_eq!(Some(CellState::Loaded(1)), manager.state(leaked_handle));
    assert_eq!(1, unloads.load(Ordering::SeqCst));

    drop(pinned);
    assert_eq!(0, manager.shutdown());
    assert_eq!(2, unloads.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn blob_loader_round_trips_file_contents() -> Result<(), anyhow::Error> {
    let source = MemorySource::new().with_file("Textures\\UI\\Cursor.QOI", vec![7u8; 64]);
    let manager: AssetManager<BlobLoader> = manager_with(source);

    // Path canonicalization: backslashes and case must not split the cache.
    let handle = manager.load(BlobLoader::new("Textures\\UI\\Cursor.QOI"))?;
    assert_eq!(handle, manager.intern(BlobLoader::new("textures/ui/cursor.qoi")));

    let resource = manager.get(handle)?;
    assert_eq!(64, resource.view().len());
    assert_eq!(&[7u8; 64][..], resource.view());
    Ok(())
}

#[test]
fn missing_files_map_to_not_found() {
    let source = MemorySource::new();
    let manager: AssetManager<BlobLoader> = manager_with(source);

    let result = manager.load(BlobLoader::new("does/not/exist.bin"));
    assert_eq!(Err(AssetError::NotFound), result);

    // get() on a never-interned handle reports NotFound instead of panicking.
    let bogus = Handle::from_bytes(b"never interned");
    assert!(matches!(manager.get(bogus), Err(AssetError::NotFound)));
    assert!(manager.try_get(bogus).is_none());
}
