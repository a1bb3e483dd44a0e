use std::sync::Arc;
use std::time::Duration;

use packrat::ScratchPool;

#[test]
fn concurrent_leases_never_share_an_arena() {
    const THREADS: usize = 8;
    const ARENAS: usize = 2;

    let pool = Arc::new(ScratchPool::new(ARENAS, 1 << 16));

    let threads = (0..THREADS)
        .map(|index| {
            let pool = pool.clone();
            std::thread::Builder::new()
                .name(format!("Scratch-{}", index))
                .spawn(move || {
                    for round in 0..50 {
                        let mut lease = pool.acquire();
                        let mut buf = lease.take_buffer();
                        buf.extend_from_slice(&[index as u8; 128]);
                        // Exclusive access: nobody else appended to our buffer.
                        assert!(buf.iter().all(|&byte| byte == index as u8));
                        lease.recycle(buf);
                        if round % 10 == 0 {
                            std::thread::sleep(Duration::from_micros(50));
                        }
                    }
                })
                .unwrap()
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap();
    }

    // Every overflow user released its lease again.
    assert_eq!(0, pool.overflow_in_use());

    // All pooled arenas are back and respect the retained ceiling.
    let leases = (0..ARENAS).map(|_| pool.acquire()).collect::<Vec<_>>();
    assert_eq!(0, pool.overflow_in_use());
    for lease in &leases {
        assert!(lease.retained_bytes() <= 1 << 16);
    }
}
