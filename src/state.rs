use std::sync::{Arc, RwLock};

/// Single-writer, many-reader published value.
///
/// The writer replaces the whole record at once; readers clone the current
/// `Arc` and keep reading it while newer values get published.
pub struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        SnapshotCell { current: RwLock::new(Arc::new(value)) }
    }

    pub fn publish(&self, value: T) {
        self.publish_arc(Arc::new(value));
    }

    pub fn publish_arc(&self, value: Arc<T>) {
        // The lock only guards a pointer swap, a poisoned guard still holds a valid Arc
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = value;
    }

    pub fn snapshot(&self) -> Arc<T> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Copy-modify-publish for the single writer.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        self.publish(next);
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        SnapshotCell::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[derive(Clone, Default)]
    struct Record {
        generation: u64,
        a: u64,
        b: u64,
        label: String,
        samples: Vec<u64>,
    }

    impl Record {
        fn at(generation: u64) -> Self {
            Record {
                generation,
                a: generation,
                b: generation * 2,
                label: generation.to_string(),
                samples: vec![generation; 16],
            }
        }

        fn is_consistent(&self) -> bool {
            let g = self.generation;
            self.a == g
                && self.b == g * 2
                && self.label == g.to_string()
                && self.samples.len() == 16
                && self.samples.iter().all(|&s| s == g)
        }
    }

    #[test]
    fn test_publish_replaces_value() {
        let cell = SnapshotCell::new(1u32);
        let old = cell.snapshot();
        cell.publish(2);
        assert_eq!(*old, 1);
        assert_eq!(*cell.snapshot(), 2);
    }

    #[test]
    fn test_update_from_current() {
        let cell: SnapshotCell<Vec<u32>> = SnapshotCell::default();
        cell.update(|v| v.push(1));
        cell.update(|v| v.push(2));
        assert_eq!(*cell.snapshot(), vec![1, 2]);
    }

    #[test]
    fn test_concurrent_readers_never_see_mixed_records() {
        let cell = Arc::new(SnapshotCell::new(Record::at(0)));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut reads = 0u64;
                    let mut last = 0u64;
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        let snap = cell.snapshot();
                        let generation = snap.generation;
                        assert!(snap.is_consistent(), "torn record at generation {}", generation);
                        assert!(snap.generation >= last, "generation went backwards");
                        last = snap.generation;
                        reads += 1;
                        if finished {
                            break;
                        }
                    }
                    reads
                })
            })
            .collect();

        for g in 1..=20_000 {
            cell.publish(Record::at(g));
        }
        done.store(true, Ordering::SeqCst);

        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
        assert_eq!(cell.snapshot().generation, 20_000);
    }
}
