//! # Auxiliary Parameters
//!
//! Extra persistent state owned by an optimizer: moment buffers, accumulators, shared
//! counters. Checkpointing and parameter synchronization read this to know what besides
//! the model parameters has to be saved or kept in sync.

use crate::graph::BlobRef;
use parking_lot::Mutex;

/// Snapshot of an optimizer's auxiliary state.
///
/// * `local` holds one or more blobs per parameter, parallel to that parameter's
///   learning rate (e.g. Adagrad's squared-gradient sum).
/// * `shared` holds blobs referenced by every parameter the optimizer updates
///   (e.g. the iteration counter Adam reads for bias correction).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxParams {
    pub local: Vec<BlobRef>,
    pub shared: Vec<BlobRef>,
}

impl AuxParams {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.shared.is_empty()
    }

    pub fn local_names(&self) -> Vec<&str> {
        self.local.iter().map(BlobRef::name).collect()
    }

    pub fn shared_names(&self) -> Vec<&str> {
        self.shared.iter().map(BlobRef::name).collect()
    }
}

/// Append-only registry. Each [`register`](Self::register) call lands atomically, so a
/// concurrent reader sees either none or all of the handles one parameter contributed.
#[derive(Debug, Default)]
pub struct AuxParamRegistry {
    inner: Mutex<AuxParams>,
}

impl AuxParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one parameter's auxiliary handles. Shared handles already registered
    /// (same handle) are not added to the registry a second time, but the returned
    /// record always lists every handle the parameter was registered with.
    ///
    /// Callers must only pass handles whose initializing operator is already emitted.
    pub fn register(&self, local: Vec<BlobRef>, shared: Vec<BlobRef>) -> AuxParams {
        let mut aux = self.inner.lock();
        for blob in &shared {
            if !aux.shared.iter().any(|s| BlobRef::same_handle(s, blob)) {
                aux.shared.push(blob.clone());
            }
        }
        aux.local.extend(local.iter().cloned());
        AuxParams { local, shared }
    }

    pub fn snapshot(&self) -> AuxParams {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_registration_order_and_shared_dedup() {
        let mut graph = GraphBuilder::new("aux");
        let a = graph.declare_parameter("a", &[1]).unwrap();
        let b = graph.declare_parameter("b", &[1]).unwrap();
        let counter = graph.declare_parameter("counter", &[1]).unwrap();

        let registry = AuxParamRegistry::new();
        let first = registry.register(vec![a.clone()], vec![counter.clone()]);
        let second = registry.register(vec![b.clone()], vec![counter.clone()]);

        assert_eq!(first.shared_names(), vec!["counter"]);
        assert_eq!(second.shared_names(), vec!["counter"]);
        assert!(BlobRef::same_handle(&first.shared[0], &second.shared[0]));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.local_names(), vec!["a", "b"]);
        assert_eq!(snapshot.shared.len(), 1);
        assert!(BlobRef::same_handle(&snapshot.shared[0], &counter));
    }

    #[test]
    fn test_concurrent_registration_is_per_call_atomic() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let registry = Arc::new(AuxParamRegistry::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut graph = GraphBuilder::new("worker");
                    for i in 0..PER_THREAD {
                        let m1 = graph.declare_parameter(&format!("p{t}_{i}_m1"), &[2]).unwrap();
                        let m2 = graph.declare_parameter(&format!("p{t}_{i}_m2"), &[2]).unwrap();
                        registry.register(vec![m1, m2], Vec::new());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let local = registry.snapshot().local;
        assert_eq!(local.len(), THREADS * PER_THREAD * 2);
        // Each call's pair stays adjacent.
        for pair in local.chunks(2) {
            let first = pair[0].name().trim_end_matches("_m1");
            let second = pair[1].name().trim_end_matches("_m2");
            assert_eq!(first, second);
        }
    }
}
