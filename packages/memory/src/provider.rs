//! Code provider interface.
//!
//! Object layout and construction are not known to this crate. A
//! [`CodeProvider`] supplies, per object type, the size and alignment of
//! the shared and heap parts together with the constructor and destructor
//! routines that run over the raw buffers. In a full deployment the
//! provider fronts a JIT; [`FixedProvider`] serves deployments without one
//! and doubles as the instrumented provider used by tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use simmesh_ident::TypeId;

use crate::error::Result;

/// Size and alignment of one part of an object, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeAlignment {
    pub size: usize,
    pub alignment: usize,
}

impl SizeAlignment {
    pub const fn new(size: usize, alignment: usize) -> Self {
        Self { size, alignment }
    }
}

impl fmt::Display for SizeAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.size, self.alignment)
    }
}

/// A constructor or destructor routine operating on a raw object buffer.
pub type ObjectFn = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Everything the memory managers need to materialize one object type.
pub struct ObjectFunctions {
    pub shared: SizeAlignment,
    pub heap: SizeAlignment,
    pub shared_ctor: ObjectFn,
    pub shared_dtor: ObjectFn,
    pub heap_ctor: ObjectFn,
    pub heap_dtor: ObjectFn,
}

impl fmt::Debug for ObjectFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectFunctions")
            .field("shared", &self.shared)
            .field("heap", &self.heap)
            .finish()
    }
}

/// Source of per-type object functions.
pub trait CodeProvider: Send + Sync {
    /// Resolve the functions for one object type.
    ///
    /// Returns [`MemoryError::UnknownType`] when the type is not served.
    fn object_functions(&self, type_id: TypeId) -> Result<Arc<ObjectFunctions>>;
}

/// Per-manager cache over a [`CodeProvider`].
///
/// Each manager resolves a type at most once; repeated constructions hit
/// the cache.
pub struct FnCache {
    provider: Arc<dyn CodeProvider>,
    cache: HashMap<TypeId, Arc<ObjectFunctions>>,
}

impl FnCache {
    pub fn new(provider: Arc<dyn CodeProvider>) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    /// Functions for `type_id`, resolving through the provider on first use.
    pub fn get(&mut self, type_id: TypeId) -> Result<Arc<ObjectFunctions>> {
        if let Some(functions) = self.cache.get(&type_id) {
            return Ok(functions.clone());
        }
        let functions = self.provider.object_functions(type_id)?;
        self.cache.insert(type_id, functions.clone());
        Ok(functions)
    }

    pub fn provider(&self) -> &Arc<dyn CodeProvider> {
        &self.provider
    }
}

impl fmt::Debug for FnCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCache")
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Running construction/destruction totals kept by a [`FixedProvider`].
#[derive(Debug, Default)]
pub struct ProviderCounters {
    pub shared_ctor: AtomicUsize,
    pub shared_dtor: AtomicUsize,
    pub heap_ctor: AtomicUsize,
    pub heap_dtor: AtomicUsize,
}

impl ProviderCounters {
    /// Constructions minus destructions for the shared part.
    pub fn shared_live(&self) -> isize {
        self.shared_ctor.load(Ordering::SeqCst) as isize
            - self.shared_dtor.load(Ordering::SeqCst) as isize
    }

    /// Constructions minus destructions for the heap part.
    pub fn heap_live(&self) -> isize {
        self.heap_ctor.load(Ordering::SeqCst) as isize
            - self.heap_dtor.load(Ordering::SeqCst) as isize
    }
}

/// Provider serving every type with one fixed layout.
///
/// Constructors zero the buffer and bump the counters, so a harness can
/// check that every construction was matched by a destruction.
pub struct FixedProvider {
    shared: SizeAlignment,
    heap: SizeAlignment,
    counters: Arc<ProviderCounters>,
}

impl FixedProvider {
    pub fn new(shared: SizeAlignment, heap: SizeAlignment) -> Self {
        Self {
            shared,
            heap,
            counters: Arc::new(ProviderCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<ProviderCounters> {
        self.counters.clone()
    }
}

impl Default for FixedProvider {
    fn default() -> Self {
        Self::new(SizeAlignment::new(64, 8), SizeAlignment::new(32, 8))
    }
}

impl CodeProvider for FixedProvider {
    fn object_functions(&self, _type_id: TypeId) -> Result<Arc<ObjectFunctions>> {
        let counters = self.counters.clone();
        let shared_ctor = {
            let counters = counters.clone();
            Arc::new(move |buffer: &mut [u8]| {
                buffer.fill(0);
                counters.shared_ctor.fetch_add(1, Ordering::SeqCst);
            }) as ObjectFn
        };
        let shared_dtor = {
            let counters = counters.clone();
            Arc::new(move |_buffer: &mut [u8]| {
                counters.shared_dtor.fetch_add(1, Ordering::SeqCst);
            }) as ObjectFn
        };
        let heap_ctor = {
            let counters = counters.clone();
            Arc::new(move |buffer: &mut [u8]| {
                buffer.fill(0);
                counters.heap_ctor.fetch_add(1, Ordering::SeqCst);
            }) as ObjectFn
        };
        let heap_dtor = {
            let counters = counters.clone();
            Arc::new(move |_buffer: &mut [u8]| {
                counters.heap_dtor.fetch_add(1, Ordering::SeqCst);
            }) as ObjectFn
        };
        Ok(Arc::new(ObjectFunctions {
            shared: self.shared,
            heap: self.heap,
            shared_ctor,
            shared_dtor,
            heap_ctor,
            heap_dtor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_resolves_once() {
        struct Counting {
            inner: FixedProvider,
            lookups: AtomicUsize,
        }
        impl CodeProvider for Counting {
            fn object_functions(&self, type_id: TypeId) -> Result<Arc<ObjectFunctions>> {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                self.inner.object_functions(type_id)
            }
        }

        let provider = Arc::new(Counting {
            inner: FixedProvider::default(),
            lookups: AtomicUsize::new(0),
        });
        let mut cache = FnCache::new(provider.clone());

        let type_id = TypeId::new(7);
        cache.get(type_id).unwrap();
        cache.get(type_id).unwrap();
        cache.get(TypeId::new(8)).unwrap();

        assert_eq!(provider.lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fixed_provider_counts_constructions() {
        let provider = FixedProvider::default();
        let counters = provider.counters();
        let functions = provider.object_functions(TypeId::new(1)).unwrap();

        let mut buffer = vec![0xffu8; functions.shared.size];
        (functions.shared_ctor)(&mut buffer);
        assert!(buffer.iter().all(|b| *b == 0));
        (functions.shared_dtor)(&mut buffer);

        assert_eq!(counters.shared_live(), 0);
        assert_eq!(counters.heap_live(), 0);
    }
}
