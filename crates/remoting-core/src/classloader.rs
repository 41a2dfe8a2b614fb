//! Remote class/resource loading with JAR caching and prefetch. When the
//! external `Serializer` encounters a class identity the local side has
//! never seen, it resolves it through a [`RemoteClassLoaderProxy`] keyed by
//! the remote classloader's OID.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::command::Oid;
use crate::error::{Error, Result};
use crate::jarcache::{Checksum, JarCache};

/// What a `fetch(className)` RPC returns: either the class is shipped
/// inline, or as a reference into a JAR the receiver may already have
/// cached.
#[derive(Debug, Clone)]
pub enum ClassSource {
    Bytecode(Vec<u8>),
    Jar {
        checksum: Checksum,
        /// OID of the object on the sender side that can stream the JAR if
        /// it is not already cached (fed to `fetch_jar`).
        jar_oid: Oid,
        dependency_checksums: Vec<Checksum>,
    },
}

#[derive(Debug, Clone)]
pub struct ClassImage {
    pub remote_classloader_oid: Oid,
    pub class_name: String,
    pub source: ClassSource,
}

/// Capability a proxy classloader needs to resolve classes: issue a
/// `fetch(name)` RPC to the owning side, and stream a JAR by OID when one is
/// not yet cached. Implemented by the `Channel` in practice; abstracted here
/// so this module has no dependency on the channel dispatcher.
pub trait RemoteFetcher: Send + Sync {
    fn fetch_class(&self, remote_classloader_oid: Oid, class_name: &str) -> Result<ClassImage>;
    fn fetch_resource(&self, remote_classloader_oid: Oid, name: &str) -> Result<Option<Vec<u8>>>;
    fn fetch_resources(&self, remote_classloader_oid: Oid, name: &str) -> Result<Vec<Vec<u8>>>;
    fn fetch_jar(&self, jar_oid: Oid, checksum: Checksum) -> Result<Vec<u8>>;
}

/// One per remote classloader OID. Tracks which classes have already been
/// defined locally (to make `fetch` race-free: two concurrent lookups for
/// the same class converge on a single in-flight resolution) and which JARs
/// have been mapped in.
pub struct RemoteClassLoaderProxy {
    oid: Oid,
    fetcher: Arc<dyn RemoteFetcher>,
    jar_cache: Arc<JarCache>,
    /// Per-class lock plus the resolved bytecode once fetched, guarding
    /// against the race where two concurrent `fetch` calls for the same
    /// class must result in exactly one definition and both callers
    /// observing the same bytes.
    classes: DashMap<String, Arc<Mutex<Option<Vec<u8>>>>>,
    /// Checksums of JARs known to be resident in the cache for this proxy,
    /// recorded by both direct resolution and by prefetch metadata.
    resident_jars: DashMap<Checksum, ()>,
    /// className -> containing JAR checksum, once known (from a JAR
    /// reference response or a prefetch).
    jar_membership: DashMap<String, Checksum>,
}

impl RemoteClassLoaderProxy {
    pub fn new(oid: Oid, fetcher: Arc<dyn RemoteFetcher>, jar_cache: Arc<JarCache>) -> Self {
        Self {
            oid,
            fetcher,
            jar_cache,
            classes: DashMap::new(),
            resident_jars: DashMap::new(),
            jar_membership: DashMap::new(),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Resolve (and, conceptually, "define") `class_name`. Returns the raw
    /// bytecode to hand to the embedder's class-definition facility — this
    /// crate does not itself load code, since dynamic dispatch onto it
    /// requires the caller to provide an invoker function.
    pub fn resolve(&self, class_name: &str) -> Result<Vec<u8>> {
        let slot = self
            .classes
            .entry(class_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock();
        if let Some(bytes) = guard.as_ref() {
            // Another caller already resolved this class: the wire traffic
            // happens once, but every caller observes the same bytes.
            return Ok(bytes.clone());
        }

        if let Some(checksum) = self.jar_membership.get(class_name).map(|r| *r) {
            if let Some(path) = self.jar_cache.lookup_path(checksum) {
                let bytes = std::fs::read(&path).map_err(Error::Transport)?;
                *guard = Some(bytes.clone());
                return Ok(bytes);
            }
        }

        let image = self.fetcher.fetch_class(self.oid, class_name)?;
        let bytes = self.ingest(&image)?;
        *guard = Some(bytes.clone());
        Ok(bytes)
    }

    fn ingest(&self, image: &ClassImage) -> Result<Vec<u8>> {
        match &image.source {
            ClassSource::Bytecode(bytes) => Ok(bytes.clone()),
            ClassSource::Jar {
                checksum,
                jar_oid,
                dependency_checksums,
            } => {
                for dep in dependency_checksums {
                    self.resident_jars.entry(*dep).or_insert(());
                }
                if let Some(path) = self.jar_cache.lookup_path(*checksum) {
                    self.resident_jars.insert(*checksum, ());
                    return std::fs::read(&path).map_err(Error::Transport);
                }
                // Not cached: the "simple scheme" fallback while the JAR
                // transfers in the background would serve individual
                // bytecode fetches for classes in this JAR. We fetch the
                // whole JAR synchronously here because this crate exposes a
                // synchronous resolve() API; callers wanting the background
                // variant can call `start_jar_transfer` explicitly and keep
                // using `resolve` for cache hits only in the meantime.
                let content = self.fetcher.fetch_jar(*jar_oid, *checksum)?;
                let path = self.jar_cache.put(*checksum, &content)?;
                self.resident_jars.insert(*checksum, ());
                std::fs::read(&path).map_err(Error::Transport)
            }
        }
    }

    /// Apply a prefetched `ClassImage` shipped alongside a `fetch` response
    ///. Advisory: a prefetch for a class already resolved is
    /// a no-op; a JAR-reference prefetch only records membership metadata,
    /// it does not eagerly download the JAR.
    pub fn apply_prefetch(&self, image: ClassImage) {
        if self
            .classes
            .get(&image.class_name)
            .map(|s| s.lock().is_some())
            .unwrap_or(false)
        {
            return;
        }
        if let ClassSource::Jar { checksum, .. } = &image.source {
            self.jar_membership.insert(image.class_name.clone(), *checksum);
        }
    }

    pub fn get_resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.fetcher.fetch_resource(self.oid, name)
    }

    pub fn get_resources(&self, name: &str) -> Result<Vec<Vec<u8>>> {
        self.fetcher.fetch_resources(self.oid, name)
    }
}

/// Registry of proxy classloaders for one channel, keyed by the remote
/// classloader OID. We do not model the peer's delegation graph, only a
/// flat map of OID -> proxy.
pub struct ClassLoaderRegistry {
    proxies: DashMap<Oid, Arc<RemoteClassLoaderProxy>>,
    fetcher: Arc<dyn RemoteFetcher>,
    jar_cache: Arc<JarCache>,
}

impl ClassLoaderRegistry {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, jar_cache: Arc<JarCache>) -> Self {
        Self {
            proxies: DashMap::new(),
            fetcher,
            jar_cache,
        }
    }

    pub fn proxy_for(&self, remote_classloader_oid: Oid) -> Arc<RemoteClassLoaderProxy> {
        self.proxies
            .entry(remote_classloader_oid)
            .or_insert_with(|| {
                Arc::new(RemoteClassLoaderProxy::new(
                    remote_classloader_oid,
                    self.fetcher.clone(),
                    self.jar_cache.clone(),
                ))
            })
            .clone()
    }

    /// On channel close, proxy classloaders become inert: any subsequent
    /// resolution should fail rather than silently hang on a dead channel.
    pub fn clear(&self) {
        self.proxies.clear();
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }
}

/// Placeholder bytecode index used by a sender to compute prefetch
/// candidates.
/// A real embedder supplies the actual constant-pool scan; this type exists
/// so the "direct dependencies only" contract has a concrete, testable
/// shape independent of any particular bytecode format.
pub struct DependencyIndex {
    direct_deps: HashMap<String, Vec<String>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self {
            direct_deps: HashMap::new(),
        }
    }

    pub fn record(&mut self, class_name: impl Into<String>, direct_dependencies: Vec<String>) {
        self.direct_deps.insert(class_name.into(), direct_dependencies);
    }

    /// Only direct dependencies, never transitive ones, bounding response
    /// size.
    pub fn direct_dependencies(&self, class_name: &str) -> &[String] {
        self.direct_deps
            .get(class_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        fetch_calls: AtomicUsize,
        image: ClassImage,
    }

    impl RemoteFetcher for CountingFetcher {
        fn fetch_class(&self, _oid: Oid, _name: &str) -> Result<ClassImage> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.image.clone())
        }
        fn fetch_resource(&self, _oid: Oid, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn fetch_resources(&self, _oid: Oid, _name: &str) -> Result<Vec<Vec<u8>>> {
            Ok(Vec::new())
        }
        fn fetch_jar(&self, _jar_oid: Oid, _checksum: Checksum) -> Result<Vec<u8>> {
            panic!("inline bytecode test should never fetch a jar")
        }
    }

    fn tempdir(tag: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("remoting-classloader-test-{tag}-{}", std::process::id()));
        dir
    }

    #[test]
    fn second_resolve_of_same_class_does_not_refetch() {
        let fetcher = Arc::new(CountingFetcher {
            fetch_calls: AtomicUsize::new(0),
            image: ClassImage {
                remote_classloader_oid: 9,
                class_name: "Probe".into(),
                source: ClassSource::Bytecode(vec![0xCA, 0xFE]),
            },
        });
        let cache = Arc::new(JarCache::new(tempdir("resolve")));
        let proxy = RemoteClassLoaderProxy::new(9, fetcher.clone(), cache);

        let first = proxy.resolve("Probe").unwrap();
        assert_eq!(first, vec![0xCA, 0xFE]);
        let second = proxy.resolve("Probe").unwrap();
        assert_eq!(second, vec![0xCA, 0xFE]);
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jar_reference_is_cached_and_not_refetched() {
        let content = b"fake jar contents".to_vec();
        let checksum = Checksum::of(&content);
        let fetcher = Arc::new(CountingFetcher {
            fetch_calls: AtomicUsize::new(0),
            image: ClassImage {
                remote_classloader_oid: 9,
                class_name: "Probe".into(),
                source: ClassSource::Jar {
                    checksum,
                    jar_oid: 20,
                    dependency_checksums: vec![],
                },
            },
        });
        let dir = tempdir("jar");
        let cache = Arc::new(JarCache::new(&dir));
        cache.put(checksum, &content).unwrap();
        let proxy = RemoteClassLoaderProxy::new(9, fetcher.clone(), cache);

        let bytes = proxy.resolve("Probe").unwrap();
        assert_eq!(bytes, content);
        // Already cached: fetch_class is still called once to learn the
        // reference, but fetch_jar must never be invoked (cache hit).
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn prefetch_on_already_resolved_class_is_a_no_op() {
        let fetcher = Arc::new(CountingFetcher {
            fetch_calls: AtomicUsize::new(0),
            image: ClassImage {
                remote_classloader_oid: 9,
                class_name: "Probe".into(),
                source: ClassSource::Bytecode(vec![1]),
            },
        });
        let cache = Arc::new(JarCache::new(tempdir("prefetch")));
        let proxy = RemoteClassLoaderProxy::new(9, fetcher, cache);
        proxy.resolve("Probe").unwrap();
        proxy.apply_prefetch(ClassImage {
            remote_classloader_oid: 9,
            class_name: "Probe".into(),
            source: ClassSource::Bytecode(vec![2]),
        });
        // no panic, no state corruption; resolving again still returns fine
        assert!(proxy.resolve("Probe").is_ok());
    }

    #[test]
    fn dependency_index_only_reports_direct_dependencies() {
        let mut index = DependencyIndex::new();
        index.record("A", vec!["B".into()]);
        index.record("B", vec!["C".into()]);
        assert_eq!(index.direct_dependencies("A"), &["B".to_string()]);
        assert_eq!(index.direct_dependencies("Z"), &[] as &[String]);
    }
}
