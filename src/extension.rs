//! Plug-in extension contract and registry.
//!
//! Extensions are singletons keyed by tag. Loading resolves declared
//! dependencies recursively through the registry; a dependency cycle is
//! a programmer error and is rejected at load time. The union of all
//! loaded extensions' namespaces is what service discovery advertises.

use std::any::Any;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::im::Im;
use crate::stanza::Stanza;

/// A loaded protocol extension.
///
/// Filters run on the IM dispatch task in extension load order. An
/// input filter returning `true` consumes the stanza: later filters and
/// the typed events are skipped. Output filters mutate in place and
/// cannot abort. Filters must not block; network work belongs on a
/// spawned task re-entering the normal pipeline. In particular, a
/// filter awaiting an IQ response would deadlock the dispatch task
/// that resolves it.
pub trait Extension: Send + Sync + 'static {
    /// Unique tag of this module.
    fn tag(&self) -> &'static str;

    /// XML namespaces this extension implements, fed to service
    /// discovery.
    fn namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    /// Inspect an inbound stanza; `true` consumes it.
    fn filter_input(&self, stanza: &mut Stanza, im: &Im) -> bool {
        let _ = (stanza, im);
        false
    }

    /// Mutate an outbound stanza before serialization.
    fn filter_output(&self, stanza: &mut Stanza) {
        let _ = stanza;
    }

    /// Called once this extension and its dependencies are registered.
    fn attached(&self, im: &Im) {
        let _ = im;
    }

    /// Called when the extension is unloaded or the session closes.
    fn detached(&self) {}
}

/// Constructor contract for loadable extensions.
pub trait ExtensionBuild: Extension + Sized {
    /// The registry tag; one instance per tag.
    const TAG: &'static str;

    /// Tags this extension requires; loaded first.
    fn dependencies() -> &'static [&'static str] {
        &[]
    }

    /// Build the instance. Dependencies are fetched with
    /// [`Im::load_extension`] from inside this constructor.
    fn build(im: &Arc<Im>) -> Result<Arc<Self>>;
}

/// Session-local set of loaded extensions.
pub struct ExtensionRegistry {
    /// Load order, which is also filter order.
    order: RwLock<Vec<Arc<dyn Extension>>>,
    /// Typed lookup by tag.
    by_tag: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    /// Tags currently being constructed, for cycle detection.
    loading: Mutex<Vec<&'static str>>,
}

impl ExtensionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            order: RwLock::new(Vec::new()),
            by_tag: DashMap::new(),
            loading: Mutex::new(Vec::new()),
        }
    }

    /// Fetch an already-loaded extension.
    pub fn get<E: ExtensionBuild>(&self) -> Option<Arc<E>> {
        self.by_tag
            .get(E::TAG)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<E>().ok())
    }

    /// Whether an extension with this tag is loaded.
    pub fn contains(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Load (or fetch) the singleton for `E`.
    pub fn load<E: ExtensionBuild>(&self, im: &Arc<Im>) -> Result<Arc<E>> {
        if let Some(existing) = self.get::<E>() {
            return Ok(existing);
        }

        {
            let mut loading = self.loading.lock().unwrap();
            if loading.contains(&E::TAG) {
                let mut cycle: Vec<&str> = loading.clone();
                cycle.push(E::TAG);
                return Err(Error::invalid_argument(format!(
                    "extension dependency cycle: {}",
                    cycle.join(" -> ")
                )));
            }
            loading.push(E::TAG);
        }

        let built = E::build(im);
        self.loading.lock().unwrap().retain(|tag| *tag != E::TAG);
        let extension = built?;

        // The constructor is responsible for loading what it declared.
        for dependency in E::dependencies() {
            if !self.by_tag.contains_key(dependency) {
                return Err(Error::invalid_argument(format!(
                    "extension {} declares dependency {dependency} but did not load it",
                    E::TAG
                )));
            }
        }

        self.by_tag.insert(
            E::TAG,
            Arc::clone(&extension) as Arc<dyn Any + Send + Sync>,
        );
        self.order
            .write()
            .unwrap()
            .push(Arc::clone(&extension) as Arc<dyn Extension>);
        extension.attached(im);
        Ok(extension)
    }

    /// Unload by tag, dropping its namespace advertisements.
    pub fn unload(&self, tag: &str) -> bool {
        let removed = self.by_tag.remove(tag).is_some();
        if removed {
            let mut order = self.order.write().unwrap();
            if let Some(index) = order.iter().position(|e| e.tag() == tag) {
                let extension = order.remove(index);
                extension.detached();
            }
        }
        removed
    }

    /// Snapshot of loaded extensions in filter order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Extension>> {
        self.order.read().unwrap().clone()
    }

    /// Union of all loaded extensions' namespaces.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .order
            .read()
            .unwrap()
            .iter()
            .flat_map(|e| e.namespaces())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// Detach everything, in reverse load order.
    pub fn clear(&self) {
        let mut order = self.order.write().unwrap();
        for extension in order.drain(..).rev() {
            extension.detached();
        }
        self.by_tag.clear();
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
