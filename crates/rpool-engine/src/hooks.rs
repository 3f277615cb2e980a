//! Named extension points around core operations.
//!
//! A plugin is a metadata record plus one capability: handling events,
//! transforming chunk bytes, or overriding remote selection. Handlers run
//! synchronously on the calling task; a handler error is logged and the
//! remaining handlers still run. An event handler may return a replacement
//! context which is threaded into the next handler.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

use crate::balancer::RemoteStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    PreUpload,
    PostUpload,
    PreDownload,
    PostDownload,
    PreDelete,
    PostDelete,
    PreChunk,
    PostChunk,
    PreBalance,
    PostBalance,
    FileVerified,
    FileRepaired,
    ChunkMissing,
    RemoteError,
}

/// Context map handed to event handlers.
pub type HookContext = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    EventHandler,
    Transformer,
    Balancer,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub kind: PluginKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    pub enabled: bool,
}

pub trait EventHandler: Send + Sync {
    /// Returning `Some(map)` replaces the context for subsequent handlers.
    fn handle(&self, hook: Hook, context: &HookContext) -> anyhow::Result<Option<HookContext>>;
}

pub trait Transformer: Send + Sync {
    fn transform_upload(&self, data: Bytes) -> anyhow::Result<Bytes>;
    fn transform_download(&self, data: Bytes) -> anyhow::Result<Bytes>;
}

pub trait RemoteSelector: Send + Sync {
    /// Returning `None` defers to the built-in balancer.
    fn select_remote(&self, remotes: &[RemoteStatus], chunk_size: u64) -> Option<String>;
}

/// The capability a plugin contributes, tagged by kind.
pub enum Capability {
    HandleEvent(Box<dyn EventHandler>),
    Transform(Box<dyn Transformer>),
    SelectRemote(Box<dyn RemoteSelector>),
}

impl Capability {
    fn kind(&self) -> PluginKind {
        match self {
            Capability::HandleEvent(_) => PluginKind::EventHandler,
            Capability::Transform(_) => PluginKind::Transformer,
            Capability::SelectRemote(_) => PluginKind::Balancer,
        }
    }
}

struct Plugin {
    metadata: PluginMetadata,
    capability: Capability,
    enabled: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<Vec<Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. The metadata kind is derived from the capability.
    pub fn register(&self, mut metadata: PluginMetadata, capability: Capability) {
        metadata.kind = capability.kind();
        tracing::info!(id = %metadata.id, kind = ?metadata.kind, "plugin registered");
        self.plugins.lock().unwrap().push(Plugin {
            metadata,
            capability,
            enabled: true,
        });
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut plugins = self.plugins.lock().unwrap();
        let before = plugins.len();
        plugins.retain(|p| p.metadata.id != id);
        before != plugins.len()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut plugins = self.plugins.lock().unwrap();
        for plugin in plugins.iter_mut() {
            if plugin.metadata.id == id {
                plugin.enabled = enabled;
                tracing::info!(id, enabled, "plugin toggled");
                return true;
            }
        }
        false
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .lock()
            .unwrap()
            .iter()
            .map(|p| PluginInfo {
                metadata: p.metadata.clone(),
                enabled: p.enabled,
            })
            .collect()
    }

    /// Fire a hook with a context built from `fields`.
    pub fn trigger(&self, hook: Hook, fields: &[(&str, Value)]) -> HookContext {
        let mut context = HookContext::new();
        for (key, value) in fields {
            context.insert(key.to_string(), value.clone());
        }
        self.trigger_with(hook, context)
    }

    /// Fire a hook, threading the (possibly replaced) context through every
    /// enabled event handler.
    pub fn trigger_with(&self, hook: Hook, mut context: HookContext) -> HookContext {
        let plugins = self.plugins.lock().unwrap();
        for plugin in plugins.iter().filter(|p| p.enabled) {
            if let Capability::HandleEvent(handler) = &plugin.capability {
                match handler.handle(hook, &context) {
                    Ok(Some(replacement)) => context = replacement,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(plugin = %plugin.metadata.id, hook = ?hook, error = %e, "plugin handler failed");
                    }
                }
            }
        }
        context
    }

    /// Run chunk bytes through every enabled transformer (in registration
    /// order for uploads, reversed for downloads).
    pub fn transform_upload(&self, mut data: Bytes) -> anyhow::Result<Bytes> {
        let plugins = self.plugins.lock().unwrap();
        for plugin in plugins.iter().filter(|p| p.enabled) {
            if let Capability::Transform(t) = &plugin.capability {
                data = t.transform_upload(data)?;
            }
        }
        Ok(data)
    }

    pub fn transform_download(&self, mut data: Bytes) -> anyhow::Result<Bytes> {
        let plugins = self.plugins.lock().unwrap();
        for plugin in plugins.iter().rev().filter(|p| p.enabled) {
            if let Capability::Transform(t) = &plugin.capability {
                data = t.transform_download(data)?;
            }
        }
        Ok(data)
    }

    /// First enabled balancer plugin that claims the decision wins.
    pub fn select_remote(&self, remotes: &[RemoteStatus], chunk_size: u64) -> Option<String> {
        let plugins = self.plugins.lock().unwrap();
        for plugin in plugins.iter().filter(|p| p.enabled) {
            if let Capability::SelectRemote(selector) = &plugin.capability {
                if let Some(choice) = selector.select_remote(remotes, chunk_size) {
                    return Some(choice);
                }
            }
        }
        None
    }

    pub fn has_selectors(&self) -> bool {
        self.plugins
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.enabled && matches!(p.capability, Capability::SelectRemote(_)))
    }

    pub fn has_transformers(&self) -> bool {
        self.plugins
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.enabled && matches!(p.capability, Capability::Transform(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn metadata(id: &str) -> PluginMetadata {
        PluginMetadata {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            description: String::new(),
            kind: PluginKind::EventHandler,
        }
    }

    /// Counts events it sees; mirrors the classic logging event handler.
    struct CountingHandler {
        seen: Arc<AtomicUsize>,
    }

    impl EventHandler for CountingHandler {
        fn handle(&self, hook: Hook, context: &HookContext) -> anyhow::Result<Option<HookContext>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            tracing::info!(hook = ?hook, keys = context.len(), "event observed");
            Ok(None)
        }
    }

    struct FailingHandler;

    impl EventHandler for FailingHandler {
        fn handle(&self, _: Hook, _: &HookContext) -> anyhow::Result<Option<HookContext>> {
            anyhow::bail!("boom")
        }
    }

    struct Rewriter;

    impl EventHandler for Rewriter {
        fn handle(&self, _: Hook, context: &HookContext) -> anyhow::Result<Option<HookContext>> {
            let mut replacement = context.clone();
            replacement.insert("rewritten".into(), true.into());
            Ok(Some(replacement))
        }
    }

    struct XorTransformer(u8);

    impl Transformer for XorTransformer {
        fn transform_upload(&self, data: Bytes) -> anyhow::Result<Bytes> {
            Ok(data.iter().map(|b| b ^ self.0).collect::<Vec<u8>>().into())
        }
        fn transform_download(&self, data: Bytes) -> anyhow::Result<Bytes> {
            self.transform_upload(data)
        }
    }

    #[test]
    fn handlers_run_and_errors_do_not_stop_chain() {
        let registry = PluginRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        registry.register(
            metadata("fails"),
            Capability::HandleEvent(Box::new(FailingHandler)),
        );
        registry.register(
            metadata("counts"),
            Capability::HandleEvent(Box::new(CountingHandler { seen: seen.clone() })),
        );
        registry.trigger(Hook::PreUpload, &[("file_path", "/f".into())]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacement_context_is_threaded() {
        let registry = PluginRegistry::new();
        registry.register(metadata("rw"), Capability::HandleEvent(Box::new(Rewriter)));
        let out = registry.trigger(Hook::PostUpload, &[("k", 1.into())]);
        assert_eq!(out["rewritten"], Value::Bool(true));
        assert_eq!(out["k"], Value::from(1));
    }

    #[test]
    fn disabled_plugins_are_skipped() {
        let registry = PluginRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        registry.register(
            metadata("counts"),
            Capability::HandleEvent(Box::new(CountingHandler { seen: seen.clone() })),
        );
        assert!(registry.set_enabled("counts", false));
        registry.trigger(Hook::PreDelete, &[]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transformers_round_trip_in_reverse_order() {
        let registry = PluginRegistry::new();
        registry.register(
            metadata("x1"),
            Capability::Transform(Box::new(XorTransformer(0x55))),
        );
        registry.register(
            metadata("x2"),
            Capability::Transform(Box::new(XorTransformer(0xAA))),
        );
        let plain = Bytes::from_static(b"payload");
        let stored = registry.transform_upload(plain.clone()).unwrap();
        assert_ne!(stored, plain);
        assert_eq!(registry.transform_download(stored).unwrap(), plain);
    }

    #[test]
    fn selector_override_wins() {
        let registry = PluginRegistry::new();
        struct PinTo(&'static str);
        impl RemoteSelector for PinTo {
            fn select_remote(&self, _: &[RemoteStatus], _: u64) -> Option<String> {
                Some(self.0.to_string())
            }
        }
        registry.register(metadata("pin"), Capability::SelectRemote(Box::new(PinTo("b"))));
        assert_eq!(registry.select_remote(&[], 100), Some("b".to_string()));
    }

    #[test]
    fn list_and_unregister() {
        let registry = PluginRegistry::new();
        registry.register(metadata("p"), Capability::HandleEvent(Box::new(Rewriter)));
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.kind, PluginKind::EventHandler);
        assert!(registry.unregister("p"));
        assert!(registry.list().is_empty());
    }
}
