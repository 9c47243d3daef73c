//! Lifecycle façade: opens the store and hands out contexts.
//!
//! # Responsibility
//! - Open the backing store described by a [`PersistenceConfig`].
//! - Create root contexts (registered for save propagation) and child
//!   contexts (saving into their parent only).
//! - Wire the store's commit channel to the [`SavePropagator`].
//!
//! # Invariants
//! - Remove a context before discarding it; removal stops propagation to it.
//! - Dropping the façade detaches propagation from the store.

use crate::context::propagation::SavePropagator;
use crate::context::queue::SerializationMode;
use crate::context::registry::ContextRegistry;
use crate::context::{ConflictPolicy, Context};
use crate::db::{StoreError, StoreLocation, StoreResult};
use crate::model::schema::Model;
use crate::store::coordinator::StoreCoordinator;
use crate::store::feed::ListenerId;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Environment flag enabling `info` logs of context create/remove counts.
pub const VERBOSE_CONTEXTS_ENV: &str = "CTXSTORE_VERBOSE_CONTEXTS";

const STORE_FILE_EXTENSION: &str = "sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// SQLite file at `<store_dir>/<store_name>.sqlite`.
    #[default]
    Durable,
    /// In-memory SQLite; nothing survives the process.
    Ephemeral,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub model: Model,
    pub store_name: String,
    pub store_dir: PathBuf,
    /// Delete the durable store file before opening it.
    pub reset_on_open: bool,
    pub kind: StoreKind,
    pub verbose_contexts: bool,
}

impl PersistenceConfig {
    /// Durable store named after the model, in the current directory.
    pub fn new(model: Model) -> Self {
        let store_name = model.name().to_string();
        Self {
            model,
            store_name,
            store_dir: PathBuf::from("."),
            reset_on_open: false,
            kind: StoreKind::Durable,
            verbose_contexts: false,
        }
    }

    pub fn ephemeral(model: Model) -> Self {
        Self::new(model).with_kind(StoreKind::Ephemeral)
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }

    pub fn with_store_dir(mut self, store_dir: impl Into<PathBuf>) -> Self {
        self.store_dir = store_dir.into();
        self
    }

    pub fn with_reset_on_open(mut self, reset_on_open: bool) -> Self {
        self.reset_on_open = reset_on_open;
        self
    }

    pub fn with_kind(mut self, kind: StoreKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_verbose_contexts(mut self, verbose_contexts: bool) -> Self {
        self.verbose_contexts = verbose_contexts;
        self
    }

    /// Applies `CTXSTORE_VERBOSE_CONTEXTS` (`1`, `true`, `yes`, `on`).
    pub fn from_env(self) -> Self {
        let verbose = std::env::var(VERBOSE_CONTEXTS_ENV)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        self.with_verbose_contexts(verbose)
    }

    /// Path of the durable store file; `None` for ephemeral stores.
    pub fn store_path(&self) -> Option<PathBuf> {
        match self.kind {
            StoreKind::Durable => Some(
                self.store_dir
                    .join(format!("{}.{STORE_FILE_EXTENSION}", self.store_name)),
            ),
            StoreKind::Ephemeral => None,
        }
    }

    fn location(&self) -> StoreLocation {
        match self.store_path() {
            Some(path) => StoreLocation::File(path),
            None => StoreLocation::Memory,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub struct Persistence {
    store: Arc<StoreCoordinator>,
    registry: Arc<ContextRegistry>,
    propagation: ListenerId,
    verbose_contexts: bool,
}

impl Persistence {
    /// Opens the store with a registry of its own.
    ///
    /// # Errors
    /// - `StoreError::Unrecoverable` when the store cannot be opened, even
    ///   after recreating a durable file once. Callers should terminate.
    pub fn open(config: PersistenceConfig) -> StoreResult<Self> {
        Self::open_with_registry(config, Arc::new(ContextRegistry::new()))
    }

    /// Opens the store and propagates saves through a shared `registry`.
    pub fn open_with_registry(
        config: PersistenceConfig,
        registry: Arc<ContextRegistry>,
    ) -> StoreResult<Self> {
        if config.store_name.trim().is_empty() {
            return Err(StoreError::Unrecoverable(Box::new(StoreError::InvalidData(
                "store name cannot be empty".to_string(),
            ))));
        }
        let location = config.location();
        let store = Arc::new(StoreCoordinator::open(
            config.model,
            location,
            config.reset_on_open,
        )?);
        let propagation = SavePropagator::attach(&store, Arc::clone(&registry));
        Ok(Self {
            store,
            registry,
            propagation,
            verbose_contexts: config.verbose_contexts,
        })
    }

    pub fn store(&self) -> &Arc<StoreCoordinator> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Creates a root context and registers it for save propagation.
    pub fn add_context(
        &self,
        mode: SerializationMode,
        policy: ConflictPolicy,
    ) -> StoreResult<Context> {
        let context = Context::new(Arc::clone(&self.store), None, mode, policy)?;
        self.registry.register(&context);
        self.log_context_count("context_add", &context);
        Ok(context)
    }

    /// Creates a child of `parent`. Children save into their parent and are
    /// never propagation targets.
    pub fn add_child_context(
        &self,
        parent: &Context,
        mode: SerializationMode,
        policy: ConflictPolicy,
    ) -> StoreResult<Context> {
        if !Arc::ptr_eq(parent.store(), &self.store) {
            return Err(StoreError::InvalidData(format!(
                "parent context {} belongs to {}, not {}",
                parent.id(),
                parent.store_id(),
                self.store.id()
            )));
        }
        let context = Context::new(
            Arc::clone(&self.store),
            Some(parent.clone()),
            mode,
            policy,
        )?;
        debug!(
            "event=context_add module=persistence status=ok context={} parent={}",
            context.id(),
            parent.id()
        );
        Ok(context)
    }

    /// Stops propagating saves to `context`. Jobs already on its queue
    /// still run. Unknown contexts are ignored.
    pub fn remove_context(&self, context: &Context) {
        if self.registry.unregister(context.id()) {
            self.log_context_count("context_remove", context);
        }
    }

    /// Saves `context`, logging failures with their origin.
    pub fn save(&self, context: &Context) -> StoreResult<()> {
        context.save().inspect_err(|err| {
            warn!(
                "event=context_save module=persistence status=error context={} error={}",
                context.id(),
                err
            );
        })
    }

    /// Live root contexts registered for this store.
    pub fn context_count(&self) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|context| context.store_id() == self.store.id())
            .count()
    }

    fn log_context_count(&self, event: &str, context: &Context) {
        if self.verbose_contexts {
            info!(
                "event={} module=persistence status=ok context={} store={} contexts={}",
                event,
                context.id(),
                self.store.id(),
                self.context_count()
            );
        } else {
            debug!(
                "event={} module=persistence status=ok context={}",
                event,
                context.id()
            );
        }
    }
}

impl Drop for Persistence {
    fn drop(&mut self) {
        self.store.unsubscribe(self.propagation);
    }
}
