//! Configuration contexts.
//!
//! Contexts form a tree that mirrors the configuration file structure:
//! the engine context at the root, the main context under it, then site
//! and location contexts below. Each context carries one configuration
//! slot per registered module plus a named settings map, and inherits
//! its audit log index from its parent until it sets its own.

pub mod auditlog;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::auditlog::AuditLogIndex;
use crate::error::{EngineError, EngineResult};
use crate::module::{ConfigData, ConfigValue};
use crate::pool::Pool;

/// Identifier of a context within its engine. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

impl ContextId {
    /// Builds an id from its raw slab index.
    #[must_use]
    pub(crate) fn from_raw(index: usize) -> Self {
        Self(index)
    }

    /// The raw slab index.
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// Where a context sits in the configuration tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextType {
    /// The engine's own root context.
    Engine,
    /// The main configuration context.
    Main,
    /// A per-site context.
    Site,
    /// A per-location context within a site.
    Location,
}

impl ContextType {
    /// The type's label, used in full context names.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Main => "main",
            Self::Site => "site",
            Self::Location => "location",
        }
    }
}

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet opened for configuration.
    Created,
    /// Open; directives may apply to it.
    Open,
    /// Closed; its configuration is frozen.
    Closed,
}

impl ContextState {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Open => "Open",
            Self::Closed => "Closed",
        }
    }
}

/// One node in the configuration context tree.
pub struct Context {
    id: ContextId,
    ctx_type: ContextType,
    name: String,
    full_name: String,
    parent: Option<ContextId>,
    children: Vec<ContextId>,
    state: ContextState,
    pool: Pool,
    settings: HashMap<String, ConfigValue>,
    module_configs: Vec<Option<Box<dyn ConfigData>>>,
    filters: Vec<String>,
    site_name: Option<String>,
    base_dir: Option<PathBuf>,
    auditlog: Arc<AuditLogIndex>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        ctx_type: ContextType,
        name: impl Into<String>,
        parent: Option<&Context>,
        pool: Pool,
    ) -> Self {
        let name = name.into();
        let full_name = match parent {
            Some(p) => format!("{}:{}:{}", p.full_name, ctx_type.label(), name),
            None => format!("{}:{}", ctx_type.label(), name),
        };
        // Share the parent's index only once the parent has repointed
        // it somewhere real; a parent still on the default placeholder
        // gives each child its own index.
        let auditlog = match parent {
            Some(p) if p.auditlog.path() != Path::new(auditlog::DEFAULT_INDEX_PATH) => {
                Arc::clone(&p.auditlog)
            }
            _ => Arc::new(AuditLogIndex::new(id, auditlog::DEFAULT_INDEX_PATH)),
        };
        Self {
            id,
            ctx_type,
            name,
            full_name,
            parent: parent.map(|p| p.id),
            children: Vec::new(),
            state: ContextState::Created,
            pool,
            settings: HashMap::new(),
            module_configs: Vec::new(),
            filters: Vec::new(),
            site_name: None,
            base_dir: None,
            auditlog,
        }
    }

    /// This context's id.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The context's type.
    #[must_use]
    pub fn context_type(&self) -> ContextType {
        self.ctx_type
    }

    /// Short name, e.g. the site name for a site context.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified name built from the ancestor chain, e.g.
    /// `engine:engine:main:main:site:default`.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The parent context's id, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    /// Ids of direct children, in creation order.
    #[must_use]
    pub fn children(&self) -> &[ContextId] {
        &self.children
    }

    pub(crate) fn add_child(&mut self, child: ContextId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: ContextId) {
        self.children.retain(|c| *c != child);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The context's memory pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn mark_open(&mut self) -> EngineResult<()> {
        self.transition(ContextState::Created, ContextState::Open)
    }

    pub(crate) fn mark_closed(&mut self) -> EngineResult<()> {
        self.transition(ContextState::Open, ContextState::Closed)
    }

    fn transition(&mut self, from: ContextState, to: ContextState) -> EngineResult<()> {
        if self.state != from {
            return Err(EngineError::InvalidState {
                current: self.state.name().to_string(),
                expected: from.name().to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Sets a named setting.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<ConfigValue>) {
        self.settings
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Sets a numeric setting.
    pub fn set_num(&mut self, name: impl AsRef<str>, value: i64) {
        self.set(name, value);
    }

    /// Sets a string setting.
    pub fn set_string(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.set(name, value.into());
    }

    /// Gets a named setting.
    #[must_use]
    pub fn get(&self, name: impl AsRef<str>) -> Option<&ConfigValue> {
        self.settings.get(&name.as_ref().to_ascii_lowercase())
    }

    /// Stores module configuration in the slot for module `index`.
    pub(crate) fn set_module_config(&mut self, index: usize, config: Box<dyn ConfigData>) {
        if self.module_configs.len() <= index {
            self.module_configs.resize_with(index + 1, || None);
        }
        self.module_configs[index] = Some(config);
    }

    pub(crate) fn take_module_config(&mut self, index: usize) {
        if let Some(slot) = self.module_configs.get_mut(index) {
            *slot = None;
        }
    }

    /// Whether the slot for module `index` holds configuration.
    #[must_use]
    pub fn has_module_config(&self, index: usize) -> bool {
        matches!(self.module_configs.get(index), Some(Some(_)))
    }

    /// Borrows module `index`'s configuration, downcast to `T`.
    #[must_use]
    pub fn module_config<T: ConfigData>(&self, index: usize) -> Option<&T> {
        self.module_configs
            .get(index)?
            .as_deref()?
            .as_any()
            .downcast_ref::<T>()
    }

    /// Mutably borrows module `index`'s configuration, downcast to `T`.
    #[must_use]
    pub fn module_config_mut<T: ConfigData>(&mut self, index: usize) -> Option<&mut T> {
        self.module_configs
            .get_mut(index)?
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub(crate) fn raw_module_config(&self, index: usize) -> Option<&dyn ConfigData> {
        self.module_configs.get(index)?.as_deref()
    }

    /// Appends a filter reference to this context's filter list.
    pub fn add_filter(&mut self, name: impl Into<String>) {
        self.filters.push(name.into());
    }

    /// Filters attached to this context, in attachment order.
    #[must_use]
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Associates this context with a site.
    pub fn set_site(&mut self, site: impl Into<String>) {
        self.site_name = Some(site.into());
    }

    /// The associated site name, if any.
    #[must_use]
    pub fn site(&self) -> Option<&str> {
        self.site_name.as_deref()
    }

    /// The directory relative paths in this context resolve against,
    /// captured from the configuration parser when the context opened.
    /// `None` for contexts opened without a parser installed.
    #[must_use]
    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub(crate) fn set_base_dir(&mut self, dir: PathBuf) {
        self.base_dir = Some(dir);
    }

    /// This context's audit log index, possibly shared with ancestors.
    #[must_use]
    pub fn auditlog(&self) -> &Arc<AuditLogIndex> {
        &self.auditlog
    }

    /// Points this context's audit log index at `path` and sets whether
    /// it is enabled.
    ///
    /// If the index is inherited from an ancestor, the context takes
    /// ownership of a private index first so the ancestor's index is
    /// unaffected. An owner changing its own path closes any open index
    /// file so the next write lands at the new location.
    pub fn set_auditlog_index(&mut self, enabled: bool, path: Option<&Path>) {
        if self.auditlog.owner() == self.id {
            if let Some(path) = path {
                self.auditlog.set_path(path);
            }
            self.auditlog.set_enabled(enabled);
        } else {
            let path = path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.auditlog.path());
            let own = AuditLogIndex::new(self.id, path);
            own.set_enabled(enabled);
            self.auditlog = Arc::new(own);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("full_name", &self.full_name)
            .field("state", &self.state)
            .field("children", &self.children.len())
            .finish()
    }
}
