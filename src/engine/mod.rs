//! # Engine Core
//!
//! The engine owns the pool hierarchy, the context tree, the module
//! registry, the hook lists, and the name→handler maps for directives,
//! transformations, operators, and actions. It is driven `&mut` by a
//! single configuration thread; after configuration finishes it is
//! read-mostly and connections are handed out as externally owned
//! values.

pub mod events;
pub mod hooks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conn::tx::{Transaction, TxDefaults, TxId};
use crate::conn::Connection;
use crate::context::{Context, ContextId, ContextType};
use crate::error::{EngineError, EngineResult};
use crate::module::{
    DirectiveSpec, Module, ModuleRegistry, ENGINE_ABINUM, ENGINE_VERNUM, ENGINE_VERSION,
};
use crate::pool::Pool;

use self::events::StateEvent;
use self::hooks::{Hook, HookId, HookRegistry, ParsedHeader, ParsedRequestLine, ParsedResponseLine};

/// Identity of the server binding hosting the engine.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Server software name.
    pub name: String,
    /// Server software version.
    pub version: String,
    /// ABI number the server was built against.
    pub abinum: u32,
}

impl ServerDescriptor {
    /// Creates a descriptor for a server built against the current ABI.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            abinum: ENGINE_ABINUM,
        }
    }
}

/// Identity of this engine instance as a sensor.
#[derive(Debug, Clone)]
pub struct SensorInfo {
    /// Unique sensor id, generated at engine creation.
    pub id: Uuid,
    /// Sensor name, settable from configuration.
    pub name: String,
    /// Engine version string.
    pub version: String,
    /// Host the sensor runs on.
    pub hostname: String,
}

impl SensorInfo {
    fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "unknown".to_string(),
            version: ENGINE_VERSION.to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

/// Where the engine is in its configuration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPhase {
    /// Created; configuration has not begun.
    NotStarted,
    /// Between `config_started` and `config_finished`.
    Started,
    /// Configuration is complete and frozen.
    Finished,
}

impl ConfigPhase {
    fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Started => "Started",
            Self::Finished => "Finished",
        }
    }
}

/// Interface the configuration parser installs so context open/close can
/// drive the parser's context stack and resolve relative paths.
pub trait ParserBinding: Send {
    /// A context was opened; push it on the parser stack.
    fn push_context(&mut self, ctx: ContextId);

    /// A context closed; pop the parser stack.
    fn pop_context(&mut self) -> Option<ContextId>;

    /// The directory relative paths resolve against right now.
    fn current_dir(&self) -> PathBuf;
}

/// A named value transformation usable from rules.
pub type Transformation = Arc<dyn Fn(&str) -> EngineResult<String> + Send + Sync>;

/// A named predicate over a transaction and an input value.
pub type Operator = Arc<dyn Fn(&Transaction, &str) -> EngineResult<bool> + Send + Sync>;

/// A named action applied to a transaction when a rule fires.
pub type Action = Arc<dyn Fn(&mut Transaction) -> EngineResult<()> + Send + Sync>;

/// The engine.
pub struct Engine {
    pool: Pool,
    config_pool: Pool,
    temp_pool: Option<Pool>,
    server: ServerDescriptor,
    sensor: SensorInfo,
    contexts: Vec<Option<Context>>,
    ectx: ContextId,
    main_ctx: Option<ContextId>,
    current_ctx: ContextId,
    modules: ModuleRegistry,
    hooks: HookRegistry,
    directives: HashMap<String, (String, DirectiveSpec)>,
    transformations: HashMap<String, Transformation>,
    operators: HashMap<String, Operator>,
    actions: HashMap<String, Action>,
    config_phase: ConfigPhase,
    parser: Option<Box<dyn ParserBinding>>,
    shut_down: bool,
}

impl Engine {
    /// Creates an engine for `server`.
    ///
    /// Builds the pool hierarchy and the engine root context, then
    /// validates the server's ABI. A server built against a newer ABI
    /// than this engine is refused, and the partially built arena is
    /// released before the error propagates.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IncompatibleAbi`] on ABI mismatch or
    /// [`EngineError::Alloc`] on pool failure.
    pub fn create(server: ServerDescriptor) -> EngineResult<Self> {
        let pool = Pool::new("engine");
        let result = Self::create_inner(server, &pool);
        if result.is_err() {
            pool.release();
        }
        result
    }

    fn create_inner(server: ServerDescriptor, pool: &Pool) -> EngineResult<Self> {
        let config_pool = pool.subpool("config")?;
        let temp_pool = pool.subpool("temp")?;

        if server.abinum > ENGINE_ABINUM {
            error!(
                server = %server.name,
                server_abi = server.abinum,
                engine_abi = ENGINE_ABINUM,
                "refusing server built against a newer ABI"
            );
            return Err(EngineError::IncompatibleAbi {
                what: format!("server '{}'", server.name),
                engine_abi: ENGINE_ABINUM,
                got: server.abinum,
            });
        }

        let ectx_pool = config_pool.subpool("ctx/engine")?;
        let ectx_id = ContextId::from_raw(0);
        let ectx = Context::new(ectx_id, ContextType::Engine, "engine", None, ectx_pool);

        let sensor = SensorInfo::generate();
        info!(
            server = %server.name,
            sensor = %sensor.id,
            version = ENGINE_VERSION,
            "engine created"
        );

        Ok(Self {
            pool: pool.clone(),
            config_pool,
            temp_pool: Some(temp_pool),
            server,
            sensor,
            contexts: vec![Some(ectx)],
            ectx: ectx_id,
            main_ctx: None,
            current_ctx: ectx_id,
            modules: ModuleRegistry::new(),
            hooks: HookRegistry::new(),
            directives: HashMap::new(),
            transformations: HashMap::new(),
            operators: HashMap::new(),
            actions: HashMap::new(),
            config_phase: ConfigPhase::NotStarted,
            parser: None,
            shut_down: false,
        })
    }

    /// The server descriptor this engine was created for.
    #[must_use]
    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    /// This engine's sensor identity.
    #[must_use]
    pub fn sensor(&self) -> &SensorInfo {
        &self.sensor
    }

    /// Mutable sensor identity; the sensor name is settable from
    /// configuration.
    pub fn sensor_mut(&mut self) -> &mut SensorInfo {
        &mut self.sensor
    }

    /// The engine's root pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The configuration pool; contexts allocate under it.
    #[must_use]
    pub fn config_pool(&self) -> &Pool {
        &self.config_pool
    }

    /// The temporary pool, live only until configuration finishes.
    #[must_use]
    pub fn temp_pool(&self) -> Option<&Pool> {
        self.temp_pool.as_ref()
    }

    /// Releases the temporary pool early. A no-op if already gone.
    pub fn temp_pool_destroy(&mut self) {
        if let Some(temp) = self.temp_pool.take() {
            temp.release();
        }
    }

    /// Current configuration phase.
    #[must_use]
    pub fn config_phase(&self) -> ConfigPhase {
        self.config_phase
    }

    /// Installs the configuration parser binding.
    pub fn set_parser(&mut self, parser: Box<dyn ParserBinding>) {
        self.parser = Some(parser);
    }

    /// The directory the configuration parser resolves relative paths
    /// against, if a parser is installed.
    #[must_use]
    pub fn config_dir(&self) -> Option<PathBuf> {
        self.parser.as_ref().map(|p| p.current_dir())
    }

    // ---- configuration lifecycle -------------------------------------

    /// Begins configuration: creates and opens the main context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] unless the phase is
    /// `NotStarted`.
    pub fn config_started(&mut self) -> EngineResult<()> {
        self.expect_phase(ConfigPhase::NotStarted)?;

        let main = self.context_create(ContextType::Main, "main", self.ectx)?;
        self.context_open(main)?;
        self.main_ctx = Some(main);
        self.current_ctx = main;
        self.config_phase = ConfigPhase::Started;
        debug!("configuration started");
        Ok(())
    }

    /// Ends configuration: closes the main context, freezes the phase,
    /// and destroys the temporary pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] unless the phase is
    /// `Started`.
    pub fn config_finished(&mut self) -> EngineResult<()> {
        self.expect_phase(ConfigPhase::Started)?;

        let main = self.main_context()?;
        self.context_close(main)?;
        self.config_phase = ConfigPhase::Finished;
        self.temp_pool_destroy();
        debug!("configuration finished");
        Ok(())
    }

    fn expect_phase(&self, expected: ConfigPhase) -> EngineResult<()> {
        if self.config_phase != expected {
            return Err(EngineError::InvalidState {
                current: self.config_phase.name().to_string(),
                expected: expected.name().to_string(),
            });
        }
        Ok(())
    }

    // ---- contexts ----------------------------------------------------

    /// The engine's own root context id.
    #[must_use]
    pub fn engine_context(&self) -> ContextId {
        self.ectx
    }

    /// The main configuration context.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] before `config_started`.
    pub fn main_context(&self) -> EngineResult<ContextId> {
        self.main_ctx.ok_or_else(|| EngineError::InvalidState {
            current: self.config_phase.name().to_string(),
            expected: ConfigPhase::Started.name().to_string(),
        })
    }

    /// The context new configuration and connections currently attach
    /// to: the engine context before `config_started`, the main context
    /// after.
    #[must_use]
    pub fn current_context(&self) -> ContextId {
        self.current_ctx
    }

    /// Borrows a context.
    #[must_use]
    pub fn context(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(id.index())?.as_ref()
    }

    /// Mutably borrows a context.
    #[must_use]
    pub fn context_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        self.contexts.get_mut(id.index())?.as_mut()
    }

    fn require_context(&self, id: ContextId) -> EngineResult<&Context> {
        self.context(id)
            .ok_or_else(|| EngineError::NotFound(format!("context {:?}", id)))
    }

    /// Creates a context under `parent`.
    ///
    /// The new context gets its own subpool and one configuration slot
    /// per registered module, derived from the parent's slot via the
    /// module's copy rule or from the module's global default. Nothing
    /// is published until every slot materialized; on failure the
    /// subpool is released and the tree is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for the `Engine` type
    /// (the root is built by [`Engine::create`]), or
    /// [`EngineError::NotFound`] for a missing parent.
    pub fn context_create(
        &mut self,
        ctx_type: ContextType,
        name: impl Into<String>,
        parent: ContextId,
    ) -> EngineResult<ContextId> {
        if ctx_type == ContextType::Engine {
            return Err(EngineError::InvalidArgument(
                "the engine context cannot be created explicitly".to_string(),
            ));
        }
        let name = name.into();
        let parent_ctx = self.require_context(parent)?;

        let id = ContextId::from_raw(self.contexts.len());
        let pool = self
            .config_pool
            .subpool(format!("ctx/{}:{}", ctx_type.label(), name))?;

        let mut ctx = Context::new(id, ctx_type, name, Some(parent_ctx), pool);
        if let Err(e) = self.materialize_module_configs(&mut ctx, parent) {
            ctx.pool().release();
            return Err(e);
        }

        debug!(context = ctx.full_name(), "created context");
        self.contexts.push(Some(ctx));
        if let Some(parent_ctx) = self.context_mut(parent) {
            parent_ctx.add_child(id);
        }
        Ok(id)
    }

    fn materialize_module_configs(
        &self,
        ctx: &mut Context,
        parent: ContextId,
    ) -> EngineResult<()> {
        let parent_ctx = self.require_context(parent)?;
        for (index, module) in self.modules.iter() {
            let config = match parent_ctx.raw_module_config(index) {
                Some(parent_cfg) => module
                    .config_copy(parent_cfg)
                    .or_else(|| module.global_config()),
                None => module.global_config(),
            };
            if let Some(config) = config {
                ctx.set_module_config(index, config);
            }
        }
        Ok(())
    }

    /// Opens a context: notifies modules, fires `context_open` hooks,
    /// pushes the context on the parser stack, and records the parser's
    /// current directory as the context's base for relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if the context is not in
    /// `Created`, or propagates the first module/hook failure.
    pub fn context_open(&mut self, id: ContextId) -> EngineResult<()> {
        self.with_context_taken(id, |eng, ctx| {
            ctx.mark_open()?;
            if ctx.context_type() != ContextType::Engine {
                if let Some(parser) = eng.parser.as_mut() {
                    parser.push_context(id);
                    ctx.set_base_dir(parser.current_dir());
                }
            }
            eng.walk_modules(ctx, |m, eng, ctx| m.context_open(eng, ctx))?;
            eng.dispatch_context_event(StateEvent::ContextOpen, ctx)?;
            debug!(context = ctx.full_name(), "opened context");
            Ok(())
        })
    }

    /// Closes a context: notifies modules, fires `context_close` hooks,
    /// and pops the parser stack.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidState`] if the context is not
    /// `Open`, or propagates the first module/hook failure.
    pub fn context_close(&mut self, id: ContextId) -> EngineResult<()> {
        self.with_context_taken(id, |eng, ctx| {
            ctx.mark_closed()?;
            eng.walk_modules(ctx, |m, eng, ctx| m.context_close(eng, ctx))?;
            eng.dispatch_context_event(StateEvent::ContextClose, ctx)?;
            if ctx.context_type() != ContextType::Engine {
                if let Some(parser) = eng.parser.as_mut() {
                    parser.pop_context();
                }
            }
            debug!(context = ctx.full_name(), "closed context");
            Ok(())
        })
    }

    /// Destroys a context and its whole subtree, children first.
    ///
    /// Legal in any state, including on a context that was never
    /// opened. Module `context_destroy` callbacks and `context_destroy`
    /// hooks fire for every destroyed context; their failures are
    /// logged, not propagated, since destruction cannot be abandoned
    /// halfway.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the context does not exist.
    pub fn context_destroy(&mut self, id: ContextId) -> EngineResult<()> {
        self.require_context(id)?;

        let children = self
            .context(id)
            .map(|ctx| ctx.children().to_vec())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            if self.context(child).is_some() {
                self.context_destroy(child)?;
            }
        }

        let ctx = self.contexts[id.index()]
            .take()
            .unwrap_or_else(|| unreachable!("context checked above"));

        let modules: Vec<_> = self.modules.iter().map(|(_, m)| Arc::clone(m)).collect();
        for module in modules {
            if let Err(e) = module.context_destroy(self, &ctx) {
                warn!(
                    module = module.name(),
                    context = ctx.full_name(),
                    error = %e,
                    "module context_destroy failed"
                );
            }
        }
        if let Err(e) = self.dispatch_context_event(StateEvent::ContextDestroy, &ctx) {
            warn!(context = ctx.full_name(), error = %e, "context_destroy hook failed");
        }

        if let Some(parent) = ctx.parent() {
            if let Some(parent_ctx) = self.context_mut(parent) {
                parent_ctx.remove_child(id);
            }
        }
        debug!(context = ctx.full_name(), "destroyed context");
        ctx.pool().release();
        Ok(())
    }

    /// Takes the context out of its slab slot, runs `f`, and puts it
    /// back whether or not `f` succeeded.
    fn with_context_taken<F>(&mut self, id: ContextId, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut Self, &mut Context) -> EngineResult<()>,
    {
        let mut ctx = self
            .contexts
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| EngineError::NotFound(format!("context {:?}", id)))?;

        let result = f(self, &mut ctx);
        self.contexts[id.index()] = Some(ctx);
        result
    }

    fn walk_modules<F>(&mut self, ctx: &Context, f: F) -> EngineResult<()>
    where
        F: Fn(&Arc<dyn Module>, &Engine, &Context) -> EngineResult<()>,
    {
        let modules: Vec<_> = self.modules.iter().map(|(_, m)| Arc::clone(m)).collect();
        for module in modules {
            f(&module, self, ctx)?;
        }
        Ok(())
    }

    fn dispatch_context_event(&self, event: StateEvent, ctx: &Context) -> EngineResult<()> {
        for hook in self.hooks.hooks(event) {
            match hook {
                Hook::Context(f) => f(self, event, ctx)?,
                other => unreachable!(
                    "{} hook registered for context event {}",
                    other.kind().name(),
                    event
                ),
            }
        }
        Ok(())
    }

    fn dispatch_null_event(&self, event: StateEvent) -> EngineResult<()> {
        for hook in self.hooks.hooks(event) {
            match hook {
                Hook::Null(f) => f(self, event)?,
                other => unreachable!(
                    "{} hook registered for null event {}",
                    other.kind().name(),
                    event
                ),
            }
        }
        Ok(())
    }

    // ---- modules -----------------------------------------------------

    /// Registers a module.
    ///
    /// Order of operations: ABI gate, directive registration, index
    /// assignment, configuration slot materialization in the current
    /// context, then `init`. If `init` fails the slot at the assigned
    /// index is nulled and stays reserved, so surviving modules keep
    /// their addresses.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IncompatibleAbi`] for a module built
    /// against a newer ABI, [`EngineError::InvalidArgument`] for name
    /// or directive collisions, or whatever `init` returned.
    pub fn module_register(&mut self, module: Arc<dyn Module>) -> EngineResult<usize> {
        if module.abi() > ENGINE_ABINUM {
            error!(
                module = module.name(),
                module_abi = module.abi(),
                engine_abi = ENGINE_ABINUM,
                "refusing module built against a newer ABI"
            );
            return Err(EngineError::IncompatibleAbi {
                what: format!("module '{}'", module.name()),
                engine_abi: ENGINE_ABINUM,
                got: module.abi(),
            });
        }
        if module.abi() < ENGINE_ABINUM {
            warn!(
                module = module.name(),
                module_abi = module.abi(),
                engine_abi = ENGINE_ABINUM,
                "module built against an older compatible ABI"
            );
        }
        if module.version().vernum() != ENGINE_VERNUM {
            debug!(
                module = module.name(),
                module_version = %module.version(),
                engine_version = ENGINE_VERSION,
                "module version differs from engine version"
            );
        }

        let directives = module.directives();
        for spec in &directives {
            let key = spec.name.to_ascii_lowercase();
            if let Some((owner, _)) = self.directives.get(&key) {
                return Err(EngineError::InvalidArgument(format!(
                    "directive '{}' already registered by module '{owner}'",
                    spec.name
                )));
            }
        }

        let index = self.modules.push(Arc::clone(&module))?;
        for spec in directives {
            self.directives.insert(
                spec.name.to_ascii_lowercase(),
                (module.name().to_string(), spec),
            );
        }

        if let Some(config) = module.global_config() {
            let current = self.current_ctx;
            if let Some(ctx) = self.context_mut(current) {
                ctx.set_module_config(index, config);
            }
        }

        if let Err(e) = module.init(self, index) {
            error!(module = module.name(), error = %e, "module init failed");
            self.modules.retire(index);
            self.directives
                .retain(|_, (owner, _)| owner.as_str() != module.name());
            let current = self.current_ctx;
            if let Some(ctx) = self.context_mut(current) {
                ctx.take_module_config(index);
            }
            return Err(e);
        }

        info!(
            module = module.name(),
            version = %module.version(),
            index,
            "registered module"
        );
        Ok(index)
    }

    /// Unregisters a module by name, running its `fini` and retiring
    /// its index permanently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown module, or
    /// propagates `fini` failure (the module is retired either way).
    pub fn module_unregister(&mut self, name: &str) -> EngineResult<()> {
        let (index, module) = self
            .modules
            .by_name(name)
            .map(|(i, m)| (i, Arc::clone(m)))
            .ok_or_else(|| EngineError::NotFound(format!("module '{name}'")))?;

        self.modules.retire(index);
        self.directives.retain(|_, (owner, _)| owner.as_str() != name);
        module.fini(self)
    }

    /// The module registry.
    #[must_use]
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Looks a module up by name.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown name.
    pub fn module_get(&self, name: &str) -> EngineResult<(usize, &Arc<dyn Module>)> {
        self.modules
            .by_name(name)
            .ok_or_else(|| EngineError::NotFound(format!("module '{name}'")))
    }

    // ---- hooks -------------------------------------------------------

    /// Registers a hook for an event taking no payload.
    pub fn register_null_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.hooks.register(event, Hook::Null(Box::new(f)))
    }

    /// Registers a hook for a context event.
    pub fn register_context_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Context) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.hooks.register(event, Hook::Context(Box::new(f)))
    }

    /// Registers a hook for a connection event.
    pub fn register_connection_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Connection) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.hooks.register(event, Hook::Connection(Box::new(f)))
    }

    /// Registers a hook for a transaction event.
    pub fn register_transaction_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Transaction) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.hooks.register(event, Hook::Transaction(Box::new(f)))
    }

    /// Registers a hook for a transaction body-data event.
    pub fn register_transaction_data_hook<F>(
        &mut self,
        event: StateEvent,
        f: F,
    ) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Transaction, &[u8]) -> EngineResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks
            .register(event, Hook::TransactionData(Box::new(f)))
    }

    /// Registers a hook for the request-line event.
    pub fn register_request_line_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Transaction, &ParsedRequestLine) -> EngineResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.register(event, Hook::RequestLine(Box::new(f)))
    }

    /// Registers a hook for the response-line event.
    pub fn register_response_line_hook<F>(
        &mut self,
        event: StateEvent,
        f: F,
    ) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Transaction, &ParsedResponseLine) -> EngineResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.register(event, Hook::ResponseLine(Box::new(f)))
    }

    /// Registers a hook for a header-data event.
    pub fn register_header_hook<F>(&mut self, event: StateEvent, f: F) -> EngineResult<HookId>
    where
        F: Fn(&Engine, StateEvent, &Transaction, &ParsedHeader) -> EngineResult<()>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.register(event, Hook::Header(Box::new(f)))
    }

    /// Removes a previously registered hook.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if `id` is not registered for
    /// `event`.
    pub fn unregister_hook(&mut self, event: StateEvent, id: HookId) -> EngineResult<()> {
        self.hooks.unregister(event, id)
    }

    /// Number of hooks registered for `event`.
    #[must_use]
    pub fn hook_count(&self, event: StateEvent) -> usize {
        self.hooks.count(event)
    }

    /// The ordered hook list for `event`, for the state notifier layer.
    pub fn hooks(&self, event: StateEvent) -> impl Iterator<Item = &Hook> {
        self.hooks.hooks(event)
    }

    // ---- name→handler maps -------------------------------------------

    /// Registers a named transformation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] on a duplicate name.
    pub fn register_transformation(
        &mut self,
        name: impl Into<String>,
        tfn: Transformation,
    ) -> EngineResult<()> {
        Self::map_insert(&mut self.transformations, name.into(), tfn, "transformation")
    }

    /// Looks a transformation up by name.
    #[must_use]
    pub fn transformation(&self, name: &str) -> Option<&Transformation> {
        self.transformations.get(&name.to_ascii_lowercase())
    }

    /// Registers a named operator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] on a duplicate name.
    pub fn register_operator(&mut self, name: impl Into<String>, op: Operator) -> EngineResult<()> {
        Self::map_insert(&mut self.operators, name.into(), op, "operator")
    }

    /// Looks an operator up by name.
    #[must_use]
    pub fn operator(&self, name: &str) -> Option<&Operator> {
        self.operators.get(&name.to_ascii_lowercase())
    }

    /// Registers a named action.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] on a duplicate name.
    pub fn register_action(&mut self, name: impl Into<String>, action: Action) -> EngineResult<()> {
        Self::map_insert(&mut self.actions, name.into(), action, "action")
    }

    /// Looks an action up by name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(&name.to_ascii_lowercase())
    }

    /// Looks a directive up by name, returning the owning module's name
    /// and the directive's spec.
    #[must_use]
    pub fn directive(&self, name: &str) -> Option<(&str, &DirectiveSpec)> {
        self.directives
            .get(&name.to_ascii_lowercase())
            .map(|(owner, spec)| (owner.as_str(), spec))
    }

    fn map_insert<V>(
        map: &mut HashMap<String, V>,
        name: String,
        value: V,
        what: &str,
    ) -> EngineResult<()> {
        let key = name.to_ascii_lowercase();
        if map.contains_key(&key) {
            return Err(EngineError::InvalidArgument(format!(
                "{what} '{name}' already registered"
            )));
        }
        map.insert(key, value);
        Ok(())
    }

    // ---- connections -------------------------------------------------

    /// Creates a connection attached to the current context.
    ///
    /// The connection is handed to the caller, who owns it and passes
    /// it back for notifications. No hooks fire here; the notification
    /// layer decides when the connection counts as started.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Alloc`] on pool failure.
    pub fn conn_create(
        &self,
        local_addr: impl Into<String>,
        local_port: u16,
        remote_addr: impl Into<String>,
        remote_port: u16,
    ) -> EngineResult<Connection> {
        let pool = self.pool.subpool("connection")?;
        let conn = Connection::new(
            self.current_ctx,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            pool,
        );
        conn.pool().rename(format!("conn/{}", conn.id()));
        debug!(conn = %conn.id(), "created connection");
        Ok(conn)
    }

    /// Starts a transaction on `conn`, inheriting audit and blocking
    /// defaults from the connection's context configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for a stale connection context
    /// or [`EngineError::Alloc`] on pool failure.
    pub fn tx_create(&self, conn: &mut Connection) -> EngineResult<TxId> {
        let ctx = self.require_context(conn.context())?;
        let defaults = TxDefaults {
            audit: ctx
                .get("audit")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            blocking: ctx
                .get("blocking")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        };
        conn.tx_create(conn.context(), defaults)
    }

    // ---- teardown ----------------------------------------------------

    /// Shuts the engine down.
    ///
    /// Fires `engine_shutdown_initiated` hooks, destroys site and
    /// location contexts in reverse creation order, then the main
    /// context, then the engine context, runs module `fini` in reverse
    /// registration order, and finally releases the root pool.
    /// Idempotent; also run by `Drop`.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(e) = self.dispatch_null_event(StateEvent::EngineShutdownInitiated) {
            warn!(error = %e, "shutdown hook failed");
        }

        let main = self.main_ctx;
        let mut ids: Vec<ContextId> = (0..self.contexts.len())
            .map(ContextId::from_raw)
            .filter(|id| *id != self.ectx && Some(*id) != main)
            .collect();
        ids.reverse();
        for id in ids {
            if self.context(id).is_some() {
                if let Err(e) = self.context_destroy(id) {
                    warn!(error = %e, "context teardown failed");
                }
            }
        }
        if let Some(main) = main {
            if self.context(main).is_some() {
                if let Err(e) = self.context_destroy(main) {
                    warn!(error = %e, "main context teardown failed");
                }
            }
        }
        let ectx = self.ectx;
        if self.context(ectx).is_some() {
            if let Err(e) = self.context_destroy(ectx) {
                warn!(error = %e, "engine context teardown failed");
            }
        }

        let mut modules: Vec<_> = self.modules.iter().map(|(_, m)| Arc::clone(m)).collect();
        modules.reverse();
        for module in modules {
            if let Err(e) = module.fini(self) {
                warn!(module = module.name(), error = %e, "module fini failed");
            }
        }

        self.pool.release();
        info!(sensor = %self.sensor.id, "engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sensor", &self.sensor.id)
            .field("phase", &self.config_phase)
            .field("contexts", &self.contexts.iter().flatten().count())
            .field("modules", &self.modules.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::create(ServerDescriptor::new("test-server", "1.0")).unwrap()
    }

    #[test]
    fn test_create_builds_engine_context() {
        let eng = engine();
        let ectx = eng.context(eng.engine_context()).unwrap();
        assert_eq!(ectx.full_name(), "engine:engine");
        assert_eq!(eng.current_context(), eng.engine_context());
        assert!(eng.main_context().is_err());
    }

    #[test]
    fn test_create_rejects_newer_server_abi() {
        let server = ServerDescriptor {
            name: "future".to_string(),
            version: "9.0".to_string(),
            abinum: ENGINE_ABINUM + 1,
        };
        let err = Engine::create(server).unwrap_err();
        assert!(err.is_abi_incompatibility());
    }

    #[test]
    fn test_config_lifecycle() {
        let mut eng = engine();
        assert_eq!(eng.config_phase(), ConfigPhase::NotStarted);
        assert!(eng.temp_pool().is_some());

        eng.config_started().unwrap();
        assert_eq!(eng.config_phase(), ConfigPhase::Started);
        let main = eng.main_context().unwrap();
        assert_eq!(eng.current_context(), main);
        assert_eq!(
            eng.context(main).unwrap().full_name(),
            "engine:engine:main:main"
        );

        eng.config_finished().unwrap();
        assert_eq!(eng.config_phase(), ConfigPhase::Finished);
        assert!(eng.temp_pool().is_none());
    }

    #[test]
    fn test_config_out_of_order() {
        let mut eng = engine();
        assert!(matches!(
            eng.config_finished(),
            Err(EngineError::InvalidState { .. })
        ));

        eng.config_started().unwrap();
        assert!(matches!(
            eng.config_started(),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_handler_maps_reject_duplicates() {
        let mut eng = engine();
        let tfn: Transformation = Arc::new(|v| Ok(v.to_ascii_lowercase()));
        eng.register_transformation("lowercase", Arc::clone(&tfn)).unwrap();
        assert!(eng.register_transformation("Lowercase", tfn).is_err());
        assert!(eng.transformation("LOWERCASE").is_some());
    }

    #[test]
    fn test_conn_create_uses_current_context() {
        let mut eng = engine();
        eng.config_started().unwrap();
        let conn = eng.conn_create("10.0.0.2", 443, "203.0.113.9", 51612).unwrap();
        assert_eq!(conn.context(), eng.main_context().unwrap());
    }
}
