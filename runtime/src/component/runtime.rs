use super::*;
use super::instance::StoredInstance;

/// Location under which hosts mount [`code_unit`] on their loader.
pub const RUNTIME_LOCATION: &str = "gantry://component";

struct RegisteredFactory {
    declaration: FactoryDeclaration,
    context: BundleContext,
}

struct RuntimeState {
    running: bool,
    factories: HashMap<Box<str>, RegisteredFactory>,
    instances: HashMap<Box<str>, Arc<StoredInstance>>,
    // components whose factory has not shown up yet
    waiting: Vec<InstanceDeclaration>,
}

pub(crate) struct RuntimeInner {
    state: Mutex<RuntimeState>,
    listeners: Mutex<Vec<Arc<dyn ComponentEventListener>>>,
}

/// The component factory store: registers factories discovered in starting
/// bundles, instantiates components and tears everything down when the
/// owning bundles stop.
///
/// Registered as a service under [`RUNTIME_SPEC`] by its bundle activator;
/// the payload downcasts to `ComponentRuntime` directly.
#[derive(Clone)]
pub struct ComponentRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl ComponentRuntime {
    fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                state: Mutex::new(RuntimeState {
                    running: true,
                    factories: HashMap::new(),
                    instances: HashMap::new(),
                    waiting: Vec::new(),
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a component factory under its declared name.
    pub fn register_factory(
        &self,
        context: &BundleContext,
        declaration: FactoryDeclaration,
    ) -> Result<()> {
        self.inner.register_factory(context, declaration)
    }

    /// Unregisters a factory, killing its instances first.
    pub fn unregister_factory(&self, name: &str) -> Result<()> {
        self.inner.unregister_factory(name)
    }

    /// Creates a named component from a factory. When the factory is not
    /// registered yet the component is parked and materialized as soon as
    /// the factory shows up.
    pub fn instantiate(&self, factory: &str, name: &str, properties: Properties) -> Result<()> {
        self.inner.instantiate(factory, name, properties)
    }

    /// Manually invalidates a valid component; it stays `Invalid` until its
    /// bindings change again.
    pub fn invalidate(&self, name: &str) -> Result<()> {
        self.instance(name)?.force_invalidate()
    }

    /// Kills a component (terminal) and forgets it.
    pub fn kill(&self, name: &str) -> Result<()> {
        self.inner.kill_by_name(name)
    }

    /// Moves an `Erroneous` component back to `Invalid`, merging the given
    /// properties, and re-evaluates it.
    pub fn retry(&self, name: &str, properties: Properties) -> Result<()> {
        self.instance(name)?.retry(properties)
    }

    pub fn is_registered_factory(&self, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .factories
            .contains_key(name)
    }

    pub fn is_registered_instance(&self, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .instances
            .contains_key(name)
    }

    pub fn factories(&self) -> Vec<Box<str>> {
        let mut names = self
            .inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .factories
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// (name, factory, state) of every live instance, sorted by name.
    pub fn instances(&self) -> Vec<(Box<str>, Box<str>, ComponentState)> {
        let mut instances = self
            .inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .instances
            .values()
            .map(|i| (i.name().into(), i.factory().into(), i.state()))
            .collect::<Vec<(Box<str>, Box<str>, ComponentState)>>();
        instances.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        instances
    }

    pub fn instance_details(&self, name: &str) -> Result<InstanceDetails> {
        Ok(self.instance(name)?.details())
    }

    /// The property accessor of a live instance, for tooling.
    pub fn instance_context(&self, name: &str) -> Result<Arc<ComponentContext>> {
        Ok(self.instance(name)?.context.clone())
    }

    pub fn factory_details(&self, name: &str) -> Result<FactoryDetails> {
        let state = self.inner.state.lock().trace_expect("Failed to lock mutex");
        let factory = state
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownFactory(name.into()))?;
        Ok(FactoryDetails {
            name: factory.declaration.name().into(),
            bundle: factory.context.bundle().id(),
            provides: factory.declaration.provides().to_vec(),
            requires: factory.declaration.requires().to_vec(),
            properties: factory.declaration.default_properties().clone(),
        })
    }

    /// Components parked until their factory is registered.
    pub fn waiting_components(&self) -> Vec<InstanceDeclaration> {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .waiting
            .clone()
    }

    /// Idempotent; returns false when the listener was already added.
    pub fn add_listener(&self, listener: Arc<dyn ComponentEventListener>) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ComponentEventListener>) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn instance(&self, name: &str) -> Result<Arc<StoredInstance>> {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownInstance(name.into()))
    }
}

impl std::fmt::Debug for ComponentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().trace_expect("Failed to lock mutex");
        f.debug_struct("ComponentRuntime")
            .field("running", &state.running)
            .field("factories", &state.factories.len())
            .field("instances", &state.instances.len())
            .finish()
    }
}

impl RuntimeInner {
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .trace_expect("Failed to lock mutex")
            .running
    }

    /// Events are delivered on the calling thread; listener errors are
    /// logged and skipped.
    pub fn fire_event(&self, kind: ComponentEventKind, factory: &str, instance: Option<&str>) {
        let event = ComponentEvent {
            kind,
            factory: factory.into(),
            instance: instance.map(Into::into),
        };
        let listeners = self
            .listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .clone();
        for listener in listeners {
            if let Err(e) = listener.component_changed(&event) {
                warn!("A component event listener failed handling {:?}: {e}", event.kind);
            }
        }
    }

    fn register_factory(
        self: &Arc<Self>,
        context: &BundleContext,
        declaration: FactoryDeclaration,
    ) -> Result<()> {
        let name: Box<str> = declaration.name().into();
        {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            if !state.running {
                return Err(Error::NotRunning);
            }
            if state.factories.contains_key(&name) {
                return Err(Error::DuplicateFactory(name));
            }
            state.factories.insert(
                name.clone(),
                RegisteredFactory {
                    declaration: declaration.clone(),
                    context: context.clone(),
                },
            );
        }

        debug!("Registered component factory '{name}'");
        self.fire_event(ComponentEventKind::Registered, &name, None);

        // Materialize components parked on this factory
        let parked = {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            let (parked, waiting) = state
                .waiting
                .drain(..)
                .partition(|w| w.factory == name);
            state.waiting = waiting;
            parked
        };
        for declared in parked {
            if let Err(e) = self.create_instance(
                &declaration,
                context.clone(),
                &declared.name,
                declared.properties,
            ) {
                error!(
                    "Failed to instantiate waiting component '{}': {e}",
                    declared.name
                );
            }
        }
        Ok(())
    }

    fn unregister_factory(self: &Arc<Self>, name: &str) -> Result<()> {
        let doomed = {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            if state.factories.remove(name).is_none() {
                return Err(Error::UnknownFactory(name.into()));
            }
            let names = state
                .instances
                .values()
                .filter(|i| i.factory() == name)
                .map(|i| Box::<str>::from(i.name()))
                .collect::<Vec<_>>();
            names
                .iter()
                .filter_map(|n| state.instances.remove(n))
                .collect::<Vec<_>>()
        };

        for instance in doomed {
            instance.kill();
        }

        debug!("Unregistered component factory '{name}'");
        self.fire_event(ComponentEventKind::Unregistered, name, None);
        Ok(())
    }

    fn instantiate(self: &Arc<Self>, factory: &str, name: &str, properties: Properties) -> Result<()> {
        let registered = {
            let state = self.state.lock().trace_expect("Failed to lock mutex");
            if !state.running {
                return Err(Error::NotRunning);
            }
            if state.instances.contains_key(name)
                || state.waiting.iter().any(|w| &*w.name == name)
            {
                return Err(Error::DuplicateInstance(name.into()));
            }
            state
                .factories
                .get(factory)
                .map(|f| (f.declaration.clone(), f.context.clone()))
        };

        match registered {
            Some((declaration, context)) => {
                self.create_instance(&declaration, context, name, properties)
            }
            None => {
                warn!("Factory '{factory}' is not registered yet; component '{name}' is waiting");
                let mut declared = InstanceDeclaration::new(factory, name);
                declared.properties = properties;
                self.state
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .waiting
                    .push(declared);
                Ok(())
            }
        }
    }

    fn create_instance(
        self: &Arc<Self>,
        declaration: &FactoryDeclaration,
        context: BundleContext,
        name: &str,
        properties: Properties,
    ) -> Result<()> {
        // Constructs the user object, so no runtime lock may be held here
        let instance = StoredInstance::create(self, declaration, name, properties, context);

        {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            if !state.running {
                return Err(Error::NotRunning);
            }
            if state.instances.contains_key(name) {
                return Err(Error::DuplicateInstance(name.into()));
            }
            state.instances.insert(name.into(), instance.clone());
        }

        info!(
            "Instantiated component '{name}' from factory '{}'",
            declaration.name()
        );
        metrics::counter!("components_instantiated").increment(1);
        self.fire_event(ComponentEventKind::Instantiated, declaration.name(), Some(name));

        instance.start();
        Ok(())
    }

    pub fn kill_by_name(self: &Arc<Self>, name: &str) -> Result<()> {
        let instance = {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            match state.instances.remove(name) {
                Some(instance) => Some(instance),
                None => {
                    let before = state.waiting.len();
                    state.waiting.retain(|w| &*w.name != name);
                    if state.waiting.len() == before {
                        return Err(Error::UnknownInstance(name.into()));
                    }
                    None
                }
            }
        };

        if let Some(instance) = instance {
            instance.kill();
        }
        Ok(())
    }

    /// Bundle STARTING: register its declared factories, then its inline
    /// auto-instances.
    fn register_bundle(self: &Arc<Self>, bundle: &Bundle) {
        let (factories, instances) = bundle.declarations();
        let context = bundle.context();

        for declaration in factories {
            let name: Box<str> = declaration.name().into();
            if let Err(e) = self.register_factory(&context, declaration) {
                error!("Failed to register factory '{name}': {e}");
            }
        }
        for declared in instances {
            if let Err(e) = self.instantiate(&declared.factory, &declared.name, declared.properties)
            {
                error!("Failed to instantiate component '{}': {e}", declared.name);
            }
        }
    }

    /// Bundle STOPPING_PRECLEAN: kill the bundle's component instances, then
    /// unregister its factories.
    fn unregister_bundle(self: &Arc<Self>, bundle: &Bundle) {
        let names = {
            let state = self.state.lock().trace_expect("Failed to lock mutex");
            state
                .factories
                .iter()
                .filter(|(_, f)| f.context.bundle().id() == bundle.id())
                .map(|(name, _)| name.clone())
                .collect::<Vec<_>>()
        };

        for name in names {
            if let Err(e) = self.unregister_factory(&name) {
                warn!("Failed to unregister factory '{name}': {e}");
            }
        }
    }

    fn shutdown(self: &Arc<Self>) {
        let (instances, factories) = {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            state.running = false;
            state.waiting.clear();
            (
                state.instances.drain().collect::<Vec<_>>(),
                state.factories.drain().map(|(name, _)| name).collect::<Vec<_>>(),
            )
        };

        for (_, instance) in instances {
            instance.kill();
        }
        for name in factories {
            self.fire_event(ComponentEventKind::Unregistered, &name, None);
        }
    }
}

struct RuntimeBundleListener {
    inner: Weak<RuntimeInner>,
}

impl events::BundleListener for RuntimeBundleListener {
    fn bundle_changed(&self, event: &events::BundleEvent) -> events::CallbackResult {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        match event.kind {
            events::BundleEventKind::Starting => inner.register_bundle(&event.bundle),
            events::BundleEventKind::StoppingPreclean => inner.unregister_bundle(&event.bundle),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct CoreActivator {
    runtime: Mutex<Option<ComponentRuntime>>,
}

impl BundleActivator for CoreActivator {
    fn start(&self, context: &BundleContext) -> framework::Result<()> {
        let runtime = ComponentRuntime::new();

        let listener: Arc<dyn events::BundleListener> = Arc::new(RuntimeBundleListener {
            inner: Arc::downgrade(&runtime.inner),
        });
        context.add_bundle_listener(listener)?;
        context.register_service(
            &[RUNTIME_SPEC],
            service::object(runtime.clone()),
            Properties::new(),
        )?;

        // Catch up with bundles started before this one
        for bundle in context.get_bundles() {
            if matches!(bundle.state(), BundleState::Active | BundleState::Starting) {
                runtime.inner.register_bundle(&bundle);
            }
        }

        *self.runtime.lock().trace_expect("Failed to lock mutex") = Some(runtime);
        Ok(())
    }

    fn stop(&self, _context: &BundleContext) -> framework::Result<()> {
        if let Some(runtime) = self
            .runtime
            .lock()
            .trace_expect("Failed to lock mutex")
            .take()
        {
            runtime.inner.shutdown();
        }
        Ok(())
    }
}

/// The component runtime's code unit; mount it on the host's loader under
/// [`RUNTIME_LOCATION`] and install it like any other bundle.
pub fn code_unit() -> loader::CodeUnit {
    loader::CodeUnit::new(
        "gantry-component",
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default(),
    )
    .with_activator(Arc::new(CoreActivator::default()))
}

/// Looks the component runtime up in the registry, accounting the using
/// edge on the caller's bundle.
pub fn runtime(context: &BundleContext) -> framework::Result<Option<ComponentRuntime>> {
    let Some(reference) = context.get_service_reference(Some(RUNTIME_SPEC), None)? else {
        return Ok(None);
    };
    let object = context.get_service(&reference)?;
    Ok(service::typed::<ComponentRuntime>(&object))
}
