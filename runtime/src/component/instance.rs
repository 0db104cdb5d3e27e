use super::*;
use super::dependency::{AggregateDependency, DependencyHandler, SimpleDependency};
use super::provided::ProvidedService;
use super::runtime::RuntimeInner;

/// The accessor object handed to component callbacks: declared properties,
/// current bindings, and the owning bundle's context.
pub struct ComponentContext {
    name: Box<str>,
    factory: Box<str>,
    bundle_context: BundleContext,
    properties: Mutex<Properties>,
    instance: std::sync::OnceLock<Weak<StoredInstance>>,
}

impl ComponentContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn bundle_context(&self) -> &BundleContext {
        &self.bundle_context
    }

    pub fn properties(&self) -> Properties {
        self.properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .clone()
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .get(key)
            .cloned()
    }

    /// Sets a component property; when the value actually changed, the
    /// provided services push a `Modified` event through the registry.
    pub fn set_property(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let previous = self
            .properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .insert(key.into(), value.clone());

        if previous.as_ref() != Some(&value) {
            if let Some(instance) = self.instance.get().and_then(Weak::upgrade) {
                instance.property_changed(key);
            }
        }
    }

    /// The service currently bound to a simple requirement field.
    pub fn service(&self, field: &str) -> Option<ServiceObject> {
        self.services(field).into_iter().next()
    }

    /// All services currently bound to a requirement field.
    pub fn services(&self, field: &str) -> Vec<ServiceObject> {
        self.instance
            .get()
            .and_then(Weak::upgrade)
            .map(|instance| instance.bound_services(field))
            .unwrap_or_default()
    }
}

struct Lifecycle {
    state: ComponentState,
    // a transition (and its user callbacks) is in flight
    busy: bool,
    // a nested or concurrent request asked for re-evaluation
    dirty: bool,
    // a kill raced with an in-flight transition
    kill_requested: bool,
}

/// A managed component: glues the dependency handlers, the provided-service
/// handlers and the user object together, and drives the instance through
/// its states.
pub(crate) struct StoredInstance {
    name: Box<str>,
    factory: Box<str>,
    runtime: Weak<RuntimeInner>,
    pub(crate) context: Arc<ComponentContext>,
    component: Arc<dyn Component>,
    lifecycle: Mutex<Lifecycle>,
    handlers: Vec<Arc<dyn DependencyHandler>>,
    provides: Vec<Arc<ProvidedService>>,
}

impl StoredInstance {
    pub fn create(
        runtime: &Arc<RuntimeInner>,
        declaration: &FactoryDeclaration,
        name: &str,
        instance_properties: Properties,
        bundle_context: BundleContext,
    ) -> Arc<Self> {
        // Factory defaults, overridden per-instance, overridden by framework
        // properties for the keys the factory declared
        let mut properties = declaration.default_properties().clone();
        properties.extend(instance_properties);
        for key in declaration.default_properties().keys() {
            if let Some(value) = bundle_context.get_property(key) {
                properties.insert(key.clone(), value);
            }
        }

        let context = Arc::new(ComponentContext {
            name: name.into(),
            factory: declaration.name().into(),
            bundle_context,
            properties: Mutex::new(properties),
            instance: std::sync::OnceLock::new(),
        });

        let component = declaration.construct();

        let instance = Arc::new_cyclic(|weak: &Weak<StoredInstance>| {
            let handlers = declaration
                .requires()
                .iter()
                .map(|(field, requirement)| {
                    if requirement.is_aggregate() {
                        Arc::new(AggregateDependency::new(
                            weak.clone(),
                            field.clone(),
                            requirement.clone(),
                        )) as Arc<dyn DependencyHandler>
                    } else {
                        Arc::new(SimpleDependency::new(
                            weak.clone(),
                            field.clone(),
                            requirement.clone(),
                        )) as Arc<dyn DependencyHandler>
                    }
                })
                .collect();

            let provides = declaration
                .provides()
                .iter()
                .map(|specs| Arc::new(ProvidedService::new(weak.clone(), specs.clone())))
                .collect();

            StoredInstance {
                name: name.into(),
                factory: declaration.name().into(),
                runtime: Arc::downgrade(runtime),
                context: context.clone(),
                component,
                lifecycle: Mutex::new(Lifecycle {
                    state: ComponentState::Invalid,
                    busy: false,
                    dirty: false,
                    kill_requested: false,
                }),
                handlers,
                provides,
            }
        });

        let _ = instance.context.instance.set(Arc::downgrade(&instance));
        instance.component.on_instantiate(&instance.context);
        instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn state(&self) -> ComponentState {
        self.lifecycle
            .lock()
            .trace_expect("Failed to lock mutex")
            .state
    }

    pub fn bundle_context(&self) -> &BundleContext {
        self.context.bundle_context()
    }

    pub fn properties(&self) -> Properties {
        self.context.properties()
    }

    pub fn component_service(&self) -> ServiceObject {
        self.component.clone().as_service()
    }

    /// Subscribes the dependency handlers, runs the initial binding scan and
    /// evaluates the lifecycle.
    pub fn start(self: &Arc<Self>) {
        for handler in &self.handlers {
            let listener: Arc<dyn events::ServiceListener> = handler.clone();
            if let Err(e) = self
                .bundle_context()
                .add_service_listener_filtered(listener, Some(handler.requirement().effective_filter()))
            {
                warn!(
                    "Failed to subscribe dependency '{}' of component '{}': {e}",
                    handler.field(),
                    self.name
                );
            }
        }

        for handler in &self.handlers {
            if let Err(e) = handler.try_binding() {
                warn!(
                    "Initial binding of '{}' failed for component '{}': {e}",
                    handler.field(),
                    self.name
                );
            }
        }

        self.check_lifecycle();
    }

    /// True when the reference is one of this instance's own provided
    /// services.
    pub fn owns_reference(&self, reference: &ServiceReference) -> bool {
        let bundle = self.bundle_context().bundle().id();
        self.provides
            .iter()
            .any(|provided| provided.matches_reference(bundle, reference))
    }

    pub fn bound_services(&self, field: &str) -> Vec<ServiceObject> {
        self.handlers
            .iter()
            .find(|handler| handler.field() == field)
            .map(|handler| handler.bound_services())
            .unwrap_or_default()
    }

    /// A handler bound a new service: notify the user object, then
    /// re-evaluate the lifecycle.
    pub fn bind(self: &Arc<Self>, field: &str, service: ServiceObject, reference: ServiceReference) {
        self.component
            .on_bind(&self.context, field, &service, &reference);
        self.fire(ComponentEventKind::Bound);
        self.check_lifecycle();
    }

    /// A bound service is going away: invalidate first so the user observes
    /// the unbind from an already-invalidated instance, then release the
    /// edge and attempt to rebind.
    pub fn unbind(
        self: &Arc<Self>,
        field: &str,
        service: ServiceObject,
        reference: ServiceReference,
    ) {
        self.check_lifecycle();

        self.component
            .on_unbind(&self.context, field, &service, &reference);
        self.fire(ComponentEventKind::Unbound);
        let _ = self.bundle_context().unget_service(&reference);

        for handler in &self.handlers {
            if let Err(e) = handler.try_binding() {
                warn!(
                    "Rebinding of '{}' failed for component '{}': {e}",
                    handler.field(),
                    self.name
                );
            }
        }
        self.check_lifecycle();
    }

    /// Unbind without lifecycle recursion, used when a binding batch rolls
    /// back.
    pub fn unbind_rollback(
        &self,
        field: &str,
        service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        self.component
            .on_unbind(&self.context, field, service, reference);
        self.fire(ComponentEventKind::Unbound);
        let _ = self.bundle_context().unget_service(reference);
    }

    /// The lifecycle pump. Decides one transition at a time under the lock,
    /// runs its user callbacks with the lock released, then re-evaluates.
    /// Nested or concurrent calls during a transition mark the state dirty
    /// and return; the in-flight frame loops until the state settles, so an
    /// invalidation always completes before a new bind is considered.
    pub fn check_lifecycle(self: &Arc<Self>) {
        enum Transition {
            Invalidate,
            Validate,
        }

        loop {
            let transition = {
                let mut lifecycle = self.lifecycle.lock().trace_expect("Failed to lock mutex");
                if lifecycle.busy {
                    lifecycle.dirty = true;
                    return;
                }

                let dependencies_valid = self.handlers.iter().all(|h| h.is_valid());
                let running = self
                    .runtime
                    .upgrade()
                    .is_some_and(|runtime| runtime.is_running());

                match lifecycle.state {
                    ComponentState::Valid if !dependencies_valid => {
                        lifecycle.busy = true;
                        Some(Transition::Invalidate)
                    }
                    ComponentState::Invalid if dependencies_valid && running => {
                        lifecycle.busy = true;
                        lifecycle.state = ComponentState::Validating;
                        Some(Transition::Validate)
                    }
                    _ => None,
                }
            };

            let Some(transition) = transition else {
                return;
            };

            match transition {
                Transition::Invalidate => {
                    if let Err(e) = self.component.on_invalidate(&self.context) {
                        warn!("Error invalidating component '{}': {e}", self.name);
                    }
                    for provided in &self.provides {
                        provided.unregister();
                    }
                    if !self.commit(ComponentState::Invalid) {
                        return;
                    }
                    debug!("Component '{}' invalidated", self.name);
                    self.fire(ComponentEventKind::Invalidated);
                }
                Transition::Validate => match self.component.on_validate(&self.context) {
                    Ok(()) => {
                        for provided in &self.provides {
                            provided.register(self);
                        }
                        if !self.commit(ComponentState::Valid) {
                            return;
                        }
                        debug!("Component '{}' validated", self.name);
                        self.fire(ComponentEventKind::Validated);
                    }
                    Err(Error::Framework(framework::Error::StopFramework)) => {
                        error!(
                            "Component '{}' raised a framework error while validating",
                            self.name
                        );
                        if !self.commit(ComponentState::Invalid) {
                            return;
                        }
                        if let Some(runtime) = self.runtime.upgrade() {
                            let _ = runtime.kill_by_name(&self.name);
                        }
                        return;
                    }
                    Err(e) => {
                        error!("Error validating component '{}': {e}", self.name);
                        if !self.commit(ComponentState::Erroneous) {
                            return;
                        }
                        self.fire(ComponentEventKind::Invalidated);
                    }
                },
            }
            // Loop: re-evaluate whatever changed while the callbacks ran
        }
    }

    /// Commits an in-flight transition. Returns false when a kill raced in,
    /// in which case the teardown already ran and the pump must stop.
    fn commit(self: &Arc<Self>, state: ComponentState) -> bool {
        let killed = {
            let mut lifecycle = self.lifecycle.lock().trace_expect("Failed to lock mutex");
            lifecycle.dirty = false;
            if lifecycle.kill_requested {
                lifecycle.kill_requested = false;
                lifecycle.state = ComponentState::Killed;
                // teardown keeps running under this frame's busy claim
                true
            } else {
                lifecycle.state = state;
                lifecycle.busy = false;
                false
            }
        };

        if killed {
            self.teardown(state == ComponentState::Valid);
            self.lifecycle
                .lock()
                .trace_expect("Failed to lock mutex")
                .busy = false;
            false
        } else {
            true
        }
    }

    /// Transitions to the terminal state. When a transition is in flight on
    /// another frame, the kill is performed by that frame at commit time.
    pub fn kill(self: &Arc<Self>) {
        let was_valid = {
            let mut lifecycle = self.lifecycle.lock().trace_expect("Failed to lock mutex");
            if lifecycle.state == ComponentState::Killed {
                return;
            }
            if lifecycle.busy {
                lifecycle.kill_requested = true;
                return;
            }
            let was_valid = lifecycle.state == ComponentState::Valid;
            lifecycle.state = ComponentState::Killed;
            lifecycle.busy = true;
            was_valid
        };

        self.teardown(was_valid);
        self.lifecycle
            .lock()
            .trace_expect("Failed to lock mutex")
            .busy = false;
    }

    fn teardown(self: &Arc<Self>, was_valid: bool) {
        if was_valid {
            if let Err(e) = self.component.on_invalidate(&self.context) {
                warn!("Error invalidating component '{}': {e}", self.name);
            }
            for provided in &self.provides {
                provided.unregister();
            }
            self.fire(ComponentEventKind::Invalidated);
        }

        // Unsubscribe the handlers and run unbind callbacks for every
        // binding they still held
        for handler in &self.handlers {
            let listener: Arc<dyn events::ServiceListener> = handler.clone();
            let _ = self.bundle_context().remove_service_listener(&listener);
            for (service, reference) in handler.clear() {
                self.component
                    .on_unbind(&self.context, handler.field(), &service, &reference);
                self.fire(ComponentEventKind::Unbound);
                let _ = self.bundle_context().unget_service(&reference);
            }
        }

        info!("Killed component '{}'", self.name);
        metrics::counter!("components_killed").increment(1);
        self.fire(ComponentEventKind::Killed);
    }

    /// Manual invalidation; the instance stays `Invalid` until the next
    /// binding change (or a retry) re-evaluates it.
    pub fn force_invalidate(self: &Arc<Self>) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().trace_expect("Failed to lock mutex");
            if lifecycle.state != ComponentState::Valid || lifecycle.busy {
                return Err(Error::InvalidState(self.name.clone()));
            }
            lifecycle.busy = true;
        }

        if let Err(e) = self.component.on_invalidate(&self.context) {
            warn!("Error invalidating component '{}': {e}", self.name);
        }
        for provided in &self.provides {
            provided.unregister();
        }
        if self.commit(ComponentState::Invalid) {
            self.fire(ComponentEventKind::Invalidated);
        }
        Ok(())
    }

    /// Moves an erroneous instance back to `Invalid`, merges the given
    /// properties in and re-evaluates.
    pub fn retry(self: &Arc<Self>, properties: Properties) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().trace_expect("Failed to lock mutex");
            if lifecycle.state != ComponentState::Erroneous {
                return Err(Error::InvalidState(self.name.clone()));
            }
            lifecycle.state = ComponentState::Invalid;
        }

        self.context
            .properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .extend(properties);

        self.check_lifecycle();
        Ok(())
    }

    /// A declared property changed value: let the provided services emit
    /// `Modified` events.
    pub fn property_changed(&self, _key: &str) {
        let properties = self.context.properties();
        for provided in &self.provides {
            provided.update(&properties);
        }
    }

    fn fire(&self, kind: ComponentEventKind) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.fire_event(kind, &self.factory, Some(&self.name));
        }
    }

    pub fn details(&self) -> InstanceDetails {
        InstanceDetails {
            name: self.name.clone(),
            factory: self.factory.clone(),
            state: self.state(),
            properties: self.context.properties(),
            dependencies: self
                .handlers
                .iter()
                .map(|handler| DependencyDetails {
                    field: handler.field().into(),
                    requirement: handler.requirement().clone(),
                    bound: handler
                        .bound_references()
                        .iter()
                        .map(ServiceReference::id)
                        .collect(),
                })
                .collect(),
        }
    }
}
