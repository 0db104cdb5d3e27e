use super::*;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Symbolic name of the system bundle (id 0).
pub const SYMBOLIC_NAME: &str = "gantry.framework";

#[derive(Debug, Error)]
pub enum Error {
    #[error("the framework is not running")]
    NotRunning,

    #[error("no code loader configured")]
    NoLoader,

    #[error("bundle {0} is no longer installed")]
    InvalidBundle(u64),

    #[error("a bundle named '{0}' is already installed")]
    DuplicateBundle(Box<str>),

    #[error("the service registration is no longer valid")]
    InvalidRegistration,

    #[error("service reference {0} is no longer valid")]
    InvalidReference(u64),

    #[error("the framework bundle cannot be uninstalled")]
    UninstallForbidden,

    #[error("at least one specification is required to register a service")]
    MissingSpecification,

    #[error("failed to load code for '{location}'")]
    LoadFailed {
        location: Box<str>,
        #[source]
        source: loader::Error,
    },

    #[error(transparent)]
    Filter(#[from] filter::Error),

    /// Distinguished error: raised from an activator or component callback
    /// it instructs the framework to abort its startup or stop.
    #[error("framework stop requested")]
    StopFramework,

    #[error(transparent)]
    Internal(#[from] Box<dyn core::error::Error + Send + Sync>),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Default)]
pub struct Config {
    /// Framework properties; take precedence over the process environment.
    pub properties: Properties,

    #[cfg_attr(feature = "serde", serde(skip))]
    pub loader: Option<Arc<dyn loader::CodeLoader>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("properties", &self.properties)
            .finish()
    }
}

struct BundleTable {
    next_id: u64,
    by_id: BTreeMap<u64, Bundle>,
    by_name: HashMap<Box<str>, u64>,
}

pub(crate) struct FrameworkInner {
    properties: Mutex<Properties>,
    bundles: Mutex<BundleTable>,
    pub(crate) registry: service::registry::Registry,
    pub(crate) dispatcher: events::EventDispatcher,
    loader: Option<Arc<dyn loader::CodeLoader>>,
    system: Bundle,
    stop_lock: Mutex<()>,
    stop_cv: Condvar,
}

/// The runtime itself: owns the bundle table, the service registry and the
/// event dispatcher, and occupies bundle id 0.
///
/// An explicit value constructed by the host; there is no process-wide
/// singleton.
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    pub fn new(config: Config) -> Self {
        metrics::describe_counter!("bundles_installed", "Bundles installed");
        metrics::describe_counter!("bundles_uninstalled", "Bundles uninstalled");
        metrics::describe_counter!("services_registered", "Services registered");
        metrics::describe_counter!("services_unregistered", "Services unregistered");
        metrics::describe_counter!("bundle_events", "Bundle events dispatched");
        metrics::describe_counter!("service_events", "Service events dispatched");

        let inner = Arc::new_cyclic(|weak: &Weak<FrameworkInner>| {
            let system = Bundle {
                data: Arc::new(bundle::BundleData {
                    id: 0,
                    location: "gantry://framework".into(),
                    framework: weak.clone(),
                    inner: Mutex::new(bundle::BundleInner {
                        state: BundleState::Resolved,
                        code: loader::CodeUnit::new(
                            SYMBOLIC_NAME,
                            env!("CARGO_PKG_VERSION").parse().unwrap_or_default(),
                        ),
                    }),
                }),
            };

            FrameworkInner {
                properties: Mutex::new(config.properties),
                bundles: Mutex::new(BundleTable {
                    next_id: 0,
                    by_id: BTreeMap::from([(0, system.clone())]),
                    by_name: HashMap::from([(SYMBOLIC_NAME.into(), 0)]),
                }),
                registry: Default::default(),
                dispatcher: Default::default(),
                loader: config.loader,
                system,
                stop_lock: Mutex::new(()),
                stop_cv: Condvar::new(),
            }
        });

        Framework { inner }
    }

    /// The system bundle (id 0).
    pub fn bundle(&self) -> Bundle {
        self.inner.system.clone()
    }

    /// A context accounted against the system bundle.
    pub fn context(&self) -> BundleContext {
        self.inner.system.context()
    }

    pub fn state(&self) -> BundleState {
        self.inner.system.state()
    }

    /// Starts the framework, then every installed bundle.
    pub fn start(&self) -> Result<bool> {
        self.inner.start_framework()
    }

    /// Stops every bundle in reverse install order, then the framework.
    pub fn stop(&self) -> Result<bool> {
        self.inner.stop_framework()
    }

    /// Stops and restarts the whole framework.
    pub fn update(&self) -> Result<()> {
        if self.state() == BundleState::Active {
            self.stop()?;
            self.start()?;
        }
        Ok(())
    }

    /// Returns true once the framework has stopped; immediately true if it
    /// is not active, false if the timeout elapsed first.
    pub fn wait_for_stop(&self, timeout: Option<std::time::Duration>) -> bool {
        self.inner.wait_for_stop(timeout)
    }

    pub fn install_bundle(&self, location: &str) -> Result<Bundle> {
        self.inner.install_bundle(location)
    }

    pub fn get_bundle(&self, id: u64) -> Option<Bundle> {
        self.inner.get_bundle(id)
    }

    pub fn get_bundle_by_name(&self, name: &str) -> Option<Bundle> {
        let table = self
            .inner
            .bundles
            .lock()
            .trace_expect("Failed to lock mutex");
        table
            .by_name
            .get(name)
            .and_then(|id| table.by_id.get(id))
            .cloned()
    }

    /// All installed bundles, in install order.
    pub fn bundles(&self) -> Vec<Bundle> {
        self.inner.get_bundles()
    }

    /// Write-once: returns false (keeping the first value) when the name is
    /// already set.
    pub fn add_property(&self, name: &str, value: impl Into<Value>) -> bool {
        match self
            .inner
            .properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(name.into())
        {
            hash_map::Entry::Occupied(_) => false,
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(value.into());
                true
            }
        }
    }

    /// Explicit configuration first, then the process environment.
    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.inner.get_property(name)
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("state", &self.state())
            .finish()
    }
}

impl FrameworkInner {
    pub fn get_property(&self, name: &str) -> Option<Value> {
        if let Some(value) = self
            .properties
            .lock()
            .trace_expect("Failed to lock mutex")
            .get(name)
        {
            return Some(value.clone());
        }
        std::env::var(name).ok().map(Value::from)
    }

    pub fn get_bundle(&self, id: u64) -> Option<Bundle> {
        self.bundles
            .lock()
            .trace_expect("Failed to lock mutex")
            .by_id
            .get(&id)
            .cloned()
    }

    pub fn get_bundles(&self) -> Vec<Bundle> {
        self.bundles
            .lock()
            .trace_expect("Failed to lock mutex")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    fn framework_state(&self) -> BundleState {
        self.system.state()
    }

    fn set_framework_state(&self, state: BundleState) {
        self.system
            .data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .state = state;
    }

    fn fire_bundle_event(&self, kind: events::BundleEventKind, bundle: &Bundle) {
        self.dispatcher.fire_bundle_event(&events::BundleEvent {
            kind,
            bundle: bundle.clone(),
        });
    }

    // --- bundle lifecycle ---------------------------------------------

    pub fn install_bundle(self: &Arc<Self>, location: &str) -> Result<Bundle> {
        let loader = self.loader.clone().ok_or(Error::NoLoader)?;
        let unit = loader.load(location).map_err(|source| Error::LoadFailed {
            location: location.into(),
            source,
        })?;

        let bundle = {
            let mut table = self.bundles.lock().trace_expect("Failed to lock mutex");
            if table.by_name.contains_key(&unit.symbolic_name) {
                return Err(Error::DuplicateBundle(unit.symbolic_name));
            }

            table.next_id += 1;
            let id = table.next_id;
            let name = unit.symbolic_name.clone();
            let bundle = Bundle {
                data: Arc::new(bundle::BundleData {
                    id,
                    location: location.into(),
                    framework: Arc::downgrade(self),
                    inner: Mutex::new(bundle::BundleInner {
                        state: BundleState::Resolved,
                        code: unit,
                    }),
                }),
            };
            table.by_id.insert(id, bundle.clone());
            table.by_name.insert(name, id);
            bundle
        };

        info!(
            "Installed bundle #{} '{}' from '{location}'",
            bundle.id(),
            bundle.symbolic_name()
        );
        metrics::counter!("bundles_installed").increment(1);
        self.fire_bundle_event(events::BundleEventKind::Installed, &bundle);
        Ok(bundle)
    }

    pub fn start_bundle(self: &Arc<Self>, bundle: &Bundle) -> Result<()> {
        if !matches!(
            self.framework_state(),
            BundleState::Starting | BundleState::Active
        ) {
            return Err(Error::NotRunning);
        }

        let activator = {
            let mut inner = bundle.data.inner.lock().trace_expect("Failed to lock mutex");
            match inner.state {
                BundleState::Active | BundleState::Starting => return Ok(()),
                BundleState::Uninstalled => return Err(Error::InvalidBundle(bundle.id())),
                _ => {}
            }
            inner.state = BundleState::Starting;
            inner.code.activator.clone()
        };

        self.fire_bundle_event(events::BundleEventKind::Starting, bundle);

        let context = bundle.context();
        let result = match activator {
            Some(activator) => activator.start(&context),
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                bundle
                    .data
                    .inner
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .state = BundleState::Active;
                debug!("Started bundle '{}'", bundle.symbolic_name());
                self.fire_bundle_event(events::BundleEventKind::Started, bundle);
                Ok(())
            }
            Err(e) => {
                // Roll back and drop whatever the activator managed to
                // register before failing
                bundle
                    .data
                    .inner
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .state = BundleState::Resolved;
                self.unregister_bundle_services(bundle);
                self.registry.release_all(bundle);
                self.dispatcher.clear_bundle(bundle.id());
                error!(
                    "Error starting bundle '{}': {e}",
                    bundle.symbolic_name()
                );
                Err(e)
            }
        }
    }

    pub fn stop_bundle(self: &Arc<Self>, bundle: &Bundle) -> Result<()> {
        let activator = {
            let mut inner = bundle.data.inner.lock().trace_expect("Failed to lock mutex");
            if inner.state != BundleState::Active {
                return Ok(());
            }
            inner.state = BundleState::Stopping;
            inner.code.activator.clone()
        };

        self.fire_bundle_event(events::BundleEventKind::Stopping, bundle);

        let context = bundle.context();
        let failure = activator.and_then(|activator| activator.stop(&context).err());

        // The component layer tears itself down in this window, before the
        // framework reclaims anything left behind
        self.fire_bundle_event(events::BundleEventKind::StoppingPreclean, bundle);

        self.unregister_bundle_services(bundle);
        self.registry.release_all(bundle);
        self.dispatcher.clear_bundle(bundle.id());

        bundle
            .data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .state = BundleState::Resolved;
        debug!("Stopped bundle '{}'", bundle.symbolic_name());
        self.fire_bundle_event(events::BundleEventKind::Stopped, bundle);

        // An activator failure never skips cleanup; it surfaces afterwards
        match failure {
            Some(e) => {
                error!("Error stopping bundle '{}': {e}", bundle.symbolic_name());
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub fn update_bundle(self: &Arc<Self>, bundle: &Bundle) -> Result<()> {
        let loader = self.loader.clone().ok_or(Error::NoLoader)?;
        let was_active = bundle.state() == BundleState::Active;
        if was_active {
            self.stop_bundle(bundle)?;
        }

        let previous = {
            let inner = bundle.data.inner.lock().trace_expect("Failed to lock mutex");
            inner.code.clone()
        };
        let unit = loader
            .reload(&bundle.data.location, &previous)
            .map_err(|source| Error::LoadFailed {
                location: bundle.data.location.clone(),
                source,
            })?;

        if unit.symbolic_name != previous.symbolic_name {
            let mut table = self.bundles.lock().trace_expect("Failed to lock mutex");
            if table.by_name.contains_key(&unit.symbolic_name) {
                return Err(Error::DuplicateBundle(unit.symbolic_name));
            }
            table.by_name.remove(&previous.symbolic_name);
            table.by_name.insert(unit.symbolic_name.clone(), bundle.id());
        }
        bundle
            .data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .code = unit;

        self.fire_bundle_event(events::BundleEventKind::Updated, bundle);

        if was_active {
            self.start_bundle(bundle)?;
        }
        Ok(())
    }

    pub fn uninstall_bundle(self: &Arc<Self>, bundle: &Bundle) -> Result<()> {
        if bundle.id() == 0 {
            return Err(Error::UninstallForbidden);
        }

        if bundle.state() == BundleState::Active {
            if let Err(e) = self.stop_bundle(bundle) {
                error!(
                    "Error stopping bundle '{}' during uninstall: {e}",
                    bundle.symbolic_name()
                );
            }
        }

        {
            let table = self.bundles.lock().trace_expect("Failed to lock mutex");
            if !table.by_id.contains_key(&bundle.id()) {
                return Err(Error::InvalidBundle(bundle.id()));
            }
        }

        // A bundle can register services and listeners without ever being
        // started; reclaim them before the record disappears
        self.unregister_bundle_services(bundle);
        self.registry.release_all(bundle);
        self.dispatcher.clear_bundle(bundle.id());

        bundle
            .data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .state = BundleState::Uninstalled;
        self.fire_bundle_event(events::BundleEventKind::Uninstalled, bundle);

        {
            let mut table = self.bundles.lock().trace_expect("Failed to lock mutex");
            table.by_id.remove(&bundle.id());
            table.by_name.remove(&bundle.symbolic_name());
        }

        info!("Uninstalled bundle '{}'", bundle.symbolic_name());
        metrics::counter!("bundles_uninstalled").increment(1);
        Ok(())
    }

    // --- framework lifecycle ------------------------------------------

    fn start_framework(self: &Arc<Self>) -> Result<bool> {
        {
            let mut inner = self
                .system
                .data
                .inner
                .lock()
                .trace_expect("Failed to lock mutex");
            if matches!(inner.state, BundleState::Starting | BundleState::Active) {
                return Ok(false);
            }
            inner.state = BundleState::Starting;
        }
        info!("Starting framework");
        self.fire_bundle_event(events::BundleEventKind::Starting, &self.system);

        for bundle in self.get_bundles() {
            if bundle.id() == 0 {
                continue;
            }
            match self.start_bundle(&bundle) {
                Ok(()) => {}
                Err(Error::StopFramework) => {
                    warn!(
                        "Bundle '{}' requested a framework stop during startup",
                        bundle.symbolic_name()
                    );
                    self.abort_start();
                    return Ok(false);
                }
                Err(e) => {
                    self.abort_start();
                    return Err(e);
                }
            }
        }

        self.set_framework_state(BundleState::Active);
        info!("Framework started");
        self.fire_bundle_event(events::BundleEventKind::Started, &self.system);
        Ok(true)
    }

    fn abort_start(self: &Arc<Self>) {
        self.stop_all_bundles();
        self.set_framework_state(BundleState::Resolved);
        let _guard = self.stop_lock.lock().trace_expect("Failed to lock mutex");
        self.stop_cv.notify_all();
    }

    fn stop_framework(self: &Arc<Self>) -> Result<bool> {
        {
            let mut inner = self
                .system
                .data
                .inner
                .lock()
                .trace_expect("Failed to lock mutex");
            if inner.state != BundleState::Active {
                return Ok(false);
            }
            inner.state = BundleState::Stopping;
        }
        info!("Stopping framework");
        self.fire_bundle_event(events::BundleEventKind::Stopping, &self.system);

        // Delivered once, before any bundle is stopped
        self.dispatcher.fire_framework_stopping();

        self.stop_all_bundles();

        // The system bundle's own leftovers
        self.unregister_bundle_services(&self.system);
        self.registry.release_all(&self.system);

        self.set_framework_state(BundleState::Resolved);
        info!("Framework stopped");
        self.fire_bundle_event(events::BundleEventKind::Stopped, &self.system);
        self.dispatcher.clear_bundle(0);

        let _guard = self.stop_lock.lock().trace_expect("Failed to lock mutex");
        self.stop_cv.notify_all();
        Ok(true)
    }

    /// Stops every active bundle in reverse install order, logging (not
    /// propagating) individual failures.
    fn stop_all_bundles(self: &Arc<Self>) {
        for bundle in self.get_bundles().into_iter().rev() {
            if bundle.id() == 0 || bundle.state() != BundleState::Active {
                continue;
            }
            if let Err(e) = self.stop_bundle(&bundle) {
                error!(
                    "Error stopping bundle '{}': {e}",
                    bundle.symbolic_name()
                );
            }
        }
    }

    pub fn wait_for_stop(&self, timeout: Option<std::time::Duration>) -> bool {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut guard = self.stop_lock.lock().trace_expect("Failed to lock mutex");
        loop {
            if self.framework_state() != BundleState::Active {
                return true;
            }
            match deadline {
                None => {
                    guard = self
                        .stop_cv
                        .wait(guard)
                        .trace_expect("Failed to wait on condvar");
                }
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return self.framework_state() != BundleState::Active;
                    }
                    let (g, result) = self
                        .stop_cv
                        .wait_timeout(guard, deadline - now)
                        .trace_expect("Failed to wait on condvar");
                    guard = g;
                    if result.timed_out() {
                        return self.framework_state() != BundleState::Active;
                    }
                }
            }
        }
    }

    // --- services ------------------------------------------------------

    pub fn register_service(
        self: &Arc<Self>,
        owner: &Bundle,
        specs: &[&str],
        provider: service::Provider,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        if owner.state() == BundleState::Uninstalled {
            return Err(Error::InvalidBundle(owner.id()));
        }

        let reference = self.registry.register(owner, specs, provider, properties)?;
        self.fire_service_event(events::ServiceEventKind::Registered, reference.clone(), None);
        Ok(ServiceRegistration {
            framework: Arc::downgrade(self),
            reference,
        })
    }

    pub fn unregister_service(&self, reference: &ServiceReference) -> Result<()> {
        self.registry.begin_unregister(reference)?;
        // The reference stays resolvable while Unregistering is delivered
        self.fire_service_event(
            events::ServiceEventKind::Unregistering,
            reference.clone(),
            None,
        );
        self.registry.finish_unregister(reference);
        Ok(())
    }

    pub fn update_service_properties(
        &self,
        reference: &ServiceReference,
        mut properties: Properties,
    ) -> Result<()> {
        if !self.registry.is_live(reference) {
            return Err(Error::InvalidRegistration);
        }

        properties.remove(properties::OBJECT_CLASS);
        properties.remove(properties::SERVICE_ID);
        if !matches!(
            properties.get(properties::SERVICE_RANKING),
            None | Some(Value::Int(_))
        ) {
            properties.remove(properties::SERVICE_RANKING);
        }

        let previous = reference.properties();
        properties.retain(|key, value| previous.get(key) != Some(value));
        if properties.is_empty() {
            // Nothing changed, no event
            return Ok(());
        }

        let mut next = previous.clone();
        next.extend(properties);
        reference.replace_properties(next);

        self.fire_service_event(
            events::ServiceEventKind::Modified,
            reference.clone(),
            Some(previous),
        );
        Ok(())
    }

    fn fire_service_event(
        &self,
        kind: events::ServiceEventKind,
        reference: ServiceReference,
        previous: Option<Properties>,
    ) {
        let event = events::ServiceEvent {
            kind,
            reference,
            previous,
        };

        let hooks = self.collect_hooks();
        let hook_arg = hooks
            .iter()
            .map(|(r, h)| (r.id(), h.clone()))
            .collect::<Vec<_>>();
        self.dispatcher.fire_service_event(&event, &hook_arg);

        for (reference, _) in hooks {
            let _ = self.registry.unget(&self.system, &reference);
        }
    }

    fn collect_hooks(
        &self,
    ) -> Vec<(ServiceReference, Arc<dyn events::EventListenerHook>)> {
        let references = self
            .registry
            .find_all(Some(properties::SERVICE_EVENT_LISTENER_HOOK), None);
        if references.is_empty() {
            return Vec::new();
        }

        references
            .into_iter()
            .filter_map(|reference| {
                let object = self.registry.get(&self.system, &reference).ok()?;
                match service::typed::<Arc<dyn events::EventListenerHook>>(&object) {
                    Some(hook) => Some((reference, hook)),
                    None => {
                        warn!(
                            "Service #{} is not an event-listener hook",
                            reference.id()
                        );
                        let _ = self.registry.unget(&self.system, &reference);
                        None
                    }
                }
            })
            .collect()
    }

    fn unregister_bundle_services(&self, bundle: &Bundle) {
        for reference in self.registry.find_owned(bundle.id()) {
            if let Err(e) = self.unregister_service(&reference) {
                warn!(
                    "Failed to unregister service #{} of bundle '{}': {e}",
                    reference.id(),
                    bundle.symbolic_name()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{CodeUnit, StaticLoader};
    use crate::properties::SERVICE_RANKING;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn new_framework(loader: StaticLoader) -> Framework {
        Framework::new(Config {
            loader: Some(Arc::new(loader)),
            ..Default::default()
        })
    }

    struct Echo;

    #[derive(Default)]
    struct RecordingServiceListener {
        events: Mutex<Vec<events::ServiceEventKind>>,
    }

    impl RecordingServiceListener {
        fn kinds(&self) -> Vec<events::ServiceEventKind> {
            self.events.lock().unwrap().clone()
        }
    }

    impl events::ServiceListener for RecordingServiceListener {
        fn service_changed(&self, event: &events::ServiceEvent) -> events::CallbackResult {
            self.events.lock().unwrap().push(event.kind);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBundleListener {
        events: Mutex<Vec<(events::BundleEventKind, u64)>>,
    }

    impl RecordingBundleListener {
        fn kinds_for(&self, bundle: u64) -> Vec<events::BundleEventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, b)| *b == bundle)
                .map(|(k, _)| *k)
                .collect()
        }
    }

    impl events::BundleListener for RecordingBundleListener {
        fn bundle_changed(&self, event: &events::BundleEvent) -> events::CallbackResult {
            self.events
                .lock()
                .unwrap()
                .push((event.kind, event.bundle.id()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoActivator;

    impl BundleActivator for EchoActivator {
        fn start(&self, context: &BundleContext) -> Result<()> {
            context.register_service(
                &["IEcho"],
                service::object(Echo),
                props(&[("test", true.into())]),
            )?;
            Ok(())
        }

        fn stop(&self, _context: &BundleContext) -> Result<()> {
            Ok(())
        }
    }

    struct FailingActivator;

    impl BundleActivator for FailingActivator {
        fn start(&self, context: &BundleContext) -> Result<()> {
            context.register_service(&["IBroken"], service::object(Echo), Properties::new())?;
            Err(Error::Internal("boom".into()))
        }

        fn stop(&self, _context: &BundleContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn service_visibility_around_stop() {
        let loader = StaticLoader::new().with("test://x", || {
            CodeUnit::new("bundle-x", Version::default())
                .with_activator(Arc::new(EchoActivator))
        });
        let framework = new_framework(loader);
        framework.start().unwrap();
        let context = framework.context();

        let listener = Arc::new(RecordingServiceListener::default());
        let handle: Arc<dyn events::ServiceListener> = listener.clone();
        assert!(context
            .add_service_listener(handle.clone(), Some("(test=true)"))
            .unwrap());
        assert!(!context
            .add_service_listener(handle.clone(), Some("(test=true)"))
            .unwrap());

        let x = framework.install_bundle("test://x").unwrap();
        assert_eq!(x.state(), BundleState::Resolved);
        assert_eq!(&*x.symbolic_name(), "bundle-x");

        x.start().unwrap();
        assert_eq!(x.state(), BundleState::Active);
        assert_eq!(listener.kinds(), vec![events::ServiceEventKind::Registered]);

        let references = context
            .get_all_service_references(Some("IEcho"), None)
            .unwrap();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].property("test"), Some(true.into()));
        assert_eq!(references[0].bundle(), x);

        x.stop().unwrap();
        assert_eq!(x.state(), BundleState::Resolved);
        assert_eq!(
            listener.kinds(),
            vec![
                events::ServiceEventKind::Registered,
                events::ServiceEventKind::Unregistering
            ]
        );
        assert!(context
            .get_all_service_references(Some("IEcho"), None)
            .unwrap()
            .is_empty());

        assert!(context.remove_service_listener(&handle).unwrap());
        assert!(!context.remove_service_listener(&handle).unwrap());
    }

    #[test]
    fn bundle_event_sequence() {
        let loader = StaticLoader::new().with("test://x", || {
            CodeUnit::new("bundle-x", Version::default())
                .with_activator(Arc::new(EchoActivator))
        });
        let framework = new_framework(loader);
        framework.start().unwrap();
        let context = framework.context();

        let listener = Arc::new(RecordingBundleListener::default());
        context
            .add_bundle_listener(listener.clone())
            .unwrap();

        let x = framework.install_bundle("test://x").unwrap();
        x.start().unwrap();
        x.stop().unwrap();
        x.uninstall().unwrap();

        use events::BundleEventKind::*;
        assert_eq!(
            listener.kinds_for(x.id()),
            vec![
                Installed,
                Starting,
                Started,
                Stopping,
                StoppingPreclean,
                Stopped,
                Uninstalled
            ]
        );

        // The record is dropped and the id is not reused
        assert!(framework.get_bundle(x.id()).is_none());
        assert!(matches!(x.start(), Err(Error::InvalidBundle(_))));
        let y = framework.install_bundle("test://x").unwrap();
        assert!(y.id() > x.id());
    }

    #[test]
    fn ranking_order() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let a = context
            .register_service(&["IS"], service::object(Echo), Properties::new())
            .unwrap();
        let b = context
            .register_service(
                &["IS"],
                service::object(Echo),
                props(&[(SERVICE_RANKING, 10.into())]),
            )
            .unwrap();
        let c = context
            .register_service(
                &["IS"],
                service::object(Echo),
                props(&[(SERVICE_RANKING, 10.into())]),
            )
            .unwrap();

        let first = context
            .get_service_reference(Some("IS"), None)
            .unwrap()
            .unwrap();
        assert_eq!(&first, b.reference());

        let all = context.get_all_service_references(Some("IS"), None).unwrap();
        assert_eq!(
            all,
            vec![
                b.reference().clone(),
                c.reference().clone(),
                a.reference().clone()
            ]
        );

        // A ranking update re-orders subsequent queries
        a.update_properties(props(&[(SERVICE_RANKING, 20.into())]))
            .unwrap();
        let all = context.get_all_service_references(Some("IS"), None).unwrap();
        assert_eq!(&all[0], a.reference());
    }

    #[test]
    fn activator_failure_rolls_back() {
        let loader = StaticLoader::new().with("test://y", || {
            CodeUnit::new("bundle-y", Version::default())
                .with_activator(Arc::new(FailingActivator))
        });
        let framework = new_framework(loader);
        framework.start().unwrap();
        let context = framework.context();

        let listener = Arc::new(RecordingBundleListener::default());
        context.add_bundle_listener(listener.clone()).unwrap();

        let y = framework.install_bundle("test://y").unwrap();
        assert!(y.start().is_err());
        assert_eq!(y.state(), BundleState::Resolved);
        assert!(context
            .get_all_service_references(Some("IBroken"), None)
            .unwrap()
            .is_empty());

        use events::BundleEventKind::*;
        assert_eq!(listener.kinds_for(y.id()), vec![Installed, Starting]);
    }

    #[test]
    fn modified_endmatch() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let filtered = Arc::new(RecordingServiceListener::default());
        let unfiltered = Arc::new(RecordingServiceListener::default());
        context
            .add_service_listener(filtered.clone(), Some("(k=1)"))
            .unwrap();
        context.add_service_listener(unfiltered.clone(), None).unwrap();

        let registration = context
            .register_service(&["IK"], service::object(Echo), props(&[("k", 1.into())]))
            .unwrap();
        registration
            .update_properties(props(&[("k", 2.into())]))
            .unwrap();
        registration
            .update_properties(props(&[("k", 1.into())]))
            .unwrap();

        use events::ServiceEventKind::*;
        assert_eq!(filtered.kinds(), vec![Registered, ModifiedEndmatch, Modified]);
        // A nil filter matches everything, so the end-match case cannot arise
        assert_eq!(unfiltered.kinds(), vec![Registered, Modified, Modified]);
    }

    #[test]
    fn update_properties_semantics() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let listener = Arc::new(RecordingServiceListener::default());
        context.add_service_listener(listener.clone(), None).unwrap();

        let registration = context
            .register_service(&["IK"], service::object(Echo), props(&[("k", 1.into())]))
            .unwrap();
        let id = registration.reference().id();

        // Same values: no event
        registration
            .update_properties(props(&[("k", 1.into())]))
            .unwrap();
        // Reserved keys are stripped from the input
        registration
            .update_properties(props(&[
                (properties::OBJECT_CLASS, "IHijack".into()),
                (properties::SERVICE_ID, 9999.into()),
            ]))
            .unwrap();

        use events::ServiceEventKind::*;
        assert_eq!(listener.kinds(), vec![Registered]);
        let reference = registration.reference();
        assert_eq!(reference.property(properties::SERVICE_ID), Some((id as i64).into()));
        assert!(reference.provides("IK"));
        assert!(!reference.provides("IHijack"));

        // Previous properties ride on the Modified event
        registration
            .update_properties(props(&[("k", 2.into())]))
            .unwrap();
        assert_eq!(listener.kinds(), vec![Registered, Modified]);
    }

    #[test]
    fn unregister_twice_fails() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let registration = context
            .register_service(&["IS"], service::object(Echo), Properties::new())
            .unwrap();
        let reference = registration.reference().clone();

        registration.unregister().unwrap();
        assert!(matches!(
            registration.unregister(),
            Err(Error::InvalidRegistration)
        ));
        assert!(matches!(
            context.get_service(&reference),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn registration_ids_are_fresh() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let first = context
            .register_service(&["IS"], service::object(Echo), Properties::new())
            .unwrap();
        let first_id = first.reference().id();
        first.unregister().unwrap();

        let second = context
            .register_service(&["IS"], service::object(Echo), Properties::new())
            .unwrap();
        assert!(second.reference().id() > first_id);
    }

    #[test]
    fn add_property_is_write_once() {
        let framework = new_framework(StaticLoader::new());
        assert!(framework.add_property("answer", 42));
        assert!(!framework.add_property("answer", 43));
        assert_eq!(framework.get_property("answer"), Some(42.into()));

        // Explicit configuration wins over the environment
        let configured = Framework::new(Config {
            properties: props(&[("PATH", "overridden".into())]),
            ..Default::default()
        });
        assert_eq!(configured.get_property("PATH"), Some("overridden".into()));
        // Unset names fall back to the process environment
        assert!(framework.get_property("PATH").is_some());
        assert!(framework.get_property("gantry.no.such.property").is_none());
    }

    #[test]
    fn duplicate_symbolic_name_rejected() {
        let loader = StaticLoader::new()
            .with("test://a", || CodeUnit::new("same-name", Version::default()))
            .with("test://b", || CodeUnit::new("same-name", Version::default()));
        let framework = new_framework(loader);
        framework.start().unwrap();

        framework.install_bundle("test://a").unwrap();
        assert!(matches!(
            framework.install_bundle("test://b"),
            Err(Error::DuplicateBundle(_))
        ));
        assert!(matches!(
            framework.install_bundle("test://missing"),
            Err(Error::LoadFailed { .. })
        ));
    }

    #[test]
    fn framework_bundle_refuses_uninstall() {
        let framework = new_framework(StaticLoader::new());
        assert!(matches!(
            framework.bundle().uninstall(),
            Err(Error::UninstallForbidden)
        ));
    }

    #[test]
    fn start_requires_running_framework() {
        let loader = StaticLoader::new()
            .with("test://x", || CodeUnit::new("bundle-x", Version::default()));
        let framework = new_framework(loader);

        let x = framework.install_bundle("test://x").unwrap();
        assert!(matches!(x.start(), Err(Error::NotRunning)));

        framework.start().unwrap();
        x.start().unwrap();

        // Framework start also starts installed bundles
        framework.stop().unwrap();
        assert_eq!(x.state(), BundleState::Resolved);
        framework.start().unwrap();
        assert_eq!(x.state(), BundleState::Active);
    }

    struct CountingFactory {
        created: AtomicUsize,
        released: AtomicUsize,
    }

    impl service::ServiceFactory for CountingFactory {
        fn get_service(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
        ) -> service::FactoryResult<service::ServiceObject> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(service::object(n))
        }

        fn unget_service(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
            _service: service::ServiceObject,
        ) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn service_factory_is_cached_per_bundle() {
        let loader = StaticLoader::new()
            .with("test://c1", || CodeUnit::new("consumer-1", Version::default()))
            .with("test://c2", || CodeUnit::new("consumer-2", Version::default()));
        let framework = new_framework(loader);
        framework.start().unwrap();

        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        framework
            .context()
            .register_service_factory(&["IF"], factory.clone(), Properties::new())
            .unwrap();

        let c1 = framework.install_bundle("test://c1").unwrap();
        let c2 = framework.install_bundle("test://c2").unwrap();
        c1.start().unwrap();
        c2.start().unwrap();

        let reference = framework
            .context()
            .get_service_reference(Some("IF"), None)
            .unwrap()
            .unwrap();

        // Invoked once per consuming bundle, cached afterwards
        let one = c1.context().get_service(&reference).unwrap();
        let again = c1.context().get_service(&reference).unwrap();
        assert!(Arc::ptr_eq(&one, &again));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let other = c2.context().get_service(&reference).unwrap();
        assert!(!Arc::ptr_eq(&one, &other));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let mut using = reference.using_bundles();
        using.sort_unstable();
        assert_eq!(using, vec![c1.id(), c2.id()]);

        // One of two edges released: the cached object survives
        assert!(c1.context().unget_service(&reference).unwrap());
        assert_eq!(factory.released.load(Ordering::SeqCst), 0);
        // Last edge released on stop: the factory release callback runs
        c1.stop().unwrap();
        assert_eq!(factory.released.load(Ordering::SeqCst), 1);
        assert_eq!(reference.using_bundles(), vec![c2.id()]);
    }

    struct ProtoFactory {
        minted: AtomicUsize,
        returned: AtomicUsize,
    }

    impl service::ServiceFactory for ProtoFactory {
        fn get_service(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
        ) -> service::FactoryResult<service::ServiceObject> {
            Ok(service::object(self.minted.fetch_add(1, Ordering::SeqCst)))
        }

        fn unget_service(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
            _service: service::ServiceObject,
        ) {
        }
    }

    impl service::PrototypeServiceFactory for ProtoFactory {
        fn get_service_instance(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
        ) -> service::FactoryResult<service::ServiceObject> {
            Ok(service::object(self.minted.fetch_add(1, Ordering::SeqCst)))
        }

        fn unget_service_instance(
            &self,
            _bundle: &Bundle,
            _reference: &ServiceReference,
            _service: service::ServiceObject,
        ) {
            self.returned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn prototype_scope_mints_per_call() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let factory = Arc::new(ProtoFactory {
            minted: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        });
        context
            .register_prototype_factory(&["IP"], factory.clone(), Properties::new())
            .unwrap();

        let reference = context
            .get_service_reference(Some("IP"), None)
            .unwrap()
            .unwrap();
        let objects = context.get_service_objects(&reference).unwrap();

        let first = objects.get().unwrap();
        let second = objects.get().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.minted.load(Ordering::SeqCst), 2);

        assert!(objects.unget(&first).unwrap());
        assert!(!objects.unget(&first).unwrap());
        assert_eq!(factory.returned.load(Ordering::SeqCst), 1);
    }

    struct WindowListener {
        context: BundleContext,
        grabbed: Mutex<Option<service::ServiceObject>>,
    }

    impl events::ServiceListener for WindowListener {
        fn service_changed(&self, event: &events::ServiceEvent) -> events::CallbackResult {
            if event.kind == events::ServiceEventKind::Unregistering {
                *self.grabbed.lock().unwrap() =
                    Some(self.context.get_service(&event.reference)?);
            }
            Ok(())
        }
    }

    #[test]
    fn unregistering_window_keeps_service_gettable() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let listener = Arc::new(WindowListener {
            context: context.clone(),
            grabbed: Mutex::new(None),
        });
        context.add_service_listener(listener.clone(), None).unwrap();

        let registration = context
            .register_service(&["IW"], service::object(Echo), Properties::new())
            .unwrap();
        let reference = registration.reference().clone();

        registration.unregister().unwrap();
        assert!(listener.grabbed.lock().unwrap().is_some());
        assert!(matches!(
            context.get_service(&reference),
            Err(Error::InvalidReference(_))
        ));
    }

    struct SuppressingHook;

    impl events::EventListenerHook for SuppressingHook {
        fn event(
            &self,
            _event: &events::ServiceEvent,
            listeners: &mut events::ShrinkableListeners,
        ) {
            // Only filtered listeners get through
            for bundle in listeners.bundle_ids() {
                listeners.retain(bundle, |info| info.filter().is_some());
            }
        }
    }

    #[test]
    fn event_listener_hook_shrinks_delivery() {
        let framework = new_framework(StaticLoader::new());
        framework.start().unwrap();
        let context = framework.context();

        let unfiltered = Arc::new(RecordingServiceListener::default());
        let filtered = Arc::new(RecordingServiceListener::default());
        context.add_service_listener(unfiltered.clone(), None).unwrap();
        context
            .add_service_listener(filtered.clone(), Some("(objectClass=IH)"))
            .unwrap();

        let hook: Arc<dyn events::EventListenerHook> = Arc::new(SuppressingHook);
        context
            .register_service(
                &[properties::SERVICE_EVENT_LISTENER_HOOK],
                service::object(hook),
                Properties::new(),
            )
            .unwrap();

        // The hook is not consulted for its own registration event
        use events::ServiceEventKind::*;
        assert_eq!(unfiltered.kinds(), vec![Registered]);

        context
            .register_service(&["IH"], service::object(Echo), Properties::new())
            .unwrap();
        assert_eq!(unfiltered.kinds(), vec![Registered]);
        assert_eq!(filtered.kinds(), vec![Registered]);
    }

    #[test]
    fn wait_for_stop_with_timeout() {
        let framework = Arc::new(new_framework(StaticLoader::new()));
        framework.start().unwrap();

        let waiter = framework.clone();
        let t1 = std::thread::spawn(move || {
            let started = std::time::Instant::now();
            let stopped = waiter.wait_for_stop(Some(std::time::Duration::from_secs(1)));
            (stopped, started.elapsed())
        });

        std::thread::sleep(std::time::Duration::from_millis(100));
        framework.stop().unwrap();

        let (stopped, elapsed) = t1.join().unwrap();
        assert!(stopped);
        assert!(elapsed < std::time::Duration::from_secs(1));

        // Not active any more: immediate true
        assert!(framework.wait_for_stop(Some(std::time::Duration::from_secs(1))));

        // Active again with nobody stopping: the timeout elapses
        framework.start().unwrap();
        assert!(!framework.wait_for_stop(Some(std::time::Duration::from_millis(200))));
    }

    struct StopRequestingActivator;

    impl BundleActivator for StopRequestingActivator {
        fn start(&self, _context: &BundleContext) -> Result<()> {
            Err(Error::StopFramework)
        }

        fn stop(&self, _context: &BundleContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stop_framework_error_aborts_startup() {
        let loader = StaticLoader::new()
            .with("test://ok", || {
                CodeUnit::new("bundle-ok", Version::default())
                    .with_activator(Arc::new(EchoActivator))
            })
            .with("test://stopper", || {
                CodeUnit::new("bundle-stopper", Version::default())
                    .with_activator(Arc::new(StopRequestingActivator))
            });
        let framework = new_framework(loader);
        framework.start().unwrap();
        framework.install_bundle("test://ok").unwrap();
        framework.install_bundle("test://stopper").unwrap();
        framework.stop().unwrap();

        // The stop request is caught, logged and aborts the transition
        assert!(!framework.start().unwrap());
        assert_eq!(framework.state(), BundleState::Resolved);
    }

    #[test]
    fn update_reloads_code() {
        let generation = Arc::new(AtomicUsize::new(0));
        let counter = generation.clone();
        let loader = StaticLoader::new().with("test://v", move || {
            let minor = counter.fetch_add(1, Ordering::SeqCst) as u32;
            CodeUnit::new("versioned", Version::new(1, minor, 0))
        });
        let framework = new_framework(loader);
        framework.start().unwrap();

        let bundle = framework.install_bundle("test://v").unwrap();
        assert_eq!(bundle.version(), Version::new(1, 0, 0));
        bundle.start().unwrap();

        bundle.update().unwrap();
        assert_eq!(bundle.version(), Version::new(1, 1, 0));
        // Previously active, so the update restarted it
        assert_eq!(bundle.state(), BundleState::Active);
    }
}
