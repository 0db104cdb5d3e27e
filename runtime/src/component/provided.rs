use super::*;
use super::instance::StoredInstance;

#[derive(Default)]
struct ProvidedState {
    registration: Option<ServiceRegistration>,
    // true while our own Registered/Unregistering event is in flight and
    // the registration handle is not (or no longer) stored
    pending: bool,
}

/// Publishes one of the component's provided services while the instance is
/// `Valid`, and pushes property changes through as `Modified` events.
pub(crate) struct ProvidedService {
    instance: Weak<StoredInstance>,
    specs: Vec<Box<str>>,
    state: Mutex<ProvidedState>,
}

impl ProvidedService {
    pub fn new(instance: Weak<StoredInstance>, specs: Vec<Box<str>>) -> Self {
        Self {
            instance,
            specs,
            state: Mutex::new(ProvidedState::default()),
        }
    }

    /// Registers the service with a copy of the instance's current
    /// properties. Failures are logged, not raised.
    pub fn register(&self, instance: &Arc<StoredInstance>) {
        {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            if state.registration.is_some() {
                return;
            }
            state.pending = true;
        }

        let specs = self.specs.iter().map(|s| &**s).collect::<Vec<_>>();
        let result = instance.bundle_context().register_service(
            &specs,
            instance.component_service(),
            instance.properties(),
        );

        let mut state = self.state.lock().trace_expect("Failed to lock mutex");
        state.pending = false;
        match result {
            Ok(registration) => state.registration = Some(registration),
            Err(e) => error!(
                "Failed to register provided service {specs:?} of component '{}': {e}",
                instance.name()
            ),
        }
    }

    /// Withdraws the service. Errors are logged, not raised.
    pub fn unregister(&self) {
        let registration = {
            let mut state = self.state.lock().trace_expect("Failed to lock mutex");
            let Some(registration) = state.registration.take() else {
                return;
            };
            state.pending = true;
            registration
        };

        if let Err(e) = registration.unregister() {
            warn!("Failed to unregister provided service: {e}");
        }
        self.state
            .lock()
            .trace_expect("Failed to lock mutex")
            .pending = false;
    }

    /// Pushes a property change through to the registry when the service is
    /// currently registered.
    pub fn update(&self, properties: &Properties) {
        let registration = self
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .registration
            .clone();
        if let Some(registration) = registration {
            if let Err(e) = registration.update_properties(properties.clone()) {
                warn!("Failed to update provided service properties: {e}");
            }
        }
    }

    pub fn reference(&self) -> Option<ServiceReference> {
        self.state
            .lock()
            .trace_expect("Failed to lock mutex")
            .registration
            .as_ref()
            .map(|registration| registration.reference().clone())
    }

    /// True when the reference is (or is just becoming) this handler's own
    /// registration; used by dependency handlers to avoid self-binding
    /// while our own event is still being delivered.
    pub fn matches_reference(&self, owner_bundle: u64, reference: &ServiceReference) -> bool {
        let state = self.state.lock().trace_expect("Failed to lock mutex");
        if let Some(registration) = &state.registration {
            return registration.reference() == reference;
        }
        state.pending && reference.bundle().id() == owner_bundle && {
            let specs = reference.specs();
            self.specs.len() == specs.len() && self.specs.iter().all(|s| specs.contains(s))
        }
    }
}
