use super::*;

pub(crate) mod registry;

/// The payload of a registered service.
///
/// Trait-object services are registered double-wrapped
/// (`Arc::new(arc_of_dyn_trait)`) so consumers can downcast back to
/// `Arc<dyn Trait>` with [`typed`].
pub type ServiceObject = Arc<dyn std::any::Any + Send + Sync>;

/// Outcome of a user service-factory callback.
pub type FactoryResult<T> = core::result::Result<T, Box<dyn core::error::Error + Send + Sync>>;

/// Wraps a value into a registrable service payload.
pub fn object<T: Send + Sync + 'static>(value: T) -> ServiceObject {
    Arc::new(value)
}

/// Downcasts a service payload, typically to an `Arc<dyn Trait>` or an
/// `Arc<ConcreteType>`.
pub fn typed<T: Clone + Send + Sync + 'static>(object: &ServiceObject) -> Option<T> {
    object.downcast_ref::<T>().cloned()
}

/// Produces one service object per consuming bundle; the result is cached
/// and released when the last outstanding get from that bundle is returned.
pub trait ServiceFactory: Send + Sync {
    fn get_service(
        &self,
        bundle: &Bundle,
        reference: &ServiceReference,
    ) -> FactoryResult<ServiceObject>;

    fn unget_service(&self, bundle: &Bundle, reference: &ServiceReference, service: ServiceObject);
}

/// A [`ServiceFactory`] that can additionally mint one instance per call
/// through a [`ServiceObjects`] handle.
pub trait PrototypeServiceFactory: ServiceFactory {
    fn get_service_instance(
        &self,
        bundle: &Bundle,
        reference: &ServiceReference,
    ) -> FactoryResult<ServiceObject>;

    fn unget_service_instance(
        &self,
        bundle: &Bundle,
        reference: &ServiceReference,
        service: ServiceObject,
    );
}

/// How a registered service produces its objects.
pub enum Provider {
    Singleton(ServiceObject),
    Factory(Arc<dyn ServiceFactory>),
    Prototype(Arc<dyn PrototypeServiceFactory>),
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Provider::Singleton(_) => "Singleton",
            Provider::Factory(_) => "Factory",
            Provider::Prototype(_) => "Prototype",
        })
    }
}

pub(crate) struct ServiceRecord {
    id: u64,
    owner: Bundle,
    specs: Box<[Box<str>]>,
    properties: RwLock<Properties>,
    // consumer bundle id -> outstanding gets
    using: Mutex<HashMap<u64, usize>>,
}

/// Consumer-side handle to a registered service, totally ordered by
/// (ranking descending, service id ascending).
#[derive(Clone)]
pub struct ServiceReference {
    record: Arc<ServiceRecord>,
}

impl ServiceReference {
    pub(crate) fn new(id: u64, owner: Bundle, specs: Box<[Box<str>]>, properties: Properties) -> Self {
        Self {
            record: Arc::new(ServiceRecord {
                id,
                owner,
                specs,
                properties: RwLock::new(properties),
                using: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// The bundle that registered the service.
    pub fn bundle(&self) -> Bundle {
        self.record.owner.clone()
    }

    pub fn specs(&self) -> &[Box<str>] {
        &self.record.specs
    }

    pub fn provides(&self, spec: &str) -> bool {
        self.record.specs.iter().any(|s| &**s == spec)
    }

    /// Copy-on-read view of the current properties.
    pub fn properties(&self) -> Properties {
        self.record
            .properties
            .read()
            .trace_expect("Failed to lock mutex")
            .clone()
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.record
            .properties
            .read()
            .trace_expect("Failed to lock mutex")
            .get(key)
            .cloned()
    }

    pub fn ranking(&self) -> i64 {
        properties::service_ranking(
            &self
                .record
                .properties
                .read()
                .trace_expect("Failed to lock mutex"),
        )
    }

    /// Bundles with at least one outstanding get on this service.
    pub fn using_bundles(&self) -> Vec<u64> {
        let mut bundles = self
            .record
            .using
            .lock()
            .trace_expect("Failed to lock mutex")
            .keys()
            .copied()
            .collect::<Vec<_>>();
        bundles.sort_unstable();
        bundles
    }

    pub(crate) fn replace_properties(&self, properties: Properties) {
        *self
            .record
            .properties
            .write()
            .trace_expect("Failed to lock mutex") = properties;
    }

    pub(crate) fn add_use(&self, bundle: u64) {
        *self
            .record
            .using
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(bundle)
            .or_insert(0) += 1;
    }

    /// Returns false if the bundle held no outstanding get.
    pub(crate) fn remove_use(&self, bundle: u64) -> bool {
        let mut using = self.record.using.lock().trace_expect("Failed to lock mutex");
        match using.get_mut(&bundle) {
            None => false,
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    using.remove(&bundle);
                }
                true
            }
        }
    }

    pub(crate) fn outstanding(&self, bundle: u64) -> usize {
        self.record
            .using
            .lock()
            .trace_expect("Failed to lock mutex")
            .get(&bundle)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn sort_key(&self) -> (std::cmp::Reverse<i64>, u64) {
        (std::cmp::Reverse(self.ranking()), self.record.id)
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.record.id == other.record.id
    }
}

impl Eq for ServiceReference {}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.record.id.hash(state);
    }
}

impl std::fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.record.id)
            .field("specs", &self.record.specs)
            .finish()
    }
}

/// Owner-side handle to a registered service.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub(crate) framework: Weak<framework::FrameworkInner>,
    pub(crate) reference: ServiceReference,
}

impl ServiceRegistration {
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// Merges the given keys into the service properties, stripping the
    /// reserved ones. Emits `Modified` when anything actually changed.
    pub fn update_properties(&self, properties: Properties) -> framework::Result<()> {
        self.framework
            .upgrade()
            .ok_or(framework::Error::InvalidRegistration)?
            .update_service_properties(&self.reference, properties)
    }

    /// Withdraws the service. Fails with `InvalidRegistration` when already
    /// unregistered.
    pub fn unregister(&self) -> framework::Result<()> {
        self.framework
            .upgrade()
            .ok_or(framework::Error::InvalidRegistration)?
            .unregister_service(&self.reference)
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("reference", &self.reference)
            .finish()
    }
}

/// Per-call access to a prototype-scope service: every [`get`](Self::get)
/// mints a fresh instance which must be returned through
/// [`unget`](Self::unget).
pub struct ServiceObjects {
    pub(crate) framework: Weak<framework::FrameworkInner>,
    pub(crate) bundle: Bundle,
    pub(crate) reference: ServiceReference,
}

impl ServiceObjects {
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn get(&self) -> framework::Result<ServiceObject> {
        self.framework
            .upgrade()
            .ok_or(framework::Error::NotRunning)?
            .registry
            .get_prototype_instance(&self.bundle, &self.reference)
    }

    pub fn unget(&self, service: &ServiceObject) -> framework::Result<bool> {
        self.framework
            .upgrade()
            .ok_or(framework::Error::NotRunning)?
            .registry
            .release_prototype_instance(&self.bundle, &self.reference, service)
    }
}
