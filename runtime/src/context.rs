use super::*;

/// The capability handed to bundle code: every operation is a thin wrapper
/// over the framework, accounted against this bundle.
#[derive(Clone)]
pub struct BundleContext {
    bundle: Bundle,
}

impl BundleContext {
    pub(crate) fn new(bundle: Bundle) -> Self {
        Self { bundle }
    }

    /// The bundle this context belongs to.
    pub fn bundle(&self) -> Bundle {
        self.bundle.clone()
    }

    fn framework(&self) -> framework::Result<Arc<framework::FrameworkInner>> {
        self.bundle.framework()
    }

    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.framework().ok()?.get_property(name)
    }

    pub fn get_bundle(&self, id: u64) -> framework::Result<Bundle> {
        self.framework()?
            .get_bundle(id)
            .ok_or(framework::Error::InvalidBundle(id))
    }

    /// The system bundle (id 0).
    pub fn framework_bundle(&self) -> framework::Result<Bundle> {
        self.get_bundle(0)
    }

    pub fn get_bundles(&self) -> Vec<Bundle> {
        self.framework().map(|f| f.get_bundles()).unwrap_or_default()
    }

    pub fn install_bundle(&self, location: &str) -> framework::Result<Bundle> {
        self.framework()?.install_bundle(location)
    }

    /// Registers a singleton service under the given specifications.
    pub fn register_service(
        &self,
        specs: &[&str],
        service: ServiceObject,
        properties: Properties,
    ) -> framework::Result<ServiceRegistration> {
        self.framework()?.register_service(
            &self.bundle,
            specs,
            service::Provider::Singleton(service),
            properties,
        )
    }

    /// Registers a service produced once per consuming bundle.
    pub fn register_service_factory(
        &self,
        specs: &[&str],
        factory: Arc<dyn service::ServiceFactory>,
        properties: Properties,
    ) -> framework::Result<ServiceRegistration> {
        self.framework()?.register_service(
            &self.bundle,
            specs,
            service::Provider::Factory(factory),
            properties,
        )
    }

    /// Registers a service minting a fresh instance per
    /// [`ServiceObjects::get`](service::ServiceObjects::get).
    pub fn register_prototype_factory(
        &self,
        specs: &[&str],
        factory: Arc<dyn service::PrototypeServiceFactory>,
        properties: Properties,
    ) -> framework::Result<ServiceRegistration> {
        self.framework()?.register_service(
            &self.bundle,
            specs,
            service::Provider::Prototype(factory),
            properties,
        )
    }

    fn parse_filter(filter: Option<&str>) -> framework::Result<Option<filter::Filter>> {
        filter
            .map(|f| f.parse::<filter::Filter>())
            .transpose()
            .map_err(framework::Error::Filter)
    }

    /// The first reference under the total order (highest ranking, then
    /// lowest service id), if any matches.
    pub fn get_service_reference(
        &self,
        spec: Option<&str>,
        filter: Option<&str>,
    ) -> framework::Result<Option<ServiceReference>> {
        let filter = Self::parse_filter(filter)?;
        Ok(self
            .framework()?
            .registry
            .find_one(spec, filter.as_ref()))
    }

    /// All matching references, in total order.
    pub fn get_all_service_references(
        &self,
        spec: Option<&str>,
        filter: Option<&str>,
    ) -> framework::Result<Vec<ServiceReference>> {
        let filter = Self::parse_filter(filter)?;
        Ok(self
            .framework()?
            .registry
            .find_all(spec, filter.as_ref()))
    }

    /// Matching references restricted to services this bundle registered.
    pub fn get_service_references(
        &self,
        spec: Option<&str>,
        filter: Option<&str>,
    ) -> framework::Result<Vec<ServiceReference>> {
        let mut references = self.get_all_service_references(spec, filter)?;
        references.retain(|r| r.bundle() == self.bundle);
        Ok(references)
    }

    /// Acquires the service object, recording a using edge on this bundle.
    pub fn get_service(&self, reference: &ServiceReference) -> framework::Result<ServiceObject> {
        self.framework()?.registry.get(&self.bundle, reference)
    }

    /// Per-call access for prototype-scope services.
    pub fn get_service_objects(
        &self,
        reference: &ServiceReference,
    ) -> framework::Result<service::ServiceObjects> {
        let framework = self.framework()?;
        Ok(service::ServiceObjects {
            framework: Arc::downgrade(&framework),
            bundle: self.bundle.clone(),
            reference: reference.clone(),
        })
    }

    /// Releases one using edge. Returns false if this bundle held none.
    pub fn unget_service(&self, reference: &ServiceReference) -> framework::Result<bool> {
        self.framework()?.registry.unget(&self.bundle, reference)
    }

    /// Idempotent: returns false when the listener was already added.
    pub fn add_bundle_listener(
        &self,
        listener: Arc<dyn events::BundleListener>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .add_bundle_listener(self.bundle.id(), listener))
    }

    pub fn remove_bundle_listener(
        &self,
        listener: &Arc<dyn events::BundleListener>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .remove_bundle_listener(self.bundle.id(), listener))
    }

    /// Adds a service listener, optionally filtered. The filter is parsed
    /// here: a malformed filter fails the registration.
    pub fn add_service_listener(
        &self,
        listener: Arc<dyn events::ServiceListener>,
        filter: Option<&str>,
    ) -> framework::Result<bool> {
        let filter = Self::parse_filter(filter)?;
        Ok(self
            .framework()?
            .dispatcher
            .add_service_listener(self.bundle.id(), listener, filter))
    }

    pub(crate) fn find_references(
        &self,
        filter: &filter::Filter,
    ) -> framework::Result<Vec<ServiceReference>> {
        Ok(self.framework()?.registry.find_all(None, Some(filter)))
    }

    pub(crate) fn add_service_listener_filtered(
        &self,
        listener: Arc<dyn events::ServiceListener>,
        filter: Option<filter::Filter>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .add_service_listener(self.bundle.id(), listener, filter))
    }

    pub fn remove_service_listener(
        &self,
        listener: &Arc<dyn events::ServiceListener>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .remove_service_listener(self.bundle.id(), listener))
    }

    pub fn add_framework_stop_listener(
        &self,
        listener: Arc<dyn events::FrameworkStopListener>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .add_stop_listener(self.bundle.id(), listener))
    }

    pub fn remove_framework_stop_listener(
        &self,
        listener: &Arc<dyn events::FrameworkStopListener>,
    ) -> framework::Result<bool> {
        Ok(self
            .framework()?
            .dispatcher
            .remove_stop_listener(self.bundle.id(), listener))
    }
}

impl std::fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle", &self.bundle)
            .finish()
    }
}
