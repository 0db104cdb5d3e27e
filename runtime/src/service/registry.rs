use super::*;

struct CachedService {
    service: ServiceObject,
    count: usize,
}

pub(crate) struct Entry {
    pub reference: ServiceReference,
    pub provider: Provider,
    // per-consumer cache for factory-produced objects
    bundle_cache: Mutex<HashMap<u64, CachedService>>,
    // per-consumer instances minted through ServiceObjects
    prototypes: Mutex<HashMap<u64, Vec<ServiceObject>>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    services: HashMap<u64, Arc<Entry>>,
    // Unregistering window: removed from the main table so no new consumer
    // can acquire the service, but still resolvable while the
    // `Unregistering` event is being delivered
    unregistering: HashMap<u64, Arc<Entry>>,
    by_spec: HashMap<String, Vec<u64>>,
    by_owner: HashMap<u64, Vec<u64>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    state: RwLock<State>,
    // consumer bundle id -> service ids it holds edges on
    consumed: Mutex<HashMap<u64, HashSet<u64>>>,
}

impl Registry {
    pub fn register(
        &self,
        owner: &Bundle,
        specs: &[&str],
        provider: Provider,
        mut properties: Properties,
    ) -> framework::Result<ServiceReference> {
        if specs.is_empty() || specs.iter().any(|s| s.trim().is_empty()) {
            return Err(framework::Error::MissingSpecification);
        }

        // Reserved keys are forced; a non-integer ranking is dropped
        if !matches!(
            properties.get(properties::SERVICE_RANKING),
            None | Some(Value::Int(_))
        ) {
            properties.remove(properties::SERVICE_RANKING);
        }

        let mut state = self.state.write().trace_expect("Failed to lock mutex");
        state.next_id += 1;
        let id = state.next_id;

        properties.insert(
            properties::OBJECT_CLASS.into(),
            specs.iter().copied().collect(),
        );
        properties.insert(properties::SERVICE_ID.into(), (id as i64).into());

        let reference = ServiceReference::new(
            id,
            owner.clone(),
            specs.iter().map(|s| (*s).into()).collect(),
            properties,
        );

        state.services.insert(
            id,
            Arc::new(Entry {
                reference: reference.clone(),
                provider,
                bundle_cache: Mutex::new(HashMap::new()),
                prototypes: Mutex::new(HashMap::new()),
            }),
        );
        for spec in specs {
            state.by_spec.entry((*spec).into()).or_default().push(id);
        }
        state.by_owner.entry(owner.id()).or_default().push(id);

        metrics::counter!("services_registered").increment(1);
        debug!("Registered service #{id} under {specs:?}");

        Ok(reference)
    }

    /// Removes the service from the main tables and parks it in the
    /// unregistering window.
    pub fn begin_unregister(&self, reference: &ServiceReference) -> framework::Result<()> {
        let mut state = self.state.write().trace_expect("Failed to lock mutex");
        let id = reference.id();
        let Some(entry) = state.services.remove(&id) else {
            return Err(framework::Error::InvalidRegistration);
        };

        for spec in entry.reference.specs() {
            if let Some(ids) = state.by_spec.get_mut(&**spec) {
                ids.retain(|i| *i != id);
                if ids.is_empty() {
                    state.by_spec.remove(&**spec);
                }
            }
        }
        let owner = entry.reference.bundle().id();
        if let Some(ids) = state.by_owner.get_mut(&owner) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                state.by_owner.remove(&owner);
            }
        }

        state.unregistering.insert(id, entry);
        Ok(())
    }

    /// Closes the unregistering window once the `Unregistering` event has
    /// been delivered.
    pub fn finish_unregister(&self, reference: &ServiceReference) {
        self.state
            .write()
            .trace_expect("Failed to lock mutex")
            .unregistering
            .remove(&reference.id());
        metrics::counter!("services_unregistered").increment(1);
    }

    pub fn is_live(&self, reference: &ServiceReference) -> bool {
        self.state
            .read()
            .trace_expect("Failed to lock mutex")
            .services
            .contains_key(&reference.id())
    }

    fn lookup(&self, id: u64) -> Option<(Arc<Entry>, bool)> {
        let state = self.state.read().trace_expect("Failed to lock mutex");
        if let Some(entry) = state.services.get(&id) {
            Some((entry.clone(), true))
        } else {
            state.unregistering.get(&id).map(|e| (e.clone(), false))
        }
    }

    pub fn get(
        &self,
        consumer: &Bundle,
        reference: &ServiceReference,
    ) -> framework::Result<ServiceObject> {
        let id = reference.id();
        let Some((entry, live)) = self.lookup(id) else {
            return Err(framework::Error::InvalidReference(id));
        };

        if !live {
            // Unregistering window: the last-known object stays retrievable,
            // but no new edge is recorded
            return match &entry.provider {
                Provider::Singleton(service) => Ok(service.clone()),
                Provider::Factory(_) | Provider::Prototype(_) => entry
                    .bundle_cache
                    .lock()
                    .trace_expect("Failed to lock mutex")
                    .get(&consumer.id())
                    .map(|c| c.service.clone())
                    .ok_or(framework::Error::InvalidReference(id)),
            };
        }

        let service = match &entry.provider {
            Provider::Singleton(service) => service.clone(),
            Provider::Factory(factory) => self.factory_get(consumer, &entry, factory.as_ref())?,
            Provider::Prototype(factory) => {
                let factory: &dyn ServiceFactory = factory.as_ref();
                self.factory_get(consumer, &entry, factory)?
            }
        };

        entry.reference.add_use(consumer.id());
        self.consumed
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(consumer.id())
            .or_default()
            .insert(id);
        Ok(service)
    }

    fn factory_get(
        &self,
        consumer: &Bundle,
        entry: &Entry,
        factory: &dyn ServiceFactory,
    ) -> framework::Result<ServiceObject> {
        {
            let mut cache = entry
                .bundle_cache
                .lock()
                .trace_expect("Failed to lock mutex");
            if let Some(cached) = cache.get_mut(&consumer.id()) {
                cached.count += 1;
                return Ok(cached.service.clone());
            }
        }

        // The factory runs without any registry lock held; it may re-enter
        let service = factory
            .get_service(consumer, &entry.reference)
            .map_err(framework::Error::Internal)?;

        let mut cache = entry
            .bundle_cache
            .lock()
            .trace_expect("Failed to lock mutex");
        match cache.entry(consumer.id()) {
            hash_map::Entry::Occupied(mut occupied) => {
                // Lost a race with a concurrent get; keep the first object
                occupied.get_mut().count += 1;
                let existing = occupied.get().service.clone();
                drop(cache);
                factory.unget_service(consumer, &entry.reference, service);
                Ok(existing)
            }
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(CachedService {
                    service: service.clone(),
                    count: 1,
                });
                Ok(service)
            }
        }
    }

    pub fn unget(&self, consumer: &Bundle, reference: &ServiceReference) -> framework::Result<bool> {
        let Some((entry, _)) = self.lookup(reference.id()) else {
            return Ok(false);
        };
        if entry.reference.outstanding(consumer.id()) == 0 {
            return Ok(false);
        }

        match &entry.provider {
            Provider::Singleton(_) => {}
            Provider::Factory(factory) => self.factory_unget(consumer, &entry, factory.as_ref()),
            Provider::Prototype(factory) => {
                let factory: &dyn ServiceFactory = factory.as_ref();
                self.factory_unget(consumer, &entry, factory)
            }
        }

        entry.reference.remove_use(consumer.id());
        if entry.reference.outstanding(consumer.id()) == 0 {
            self.forget_edge(consumer.id(), reference.id());
        }
        Ok(true)
    }

    fn factory_unget(&self, consumer: &Bundle, entry: &Entry, factory: &dyn ServiceFactory) {
        let released = {
            let mut cache = entry
                .bundle_cache
                .lock()
                .trace_expect("Failed to lock mutex");
            match cache.get_mut(&consumer.id()) {
                Some(cached) if cached.count <= 1 => cache.remove(&consumer.id()),
                Some(cached) => {
                    cached.count -= 1;
                    None
                }
                None => None,
            }
        };

        if let Some(cached) = released {
            factory.unget_service(consumer, &entry.reference, cached.service);
        }
    }

    pub fn get_prototype_instance(
        &self,
        consumer: &Bundle,
        reference: &ServiceReference,
    ) -> framework::Result<ServiceObject> {
        let id = reference.id();
        let Some((entry, live)) = self.lookup(id) else {
            return Err(framework::Error::InvalidReference(id));
        };
        if !live {
            return Err(framework::Error::InvalidReference(id));
        }

        let Provider::Prototype(factory) = &entry.provider else {
            // Non-prototype scope: behave like a plain get
            return self.get(consumer, reference);
        };

        let service = factory
            .get_service_instance(consumer, &entry.reference)
            .map_err(framework::Error::Internal)?;

        entry
            .prototypes
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(consumer.id())
            .or_default()
            .push(service.clone());
        entry.reference.add_use(consumer.id());
        self.consumed
            .lock()
            .trace_expect("Failed to lock mutex")
            .entry(consumer.id())
            .or_default()
            .insert(id);
        Ok(service)
    }

    pub fn release_prototype_instance(
        &self,
        consumer: &Bundle,
        reference: &ServiceReference,
        service: &ServiceObject,
    ) -> framework::Result<bool> {
        let Some((entry, _)) = self.lookup(reference.id()) else {
            return Ok(false);
        };
        let Provider::Prototype(factory) = &entry.provider else {
            return self.unget(consumer, reference);
        };

        let removed = {
            let mut prototypes = entry.prototypes.lock().trace_expect("Failed to lock mutex");
            let Some(instances) = prototypes.get_mut(&consumer.id()) else {
                return Ok(false);
            };
            let Some(index) = instances.iter().position(|i| Arc::ptr_eq(i, service)) else {
                return Ok(false);
            };
            let removed = instances.remove(index);
            if instances.is_empty() {
                prototypes.remove(&consumer.id());
            }
            removed
        };

        factory.unget_service_instance(consumer, &entry.reference, removed);
        entry.reference.remove_use(consumer.id());
        if entry.reference.outstanding(consumer.id()) == 0 {
            self.forget_edge(consumer.id(), reference.id());
        }
        Ok(true)
    }

    fn forget_edge(&self, consumer: u64, service: u64) {
        let mut consumed = self.consumed.lock().trace_expect("Failed to lock mutex");
        if let Some(ids) = consumed.get_mut(&consumer) {
            ids.remove(&service);
            if ids.is_empty() {
                consumed.remove(&consumer);
            }
        }
    }

    pub fn find_all(
        &self,
        spec: Option<&str>,
        filter: Option<&filter::Filter>,
    ) -> Vec<ServiceReference> {
        let mut references = {
            let state = self.state.read().trace_expect("Failed to lock mutex");
            let ids = match spec {
                Some(spec) => state.by_spec.get(spec).cloned().unwrap_or_default(),
                None => state.services.keys().copied().collect(),
            };
            ids.iter()
                .filter_map(|id| state.services.get(id))
                .map(|entry| entry.reference.clone())
                .collect::<Vec<_>>()
        };

        if let Some(filter) = filter {
            references.retain(|r| filter.matches(&r.properties()));
        }
        references.sort_by_cached_key(ServiceReference::sort_key);
        references
    }

    pub fn find_one(
        &self,
        spec: Option<&str>,
        filter: Option<&filter::Filter>,
    ) -> Option<ServiceReference> {
        self.find_all(spec, filter).into_iter().next()
    }

    /// Live services registered by a bundle, in registration order.
    pub fn find_owned(&self, owner: u64) -> Vec<ServiceReference> {
        let state = self.state.read().trace_expect("Failed to lock mutex");
        state
            .by_owner
            .get(&owner)
            .into_iter()
            .flatten()
            .filter_map(|id| state.services.get(id))
            .map(|entry| entry.reference.clone())
            .collect()
    }

    /// Releases every edge a stopping bundle still holds, invoking factory
    /// release callbacks as needed.
    pub fn release_all(&self, consumer: &Bundle) {
        let ids = self
            .consumed
            .lock()
            .trace_expect("Failed to lock mutex")
            .remove(&consumer.id())
            .unwrap_or_default();

        for id in ids {
            let Some((entry, _)) = self.lookup(id) else {
                continue;
            };

            let instances = entry
                .prototypes
                .lock()
                .trace_expect("Failed to lock mutex")
                .remove(&consumer.id())
                .unwrap_or_default();
            if let Provider::Prototype(factory) = &entry.provider {
                for service in instances {
                    factory.unget_service_instance(consumer, &entry.reference, service);
                    entry.reference.remove_use(consumer.id());
                }
            }

            let cached = entry
                .bundle_cache
                .lock()
                .trace_expect("Failed to lock mutex")
                .remove(&consumer.id());
            if let Some(cached) = cached {
                match &entry.provider {
                    Provider::Factory(factory) => {
                        factory.unget_service(consumer, &entry.reference, cached.service)
                    }
                    Provider::Prototype(factory) => {
                        factory.unget_service(consumer, &entry.reference, cached.service)
                    }
                    Provider::Singleton(_) => {}
                }
            }

            while entry.reference.remove_use(consumer.id()) {}
        }
    }
}
