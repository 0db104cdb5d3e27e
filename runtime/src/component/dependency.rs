use super::*;
use super::instance::StoredInstance;

/// One requirement, one handler. Both variants share this contract; the
/// owning instance subscribes/unsubscribes the handler as a service
/// listener using the requirement's effective filter.
pub(crate) trait DependencyHandler: events::ServiceListener {
    fn field(&self) -> &str;

    fn requirement(&self) -> &Requirement;

    /// Synchronous registry scan binding any matching reference not yet
    /// bound; used right after startup and after each unbind.
    fn try_binding(&self) -> Result<()>;

    fn is_valid(&self) -> bool;

    /// Drains and returns every binding currently held, so the owning
    /// instance can run unbind callbacks during teardown.
    fn clear(&self) -> Vec<(ServiceObject, ServiceReference)>;

    fn bound_services(&self) -> Vec<ServiceObject>;

    fn bound_references(&self) -> Vec<ServiceReference>;
}

/// Holds at most one reference; rebinds to the next candidate when the
/// bound service goes away.
pub(crate) struct SimpleDependency {
    instance: Weak<StoredInstance>,
    field: Box<str>,
    requirement: Requirement,
    binding: Mutex<Option<(ServiceObject, ServiceReference)>>,
}

impl SimpleDependency {
    pub fn new(instance: Weak<StoredInstance>, field: Box<str>, requirement: Requirement) -> Self {
        Self {
            instance,
            field,
            requirement,
            binding: Mutex::new(None),
        }
    }

    fn acquire(&self, instance: &Arc<StoredInstance>, reference: &ServiceReference) {
        let service = match instance.bundle_context().get_service(reference) {
            Ok(service) => service,
            Err(e) => {
                warn!("Failed to acquire service #{}: {e}", reference.id());
                return;
            }
        };

        {
            let mut binding = self.binding.lock().trace_expect("Failed to lock mutex");
            if binding.is_some() {
                // Lost a race with a concurrent arrival
                drop(binding);
                let _ = instance.bundle_context().unget_service(reference);
                return;
            }
            *binding = Some((service.clone(), reference.clone()));
        }

        instance.bind(&self.field, service, reference.clone());
    }

    fn on_arrival(&self, instance: &Arc<StoredInstance>, reference: &ServiceReference) {
        if self
            .binding
            .lock()
            .trace_expect("Failed to lock mutex")
            .is_some()
        {
            return;
        }
        self.acquire(instance, reference);
    }

    fn on_departure(&self, instance: &Arc<StoredInstance>, reference: &ServiceReference) {
        let removed = {
            let mut binding = self.binding.lock().trace_expect("Failed to lock mutex");
            match &*binding {
                Some((_, bound)) if bound == reference => binding.take(),
                _ => None,
            }
        };

        if let Some((service, reference)) = removed {
            instance.unbind(&self.field, service, reference);
        }
    }
}

impl events::ServiceListener for SimpleDependency {
    fn service_changed(&self, event: &events::ServiceEvent) -> events::CallbackResult {
        let Some(instance) = self.instance.upgrade() else {
            return Ok(());
        };
        // Never bind to the service our own instance provides
        if instance.owns_reference(&event.reference) {
            return Ok(());
        }

        match event.kind {
            events::ServiceEventKind::Registered | events::ServiceEventKind::Modified => {
                self.on_arrival(&instance, &event.reference)
            }
            events::ServiceEventKind::Unregistering
            | events::ServiceEventKind::ModifiedEndmatch => {
                self.on_departure(&instance, &event.reference)
            }
        }
        Ok(())
    }
}

impl DependencyHandler for SimpleDependency {
    fn field(&self) -> &str {
        &self.field
    }

    fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    fn try_binding(&self) -> Result<()> {
        let Some(instance) = self.instance.upgrade() else {
            return Ok(());
        };

        let filter = self.requirement.effective_filter();
        for reference in instance.bundle_context().find_references(&filter)? {
            if self
                .binding
                .lock()
                .trace_expect("Failed to lock mutex")
                .is_some()
            {
                break;
            }
            if instance.owns_reference(&reference) {
                continue;
            }
            self.acquire(&instance, &reference);
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.requirement.is_optional()
            || self
                .binding
                .lock()
                .trace_expect("Failed to lock mutex")
                .is_some()
    }

    fn clear(&self) -> Vec<(ServiceObject, ServiceReference)> {
        self.binding
            .lock()
            .trace_expect("Failed to lock mutex")
            .take()
            .into_iter()
            .collect()
    }

    fn bound_services(&self) -> Vec<ServiceObject> {
        self.binding
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(service, _)| service.clone())
            .collect()
    }

    fn bound_references(&self) -> Vec<ServiceReference> {
        self.binding
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(_, reference)| reference.clone())
            .collect()
    }
}

/// Holds every matching reference, in registry order of arrival; the
/// instance only invalidates when the list drains empty.
pub(crate) struct AggregateDependency {
    instance: Weak<StoredInstance>,
    field: Box<str>,
    requirement: Requirement,
    bindings: Mutex<Vec<(ServiceObject, ServiceReference)>>,
}

impl AggregateDependency {
    pub fn new(instance: Weak<StoredInstance>, field: Box<str>, requirement: Requirement) -> Self {
        Self {
            instance,
            field,
            requirement,
            bindings: Mutex::new(Vec::new()),
        }
    }

    fn contains(&self, reference: &ServiceReference) -> bool {
        self.bindings
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .any(|(_, bound)| bound == reference)
    }

    /// Returns the acquired pair so try_binding can roll a batch back.
    fn acquire(
        &self,
        instance: &Arc<StoredInstance>,
        reference: &ServiceReference,
    ) -> Result<Option<(ServiceObject, ServiceReference)>> {
        let service = instance
            .bundle_context()
            .get_service(reference)
            .map_err(Error::Framework)?;

        {
            let mut bindings = self.bindings.lock().trace_expect("Failed to lock mutex");
            if bindings.iter().any(|(_, bound)| bound == reference) {
                drop(bindings);
                let _ = instance.bundle_context().unget_service(reference);
                return Ok(None);
            }
            bindings.push((service.clone(), reference.clone()));
        }

        instance.bind(&self.field, service.clone(), reference.clone());
        Ok(Some((service, reference.clone())))
    }

    fn on_arrival(&self, instance: &Arc<StoredInstance>, reference: &ServiceReference) {
        if self.contains(reference) {
            return;
        }
        if let Err(e) = self.acquire(instance, reference) {
            warn!("Failed to acquire service #{}: {e}", reference.id());
        }
    }

    fn on_departure(&self, instance: &Arc<StoredInstance>, reference: &ServiceReference) {
        let removed = {
            let mut bindings = self.bindings.lock().trace_expect("Failed to lock mutex");
            bindings
                .iter()
                .position(|(_, bound)| bound == reference)
                .map(|index| bindings.remove(index))
        };

        if let Some((service, reference)) = removed {
            instance.unbind(&self.field, service, reference);
        }
    }
}

impl events::ServiceListener for AggregateDependency {
    fn service_changed(&self, event: &events::ServiceEvent) -> events::CallbackResult {
        let Some(instance) = self.instance.upgrade() else {
            return Ok(());
        };
        if instance.owns_reference(&event.reference) {
            return Ok(());
        }

        match event.kind {
            events::ServiceEventKind::Registered | events::ServiceEventKind::Modified => {
                self.on_arrival(&instance, &event.reference)
            }
            events::ServiceEventKind::Unregistering
            | events::ServiceEventKind::ModifiedEndmatch => {
                self.on_departure(&instance, &event.reference)
            }
        }
        Ok(())
    }
}

impl DependencyHandler for AggregateDependency {
    fn field(&self) -> &str {
        &self.field
    }

    fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    fn try_binding(&self) -> Result<()> {
        let Some(instance) = self.instance.upgrade() else {
            return Ok(());
        };

        let filter = self.requirement.effective_filter();
        let mut batch = Vec::new();
        for reference in instance.bundle_context().find_references(&filter)? {
            if instance.owns_reference(&reference) || self.contains(&reference) {
                continue;
            }
            match self.acquire(&instance, &reference) {
                Ok(Some(pair)) => batch.push(pair),
                Ok(None) => {}
                Err(e) => {
                    // Unwind the members bound in this batch, then surface
                    // the failure
                    let mut bindings =
                        self.bindings.lock().trace_expect("Failed to lock mutex");
                    bindings.retain(|(_, bound)| {
                        !batch.iter().any(|(_, batched)| batched == bound)
                    });
                    drop(bindings);
                    for (service, reference) in batch {
                        instance.unbind_rollback(&self.field, &service, &reference);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.requirement.is_optional()
            || !self
                .bindings
                .lock()
                .trace_expect("Failed to lock mutex")
                .is_empty()
    }

    fn clear(&self) -> Vec<(ServiceObject, ServiceReference)> {
        std::mem::take(&mut *self.bindings.lock().trace_expect("Failed to lock mutex"))
    }

    fn bound_services(&self) -> Vec<ServiceObject> {
        self.bindings
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(service, _)| service.clone())
            .collect()
    }

    fn bound_references(&self) -> Vec<ServiceReference> {
        self.bindings
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(_, reference)| reference.clone())
            .collect()
    }
}
