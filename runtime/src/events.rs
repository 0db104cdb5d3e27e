use super::*;

/// Outcome of a user listener callback. Errors are logged by the dispatcher
/// and never interrupt delivery to the remaining listeners.
pub type CallbackResult = core::result::Result<(), Box<dyn core::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleEventKind {
    Installed,
    Starting,
    Started,
    Stopping,
    /// Fired between the activator's stop returning and the automatic
    /// release of the bundle's remaining services and consumed edges.
    StoppingPreclean,
    Stopped,
    Updated,
    Uninstalled,
}

#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle: Bundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    Registered,
    Modified,
    Unregistering,
    /// Delivered in place of `Modified` to listeners whose filter matched
    /// the previous properties but no longer matches the current ones.
    ModifiedEndmatch,
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
    /// Pre-update properties, set on `Modified`/`ModifiedEndmatch`.
    pub previous: Option<Properties>,
}

pub trait BundleListener: Send + Sync {
    fn bundle_changed(&self, event: &BundleEvent) -> CallbackResult;
}

pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent) -> CallbackResult;
}

pub trait FrameworkStopListener: Send + Sync {
    fn framework_stopping(&self) -> CallbackResult;
}

/// A service-event hook, registered as a service under
/// [`properties::SERVICE_EVENT_LISTENER_HOOK`] (the payload must downcast to
/// `Arc<dyn EventListenerHook>`).
///
/// Hooks run before normal dispatch and may shrink the per-bundle listener
/// lists to suppress delivery. A hook is never consulted for events about
/// its own registration.
pub trait EventListenerHook: Send + Sync {
    fn event(&self, event: &ServiceEvent, listeners: &mut ShrinkableListeners);
}

/// A would-be receiver of a service event, as shown to hooks.
pub struct ListenerInfo {
    bundle: u64,
    listener: Arc<dyn ServiceListener>,
    filter: Option<filter::Filter>,
}

impl ListenerInfo {
    pub fn bundle_id(&self) -> u64 {
        self.bundle
    }

    pub fn filter(&self) -> Option<&filter::Filter> {
        self.filter.as_ref()
    }
}

/// The per-bundle listener lists for one service event. Hooks can only
/// remove entries, never add.
pub struct ShrinkableListeners {
    map: HashMap<u64, Vec<ListenerInfo>>,
}

impl ShrinkableListeners {
    pub fn bundle_ids(&self) -> Vec<u64> {
        self.map.keys().copied().collect()
    }

    pub fn listeners(&self, bundle: u64) -> &[ListenerInfo] {
        self.map.get(&bundle).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keeps only the listeners of `bundle` for which `keep` returns true.
    pub fn retain(&mut self, bundle: u64, keep: impl FnMut(&ListenerInfo) -> bool) {
        if let Some(listeners) = self.map.get_mut(&bundle) {
            listeners.retain(keep);
        }
    }

    pub fn remove_bundle(&mut self, bundle: u64) {
        self.map.remove(&bundle);
    }
}

struct ServiceListenerEntry {
    bundle: u64,
    listener: Arc<dyn ServiceListener>,
    filter: Option<filter::Filter>,
}

/// Synchronous event delivery with snapshot-before-iterate semantics:
/// listeners may add or remove listeners (or re-enter any framework
/// operation) from inside a callback without corrupting traversal.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    bundle_listeners: Mutex<Vec<(u64, Arc<dyn BundleListener>)>>,
    service_listeners: Mutex<Vec<ServiceListenerEntry>>,
    stop_listeners: Mutex<Vec<(u64, Arc<dyn FrameworkStopListener>)>>,
}

impl EventDispatcher {
    pub fn add_bundle_listener(&self, bundle: u64, listener: Arc<dyn BundleListener>) -> bool {
        let mut listeners = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        if listeners
            .iter()
            .any(|(b, l)| *b == bundle && Arc::ptr_eq(l, &listener))
        {
            return false;
        }
        listeners.push((bundle, listener));
        true
    }

    pub fn remove_bundle_listener(&self, bundle: u64, listener: &Arc<dyn BundleListener>) -> bool {
        let mut listeners = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        let before = listeners.len();
        listeners.retain(|(b, l)| *b != bundle || !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn add_service_listener(
        &self,
        bundle: u64,
        listener: Arc<dyn ServiceListener>,
        filter: Option<filter::Filter>,
    ) -> bool {
        let mut listeners = self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        if listeners
            .iter()
            .any(|e| e.bundle == bundle && Arc::ptr_eq(&e.listener, &listener))
        {
            return false;
        }
        listeners.push(ServiceListenerEntry {
            bundle,
            listener,
            filter,
        });
        true
    }

    pub fn remove_service_listener(
        &self,
        bundle: u64,
        listener: &Arc<dyn ServiceListener>,
    ) -> bool {
        let mut listeners = self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        let before = listeners.len();
        listeners.retain(|e| e.bundle != bundle || !Arc::ptr_eq(&e.listener, listener));
        listeners.len() != before
    }

    pub fn add_stop_listener(&self, bundle: u64, listener: Arc<dyn FrameworkStopListener>) -> bool {
        let mut listeners = self
            .stop_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        if listeners
            .iter()
            .any(|(b, l)| *b == bundle && Arc::ptr_eq(l, &listener))
        {
            return false;
        }
        listeners.push((bundle, listener));
        true
    }

    pub fn remove_stop_listener(
        &self,
        bundle: u64,
        listener: &Arc<dyn FrameworkStopListener>,
    ) -> bool {
        let mut listeners = self
            .stop_listeners
            .lock()
            .trace_expect("Failed to lock mutex");
        let before = listeners.len();
        listeners.retain(|(b, l)| *b != bundle || !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Drops every listener owned by a stopping bundle.
    pub fn clear_bundle(&self, bundle: u64) {
        self.bundle_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .retain(|(b, _)| *b != bundle);
        self.service_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .retain(|e| e.bundle != bundle);
        self.stop_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .retain(|(b, _)| *b != bundle);
    }

    pub fn fire_bundle_event(&self, event: &BundleEvent) {
        metrics::counter!("bundle_events").increment(1);

        let listeners = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(_, l)| l.clone())
            .collect::<Vec<_>>();

        for listener in listeners {
            if let Err(e) = listener.bundle_changed(event) {
                warn!("A bundle listener failed handling {:?}: {e}", event.kind);
            }
        }
    }

    pub fn fire_framework_stopping(&self) {
        let listeners = self
            .stop_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
            .map(|(_, l)| l.clone())
            .collect::<Vec<_>>();

        for listener in listeners {
            if let Err(e) = listener.framework_stopping() {
                warn!("A framework-stop listener failed: {e}");
            }
        }
    }

    pub fn fire_service_event(
        &self,
        event: &ServiceEvent,
        hooks: &[(u64, Arc<dyn EventListenerHook>)],
    ) {
        metrics::counter!("service_events").increment(1);

        let mut map: HashMap<u64, Vec<ListenerInfo>> = HashMap::new();
        for entry in self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock mutex")
            .iter()
        {
            map.entry(entry.bundle).or_default().push(ListenerInfo {
                bundle: entry.bundle,
                listener: entry.listener.clone(),
                filter: entry.filter.clone(),
            });
        }

        let mut shrinkable = ShrinkableListeners { map };
        for (hook_id, hook) in hooks {
            // A hook never sees the event about its own registration
            if *hook_id != event.reference.id() {
                hook.event(event, &mut shrinkable);
            }
        }

        let properties = event.reference.properties();
        for info in shrinkable.map.into_values().flatten() {
            let send = match &info.filter {
                None => event.clone(),
                Some(filter) if filter.matches(&properties) => event.clone(),
                Some(filter) => {
                    let end_match = event.kind == ServiceEventKind::Modified
                        && event
                            .previous
                            .as_ref()
                            .is_some_and(|previous| filter.matches(previous));
                    if !end_match {
                        continue;
                    }
                    ServiceEvent {
                        kind: ServiceEventKind::ModifiedEndmatch,
                        ..event.clone()
                    }
                }
            };

            if let Err(e) = info.listener.service_changed(&send) {
                warn!("A service listener failed handling {:?}: {e}", send.kind);
            }
        }
    }
}
