use gantry_runtime::bundle::BundleActivator;
use gantry_runtime::component::{
    Component, ComponentContext, FactoryDeclaration, Requirement,
};
use gantry_runtime::filter::Filter;
use gantry_runtime::loader::CodeUnit;
use gantry_runtime::properties::Properties;
use gantry_runtime::service::{self, ServiceObject, ServiceReference};
use gantry_runtime::{BundleContext, Version, framework};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};
use trace_err::*;

/// Specification the echo services are published under.
pub const ECHO_SPEC: &str = "gantry.demo.echo";

pub trait Echo: Send + Sync {
    fn echo(&self, message: &str) -> String;
}

/// Plain singleton implementation, registered by [`EchoActivator`].
#[derive(Default)]
pub struct EchoService;

impl Echo for EchoService {
    fn echo(&self, message: &str) -> String {
        message.to_string()
    }
}

/// Activator registering an [`EchoService`] with `{"test": true}`.
#[derive(Default)]
pub struct EchoActivator;

impl BundleActivator for EchoActivator {
    fn start(&self, context: &BundleContext) -> framework::Result<()> {
        let service: Arc<dyn Echo> = Arc::new(EchoService);
        let mut properties = Properties::new();
        properties.insert("test".into(), true.into());
        context.register_service(&[ECHO_SPEC], service::object(service), properties)?;
        info!("Echo service registered");
        Ok(())
    }

    fn stop(&self, _context: &BundleContext) -> framework::Result<()> {
        // The framework reclaims the registration
        debug!("Echo bundle stopping");
        Ok(())
    }
}

/// The echo bundle: mount on the host's loader and install like any other
/// location.
pub fn bundle() -> CodeUnit {
    CodeUnit::new("gantry-echo", Version::new(0, 1, 0)).with_activator(Arc::new(EchoActivator))
}

/// A managed component providing [`Echo`] behind a `usable` property. The
/// property is declared, so flipping it through the accessor pushes a
/// `Modified` event to every consumer filtering on it.
pub struct EchoComponent {
    context: OnceLock<Arc<ComponentContext>>,
}

impl EchoComponent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            context: OnceLock::new(),
        })
    }
}

impl Echo for EchoComponent {
    fn echo(&self, message: &str) -> String {
        let prefix = self
            .context
            .get()
            .and_then(|context| context.property("prefix"))
            .map(|value| value.to_string())
            .unwrap_or_default();
        format!("{prefix}{message}")
    }
}

impl Component for EchoComponent {
    fn as_service(self: Arc<Self>) -> ServiceObject {
        service::object(self as Arc<dyn Echo>)
    }

    fn on_instantiate(&self, context: &Arc<ComponentContext>) {
        let _ = self.context.set(context.clone());
    }
}

pub const ECHO_FACTORY: &str = "echo-component-factory";

pub fn echo_factory() -> FactoryDeclaration {
    FactoryDeclaration::builder(ECHO_FACTORY, || EchoComponent::new())
        .provides([ECHO_SPEC])
        .property("usable", true)
        .property("prefix", "")
        .build()
}

/// A component tracking usable [`Echo`] services: a simple requirement
/// filtered on `(usable=true)`, with the bind/unbind history kept for
/// inspection.
#[derive(Default)]
pub struct EchoTracker {
    history: Mutex<Vec<String>>,
}

impl EchoTracker {
    pub fn history(&self) -> Vec<String> {
        self.history.lock().trace_expect("Failed to lock mutex").clone()
    }
}

impl Component for EchoTracker {
    fn as_service(self: Arc<Self>) -> ServiceObject {
        service::object(self)
    }

    fn on_bind(
        &self,
        _context: &ComponentContext,
        field: &str,
        _service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        self.history
            .lock()
            .trace_expect("Failed to lock mutex")
            .push(format!("bind {field} #{}", reference.id()));
    }

    fn on_unbind(
        &self,
        _context: &ComponentContext,
        field: &str,
        _service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        self.history
            .lock()
            .trace_expect("Failed to lock mutex")
            .push(format!("unbind {field} #{}", reference.id()));
    }
}

pub const TRACKER_FACTORY: &str = "echo-tracker-factory";

pub fn tracker_factory() -> FactoryDeclaration {
    FactoryDeclaration::builder(TRACKER_FACTORY, || Arc::new(EchoTracker::default()))
        .requires(
            "echo",
            Requirement::new([ECHO_SPEC]).with_filter(Filter::eq("usable", "true")),
        )
        .build()
}

/// A component both providing [`Echo`] and optionally consuming every other
/// one; exercises the self-binding avoidance of the dependency handlers.
pub struct EchoRelay {
    context: OnceLock<Arc<ComponentContext>>,
}

impl EchoRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            context: OnceLock::new(),
        })
    }
}

impl Echo for EchoRelay {
    fn echo(&self, message: &str) -> String {
        let upstream = self
            .context
            .get()
            .map(|context| context.services("upstream"))
            .unwrap_or_default();
        for service in upstream {
            if let Some(echo) = service::typed::<Arc<dyn Echo>>(&service) {
                return echo.echo(message);
            }
        }
        message.to_string()
    }
}

impl Component for EchoRelay {
    fn as_service(self: Arc<Self>) -> ServiceObject {
        service::object(self as Arc<dyn Echo>)
    }

    fn on_instantiate(&self, context: &Arc<ComponentContext>) {
        let _ = self.context.set(context.clone());
    }
}

pub const RELAY_FACTORY: &str = "echo-relay-factory";

pub fn relay_factory() -> FactoryDeclaration {
    FactoryDeclaration::builder(RELAY_FACTORY, || EchoRelay::new())
        .provides([ECHO_SPEC])
        .requires(
            "upstream",
            Requirement::new([ECHO_SPEC]).aggregate().optional(),
        )
        .build()
}

/// The demo component bundle: the echo, tracker and relay factories under
/// one unit.
pub fn component_bundle() -> CodeUnit {
    CodeUnit::new("gantry-echo-components", Version::new(0, 1, 0))
        .with_factory(echo_factory())
        .with_factory(tracker_factory())
        .with_factory(relay_factory())
}
