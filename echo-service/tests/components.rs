use gantry_echo_service as echo;
use gantry_runtime::component::{
    self, Component, ComponentContext, ComponentEvent, ComponentEventKind,
    ComponentEventListener, ComponentRuntime, ComponentState, FactoryDeclaration,
    InstanceDeclaration,
};
use gantry_runtime::events;
use gantry_runtime::framework::{Config, Framework};
use gantry_runtime::loader::{CodeUnit, StaticLoader};
use gantry_runtime::properties::Properties;
use gantry_runtime::service::{self, ServiceObject};
use gantry_runtime::{BundleState, Version};
use std::sync::{Arc, Mutex};

fn demo_loader() -> StaticLoader {
    StaticLoader::new()
        .with(component::RUNTIME_LOCATION, component::code_unit)
        .with("demo://echo", echo::bundle)
        .with("demo://components", echo::component_bundle)
}

fn start_framework(loader: StaticLoader) -> (Framework, ComponentRuntime) {
    let framework = Framework::new(Config {
        loader: Some(Arc::new(loader)),
        ..Default::default()
    });
    framework.start().unwrap();
    framework
        .install_bundle(component::RUNTIME_LOCATION)
        .unwrap()
        .start()
        .unwrap();
    let runtime = component::runtime(&framework.context()).unwrap().unwrap();
    (framework, runtime)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(ComponentEventKind, String)>>,
}

impl Recorder {
    fn for_instance(&self, name: &str) -> Vec<ComponentEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, instance)| instance == name)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

impl ComponentEventListener for Recorder {
    fn component_changed(&self, event: &ComponentEvent) -> events::CallbackResult {
        self.events.lock().unwrap().push((
            event.kind,
            event
                .instance
                .clone()
                .map(String::from)
                .unwrap_or_default(),
        ));
        Ok(())
    }
}

#[test]
fn dependency_rebinding_through_property_reflection() {
    let (framework, runtime) = start_framework(demo_loader());
    framework
        .install_bundle("demo://components")
        .unwrap()
        .start()
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    assert!(runtime.add_listener(recorder.clone()));
    assert!(!runtime.add_listener(recorder.clone()));

    runtime
        .instantiate(echo::ECHO_FACTORY, "echo-a", Properties::new())
        .unwrap();
    runtime
        .instantiate(echo::TRACKER_FACTORY, "tracker-b", Properties::new())
        .unwrap();

    use ComponentEventKind::*;
    assert_eq!(recorder.for_instance("echo-a"), vec![Instantiated, Validated]);
    assert_eq!(
        recorder.for_instance("tracker-b"),
        vec![Instantiated, Bound, Validated]
    );

    // Flip the declared property through the reflection accessor: the
    // provided service emits MODIFIED_ENDMATCH and the tracker unbinds
    let accessor = runtime.instance_context("echo-a").unwrap();
    accessor.set_property("usable", false);
    assert_eq!(
        recorder.for_instance("tracker-b"),
        vec![Instantiated, Bound, Validated, Invalidated, Unbound]
    );
    assert_eq!(
        runtime.instance_details("tracker-b").unwrap().state,
        ComponentState::Invalid
    );

    accessor.set_property("usable", true);
    assert_eq!(
        recorder.for_instance("tracker-b"),
        vec![Instantiated, Bound, Validated, Invalidated, Unbound, Bound, Validated]
    );

    let details = runtime.instance_details("tracker-b").unwrap();
    assert_eq!(details.state, ComponentState::Valid);
    assert_eq!(details.dependencies.len(), 1);
    assert_eq!(details.dependencies[0].bound.len(), 1);

    // The provided service is a live Echo, and reads its declared
    // properties through the same accessor
    let context = framework.context();
    let reference = context
        .get_service_reference(Some(echo::ECHO_SPEC), None)
        .unwrap()
        .unwrap();
    let object = context.get_service(&reference).unwrap();
    let echo_service = service::typed::<Arc<dyn echo::Echo>>(&object).unwrap();
    assert_eq!(echo_service.echo("hello"), "hello");
    accessor.set_property("prefix", "> ");
    assert_eq!(echo_service.echo("hello"), "> hello");
}

#[test]
fn component_does_not_bind_to_itself() {
    let (framework, runtime) = start_framework(demo_loader());
    framework
        .install_bundle("demo://components")
        .unwrap()
        .start()
        .unwrap();

    runtime
        .instantiate(echo::RELAY_FACTORY, "relay", Properties::new())
        .unwrap();

    // The relay provides and requires the same specification but must not
    // bind its own service
    let details = runtime.instance_details("relay").unwrap();
    assert_eq!(details.state, ComponentState::Valid);
    assert!(details.dependencies[0].bound.is_empty());

    runtime
        .instantiate(echo::ECHO_FACTORY, "echo-a", Properties::new())
        .unwrap();
    let details = runtime.instance_details("relay").unwrap();
    assert_eq!(details.dependencies[0].bound.len(), 1);
}

struct Flaky;

impl Component for Flaky {
    fn as_service(self: Arc<Self>) -> ServiceObject {
        service::object(self)
    }

    fn on_validate(&self, context: &ComponentContext) -> component::Result<()> {
        if context.property("ok") == Some(true.into()) {
            Ok(())
        } else {
            Err(component::Error::Internal("not ok".into()))
        }
    }
}

fn flaky_factory() -> FactoryDeclaration {
    FactoryDeclaration::builder("flaky-factory", || Arc::new(Flaky))
        .property("ok", false)
        .build()
}

#[test]
fn erroneous_component_retries() {
    let loader = StaticLoader::new()
        .with(component::RUNTIME_LOCATION, component::code_unit)
        .with("demo://flaky", || {
            CodeUnit::new("flaky-bundle", Version::default()).with_factory(flaky_factory())
        });
    let (framework, runtime) = start_framework(loader);
    framework
        .install_bundle("demo://flaky")
        .unwrap()
        .start()
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    runtime.add_listener(recorder.clone());

    runtime
        .instantiate("flaky-factory", "flaky-1", Properties::new())
        .unwrap();

    use ComponentEventKind::*;
    assert_eq!(
        runtime.instance_details("flaky-1").unwrap().state,
        ComponentState::Erroneous
    );
    assert_eq!(recorder.for_instance("flaky-1"), vec![Instantiated, Invalidated]);

    // Retry from ERRONEOUS goes back through INVALID and validates
    let mut ok = Properties::new();
    ok.insert("ok".into(), true.into());
    runtime.retry("flaky-1", ok).unwrap();
    assert_eq!(
        runtime.instance_details("flaky-1").unwrap().state,
        ComponentState::Valid
    );
    assert_eq!(
        recorder.for_instance("flaky-1"),
        vec![Instantiated, Invalidated, Validated]
    );

    // Retry only applies to erroneous components
    assert!(matches!(
        runtime.retry("flaky-1", Properties::new()),
        Err(component::Error::InvalidState(_))
    ));

    // Manual invalidation sticks until the next binding change or retry
    runtime.invalidate("flaky-1").unwrap();
    assert_eq!(
        runtime.instance_details("flaky-1").unwrap().state,
        ComponentState::Invalid
    );
}

#[test]
fn waiting_components_materialize_when_factory_arrives() {
    let (framework, runtime) = start_framework(demo_loader());

    runtime
        .instantiate(echo::ECHO_FACTORY, "early", Properties::new())
        .unwrap();
    assert!(!runtime.is_registered_instance("early"));
    assert_eq!(runtime.waiting_components().len(), 1);

    // A second component under the same name is still a duplicate
    assert!(matches!(
        runtime.instantiate(echo::ECHO_FACTORY, "early", Properties::new()),
        Err(component::Error::DuplicateInstance(_))
    ));

    framework
        .install_bundle("demo://components")
        .unwrap()
        .start()
        .unwrap();

    assert!(runtime.is_registered_instance("early"));
    assert!(runtime.waiting_components().is_empty());
    assert_eq!(
        runtime.instance_details("early").unwrap().state,
        ComponentState::Valid
    );
}

#[test]
fn stopping_bundle_kills_its_components() {
    let (framework, runtime) = start_framework(demo_loader());
    let components = framework.install_bundle("demo://components").unwrap();
    components.start().unwrap();

    let recorder = Arc::new(Recorder::default());
    runtime.add_listener(recorder.clone());

    runtime
        .instantiate(echo::ECHO_FACTORY, "echo-a", Properties::new())
        .unwrap();
    runtime
        .instantiate(echo::TRACKER_FACTORY, "tracker-b", Properties::new())
        .unwrap();
    assert!(runtime.is_registered_factory(echo::ECHO_FACTORY));

    components.stop().unwrap();
    assert_eq!(components.state(), BundleState::Resolved);

    assert!(!runtime.is_registered_factory(echo::ECHO_FACTORY));
    assert!(!runtime.is_registered_instance("echo-a"));
    assert!(!runtime.is_registered_instance("tracker-b"));
    assert!(recorder
        .for_instance("echo-a")
        .contains(&ComponentEventKind::Killed));
    assert!(framework
        .context()
        .get_all_service_references(Some(echo::ECHO_SPEC), None)
        .unwrap()
        .is_empty());
}

#[test]
fn auto_instances_from_bundle_declarations() {
    let loader = StaticLoader::new()
        .with(component::RUNTIME_LOCATION, component::code_unit)
        .with("demo://auto", || {
            CodeUnit::new("auto-bundle", Version::default())
                .with_factory(echo::echo_factory())
                .with_instance(
                    InstanceDeclaration::new(echo::ECHO_FACTORY, "auto-echo")
                        .with_property("prefix", "auto: "),
                )
        });
    let (framework, runtime) = start_framework(loader);
    framework
        .install_bundle("demo://auto")
        .unwrap()
        .start()
        .unwrap();

    assert!(runtime.is_registered_instance("auto-echo"));
    assert_eq!(
        runtime.instance_details("auto-echo").unwrap().state,
        ComponentState::Valid
    );

    let context = framework.context();
    let reference = context
        .get_service_reference(Some(echo::ECHO_SPEC), None)
        .unwrap()
        .unwrap();
    let object = context.get_service(&reference).unwrap();
    let echo_service = service::typed::<Arc<dyn echo::Echo>>(&object).unwrap();
    assert_eq!(echo_service.echo("x"), "auto: x");
}

#[test]
fn factory_store_api() {
    let (framework, runtime) = start_framework(demo_loader());
    let components = framework.install_bundle("demo://components").unwrap();
    components.start().unwrap();

    let factories = runtime.factories();
    assert!(factories.iter().any(|f| &**f == echo::ECHO_FACTORY));

    let details = runtime.factory_details(echo::ECHO_FACTORY).unwrap();
    assert_eq!(details.bundle, components.id());
    assert_eq!(details.provides.len(), 1);
    assert!(details.properties.contains_key("usable"));

    // Duplicate factory names are rejected
    assert!(matches!(
        runtime.register_factory(&components.context(), echo::echo_factory()),
        Err(component::Error::DuplicateFactory(_))
    ));
    assert!(matches!(
        runtime.factory_details("no-such-factory"),
        Err(component::Error::UnknownFactory(_))
    ));

    runtime
        .instantiate(echo::ECHO_FACTORY, "echo-a", Properties::new())
        .unwrap();
    let instances = runtime.instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(&*instances[0].0, "echo-a");
    assert_eq!(&*instances[0].1, echo::ECHO_FACTORY);
    assert_eq!(instances[0].2, ComponentState::Valid);

    runtime.kill("echo-a").unwrap();
    assert!(runtime.instances().is_empty());
    assert!(matches!(
        runtime.kill("echo-a"),
        Err(component::Error::UnknownInstance(_))
    ));
}

#[test]
fn framework_stop_reclaims_everything() {
    let (framework, runtime) = start_framework(demo_loader());
    framework
        .install_bundle("demo://components")
        .unwrap()
        .start()
        .unwrap();
    runtime
        .instantiate(echo::ECHO_FACTORY, "echo-a", Properties::new())
        .unwrap();

    framework.stop().unwrap();
    assert_eq!(framework.state(), BundleState::Resolved);
    assert!(framework.wait_for_stop(None));
    assert!(!runtime.is_registered_instance("echo-a"));
}
