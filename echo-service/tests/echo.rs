use gantry_echo_service as echo;
use gantry_runtime::framework::{Config, Framework};
use gantry_runtime::loader::StaticLoader;
use gantry_runtime::service;
use std::sync::Arc;

#[test]
fn echo_service_round_trip() {
    let loader = StaticLoader::new().with("demo://echo", echo::bundle);
    let framework = Framework::new(Config {
        loader: Some(Arc::new(loader)),
        ..Default::default()
    });
    framework.start().unwrap();

    let bundle = framework.install_bundle("demo://echo").unwrap();
    bundle.start().unwrap();

    let context = framework.context();
    let reference = context
        .get_service_reference(Some(echo::ECHO_SPEC), Some("(test=true)"))
        .unwrap()
        .expect("echo service should be registered");
    let object = context.get_service(&reference).unwrap();
    let service = service::typed::<Arc<dyn echo::Echo>>(&object).unwrap();
    assert_eq!(service.echo("hello"), "hello");

    bundle.stop().unwrap();
    assert!(context
        .get_all_service_references(Some(echo::ECHO_SPEC), None)
        .unwrap()
        .is_empty());
}
