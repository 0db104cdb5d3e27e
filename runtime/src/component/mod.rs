use super::*;
use thiserror::Error;

pub(crate) mod dependency;
pub(crate) mod instance;
pub(crate) mod provided;
mod runtime;

pub use runtime::{ComponentRuntime, RUNTIME_LOCATION, code_unit, runtime};

pub type Result<T> = core::result::Result<T, Error>;

/// Specification under which the component runtime registers itself.
pub const RUNTIME_SPEC: &str = "gantry.component.runtime";

#[derive(Debug, Error)]
pub enum Error {
    #[error("a factory named '{0}' is already registered")]
    DuplicateFactory(Box<str>),

    #[error("a component instance named '{0}' already exists")]
    DuplicateInstance(Box<str>),

    #[error("no factory named '{0}' is registered")]
    UnknownFactory(Box<str>),

    #[error("no component instance named '{0}'")]
    UnknownInstance(Box<str>),

    #[error("component '{0}' is not in a state allowing this operation")]
    InvalidState(Box<str>),

    #[error("the component runtime is not running")]
    NotRunning,

    #[error(transparent)]
    Framework(#[from] framework::Error),

    #[error(transparent)]
    Internal(#[from] Box<dyn core::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Invalid,
    Validating,
    Valid,
    /// The validate callback failed; `retry` moves the instance back to
    /// `Invalid`.
    Erroneous,
    /// Terminal.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEventKind {
    Registered,
    Unregistered,
    Instantiated,
    Validated,
    Invalidated,
    Bound,
    Unbound,
    Killed,
}

#[derive(Debug, Clone)]
pub struct ComponentEvent {
    pub kind: ComponentEventKind,
    pub factory: Box<str>,
    pub instance: Option<Box<str>>,
}

/// Delivered on the calling thread, like every other gantry event.
pub trait ComponentEventListener: Send + Sync {
    fn component_changed(&self, event: &ComponentEvent) -> events::CallbackResult;
}

/// A declarative statement that a component needs services exposing all of
/// the given specifications, optionally narrowed by an LDAP sub-filter.
#[derive(Debug, Clone)]
pub struct Requirement {
    specs: Vec<Box<str>>,
    aggregate: bool,
    optional: bool,
    filter: Option<filter::Filter>,
}

impl Requirement {
    pub fn new<'a>(specs: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            specs: specs.into_iter().map(Into::into).collect(),
            aggregate: false,
            optional: false,
            filter: None,
        }
    }

    /// Collect every matching service instead of picking one.
    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    /// The owning component stays valid without a binding.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_filter(mut self, filter: filter::Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn specs(&self) -> &[Box<str>] {
        &self.specs
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn filter(&self) -> Option<&filter::Filter> {
        self.filter.as_ref()
    }

    /// The filter actually sent to the registry:
    /// `(objectClass=spec) ∧ ... ∧ sub-filter`.
    pub(crate) fn effective_filter(&self) -> filter::Filter {
        filter::Filter::and(
            self.specs
                .iter()
                .map(|spec| filter::Filter::eq(properties::OBJECT_CLASS, spec))
                .chain(self.filter.clone()),
        )
        // A requirement without specifications or sub-filter matches any
        // registered service
        .unwrap_or_else(|| filter::Filter::present(properties::OBJECT_CLASS))
    }
}

/// The callback table of a managed component.
///
/// Bind and unbind are infallible notifications; a failing `on_validate`
/// moves the instance to `Erroneous` (or kills it when the error is
/// [`framework::Error::StopFramework`]).
pub trait Component: Send + Sync + 'static {
    /// Identity upcast of the component into a registrable service payload,
    /// typically `Arc::new(self as Arc<dyn MyTrait>)`.
    fn as_service(self: Arc<Self>) -> ServiceObject;

    /// Called once, right after construction; components that want to read
    /// or write their properties later keep a clone of the accessor.
    fn on_instantiate(&self, context: &Arc<ComponentContext>) {
        let _ = context;
    }

    fn on_validate(&self, context: &ComponentContext) -> Result<()> {
        let _ = context;
        Ok(())
    }

    fn on_invalidate(&self, context: &ComponentContext) -> Result<()> {
        let _ = context;
        Ok(())
    }

    fn on_bind(
        &self,
        context: &ComponentContext,
        field: &str,
        service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        let _ = (context, field, service, reference);
    }

    fn on_unbind(
        &self,
        context: &ComponentContext,
        field: &str,
        service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        let _ = (context, field, service, reference);
    }
}

pub use instance::ComponentContext;

type Constructor = Box<dyn Fn() -> Arc<dyn Component> + Send + Sync>;

struct FactoryInner {
    name: Box<str>,
    // each entry is one provided service, under one or more interfaces
    provides: Vec<Vec<Box<str>>>,
    requires: Vec<(Box<str>, Requirement)>,
    // defaults; the keys are the factory's declared properties
    properties: Properties,
    constructor: Constructor,
}

/// What a bundle declares for each of its component factories; built with
/// [`FactoryDeclaration::builder`] and carried on the bundle's
/// [`CodeUnit`](loader::CodeUnit).
#[derive(Clone)]
pub struct FactoryDeclaration {
    inner: Arc<FactoryInner>,
}

impl FactoryDeclaration {
    pub fn builder(
        name: &str,
        constructor: impl Fn() -> Arc<dyn Component> + Send + Sync + 'static,
    ) -> FactoryBuilder {
        FactoryBuilder {
            inner: FactoryInner {
                name: name.into(),
                provides: Vec::new(),
                requires: Vec::new(),
                properties: Properties::new(),
                constructor: Box::new(constructor),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn provides(&self) -> &[Vec<Box<str>>] {
        &self.inner.provides
    }

    pub fn requires(&self) -> &[(Box<str>, Requirement)] {
        &self.inner.requires
    }

    pub fn default_properties(&self) -> &Properties {
        &self.inner.properties
    }

    pub(crate) fn construct(&self) -> Arc<dyn Component> {
        (self.inner.constructor)()
    }
}

impl std::fmt::Debug for FactoryDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryDeclaration")
            .field("name", &self.inner.name)
            .field("provides", &self.inner.provides)
            .field("requires", &self.inner.requires)
            .field("properties", &self.inner.properties)
            .finish()
    }
}

pub struct FactoryBuilder {
    inner: FactoryInner,
}

impl FactoryBuilder {
    /// Declares one provided service published under the given interfaces.
    /// May be called several times for factories providing several logical
    /// services.
    pub fn provides<'a>(mut self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        self.inner
            .provides
            .push(specs.into_iter().map(Into::into).collect());
        self
    }

    pub fn requires(mut self, field: &str, requirement: Requirement) -> Self {
        self.inner.requires.push((field.into(), requirement));
        self
    }

    /// Declares a component property with its default value.
    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inner.properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> FactoryDeclaration {
        FactoryDeclaration {
            inner: Arc::new(self.inner),
        }
    }
}

/// An auto-instance declared inline by a bundle: instantiated right after
/// its factory is registered.
#[derive(Debug, Clone)]
pub struct InstanceDeclaration {
    pub factory: Box<str>,
    pub name: Box<str>,
    pub properties: Properties,
}

impl InstanceDeclaration {
    pub fn new(factory: &str, name: &str) -> Self {
        Self {
            factory: factory.into(),
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DependencyDetails {
    pub field: Box<str>,
    pub requirement: Requirement,
    /// Ids of the currently bound services.
    pub bound: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct InstanceDetails {
    pub name: Box<str>,
    pub factory: Box<str>,
    pub state: ComponentState,
    pub properties: Properties,
    pub dependencies: Vec<DependencyDetails>,
}

#[derive(Debug, Clone)]
pub struct FactoryDetails {
    pub name: Box<str>,
    pub bundle: u64,
    pub provides: Vec<Vec<Box<str>>>,
    pub requires: Vec<(Box<str>, Requirement)>,
    pub properties: Properties,
}
