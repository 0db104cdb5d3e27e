use super::*;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no code unit registered for location '{0}'")]
    UnknownLocation(Box<str>),

    #[error(transparent)]
    Internal(#[from] Box<dyn core::error::Error + Send + Sync>),
}

/// The code artifact behind a bundle: what a [`CodeLoader`] produces for a
/// location string.
///
/// Factory and instance declarations are carried explicitly on the unit;
/// the framework never inspects the code itself.
#[derive(Clone)]
pub struct CodeUnit {
    pub symbolic_name: Box<str>,
    pub version: Version,
    pub activator: Option<Arc<dyn BundleActivator>>,
    pub factories: Vec<component::FactoryDeclaration>,
    pub instances: Vec<component::InstanceDeclaration>,
}

impl CodeUnit {
    pub fn new(symbolic_name: &str, version: Version) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version,
            activator: None,
            factories: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn with_activator(mut self, activator: Arc<dyn BundleActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    pub fn with_factory(mut self, factory: component::FactoryDeclaration) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn with_instance(mut self, instance: component::InstanceDeclaration) -> Self {
        self.instances.push(instance);
        self
    }
}

impl std::fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeUnit")
            .field("symbolic_name", &self.symbolic_name)
            .field("version", &self.version)
            .field("factories", &self.factories)
            .field("instances", &self.instances)
            .finish()
    }
}

/// Resolves bundle locations to executable code.
///
/// The framework defers all code location and resolution to this trait; how
/// code actually gets loaded (static registration, dynamic loading, ...) is
/// the implementer's concern.
pub trait CodeLoader: Send + Sync {
    fn load(&self, location: &str) -> Result<CodeUnit>;

    /// Produces a fresh unit for a bundle update. Defaults to a plain
    /// re-load of the location.
    fn reload(&self, location: &str, previous: &CodeUnit) -> Result<CodeUnit> {
        let _ = previous;
        self.load(location)
    }
}

type UnitFactory = Box<dyn Fn() -> CodeUnit + Send + Sync>;

/// An in-memory [`CodeLoader`] mapping location strings to code-unit
/// constructors, for hosts that link their bundles statically (and for
/// tests).
#[derive(Default)]
pub struct StaticLoader {
    units: RwLock<HashMap<String, UnitFactory>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, location: &str, unit: impl Fn() -> CodeUnit + Send + Sync + 'static) {
        self.units
            .write()
            .trace_expect("Failed to lock mutex")
            .insert(location.to_string(), Box::new(unit));
    }

    pub fn with(self, location: &str, unit: impl Fn() -> CodeUnit + Send + Sync + 'static) -> Self {
        self.add(location, unit);
        self
    }
}

impl CodeLoader for StaticLoader {
    fn load(&self, location: &str) -> Result<CodeUnit> {
        self.units
            .read()
            .trace_expect("Failed to lock mutex")
            .get(location)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownLocation(location.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_loader_lookup() {
        let loader = StaticLoader::new()
            .with("test://a", || CodeUnit::new("a", Version::new(1, 0, 0)));

        let unit = loader.load("test://a").unwrap();
        assert_eq!(&*unit.symbolic_name, "a");
        assert_eq!(unit.version, Version::new(1, 0, 0));

        assert!(matches!(
            loader.load("test://missing"),
            Err(Error::UnknownLocation(_))
        ));
    }
}
