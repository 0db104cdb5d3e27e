use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

/// Entry points of a bundle, called around its lifecycle transitions.
///
/// Returning [`framework::Error::StopFramework`] from `start` asks the
/// framework to abort its own startup; any other error rolls the bundle back
/// to `Resolved` and removes whatever the activator managed to register.
pub trait BundleActivator: Send + Sync {
    fn start(&self, context: &BundleContext) -> framework::Result<()>;

    fn stop(&self, context: &BundleContext) -> framework::Result<()>;
}

pub(crate) struct BundleInner {
    pub state: BundleState,
    pub code: loader::CodeUnit,
}

pub(crate) struct BundleData {
    pub id: u64,
    pub location: Box<str>,
    pub framework: Weak<framework::FrameworkInner>,
    pub inner: Mutex<BundleInner>,
}

/// A cheap-clone handle to an installed bundle, resolving through the
/// framework tables. Operations on an uninstalled bundle fail with
/// `InvalidBundle`.
#[derive(Clone)]
pub struct Bundle {
    pub(crate) data: Arc<BundleData>,
}

impl Bundle {
    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn location(&self) -> &str {
        &self.data.location
    }

    pub fn state(&self) -> BundleState {
        self.data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .state
    }

    pub fn symbolic_name(&self) -> Box<str> {
        self.data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .code
            .symbolic_name
            .clone()
    }

    pub fn version(&self) -> Version {
        self.data
            .inner
            .lock()
            .trace_expect("Failed to lock mutex")
            .code
            .version
    }

    /// The context this bundle's code runs against.
    pub fn context(&self) -> BundleContext {
        BundleContext::new(self.clone())
    }

    pub fn start(&self) -> framework::Result<()> {
        self.framework()?.start_bundle(self)
    }

    pub fn stop(&self) -> framework::Result<()> {
        self.framework()?.stop_bundle(self)
    }

    /// Stops the bundle if active, reloads its code and starts it again.
    pub fn update(&self) -> framework::Result<()> {
        self.framework()?.update_bundle(self)
    }

    pub fn uninstall(&self) -> framework::Result<()> {
        self.framework()?.uninstall_bundle(self)
    }

    pub(crate) fn framework(&self) -> framework::Result<Arc<framework::FrameworkInner>> {
        self.data
            .framework
            .upgrade()
            .ok_or(framework::Error::InvalidBundle(self.data.id))
    }

    /// Factory and auto-instance declarations carried by the current code
    /// unit.
    pub(crate) fn declarations(
        &self,
    ) -> (
        Vec<component::FactoryDeclaration>,
        Vec<component::InstanceDeclaration>,
    ) {
        let inner = self.data.inner.lock().trace_expect("Failed to lock mutex");
        (inner.code.factories.clone(), inner.code.instances.clone())
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl Eq for Bundle {}

impl std::hash::Hash for Bundle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.data.id)
            .field("location", &self.data.location)
            .finish()
    }
}
