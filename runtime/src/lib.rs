pub mod bundle;
pub mod component;
pub mod context;
pub mod events;
pub mod filter;
pub mod framework;
pub mod loader;
pub mod properties;
pub mod service;

use std::collections::{BTreeMap, HashMap, HashSet, hash_map};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use trace_err::*;
use tracing::{debug, error, info, warn};

pub use bundle::{Bundle, BundleActivator, BundleState};
pub use context::BundleContext;
pub use framework::Framework;
pub use properties::{Properties, Value, Version};
pub use service::{ServiceObject, ServiceReference, ServiceRegistration};
