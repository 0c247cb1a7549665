//! Package entry: a container grouping files in the queue or collector.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub type PackageId = u64;

/// Whether a package sits in the active queue or the staging collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue,
    Collector,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Destination::Queue => "queue",
            Destination::Collector => "collector",
        }
    }

    /// Numeric wire value used by the event stream and RPC shapes.
    pub fn value(self) -> u8 {
        match self {
            Destination::Queue => 0,
            Destination::Collector => 1,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(Destination::Queue),
            1 => Some(Destination::Collector),
            _ => None,
        }
    }
}

/// One package. Shared as `PackageRef`; created by the store.
pub struct PackageEntry {
    pub id: PackageId,
    name: RwLock<String>,
    folder: RwLock<String>,
    site: RwLock<String>,
    password: RwLock<String>,
    destination: Mutex<Destination>,
    order: AtomicU32,
}

pub type PackageRef = Arc<PackageEntry>;

/// Aggregated progress over a package's files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackageStats {
    pub links_total: usize,
    pub links_done: usize,
    pub size_total: u64,
    pub size_done: u64,
}

impl PackageEntry {
    pub fn new(
        id: PackageId,
        name: impl Into<String>,
        folder: impl Into<String>,
        destination: Destination,
        order: u32,
    ) -> PackageRef {
        Arc::new(PackageEntry {
            id,
            name: RwLock::new(name.into()),
            folder: RwLock::new(folder.into()),
            site: RwLock::new(String::new()),
            password: RwLock::new(String::new()),
            destination: Mutex::new(destination),
            order: AtomicU32::new(order),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write().unwrap() = name.to_string();
    }

    pub fn folder(&self) -> String {
        self.folder.read().unwrap().clone()
    }

    pub fn set_folder(&self, folder: &str) {
        *self.folder.write().unwrap() = folder.to_string();
    }

    pub fn site(&self) -> String {
        self.site.read().unwrap().clone()
    }

    pub fn set_site(&self, site: &str) {
        *self.site.write().unwrap() = site.to_string();
    }

    pub fn password(&self) -> String {
        self.password.read().unwrap().clone()
    }

    pub fn set_password(&self, password: &str) {
        *self.password.write().unwrap() = password.to_string();
    }

    pub fn destination(&self) -> Destination {
        *self.destination.lock().unwrap()
    }

    pub fn set_destination(&self, dest: Destination) {
        *self.destination.lock().unwrap() = dest;
    }

    pub fn order(&self) -> u32 {
        self.order.load(Ordering::Relaxed)
    }

    pub fn set_order(&self, order: u32) {
        self.order.store(order, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PackageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageEntry")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("destination", &self.destination())
            .finish()
    }
}
