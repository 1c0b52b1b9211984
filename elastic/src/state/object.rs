use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
};

use log::{debug, info};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Serialize, de::DeserializeOwned};

use super::{HostUpdate, HostUpdates, State};
use crate::{Result, StateErr, collective::Context};

type Getter = Box<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;
type Setter = Box<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

pub type ResetCallback = Box<dyn FnMut() -> Result<()> + Send>;

/// A named plain-data value tracked by a state through a getter and a setter.
///
/// Values are kept encoded with `bincode`, which restores every value bit for
/// bit, non-finite floats included.
pub struct Attribute {
    name: String,
    get: Getter,
    set: Setter,
}

impl Attribute {
    /// Creates a new `Attribute`.
    ///
    /// # Arguments
    /// * `name` - Unique name of the attribute within its state.
    /// * `get` - Reads the live value.
    /// * `set` - Overwrites the live value.
    ///
    /// # Returns
    /// A new `Attribute` instance.
    pub fn new<T, G, S>(name: impl Into<String>, get: G, set: S) -> Self
    where
        T: Serialize + DeserializeOwned,
        G: Fn() -> Result<T> + Send + Sync + 'static,
        S: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            get: Box::new(move || -> Result<Vec<u8>> { Ok(bincode::serialize(&get()?)?) }),
            set: Box::new(move |bytes: &[u8]| set(bincode::deserialize(bytes)?)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A shared cell holding a plain-data value the training loop mutates and a state tracks.
#[derive(Debug, Default)]
pub struct Tracked<T>(Arc<RwLock<T>>);

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }

    pub fn set(&self, value: T) {
        *self.0.write() = value;
    }
}

impl<T: Clone> Tracked<T> {
    pub fn get(&self) -> T {
        self.0.read().clone()
    }
}

impl<T> Tracked<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// An attribute reading and writing this cell under `name`.
    pub fn attribute(&self, name: impl Into<String>) -> Attribute {
        let reader = self.clone();
        let writer = self.clone();

        Attribute {
            name: name.into(),
            get: Box::new(move || -> Result<Vec<u8>> {
                Ok(bincode::serialize(&*reader.read())?)
            }),
            set: Box::new(move |bytes: &[u8]| -> Result<()> {
                writer.set(bincode::deserialize(bytes)?);
                Ok(())
            }),
        }
    }
}

/// The shared base of every state: replicates plain-data attributes and tracks
/// membership changes.
///
/// Also usable on its own as a `State` holding only attributes.
pub struct ObjectState {
    ctx: Arc<Context>,
    attrs: Vec<Attribute>,
    saved: BTreeMap<String, Vec<u8>>,
    host_updates: HostUpdates,
    last_updated_timestamp: u64,
    reset_callbacks: Vec<ResetCallback>,
}

impl ObjectState {
    /// Creates a new `ObjectState` and captures the attributes' current values.
    ///
    /// # Errors
    /// `StateErr::DuplicateAttribute` if two attributes share a name, or any
    /// error raised by a getter.
    pub fn new(ctx: Arc<Context>, attrs: Vec<Attribute>) -> Result<Self> {
        let mut names = HashSet::with_capacity(attrs.len());
        if let Some(dup) = attrs.iter().find(|attr| !names.insert(attr.name())) {
            return Err(StateErr::DuplicateAttribute(dup.name.clone()));
        }

        let mut state = Self {
            ctx,
            attrs,
            saved: BTreeMap::new(),
            host_updates: HostUpdates::default(),
            last_updated_timestamp: 0,
            reset_callbacks: Vec::new(),
        };

        state.save_attrs()?;
        Ok(state)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Decodes the last committed value of the attribute `name`.
    pub fn saved<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.saved.get(name) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Captures every attribute's live value.
    pub fn save_attrs(&mut self) -> Result<()> {
        let mut saved = BTreeMap::new();
        for attr in &self.attrs {
            saved.insert(attr.name.clone(), (attr.get)()?);
        }

        self.saved = saved;
        Ok(())
    }

    /// Writes every saved value back into its attribute.
    pub fn restore_attrs(&mut self) -> Result<()> {
        for attr in &self.attrs {
            if let Some(value) = self.saved.get(&attr.name) {
                (attr.set)(value.as_slice())?;
            }
        }

        Ok(())
    }

    /// Replaces the saved values with rank 0's and writes them into the attributes.
    ///
    /// Collective unless no attribute is tracked.
    pub fn sync_attrs(&mut self) -> Result<()> {
        if self.attrs.is_empty() {
            return Ok(());
        }

        debug!(rank = self.ctx.rank(), attrs = self.attrs.len(); "syncing attributes");
        self.saved = self.ctx.broadcast_object(&self.saved)?;
        self.restore_attrs()
    }

    /// A handle to push host change notifications into.
    pub fn host_updates(&self) -> HostUpdates {
        self.host_updates.clone()
    }

    pub fn on_hosts_updated(&self, timestamp: u64, update: HostUpdate) {
        self.host_updates.push(timestamp, update);
    }

    /// Agrees with every rank on whether hosts changed since the last check.
    ///
    /// # Errors
    /// `StateErr::HostsUpdated` on every rank at once if rank 0 saw a newer
    /// notification; `skip_sync` is set when hosts were only removed.
    pub fn check_host_updates(&mut self) -> Result<()> {
        let prev = self.last_updated_timestamp;
        let (last, all) = self.host_updates.drain_newer(prev);

        let (prev, last, all): (u64, u64, HostUpdate) =
            self.ctx.broadcast_object(&(prev, last, all))?;
        self.last_updated_timestamp = last;

        if last > prev {
            info!(timestamp = last; "hosts updated: {all:?}");
            return Err(StateErr::HostsUpdated {
                skip_sync: all == HostUpdate::REMOVED,
            });
        }

        Ok(())
    }

    /// Adds callbacks run, in order, every time the state is reset.
    pub fn register_reset_callbacks<I>(&mut self, callbacks: I)
    where
        I: IntoIterator<Item = ResetCallback>,
    {
        self.reset_callbacks.extend(callbacks);
    }

    pub(super) fn run_reset_callbacks(&mut self) -> Result<()> {
        for callback in &mut self.reset_callbacks {
            callback()?;
        }

        Ok(())
    }
}

impl fmt::Debug for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectState")
            .field("attrs", &self.attrs)
            .field("saved", &self.saved.keys().collect::<Vec<_>>())
            .field("last_updated_timestamp", &self.last_updated_timestamp)
            .finish_non_exhaustive()
    }
}

impl State for ObjectState {
    fn save(&mut self) -> Result<()> {
        self.save_attrs()
    }

    fn restore(&mut self) -> Result<()> {
        self.restore_attrs()
    }

    fn sync(&mut self) -> Result<()> {
        self.sync_attrs()
    }

    fn base(&self) -> &ObjectState {
        self
    }

    fn base_mut(&mut self) -> &mut ObjectState {
        self
    }
}
