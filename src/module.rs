//! Pluggable modules (spec §4.5): named groups of reactons with an
//! install/uninstall lifecycle, installed and disposed in a well-defined
//! order.
//!
//! Grounded on the teacher's `Database` extension-trait pattern (typed,
//! downcast-free access to per-database state via a registered key) and
//! on `pcastone-orca`'s plugin registry (retrieved reference example of
//! an `IndexMap<TypeId, _>` used so uninstall order is reverse-install
//! order, not hash order). The `install`/`on_init`/`on_dispose` lifecycle
//! itself follows the same shape as the teacher's `Extension` trait,
//! generalized from a single setup hook to the three-phase
//! install/init/dispose sequence spec §4.5 requires.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::value::AnyRef;

/// A named group of reactons installed against a store as a unit (spec
/// §4.5). `install` registers every node the module owns; `on_init` runs
/// once immediately afterward; `on_dispose` runs just before uninstall
/// removes those nodes.
///
/// Methods take `&self`, matching the store's own `&self`-only API — a
/// module that needs interior mutability should hold it in a `Mutex` or
/// `Cell` itself, the same way the store does.
pub trait Module: Send + Sync + 'static {
    /// Registers every reacton this module owns against `store` and
    /// returns them, so `uninstall` can remove them later. Called once,
    /// before `on_init`.
    fn install(&self, store: &Store) -> CoreResult<Vec<AnyRef>>;

    /// Runs once, immediately after `install` registers this module's
    /// reactons.
    fn on_init(&self, _store: &Store) {}

    /// Runs just before `uninstall` removes this module's reactons —
    /// either from an explicit `uninstall_module::<T>()` call or from
    /// `Store::dispose`.
    fn on_dispose(&self, _store: &Store) {}
}

pub(crate) struct ModuleEntry {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    refs: Vec<AnyRef>,
    is_initialized: bool,
    dispose: Arc<dyn Fn(&Store) + Send + Sync>,
}

impl Store {
    /// Installs `value` as a module, failing with `ModuleAlreadyInstalled`
    /// if one of the same type is already installed (spec §4.5).
    ///
    /// `install` is called before the store is locked for bookkeeping, so
    /// it is free to call back into `source`/`computed`/other store
    /// methods that take the lock themselves.
    pub fn install_module<T: Module>(&self, value: T) -> CoreResult<()> {
        let key = TypeId::of::<T>();
        if self.lock().modules.contains_key(&key) {
            return Err(CoreError::ModuleAlreadyInstalled);
        }

        let value = Arc::new(value);
        let refs = value.install(self)?;
        value.on_init(self);

        let dispose_value = value.clone();
        let dispose: Arc<dyn Fn(&Store) + Send + Sync> = Arc::new(move |store: &Store| {
            dispose_value.on_dispose(store);
        });

        let mut inner = self.lock();
        if inner.modules.contains_key(&key) {
            // Lost a race installing the same type concurrently; undo our
            // own registration and report the conflict.
            drop(inner);
            for r in refs {
                self.remove_id(r.id());
            }
            return Err(CoreError::ModuleAlreadyInstalled);
        }
        inner.modules.insert(
            key,
            ModuleEntry {
                value,
                type_name: std::any::type_name::<T>(),
                refs,
                is_initialized: true,
                dispose,
            },
        );
        Ok(())
    }

    /// Uninstalls the module of type `T`: runs its `on_dispose` hook, then
    /// removes every ref it registered and clears their cached values
    /// (spec §4.5).
    pub fn uninstall_module<T: Module>(&self) -> CoreResult<()> {
        let key = TypeId::of::<T>();
        let entry = self
            .lock()
            .modules
            .shift_remove(&key)
            .ok_or(CoreError::ModuleNotInstalled)?;
        (entry.dispose)(self);
        for r in entry.refs {
            self.remove_id(r.id());
        }
        Ok(())
    }

    /// Whether a module of type `T` is currently installed.
    pub fn has_module<T: Module>(&self) -> bool {
        self.lock().modules.contains_key(&TypeId::of::<T>())
    }

    /// Retrieves the installed module of type `T`, if any.
    pub fn module<T: Module>(&self) -> Option<Arc<T>> {
        let inner = self.lock();
        let entry = inner.modules.get(&TypeId::of::<T>())?;
        entry.value.clone().downcast::<T>().ok()
    }

    /// Whether the module of type `T` has completed `on_init` (spec §4.5:
    /// `isInitialized`). Always `true` for a module currently installed,
    /// since `install_module` runs `on_init` synchronously before
    /// returning.
    pub fn module_is_initialized<T: Module>(&self) -> bool {
        self.lock()
            .modules
            .get(&TypeId::of::<T>())
            .map(|e| e.is_initialized)
            .unwrap_or(false)
    }

    /// Type names of every currently installed module, in install order.
    pub fn installed_modules(&self) -> Vec<&'static str> {
        self.lock().modules.values().map(|e| e.type_name).collect()
    }

    /// Count of currently installed modules.
    pub fn module_count(&self) -> usize {
        self.lock().modules.len()
    }
}

/// Disposes every installed module in reverse-install order, as run by
/// [`Store::dispose`]. Skips per-ref removal: `Store::dispose` wholesale
/// clears `values`/`behaviors`/subscribers/etc. immediately afterward, so
/// removing refs one at a time here would be redundant work.
pub(crate) fn dispose_all(store: &Store) {
    let entries: Vec<Arc<dyn Fn(&Store) + Send + Sync>> = {
        let mut inner = store.lock();
        inner.modules.drain(..).map(|(_, entry)| entry.dispose).collect()
    };
    for dispose in entries.into_iter().rev() {
        dispose(store);
    }
}
