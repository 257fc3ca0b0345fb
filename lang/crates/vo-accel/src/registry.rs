//! Unit registry.
//!
//! Two phases: [`Registry`] is mutated by the controller during the
//! single-threaded startup, then published as an immutable [`FrozenRegistry`]
//! that compiler and interpreter threads query without locks.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CString};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;

use crate::abi::{AccelHandle, ProviderFn};
use crate::descriptor::{CallingConvention, MethodId};
use crate::env::HOST_ENV;
use crate::error::AccelError;
use crate::loader::{EntryPoints, UnitModule};
use crate::unit_spec::UnitSpec;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> AccelHandle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

// ==================== UnitState ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Parsed,
    Loaded,
    InitFailed,
    ActivePending,
    PostInitFailed,
    Active,
    Finalized,
}

impl UnitState {
    /// States only move forward.
    pub fn can_advance_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Parsed, Loaded)
                | (Loaded, InitFailed)
                | (Loaded, ActivePending)
                | (ActivePending, PostInitFailed)
                | (ActivePending, Active)
                | (Active, Finalized)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::InitFailed | UnitState::PostInitFailed | UnitState::Finalized)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Parsed => "parsed",
            UnitState::Loaded => "loaded",
            UnitState::InitFailed => "init-failed",
            UnitState::ActivePending => "active-pending",
            UnitState::PostInitFailed => "post-init-failed",
            UnitState::Active => "active",
            UnitState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

// ==================== Entry ====================

/// Address of a native replacement function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFn(*const c_void);

// Function addresses are immutable code pointers.
unsafe impl Send for NativeFn {}
unsafe impl Sync for NativeFn {}

impl NativeFn {
    pub fn new(ptr: *const c_void) -> Option<Self> {
        (!ptr.is_null()).then_some(Self(ptr))
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0
    }
}

/// Where an entry's native function comes from.
#[derive(Debug, Clone, Copy)]
pub enum NativeTarget {
    Direct(NativeFn),
    /// Produced by `provider(env, native_name, data)` on first lowering.
    Provided { provider: ProviderFn, data: usize },
}

impl NativeTarget {
    fn same_as(&self, other: &NativeTarget) -> bool {
        match (self, other) {
            (NativeTarget::Direct(a), NativeTarget::Direct(b)) => a == b,
            (
                NativeTarget::Provided { provider: p, data: d },
                NativeTarget::Provided { provider: q, data: e },
            ) => *p as usize == *q as usize && d == e,
            _ => false,
        }
    }
}

impl From<NativeFn> for NativeTarget {
    fn from(func: NativeFn) -> Self {
        NativeTarget::Direct(func)
    }
}

/// One registered replacement.
#[derive(Debug)]
pub struct Entry {
    unit: Arc<str>,
    method: MethodId,
    native_name: String,
    target: NativeTarget,
    resolved: OnceLock<Option<NativeFn>>,
    convention: CallingConvention,
    loaded: Arc<AtomicBool>,
}

impl Entry {
    pub fn new(
        unit: Arc<str>,
        method: MethodId,
        native_name: String,
        target: impl Into<NativeTarget>,
        convention: CallingConvention,
    ) -> Self {
        Self {
            unit,
            method,
            native_name,
            target: target.into(),
            resolved: OnceLock::new(),
            convention,
            loaded: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Name of the owning unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn native_name(&self) -> &str {
        &self.native_name
    }

    pub fn target(&self) -> NativeTarget {
        self.target
    }

    /// The native function. A provided entry asks its provider once and keeps
    /// the answer, including a null one. Callers check [`is_loaded`] first.
    ///
    /// [`is_loaded`]: Entry::is_loaded
    pub fn native_func(&self) -> Option<NativeFn> {
        let (provider, data) = match self.target {
            NativeTarget::Direct(func) => return Some(func),
            NativeTarget::Provided { provider, data } => (provider, data),
        };
        *self.resolved.get_or_init(|| {
            let name = CString::new(self.native_name.as_str()).ok()?;
            let ptr = unsafe { provider(&HOST_ENV, name.as_ptr(), data as *mut c_void) };
            let func = NativeFn::new(ptr);
            match func {
                Some(_) => tracing::debug!(entry = %self.method, native = %self.native_name, "provider resolved native function"),
                None => tracing::error!(entry = %self.method, native = %self.native_name, unit = %self.unit, "provider returned no native function"),
            }
            func
        })
    }

    pub fn convention(&self) -> &CallingConvention {
        &self.convention
    }

    /// False once the owning unit's module has been released.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn same_target(&self, other: &Entry) -> bool {
        self.target.same_as(&other.target) && self.convention == other.convention
    }
}

// ==================== Unit ====================

pub(crate) struct LoadedModule {
    pub module: Box<dyn UnitModule>,
    pub points: EntryPoints,
}

/// A declared unit. Owns its module; the module is released exactly once.
pub struct Unit {
    handle: AccelHandle,
    name: Arc<str>,
    spec: UnitSpec,
    state: UnitState,
    module: Option<LoadedModule>,
    location: Option<String>,
    entries: Vec<MethodId>,
    loaded: Arc<AtomicBool>,
}

impl Unit {
    fn new(spec: UnitSpec) -> Self {
        Self {
            handle: next_handle(),
            name: spec.display_name().into(),
            spec,
            state: UnitState::Parsed,
            module: None,
            location: None,
            entries: Vec::new(),
            loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    /// `feature_version`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &UnitSpec {
        &self.spec
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Where the module was loaded from.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Methods this unit replaces, in registration order.
    pub fn entries(&self) -> &[MethodId] {
        &self.entries
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn advance(&mut self, next: UnitState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "unit {} cannot move from {} to {}",
            self.name,
            self.state,
            next
        );
        tracing::debug!(unit = %self.name, from = %self.state, to = %next, "unit state");
        self.state = next;
    }

    pub(crate) fn attach(&mut self, module: Box<dyn UnitModule>, points: EntryPoints) {
        self.location = Some(module.location().to_string());
        self.module = Some(LoadedModule { module, points });
        self.loaded.store(true, Ordering::Release);
        self.advance(UnitState::Loaded);
    }

    pub(crate) fn entry_points(&self) -> Option<EntryPoints> {
        self.module.as_ref().map(|m| m.points)
    }

    /// Drop the module. Returns false if it was already released.
    pub(crate) fn release(&mut self) -> bool {
        match self.module.take() {
            Some(loaded) => {
                self.loaded.store(false, Ordering::Release);
                tracing::debug!(unit = %self.name, location = loaded.module.location(), "releasing module");
                drop(loaded);
                true
            }
            None => false,
        }
    }

    pub fn info(&self) -> UnitInfo {
        UnitInfo {
            handle: self.handle,
            name: self.name.to_string(),
            feature: self.spec.feature().to_string(),
            version: self.spec.version().map(str::to_string),
            option: self.spec.option().to_string(),
            state: self.state,
            location: self.location.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("location", &self.location)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Snapshot of a unit for queries after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub handle: AccelHandle,
    pub name: String,
    pub feature: String,
    pub version: Option<String>,
    pub option: String,
    pub state: UnitState,
    pub location: Option<String>,
    pub entries: Vec<MethodId>,
}

// ==================== Registry ====================

/// Startup-phase registry, owned by the controller.
#[derive(Debug, Default)]
pub struct Registry {
    units: Vec<Unit>,
    by_feature: HashMap<String, usize>,
    entries: IndexMap<MethodId, Arc<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit. Units are keyed by feature, so two versions of one feature
    /// conflict.
    pub fn register(&mut self, spec: UnitSpec) -> Result<&mut Unit, AccelError> {
        if let Some(&index) = self.by_feature.get(spec.feature()) {
            let existing = &self.units[index];
            tracing::error!(feature = spec.feature(), existing = existing.spec.option(), duplicate = spec.option(), "duplicate unit");
            return Err(AccelError::DuplicateUnit {
                feature: spec.feature().to_string(),
                existing: existing.spec.option().to_string(),
                duplicate: spec.option().to_string(),
            });
        }
        let index = self.units.len();
        self.by_feature.insert(spec.feature().to_string(), index);
        self.units.push(Unit::new(spec));
        Ok(&mut self.units[index])
    }

    /// Register entries for the unit with `handle`. Either all entries are
    /// added or none.
    ///
    /// Re-registering the same target from the same unit is a no-op; any
    /// other repeat of a method is a duplicate, and the first registration
    /// stays.
    pub fn register_entries(&mut self, handle: AccelHandle, entries: Vec<Entry>) -> Result<(), AccelError> {
        let index = self.index_of(handle).ok_or_else(|| AccelError::InvalidExportTable {
            unit: format!("#{}", handle),
            reason: "entries registered for an unknown unit".to_string(),
        })?;
        let unit_name = self.units[index].name.clone();

        let mut fresh: IndexMap<MethodId, Entry> = IndexMap::with_capacity(entries.len());
        for entry in entries {
            let owner = match (self.entries.get(&entry.method), fresh.get(&entry.method)) {
                (Some(prev), _) if prev.unit == unit_name && prev.same_target(&entry) => continue,
                (Some(prev), _) => Some(prev.unit.clone()),
                (None, Some(prev)) if prev.same_target(&entry) => continue,
                (None, Some(_)) => Some(unit_name.clone()),
                (None, None) => None,
            };
            if let Some(owner) = owner {
                tracing::error!(entry = %entry.method, unit = %unit_name, owner = %owner, "duplicate native acceleration entry");
                return Err(AccelError::DuplicateEntry {
                    entry: entry.method.to_string(),
                    unit: unit_name.to_string(),
                    owner: owner.to_string(),
                });
            }
            fresh.insert(entry.method.clone(), entry);
        }

        let unit = &mut self.units[index];
        for (method, mut entry) in fresh {
            entry.loaded = unit.loaded.clone();
            tracing::debug!(unit = %unit_name, entry = %method, native = %entry.native_name, "registered entry");
            unit.entries.push(method.clone());
            self.entries.insert(method, Arc::new(entry));
        }
        Ok(())
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut [Unit] {
        &mut self.units
    }

    pub fn unit(&self, handle: AccelHandle) -> Option<&Unit> {
        self.index_of(handle).map(|i| &self.units[i])
    }

    pub(crate) fn unit_mut(&mut self, handle: AccelHandle) -> Option<&mut Unit> {
        self.index_of(handle).map(move |i| &mut self.units[i])
    }

    pub fn all_active(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter().filter(|u| u.state == UnitState::Active)
    }

    pub fn find(&self, method: &MethodId) -> Option<&Arc<Entry>> {
        self.entries.get(method)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Read-only snapshot for queries after startup. Entries are shared.
    pub fn snapshot(&self) -> FrozenRegistry {
        FrozenRegistry {
            entries: self.entries.clone(),
            native_names: self.entries.values().map(|e| e.native_name.clone()).collect(),
            units: self.units.iter().map(Unit::info).collect(),
        }
    }

    fn index_of(&self, handle: AccelHandle) -> Option<usize> {
        self.units.iter().position(|u| u.handle == handle)
    }
}

// ==================== FrozenRegistry ====================

/// Read-only registry published after startup.
#[derive(Debug, Default)]
pub struct FrozenRegistry {
    entries: IndexMap<MethodId, Arc<Entry>>,
    native_names: HashSet<String>,
    units: Vec<UnitInfo>,
}

impl FrozenRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn find(&self, method: &MethodId) -> Option<&Arc<Entry>> {
        self.entries.get(method)
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.entries.values()
    }

    /// Units as they were when startup completed.
    pub fn units(&self) -> &[UnitInfo] {
        &self.units
    }

    pub fn all_active(&self) -> impl Iterator<Item = &UnitInfo> {
        self.units.iter().filter(|u| u.state == UnitState::Active)
    }

    pub fn is_accel_native_call(&self, native_name: &str) -> bool {
        self.native_names.contains(native_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
