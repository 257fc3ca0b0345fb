//! Lifecycle controller.
//!
//! Startup is all-or-nothing:
//!
//! 1. parse every unit option,
//! 2. register every spec,
//! 3. per unit: open the module, `naccel_init`, read and register exports,
//! 4. per unit: `naccel_post_init`, after which the unit is `Active`.
//!
//! Steps 1-3 are [`Controller::initialize`], step 4 is
//! [`PendingRuntime::post_initialize`]; the host may run its own
//! initialization in between. Any failure finalizes the units that already
//! became active, releases every module and returns the error.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::abi::{AccelHandle, AccelStatus, LifecycleFn, ACCEL_OK};
use crate::config::AccelConfig;
use crate::env::{Session, HOST_ENV};
use crate::error::AccelError;
use crate::loader::{read_export_table, EntryPoints, ModuleSource};
use crate::registry::{FrozenRegistry, Registry, UnitInfo, UnitState};
use crate::shim::ReplacementShim;
use crate::unit_spec::parse_all;

// ==================== Lifecycle calls ====================

struct CallOutcome {
    status: AccelStatus,
    failure: Option<AccelError>,
    report: Option<String>,
}

impl CallOutcome {
    fn message(&mut self, symbol: &str) -> String {
        self.report
            .take()
            .unwrap_or_else(|| format!("{} returned status {}", symbol, self.status))
    }
}

/// Call one lifecycle entry point with a session installed.
fn call_unit(registry: &RefCell<Registry>, config: &AccelConfig, f: LifecycleFn, handle: AccelHandle) -> CallOutcome {
    let session = Session::new(handle, registry, &config.flags, &config.vm_version);
    let status = session.enter(|| unsafe { f(&HOST_ENV, handle) });
    CallOutcome {
        status,
        failure: session.take_failure(),
        report: session.take_report(handle),
    }
}

/// Finalize every active unit once, then release every module.
fn finalize_all(registry: &RefCell<Registry>, config: &AccelConfig) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    let count = registry.borrow().units().len();

    for index in 0..count {
        let (handle, name, state, points) = {
            let registry = registry.borrow();
            let unit = &registry.units()[index];
            (unit.handle(), unit.name_arc(), unit.state(), unit.entry_points())
        };
        if state != UnitState::Active {
            continue;
        }
        if let Some(finalize) = points.and_then(|p| p.finalize) {
            let mut outcome = call_unit(registry, config, finalize, handle);
            let failure = match outcome.failure.take() {
                Some(err) => Some(err.to_string()),
                None if outcome.status != ACCEL_OK => Some(outcome.message(crate::abi::FINALIZE_SYMBOL)),
                None => None,
            };
            if let Some(message) = failure {
                tracing::warn!(unit = %name, %message, "accel unit finalize failed");
                report.failures.push((name.to_string(), message));
            }
        }
        registry.borrow_mut().units_mut()[index].advance(UnitState::Finalized);
        report.finalized.push(name.to_string());
    }

    for unit in registry.borrow_mut().units_mut() {
        unit.release();
    }
    report
}

// ==================== Controller ====================

/// Drives units from options to an [`AccelRuntime`].
pub struct Controller<'s> {
    config: AccelConfig,
    source: &'s dyn ModuleSource,
}

impl<'s> Controller<'s> {
    pub fn new(config: AccelConfig, source: &'s dyn ModuleSource) -> Self {
        Self { config, source }
    }

    /// Full startup: [`initialize`](Self::initialize) then
    /// [`post_initialize`](PendingRuntime::post_initialize).
    pub fn start(self) -> Result<AccelRuntime, AccelError> {
        self.initialize()?.post_initialize()
    }

    /// Parse, register, load and init every unit.
    pub fn initialize(self) -> Result<PendingRuntime, AccelError> {
        let Controller { config, source } = self;

        if !config.enabled {
            if !config.units.is_empty() {
                tracing::warn!(units = config.units.len(), "acceleration is disabled, ignoring declared units");
            }
            return Ok(PendingRuntime::new(Registry::new(), config));
        }
        if config.units.is_empty() {
            tracing::warn!("acceleration is enabled but no units are declared");
            return Ok(PendingRuntime::new(Registry::new(), config));
        }

        let specs = parse_all(&config.units).inspect_err(|e| {
            tracing::error!(error = %e, "invalid accel unit option");
        })?;
        tracing::debug!(units = specs.len(), "parsed accel unit options");

        let mut registry = Registry::new();
        for spec in specs {
            registry.register(spec)?;
        }

        let mut pending = PendingRuntime::new(registry, config);
        let count = pending.registry.get_mut().units().len();
        for index in 0..count {
            if let Err(e) = pending.load_and_init(source, index) {
                return Err(pending.abort(e));
            }
        }
        Ok(pending)
    }
}

// ==================== PendingRuntime ====================

/// Units loaded and initialized, waiting for `post_initialize`.
///
/// Dropping it releases every module without finalizing.
pub struct PendingRuntime {
    registry: RefCell<Registry>,
    config: AccelConfig,
}

impl PendingRuntime {
    fn new(registry: Registry, config: AccelConfig) -> Self {
        Self {
            registry: RefCell::new(registry),
            config,
        }
    }

    pub fn units(&self) -> Vec<UnitInfo> {
        self.registry.borrow().units().iter().map(|u| u.info()).collect()
    }

    fn load_and_init(&mut self, source: &dyn ModuleSource, index: usize) -> Result<(), AccelError> {
        let (handle, name, points) = {
            let unit = &mut self.registry.get_mut().units_mut()[index];
            let name = unit.name_arc();
            let module = source.open(unit.spec())?;
            let points = EntryPoints::resolve(module.as_ref(), &name)?;
            unit.attach(module, points);
            (unit.handle(), name, points)
        };

        let mut outcome = call_unit(&self.registry, &self.config, points.init, handle);
        let registry = self.registry.get_mut();
        let failure = match outcome.failure.take() {
            Some(err) => Some(err),
            None if outcome.status != ACCEL_OK => Some(AccelError::InitFailed {
                unit: name.to_string(),
                message: outcome.message(crate::abi::INIT_SYMBOL),
            }),
            None => None,
        };
        if let Some(err) = failure {
            if let Some(unit) = registry.unit_mut(handle) {
                unit.advance(UnitState::InitFailed);
            }
            return Err(err);
        }
        if let Some(unit) = registry.unit_mut(handle) {
            unit.advance(UnitState::ActivePending);
        }

        let entries = unsafe { read_export_table((points.exports)(), &name) }?;
        tracing::debug!(unit = %name, entries = entries.len(), "read export table");
        registry.register_entries(handle, entries)
    }

    /// Run `naccel_post_init` for every unit and publish the runtime.
    pub fn post_initialize(mut self) -> Result<AccelRuntime, AccelError> {
        let count = self.registry.get_mut().units().len();
        for index in 0..count {
            if let Err(e) = self.post_init(index) {
                return Err(self.abort(e));
            }
        }

        let registry = std::mem::take(self.registry.get_mut());
        let config = std::mem::take(&mut self.config);
        let runtime = AccelRuntime::new(registry, config);
        if !runtime.registry().units().is_empty() {
            tracing::debug!(
                units = runtime.registry().units().len(),
                entries = runtime.registry().len(),
                "accel units active"
            );
        }
        Ok(runtime)
    }

    fn post_init(&mut self, index: usize) -> Result<(), AccelError> {
        let (handle, name, points) = {
            let unit = &self.registry.get_mut().units()[index];
            (unit.handle(), unit.name_arc(), unit.entry_points())
        };

        if let Some(post_init) = points.and_then(|p| p.post_init) {
            let mut outcome = call_unit(&self.registry, &self.config, post_init, handle);
            let failure = match outcome.failure.take() {
                Some(err) => Some(err),
                None if outcome.status != ACCEL_OK => Some(AccelError::PostInitFailed {
                    unit: name.to_string(),
                    message: outcome.message(crate::abi::POST_INIT_SYMBOL),
                }),
                None => None,
            };
            if let Some(err) = failure {
                if let Some(unit) = self.registry.get_mut().unit_mut(handle) {
                    unit.advance(UnitState::PostInitFailed);
                }
                return Err(err);
            }
        }

        if let Some(unit) = self.registry.get_mut().unit_mut(handle) {
            unit.advance(UnitState::Active);
            tracing::debug!(unit = %name, location = unit.location().unwrap_or(""), "accel unit activated");
        }
        Ok(())
    }

    fn abort(&mut self, err: AccelError) -> AccelError {
        tracing::error!(error = %err, kind = err.kind(), "accel startup failed");
        let report = finalize_all(&self.registry, &self.config);
        if !report.finalized.is_empty() {
            tracing::debug!(finalized = report.finalized.len(), "finalized active units after startup failure");
        }
        err
    }
}

impl Drop for PendingRuntime {
    fn drop(&mut self) {
        for unit in self.registry.get_mut().units_mut() {
            unit.release();
        }
    }
}

// ==================== AccelRuntime ====================

/// Result of shutting down a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Units that received their finalize call, in declaration order.
    pub finalized: Vec<String>,
    /// `(unit, message)` for every failed finalize.
    pub failures: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Active units after a successful startup.
///
/// Shutdown finalizes every active unit exactly once, either through
/// [`shutdown`](Self::shutdown) or on drop.
pub struct AccelRuntime {
    units: Mutex<Registry>,
    shim: ReplacementShim,
    config: AccelConfig,
    finalized: bool,
}

impl AccelRuntime {
    fn new(registry: Registry, config: AccelConfig) -> Self {
        let frozen = Arc::new(registry.snapshot());
        Self {
            units: Mutex::new(registry),
            shim: ReplacementShim::new(frozen),
            config,
            finalized: false,
        }
    }

    /// Runtime with no units.
    pub fn empty(config: AccelConfig) -> Self {
        Self::new(Registry::new(), config)
    }

    pub fn registry(&self) -> &Arc<FrozenRegistry> {
        self.shim.registry()
    }

    pub fn shim(&self) -> &ReplacementShim {
        &self.shim
    }

    pub fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// Current unit states.
    pub fn units(&self) -> Vec<UnitInfo> {
        self.units.lock().units().iter().map(|u| u.info()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().units().is_empty()
    }

    pub fn shutdown(mut self) -> ShutdownReport {
        self.finalize()
    }

    fn finalize(&mut self) -> ShutdownReport {
        if self.finalized {
            return ShutdownReport::default();
        }
        self.finalized = true;
        let cell = RefCell::new(std::mem::take(self.units.get_mut()));
        let report = finalize_all(&cell, &self.config);
        *self.units.get_mut() = cell.into_inner();
        if !report.finalized.is_empty() {
            tracing::debug!(finalized = report.finalized.len(), failures = report.failures.len(), "accel units finalized");
        }
        report
    }
}

impl Drop for AccelRuntime {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for AccelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelRuntime")
            .field("units", &self.registry().units().len())
            .field("entries", &self.registry().len())
            .field("finalized", &self.finalized)
            .finish()
    }
}
