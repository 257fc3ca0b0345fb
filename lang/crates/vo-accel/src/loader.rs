//! Native module loader.
//!
//! Resolves a [`UnitSpec`] to a module, opens it and looks up the lifecycle
//! entry points. Modules are either shared libraries opened with
//! `libloading` ([`DylibModule`]) or in-process symbol tables
//! ([`StaticModule`]) for units linked into the host.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::abi::{
    ExportEntry, ExportTable, ExportsFn, LifecycleFn, ACCEL_ABI_VERSION, EXPORTS_SYMBOL, FINALIZE_SYMBOL,
    INIT_SYMBOL, MAX_EXPORT_ENTRIES, POST_INIT_SYMBOL,
};
use crate::descriptor::{CallingConvention, MethodDescriptor, MethodId};
use crate::error::AccelError;
use crate::registry::{Entry, NativeFn, NativeTarget};
use crate::unit_spec::{drive_prefix_len, UnitSpec};

/// Environment variable listing unit directories.
pub const SEARCH_PATH_ENV: &str = "VO_ACCEL_PATH";

// ==================== Modules ====================

/// An opened unit module.
pub trait UnitModule: Send {
    /// Human-readable origin, e.g. the library path.
    fn location(&self) -> &str;

    /// Address of an exported symbol.
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

/// Shared library opened with `libloading`. Closed on drop.
pub struct DylibModule {
    lib: Library,
    location: String,
}

impl DylibModule {
    pub fn open(path: &Path) -> Result<Self, libloading::Error> {
        // Every unit exports the same entry point names, keep them local.
        #[cfg(unix)]
        let lib = unsafe {
            let flags = libloading::os::unix::RTLD_NOW | libloading::os::unix::RTLD_LOCAL;
            libloading::os::unix::Library::open(Some(path), flags).map(Library::from)?
        };
        #[cfg(not(unix))]
        let lib = unsafe { Library::new(path)? };

        Ok(Self {
            lib,
            location: path.display().to_string(),
        })
    }
}

impl UnitModule for DylibModule {
    fn location(&self) -> &str {
        &self.location
    }

    fn symbol(&self, name: &str) -> Option<*const c_void> {
        unsafe {
            self.lib
                .get::<*const c_void>(name.as_bytes())
                .ok()
                .map(|s| *s)
                .filter(|p| !p.is_null())
        }
    }
}

impl fmt::Debug for DylibModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibModule").field("location", &self.location).finish()
    }
}

/// Symbol table of a unit compiled into the host.
#[derive(Debug, Clone, Default)]
pub struct StaticModule {
    location: String,
    symbols: HashMap<String, usize>,
}

impl StaticModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            location: format!("<static:{}>", name.into()),
            symbols: HashMap::new(),
        }
    }

    pub fn symbol_ptr(mut self, name: &str, ptr: *const c_void) -> Self {
        self.symbols.insert(name.to_string(), ptr as usize);
        self
    }

    pub fn init(self, f: LifecycleFn) -> Self {
        self.symbol_ptr(INIT_SYMBOL, f as *const c_void)
    }

    pub fn post_init(self, f: LifecycleFn) -> Self {
        self.symbol_ptr(POST_INIT_SYMBOL, f as *const c_void)
    }

    pub fn finalize(self, f: LifecycleFn) -> Self {
        self.symbol_ptr(FINALIZE_SYMBOL, f as *const c_void)
    }

    pub fn exports(self, f: ExportsFn) -> Self {
        self.symbol_ptr(EXPORTS_SYMBOL, f as *const c_void)
    }
}

impl UnitModule for StaticModule {
    fn location(&self) -> &str {
        &self.location
    }

    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols
            .get(name)
            .map(|&addr| addr as *const c_void)
            .filter(|p| !p.is_null())
    }
}

// ==================== Sources ====================

/// Resolves and opens the module for a unit.
pub trait ModuleSource {
    fn open(&self, spec: &UnitSpec) -> Result<Box<dyn UnitModule>, AccelError>;
}

/// Opens shared libraries found through a [`SearchPath`].
#[derive(Debug, Clone)]
pub struct DylibSource {
    search_path: SearchPath,
}

impl DylibSource {
    pub fn new(search_path: SearchPath) -> Self {
        Self { search_path }
    }
}

impl ModuleSource for DylibSource {
    fn open(&self, spec: &UnitSpec) -> Result<Box<dyn UnitModule>, AccelError> {
        let path = self.search_path.resolve(spec)?;
        tracing::debug!(unit = %spec.display_name(), path = %path.display(), "opening unit module");
        let module = DylibModule::open(&path).map_err(|e| AccelError::ModuleNotFound {
            unit: spec.option().to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        Ok(Box::new(module))
    }
}

/// In-process units keyed by identifier.
#[derive(Clone, Default)]
pub struct StaticSource {
    modules: HashMap<String, Arc<dyn Fn() -> StaticModule + Send + Sync>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module for `identifier`. The factory runs on every open.
    pub fn with<F>(mut self, identifier: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> StaticModule + Send + Sync + 'static,
    {
        self.modules.insert(identifier.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.modules.contains_key(identifier)
    }
}

impl ModuleSource for StaticSource {
    fn open(&self, spec: &UnitSpec) -> Result<Box<dyn UnitModule>, AccelError> {
        let factory = self.modules.get(spec.identifier()).ok_or_else(|| AccelError::ModuleNotFound {
            unit: spec.option().to_string(),
            reason: "no built-in unit with this name".to_string(),
        })?;
        Ok(Box::new(factory()))
    }
}

impl fmt::Debug for StaticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.modules.keys()).finish()
    }
}

// ==================== Search path ====================

/// Ordered list of directories searched for unit libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// `VO_ACCEL_PATH` if set, otherwise `<exe_dir>/../lib/accel`.
    pub fn from_env() -> Self {
        match std::env::var_os(SEARCH_PATH_ENV) {
            Some(value) if !value.is_empty() => Self::new(std::env::split_paths(&value)),
            _ => Self::new(default_dir()),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn push(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }

    /// Candidate files for `spec`, in search order.
    pub fn candidates(&self, spec: &UnitSpec) -> Vec<PathBuf> {
        let id = spec.identifier();
        if is_path_like(id) {
            return vec![PathBuf::from(id)];
        }
        let names = library_names(id);
        self.dirs
            .iter()
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .collect()
    }

    /// First existing candidate.
    pub fn resolve(&self, spec: &UnitSpec) -> Result<PathBuf, AccelError> {
        let candidates = self.candidates(spec);
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }
        let searched = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::error!(unit = %spec.display_name(), searched = %searched, "unit module not found");
        Err(AccelError::ModuleNotFound {
            unit: spec.option().to_string(),
            reason: if searched.is_empty() {
                "search path is empty".to_string()
            } else {
                format!("searched {}", searched)
            },
        })
    }
}

fn default_dir() -> Vec<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("..").join("lib").join("accel")))
        .into_iter()
        .collect()
}

fn is_path_like(id: &str) -> bool {
    id.contains(std::path::MAIN_SEPARATOR)
        || id.contains('/')
        || drive_prefix_len(id) > 0
        || id.ends_with(std::env::consts::DLL_SUFFIX)
}

/// `{id}_{arch}{suffix}`, `{id}{suffix}`, then `{prefix}{id}{suffix}`.
fn library_names(id: &str) -> Vec<String> {
    use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};

    let mut names = vec![
        format!("{}_{}{}", id, arch_name(), DLL_SUFFIX),
        format!("{}{}", id, DLL_SUFFIX),
    ];
    if !DLL_PREFIX.is_empty() && !id.starts_with(DLL_PREFIX) {
        names.push(format!("{}{}{}", DLL_PREFIX, id, DLL_SUFFIX));
    }
    names
}

fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86-64",
        other => other,
    }
}

// ==================== Entry points and export table ====================

/// Resolved lifecycle entry points of an opened module.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    pub init: LifecycleFn,
    pub post_init: Option<LifecycleFn>,
    pub finalize: Option<LifecycleFn>,
    pub exports: ExportsFn,
}

impl EntryPoints {
    pub fn resolve(module: &dyn UnitModule, unit: &str) -> Result<Self, AccelError> {
        let missing = |symbol| AccelError::MissingEntryPoint {
            unit: unit.to_string(),
            symbol,
        };
        let init = module.symbol(INIT_SYMBOL).ok_or_else(|| missing(INIT_SYMBOL))?;
        let exports = module.symbol(EXPORTS_SYMBOL).ok_or_else(|| missing(EXPORTS_SYMBOL))?;
        unsafe {
            Ok(Self {
                init: std::mem::transmute::<*const c_void, LifecycleFn>(init),
                post_init: module
                    .symbol(POST_INIT_SYMBOL)
                    .map(|p| std::mem::transmute::<*const c_void, LifecycleFn>(p)),
                finalize: module
                    .symbol(FINALIZE_SYMBOL)
                    .map(|p| std::mem::transmute::<*const c_void, LifecycleFn>(p)),
                exports: std::mem::transmute::<*const c_void, ExportsFn>(exports),
            })
        }
    }
}

/// Read and validate an export table.
///
/// # Safety
/// `table` must be null or point to a table whose pointers stay valid while
/// the owning module is loaded.
pub unsafe fn read_export_table(table: *const ExportTable, unit: &Arc<str>) -> Result<Vec<Entry>, AccelError> {
    let table = table
        .as_ref()
        .ok_or_else(|| AccelError::invalid_table(unit, "null export table"))?;
    if table.version != ACCEL_ABI_VERSION {
        return Err(AccelError::invalid_table(
            unit,
            format!("ABI version mismatch: expected {}, found {}", ACCEL_ABI_VERSION, table.version),
        ));
    }
    if table.count > MAX_EXPORT_ENTRIES {
        return Err(AccelError::invalid_table(
            unit,
            format!("{} entries exceeds the limit of {}", table.count, MAX_EXPORT_ENTRIES),
        ));
    }
    if table.count == 0 {
        return Ok(Vec::new());
    }
    if table.entries.is_null() {
        return Err(AccelError::invalid_table(unit, format!("{} entries at a null address", table.count)));
    }

    std::slice::from_raw_parts(table.entries, table.count as usize)
        .iter()
        .enumerate()
        .map(|(i, raw)| read_export_entry(raw, unit, i))
        .collect()
}

/// Validate one export entry, including its convention against the
/// descriptor.
///
/// # Safety
/// Pointers in `raw` must be null or valid for reads.
pub unsafe fn read_export_entry(raw: &ExportEntry, unit: &Arc<str>, index: usize) -> Result<Entry, AccelError> {
    let field = |ptr, what: &str| -> Result<String, AccelError> {
        read_str(ptr).map_err(|reason| AccelError::invalid_table(unit, format!("entry {}: {} {}", index, what, reason)))
    };
    let class = field(raw.class_name, "class name")?;
    let name = field(raw.method_name, "method name")?;
    let descriptor = field(raw.descriptor, "descriptor")?;
    let native_name = field(raw.native_name, "native name")?;
    let method = MethodId::new(class, name, descriptor);

    let target = match raw.provider {
        Some(provider) => NativeTarget::Provided {
            provider,
            data: raw.func as usize,
        },
        None => NativeFn::new(raw.func)
            .ok_or_else(|| AccelError::invalid_table(unit, format!("entry {} ({}): null function", index, method)))?
            .into(),
    };

    let tags: &[u8] = match (raw.convention.is_null(), raw.convention_len) {
        (_, 0) => &[],
        (true, n) => {
            return Err(AccelError::invalid_table(
                unit,
                format!("entry {} ({}): null convention with length {}", index, method, n),
            ));
        }
        (false, n) => std::slice::from_raw_parts(raw.convention, n as usize),
    };
    let convention = CallingConvention::from_tags(tags)
        .map_err(|reason| AccelError::invalid_table(unit, format!("entry {} ({}): {}", index, method, reason)))?;

    let parsed = MethodDescriptor::parse(&method.descriptor)
        .map_err(|reason| AccelError::invalid_table(unit, format!("entry {}: {}", index, reason)))?;
    if let Err(reason) = convention.check(&parsed) {
        tracing::error!(unit = %unit, entry = %method, %reason, "calling convention mismatch");
        return Err(AccelError::CallingConventionMismatch {
            unit: unit.to_string(),
            entry: method.to_string(),
            reason,
        });
    }

    Ok(Entry::new(unit.clone(), method, native_name, target, convention))
}

unsafe fn read_str(ptr: *const std::ffi::c_char) -> Result<String, &'static str> {
    if ptr.is_null() {
        return Err("is null");
    }
    let s = CStr::from_ptr(ptr).to_str().map_err(|_| "is not UTF-8")?;
    if s.is_empty() {
        return Err("is empty");
    }
    Ok(s.to_string())
}
