//! Native acceleration units for the Vo VM.
//!
//! A *unit* is a native shared library that replaces selected managed methods
//! with native functions. This crate implements the host side:
//!
//! - **`unit_spec`**: parses `feature_version?key=value:key=value` options.
//! - **`registry`**: units, their states and the method → [`Entry`] table.
//! - **`loader`**: resolves and opens modules, reads their export tables.
//! - **`lifecycle`**: drives `init` / `post_init` / `finalize`, all-or-nothing.
//! - **`env`**: the callback table handed to units during lifecycle calls.
//! - **`bridge`**: marshals managed arguments into native calls and back.
//! - **`shim`**: per-method replacement queries for the compiler pipeline.
//!
//! # Architecture
//!
//! ```text
//! options ──► UnitSpec ──► Registry ──► loader ──► Controller ──► AccelRuntime
//!                                                                    │
//!                                  ReplacementShim ◄── FrozenRegistry┘
//!                                        │
//!                 interpreted / compiled ▼
//!                                   CallPlan::call ──► native function
//! ```
//!
//! # Example
//!
//! ```ignore
//! use vo_accel::{AccelConfig, Controller, DylibSource, CallMode, Heap, MethodId, Value};
//!
//! let config = AccelConfig::from_env().enabled(true).unit("libMathAccel_1");
//! let source = DylibSource::new(config.search_path.clone());
//! let runtime = Controller::new(config, &source).start()?;
//!
//! let heap = Heap::new();
//! let add = MethodId::new("Launcher", "add", "(II)I");
//! let sum = runtime.shim().invoke(&add, CallMode::Compiled, &heap, &[Value::Int(47), Value::Int(48)])?;
//! assert_eq!(sum, Some(Value::Int(95)));
//! runtime.shutdown();
//! ```

pub mod abi;
pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod heap;
pub mod lifecycle;
pub mod loader;
pub mod registry;
pub mod shim;
pub mod unit_spec;
pub mod value;

pub use bridge::{CallPlan, CompiledCall, DispatchBridge, NativeType};
pub use config::{AccelConfig, FlagStore};
pub use descriptor::{CallingConvention, ElemKind, MethodDescriptor, MethodId, ParamKind};
pub use error::{AccelError, DispatchError};
pub use heap::{ArrayElement, Heap, ObjRef, ObjectKind, Pinned};
pub use lifecycle::{AccelRuntime, Controller, PendingRuntime, ShutdownReport};
pub use loader::{DylibModule, DylibSource, ModuleSource, SearchPath, StaticModule, StaticSource, UnitModule};
pub use registry::{Entry, FrozenRegistry, NativeFn, NativeTarget, Registry, Unit, UnitInfo, UnitState};
pub use shim::{CallMode, ReplacementShim};
pub use unit_spec::UnitSpec;
pub use value::Value;
