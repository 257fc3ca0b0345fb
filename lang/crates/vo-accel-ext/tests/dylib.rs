//! The `math-unit` cdylib loaded from disk through the search path.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use vo_accel::{AccelConfig, AccelError, CallMode, Controller, DylibSource, Heap, MethodId, SearchPath, Value};

/// Build the unit library and return the directory cargo put it in.
fn unit_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let exe = std::env::current_exe().unwrap();
        // target/<profile>/deps/<test binary>
        let dir = exe.parent().and_then(Path::parent).unwrap().to_path_buf();
        let mut cargo = Command::new(env!("CARGO"));
        cargo.args(["build", "--quiet", "-p", "vo-accel-math-unit"]);
        if dir.file_name().is_some_and(|name| name == "release") {
            cargo.arg("--release");
        }
        let status = cargo.status().unwrap();
        assert!(status.success(), "building vo-accel-math-unit failed: {}", status);
        dir
    })
}

fn unit_name() -> String {
    format!("{}MathDylibAccel_1", std::env::consts::DLL_PREFIX)
}

fn start(option: &str) -> Result<vo_accel::AccelRuntime, AccelError> {
    let source = DylibSource::new(SearchPath::new([unit_dir()]));
    let config = AccelConfig::new().enabled(true).vm_version("vo test").unit(option);
    Controller::new(config, &source).start()
}

#[test]
fn test_dylib_unit_round_trip() {
    let name = unit_name();
    let runtime = start(&format!("{}?mode=disk", name)).unwrap();
    let units = runtime.units();
    assert_eq!(units[0].name, name);
    let location = units[0].location.clone().unwrap();
    assert!(Path::new(&location).starts_with(unit_dir()), "{}", location);

    let heap = Heap::new();
    let shim = runtime.shim();
    let add = MethodId::new("demo/DylibMath", "add", "(II)I");
    let sum = MethodId::new("demo/DylibMath", "sum", "([I)J");
    let negate = MethodId::new("demo/DylibMath", "negate", "(I)I");
    let values = heap.new_array_from(&[1i32, 2, 3]);
    for mode in [CallMode::Interpreted, CallMode::Compiled] {
        assert_eq!(shim.invoke(&add, mode, &heap, &[Value::Int(40), Value::Int(2)]), Ok(Some(Value::Int(42))));
        assert_eq!(shim.invoke(&sum, mode, &heap, &[Value::from_ref(values)]), Ok(Some(Value::Long(6))));
        assert_eq!(shim.invoke(&negate, mode, &heap, &[Value::Int(5)]), Ok(Some(Value::Int(-5))));
    }
    assert!(shim.is_accel_native_call("dylib_negate"));
    assert!(!heap.is_pinned(values));

    let report = runtime.shutdown();
    assert!(report.is_clean());
    assert_eq!(report.finalized, [name]);
}

#[test]
fn test_dylib_init_failure() {
    let name = unit_name();
    let err = start(&format!("{}?fail=1", name)).unwrap_err();
    assert!(matches!(err, AccelError::InitFailed { .. }));
    assert_eq!(
        err.to_string(),
        format!("failed to initialize accel unit `{}`: asked to fail", name)
    );
}
