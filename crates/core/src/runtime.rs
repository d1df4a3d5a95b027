//! Locates ONNX Runtime and the GPU libraries its execution providers need.
//!
//! `ort` is built with `load-dynamic`, so nothing is linked at build time.
//! [`setup_runtime_libs`] must run at the top of `main`, before tracing and
//! before the first session is created.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Extra directory searched before every other candidate.
pub const ENV_LIB_DIR: &str = "VSRPIPE_LIB_DIR";
const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, kept for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub searched: Vec<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
    /// True when `ORT_DYLIB_PATH` was already set by the caller.
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Library directories in probe order:
/// `$VSRPIPE_LIB_DIR`, `<exe>/` (Windows), `<exe>/lib`, `<exe>/../lib`,
/// `<cwd>/lib`, then `/usr/local/lib` and `/usr/lib` on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(ENV_LIB_DIR).filter(|v| !v.is_empty()) {
        push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libraries: CUDA runtime and math libraries,
/// then cuDNN, then TensorRT. ORT's own provider libraries are excluded;
/// they resolve symbols from `libonnxruntime`, which `ort` loads later.
#[cfg(unix)]
fn load_tier(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 4] = ["libcudart", "libcublas", "libcufft", "libcurand"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_tier(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    const CUDA: [&str; 3] = ["cudart64_", "cublas64_", "cublaslt64_"];
    if CUDA.iter().any(|prefix| name.starts_with(prefix)) {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_shared_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_shared_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, in load order. A file name found in an earlier
/// directory shadows the same name in later ones.
fn plan_preload(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in entries.flatten().map(|entry| entry.path()) {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_shared_lib(&name, &path) {
                continue;
            }
            let Some(tier) = load_tier(&name) else {
                continue;
            };
            if seen.insert(name.clone()) {
                libs.push((tier, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Loads a library into the global symbol namespace and leaks the handle.
/// The dynamic loader caches `LD_LIBRARY_PATH` at process start, so this is
/// the only way to make late-discovered directories visible to ORT.
#[cfg(unix)]
fn load_global(path: &Path) -> bool {
    // SAFETY: only GPU runtime libraries selected by `load_tier` are opened;
    // their initializers have no preconditions on our process state.
    let opened = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    opened.map(std::mem::forget).is_ok()
}

#[cfg(windows)]
fn load_global(path: &Path) -> bool {
    // SAFETY: see the Unix variant.
    let opened = unsafe { libloading::Library::new(path) };
    opened.map(std::mem::forget).is_ok()
}

/// Points `ORT_DYLIB_PATH` at a bundled ONNX Runtime when the caller has not
/// set it, then preloads CUDA, cuDNN and TensorRT libraries.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let searched = candidate_lib_dirs();

    let ort_from_env = env::var_os(ENV_ORT_DYLIB_PATH).is_some();
    let ort_dylib = if ort_from_env {
        env::var_os(ENV_ORT_DYLIB_PATH).map(PathBuf::from)
    } else {
        let found = find_ort_dylib(&searched);
        if let Some(path) = found.as_ref() {
            env::set_var(ENV_ORT_DYLIB_PATH, path);
        }
        found
    };

    let preloaded = plan_preload(&searched)
        .into_iter()
        .filter(|path| load_global(path))
        .collect();

    RuntimeLibReport {
        searched,
        ort_dylib,
        ort_from_env,
        preloaded,
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match report.ort_dylib.as_deref() {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = report.ort_from_env,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "ORT_DYLIB_PATH points at a missing file"
        ),
        None => warn!("ONNX Runtime library not found; ort will use the system search path"),
    }
    debug!(searched = ?report.searched, "Runtime library search path");
    if !report.preloaded.is_empty() {
        info!(count = report.preloaded.len(), "Preloaded GPU runtime libraries");
        for path in &report.preloaded {
            debug!(path = %path.display(), "Preloaded");
        }
    }
}
