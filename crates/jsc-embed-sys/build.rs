use std::env;
#[cfg(feature = "bun-webkit")]
use std::fs;
#[cfg(feature = "bun-webkit")]
use std::path::{Path, PathBuf};

// bun-webkit version from oven-sh/WebKit releases
#[cfg(feature = "bun-webkit")]
const BUN_WEBKIT_VERSION: &str = "aaf3f80b1cc701b412f8abfb7c7f413644a229ff";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let system = env::var_os("CARGO_FEATURE_SYSTEM").is_some();
    let bun_webkit = env::var_os("CARGO_FEATURE_BUN_WEBKIT").is_some();

    // Without a linking feature the declarations stay unresolved and nothing
    // in the dependency graph may call them.
    if !system && !bun_webkit {
        return;
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap();

    if target_os == "macos" {
        configure_macos();
        return;
    }

    #[cfg(feature = "bun-webkit")]
    {
        let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
        configure_bun_webkit(&target_os, &target_arch);
    }

    #[cfg(all(feature = "system", not(feature = "bun-webkit")))]
    match target_os.as_str() {
        "linux" => configure_linux_system(),
        _ => panic!("No system JavaScriptCore for {}", target_os),
    }
}

fn configure_macos() {
    println!("cargo:rustc-link-lib=framework=JavaScriptCore");

    if let Ok(sdk_path) = std::process::Command::new("xcrun")
        .args(["--show-sdk-path"])
        .output()
    {
        let sdk_path = String::from_utf8_lossy(&sdk_path.stdout);
        println!(
            "cargo:rustc-link-search=framework={}/System/Library/Frameworks",
            sdk_path.trim()
        );
    }
}

#[cfg(all(feature = "system", not(feature = "bun-webkit")))]
fn configure_linux_system() {
    println!("cargo:rerun-if-env-changed=PKG_CONFIG_PATH");

    let lib = ["javascriptcoregtk-4.1", "javascriptcoregtk-4.0"]
        .iter()
        .find_map(|name| pkg_config::Config::new().atleast_version("2.30").probe(name).ok())
        .unwrap_or_else(|| {
            panic!(
                "JavaScriptCore not found. Install with:\n\
                 Ubuntu/Debian: sudo apt-get install libjavascriptcoregtk-4.1-dev\n\
                 Fedora: sudo dnf install webkit2gtk4.1-devel"
            )
        });

    for path in lib.include_paths {
        println!("cargo:include={}", path.display());
    }
}

#[cfg(feature = "bun-webkit")]
fn configure_bun_webkit(os: &str, target_arch: &str) {
    println!("cargo:rerun-if-env-changed=BUN_WEBKIT_VERSION");

    let arch = match target_arch {
        "x86_64" => "amd64",
        "aarch64" if os == "linux" => "arm64",
        _ => panic!("Unsupported architecture for bun-webkit: {}", target_arch),
    };

    let webkit_path = download_bun_webkit(os, arch);
    let lib_dir = find_lib_dir(&webkit_path);

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=JavaScriptCore");
    println!("cargo:rustc-link-lib=static=WTF");

    if lib_exists(&lib_dir, "bmalloc") {
        println!("cargo:rustc-link-lib=static=bmalloc");
    }

    if lib_exists(&lib_dir, "icudata") {
        println!("cargo:rustc-link-lib=static=icudata");
        println!("cargo:rustc-link-lib=static=icui18n");
        println!("cargo:rustc-link-lib=static=icuuc");
    } else if lib_exists(&lib_dir, "sicudt") {
        println!("cargo:rustc-link-lib=static=sicudt");
        println!("cargo:rustc-link-lib=static=sicuin");
        println!("cargo:rustc-link-lib=static=sicuuc");
    } else {
        println!("cargo:warning=ICU libraries not found in {}", lib_dir.display());
    }

    match os {
        "linux" => {
            for lib in ["stdc++", "atomic", "dl", "pthread", "m"] {
                println!("cargo:rustc-link-lib={}", lib);
            }
        }
        "windows" => {
            for lib in [
                "winmm", "bcrypt", "ntdll", "userenv", "dbghelp", "crypt32", "ws2_32",
                "advapi32", "ole32", "oleaut32", "uuid", "shell32",
            ] {
                println!("cargo:rustc-link-lib={}", lib);
            }
            println!("cargo:rustc-link-arg=/NODEFAULTLIB:libcmt");
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => panic!("Unsupported OS for bun-webkit: {}", os),
    }
}

#[cfg(feature = "bun-webkit")]
fn download_bun_webkit(os: &str, arch: &str) -> PathBuf {
    let version = env::var("BUN_WEBKIT_VERSION").unwrap_or_else(|_| BUN_WEBKIT_VERSION.to_string());
    let webkit_dir = cache_dir().join(&version).join(format!("{}-{}", os, arch));

    let marker = webkit_dir.join(".downloaded");
    if marker.exists() {
        return webkit_dir;
    }

    let url = format!(
        "https://github.com/oven-sh/WebKit/releases/download/autobuild-{}/bun-webkit-{}-{}.tar.gz",
        version, os, arch
    );
    println!("cargo:warning=Downloading bun-webkit from {}", url);

    fs::create_dir_all(&webkit_dir).expect("Failed to create cache directory");

    let response = ureq::get(&url)
        .call()
        .unwrap_or_else(|e| panic!("Failed to download bun-webkit: {}. URL: {}", e, url));

    // Stream straight into the decoder; the archive is several hundred MB.
    let reader = response.into_body().into_reader();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
    archive
        .unpack(&webkit_dir)
        .expect("Failed to extract bun-webkit archive");

    fs::write(&marker, "").expect("Failed to create marker file");
    webkit_dir
}

#[cfg(feature = "bun-webkit")]
fn find_lib_dir(webkit_path: &Path) -> PathBuf {
    let direct = webkit_path.join("lib");
    if direct.exists() {
        return direct;
    }

    fs::read_dir(webkit_path)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path().join("lib"))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| webkit_path.to_path_buf())
}

#[cfg(feature = "bun-webkit")]
fn lib_exists(lib_dir: &Path, lib_name: &str) -> bool {
    let prefixed = format!("lib{}", lib_name);
    fs::read_dir(lib_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .any(|name| {
            (name.starts_with(lib_name) || name.starts_with(&prefixed))
                && (name.ends_with(".lib") || name.ends_with(".a"))
        })
}

#[cfg(feature = "bun-webkit")]
fn cache_dir() -> PathBuf {
    if let Ok(cargo_home) = env::var("CARGO_HOME") {
        return PathBuf::from(cargo_home).join("cache").join("bun-webkit");
    }

    if let Some(home) = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".cargo").join("cache").join("bun-webkit");
    }

    PathBuf::from(env::var("OUT_DIR").unwrap()).join("bun-webkit-cache")
}
