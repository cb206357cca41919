//! Helpers for tests that drive real processes without a C++ toolchain.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Stand-in for a C++ compiler. The "source" is a shell script body; the
/// produced "executable" is that body prefixed with `OPT` holding the flags
/// it was built with. Markers in the source simulate compiler behaviour.
const FAKE_COMPILER: &str = r#"out=""
src=""
flags=""
while [ $# -gt 0 ]; do
    case "$1" in
        --version) echo "fakecc 1.0.0"; exit 0 ;;
        -o) out="$2"; shift 2; continue ;;
        -*) flags="$flags $1" ;;
        *) src="$1" ;;
    esac
    shift
done
if grep -q FAKE_COMPILE_ERROR "$src"; then
    echo "$src:3:5: error: expected ';' before 'return'" >&2
    exit 1
fi
if grep -q FAKE_COMPILE_HANG "$src"; then
    sleep 30
fi
if grep -q FAKE_NO_OUTPUT "$src"; then
    exit 0
fi
{ echo '#!/bin/sh'; echo "OPT='$flags'"; cat "$src"; } > "$out.tmp"
chmod +x "$out.tmp"
mv "$out.tmp" "$out"
"#;

/// Writes an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fake_compiler(dir: &Path) -> PathBuf {
    write_script(dir, "fakecc", FAKE_COMPILER)
}

/// Writes a fixture "source" for the fake compiler.
pub fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// True once `pid` has exited (gone or a zombie awaiting its reaper).
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X'),
    }
}

pub fn gnucpp_path() -> String {
    std::env::var("GNUCPP_PATH").unwrap_or_else(|_| "g++".to_string())
}
