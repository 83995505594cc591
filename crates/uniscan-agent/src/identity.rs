//! Stable machine identity.

use std::path::Path;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// First non-empty id among `paths`, else the host name, else a random id.
pub fn machine_id_from(paths: &[&Path]) -> String {
    paths
        .iter()
        .find_map(|p| read_trimmed(p))
        .or_else(host_name)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

pub fn machine_id() -> String {
    let paths: Vec<&Path> = MACHINE_ID_PATHS.iter().map(Path::new).collect();
    machine_id_from(&paths)
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| read_trimmed(Path::new("/etc/hostname")))
}

/// Default device name shown to scanners.
pub fn device_name() -> String {
    host_name().unwrap_or_else(|| "pc".to_string())
}
