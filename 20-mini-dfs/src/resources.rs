//! Host resource sampling for storage nodes.

use std::path::Path;

use sysinfo::{Disks, System};

use crate::identity::NodeResourceStats;

/// Source of the figures a storage node reports on `sysinfo`.
pub trait ResourceProbe: Send + Sync {
    /// Samples the host. `disk_root` selects the disk whose free space is
    /// reported.
    fn sample(&self, disk_root: &Path) -> NodeResourceStats;
}

/// Reads live figures from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn sample(&self, disk_root: &Path) -> NodeResourceStats {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let runtime_memory = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                sys.refresh_process(pid);
                sys.process(pid).map(|process| process.memory())
            })
            .unwrap_or_default();

        NodeResourceStats {
            cores: sys.cpus().len(),
            free_memory: sys.available_memory(),
            max_memory: sys.total_memory(),
            runtime_memory,
            free_disk: free_disk_under(disk_root),
        }
    }
}

/// Free space on the disk with the longest mount point containing `root`.
fn free_disk_under(root: &Path) -> u64 {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .unwrap_or_default()
}

/// Reports fixed figures.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticProbe(pub NodeResourceStats);

impl ResourceProbe for StaticProbe {
    fn sample(&self, _disk_root: &Path) -> NodeResourceStats {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_sees_at_least_one_core() {
        let stats = SystemProbe.sample(Path::new("."));
        assert!(stats.cores >= 1);
        assert!(stats.max_memory >= stats.free_memory);
    }

    #[test]
    fn static_probe_echoes_its_stats() {
        let stats = NodeResourceStats {
            cores: 3,
            free_disk: 42,
            ..Default::default()
        };
        assert_eq!(StaticProbe(stats).sample(Path::new("/nowhere")), stats);
    }
}
