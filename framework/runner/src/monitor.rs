use flame_tunnel_core::prelude::ShutdownListener;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Below this the target is reported as idle, which usually means the load isn't reaching it.
const IDLE_TARGET_CPU: f32 = 1.0;

/// Monitor the resource usage of the flame tunnel process and the profiled server.
///
/// Note that this won't stop the run proceeding, it will just log a warning to let the user know
/// that the profile might be skewed by the controller competing with the server for CPU.
///
/// The CPU usage is collected every [sysinfo::MINIMUM_CPU_UPDATE_INTERVAL] and checked.
/// If the controller is above 10% with respect to the number of cores then a warning is logged.
pub(crate) fn start_monitor(target_pid: u32, shutdown_listener: ShutdownListener) {
    let spawned = std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            let this_process_pid = Pid::from_u32(std::process::id());
            let target_pid = Pid::from_u32(target_pid);
            let mut sys = System::new();

            sys.refresh_cpu_all();
            let cpu_count = sys.cpus().len().max(1);

            loop {
                if shutdown_listener.should_shutdown() {
                    break;
                }

                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[this_process_pid, target_pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu(),
                );

                if let Some(process) = sys.process(this_process_pid) {
                    let usage = (process.cpu_usage() / (cpu_count * 100) as f32) * 100.0;
                    if usage > 10.0 {
                        log::warn!("High CPU usage detected. Flame tunnel is using {:.2}% of the CPU, with {} available cores", usage, cpu_count);
                    }
                }

                match sys.process(target_pid) {
                    Some(target) if target.cpu_usage() < IDLE_TARGET_CPU => {
                        log::debug!("Target process {target_pid} is idle");
                    }
                    Some(_) => {}
                    None => log::debug!("Target process {target_pid} is no longer running"),
                }

                std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            }
        });

    if let Err(e) = spawned {
        log::warn!("Failed to start monitor thread: {e}");
    }
}
