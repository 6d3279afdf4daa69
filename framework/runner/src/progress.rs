use std::cmp::min;
use std::fmt::Write;
use std::time::{Duration, Instant};

use flame_tunnel_core::prelude::{ShutdownHandle, ShutdownListener};
use indicatif::{ProgressBar, ProgressState, ProgressStyle};

/// Shows how much of a profiling window is left. The bar is cleared when this is dropped.
pub(crate) struct ProfilerProgress {
    stop: ShutdownHandle,
}

impl Drop for ProfilerProgress {
    fn drop(&mut self) {
        self.stop.shutdown();
    }
}

pub(crate) fn start_progress(scenario: &str, planned_runtime: Duration) -> ProfilerProgress {
    let stop = ShutdownHandle::new();
    let listener = stop.new_listener();
    let scenario = scenario.to_string();

    if let Err(e) = std::thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || show_progress(scenario, planned_runtime, listener))
    {
        log::warn!("Failed to start progress thread: {e}");
    }

    ProfilerProgress { stop }
}

fn show_progress(scenario: String, planned_runtime: Duration, listener: ShutdownListener) {
    let start_time = Instant::now();
    let pb = ProgressBar::new(planned_runtime.as_secs());
    let template = "{prefix:.bold} {spinner:.green} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]";
    match ProgressStyle::with_template(template) {
        Ok(style) => pb.set_style(
            style
                .with_key("planned_runtime", {
                    let hours = planned_runtime.as_secs() / 3600;
                    let minutes = (planned_runtime.as_secs() % 3600) / 60;
                    let seconds = planned_runtime.as_secs() % 60;
                    move |_state: &ProgressState, w: &mut dyn Write| {
                        let _ = write!(w, "{:02}:{:02}:{:02}", hours, minutes, seconds);
                    }
                })
                .progress_chars("#>-"),
        ),
        Err(e) => log::debug!("Invalid progress template: {e}"),
    }
    pb.set_prefix(scenario);

    loop {
        if listener.should_shutdown() {
            log::trace!("Progress thread shutting down");
            pb.finish_and_clear();
            break;
        }

        let new = min(start_time.elapsed().as_secs(), planned_runtime.as_secs());
        pb.set_position(new);
        std::thread::sleep(Duration::from_millis(250));
    }
}
