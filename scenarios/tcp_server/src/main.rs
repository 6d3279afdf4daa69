use flame_tunnel_runner::prelude::*;

/// Drives the server through `client.py`, which must be importable from the working directory.
///
/// Modes: `persistent <seconds>`, `compute <requests>` and `load <clients> <seconds>`.
const LOAD_DRIVER: &str = r#"
import json, sys, time
from client import TCPClient

client = TCPClient()
mode = sys.argv[1]
if mode == "persistent":
    client.persistent_connection_test(int(sys.argv[2]))
elif mode == "compute":
    for i in range(int(sys.argv[2])):
        client.connect_and_send(json.dumps({"type": "compute", "number": 25 + i % 10}))
        time.sleep(0.2)
elif mode == "load":
    client.load_test(num_clients=int(sys.argv[2]), duration=int(sys.argv[3]))
else:
    sys.exit(f"unknown load mode {mode}")
"#;

fn main() -> FlameTunnelResult<()> {
    let builder = ProfilingDefinitionBuilder::new(env!("CARGO_PKG_NAME"), init())
        // `-X perf` lets perf resolve Python frames, needs Python 3.12 or later.
        .with_server(CommandSpec::new("python3", &["-X", "perf", "server.py"]))
        .with_load_generator(CommandSpec::new("python3", &["-c", LOAD_DRIVER]))
        .with_profiler(CommandSpec::new(
            "perf",
            &[
                "record", "-F", "99", "-g", "-p", "{pid}", "-o", "{output}", "--", "sleep",
                "{duration}",
            ],
        ))
        .with_folder(CommandSpec::new(
            "sh",
            &["-c", r#"perf script -i "$1" | stackcollapse-perf.pl"#, "fold", "{input}"],
        ))
        .with_renderer(CommandSpec::new(
            "flamegraph.pl",
            &["--title", "{title}", "{input}"],
        ))
        // The load always outlasts the profiling window, so the profiler never sees an idle server.
        .add_scenario(
            Scenario::new("warm_up", 5)
                .with_load_args(&["persistent", "7"])
                .with_pre_load_delay_s(1),
        )
        .add_scenario(
            Scenario::new("cpu_intensive", 15)
                .with_load_args(&["compute", "90"])
                .with_pre_load_delay_s(1),
        )
        .add_scenario(
            Scenario::new("mixed", 25)
                .with_load_args(&["load", "3", "28"])
                .with_pre_load_delay_s(1),
        )
        .add_filter("network", "socket|recv|send|accept")
        .add_filter("computation", "fibonacci|compute|hash");

    match run(builder) {
        Ok(_) => Ok(()),
        Err(e) if e.is::<RunDeclinedError>() => {
            log::info!("Nothing was started");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
