//! flovsim: power-gated mesh router simulator

use std::env;
use std::path::PathBuf;

use flovsim::config::Config;
use flovsim::network::Network;
use flovsim::router::power::PowerState;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut watch = false;

    for arg in &args[1..] {
        if arg == "--watch" || arg == "-w" {
            watch = true;
        } else if arg == "--help" || arg == "-h" {
            print_usage(&args[0]);
            return Ok(());
        } else if !arg.starts_with('-') {
            config_path = Some(PathBuf::from(arg));
        } else {
            anyhow::bail!("unknown option {arg} (try --help)");
        }
    }

    let config = Config::load(config_path.as_deref())?;
    println!(
        "flovsim: {0}x{0} mesh, {1} VCs, rate {2}, {3} cycles",
        config.topology.k,
        config.router.vcs,
        config.traffic.injection_rate,
        config.sim.cycles
    );

    let mut net = Network::from_config(&config);
    net.set_watch(watch);

    for _ in 0..config.sim.cycles {
        net.random_traffic_cycle(config.traffic.injection_rate, config.traffic.packet_length);
        net.cycle();
    }
    for _ in 0..config.sim.drain_cycles {
        if net.flits_in_flight() == 0 {
            break;
        }
        net.cycle();
    }
    net.assert_invariants();

    print_report(&net);
    Ok(())
}

fn print_usage(prog: &str) {
    println!("usage: {prog} [config.toml] [--watch]");
    println!();
    println!("  config.toml   simulation parameters (defaults to ./flovsim.toml)");
    println!("  --watch, -w   trace every flit through the pipeline logs");
    println!();
    println!("environment: FLOVSIM_K, FLOVSIM_CYCLES, FLOVSIM_SEED,");
    println!("             FLOVSIM_INJECTION_RATE override the config file");
}

fn print_report(net: &Network) {
    let cycles = net.now();
    println!();
    println!("simulated {cycles} cycles");
    println!(
        "flits: {} injected, {} delivered, {} in flight",
        net.injected_flits(),
        net.delivered_flits(),
        net.flits_in_flight()
    );

    let packets = net.delivered_log.len();
    if packets > 0 {
        let flov: u64 = net.delivered_log.iter().map(|d| d.flov_hops as u64).sum();
        let hops: u64 = net.delivered_log.iter().map(|d| d.hops as u64).sum();
        println!(
            "packets: {packets} delivered, {:.2} avg hops, {:.2} avg fly-over hops",
            hops as f64 / packets as f64,
            flov as f64 / packets as f64
        );
    }

    println!();
    println!("per-router power gating:");
    for router in net.routers() {
        let stats = router.stats();
        if stats.drain_counter == 0 && stats.total_power_off_cycles == 0 {
            continue;
        }
        println!(
            "  router {:>3} [{}]: off {:>6} cycles ({:>5.1}%), {} drains, {} timeouts, {} wakeups, drain time min/max {}/{}",
            router.id(),
            router.power_state(),
            stats.total_power_off_cycles,
            100.0 * stats.total_power_off_cycles as f64 / cycles.max(1) as f64,
            stats.drain_counter,
            stats.drain_timeout_counter,
            stats.off_counter,
            stats.drain_time_min.map_or("-".to_string(), |m| m.to_string()),
            stats.drain_time_max
        );
    }

    let gated = net
        .routers()
        .iter()
        .filter(|r| r.power_state() == PowerState::PowerOff)
        .count();
    let off_total: u64 = net.routers().iter().map(|r| r.stats().total_power_off_cycles).sum();
    let possible = cycles * net.routers().len() as u64;
    println!();
    println!(
        "network: {gated} routers gated at end, {:.1}% of router-cycles dark",
        100.0 * off_total as f64 / possible.max(1) as f64
    );
}
