// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn loadavg_takes_first_three_fields() -> anyhow::Result<()> {
    let load = parse_loadavg("0.52 1.04 2.08 2/1067 12345\n")?;
    assert_eq!(load.load1, 0.52);
    assert_eq!(load.load5, 1.04);
    assert_eq!(load.load15, 2.08);
    Ok(())
}

#[test]
fn loadavg_rejects_garbage() {
    assert!(parse_loadavg("not numbers here").is_err());
    assert!(parse_loadavg("").is_err());
}

#[test]
fn meminfo_prefers_mem_available() -> anyhow::Result<()> {
    let contents = "MemTotal:       16384000 kB\n\
                    MemFree:         1000000 kB\n\
                    MemAvailable:    8192000 kB\n\
                    Buffers:          200000 kB\n\
                    Cached:          3000000 kB\n";
    let mem = parse_meminfo(contents)?;
    assert_eq!(mem.total, 16_384_000 * 1024);
    assert_eq!(mem.available, 8_192_000 * 1024);
    assert_eq!(mem.used, (16_384_000 - 8_192_000) * 1024);
    assert_eq!(mem.used_percent, 50.0);
    Ok(())
}

#[test]
fn meminfo_approximates_missing_mem_available() -> anyhow::Result<()> {
    let contents = "MemTotal:       1000 kB\n\
                    MemFree:         100 kB\n\
                    Buffers:          50 kB\n\
                    Cached:          250 kB\n";
    let mem = parse_meminfo(contents)?;
    assert_eq!(mem.available, 400 * 1024);
    assert_eq!(mem.used, 600 * 1024);
    assert_eq!(mem.used_percent, 60.0);
    Ok(())
}

#[test]
fn net_dev_skips_loopback() -> anyhow::Result<()> {
    let contents = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1111111    9999    0    0    0     0          0         0  1111111    9999    0    0    0     0       0          0
  eth0: 5000000   40000    0    0    0     0          0         0  2500000   30000    0    0    0     0       0          0
";
    let net = parse_net_dev(contents).ok_or_else(|| anyhow::anyhow!("no interface parsed"))?;
    assert_eq!(net.interface, "eth0");
    assert_eq!(net.rx_bytes, 5_000_000);
    assert_eq!(net.tx_bytes, 2_500_000);
    Ok(())
}

#[test]
fn uptime_formatting() -> anyhow::Result<()> {
    assert_eq!(parse_uptime("90061.57 180000.00")?.formatted, "1d 1h 1m");
    assert_eq!(format_uptime(3 * 3600 + 20 * 60), "3h 20m");
    assert_eq!(format_uptime(59), "0m");
    assert_eq!(format_uptime(125), "2m");
    Ok(())
}

#[test]
fn docker_ps_line_normalizes_name_and_state() -> anyhow::Result<()> {
    let line = r#"{"ID":"abc123","Names":"/devcontainer-app","Image":"ubuntu:24.04","Status":"Up 2 hours","State":"Running","CreatedAt":"2026-07-30 10:00:00 +0000 UTC"}"#;
    let info = parse_docker_ps_line(line).ok_or_else(|| anyhow::anyhow!("line did not parse"))?;
    assert_eq!(info.name, "devcontainer-app");
    assert_eq!(info.state, "running");
    assert_eq!(info.cpu_percent, 0.0);
    Ok(())
}

#[test]
fn docker_ps_line_rejects_non_json() {
    assert!(parse_docker_ps_line("CONTAINER ID  IMAGE").is_none());
}

#[test]
fn docker_stats_strips_percent_signs() -> anyhow::Result<()> {
    let line = r#"{"ID":"abc123","CPUPerc":"12.34%","MemPerc":"5.6%","MemUsage":"1.2GiB / 16GiB"}"#;
    let stats =
        parse_docker_stats_line(line).ok_or_else(|| anyhow::anyhow!("stats line did not parse"))?;
    assert_eq!(stats.cpu_percent, 12.34);
    assert_eq!(stats.mem_percent, 5.6);
    assert_eq!(stats.mem_usage, "1.2GiB / 16GiB");
    Ok(())
}

#[test]
fn stats_merge_by_id_leaves_stopped_containers_zeroed() {
    let mut containers = vec![
        ContainerInfo { id: "abc123def456".to_owned(), state: "running".to_owned(), ..ContainerInfo::default() },
        ContainerInfo { id: "stopped0".to_owned(), state: "exited".to_owned(), ..ContainerInfo::default() },
    ];
    let mut stats = HashMap::new();
    stats.insert(
        "abc123".to_owned(),
        DockerStats { id: "abc123".to_owned(), cpu_percent: 50.0, mem_percent: 25.0, mem_usage: "1GiB".to_owned() },
    );
    merge_stats(&mut containers, &stats);
    assert_eq!(containers[0].cpu_percent, 50.0);
    assert_eq!(containers[1].cpu_percent, 0.0);
}

#[tokio::test]
async fn quick_collection_works_on_linux() -> anyhow::Result<()> {
    let sysinfo = Sysinfo::new(SysinfoConfig::default());
    let info = sysinfo.collect_quick()?;
    assert!(info.memory.total > 0);
    assert!(info.disk.total > 0);

    let metrics = sysinfo.quick_metrics();
    assert!(metrics.is_some());
    Ok(())
}

#[tokio::test]
async fn run_command_times_out() {
    let result = run_command("sleep", &["5"], Duration::from_millis(50)).await;
    assert!(result.is_err());
}
