//! System stats, services and processes.
//!
//! Output parsing is deliberately forgiving: a metric whose output cannot be
//! parsed degrades to its zero value and the rest of the call still succeeds.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{truncate_chars, validate_service_name};
use crate::engine::error::EngineError;
use crate::engine::pool::{ConnectionPool, Connector, PoolKey, PoolScope, RemoteConnection, SshConnector};
use crate::engine::types::{
    CpuStats, DeviceTarget, DiskStats, MemoryStats, ProcessAction, ProcessControlResult,
    ProcessInfo, ServiceAction, ServiceControlResult, ServiceInfo, SystemStats,
};

const CPU_COMMAND: &str = "top -bn1 | grep 'Cpu(s)'";
const MEMORY_COMMAND: &str = "free -m";
const DISK_COMMAND: &str = "df -h /";
const SERVICES_COMMAND: &str =
    "systemctl list-units --type=service --all --no-pager --no-legend | head -200";
const PROCESSES_COMMAND: &str = "ps aux --sort=-%cpu | head -201";

const MAX_PROCESSES: usize = 200;
const MAX_COMMAND_LEN: usize = 100;

pub struct StatsExecutor<C: Connector = SshConnector> {
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> StatsExecutor<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>) -> Self {
        Self { pool }
    }

    async fn connection(
        &self,
        client: &str,
        target: &DeviceTarget,
        scope: PoolScope,
    ) -> Result<Arc<C::Conn>, EngineError> {
        let key = PoolKey::new(client, target.device.as_str(), scope);
        self.pool
            .acquire(&key, &target.address, &target.credentials)
            .await
    }

    /// CPU, memory and disk usage, each degrading independently.
    pub async fn system_stats(
        &self,
        client: &str,
        target: &DeviceTarget,
    ) -> Result<SystemStats, EngineError> {
        let conn = self.connection(client, target, PoolScope::Stats).await?;

        let (cpu, memory, disk) = tokio::join!(
            conn.exec(CPU_COMMAND),
            conn.exec(MEMORY_COMMAND),
            conn.exec(DISK_COMMAND)
        );
        let (cpu, memory, disk) = (cpu?, memory?, disk?);

        Ok(SystemStats {
            cpu: degrade("cpu", &target.device, parse_cpu(&cpu.stdout)),
            memory: degrade("memory", &target.device, parse_memory(&memory.stdout)),
            disk: degrade("disk", &target.device, parse_disk(&disk.stdout)),
        })
    }

    pub async fn list_services(
        &self,
        client: &str,
        target: &DeviceTarget,
    ) -> Result<Vec<ServiceInfo>, EngineError> {
        let conn = self.connection(client, target, PoolScope::Control).await?;
        let output = conn.exec(SERVICES_COMMAND).await?;
        Ok(parse_services(&output.stdout))
    }

    /// Run a systemctl action. The action and name are checked before any
    /// connection is made.
    pub async fn manage_service(
        &self,
        client: &str,
        target: &DeviceTarget,
        service: &str,
        action: &str,
    ) -> Result<ServiceControlResult, EngineError> {
        let action: ServiceAction = action.parse()?;
        validate_service_name(service)?;

        let conn = self.connection(client, target, PoolScope::Control).await?;
        let result = conn
            .exec(&format!("sudo systemctl {} {}", action.as_str(), service))
            .await?;
        let status = conn
            .exec(&format!("systemctl status {} --no-pager | head -5", service))
            .await?;

        debug!(
            "systemctl {} {} on {} exited {}",
            action.as_str(),
            service,
            target.device,
            result.exit_code
        );

        Ok(ServiceControlResult {
            service: service.to_string(),
            action,
            success: result.success(),
            output: join_output(&result.stdout, &result.stderr),
            status: status.stdout,
        })
    }

    pub async fn list_processes(
        &self,
        client: &str,
        target: &DeviceTarget,
    ) -> Result<Vec<ProcessInfo>, EngineError> {
        let conn = self.connection(client, target, PoolScope::Control).await?;
        let output = conn.exec(PROCESSES_COMMAND).await?;
        Ok(parse_processes(&output.stdout))
    }

    /// Signal a process: `kill` sends SIGKILL, `stop` SIGTERM.
    pub async fn manage_process(
        &self,
        client: &str,
        target: &DeviceTarget,
        pid: &str,
        action: &str,
    ) -> Result<ProcessControlResult, EngineError> {
        let action: ProcessAction = action.parse()?;
        let pid: u32 = pid
            .trim()
            .parse()
            .map_err(|_| EngineError::Validation(format!("pid must be numeric, got '{}'", pid)))?;

        let conn = self.connection(client, target, PoolScope::Control).await?;
        let result = conn
            .exec(&format!("sudo kill {} {}", action.signal(), pid))
            .await?;

        Ok(ProcessControlResult {
            pid,
            action,
            success: result.success(),
            output: join_output(&result.stdout, &result.stderr),
        })
    }
}

fn degrade<T: Default>(metric: &str, device: &str, parsed: Result<T, EngineError>) -> T {
    parsed.unwrap_or_else(|e| {
        warn!("{} stats for {} unavailable: {}", metric, device, e);
        T::default()
    })
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{}{}", stdout, stderr),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `%Cpu(s):  2.0 us,  1.0 sy,  0.0 ni, 96.5 id, ...` -> `3.5`
pub(crate) fn parse_cpu(output: &str) -> Result<CpuStats, EngineError> {
    let line = output
        .lines()
        .find(|l| l.contains("Cpu(s)"))
        .ok_or_else(|| EngineError::Parse("no Cpu(s) line in top output".to_string()))?;

    let idle = line
        .split(',')
        .map(str::trim)
        .find_map(|field| {
            let value = field.strip_suffix("id")?.trim().trim_end_matches('%');
            value.rsplit(' ').next()?.parse::<f64>().ok()
        })
        .ok_or_else(|| EngineError::Parse(format!("no idle figure in '{}'", line.trim())))?;

    Ok(CpuStats {
        percent: round2((100.0 - idle).clamp(0.0, 100.0)),
    })
}

/// Second row of `free -m`: `Mem: total used free ...`
pub(crate) fn parse_memory(output: &str) -> Result<MemoryStats, EngineError> {
    let row = output
        .lines()
        .nth(1)
        .ok_or_else(|| EngineError::Parse("free output has no data row".to_string()))?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    let number = |idx: usize| -> Result<u64, EngineError> {
        fields
            .get(idx)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| EngineError::Parse(format!("bad memory row '{}'", row.trim())))
    };

    let (total, used, free) = (number(1)?, number(2)?, number(3)?);
    let percent = if total == 0 {
        0.0
    } else {
        round2(used as f64 * 100.0 / total as f64)
    };

    Ok(MemoryStats {
        total,
        used,
        free,
        percent,
    })
}

/// Second row of `df -h /`: `fs size used avail use% mount`
pub(crate) fn parse_disk(output: &str) -> Result<DiskStats, EngineError> {
    let row = output
        .lines()
        .nth(1)
        .ok_or_else(|| EngineError::Parse("df output has no data row".to_string()))?;
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 5 || !fields[4].ends_with('%') {
        return Err(EngineError::Parse(format!("bad df row '{}'", row.trim())));
    }

    Ok(DiskStats {
        total: fields[1].to_string(),
        used: fields[2].to_string(),
        available: fields[3].to_string(),
        percent: fields[4].to_string(),
    })
}

/// Rows of `systemctl list-units --no-legend`.
pub(crate) fn parse_services(output: &str) -> Vec<ServiceInfo> {
    output
        .lines()
        .filter_map(|line| {
            // Failed units are prefixed with a bullet.
            let mut fields = line
                .split_whitespace()
                .skip_while(|f| *f == "●" || *f == "*");
            let unit = fields.next()?;
            let mut column = || fields.next().unwrap_or("unknown").to_string();
            Some(ServiceInfo {
                name: unit.trim_end_matches(".service").to_string(),
                load: column(),
                active: column(),
                sub: column(),
            })
        })
        .collect()
}

/// Rows of `ps aux`, header skipped.
pub(crate) fn parse_processes(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 11 {
                return None;
            }
            // Skips the header, whose PID column is "PID".
            let pid = fields[1].parse::<u32>().ok()?;
            Some(ProcessInfo {
                pid,
                user: fields[0].to_string(),
                cpu: fields[2].parse().unwrap_or(0.0),
                mem: fields[3].parse().unwrap_or(0.0),
                command: truncate_chars(&fields[10..].join(" "), MAX_COMMAND_LEN),
            })
        })
        .take(MAX_PROCESSES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pool::fakes::FakeConnector;
    use crate::engine::types::Credentials;

    fn target() -> DeviceTarget {
        DeviceTarget {
            device: "dev-1".into(),
            address: "10.0.0.1".into(),
            credentials: Credentials {
                username: "ops".into(),
                password: Some("pw".into()),
                key_path: None,
            },
        }
    }

    const TOP: &str = "%Cpu(s):  2.0 us,  1.0 sy,  0.0 ni, 96.5 id,  0.5 wa,  0.0 hi,  0.0 si,  0.0 st\n";
    const FREE: &str = "              total        used        free      shared  buff/cache   available
Mem:           7821        2345        1234         120        4242        5100
Swap:          2047           0        2047
";
    const DF: &str = "Filesystem      Size  Used Avail Use% Mounted on
/dev/sda1        50G   21G   27G  44% /
";

    mod parsers {
        use super::*;

        #[test]
        fn test_cpu_from_idle() {
            assert_eq!(parse_cpu(TOP).unwrap().percent, 3.5);
        }

        #[test]
        fn test_cpu_old_top_format() {
            let line = "Cpu(s):  5.3%us,  1.2%sy,  0.0%ni, 93.0%id,  0.5%wa\n";
            assert_eq!(parse_cpu(line).unwrap().percent, 7.0);
        }

        #[test]
        fn test_cpu_garbage_is_parse_error() {
            assert!(matches!(parse_cpu("bash: top: not found"), Err(EngineError::Parse(_))));
        }

        #[test]
        fn test_memory_row() {
            let mem = parse_memory(FREE).unwrap();
            assert_eq!(mem.total, 7821);
            assert_eq!(mem.used, 2345);
            assert_eq!(mem.free, 1234);
            assert_eq!(mem.percent, 29.98);
        }

        #[test]
        fn test_disk_row() {
            let disk = parse_disk(DF).unwrap();
            assert_eq!(disk.total, "50G");
            assert_eq!(disk.available, "27G");
            assert_eq!(disk.percent, "44%");
        }

        #[test]
        fn test_services_strip_suffix_and_bullet() {
            let out = "  cron.service  loaded active running Regular background program\n\
                       ● nginx.service loaded failed failed A high performance web server\n\
                       odd.service\n";
            let services = parse_services(out);
            assert_eq!(services.len(), 3);
            assert_eq!(services[0].name, "cron");
            assert_eq!(services[0].sub, "running");
            assert_eq!(services[1].name, "nginx");
            assert_eq!(services[1].active, "failed");
            assert_eq!(services[2].load, "unknown");
        }

        #[test]
        fn test_processes_skip_header_and_truncate() {
            let long = "x".repeat(150);
            let out = format!(
                "USER PID %CPU %MEM VSZ RSS TTY STAT START TIME COMMAND\n\
                 root 1 0.5 0.1 1000 200 ? Ss 10:00 0:01 /sbin/init splash\n\
                 www 812 abc 2.5 1000 200 ? S 10:00 0:01 {}\n",
                long
            );
            let procs = parse_processes(&out);
            assert_eq!(procs.len(), 2);
            assert_eq!(procs[0].pid, 1);
            assert_eq!(procs[0].command, "/sbin/init splash");
            assert_eq!(procs[1].cpu, 0.0);
            assert_eq!(procs[1].mem, 2.5);
            assert_eq!(procs[1].command.chars().count(), 100);
        }
    }

    mod executor {
        use super::*;

        #[tokio::test]
        async fn test_stats_degrade_per_metric() {
            let connector = FakeConnector::default()
                .respond("top -bn1", TOP)
                .respond("free -m", "free: command not found");
            let executor = StatsExecutor::new(Arc::new(ConnectionPool::new(connector)));

            let stats = executor.system_stats("c1", &target()).await.unwrap();

            assert_eq!(stats.cpu.percent, 3.5);
            assert_eq!(stats.memory, MemoryStats::default());
            assert_eq!(stats.disk, DiskStats::default());
        }

        #[tokio::test]
        async fn test_unreachable_device_is_connect_error() {
            let connector = FakeConnector::failing(EngineError::Connect("No route to host".into()));
            let executor = StatsExecutor::new(Arc::new(ConnectionPool::new(connector)));

            let err = executor.system_stats("c1", &target()).await.unwrap_err();
            assert!(matches!(err, EngineError::Connect(_)));
        }

        #[tokio::test]
        async fn test_reboot_rejected_before_connecting() {
            let pool = Arc::new(ConnectionPool::new(FakeConnector::default()));
            let executor = StatsExecutor::new(pool.clone());

            let err = executor
                .manage_service("c1", &target(), "nginx", "reboot")
                .await
                .unwrap_err();

            assert!(matches!(err, EngineError::Validation(_)));
            assert!(pool.is_empty());
        }

        #[tokio::test]
        async fn test_manage_service_runs_action_then_status() {
            let connector = FakeConnector::default()
                .respond("systemctl status", "● nginx.service - nginx\n   Active: active (running)\n");
            let log = connector.log.clone();
            let executor = StatsExecutor::new(Arc::new(ConnectionPool::new(connector)));

            let result = executor
                .manage_service("c1", &target(), "nginx", "restart")
                .await
                .unwrap();

            assert!(result.success);
            assert!(result.status.contains("active (running)"));
            let commands = log.lock().unwrap().clone();
            assert_eq!(
                commands,
                vec![
                    "sudo systemctl restart nginx".to_string(),
                    "systemctl status nginx --no-pager | head -5".to_string(),
                ]
            );
        }

        #[tokio::test]
        async fn test_injected_service_name_rejected() {
            let pool = Arc::new(ConnectionPool::new(FakeConnector::default()));
            let executor = StatsExecutor::new(pool.clone());

            let err = executor
                .manage_service("c1", &target(), "nginx;reboot", "stop")
                .await
                .unwrap_err();

            assert!(matches!(err, EngineError::Validation(_)));
            assert!(pool.is_empty());
        }

        #[tokio::test]
        async fn test_manage_process_signals() {
            let connector = FakeConnector::default();
            let log = connector.log.clone();
            let executor = StatsExecutor::new(Arc::new(ConnectionPool::new(connector)));

            let result = executor
                .manage_process("c1", &target(), "4242", "stop")
                .await
                .unwrap();
            assert_eq!(result.pid, 4242);
            assert_eq!(log.lock().unwrap().as_slice(), ["sudo kill -SIGTERM 4242"]);

            let err = executor
                .manage_process("c1", &target(), "42; reboot", "kill")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }
    }
}
